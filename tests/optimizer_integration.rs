//! Exercises `Optimizer::run` end-to-end over an in-process bus.

use std::time::Duration;

use meshplane::bus::Topics;
use meshplane::config::OptimizerConfig;
use meshplane::optimizer::Optimizer;
use meshplane::types::Forecast;
use tokio::sync::broadcast;

fn forecast(node: &str, channel: u32, ts: i64, busy: f64, confidence: f64) -> Forecast {
    Forecast {
        node_id: node.into(),
        channel,
        timestamp: ts,
        forecast_busy_percent: busy,
        confidence,
        synthetic: false,
        sample_count: 10,
        avg_num_clients: Some(1.0),
        window_seconds: 60,
    }
}

#[tokio::test]
async fn forecasts_on_bus_produce_a_chconfig_after_confirmations() {
    let topics = Topics::new(64);
    let mut cfg = OptimizerConfig::default();
    cfg.min_confirmations = 1;
    let optimizer = Optimizer::new(cfg);
    let (shutdown_tx, _) = broadcast::channel(1);

    let mut chconfig_rx = topics.chconfigs.subscribe();
    let handle = tokio::spawn(optimizer.run(topics.clone(), shutdown_tx.subscribe()));

    topics.forecasts.publish(forecast("A", 6, 0, 10.0, 0.9));

    let cc = tokio::time::timeout(Duration::from_millis(500), chconfig_rx.recv())
        .await
        .expect("chconfig published before timeout")
        .expect("channel open");

    assert_eq!(cc.node_id, "A");
    assert_eq!(cc.channel, 6);

    let _ = shutdown_tx.send(());
    handle.await.unwrap();
}

#[tokio::test]
async fn shutdown_signal_stops_the_forecast_loop() {
    let topics = Topics::new(8);
    let optimizer = Optimizer::new(OptimizerConfig::default());
    let (shutdown_tx, _) = broadcast::channel(1);

    let handle = tokio::spawn(optimizer.run(topics, shutdown_tx.subscribe()));
    let _ = shutdown_tx.send(());

    tokio::time::timeout(Duration::from_millis(500), handle)
        .await
        .expect("run() exits promptly after shutdown")
        .unwrap();
}
