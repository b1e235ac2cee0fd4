//! Exercises `Aggregator::run` end-to-end over an in-process bus, in the
//! style of `self_tune`'s `#[tokio::test]` bus tests.

use std::time::Duration;

use meshplane::aggregator::Aggregator;
use meshplane::bus::Topics;
use meshplane::config::AggregatorConfig;
use meshplane::types::{SampleSource, Telemetry};
use tokio::sync::broadcast;

fn telemetry(node: &str, channel: u32, ts: i64, busy: f64) -> Telemetry {
    Telemetry {
        node_id: node.into(),
        timestamp: ts,
        radio_id: "r0".into(),
        channel,
        rssi: -55.0,
        snr: 22.0,
        tx_bytes: 10,
        rx_bytes: 10,
        tx_retries: 0,
        num_clients: 2,
        channel_busy_percent: busy,
        interference_scan: None,
        sample_source: SampleSource::Measured,
    }
}

#[tokio::test]
async fn telemetry_published_on_bus_yields_feature_after_tick() {
    let topics = Topics::new(64);
    let mut cfg = AggregatorConfig::default();
    cfg.schedule_ms = 20;
    let aggregator = Aggregator::new(cfg);
    let (shutdown_tx, _) = broadcast::channel(1);

    let mut features_rx = topics.features.subscribe();
    let handle = tokio::spawn(aggregator.run(topics.clone(), shutdown_tx.subscribe()));

    topics.telemetry.publish(telemetry("n1", 6, 0, 25.0));

    let feature = tokio::time::timeout(Duration::from_millis(500), features_rx.recv())
        .await
        .expect("feature published before timeout")
        .expect("channel open");

    assert_eq!(feature.node_id, "n1");
    assert_eq!(feature.channel, 6);
    assert_eq!(feature.avg_busy, 25.0);

    let _ = shutdown_tx.send(());
    handle.await.unwrap();
}

#[tokio::test]
async fn shutdown_signal_stops_the_tick_loop() {
    let topics = Topics::new(8);
    let mut cfg = AggregatorConfig::default();
    cfg.schedule_ms = 10;
    let aggregator = Aggregator::new(cfg);
    let (shutdown_tx, _) = broadcast::channel(1);

    let handle = tokio::spawn(aggregator.run(topics, shutdown_tx.subscribe()));
    let _ = shutdown_tx.send(());

    tokio::time::timeout(Duration::from_millis(500), handle)
        .await
        .expect("run() exits promptly after shutdown")
        .unwrap();
}
