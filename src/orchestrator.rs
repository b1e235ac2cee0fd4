//! Process wiring: constructs the bus and the three pipeline stages, spawns
//! their `run()` loops, and coordinates graceful shutdown.
//!
//! Grounded on `self_tune::orchestrator::SelfImprovementOrchestrator`'s
//! `new`/`run`/status-handle shape. Shutdown here uses a `broadcast::channel`
//! rather than a `watch` so every stage shares the exact same
//! `tokio::select! { _ = shutdown.recv() => ..., recv = rx.recv() => ... }`
//! loop shape already used by `Aggregator::run`/`Optimizer::run`/
//! `Controller::run` — a single receiver kind for "stop" and "data".

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::aggregator::Aggregator;
use crate::bus::Topics;
use crate::config::MeshConfig;
use crate::controller::Controller;
use crate::dashboard::DashboardBridge;
use crate::optimizer::Optimizer;

/// Join handles and shared resources for a running pipeline, returned by
/// [`Orchestrator::spawn`]. Dropping this does not stop the pipeline; call
/// [`Handles::shutdown`] for a graceful stop.
pub struct Handles {
    pub topics: Topics,
    shutdown_tx: broadcast::Sender<()>,
    aggregator: JoinHandle<()>,
    optimizer: JoinHandle<()>,
    controller: JoinHandle<()>,
    dashboard: Option<JoinHandle<()>>,
}

impl Handles {
    /// Signal every stage to stop at its next loop iteration and wait for
    /// them to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.aggregator.await;
        let _ = self.optimizer.await;
        let _ = self.controller.await;
        if let Some(dashboard) = self.dashboard {
            let _ = dashboard.await;
        }
    }
}

pub struct Orchestrator {
    config: MeshConfig,
}

impl Orchestrator {
    pub fn new(config: MeshConfig) -> Self {
        Orchestrator { config }
    }

    /// Build the bus, construct each stage from `self.config`, and spawn
    /// their `run()` loops as separate tasks. `dashboard_addr` enables the
    /// WebSocket fan-out bridge when set.
    pub fn spawn(self, dashboard_addr: Option<std::net::SocketAddr>) -> Handles {
        let topics = Topics::new(self.config.bus.topic_capacity);
        let (shutdown_tx, _) = broadcast::channel(1);

        let aggregator = Aggregator::new(self.config.processor.clone());
        let optimizer = Optimizer::new(self.config.optimizer.clone());
        let controller = Controller::new(self.config.controller);

        info!(target: "meshplane::orchestrator", "spawning pipeline stages");

        let aggregator_handle = tokio::spawn(aggregator.run(topics.clone(), shutdown_tx.subscribe()));
        let optimizer_handle = tokio::spawn(optimizer.run(topics.clone(), shutdown_tx.subscribe()));
        let controller_handle = tokio::spawn(controller.run(topics.clone(), shutdown_tx.subscribe()));

        let dashboard_handle = dashboard_addr.map(|addr| {
            let bridge = DashboardBridge::new(topics.clone());
            tokio::spawn(bridge.run(addr, shutdown_tx.subscribe()))
        });

        Handles {
            topics,
            shutdown_tx,
            aggregator: aggregator_handle,
            optimizer: optimizer_handle,
            controller: controller_handle,
            dashboard: dashboard_handle,
        }
    }
}
