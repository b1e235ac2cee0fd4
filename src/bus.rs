//! Minimal keyed publish/subscribe bus over the five topics used by the
//! pipeline. Each topic is an independent `tokio::sync::broadcast` channel
//! carrying one record type; publishing never blocks and a slow or absent
//! subscriber never backs up a publisher (broadcast drops for lagging
//! receivers, surfaced to the subscriber as `RecvError::Lagged`).

use tokio::sync::broadcast;
use tracing::warn;

use crate::types::{ChannelConfig, Command, Feature, Forecast, Telemetry};

const DEFAULT_CAPACITY: usize = 1024;

/// A single-topic pub/sub channel for records of type `T`.
///
/// Clone is cheap — it clones the underlying `broadcast::Sender`, which is
/// itself a reference-counted handle, so every clone publishes to and can
/// subscribe from the same underlying queue.
#[derive(Clone)]
pub struct Bus<T: Clone> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> Bus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Bus { tx }
    }

    /// Publish a record. Best-effort: if there are no subscribers this is a
    /// silent no-op (matching spec.md §7's "no durable persistence, no
    /// guaranteed delivery" model).
    pub fn publish(&self, value: T) {
        if self.tx.send(value).is_err() {
            warn!(target: "meshplane::bus", "publish with no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone> Default for Bus<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Bundles the five topic buses the pipeline stages are wired through.
#[derive(Clone, Default)]
pub struct Topics {
    pub telemetry: Bus<Telemetry>,
    pub features: Bus<Feature>,
    pub forecasts: Bus<Forecast>,
    pub chconfigs: Bus<ChannelConfig>,
    pub commands: Bus<Command>,
}

impl Topics {
    pub fn new(capacity: usize) -> Self {
        Topics {
            telemetry: Bus::new(capacity),
            features: Bus::new(capacity),
            forecasts: Bus::new(capacity),
            chconfigs: Bus::new(capacity),
            commands: Bus::new(capacity),
        }
    }
}
