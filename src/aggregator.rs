//! Stage 1: windowed aggregation (spec.md §4.1).
//!
//! Maintains a bounded, time-ordered per-(node, channel) sample buffer and,
//! on each tick, folds the trailing window into one `Feature` per
//! (node, channel) pair. When no recent measured sample exists for a
//! channel, a synthetic sample is derived from the node's latest passive
//! interference scan instead of emitting nothing.
//!
//! Grounded on `self_tune/telemetry_bus.rs`'s `RingBuffer` (fixed-capacity
//! push-with-eviction), generalized here from one global ring to a keyed
//! map of rings, one per (node, channel).

use std::collections::{HashMap, VecDeque};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::bus::Topics;
use crate::config::AggregatorConfig;
use crate::types::{Feature, SampleSource, ScanRecord, Telemetry};

/// RSSI clamp range used to synthesize a busy-percent reading when a scan
/// entry carries only an `rssi` value and no direct `busy` reading.
const RSSI_FLOOR: f64 = -95.0;
const RSSI_CEIL: f64 = -40.0;

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Maps an RSSI reading in dBm to a busy-percent estimate in `[0, 100]`,
/// clamping to the `[-95, -40]` dBm range before scaling.
fn rssi_to_busy_percent(rssi: f64) -> f64 {
    let clamped = rssi.clamp(RSSI_FLOOR, RSSI_CEIL);
    round2((clamped - RSSI_FLOOR) / (RSSI_CEIL - RSSI_FLOOR) * 100.0)
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
struct ChannelKey {
    node_id: String,
    channel: u32,
}

/// Per-(node, channel) sample buffer plus per-node latest scan state.
pub struct Aggregator {
    config: AggregatorConfig,
    buffers: HashMap<ChannelKey, VecDeque<Telemetry>>,
    latest_scans: HashMap<String, ScanRecord>,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Aggregator {
            config,
            buffers: HashMap::new(),
            latest_scans: HashMap::new(),
        }
    }

    /// Append a telemetry sample to its (node, channel) buffer, evicting the
    /// oldest sample if the buffer is at capacity. If the sample carries an
    /// interference scan, it becomes the node's latest scan (overwriting any
    /// previous one), independent of which channel the sample itself was on.
    pub fn add_telemetry(&mut self, t: Telemetry) {
        if t.node_id.is_empty() {
            debug!(target: "meshplane::aggregator", "dropping telemetry with empty nodeId");
            return;
        }

        if let Some(scan) = &t.interference_scan {
            self.latest_scans.insert(
                t.node_id.clone(),
                ScanRecord {
                    node_id: t.node_id.clone(),
                    scan: scan.clone(),
                    observed_at: t.timestamp,
                },
            );
        }

        let key = ChannelKey {
            node_id: t.node_id.clone(),
            channel: t.channel,
        };
        let buf = self.buffers.entry(key).or_default();
        buf.push_back(t);
        while buf.len() > self.config.max_samples_per_channel {
            buf.pop_front();
        }
    }

    /// Parse and ingest one raw telemetry JSON record. Malformed input is
    /// dropped silently (logged at `debug`), per spec.md §7 — this is normal
    /// control flow, not an error condition callers need to handle.
    pub fn ingest_json(&mut self, raw: &[u8]) {
        match serde_json::from_slice::<Telemetry>(raw) {
            Ok(t) => self.add_telemetry(t),
            Err(e) => debug!(target: "meshplane::aggregator", error = %e, "dropping malformed telemetry"),
        }
    }

    /// Fold the trailing window (ending at `now`, in the same epoch-ms units
    /// as `Telemetry::timestamp`) into one `Feature` per (node, channel)
    /// pair with a non-empty window, synthesizing from the latest scan when
    /// no measured sample survives pruning and synthesis is enabled.
    pub fn aggregate(&mut self, now: i64) -> Vec<Feature> {
        let window_start = now - (self.config.window_seconds as i64) * 1000;
        let mut out = Vec::new();

        // Visit every (node, channel) pair that already has a sample buffer,
        // plus every configured channel for a node that has reported any
        // scan at all — otherwise a channel that only ever appears inside
        // an interferenceScan, never as its own direct sample, is never
        // folded into a Feature.
        let mut node_ids: std::collections::HashSet<String> =
            self.buffers.keys().map(|k| k.node_id.clone()).collect();
        node_ids.extend(self.latest_scans.keys().cloned());

        let mut keys: Vec<ChannelKey> = Vec::new();
        let mut seen: std::collections::HashSet<ChannelKey> = std::collections::HashSet::new();
        for node_id in &node_ids {
            for key in self.buffers.keys().filter(|k| &k.node_id == node_id) {
                if seen.insert(key.clone()) {
                    keys.push(key.clone());
                }
            }
            for &channel in &self.config.channels {
                let key = ChannelKey { node_id: node_id.clone(), channel };
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }

        for key in keys {
            let buf = self.buffers.entry(key.clone()).or_default();
            while let Some(front) = buf.front() {
                if front.timestamp < window_start {
                    buf.pop_front();
                } else {
                    break;
                }
            }

            let has_recent_real = buf.iter().any(|t| t.sample_source == SampleSource::Measured);

            let mut window_list: Vec<Telemetry> = buf.iter().cloned().collect();

            if !has_recent_real && self.config.synthesize_scans {
                if let Some(synthetic) =
                    self.synthesize_from_scan(&key.node_id, key.channel, window_start, now)
                {
                    window_list.push(synthetic);
                }
            }

            if window_list.is_empty() {
                continue;
            }

            out.push(self.fold_window(&key, window_start, now, &window_list));
        }

        out
    }

    fn synthesize_from_scan(
        &mut self,
        node_id: &str,
        channel: u32,
        window_start: i64,
        now: i64,
    ) -> Option<Telemetry> {
        let stale = self
            .latest_scans
            .get(node_id)
            .map(|rec| rec.observed_at < window_start)
            .unwrap_or(false);
        if stale {
            self.latest_scans.remove(node_id);
            return None;
        }

        let rec = self.latest_scans.get(node_id)?;
        let entry = rec.scan.iter().find(|e| e.channel == channel)?;

        let busy_percent = match (entry.busy, entry.rssi) {
            (Some(busy), _) => round2(busy),
            (None, Some(rssi)) => rssi_to_busy_percent(rssi),
            (None, None) => return None,
        };

        Some(Telemetry {
            node_id: node_id.to_string(),
            timestamp: now,
            radio_id: String::new(),
            channel,
            rssi: entry.rssi.unwrap_or(RSSI_FLOOR),
            snr: 0.0,
            tx_bytes: 0,
            rx_bytes: 0,
            tx_retries: -1,
            num_clients: 0,
            channel_busy_percent: busy_percent,
            interference_scan: None,
            sample_source: SampleSource::Scan,
        })
    }

    fn fold_window(
        &self,
        key: &ChannelKey,
        window_start: i64,
        window_end: i64,
        window_list: &[Telemetry],
    ) -> Feature {
        let n = window_list.len() as f64;
        let avg_busy = window_list.iter().map(|t| t.channel_busy_percent).sum::<f64>() / n;
        let max_busy = window_list
            .iter()
            .map(|t| t.channel_busy_percent)
            .fold(f64::MIN, f64::max);
        let min_rssi = window_list.iter().map(|t| t.rssi).fold(f64::MAX, f64::min);
        let avg_rssi = window_list.iter().map(|t| t.rssi).sum::<f64>() / n;
        let sum_tx_bytes = window_list.iter().map(|t| t.tx_bytes).sum::<u64>();

        let measured: Vec<&Telemetry> = window_list
            .iter()
            .filter(|t| t.sample_source == SampleSource::Measured)
            .collect();
        let avg_num_clients = if measured.is_empty() {
            None
        } else {
            Some(measured.iter().map(|t| t.num_clients as f64).sum::<f64>() / measured.len() as f64)
        };

        let synthetic = window_list.iter().all(|t| t.sample_source == SampleSource::Scan);

        Feature {
            node_id: key.node_id.clone(),
            channel: key.channel,
            window_start,
            window_end,
            granularity: format!("{}s", self.config.window_seconds),
            sample_count: window_list.len() as u64,
            avg_busy: round2(avg_busy),
            max_busy: round2(max_busy),
            min_rssi: round2(min_rssi),
            avg_rssi: round2(avg_rssi),
            sum_tx_bytes,
            avg_num_clients,
            last_seen: window_end,
            synthetic,
        }
    }

    /// Run the tick loop: every `schedule_ms`, aggregate and publish one
    /// `Feature` per (node, channel) pair, while continuously draining the
    /// telemetry topic into the buffer in between ticks. Exits cleanly when
    /// `shutdown` fires, completing any in-flight tick first.
    pub async fn run(mut self, topics: Topics, mut shutdown: broadcast::Receiver<()>) {
        let mut telemetry_rx = topics.telemetry.subscribe();
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(self.config.schedule_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(target: "meshplane::aggregator", "shutdown received, exiting tick loop");
                    break;
                }
                _ = ticker.tick() => {
                    let now = crate::now_ms();
                    for feature in self.aggregate(now) {
                        topics.features.publish(feature);
                    }
                }
                recv = telemetry_rx.recv() => {
                    match recv {
                        Ok(t) => self.add_telemetry(t),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(target: "meshplane::aggregator", skipped, "telemetry receiver lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }
}
