//! Wire/data-model types shared across the aggregator, optimizer, and
//! controller stages. Field names use `camelCase` on the wire to match the
//! bus payload layouts; optional fields are always `Option<T>`, never a
//! sentinel zero value.

use serde::{Deserialize, Serialize};

/// Where a telemetry sample's numbers came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleSource {
    Measured,
    Scan,
}

/// One entry of a node's passive interference scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEntry {
    pub channel: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub busy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<f64>,
}

/// A raw telemetry sample published on the `telemetry` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub node_id: String,
    pub timestamp: i64,
    pub radio_id: String,
    pub channel: u32,
    pub rssi: f64,
    pub snr: f64,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_retries: i64,
    pub num_clients: u32,
    pub channel_busy_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interference_scan: Option<Vec<ScanEntry>>,
    pub sample_source: SampleSource,
}

/// Latest passive scan observed for a node, kept independent of the
/// telemetry ring buffer so it can outlive any one sample's window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    pub node_id: String,
    pub scan: Vec<ScanEntry>,
    pub observed_at: i64,
}

/// A windowed, per-(node, channel) aggregate published on the `features`
/// topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub node_id: String,
    pub channel: u32,
    pub window_start: i64,
    pub window_end: i64,
    pub granularity: String,
    pub sample_count: u64,
    pub avg_busy: f64,
    pub max_busy: f64,
    pub min_rssi: f64,
    pub avg_rssi: f64,
    pub sum_tx_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_num_clients: Option<f64>,
    pub last_seen: i64,
    pub synthetic: bool,
}

/// A forecast produced by the (external) Forecaster and consumed by the
/// optimizer on the `forecasts` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Forecast {
    pub node_id: String,
    pub channel: u32,
    pub timestamp: i64,
    pub forecast_busy_percent: f64,
    pub confidence: f64,
    pub synthetic: bool,
    pub sample_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_num_clients: Option<f64>,
    pub window_seconds: u64,
}

/// In-memory bookkeeping for the most recently seen forecast on a
/// (node, channel) pair. Not published on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastEntry {
    pub forecast: f64,
    pub confidence: f64,
    pub synthetic: bool,
    pub sample_count: u64,
    pub avg_num_clients: Option<f64>,
    pub timestamp: i64,
}

impl From<&Forecast> for ForecastEntry {
    fn from(f: &Forecast) -> Self {
        ForecastEntry {
            forecast: f.forecast_busy_percent,
            confidence: f.confidence,
            synthetic: f.synthetic,
            sample_count: f.sample_count,
            avg_num_clients: f.avg_num_clients,
            timestamp: f.timestamp,
        }
    }
}

/// A committed per-node channel assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub node_id: String,
    pub assigned_channel: u32,
    pub assigned_contribution: f64,
    pub assigned_at: i64,
}

/// A channel-change decision published on the `chconfigs` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub node_id: String,
    pub channel: u32,
    pub reason: String,
}

/// The single command kind emitted by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    SetChannel,
}

/// A dispatched command published on the `commands` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub node_id: String,
    pub command: CommandKind,
    pub payload: String,
    pub config_version: String,
}
