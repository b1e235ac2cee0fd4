//! Configuration for the three stages plus the bus, loaded from TOML with
//! every field defaulted to the values spec.md documents. Grounded on
//! `self_tune`'s small `*Config` structs (`ControllerConfig`, `BudgetConfig`,
//! `BusConfig`) — a flat struct per subsystem, each `Default`-deriving.

use serde::Deserialize;
use std::path::Path;

use crate::error::MeshError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// `processor.window.seconds` — trailing window folded into one Feature.
    pub window_seconds: u64,
    /// `processor.schedule.ms` — tick interval.
    pub schedule_ms: u64,
    /// `processor.max.samples.per.channel` — per-(node,channel) buffer cap.
    pub max_samples_per_channel: usize,
    /// `processor.synthesize.scans` — allow scan-based synthesis when no
    /// recent measured sample exists.
    pub synthesize_scans: bool,
    /// `processor.channels` — the configured channel set a node is expected
    /// to report on, so a channel that only ever shows up in a passive scan
    /// still gets folded into a Feature (spec.md §4.1: "for each node n and
    /// each configured channel c").
    pub channels: Vec<u32>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig {
            window_seconds: 60,
            schedule_ms: 15_000,
            max_samples_per_channel: 300,
            synthesize_scans: true,
            channels: vec![1, 6, 11],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub min_confirmations: u32,
    pub improvement_threshold: f64,
    pub low_confidence_penalty_scale: f64,
    pub base_move_cost: f64,
    pub client_penalty_per_client: f64,
    pub min_time_between_moves_ms: i64,
    pub history_penalty: f64,
    pub recent_targets_size: usize,
    /// `simulation.channels` — CSV of legal channel numbers.
    pub channels: Vec<u32>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            min_confirmations: 3,
            improvement_threshold: 0.0,
            low_confidence_penalty_scale: 0.0,
            base_move_cost: 0.0,
            client_penalty_per_client: 0.2,
            min_time_between_moves_ms: 0,
            history_penalty: 0.0,
            recent_targets_size: 5,
            channels: vec![1, 6, 11],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub change_cooldown_ms: i64,
    pub hold_ms: i64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            change_cooldown_ms: 60_000,
            hold_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub topic_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig { topic_capacity: 1024 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub processor: AggregatorConfig,
    pub optimizer: OptimizerConfig,
    pub controller: ControllerConfig,
    pub bus: BusConfig,
}

impl MeshConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, MeshError> {
        toml::from_str(s).map_err(|e| MeshError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, MeshError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_documented_values() {
        let cfg = MeshConfig::default();
        assert_eq!(cfg.processor.window_seconds, 60);
        assert_eq!(cfg.processor.schedule_ms, 15_000);
        assert_eq!(cfg.processor.max_samples_per_channel, 300);
        assert!(cfg.processor.synthesize_scans);
        assert_eq!(cfg.processor.channels, vec![1, 6, 11]);
        assert_eq!(cfg.optimizer.min_confirmations, 3);
        assert_eq!(cfg.optimizer.client_penalty_per_client, 0.2);
        assert_eq!(cfg.optimizer.recent_targets_size, 5);
        assert_eq!(cfg.optimizer.min_time_between_moves_ms, 0);
        assert_eq!(cfg.controller.change_cooldown_ms, 60_000);
        assert_eq!(cfg.controller.hold_ms, 30_000);
    }

    #[test]
    fn partial_toml_fills_in_defaults_for_missing_fields() {
        let toml_str = r#"
            [optimizer]
            min_confirmations = 5
        "#;
        let cfg = MeshConfig::from_toml_str(toml_str).expect("parse");
        assert_eq!(cfg.optimizer.min_confirmations, 5);
        // everything else still default
        assert_eq!(cfg.optimizer.recent_targets_size, 5);
        assert_eq!(cfg.processor.window_seconds, 60);
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = MeshConfig::from_toml_str("not valid [[[ toml").unwrap_err();
        assert!(matches!(err, MeshError::Config(_)));
    }

    #[test]
    fn full_document_round_trips_via_tempfile() {
        let toml_str = r#"
            [processor]
            window_seconds = 30
            schedule_ms = 5000
            max_samples_per_channel = 100
            synthesize_scans = false
            channels = [1, 6, 11]

            [optimizer]
            min_confirmations = 2
            channels = [1, 6, 11]

            [controller]
            change_cooldown_ms = 1000
            hold_ms = 500

            [bus]
            topic_capacity = 64
        "#;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mesh.toml");
        std::fs::write(&path, toml_str).expect("write");

        let cfg = MeshConfig::load(&path).expect("load");
        assert_eq!(cfg.processor.window_seconds, 30);
        assert!(!cfg.processor.synthesize_scans);
        assert_eq!(cfg.processor.channels, vec![1, 6, 11]);
        assert_eq!(cfg.optimizer.channels, vec![1, 6, 11]);
        assert_eq!(cfg.controller.hold_ms, 500);
        assert_eq!(cfg.bus.topic_capacity, 64);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = MeshConfig::load(Path::new("/nonexistent/mesh.toml")).unwrap_err();
        assert!(matches!(err, MeshError::Io(_)));
    }
}
