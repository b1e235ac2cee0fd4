pub mod aggregator;
pub mod bus;
pub mod config;
pub mod controller;
pub mod dashboard;
pub mod error;
pub mod optimizer;
pub mod orchestrator;
pub mod types;

/// Current wall-clock time in epoch milliseconds. Shared by every stage's
/// `run()` loop so "now" is computed once, the same way, everywhere.
pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
