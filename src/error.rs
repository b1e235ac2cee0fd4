//! Crate-level error type for the small set of conditions that are genuine
//! exceptions rather than normal control flow. Per spec.md §7 and §9,
//! malformed records, insufficient forecast evidence, and stale scans are
//! *not* represented here — those are handled as `Option`/early-return
//! no-ops inside the stage handlers and logged, never surfaced as `Err`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("bus error: {0}")]
    Bus(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_error_displays_message() {
        let e = MeshError::Bus("receiver lagged".into());
        assert_eq!(e.to_string(), "bus error: receiver lagged");
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let e: MeshError = io_err.into();
        assert!(matches!(e, MeshError::Io(_)));
    }
}
