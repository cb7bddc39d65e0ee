//! Typed error hierarchy for the quorum engine.
//!
//! Two top-level enums cover the two failure scopes:
//! - `CallError` — classified failure of a single external call; never halts
//!   a phase on its own
//! - `EngineError` — run-level failures that halt a run and are surfaced
//!   verbatim to the caller

use std::time::Duration;
use thiserror::Error;

/// Classified failure of one external call.
///
/// The engine assumes every external call exposes a "try once, fail with a
/// classified error" contract. Transient failures (including timeouts) are
/// retried with bounded backoff; malformed results are retried exactly once
/// before the item is marked `error`.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("transient external failure: {0}")]
    Transient(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed result: {0}")]
    Malformed(String),
}

impl CallError {
    /// Transient failures (network, rate limiting, timeout) retry up to the
    /// policy cap.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    /// Malformed results retry once, then fail fast.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

/// Run-level failures.
///
/// Per-item errors never reach this level; they are recorded against the item
/// and the phase continues. Everything here halts the run without retrying —
/// retry-by-resume is a caller decision.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no run found for label '{label}' with config hash {config_hash}")]
    RunNotFound { label: String, config_hash: String },

    #[error(
        "gate '{gate}' failed for phase '{phase}': observed {observed}, threshold {threshold}"
    )]
    GateFailure {
        phase: String,
        gate: String,
        observed: f64,
        threshold: f64,
    },

    #[error("checkpoint data inconsistent: {0}")]
    ResumeIntegrity(String),

    #[error("unknown rate tier '{0}'")]
    UnknownTier(String),

    #[error("gate '{gate}' on phase '{phase}' references unknown metric '{metric}'")]
    UnknownMetric {
        phase: String,
        gate: String,
        metric: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether a halted run can safely be resumed by re-running `start` with
    /// the same identity. Only inconsistent checkpoint data requires manual
    /// inspection of the store first.
    pub fn is_resumable(&self) -> bool {
        !matches!(self, Self::ResumeIntegrity(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_timeout_are_transient() {
        assert!(CallError::Transient("connection reset".into()).is_transient());
        assert!(CallError::Timeout(Duration::from_secs(30)).is_transient());
        assert!(!CallError::Malformed("not json".into()).is_transient());
    }

    #[test]
    fn malformed_is_not_transient() {
        let err = CallError::Malformed("missing decision field".into());
        assert!(err.is_malformed());
        assert!(!err.is_transient());
    }

    #[test]
    fn gate_failure_carries_observed_and_threshold() {
        let err = EngineError::GateFailure {
            phase: "screen".into(),
            gate: "min-included".into(),
            observed: 3.0,
            threshold: 10.0,
        };
        match &err {
            EngineError::GateFailure {
                observed, threshold, ..
            } => {
                assert_eq!(*observed, 3.0);
                assert_eq!(*threshold, 10.0);
            }
            _ => panic!("Expected GateFailure variant"),
        }
        assert!(err.to_string().contains("min-included"));
        assert!(err.is_resumable());
    }

    #[test]
    fn resume_integrity_is_not_resumable() {
        let err = EngineError::ResumeIntegrity("phase 'search' completed with zero items".into());
        assert!(!err.is_resumable());

        let err = EngineError::RunNotFound {
            label: "demo".into(),
            config_hash: "abc123".into(),
        };
        assert!(err.is_resumable());
    }

    #[test]
    fn engine_error_converts_from_anyhow() {
        let inner = anyhow::anyhow!("disk full");
        let err: EngineError = inner.into();
        assert!(matches!(err, EngineError::Other(_)));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&CallError::Transient("x".into()));
        assert_std_error(&EngineError::UnknownTier("decision".into()));
    }
}
