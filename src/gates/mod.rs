//! Declarative quality gates evaluated between phases.
//!
//! Each gate is a named threshold comparison over one observed phase metric,
//! configured declaratively rather than hardcoded per phase. A failing gate
//! is reported with its name, observed value and threshold so the caller can
//! explain why the run halted; the engine never attempts remediation.

use serde::{Deserialize, Serialize};

/// Direction of the threshold comparison. Boundaries are inclusive: an
/// observed value exactly at the threshold passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateCondition {
    AtLeast,
    AtMost,
}

/// What a failing gate does to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOnFail {
    /// Halt the run as `failed`.
    #[default]
    Halt,
    /// Halt the run as `awaiting-input`, pending caller intervention.
    Pause,
    /// Report the result and advance anyway.
    Warn,
}

/// A named pass/fail threshold check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateSpec {
    pub name: String,
    /// Metric key this gate reads from the phase's observed values.
    pub metric: String,
    pub condition: GateCondition,
    pub threshold: f64,
    #[serde(default)]
    pub on_fail: GateOnFail,
}

impl GateSpec {
    pub fn at_least(name: impl Into<String>, metric: impl Into<String>, threshold: f64) -> Self {
        Self {
            name: name.into(),
            metric: metric.into(),
            condition: GateCondition::AtLeast,
            threshold,
            on_fail: GateOnFail::default(),
        }
    }

    pub fn at_most(name: impl Into<String>, metric: impl Into<String>, threshold: f64) -> Self {
        Self {
            name: name.into(),
            metric: metric.into(),
            condition: GateCondition::AtMost,
            threshold,
            on_fail: GateOnFail::default(),
        }
    }

    pub fn with_on_fail(mut self, on_fail: GateOnFail) -> Self {
        self.on_fail = on_fail;
        self
    }
}

/// Latest evaluation of one gate for one phase. Recomputed on every
/// evaluation, not appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub phase: String,
    pub gate: String,
    pub pass: bool,
    pub observed: f64,
    pub threshold: f64,
}

/// Evaluates gate specs against observed values.
pub struct GateEvaluator;

impl GateEvaluator {
    pub fn evaluate(phase: &str, spec: &GateSpec, observed: f64) -> GateResult {
        let pass = match spec.condition {
            GateCondition::AtLeast => observed >= spec.threshold,
            GateCondition::AtMost => observed <= spec.threshold,
        };
        GateResult {
            phase: phase.to_string(),
            gate: spec.name.clone(),
            pass,
            observed,
            threshold: spec.threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_least_fails_strictly_below_threshold() {
        let gate = GateSpec::at_least("min-included", "items_processed", 10.0);
        let result = GateEvaluator::evaluate("screen", &gate, 9.0);
        assert!(!result.pass);
        assert_eq!(result.observed, 9.0);
        assert_eq!(result.threshold, 10.0);
        assert_eq!(result.phase, "screen");
    }

    #[test]
    fn at_least_passes_exactly_at_threshold() {
        let gate = GateSpec::at_least("min-included", "items_processed", 10.0);
        assert!(GateEvaluator::evaluate("screen", &gate, 10.0).pass);
        assert!(GateEvaluator::evaluate("screen", &gate, 11.0).pass);
    }

    #[test]
    fn at_most_passes_exactly_at_threshold() {
        let gate = GateSpec::at_most("max-error-ratio", "error_ratio", 0.1);
        assert!(GateEvaluator::evaluate("extract", &gate, 0.1).pass);
        assert!(!GateEvaluator::evaluate("extract", &gate, 0.11).pass);
    }

    #[test]
    fn zero_threshold_gate() {
        // "zero unresolved references" style gate
        let gate = GateSpec::at_most("no-unresolved", "unresolved_refs", 0.0);
        assert!(GateEvaluator::evaluate("synthesize", &gate, 0.0).pass);
        assert!(!GateEvaluator::evaluate("synthesize", &gate, 1.0).pass);
    }

    #[test]
    fn on_fail_defaults_to_halt() {
        let gate = GateSpec::at_least("g", "m", 1.0);
        assert_eq!(gate.on_fail, GateOnFail::Halt);
        let gate = gate.with_on_fail(GateOnFail::Warn);
        assert_eq!(gate.on_fail, GateOnFail::Warn);
    }

    #[test]
    fn gate_spec_rejects_unknown_fields() {
        let raw = r#"{"name":"g","metric":"m","condition":"at_least","threshold":1.0,"bogus":true}"#;
        assert!(serde_json::from_str::<GateSpec>(raw).is_err());
    }
}
