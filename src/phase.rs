//! Run, phase and item contracts consumed by the engine.
//!
//! A pipeline is a strict linear chain of phases. The engine owns sequencing,
//! checkpointing and admission control; what a phase actually does lives
//! behind the `ItemSource` / `ItemProcessor` seams and stays opaque here.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::CallError;
use crate::gates::GateSpec;

/// Name of the implicit terminal phase. It performs no per-item work and has
/// no partial state.
pub const FINALIZE_PHASE: &str = "finalize";

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Pending,
    Running,
    AwaitingInput,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// The run's driver task has exited; `wait()` resolves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AwaitingInput | Self::Completed | Self::Failed | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::AwaitingInput => "awaiting-input",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "awaiting-input" => Ok(Self::AwaitingInput),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => anyhow::bail!("unknown run status '{other}'"),
        }
    }
}

/// One unit of phase work with a stable identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    /// Phase-specific input, opaque to the engine.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    pub fn bare(id: impl Into<String>) -> Self {
        Self::new(id, serde_json::Value::Null)
    }
}

/// Produces the finite item set of a phase. Identifiers must be stable across
/// invocations — resume correctness depends on it.
#[async_trait]
pub trait ItemSource: Send + Sync {
    async fn items(&self) -> anyhow::Result<Vec<WorkItem>>;
}

/// Per-item work of a phase: one logical external call per item, failing with
/// a classified error.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// Rate tier this processor's external calls draw from.
    fn tier(&self) -> &str;

    /// Process one item, returning its opaque result payload.
    async fn process(&self, item: &WorkItem) -> Result<serde_json::Value, CallError>;

    /// Phase-level observed values contributed to gate evaluation, merged
    /// over the runner's built-in counters once the phase's item loop
    /// finishes. A screening processor reports its agreement coefficient
    /// here, for example.
    fn metrics(&self) -> HashMap<String, f64> {
        HashMap::new()
    }
}

/// Built-in metric names every phase exposes to its gates.
pub mod metrics {
    pub const ITEMS_TOTAL: &str = "items_total";
    pub const ITEMS_PROCESSED: &str = "items_processed";
    pub const ITEMS_ERRORED: &str = "items_errored";
    pub const ERROR_RATIO: &str = "error_ratio";
}

/// One phase of a pipeline.
#[derive(Clone)]
pub struct PhaseDef {
    pub name: String,
    pub source: Arc<dyn ItemSource>,
    pub processor: Arc<dyn ItemProcessor>,
    /// Exit gates evaluated when advancing past this phase.
    pub gates: Vec<GateSpec>,
    /// Overrides the engine-wide concurrency bound when set.
    pub concurrency: Option<usize>,
}

impl PhaseDef {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn ItemSource>,
        processor: Arc<dyn ItemProcessor>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            processor,
            gates: Vec::new(),
            concurrency: None,
        }
    }

    pub fn with_gate(mut self, gate: GateSpec) -> Self {
        self.gates.push(gate);
        self
    }

    pub fn with_gates(mut self, gates: Vec<GateSpec>) -> Self {
        self.gates = gates;
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }
}

impl fmt::Debug for PhaseDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseDef")
            .field("name", &self.name)
            .field("gates", &self.gates)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

/// The ordered phase chain of a run. Strictly linear: no branching, no
/// cycles. The terminal finalize phase is implicit.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    pub phases: Vec<PhaseDef>,
}

impl Pipeline {
    pub fn new(phases: Vec<PhaseDef>) -> Self {
        Self { phases }
    }

    pub fn phase_names(&self) -> Vec<&str> {
        self.phases.iter().map(|p| p.name.as_str()).collect()
    }
}

/// Outcome of one phase execution pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseOutcome {
    /// Full item set size, including previously checkpointed items.
    pub total: usize,
    /// Items excluded up front because they were already checkpointed.
    pub skipped: usize,
    /// Items completed successfully during this pass.
    pub processed: usize,
    /// Items that exhausted retries during this pass.
    pub errored: usize,
    /// The pass stopped before draining the work set.
    pub partial: bool,
    /// In-flight work was hard-aborted (implies `partial`).
    pub aborted: bool,
}

impl PhaseOutcome {
    pub fn is_complete(&self) -> bool {
        !self.partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_roundtrips_through_strings() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::AwaitingInput,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("limbo".parse::<RunStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::AwaitingInput.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn work_item_serialization_roundtrip() {
        let item = WorkItem::new("rec-17", serde_json::json!({"title": "A study"}));
        let json = serde_json::to_string(&item).unwrap();
        let back: WorkItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn phase_outcome_completeness() {
        let outcome = PhaseOutcome {
            total: 10,
            skipped: 4,
            processed: 6,
            ..Default::default()
        };
        assert!(outcome.is_complete());

        let interrupted = PhaseOutcome {
            partial: true,
            ..outcome
        };
        assert!(!interrupted.is_complete());
    }
}
