//! Progress event stream.
//!
//! Observers (a CLI, a dashboard) subscribe to a broadcast channel and see
//! phase and item progress without coupling to the engine's internals.
//! Events are best-effort: a slow or absent subscriber never blocks the run.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::gates::GateResult;

/// Events emitted while a run executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A phase has started (or re-entered after a partial interruption).
    PhaseStarted { phase: String },
    /// An item reached its terminal result. `completed` counts checkpointed
    /// items including earlier passes.
    ItemProgress {
        phase: String,
        completed: usize,
        total: usize,
    },
    /// A phase's item loop drained completely.
    PhaseCompleted {
        phase: String,
        processed: usize,
        errored: usize,
    },
    /// A transition gate was evaluated.
    GateEvaluated { result: GateResult },
    /// The run reached the terminal phase.
    RunCompleted,
    /// The run halted on a run-level error.
    RunFailed { error: String },
    /// The run stopped on a cancellation request.
    RunCancelled { hard: bool },
    /// The run paused awaiting caller intervention (a `pause` gate failed).
    RunPaused { gate: String },
}

/// Cloneable sender side of the event stream.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Having no subscribers is not an error.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
