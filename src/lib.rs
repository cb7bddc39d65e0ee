//! Quorum: a crash-safe, resumable multi-phase pipeline orchestrator with
//! dual-reviewer consensus screening.
//!
//! The engine turns a list of independent, externally-adjudicated work items
//! into a reliable pipeline: phases run strictly in sequence, items within a
//! phase run concurrently under rate-limited admission control, every item
//! result is durably checkpointed as it completes, and a run interrupted at
//! any point resumes by identity without re-processing anything.

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod gates;
pub mod limiter;
pub mod phase;
pub mod registry;
pub mod retry;
pub mod screen;
pub mod signals;

pub use config::{EngineConfig, ScreenerConfig, TierConfig};
pub use engine::{RunHandle, StatusReport, WorkflowEngine};
pub use errors::{CallError, EngineError};
pub use events::RunEvent;
pub use gates::{GateOnFail, GateSpec};
pub use phase::{ItemProcessor, ItemSource, PhaseDef, Pipeline, RunStatus, WorkItem};
pub use screen::{ConsensusScreener, Decision, ReviewerCall};
pub use signals::CancelMode;
