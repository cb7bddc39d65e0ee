//! The workflow engine: run identity, phase sequencing and resume routing.
//!
//! The engine owns the ordered phase chain. On (re)start it reads checkpoint
//! rows, enters the first phase that is absent or partial, and never
//! re-enters a completed phase — checkpoint status is the single source of
//! truth for phase completion. Transition gates are evaluated from persisted
//! phase metrics whenever the engine advances past a phase, so a gate-halted
//! run re-halts (or proceeds, if the caller relaxed the gate) without
//! re-processing anything.

mod handle;
mod runner;

pub use handle::{RunHandle, StatusReport};
pub use runner::PhaseRunner;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::watch;
use uuid::Uuid;

use crate::checkpoint::{
    CheckpointStore, META_CONFIG_HASH, META_CREATED_AT, META_LABEL, META_STATUS, PhaseCheckpoint,
};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::events::{EventBus, RunEvent};
use crate::gates::{GateEvaluator, GateOnFail, GateResult};
use crate::limiter::RateLimiter;
use crate::phase::{FINALIZE_PHASE, PhaseDef, PhaseOutcome, Pipeline, RunStatus, metrics};
use crate::registry::{self, RunRegistry};
use crate::retry::RetryPolicy;
use crate::signals::CancelToken;

/// Owns the registry, the rate limiter and the live-run table; creates and
/// resumes runs.
pub struct WorkflowEngine {
    config: EngineConfig,
    config_hash: String,
    registry: RunRegistry,
    limiter: Arc<RateLimiter>,
    live: DashMap<String, RunHandle>,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("Failed to create data directory {}", config.data_dir.display())
        })?;
        let registry = RunRegistry::open(&config.data_dir.join("registry.db"))?;
        let limiter = Arc::new(RateLimiter::new(&config.tiers)?);
        let config_hash = config.content_hash()?;
        Ok(Self {
            config,
            config_hash,
            registry,
            limiter,
            live: DashMap::new(),
        })
    }

    /// Content hash of this engine's configuration — half of every run
    /// identity.
    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    /// Registry lookup, exposed as the sole resume entry point: no caller
    /// needs to know the storage location format.
    pub async fn lookup(&self, label: &str) -> Result<Option<RunStatus>, EngineError> {
        let entry = self
            .registry
            .resolve(label.to_string(), self.config_hash.clone())
            .await?;
        Ok(entry.map(|e| e.status))
    }

    /// Create a new run, or return a handle to the existing run with the
    /// same identity.
    ///
    /// Idempotent: an identical (configuration, label) with an unfinished run
    /// is an implicit resume, never a duplicate run — re-submitting the same
    /// logical work cannot double-process it. While the run is live
    /// in-process, the same handle is returned.
    pub async fn start(&self, label: &str, pipeline: Pipeline) -> Result<RunHandle, EngineError> {
        self.validate_pipeline(&pipeline)?;

        if let Some(handle) = self.live_handle(label) {
            return Ok(handle);
        }

        let existing = self
            .registry
            .resolve(label.to_string(), self.config_hash.clone())
            .await?;
        let location = match existing {
            Some(entry) => {
                tracing::info!(label, status = %entry.status, "start resolves to existing run");
                entry.location
            }
            None => {
                let location = self
                    .config
                    .data_dir
                    .join("runs")
                    .join(Uuid::new_v4().to_string());
                std::fs::create_dir_all(&location).with_context(|| {
                    format!("Failed to create run directory {}", location.display())
                })?;
                self.registry
                    .register(registry::new_entry(&self.config_hash, label, &location))
                    .await?;
                tracing::info!(label, location = %location.display(), "registered new run");
                location
            }
        };

        self.attach(label, pipeline, &location).await
    }

    /// Resume an existing run by identity. Fails with `RunNotFound` if no
    /// registry entry matches.
    pub async fn resume(&self, label: &str, pipeline: Pipeline) -> Result<RunHandle, EngineError> {
        self.validate_pipeline(&pipeline)?;

        if let Some(handle) = self.live_handle(label) {
            return Ok(handle);
        }

        let entry = self
            .registry
            .resolve(label.to_string(), self.config_hash.clone())
            .await?
            .ok_or_else(|| EngineError::RunNotFound {
                label: label.to_string(),
                config_hash: self.config_hash.clone(),
            })?;
        self.attach(label, pipeline, &entry.location).await
    }

    fn live_handle(&self, label: &str) -> Option<RunHandle> {
        let key = self.live_key(label);
        let handle = self.live.get(&key)?;
        if handle.status().is_terminal() {
            return None;
        }
        Some(handle.clone())
    }

    fn live_key(&self, label: &str) -> String {
        format!("{}:{}", self.config_hash, label)
    }

    async fn attach(
        &self,
        label: &str,
        pipeline: Pipeline,
        location: &std::path::Path,
    ) -> Result<RunHandle, EngineError> {
        let store = CheckpointStore::open(&location.join("run.db"))?;
        store.set_meta(META_LABEL.into(), label.to_string()).await?;
        store
            .set_meta(META_CONFIG_HASH.into(), self.config_hash.clone())
            .await?;
        if store.meta(META_CREATED_AT.into()).await?.is_none() {
            store
                .set_meta(META_CREATED_AT.into(), Utc::now().to_rfc3339())
                .await?;
        }

        let cancel = CancelToken::new(Duration::from_millis(self.config.cancel_debounce_ms));
        let events = EventBus::default();
        let (status_tx, status_rx) = watch::channel(StatusReport::pending(label, &self.config_hash));

        let driver = RunDriver {
            label: label.to_string(),
            config_hash: self.config_hash.clone(),
            concurrency: self.config.concurrency,
            call_timeout: Duration::from_millis(self.config.call_timeout_ms),
            retry: self.config.retry.clone(),
            store,
            registry: self.registry.clone(),
            limiter: self.limiter.clone(),
            pipeline,
            cancel: cancel.clone(),
            events: events.clone(),
            status_tx,
        };
        tokio::spawn(driver.drive());

        let handle = RunHandle::new(status_rx, events, cancel);
        self.live.insert(self.live_key(label), handle.clone());
        Ok(handle)
    }

    fn validate_pipeline(&self, pipeline: &Pipeline) -> Result<(), EngineError> {
        let mut names = HashSet::new();
        for phase in &pipeline.phases {
            if phase.name.is_empty() {
                return Err(anyhow::anyhow!("phase names must be non-empty").into());
            }
            if phase.name == FINALIZE_PHASE {
                return Err(
                    anyhow::anyhow!("'{FINALIZE_PHASE}' is reserved for the terminal phase").into(),
                );
            }
            if !names.insert(phase.name.as_str()) {
                return Err(anyhow::anyhow!("duplicate phase name '{}'", phase.name).into());
            }
            let tier = phase.processor.tier();
            if !self.limiter.has_tier(tier) {
                return Err(EngineError::UnknownTier(tier.to_string()));
            }
        }
        Ok(())
    }
}

/// How a driver pass ended, short of a run-level error.
enum TerminalState {
    Completed,
    Cancelled { hard: bool },
    Paused { gate: GateResult },
}

/// Background task that sequences one run's phases.
struct RunDriver {
    label: String,
    config_hash: String,
    concurrency: usize,
    call_timeout: Duration,
    retry: RetryPolicy,
    store: CheckpointStore,
    registry: RunRegistry,
    limiter: Arc<RateLimiter>,
    pipeline: Pipeline,
    cancel: CancelToken,
    events: EventBus,
    status_tx: watch::Sender<StatusReport>,
}

impl RunDriver {
    async fn drive(self) {
        match self.execute().await {
            Ok(TerminalState::Completed) => {
                self.events.emit(RunEvent::RunCompleted);
                self.finish(RunStatus::Completed, None, None, true).await;
            }
            Ok(TerminalState::Cancelled { hard }) => {
                self.events.emit(RunEvent::RunCancelled { hard });
                self.finish(RunStatus::Cancelled, None, None, true).await;
            }
            Ok(TerminalState::Paused { gate }) => {
                self.events.emit(RunEvent::RunPaused {
                    gate: gate.gate.clone(),
                });
                self.finish(RunStatus::AwaitingInput, None, Some(gate), true)
                    .await;
            }
            Err(err) => {
                tracing::error!(label = %self.label, error = %err, "run failed");
                self.events.emit(RunEvent::RunFailed {
                    error: err.to_string(),
                });
                let failed_gate = match &err {
                    EngineError::GateFailure {
                        phase,
                        gate,
                        observed,
                        threshold,
                    } => Some(GateResult {
                        phase: phase.clone(),
                        gate: gate.clone(),
                        pass: false,
                        observed: *observed,
                        threshold: *threshold,
                    }),
                    _ => None,
                };
                let resumable = err.is_resumable();
                self.finish(
                    RunStatus::Failed,
                    Some(err.to_string()),
                    failed_gate,
                    resumable,
                )
                .await;
            }
        }
    }

    async fn execute(&self) -> Result<TerminalState, EngineError> {
        self.set_running(None).await;

        let runner = PhaseRunner::new(
            self.store.clone(),
            self.limiter.clone(),
            self.retry.clone(),
            self.call_timeout,
            self.cancel.clone(),
            self.events.clone(),
        );

        for phase in &self.pipeline.phases {
            match self.store.phase_checkpoint(phase.name.clone()).await? {
                Some(PhaseCheckpoint::Completed) => {
                    self.check_integrity(phase).await?;
                    if let Some(halt) = self.evaluate_gates(phase).await? {
                        return Ok(halt);
                    }
                    tracing::info!(phase = %phase.name, "checkpoint completed, not re-entering");
                    continue;
                }
                Some(PhaseCheckpoint::Partial) | None => {}
            }

            if self.cancel.is_cancelled() {
                return Ok(TerminalState::Cancelled {
                    hard: self.cancel.is_hard(),
                });
            }

            self.set_running(Some(phase.name.clone())).await;
            self.events.emit(RunEvent::PhaseStarted {
                phase: phase.name.clone(),
            });

            let items = phase.source.items().await.map_err(EngineError::Other)?;
            let concurrency = phase.concurrency.unwrap_or(self.concurrency);
            let outcome = runner
                .run(&phase.name, items, phase.processor.clone(), concurrency)
                .await?;

            if outcome.partial {
                self.store
                    .mark_phase(phase.name.clone(), PhaseCheckpoint::Partial)
                    .await?;
                return Ok(TerminalState::Cancelled {
                    hard: outcome.aborted,
                });
            }

            let observed = self.collect_metrics(phase, &outcome).await?;
            self.store
                .set_phase_metrics(phase.name.clone(), observed)
                .await?;
            self.store
                .mark_phase(phase.name.clone(), PhaseCheckpoint::Completed)
                .await?;

            let (done, errored) = self.store.item_counts(phase.name.clone()).await?;
            self.events.emit(RunEvent::PhaseCompleted {
                phase: phase.name.clone(),
                processed: done,
                errored,
            });

            if let Some(halt) = self.evaluate_gates(phase).await? {
                return Ok(halt);
            }
        }

        // Terminal finalize phase: no per-item work, no partial state — it
        // fully completes or the run fails.
        self.store
            .mark_phase(FINALIZE_PHASE.to_string(), PhaseCheckpoint::Completed)
            .await?;
        Ok(TerminalState::Completed)
    }

    /// A phase marked completed with zero recorded items is inconsistent:
    /// fail fast rather than guess, since guessing risks duplicate side
    /// effects.
    async fn check_integrity(&self, phase: &PhaseDef) -> Result<(), EngineError> {
        let (done, errored) = self.store.item_counts(phase.name.clone()).await?;
        if done + errored == 0 {
            return Err(EngineError::ResumeIntegrity(format!(
                "phase '{}' is marked completed but has no recorded items",
                phase.name
            )));
        }
        Ok(())
    }

    /// Evaluate a phase's exit gates against its persisted observed values.
    /// Returns the halt state for a failing pause gate; a failing halt gate
    /// is an error; warn gates only report.
    async fn evaluate_gates(
        &self,
        phase: &PhaseDef,
    ) -> Result<Option<TerminalState>, EngineError> {
        if phase.gates.is_empty() {
            return Ok(None);
        }
        let observed_values = self.store.phase_metrics(phase.name.clone()).await?;
        for gate in &phase.gates {
            let observed = *observed_values.get(&gate.metric).ok_or_else(|| {
                EngineError::UnknownMetric {
                    phase: phase.name.clone(),
                    gate: gate.name.clone(),
                    metric: gate.metric.clone(),
                }
            })?;
            let result = GateEvaluator::evaluate(&phase.name, gate, observed);
            self.store.record_gate(result.clone()).await?;
            self.events.emit(RunEvent::GateEvaluated {
                result: result.clone(),
            });
            if result.pass {
                continue;
            }
            match gate.on_fail {
                GateOnFail::Halt => {
                    return Err(EngineError::GateFailure {
                        phase: phase.name.clone(),
                        gate: gate.name.clone(),
                        observed,
                        threshold: gate.threshold,
                    });
                }
                GateOnFail::Pause => return Ok(Some(TerminalState::Paused { gate: result })),
                GateOnFail::Warn => {
                    tracing::warn!(
                        phase = %phase.name,
                        gate = %gate.name,
                        observed,
                        threshold = gate.threshold,
                        "gate below threshold (warn only)"
                    );
                }
            }
        }
        Ok(None)
    }

    /// Built-in counters from the store, merged with processor-contributed
    /// observed values. Persisted so gates stay re-evaluable at resume.
    async fn collect_metrics(
        &self,
        phase: &PhaseDef,
        outcome: &PhaseOutcome,
    ) -> Result<HashMap<String, f64>, EngineError> {
        let (done, errored) = self.store.item_counts(phase.name.clone()).await?;
        let total = outcome.total;
        let mut observed = HashMap::new();
        observed.insert(metrics::ITEMS_TOTAL.to_string(), total as f64);
        observed.insert(metrics::ITEMS_PROCESSED.to_string(), done as f64);
        observed.insert(metrics::ITEMS_ERRORED.to_string(), errored as f64);
        observed.insert(
            metrics::ERROR_RATIO.to_string(),
            if total == 0 {
                0.0
            } else {
                errored as f64 / total as f64
            },
        );
        observed.extend(phase.processor.metrics());
        Ok(observed)
    }

    async fn set_running(&self, current_phase: Option<String>) {
        self.status_tx.send_modify(|report| {
            report.status = RunStatus::Running;
            if current_phase.is_some() {
                report.current_phase = current_phase.clone();
            }
        });
        self.persist_status(RunStatus::Running).await;
    }

    async fn finish(
        &self,
        status: RunStatus,
        error: Option<String>,
        failed_gate: Option<GateResult>,
        resumable: bool,
    ) {
        // Persist before publishing: a caller woken by `wait()` must see the
        // registry and store already reflecting the terminal status.
        self.persist_status(status).await;
        self.status_tx.send_modify(|report| {
            report.status = status;
            report.error = error.clone();
            if let Some(gate) = &failed_gate {
                report.current_phase = Some(gate.phase.clone());
            }
            report.failed_gate = failed_gate.clone();
            report.resumable = resumable;
        });
    }

    async fn persist_status(&self, status: RunStatus) {
        if let Err(err) = self
            .store
            .set_meta(META_STATUS.into(), status.as_str().into())
            .await
        {
            tracing::error!(error = %err, "failed to persist run status");
        }
        if let Err(err) = self
            .registry
            .update_status(self.label.clone(), self.config_hash.clone(), status)
            .await
        {
            tracing::error!(error = %err, "failed to update registry status");
        }
    }
}
