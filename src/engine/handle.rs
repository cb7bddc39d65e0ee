//! Caller-facing handle to a running (or halted) run.

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::events::{EventBus, RunEvent};
use crate::gates::GateResult;
use crate::phase::RunStatus;
use crate::signals::{CancelMode, CancelToken};

/// Inspectable snapshot of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub label: String,
    pub config_hash: String,
    pub status: RunStatus,
    /// Phase currently executing, or the phase the run halted in.
    pub current_phase: Option<String>,
    /// The gate that halted or paused the run, with observed-vs-threshold
    /// values.
    pub failed_gate: Option<GateResult>,
    pub error: Option<String>,
    /// Whether re-running `start` with the same identity is safe. False only
    /// after a resume-integrity failure, which requires manual inspection of
    /// the store first.
    pub resumable: bool,
}

impl StatusReport {
    pub fn pending(label: &str, config_hash: &str) -> Self {
        Self {
            label: label.to_string(),
            config_hash: config_hash.to_string(),
            status: RunStatus::Pending,
            current_phase: None,
            failed_gate: None,
            error: None,
            resumable: true,
        }
    }
}

/// Handle to a run: status, cancellation, and the progress event stream.
///
/// Cheap to clone; all clones observe the same run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    status_rx: watch::Receiver<StatusReport>,
    events: EventBus,
    cancel: CancelToken,
}

impl RunHandle {
    pub(crate) fn new(
        status_rx: watch::Receiver<StatusReport>,
        events: EventBus,
        cancel: CancelToken,
    ) -> Self {
        Self {
            status_rx,
            events,
            cancel,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status_rx.borrow().status
    }

    /// Full inspection snapshot: which phase, which gate failed (if any),
    /// whether resume is safe.
    pub fn report(&self) -> StatusReport {
        self.status_rx.borrow().clone()
    }

    pub fn label(&self) -> String {
        self.status_rx.borrow().label.clone()
    }

    pub fn config_hash(&self) -> String {
        self.status_rx.borrow().config_hash.clone()
    }

    /// Subscribe to the progress event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Request cancellation at a specific tier.
    pub fn cancel(&self, mode: CancelMode) {
        self.cancel.request(mode);
    }

    /// Deliver one raw interrupt: the first escalates to soft cancellation,
    /// a later distinct delivery to hard.
    pub fn signal_interrupt(&self) {
        self.cancel.signal();
    }

    /// Wait until the run reaches a terminal status and return the final
    /// report.
    pub async fn wait(&self) -> StatusReport {
        let mut rx = self.status_rx.clone();
        loop {
            {
                let report = rx.borrow_and_update();
                if report.status.is_terminal() {
                    return report.clone();
                }
            }
            if rx.changed().await.is_err() {
                // Driver gone without a terminal status; return what we have.
                return rx.borrow().clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_resolves_on_terminal_status() {
        let (tx, rx) = watch::channel(StatusReport::pending("demo", "abc"));
        let handle = RunHandle::new(
            rx,
            EventBus::default(),
            CancelToken::new(std::time::Duration::ZERO),
        );

        assert_eq!(handle.status(), RunStatus::Pending);

        tokio::spawn(async move {
            tx.send_modify(|r| r.status = RunStatus::Running);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            tx.send_modify(|r| r.status = RunStatus::Completed);
            // Keep the sender alive until the waiter observes the change.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        });

        let report = handle.wait().await;
        assert_eq!(report.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_flows_through_to_the_token() {
        let (_tx, rx) = watch::channel(StatusReport::pending("demo", "abc"));
        let cancel = CancelToken::new(std::time::Duration::ZERO);
        let handle = RunHandle::new(rx, EventBus::default(), cancel.clone());

        handle.cancel(CancelMode::Soft);
        assert!(cancel.is_cancelled());
        handle.cancel(CancelMode::Hard);
        assert!(cancel.is_hard());
    }

    #[test]
    fn report_exposes_identity() {
        let (_tx, rx) = watch::channel(StatusReport::pending("demo", "abc123"));
        let handle = RunHandle::new(
            rx,
            EventBus::default(),
            CancelToken::new(std::time::Duration::ZERO),
        );
        assert_eq!(handle.label(), "demo");
        assert_eq!(handle.config_hash(), "abc123");
        assert!(handle.report().resumable);
    }
}
