//! Cooperative two-tier cancellation.
//!
//! Interruption is modeled as an explicit token with two discrete states —
//! soft (finish in-flight work, stop dispatching) and hard (abort in-flight
//! work, forfeit unwritten results) — checked cooperatively at dispatch
//! boundaries. Raw signal deliveries escalate soft → hard, with repeats
//! inside a debounce window treated as duplicates of one delivery.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Current cancellation state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelState {
    #[default]
    None,
    Soft,
    Hard,
}

/// Cancellation tier requested through the handle API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelMode {
    Soft,
    Hard,
}

/// Shared cancellation token threaded through a run.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<CancelState>>,
    rx: watch::Receiver<CancelState>,
    debounce: Duration,
    last_signal: Arc<Mutex<Option<Instant>>>,
}

impl CancelToken {
    pub fn new(debounce: Duration) -> Self {
        let (tx, rx) = watch::channel(CancelState::None);
        Self {
            tx: Arc::new(tx),
            rx,
            debounce,
            last_signal: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> CancelState {
        *self.tx.borrow()
    }

    /// Any cancellation tier has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.state() != CancelState::None
    }

    pub fn is_hard(&self) -> bool {
        self.state() == CancelState::Hard
    }

    /// Request a specific tier. Soft never downgrades hard.
    pub fn request(&self, mode: CancelMode) {
        self.tx.send_modify(|state| match mode {
            CancelMode::Soft => {
                if *state == CancelState::None {
                    *state = CancelState::Soft;
                }
            }
            CancelMode::Hard => *state = CancelState::Hard,
        });
    }

    /// Record one raw interrupt delivery: first escalates to soft, a later
    /// distinct delivery escalates to hard. Deliveries within the debounce
    /// window of the previous one are duplicates and ignored.
    pub fn signal(&self) {
        let now = Instant::now();
        {
            let mut last = self
                .last_signal
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(previous) = *last {
                if now.duration_since(previous) < self.debounce {
                    return;
                }
            }
            *last = Some(now);
        }
        self.tx.send_modify(|state| {
            *state = match *state {
                CancelState::None => CancelState::Soft,
                CancelState::Soft | CancelState::Hard => CancelState::Hard,
            }
        });
    }

    /// Resolves once any cancellation tier is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() != CancelState::None {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender lives as long as this token; unreachable in practice.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Resolves once hard cancellation is requested.
    pub async fn hard_cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() == CancelState::Hard {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
