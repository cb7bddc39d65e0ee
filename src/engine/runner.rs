//! Phase execution: the concurrency-bounded, checkpoint-aware, interrupt-aware
//! item loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::checkpoint::{CheckpointStore, ItemRecord};
use crate::errors::EngineError;
use crate::events::{EventBus, RunEvent};
use crate::limiter::RateLimiter;
use crate::phase::{ItemProcessor, PhaseOutcome, WorkItem};
use crate::retry::{RetryPolicy, with_timeout};
use crate::signals::CancelToken;

/// Executes one phase's items at most once across the run's lifetime.
pub struct PhaseRunner {
    store: CheckpointStore,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    call_timeout: Duration,
    cancel: CancelToken,
    events: EventBus,
}

impl PhaseRunner {
    pub fn new(
        store: CheckpointStore,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        call_timeout: Duration,
        cancel: CancelToken,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            limiter,
            retry,
            call_timeout,
            cancel,
            events,
        }
    }

    /// Run `items` through `processor`, at most `concurrency` at a time.
    ///
    /// Items already holding a terminal result in the checkpoint store are
    /// excluded up front — this is what makes resume cheap. Each item's
    /// result is durably recorded as it completes; there is no write
    /// batching.
    ///
    /// Soft cancellation stops dispatching and drains in-flight items to
    /// durable records. Hard cancellation aborts in-flight items, forfeiting
    /// any result not yet written.
    pub async fn run(
        &self,
        phase: &str,
        items: Vec<WorkItem>,
        processor: Arc<dyn ItemProcessor>,
        concurrency: usize,
    ) -> Result<PhaseOutcome, EngineError> {
        let total = items.len();
        let done_ids = self.store.processed_item_ids(phase.to_string()).await?;
        let pending: Vec<WorkItem> = items
            .into_iter()
            .filter(|item| !done_ids.contains(&item.id))
            .collect();
        let skipped = total - pending.len();

        tracing::info!(
            phase,
            total,
            skipped,
            pending = pending.len(),
            concurrency,
            "entering phase item loop"
        );

        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let completed = Arc::new(AtomicUsize::new(skipped));
        let processed = Arc::new(AtomicUsize::new(0));
        let errored = Arc::new(AtomicUsize::new(0));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut dispatched_all = true;

        for item in pending {
            // Cooperative check at the dispatch boundary: any cancellation
            // tier stops new dispatch.
            if self.cancel.is_cancelled() {
                dispatched_all = false;
                break;
            }
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                () = self.cancel.cancelled() => {
                    dispatched_all = false;
                    break;
                }
            };

            let store = self.store.clone();
            let limiter = self.limiter.clone();
            let retry = self.retry.clone();
            let events = self.events.clone();
            let processor = processor.clone();
            let phase = phase.to_string();
            let call_timeout = self.call_timeout;
            let completed = completed.clone();
            let processed = processed.clone();
            let errored = errored.clone();

            tasks.spawn(async move {
                let _permit = permit;
                if let Err(err) = limiter.acquire(processor.tier()).await {
                    // Tiers are validated at start; reaching this means the
                    // processor changed its tier mid-run.
                    tracing::error!(item = %item.id, error = %err, "rate tier rejected");
                    return;
                }

                let result = retry
                    .run(|| with_timeout(call_timeout, processor.process(&item)))
                    .await;
                let record = match result {
                    Ok(payload) => ItemRecord::done(item.id.clone(), payload),
                    Err(err) => {
                        tracing::warn!(item = %item.id, error = %err, "item failed after retries");
                        ItemRecord::error(item.id.clone(), &err.to_string())
                    }
                };
                let was_error = record.status == crate::checkpoint::ItemStatus::Error;

                // Durable write before the result leaves memory.
                if let Err(err) = store.record_item(phase.clone(), record).await {
                    tracing::error!(item = %item.id, error = %err, "failed to record item result");
                    return;
                }
                if was_error {
                    errored.fetch_add(1, Ordering::SeqCst);
                } else {
                    processed.fetch_add(1, Ordering::SeqCst);
                }
                let done_so_far = completed.fetch_add(1, Ordering::SeqCst) + 1;
                events.emit(RunEvent::ItemProgress {
                    phase,
                    completed: done_so_far,
                    total,
                });
            });
        }

        // Drain in-flight work. Soft cancellation lets it finish; hard
        // cancellation aborts it.
        let mut aborted = self.cancel.is_hard();
        if aborted {
            tasks.abort_all();
        }
        loop {
            tokio::select! {
                next = tasks.join_next() => match next {
                    None => break,
                    Some(_) => {}
                },
                () = self.cancel.hard_cancelled(), if !aborted => {
                    aborted = true;
                    tasks.abort_all();
                }
            }
        }

        let outcome = PhaseOutcome {
            total,
            skipped,
            processed: processed.load(Ordering::SeqCst),
            errored: errored.load(Ordering::SeqCst),
            partial: !dispatched_all || aborted,
            aborted,
        };
        tracing::info!(
            phase,
            processed = outcome.processed,
            errored = outcome.errored,
            partial = outcome.partial,
            "phase item loop finished"
        );
        Ok(outcome)
    }
}
