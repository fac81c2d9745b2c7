//! ``src/tasks/fetch_task.rs``
//! ============================================================================
//! # Fetch Task: Background Job Runner
//!
//! Runs one coordinator job on the blocking pool behind the shared worker
//! semaphore and posts the outcome to the completion queue. The job never
//! touches tree or cache state; it only produces a value.

use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::controller::coordinator::{Completion, FetchKey, FetchOutcome};
use crate::error::LoaderError;

/// Work executed on a blocking worker.
pub type FetchJob = Box<dyn FnOnce() -> FetchOutcome + Send + 'static>;

/// Spawn `job` for `key`. A job whose token fires while it waits for a
/// permit is skipped and reports nothing.
pub(crate) fn spawn_fetch(
    runtime: &Handle,
    permits: Arc<Semaphore>,
    token: CancellationToken,
    key: FetchKey,
    generation: u64,
    job: FetchJob,
    completion_tx: mpsc::UnboundedSender<Completion>,
) {
    let span = info_span!("fetch_task", key = %key, generation);

    runtime.spawn(
        async move {
            let queued = Instant::now();

            let permit = tokio::select! {
                () = token.cancelled() => {
                    debug!(
                        marker = "FETCH_TASK",
                        operation_type = "fetch_skipped",
                        "Cancelled before start"
                    );
                    return;
                }
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            if token.is_cancelled() {
                return;
            }

            let started = Instant::now();
            let outcome = match tokio::task::spawn_blocking(job).await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    warn!(
                        marker = "FETCH_TASK",
                        operation_type = "fetch_panicked",
                        error = %join_error,
                        "Worker did not finish"
                    );
                    Err(LoaderError::other(format!("worker failed: {join_error}")))
                }
            };
            drop(permit);

            debug!(
                marker = "FETCH_TASK",
                operation_type = "fetch_complete",
                ok = outcome.is_ok(),
                queued_us = started.duration_since(queued).as_micros(),
                run_us = started.elapsed().as_micros(),
                "Fetch finished"
            );

            // Receiver gone means the session was dropped.
            let _ = completion_tx.send(Completion {
                key,
                generation,
                outcome: Arc::new(outcome),
            });
        }
        .instrument(span),
    );
}
