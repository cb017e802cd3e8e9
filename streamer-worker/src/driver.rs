use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use streamer_common::Entry;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::WorkerError;
use crate::unpack::BufferedEntries;

type StepResult = Result<u64, WorkerError>;

/// Number of workers to use when none is configured: one per available processing unit.
pub fn default_concurrency() -> NonZeroUsize {
    match std::thread::available_parallelism() {
        Ok(parallelism) => parallelism,
        Err(error) => {
            warn!(%error, "could not determine available parallelism, using a single worker");
            NonZeroUsize::MIN
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DriverOptions {
    /// Maximum number of steps in flight at once.
    pub workers: NonZeroUsize,
    /// How long claimed entries may keep being worked on once claiming has stopped.
    pub shutdown_timeout: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            workers: default_concurrency(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Dispatch every entry of `entries` with at most `options.workers` steps running at once.
///
/// Entries are claimed one at a time, in stream order, and each claimed entry is dispatched on
/// its own task. Claiming stops on the first step failure, the first fetch failure, or once
/// `shutdown` is cancelled. No more entries are fetched after that, but the ones already
/// fetched and still buffered in `entries` are dispatched too: the store has assigned them to
/// this consumer and would otherwise lose track of them when the consumer leaves its group.
/// Steps still running after `options.shutdown_timeout` are aborted.
///
/// Returns the failure that stopped claiming. If claiming stopped because of `shutdown`, the
/// first failure observed while finishing up is returned instead, if any.
pub async fn drive<S>(
    mut entries: S,
    dispatcher: Arc<Dispatcher>,
    options: DriverOptions,
    shutdown: CancellationToken,
) -> Result<(), WorkerError>
where
    S: BufferedEntries,
{
    let workers = options.workers.get();
    let semaphore = Arc::new(Semaphore::new(workers));
    let report_semaphore_utilization = || {
        metrics::gauge!("streamer_worker_saturation_percent")
            .set(1f64 - semaphore.available_permits() as f64 / workers as f64);
    };

    let mut in_flight: JoinSet<StepResult> = JoinSet::new();

    let outcome = loop {
        report_semaphore_utilization();

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("shutdown requested, no longer claiming entries");
                break Ok(());
            }

            Some(joined) = in_flight.join_next() => {
                if let Err(error) = flatten_step(joined) {
                    break Err(error);
                }
            }

            (permit, next) = claim(&semaphore, &mut entries) => match next {
                Some(Ok(entry)) => {
                    metrics::counter!("streamer_entries_claimed_total").increment(1);
                    spawn_step(&mut in_flight, dispatcher.clone(), entry, permit);
                }
                Some(Err(error)) => break Err(WorkerError::Fetch(error)),
                None => break Err(WorkerError::StreamEnded),
            },
        }
    };

    if let Err(error) = &outcome {
        error!(%error, "stopped claiming entries");
    }

    let buffered = entries.take_buffered();
    let drained = drain(
        &mut in_flight,
        &semaphore,
        &dispatcher,
        buffered,
        options.shutdown_timeout,
    )
    .await;
    report_semaphore_utilization();

    match (outcome, drained) {
        (Ok(()), Some(error)) => Err(error),
        (outcome, _) => outcome,
    }
}

/// Wait for a free worker, then claim the next entry for it.
async fn claim<S>(
    semaphore: &Arc<Semaphore>,
    entries: &mut S,
) -> (OwnedSemaphorePermit, Option<S::Item>)
where
    S: Stream + Unpin,
{
    let permit = semaphore
        .clone()
        .acquire_owned()
        .await
        .expect("semaphore has been closed");

    let next = entries.next().await;

    (permit, next)
}

fn spawn_step(
    in_flight: &mut JoinSet<StepResult>,
    dispatcher: Arc<Dispatcher>,
    entry: Entry,
    permit: OwnedSemaphorePermit,
) {
    in_flight.spawn(async move {
        let started = Instant::now();
        let result = dispatcher.dispatch(entry).await;
        metrics::histogram!("streamer_step_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        drop(permit);

        result
    });
}

/// Let the running steps finish and dispatch the `buffered` entries, still bounded by the
/// semaphore. Whatever has not finished after `timeout` is aborted.
/// Returns the first failure among the steps that finished.
async fn drain(
    in_flight: &mut JoinSet<StepResult>,
    semaphore: &Arc<Semaphore>,
    dispatcher: &Arc<Dispatcher>,
    buffered: Vec<Entry>,
    timeout: Duration,
) -> Option<WorkerError> {
    if in_flight.is_empty() && buffered.is_empty() {
        return None;
    }

    info!(
        in_flight = in_flight.len(),
        buffered = buffered.len(),
        "finishing claimed entries"
    );

    let mut buffered = buffered.into_iter();
    let mut first_failure = None;
    let finished = tokio::time::timeout(timeout, async {
        loop {
            tokio::select! {
                biased;

                Some(joined) = in_flight.join_next() => {
                    if let Err(error) = flatten_step(joined) {
                        error!(%error, "step failed while draining");
                        first_failure.get_or_insert(error);
                    }
                }

                Ok(permit) = semaphore.clone().acquire_owned(), if !buffered.as_slice().is_empty() => {
                    if let Some(entry) = buffered.next() {
                        metrics::counter!("streamer_entries_claimed_total").increment(1);
                        spawn_step(in_flight, dispatcher.clone(), entry, permit);
                    }
                }

                else => break,
            }
        }
    })
    .await;

    if finished.is_err() {
        warn!(
            aborted = in_flight.len(),
            undispatched = buffered.len(),
            timeout_ms = timeout.as_millis() as u64,
            "claimed entries did not finish in time, aborting them"
        );
        in_flight.shutdown().await;
    }

    first_failure
}

fn flatten_step(joined: Result<StepResult, JoinError>) -> StepResult {
    joined?
}
