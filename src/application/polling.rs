//! Cancellable status polling for one submitted job.
//!
//! A poll loop issues at most one status request per tick and never overlaps
//! requests. Snapshots are handed to the caller through a delivery gate that
//! re-checks cancellation, so a response that lands after
//! [`PollToken::cancel`] returned is dropped on the floor.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PollingSettings;
use crate::domain::{JobHandle, JobState, JobStatus};

use super::error::PollingError;
use super::service::ConversionService;

pub(crate) const METRIC_POLL_TICKS: &str = "scan2ebook_poll_ticks_total";
pub(crate) const METRIC_POLL_FAILURES: &str = "scan2ebook_poll_failures_total";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;
pub const DEFAULT_STALL_TICKS: u32 = 150;
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

tokio::task_local! {
    // Address of the gate whose delivery is running on this task.
    static DELIVERING: usize;
}

/// Tunables for one poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Delay between status requests; the first request waits one interval.
    pub interval: Duration,
    /// Failed ticks tolerated in a row before the loop gives up. Zero makes
    /// the first failure fatal.
    pub max_consecutive_failures: u32,
    /// Give up after this many successful ticks without a progress change.
    pub stall_ticks: Option<NonZeroU32>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            stall_ticks: NonZeroU32::new(DEFAULT_STALL_TICKS),
        }
    }
}

impl PollSettings {
    pub fn with_interval(self, interval: Duration) -> Self {
        Self { interval, ..self }
    }
}

impl From<&PollingSettings> for PollSettings {
    fn from(settings: &PollingSettings) -> Self {
        Self {
            interval: settings.interval,
            max_consecutive_failures: settings.max_consecutive_failures,
            stall_ticks: settings.stall_ticks,
        }
    }
}

/// How a poll loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed(JobStatus),
    Failed(JobStatus),
    Cancelled,
    Abandoned(PollingError),
}

impl PollOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PollOutcome::Cancelled)
    }
}

/// Handle used to stop a poll loop early.
///
/// Cloning shares the same loop. Cancelling is idempotent.
#[derive(Debug, Clone, Default)]
pub struct PollToken {
    cancel: CancellationToken,
    gate: Arc<Mutex<()>>,
}

impl PollToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the loop. When this returns, no further delivery will start and
    /// any delivery running on another task has finished.
    ///
    /// Safe to call from inside the loop's own update callback.
    pub fn cancel(&self) {
        self.cancel.cancel();
        let inside_own_delivery = DELIVERING
            .try_with(|gate| *gate == self.gate_addr())
            .unwrap_or(false);
        if !inside_own_delivery {
            drop(self.gate.lock().unwrap_or_else(PoisonError::into_inner));
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Run `f` unless the token is cancelled. Cancellation cannot interleave
    /// with a running `f`.
    pub(crate) fn deliver<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let _guard = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if self.cancel.is_cancelled() {
            return None;
        }
        Some(DELIVERING.sync_scope(self.gate_addr(), f))
    }

    /// Whether both tokens control the same loop.
    pub fn same_loop(&self, other: &PollToken) -> bool {
        self.gate_addr() == other.gate_addr()
    }

    fn gate_addr(&self) -> usize {
        Arc::as_ptr(&self.gate) as usize
    }
}

/// A spawned poll loop.
#[derive(Debug)]
pub struct PollTask {
    token: PollToken,
    join: JoinHandle<PollOutcome>,
}

impl PollTask {
    pub(crate) fn new(token: PollToken, join: JoinHandle<PollOutcome>) -> Self {
        Self { token, join }
    }

    pub fn token(&self) -> PollToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the loop to end.
    pub async fn outcome(self) -> PollOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => PollOutcome::Cancelled,
        }
    }
}

/// Spawn a poll loop for `handle` on the current runtime.
pub fn spawn_polling<S, F>(
    service: Arc<S>,
    handle: JobHandle,
    settings: PollSettings,
    on_update: F,
) -> PollTask
where
    S: ConversionService + ?Sized + 'static,
    F: FnMut(JobStatus) + Send + 'static,
{
    spawn_polling_with(
        service,
        handle,
        settings,
        PollToken::new(),
        on_update,
        |_, _| {},
    )
}

/// Like [`spawn_polling`], driven by a token the caller already holds and
/// with a hook that runs on the loop's task once it has ended, before the
/// outcome is published.
pub fn spawn_polling_with<S, F, G>(
    service: Arc<S>,
    handle: JobHandle,
    settings: PollSettings,
    token: PollToken,
    on_update: F,
    on_finish: G,
) -> PollTask
where
    S: ConversionService + ?Sized + 'static,
    F: FnMut(JobStatus) + Send + 'static,
    G: FnOnce(&PollOutcome, &PollToken) + Send + 'static,
{
    let loop_token = token.clone();
    let join = tokio::spawn(async move {
        let outcome =
            poll_job(service.as_ref(), &handle, &settings, &loop_token, on_update).await;
        on_finish(&outcome, &loop_token);
        outcome
    });
    PollTask::new(token, join)
}

/// Poll `handle` until it reaches a terminal state, the token is cancelled,
/// or the loop gives up.
///
/// `on_update` sees every applied snapshot exactly once, the terminal one
/// included.
pub async fn poll_job<S, F>(
    service: &S,
    handle: &JobHandle,
    settings: &PollSettings,
    token: &PollToken,
    mut on_update: F,
) -> PollOutcome
where
    S: ConversionService + ?Sized,
    F: FnMut(JobStatus),
{
    // tokio rejects a zero period.
    let period = settings.interval.max(MIN_POLL_INTERVAL);
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut failures = 0_u32;
    let mut last_progress: Option<u8> = None;
    let mut unchanged_ticks = 0_u32;

    info!(
        task_id = %handle,
        interval_ms = period.as_millis() as u64,
        "polling job status"
    );

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => return PollOutcome::Cancelled,
            _ = ticker.tick() => {}
        }
        counter!(METRIC_POLL_TICKS).increment(1);

        let result = tokio::select! {
            biased;
            () = token.cancelled() => return PollOutcome::Cancelled,
            result = service.status(handle) => result,
        };

        let status = match result {
            Ok(status) => {
                failures = 0;
                status
            }
            Err(err) if err.is_not_found() => {
                warn!(task_id = %handle, error = %err, "service does not know this job");
                return PollOutcome::Abandoned(PollingError::UnknownJob(handle.to_string()));
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                counter!(METRIC_POLL_FAILURES).increment(1);
                if failures > settings.max_consecutive_failures {
                    warn!(task_id = %handle, attempts = failures, error = %err, "giving up on status polling");
                    return PollOutcome::Abandoned(PollingError::RetriesExhausted {
                        attempts: failures,
                        last: err.to_string(),
                    });
                }
                debug!(task_id = %handle, attempt = failures, error = %err, "status poll failed, retrying next tick");
                continue;
            }
        };

        if !status.is_terminal() && last_progress.is_some_and(|last| status.progress() < last) {
            debug!(
                task_id = %handle,
                progress = status.progress(),
                "ignoring status snapshot older than the last applied one"
            );
            continue;
        }

        if last_progress == Some(status.progress()) {
            unchanged_ticks = unchanged_ticks.saturating_add(1);
        } else {
            unchanged_ticks = 0;
        }
        last_progress = Some(status.progress());

        debug!(
            task_id = %handle,
            state = %status.state(),
            progress = status.progress(),
            "status snapshot"
        );

        let state = status.state();
        let terminal = status.is_terminal().then(|| status.clone());
        if token.deliver(|| on_update(status)).is_none() {
            return PollOutcome::Cancelled;
        }

        if let Some(snapshot) = terminal {
            info!(task_id = %handle, state = %state, "job reached a terminal state");
            return match state {
                JobState::Completed => PollOutcome::Completed(snapshot),
                _ => PollOutcome::Failed(snapshot),
            };
        }

        if let Some(limit) = settings.stall_ticks {
            if unchanged_ticks >= limit.get() {
                warn!(task_id = %handle, ticks = unchanged_ticks, "job stopped making progress");
                return PollOutcome::Abandoned(PollingError::Stalled {
                    ticks: unchanged_ticks,
                });
            }
        }
    }
}
