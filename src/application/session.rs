//! The job lifecycle client: one submission, one poll loop, one observable
//! phase.
//!
//! Every transition goes through [`JobSubmissionClient`]; the phase is
//! published on a `watch` channel so a presentation layer can follow along
//! without sharing mutable state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use metrics::{counter, histogram};
use tokio::sync::watch;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::{JobHandle, JobRequest, JobState, JobStatus};
use crate::util::bytes::human_size;

use super::error::{MALFORMED_MESSAGE, ServiceError, SubmissionError, failed_job_message};
use super::polling::{PollOutcome, PollSettings, PollTask, PollToken, spawn_polling_with};
use super::service::ConversionService;

pub(crate) const METRIC_JOBS_SUBMITTED: &str = "scan2ebook_jobs_submitted_total";
pub(crate) const METRIC_SUBMISSION_FAILURES: &str = "scan2ebook_submission_failures_total";
pub(crate) const METRIC_UPLOAD_BYTES: &str = "scan2ebook_upload_bytes";

/// Observable lifecycle of the client's current job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPhase {
    Idle,
    Submitting,
    Submitted {
        handle: JobHandle,
    },
    Polling {
        handle: JobHandle,
        progress: u8,
        message: String,
    },
    Success {
        handle: JobHandle,
        /// Absolute URL of the finished eBook.
        download_url: String,
        summary: Option<String>,
        message: String,
    },
    Error {
        message: String,
    },
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Success { .. } | JobPhase::Error { .. })
    }

    pub fn handle(&self) -> Option<&JobHandle> {
        match self {
            JobPhase::Submitted { handle }
            | JobPhase::Polling { handle, .. }
            | JobPhase::Success { handle, .. } => Some(handle),
            JobPhase::Idle | JobPhase::Submitting | JobPhase::Error { .. } => None,
        }
    }
}

#[derive(Debug)]
struct ActivePoll {
    token: PollToken,
    task: Option<PollTask>,
}

/// Drives conversion jobs end to end against a [`ConversionService`].
///
/// At most one poll loop is alive per client; submitting, starting a new poll
/// loop, cancelling or resetting stops the previous one first.
pub struct JobSubmissionClient {
    service: Arc<dyn ConversionService>,
    settings: PollSettings,
    phase: Arc<watch::Sender<JobPhase>>,
    active: Mutex<Option<ActivePoll>>,
    // Bumped on every transition that supersedes in-flight work.
    epoch: AtomicU64,
}

impl JobSubmissionClient {
    pub fn new(service: Arc<dyn ConversionService>, settings: PollSettings) -> Self {
        let (phase, _) = watch::channel(JobPhase::Idle);
        Self {
            service,
            settings,
            phase: Arc::new(phase),
            active: Mutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    pub fn phase(&self) -> JobPhase {
        self.phase.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobPhase> {
        self.phase.subscribe()
    }

    /// Upload `request` and return the job handle. Does not start polling.
    ///
    /// Validation failures return early without touching the network or the
    /// phase.
    #[instrument(
        skip_all,
        fields(attempt = %Uuid::new_v4(), pages = request.pages().len())
    )]
    pub async fn submit(&self, request: &JobRequest) -> Result<JobHandle, SubmissionError> {
        request.validate()?;

        let epoch = self.supersede();
        self.phase.send_replace(JobPhase::Submitting);

        let payload = request.payload_len() as u64;
        histogram!(METRIC_UPLOAD_BYTES).record(payload as f64);
        info!(
            title = request.effective_title(),
            cover = request.cover().is_some(),
            size = %human_size(payload),
            "submitting conversion job"
        );

        let result = self.service.submit(request).await.map_err(SubmissionError::from);
        let current = self.epoch.load(Ordering::SeqCst) == epoch;

        match &result {
            Ok(handle) => {
                counter!(METRIC_JOBS_SUBMITTED).increment(1);
                info!(task_id = %handle, "conversion job accepted");
                if current {
                    self.phase.send_replace(JobPhase::Submitted {
                        handle: handle.clone(),
                    });
                }
            }
            Err(err) => {
                counter!(METRIC_SUBMISSION_FAILURES).increment(1);
                warn!(error = %err, "conversion job submission failed");
                if current {
                    self.phase.send_replace(JobPhase::Error {
                        message: err.user_message(),
                    });
                }
            }
        }

        if !current {
            info!("submission superseded before it finished; phase left untouched");
        }
        result
    }

    /// Start polling `handle` every `interval`. Each applied snapshot updates
    /// the phase and is then passed to `on_update`.
    pub fn start_polling<F>(&self, handle: JobHandle, interval: Duration, mut on_update: F) -> PollToken
    where
        F: FnMut(JobStatus) + Send + 'static,
    {
        self.epoch.fetch_add(1, Ordering::SeqCst);

        // Publish the new loop before stopping the old one so a concurrent
        // `cancel` always finds it.
        let token = PollToken::new();
        let previous = self.lock_active().replace(ActivePoll {
            token: token.clone(),
            task: None,
        });
        if let Some(previous) = previous {
            previous.token.cancel();
        }

        token.deliver(|| {
            self.phase.send_replace(JobPhase::Polling {
                handle: handle.clone(),
                progress: 0,
                message: String::new(),
            });
        });

        let settings = self.settings.with_interval(interval);
        let phase = Arc::clone(&self.phase);
        let resolver = Arc::clone(&self.service);
        let update_handle = handle.clone();
        let finish_phase = Arc::clone(&self.phase);

        let task = spawn_polling_with(
            Arc::clone(&self.service),
            handle,
            settings,
            token.clone(),
            move |status: JobStatus| {
                phase.send_replace(phase_for(&update_handle, &status, resolver.as_ref()));
                on_update(status);
            },
            move |outcome: &PollOutcome, token: &PollToken| {
                if let PollOutcome::Abandoned(err) = outcome {
                    token.deliver(|| {
                        finish_phase.send_replace(JobPhase::Error {
                            message: err.user_message(),
                        })
                    });
                }
            },
        );

        let mut active = self.lock_active();
        if let Some(active) = active.as_mut().filter(|active| active.token.same_loop(&token)) {
            active.task = Some(task);
        }
        token
    }

    /// Wait for the active poll loop to finish. `None` when nothing is
    /// polling or another caller is already waiting.
    pub async fn wait(&self) -> Option<PollOutcome> {
        let task = self.lock_active().as_mut().and_then(|active| active.task.take())?;
        Some(task.outcome().await)
    }

    /// Stop polling. A job that was still in flight returns the client to
    /// `Idle`; a finished one keeps its terminal phase.
    pub fn cancel(&self) {
        self.supersede();
        self.phase.send_if_modified(|phase| {
            if phase.is_terminal() || *phase == JobPhase::Idle {
                false
            } else {
                *phase = JobPhase::Idle;
                true
            }
        });
    }

    /// Stop polling and forget the current job.
    pub fn reset(&self) {
        self.supersede();
        self.phase.send_replace(JobPhase::Idle);
    }

    /// Fetch the finished eBook. `None` unless the phase is `Success`.
    pub async fn download_artifact(&self) -> Result<Option<Bytes>, ServiceError> {
        let url = match &*self.phase.borrow() {
            JobPhase::Success { download_url, .. } => download_url.clone(),
            _ => return Ok(None),
        };
        self.service.download(&url).await.map(Some)
    }

    /// Cancel the active loop and invalidate in-flight submissions.
    fn supersede(&self) -> u64 {
        // The gate wait in `cancel` must not happen under the `active` lock.
        let previous = self.lock_active().take();
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActivePoll>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for JobSubmissionClient {
    fn drop(&mut self) {
        let previous = self
            .active
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            previous.token.cancel();
        }
    }
}

fn phase_for(handle: &JobHandle, status: &JobStatus, service: &dyn ConversionService) -> JobPhase {
    match status.state() {
        JobState::Pending | JobState::Processing => JobPhase::Polling {
            handle: handle.clone(),
            progress: status.progress(),
            message: status.message().to_owned(),
        },
        JobState::Completed => match status.artifact() {
            Some(artifact) => JobPhase::Success {
                handle: handle.clone(),
                download_url: service.artifact_url(&artifact.download_url),
                summary: artifact.summary.clone(),
                message: status.message().to_owned(),
            },
            None => JobPhase::Error {
                message: MALFORMED_MESSAGE.to_owned(),
            },
        },
        JobState::Failed => JobPhase::Error {
            message: failed_job_message(status.message()),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio::time;

    use super::*;
    use crate::application::error::{CONNECTION_LOST_MESSAGE, UNREACHABLE_MESSAGE};
    use crate::application::testing::{
        FAKE_BASE, ScriptedService, Step, completed, failed, running,
    };
    use crate::domain::{PageImage, ValidationError};

    const INTERVAL: Duration = Duration::from_secs(2);

    fn settings() -> PollSettings {
        PollSettings {
            interval: INTERVAL,
            max_consecutive_failures: 3,
            stall_ticks: None,
        }
    }

    fn client(service: &Arc<ScriptedService>) -> JobSubmissionClient {
        let service: Arc<dyn ConversionService> = service.clone();
        JobSubmissionClient::new(service, settings())
    }

    fn pages(names: &[&str]) -> Vec<PageImage> {
        names
            .iter()
            .map(|name| PageImage::guessed(*name, name.as_bytes().to_vec()))
            .collect()
    }

    fn recorder() -> (Arc<StdMutex<Vec<JobStatus>>>, impl FnMut(JobStatus) + Send + 'static) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |status| sink.lock().expect("lock").push(status))
    }

    #[tokio::test(start_paused = true)]
    async fn three_pages_convert_to_a_download_link() {
        let service = Arc::new(ScriptedService::with_steps([
            Step::ok(running(40)),
            Step::ok(completed("/files/abc.epub")),
        ]));
        service.push_submission(Ok(JobHandle::new("abc")));
        let client = client(&service);

        let request = JobRequest::new(pages(&["p1.png", "p2.png", "p3.png"])).with_title("Ch1");
        let handle = client.submit(&request).await.expect("submitted");
        assert_eq!(handle.as_str(), "abc");
        assert_eq!(client.phase(), JobPhase::Submitted { handle: handle.clone() });

        let (seen, on_update) = recorder();
        client.start_polling(handle, INTERVAL, on_update);
        let outcome = client.wait().await.expect("active poll");

        assert!(matches!(outcome, PollOutcome::Completed(_)));
        assert_eq!(
            client.phase(),
            JobPhase::Success {
                handle: JobHandle::new("abc"),
                download_url: format!("{FAKE_BASE}/files/abc.epub"),
                summary: Some("A short book.".into()),
                message: "done".into(),
            }
        );
        assert_eq!(seen.lock().expect("lock").len(), 2);

        let submitted = service.submitted();
        let names: Vec<&str> = submitted[0].pages().iter().map(PageImage::file_name).collect();
        assert_eq!(names, ["p1.png", "p2.png", "p3.png"]);
        assert_eq!(submitted[0].effective_title(), "Ch1");

        time::sleep(INTERVAL * 10).await;
        assert_eq!(service.status_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_selection_is_rejected_locally() {
        let service = Arc::new(ScriptedService::default());
        let client = client(&service);

        let err = client
            .submit(&JobRequest::new(Vec::new()).with_title("Ch1"))
            .await
            .expect_err("no pages");

        assert_eq!(err, SubmissionError::Validation(ValidationError::NoPages));
        assert_eq!(service.submit_calls(), 0);
        assert_eq!(service.status_calls(), 0);
        assert_eq!(client.phase(), JobPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn unparseable_content_type_is_rejected_locally() {
        let service = Arc::new(ScriptedService::default());
        let client = client(&service);
        let request = JobRequest::new(vec![PageImage::new("p1.png", "not a mime", vec![1_u8])]);

        let err = client.submit(&request).await.expect_err("bad content type");

        assert_eq!(
            err,
            SubmissionError::Validation(ValidationError::invalid_content_type("p1.png", "not a mime"))
        );
        assert_eq!(service.submit_calls(), 0);
        assert_eq!(client.phase(), JobPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_timeout_then_failed_status_reports_service_message() {
        let service = Arc::new(ScriptedService::with_steps([
            Step::err(ServiceError::unreachable("operation timed out")),
            Step::ok(failed("OCR failed")),
        ]));
        let client = client(&service);
        let handle = client
            .submit(&JobRequest::new(pages(&["p1.png"])))
            .await
            .expect("submitted");

        let (seen, on_update) = recorder();
        client.start_polling(handle.clone(), INTERVAL, on_update);

        time::sleep(INTERVAL + Duration::from_millis(500)).await;
        assert_eq!(service.status_calls(), 1);
        assert_eq!(
            client.phase(),
            JobPhase::Polling {
                handle,
                progress: 0,
                message: String::new()
            }
        );

        let outcome = client.wait().await.expect("active poll");
        assert!(matches!(outcome, PollOutcome::Failed(_)));
        assert_eq!(
            client.phase(),
            JobPhase::Error {
                message: "OCR failed".into()
            }
        );
        assert_eq!(seen.lock().expect("lock").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_submission_enters_error_phase() {
        let service = Arc::new(ScriptedService::default());
        service.push_submission(Err(ServiceError::rejected(413, "Too many pages")));
        let client = client(&service);

        let err = client
            .submit(&JobRequest::new(pages(&["p1.png"])))
            .await
            .expect_err("rejected");

        assert!(matches!(err, SubmissionError::ServiceRejected { status: 413, .. }));
        assert_eq!(
            client.phase(),
            JobPhase::Error {
                message: "Too many pages".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_submission_uses_connectivity_message() {
        let service = Arc::new(ScriptedService::default());
        service.push_submission(Err(ServiceError::unreachable("dns failure")));
        let client = client(&service);

        client
            .submit(&JobRequest::new(pages(&["p1.png"])))
            .await
            .expect_err("unreachable");

        assert_eq!(
            client.phase(),
            JobPhase::Error {
                message: UNREACHABLE_MESSAGE.into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_surfaces_after_retry_ceiling() {
        let service = Arc::new(ScriptedService::default());
        let client = client(&service);
        let handle = client
            .submit(&JobRequest::new(pages(&["p1.png"])))
            .await
            .expect("submitted");

        let (seen, on_update) = recorder();
        client.start_polling(handle, INTERVAL, on_update);
        let outcome = client.wait().await.expect("active poll");

        assert!(matches!(outcome, PollOutcome::Abandoned(_)));
        assert_eq!(service.status_calls(), 4);
        assert!(seen.lock().expect("lock").is_empty());
        assert_eq!(
            client.phase(),
            JobPhase::Error {
                message: CONNECTION_LOST_MESSAGE.into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn new_submission_cancels_previous_loop() {
        let service = Arc::new(ScriptedService::with_steps([Step::delayed(
            Duration::from_secs(5),
            Ok(running(40)),
        )]));
        service.push_submission(Ok(JobHandle::new("first")));
        service.push_submission(Ok(JobHandle::new("second")));
        let client = client(&service);

        let first = client
            .submit(&JobRequest::new(pages(&["p1.png"])))
            .await
            .expect("first");
        let (seen, on_update) = recorder();
        let first_token = client.start_polling(first, INTERVAL, on_update);

        // The first loop's request is in flight when the new job is submitted.
        time::sleep(INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(service.status_calls(), 1);

        let second = client
            .submit(&JobRequest::new(pages(&["p2.png"])))
            .await
            .expect("second");
        assert!(first_token.is_cancelled());

        time::sleep(Duration::from_secs(30)).await;
        assert!(seen.lock().expect("lock").is_empty());
        assert_eq!(client.phase(), JobPhase::Submitted { handle: second });
        assert_eq!(service.status_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn starting_a_second_loop_stops_the_first() {
        let service = Arc::new(ScriptedService::with_steps([
            Step::ok(running(10)),
            Step::ok(running(20)),
            Step::ok(completed("/files/b.epub")),
        ]));
        let client = client(&service);

        let first = client.start_polling(JobHandle::new("a"), INTERVAL, |_| {});
        let second = client.start_polling(JobHandle::new("b"), INTERVAL, |_| {});
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        client.wait().await.expect("active poll");
        assert!(
            service
                .polled()
                .iter()
                .all(|handle| handle.as_str() == "b")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_returns_to_idle_and_discards_late_response() {
        let service = Arc::new(ScriptedService::with_steps([Step::delayed(
            Duration::from_secs(5),
            Ok(completed("/files/late.epub")),
        )]));
        let client = client(&service);
        let (seen, on_update) = recorder();
        let token = client.start_polling(JobHandle::new("abc"), INTERVAL, on_update);

        time::sleep(INTERVAL + Duration::from_secs(1)).await;
        client.cancel();
        client.cancel();

        assert!(token.is_cancelled());
        assert_eq!(client.phase(), JobPhase::Idle);
        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(client.phase(), JobPhase::Idle);
        assert!(seen.lock().expect("lock").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_observe_progress_in_order() {
        let service = Arc::new(ScriptedService::with_steps([
            Step::ok(running(25)),
            Step::ok(running(75)),
            Step::ok(completed("/files/abc.epub")),
        ]));
        let client = client(&service);
        let mut phases = client.subscribe();

        client.start_polling(JobHandle::new("abc"), INTERVAL, |_| {});
        let mut progress = Vec::new();
        loop {
            phases.changed().await.expect("sender alive");
            let phase = phases.borrow_and_update().clone();
            match phase {
                JobPhase::Polling { progress: p, .. } => progress.push(p),
                JobPhase::Success { .. } => break,
                other => panic!("unexpected phase {other:?}"),
            }
        }
        assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(progress.last(), Some(&75));
    }

    #[tokio::test(start_paused = true)]
    async fn download_requires_success() {
        let service = Arc::new(ScriptedService::with_steps([Step::ok(completed(
            "/files/abc.epub",
        ))]));
        let client = client(&service);
        assert_eq!(client.download_artifact().await, Ok(None));

        client.start_polling(JobHandle::new("abc"), INTERVAL, |_| {});
        client.wait().await.expect("active poll");

        let bytes = client.download_artifact().await.expect("download");
        assert_eq!(
            bytes.as_deref(),
            Some(format!("epub bytes for {FAKE_BASE}/files/abc.epub").as_bytes())
        );

        client.reset();
        assert_eq!(client.phase(), JobPhase::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn outside_cancel_while_update_resets_does_not_deadlock() {
        let service = Arc::new(ScriptedService::with_steps([Step::ok(running(10))]));
        let client = Arc::new(client(&service));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let inner = Arc::downgrade(&client);

        client.start_polling(
            JobHandle::new("abc"),
            Duration::from_millis(20),
            move |_status| {
                let _ = entered_tx.send(());
                std::thread::sleep(Duration::from_millis(300));
                if let Some(client) = inner.upgrade() {
                    client.reset();
                }
            },
        );

        let outside = Arc::clone(&client);
        let cancelled = tokio::task::spawn_blocking(move || {
            entered_rx.recv().expect("update started");
            outside.cancel();
        });

        time::timeout(Duration::from_secs(5), cancelled)
            .await
            .expect("cancel returned")
            .expect("cancel thread");
        assert_eq!(client.phase(), JobPhase::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn outside_cancel_while_update_restarts_polling_does_not_deadlock() {
        let service = Arc::new(ScriptedService::with_steps([
            Step::ok(running(10)),
            Step::ok(running(20)),
        ]));
        let client = Arc::new(client(&service));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let inner = Arc::downgrade(&client);

        client.start_polling(
            JobHandle::new("abc"),
            Duration::from_millis(20),
            move |_status| {
                let _ = entered_tx.send(());
                std::thread::sleep(Duration::from_millis(300));
                if let Some(client) = inner.upgrade() {
                    client.start_polling(JobHandle::new("def"), Duration::from_secs(60), |_| {});
                }
            },
        );

        let outside = Arc::clone(&client);
        let cancelled = tokio::task::spawn_blocking(move || {
            entered_rx.recv().expect("update started");
            outside.cancel();
        });

        time::timeout(Duration::from_secs(5), cancelled)
            .await
            .expect("cancel returned")
            .expect("cancel thread");
    }
}
