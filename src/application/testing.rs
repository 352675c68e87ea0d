//! In-memory conversion service that replays a scripted sequence of status
//! responses. Test-only.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::{Artifact, JobHandle, JobRequest, JobStatus, PageImage};

use super::error::ServiceError;
use super::service::{ConversionService, ProcessedPage};

pub const FAKE_BASE: &str = "http://converter.test";

pub fn running(progress: u8) -> JobStatus {
    JobStatus::processing(progress, format!("working ({progress}%)"))
}

pub fn completed(download_url: &str) -> JobStatus {
    JobStatus::completed(
        100,
        "done",
        Artifact {
            download_url: download_url.to_owned(),
            summary: Some("A short book.".to_owned()),
        },
    )
}

pub fn failed(message: &str) -> JobStatus {
    JobStatus::failed(0, message)
}

/// One scripted answer to a status request.
#[derive(Debug, Clone)]
pub struct Step {
    delay: Option<Duration>,
    result: Result<JobStatus, ServiceError>,
}

impl Step {
    pub fn ok(status: JobStatus) -> Self {
        Self {
            delay: None,
            result: Ok(status),
        }
    }

    pub fn err(error: ServiceError) -> Self {
        Self {
            delay: None,
            result: Err(error),
        }
    }

    pub fn delayed(delay: Duration, result: Result<JobStatus, ServiceError>) -> Self {
        Self {
            delay: Some(delay),
            result,
        }
    }
}

#[derive(Debug, Default)]
pub struct ScriptedService {
    submissions: Mutex<VecDeque<Result<JobHandle, ServiceError>>>,
    steps: Mutex<VecDeque<Step>>,
    submitted: Mutex<Vec<JobRequest>>,
    polled: Mutex<Vec<JobHandle>>,
    submit_calls: AtomicUsize,
    status_calls: AtomicUsize,
}

impl ScriptedService {
    pub fn with_steps(steps: impl IntoIterator<Item = Step>) -> Self {
        let service = Self::default();
        service.push_steps(steps);
        service
    }

    pub fn push_submission(&self, result: Result<JobHandle, ServiceError>) {
        self.submissions.lock().expect("lock").push_back(result);
    }

    pub fn push_steps(&self, steps: impl IntoIterator<Item = Step>) {
        self.steps.lock().expect("lock").extend(steps);
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> Vec<JobRequest> {
        self.submitted.lock().expect("lock").clone()
    }

    pub fn polled(&self) -> Vec<JobHandle> {
        self.polled.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ConversionService for ScriptedService {
    async fn submit(&self, request: &JobRequest) -> Result<JobHandle, ServiceError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.submitted.lock().expect("lock").push(request.clone());
        self.submissions
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Ok(JobHandle::new("job-1")))
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus, ServiceError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.polled.lock().expect("lock").push(handle.clone());
        let step = self.steps.lock().expect("lock").pop_front();
        match step {
            Some(step) => {
                if let Some(delay) = step.delay {
                    tokio::time::sleep(delay).await;
                }
                step.result
            }
            None => Err(ServiceError::unreachable("script exhausted")),
        }
    }

    async fn preview_page(&self, page: &PageImage) -> Result<String, ServiceError> {
        Ok(format!("<p>{}</p>", page.file_name()))
    }

    async fn process_page(&self, page: &PageImage) -> Result<ProcessedPage, ServiceError> {
        Ok(ProcessedPage {
            clean: format!("text of {}", page.file_name()),
            raw: None,
        })
    }

    async fn generate_epub(&self, title: &str, pages: &[String]) -> Result<Bytes, ServiceError> {
        Ok(Bytes::from(format!("{title}:{}", pages.join("|"))))
    }

    async fn download(&self, reference: &str) -> Result<Bytes, ServiceError> {
        Ok(Bytes::from(format!("epub bytes for {reference}")))
    }

    fn artifact_url(&self, reference: &str) -> String {
        format!("{FAKE_BASE}{reference}")
    }
}
