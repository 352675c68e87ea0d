//! Boundary between the job lifecycle and the transport that reaches the
//! conversion service.

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::{JobHandle, JobRequest, JobStatus, PageImage};

use super::error::ServiceError;

/// Text recognized on a single page by `process-page`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedPage {
    pub clean: String,
    pub raw: Option<String>,
}

#[async_trait]
pub trait ConversionService: Send + Sync {
    /// Upload a validated request and return the job identifier.
    async fn submit(&self, request: &JobRequest) -> Result<JobHandle, ServiceError>;

    /// Fetch one status snapshot.
    async fn status(&self, handle: &JobHandle) -> Result<JobStatus, ServiceError>;

    /// Recognize one page and return it as HTML for review.
    async fn preview_page(&self, page: &PageImage) -> Result<String, ServiceError>;

    async fn process_page(&self, page: &PageImage) -> Result<ProcessedPage, ServiceError>;

    /// Build an eBook from already recognized page texts.
    async fn generate_epub(&self, title: &str, pages: &[String]) -> Result<Bytes, ServiceError>;

    /// Fetch a finished artifact by the reference a `completed` status carried.
    async fn download(&self, reference: &str) -> Result<Bytes, ServiceError>;

    /// Absolute URL for an artifact reference.
    fn artifact_url(&self, reference: &str) -> String;
}
