use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response};
use scan2ebook_api_types::{
    ErrorBody, GenerateEpubRequest, PreviewResponse, ProcessPageResponse, StatusResponse,
    TaskStatus, UploadResponse, paths,
};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};
use url::Url;

use crate::application::error::ServiceError;
use crate::application::service::{ConversionService, ProcessedPage};
use crate::config::ServiceSettings;
use crate::domain::{
    Artifact, JobHandle, JobRequest, JobStatus, PageImage, status::clamp_progress,
};
use crate::infra::error::InfraError;

use super::form::{single_file_form, upload_form};

/// `reqwest`-backed [`ConversionService`].
#[derive(Debug, Clone)]
pub struct HttpConversionService {
    client: Client,
    base: Url,
}

impl HttpConversionService {
    pub fn new(settings: &ServiceSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(concat!("scan2ebook/", env!("CARGO_PKG_VERSION")))
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| InfraError::http_client(err.to_string()))?;
        Self::with_client(client, settings.base_url.clone())
    }

    /// Reuse an existing client. `base` must be an http(s) URL; any path it
    /// carries is kept as a prefix of every endpoint.
    pub fn with_client(client: Client, base: Url) -> Result<Self, InfraError> {
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(InfraError::configuration(format!(
                "service url `{base}` must be an absolute http(s) URL"
            )));
        }
        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

#[async_trait]
impl ConversionService for HttpConversionService {
    #[instrument(skip_all, fields(pages = request.pages().len()))]
    async fn submit(&self, request: &JobRequest) -> Result<JobHandle, ServiceError> {
        let form = upload_form(request)?;
        let response = self
            .client
            .post(self.endpoint(&[paths::UPLOAD]))
            .multipart(form)
            .send()
            .await?;

        let body: UploadResponse = read_json(response).await?;
        let task_id = body.task_id.trim();
        if task_id.is_empty() {
            return Err(ServiceError::malformed("upload response has an empty task_id"));
        }
        Ok(JobHandle::new(task_id))
    }

    #[instrument(skip_all, fields(task_id = %handle))]
    async fn status(&self, handle: &JobHandle) -> Result<JobStatus, ServiceError> {
        let response = self
            .client
            .get(self.endpoint(&[paths::STATUS, handle.as_str()]))
            .send()
            .await?;
        let body: StatusResponse = read_json(response).await?;
        debug!(status = body.status.as_str(), progress = ?body.progress, "status response");
        into_status(body)
    }

    #[instrument(skip_all, fields(page = page.file_name()))]
    async fn preview_page(&self, page: &PageImage) -> Result<String, ServiceError> {
        let response = self
            .client
            .post(self.endpoint(&[paths::PREVIEW_PAGE]))
            .multipart(single_file_form(page)?)
            .send()
            .await?;
        let body: PreviewResponse = read_json(response).await?;
        Ok(body.html)
    }

    #[instrument(skip_all, fields(page = page.file_name()))]
    async fn process_page(&self, page: &PageImage) -> Result<ProcessedPage, ServiceError> {
        let response = self
            .client
            .post(self.endpoint(&[paths::PROCESS_PAGE]))
            .multipart(single_file_form(page)?)
            .send()
            .await?;
        let body: ProcessPageResponse = read_json(response).await?;
        Ok(ProcessedPage {
            clean: body.clean,
            raw: body.raw,
        })
    }

    #[instrument(skip(self, pages), fields(pages = pages.len()))]
    async fn generate_epub(&self, title: &str, pages: &[String]) -> Result<Bytes, ServiceError> {
        let body = GenerateEpubRequest {
            title: title.to_owned(),
            pages: pages.to_vec(),
        };
        let response = self
            .client
            .post(self.endpoint(&[paths::GENERATE_EPUB]))
            .json(&body)
            .send()
            .await?;
        Ok(ensure_success(response).await?.bytes().await?)
    }

    #[instrument(skip(self))]
    async fn download(&self, reference: &str) -> Result<Bytes, ServiceError> {
        let response = self.client.get(self.artifact_url(reference)).send().await?;
        Ok(ensure_success(response).await?.bytes().await?)
    }

    fn artifact_url(&self, reference: &str) -> String {
        resolve_artifact_url(&self.base, reference)
    }
}

/// Absolute references are used as they are; anything else is appended to the
/// base URL.
pub(crate) fn resolve_artifact_url(base: &Url, reference: &str) -> String {
    if Url::parse(reference).is_ok() {
        return reference.to_owned();
    }
    format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        reference.trim_start_matches('/')
    )
}

/// Pass 2xx responses through; turn everything else into a [`ServiceError`].
///
/// Only a JSON error body with a usable message counts as a rejection. A bare
/// status is reported as an unreachable service.
async fn ensure_success(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.bytes().await.unwrap_or_default();
    let message = serde_json::from_slice::<ErrorBody>(&body)
        .ok()
        .and_then(|body| body.display_message());
    match message {
        Some(message) => Err(ServiceError::rejected(status.as_u16(), message)),
        None => Err(ServiceError::unreachable(format!(
            "status {status} without a readable error body"
        ))),
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ServiceError> {
    let bytes = ensure_success(response).await?.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|err| ServiceError::malformed(err.to_string()))
}

fn into_status(body: StatusResponse) -> Result<JobStatus, ServiceError> {
    let message = body.message.unwrap_or_default();
    match body.status {
        TaskStatus::Pending => Ok(JobStatus::pending(clamp_progress(body.progress), message)),
        TaskStatus::Processing => Ok(JobStatus::processing(
            clamp_progress(body.progress),
            message,
        )),
        TaskStatus::Completed => {
            let download_url = body
                .download_url
                .filter(|url| !url.trim().is_empty())
                .ok_or_else(|| ServiceError::malformed("completed status without download_url"))?;
            Ok(JobStatus::completed(
                clamp_progress(body.progress.or(Some(100.0))),
                message,
                Artifact {
                    download_url,
                    summary: body.summary.filter(|summary| !summary.trim().is_empty()),
                },
            ))
        }
        TaskStatus::Failed => Ok(JobStatus::failed(clamp_progress(body.progress), message)),
    }
}
