//! Request and response shapes spoken by the scan2ebook conversion service.
//!
//! The service owns OCR, text cleanup and eBook assembly; these types only
//! describe what travels over HTTP so the client and its tests agree on it.

use serde::{Deserialize, Serialize};

/// Endpoint paths, relative to the service base URL.
pub mod paths {
    pub const UPLOAD: &str = "upload";
    pub const STATUS: &str = "status";
    pub const PREVIEW_PAGE: &str = "preview-page";
    pub const PROCESS_PAGE: &str = "process-page";
    pub const GENERATE_EPUB: &str = "generate-epub";
}

/// Multipart field names.
pub mod fields {
    /// Repeated once per page, in reading order.
    pub const FILES: &str = "files";
    pub const COVER: &str = "cover";
    pub const TITLE: &str = "title";
    pub const SKIP_SUMMARY: &str = "skip_summary";
    /// Single-file endpoints (`preview-page`, `process-page`).
    pub const FILE: &str = "file";
}

/// Body of a successful `POST /upload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub task_id: String,
}

/// Lifecycle state reported by `GET /status/{task_id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

/// Body of a successful `GET /status/{task_id}`.
///
/// `progress` is a JSON number and may arrive as a float or be missing
/// entirely while the job is still queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewResponse {
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessPageResponse {
    pub clean: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

/// JSON body of `POST /generate-epub`; the response is the eBook itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateEpubRequest {
    pub title: String,
    pub pages: Vec<String>,
}

/// Error body returned with non-2xx responses.
///
/// FastAPI-style services put a string or a list of validation entries under
/// `detail`; others use `message`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorBody {
    /// The message to show a user, if the body carries one.
    pub fn display_message(&self) -> Option<String> {
        if let Some(detail) = self.detail.as_ref().and_then(detail_text) {
            return Some(detail);
        }
        self.message
            .as_deref()
            .map(str::trim)
            .filter(|msg| !msg.is_empty())
            .map(str::to_owned)
    }
}

fn detail_text(detail: &serde_json::Value) -> Option<String> {
    match detail {
        serde_json::Value::String(text) => {
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_owned())
        }
        serde_json::Value::Array(entries) => {
            let parts: Vec<&str> = entries
                .iter()
                .filter_map(|entry| match entry {
                    serde_json::Value::String(text) => Some(text.as_str()),
                    serde_json::Value::Object(map) => map.get("msg").and_then(|m| m.as_str()),
                    _ => None,
                })
                .collect();
            (!parts.is_empty()).then(|| parts.join("; "))
        }
        _ => None,
    }
}
