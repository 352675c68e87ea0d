use std::path::PathBuf;

use thiserror::Error;

use crate::{domain::error::ValidationError, infra::error::InfraError};

pub const UNREACHABLE_MESSAGE: &str = "Could not connect to the processing server.";
pub const MALFORMED_MESSAGE: &str = "The processing server returned an unexpected response.";
pub const CONNECTION_LOST_MESSAGE: &str = "Lost connection to the server.";
pub const JOB_FAILED_FALLBACK_MESSAGE: &str = "Something went wrong during conversion.";
pub const UNKNOWN_JOB_MESSAGE: &str = "The processing server no longer knows about this job.";
pub const STALLED_MESSAGE: &str = "The conversion stopped making progress.";

/// Transport-level failure talking to the conversion service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("service rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("service unreachable: {0}")]
    Unreachable(String),
    #[error("malformed service response: {0}")]
    Malformed(String),
    #[error("request not sent: {0}")]
    Invalid(#[from] ValidationError),
}

impl ServiceError {
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unreachable(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// The service answered 404 with a readable body, i.e. the resource is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::Rejected { status: 404, .. })
    }

    pub fn user_message(&self) -> String {
        match self {
            ServiceError::Rejected { message, .. } => message.clone(),
            ServiceError::Unreachable(_) => UNREACHABLE_MESSAGE.to_owned(),
            ServiceError::Malformed(_) => MALFORMED_MESSAGE.to_owned(),
            ServiceError::Invalid(err) => err.to_string(),
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Unreachable(err.to_string())
        }
    }
}

/// Why a job could not be submitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("service rejected submission with status {status}: {message}")]
    ServiceRejected { status: u16, message: String },
    #[error("conversion service unreachable: {0}")]
    Unreachable(String),
    #[error("malformed submission response: {0}")]
    MalformedResponse(String),
}

impl SubmissionError {
    pub fn user_message(&self) -> String {
        match self {
            SubmissionError::Validation(err) => err.to_string(),
            SubmissionError::ServiceRejected { message, .. } => message.clone(),
            SubmissionError::Unreachable(_) => UNREACHABLE_MESSAGE.to_owned(),
            SubmissionError::MalformedResponse(_) => MALFORMED_MESSAGE.to_owned(),
        }
    }
}

impl From<ServiceError> for SubmissionError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Rejected { status, message } => {
                SubmissionError::ServiceRejected { status, message }
            }
            ServiceError::Unreachable(detail) => SubmissionError::Unreachable(detail),
            ServiceError::Malformed(detail) => SubmissionError::MalformedResponse(detail),
            ServiceError::Invalid(err) => SubmissionError::Validation(err),
        }
    }
}

/// Why a poll loop gave up on a job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollingError {
    #[error("status polling failed {attempts} times in a row: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    #[error("job `{0}` is not known to the service")]
    UnknownJob(String),
    #[error("job made no progress for {ticks} polls")]
    Stalled { ticks: u32 },
    #[error("conversion failed: {0}")]
    JobFailed(String),
}

impl PollingError {
    pub fn user_message(&self) -> String {
        match self {
            PollingError::RetriesExhausted { .. } => CONNECTION_LOST_MESSAGE.to_owned(),
            PollingError::UnknownJob(_) => UNKNOWN_JOB_MESSAGE.to_owned(),
            PollingError::Stalled { .. } => STALLED_MESSAGE.to_owned(),
            PollingError::JobFailed(message) => message.clone(),
        }
    }
}

/// Message shown for a `failed` snapshot.
pub fn failed_job_message(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        JOB_FAILED_FALLBACK_MESSAGE.to_owned()
    } else {
        trimmed.to_owned()
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error(transparent)]
    Polling(#[from] PollingError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("job was cancelled before it finished")]
    Cancelled,
    #[error("failed to access `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::Submission(SubmissionError::Validation(err))
    }
}
