//! Status snapshots reported while a job runs.

use std::fmt;

/// Lifecycle state of a job as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// `completed` and `failed` end a job; nothing follows them.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the finished eBook can be fetched, plus the optional summary text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub download_url: String,
    pub summary: Option<String>,
}

/// One immutable status snapshot.
///
/// Only a `completed` snapshot carries an [`Artifact`]; the constructors keep
/// that pairing intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    state: JobState,
    progress: u8,
    message: String,
    artifact: Option<Artifact>,
}

impl JobStatus {
    pub fn pending(progress: u8, message: impl Into<String>) -> Self {
        Self::running(JobState::Pending, progress, message.into())
    }

    pub fn processing(progress: u8, message: impl Into<String>) -> Self {
        Self::running(JobState::Processing, progress, message.into())
    }

    fn running(state: JobState, progress: u8, message: String) -> Self {
        Self {
            state,
            progress: progress.min(100),
            message,
            artifact: None,
        }
    }

    pub fn completed(progress: u8, message: impl Into<String>, artifact: Artifact) -> Self {
        Self {
            state: JobState::Completed,
            progress: progress.min(100),
            message: message.into(),
            artifact: Some(artifact),
        }
    }

    pub fn failed(progress: u8, message: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            progress: progress.min(100),
            message: message.into(),
            artifact: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        self.artifact.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Convert a wire progress number into a whole percentage.
pub fn clamp_progress(raw: Option<f64>) -> u8 {
    match raw {
        Some(value) if value.is_finite() => {
            let rounded = value.round().clamp(0.0, 100.0);
            // Bounded to 0..=100 above.
            rounded as u8
        }
        _ => 0,
    }
}
