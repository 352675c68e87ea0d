//! Domain layer types and invariants.

pub mod error;
pub mod job;
pub mod status;

pub use error::ValidationError;
pub use job::{DEFAULT_TITLE, JobHandle, JobRequest, PageImage};
pub use status::{Artifact, JobState, JobStatus};
