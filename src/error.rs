//! Error types for the generation orchestration subsystem.

use crate::types::{CandidateId, CharacterId, JobId, RequestId};
use std::path::PathBuf;
use thiserror::Error;

/// Transport and service-side failures. The closed set the service client maps every
/// failure into; only `Unreachable` and `Timeout` are worth retrying.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Service unreachable: {0}")]
    Unreachable(String),

    #[error("Service timed out: {0}")]
    Timeout(String),

    #[error("Service rejected request: {0}")]
    Rejected(String),

    #[error("Malformed service response: {0}")]
    MalformedResponse(String),
}

impl ServiceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Unreachable(_) | ServiceError::Timeout(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Unreachable(_) => "unreachable",
            ServiceError::Timeout(_) => "timeout",
            ServiceError::Rejected(_) => "rejected",
            ServiceError::MalformedResponse(_) => "malformed_response",
        }
    }

    /// Rejection for a request that needs an optional capability the service lacks.
    pub fn capability_unavailable(capability: &str) -> Self {
        ServiceError::Rejected(format!("capability unavailable: {}", capability))
    }
}

/// Local character data problems. Recoverable: callers may degrade to prompt-only generation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("Character not found: {0}")]
    CharacterNotFound(CharacterId),

    #[error("Pose image unreadable: {path:?}: {reason}")]
    PoseImageUnreadable { path: PathBuf, reason: String },
}

impl ResolutionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ResolutionError::CharacterNotFound(_) => "character_not_found",
            ResolutionError::PoseImageUnreadable { .. } => "pose_image_unreadable",
        }
    }
}

/// Failure of a single generation task.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("Task cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::Service(e) => e.kind(),
            TaskError::Resolution(e) => e.kind(),
            TaskError::Cancelled => "cancelled",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Service(e) if e.is_retryable())
    }
}

/// Session store errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session is closed")]
    Closed,

    #[error("Unknown job: {0}")]
    UnknownJob(JobId),

    #[error("Unknown request: {0}")]
    UnknownRequest(RequestId),

    #[error("Job {0} has not finished")]
    JobNotFinished(JobId),

    #[error("Candidate {candidate} not found for request {request}")]
    CandidateNotFound {
        request: RequestId,
        candidate: CandidateId,
    },
}

/// Job submission errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    /// Reported by `BatchJob::validate`; `submit` turns it into an immediately completed job.
    #[error("Job has no requests")]
    EmptyJob,

    #[error("Invalid dependency: {0}")]
    InvalidDependency(String),

    #[error("No tokio runtime available to drive the job")]
    NoRuntime,

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Crate-level errors for configuration, story loading and the command line surface.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Story error: {0}")]
    StoryError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl From<config::ConfigError> for ApiError {
    fn from(err: config::ConfigError) -> Self {
        ApiError::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::SerializationError(err.to_string())
    }
}
