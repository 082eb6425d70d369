use thiserror::Error;
use tokio::task::JoinError;

use crate::storage::{types::job::JobStatus, vault::ArchiveError};

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Object storage error: {0}")]
    Storage(#[from] object_store::Error),
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Precondition failed for job {job_id}: expected {expected}, found {actual}")]
    PreconditionFailed {
        job_id: String,
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Execution error: {0}")]
    Execution(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Processing error: {0}")]
    Processing(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// True when the error means another delivery already moved the job on.
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, AppError::PreconditionFailed { .. })
    }

    /// Write conflicts reported by the record store that are safe to retry.
    pub fn is_retryable_conflict(&self) -> bool {
        match self {
            AppError::Database(err) => {
                let message = err.to_string();
                message.contains("can be retried") || message.contains("conflict")
            }
            _ => false,
        }
    }
}
