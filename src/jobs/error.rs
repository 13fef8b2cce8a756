use thiserror::Error;

/// Failures at the Job Store boundary.
#[derive(Error, Debug)]
pub enum JobError {
    /// The job row does not exist (never created, or deleted concurrently).
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("job payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("invalid job operation: {0}")]
    Invalid(String),
}

pub type JobResult<T> = std::result::Result<T, JobError>;
