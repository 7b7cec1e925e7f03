use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Job {job_id} failed: {message}")]
    JobExecution { job_id: String, message: String },

    #[error("Job {job_id} finished after its batch was cancelled")]
    CancellationRace { job_id: String },

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl BatchError {
    pub fn batch_not_found(batch_id: &str) -> Self {
        Self::NotFound(format!("batch {}", batch_id))
    }

    pub fn job_not_found(batch_id: &str, job_id: &str) -> Self {
        Self::NotFound(format!("job {} in batch {}", job_id, batch_id))
    }
}

pub type Result<T> = std::result::Result<T, BatchError>;
