use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum VaultClientError {
    /// Network timeout, throttling, or a 5xx-equivalent service fault.
    /// Retried with capped exponential backoff and jitter.
    #[error("transient vault error: {0}")]
    Transient(String),

    /// The vault reports the job as failed, aborted, or expired. Not
    /// retryable for this `job_id`; the caller must initiate a fresh job.
    #[error("vault job {job_id} aborted: {reason}")]
    JobAborted { job_id: String, reason: String },

    /// Waiting for job completion exceeded the caller-supplied ceiling.
    /// Surfaced as retryable rather than hanging.
    #[error("timed out waiting for job {job_id} after {waited_secs}s")]
    CompletionTimeout { job_id: String, waited_secs: u64 },

    #[error("unknown vault, job, or archive: {0}")]
    NotFound(String),

    #[error("requested range {requested} is outside the {size}-byte job output")]
    InvalidRange { requested: String, size: u64 },

    #[error("vault client error: {0}")]
    Other(String),
}

impl VaultClientError {
    /// Whether the same operation may be retried as-is. Aborted jobs are
    /// excluded: those need a freshly initiated job, not a repeat call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultClientError::Transient(_) | VaultClientError::CompletionTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, VaultClientError>;
