use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ByteRange, JobDescription, JobKind, JobOutput};

/// Narrow interface to the vault service consumed by the retrieval engine.
///
/// `initiate_job` and `describe_job` map onto the vault's asynchronous job
/// protocol; `get_job_output` performs a range-addressed read of a completed
/// job's output. Implementations must report "still running", "succeeded",
/// and "failed/aborted/expired" as distinct outcomes; the last of these is
/// never retryable for the same job id.
#[async_trait]
pub trait VaultClient: Send + Sync {
    /// Registers a new job with the vault and returns its opaque job id.
    /// `archive_id` is required for archive retrieval and ignored for
    /// inventory retrieval.
    async fn initiate_job(&self, vault_name: &str, kind: JobKind, archive_id: Option<&str>) -> Result<String>;

    async fn describe_job(&self, vault_name: &str, job_id: &str) -> Result<JobDescription>;

    /// Fetches a byte range of a succeeded job's output; `None` reads the
    /// whole output.
    async fn get_job_output(&self, vault_name: &str, job_id: &str, range: Option<ByteRange>) -> Result<JobOutput>;
}
