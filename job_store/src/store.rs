use async_trait::async_trait;

use crate::error::Result;
use crate::record::{JobKey, JobRecord, JobState};

/// Durable key-value store of job records, shared by many concurrent workers
/// and possibly many processes. Implementations must make `put_if` atomic
/// with respect to the stored record's state.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, key: &JobKey) -> Result<Option<JobRecord>>;

    /// Conditional write. `expected_prior` of `None` requires that no record
    /// exists yet (insert); `Some(state)` requires that the stored record is
    /// currently in exactly that state. A mismatch is a
    /// [`crate::JobStoreError::StateConflict`].
    async fn put_if(&self, record: &JobRecord, expected_prior: Option<JobState>) -> Result<()>;

    /// Administrative removal; not used in the normal retrieval path.
    async fn delete(&self, key: &JobKey) -> Result<()>;

    /// All records tagged with the given workflow run, for aggregate status
    /// reporting.
    async fn list_run(&self, workflow_run_id: &str) -> Result<Vec<JobRecord>>;
}
