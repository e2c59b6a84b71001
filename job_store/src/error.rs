use thiserror::Error;

use crate::record::JobState;

#[derive(Error, Debug, Clone)]
pub enum JobStoreError {
    /// A conditional write was rejected because the stored state no longer
    /// matches the expected prior state. Always resolved by re-reading;
    /// never surfaced to the workflow caller.
    #[error("conditional write rejected: expected {expected:?}, stored record is {actual:?}")]
    StateConflict {
        expected: Option<JobState>,
        actual: Option<JobState>,
    },

    /// The store itself cannot be read or written. Fatal: aborts the whole
    /// workflow run.
    #[error("job state store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, JobStoreError>;
