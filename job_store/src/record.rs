use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sort key used for the single metadata item of each retrieval unit.
pub const META_SORT_KEY: &str = "meta";

/// The two kinds of asynchronous vault jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    InventoryRetrieval,
    ArchiveRetrieval,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::InventoryRetrieval => "inventory-retrieval",
            JobKind::ArchiveRetrieval => "archive-retrieval",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-archive retrieval lifecycle. `Stored` and `Failed` are terminal.
/// Inventory jobs follow the reduced path that skips `Verifying`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Pending,
    JobRequested,
    JobInProgress,
    JobReady,
    Downloading,
    Verifying,
    Stored,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Stored | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::JobRequested => "job-requested",
            JobState::JobInProgress => "job-in-progress",
            JobState::JobReady => "job-ready",
            JobState::Downloading => "downloading",
            JobState::Verifying => "verifying",
            JobState::Stored => "stored",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Composite key of a job record: `{job_kind}:{unit_id}` / `"meta"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub partition_key: String,
    pub sort_key: String,
}

impl JobKey {
    /// The metadata item for a retrieval unit. `unit_id` is the archive id
    /// for archive jobs and the workflow run id for inventory jobs.
    pub fn meta(kind: JobKind, unit_id: &str) -> Self {
        Self {
            partition_key: format!("{kind}:{unit_id}"),
            sort_key: META_SORT_KEY.to_string(),
        }
    }
}

/// Durable destination for the retrieval unit's reassembled bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkLocation {
    pub bucket: String,
    pub key: String,
}

impl fmt::Display for SinkLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Persisted state for one retrieval unit. Created on the first scheduling
/// attempt, mutated only by the scheduler, and retained after reaching a
/// terminal state as an audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub key: JobKey,
    pub workflow_run_id: String,
    pub job_kind: JobKind,
    pub state: JobState,
    /// Vault-assigned token, set once the job has been initiated.
    pub job_id: Option<String>,
    pub start_timestamp: DateTime<Utc>,
    pub completion_timestamp: Option<DateTime<Utc>>,
    pub vault_name: String,
    pub archive_id: Option<String>,
    pub archive_size: u64,
    pub description: String,
    pub sink_location: SinkLocation,
    pub failure_reason: Option<String>,
}

impl JobRecord {
    pub fn new(
        key: JobKey,
        workflow_run_id: &str,
        job_kind: JobKind,
        vault_name: &str,
        sink_location: SinkLocation,
    ) -> Self {
        Self {
            key,
            workflow_run_id: workflow_run_id.to_string(),
            job_kind,
            state: JobState::Pending,
            job_id: None,
            start_timestamp: Utc::now(),
            completion_timestamp: None,
            vault_name: vault_name.to_string(),
            archive_id: None,
            archive_size: 0,
            description: String::new(),
            sink_location,
            failure_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_key_encoding() {
        let key = JobKey::meta(JobKind::ArchiveRetrieval, "abc123");
        assert_eq!(key.partition_key, "archive-retrieval:abc123");
        assert_eq!(key.sort_key, META_SORT_KEY);

        let key = JobKey::meta(JobKind::InventoryRetrieval, "run-1");
        assert_eq!(key.partition_key, "inventory-retrieval:run-1");
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Stored.is_terminal());
        assert!(JobState::Failed.is_terminal());
        for s in [
            JobState::Pending,
            JobState::JobRequested,
            JobState::JobInProgress,
            JobState::JobReady,
            JobState::Downloading,
            JobState::Verifying,
        ] {
            assert!(!s.is_terminal(), "{s} should not be terminal");
        }
    }

    #[test]
    fn test_record_serde_round_trip() {
        let mut record = JobRecord::new(
            JobKey::meta(JobKind::ArchiveRetrieval, "a1"),
            "run-1",
            JobKind::ArchiveRetrieval,
            "vault-a",
            SinkLocation {
                bucket: "restore".into(),
                key: "run-1/archives/a1".into(),
            },
        );
        record.job_id = Some("JOB123".into());
        record.archive_id = Some("a1".into());
        record.archive_size = 42;

        let json = serde_json::to_string(&record).unwrap();
        let back: JobRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
