use bytes::Bytes;
use tree_hash::TreeDigest;

/// Half-open byte range `[start, end)` within a job's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn length(&self) -> u64 {
        self.end - self.start
    }

    /// Inclusive `bytes=a-b` form used on the vault's wire protocol.
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end.saturating_sub(1))
    }
}

/// Kind of vault job to initiate, as named on the vault's wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
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

/// Outcome of `describe_job`: the three cases are distinct because only
/// `InProgress` is worth waiting on; a failed job can never recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    InProgress,
    Succeeded,
    Failed,
}

/// Snapshot of a job as reported by the vault.
#[derive(Debug, Clone)]
pub struct JobDescription {
    pub job_id: String,
    pub status: JobStatus,
    /// Total output size; known once the job has succeeded.
    pub size_bytes: Option<u64>,
    /// The vault's declared tree hash of the whole output, for archive jobs.
    pub content_hash: Option<TreeDigest>,
    pub status_message: Option<String>,
}

/// One fetched range of job output. `checksum` is the vault's declared tree
/// hash of exactly these bytes, when the vault provides one; it lets the
/// caller reject transport corruption before accepting the range.
#[derive(Debug, Clone)]
pub struct JobOutput {
    pub data: Bytes,
    pub checksum: Option<TreeDigest>,
}
