use std::time::Duration;

use vault_client::RetryPolicy;

use crate::error::{Result, RetrievalError};

/// How a duplicate `archive_id` appearing in more than one inventory file of
/// the same run is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateArchivePolicy {
    /// One logical archive: a single job record run-wide, later occurrences
    /// observe the first one's progress.
    SingleJob,
    /// Independent retrieval per source file, each with its own job record
    /// and sink object.
    PerInventoryFile,
}

/// Tunables for one retrieval engine instance. Defaults are suitable for the
/// real vault service; tests shrink the sizes and delays.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Fetch granularity. Must be a positive multiple of `leaf_size` so each
    /// chunk's leaf digests slot directly into the whole-archive hash tree.
    pub chunk_size: u64,
    pub leaf_size: usize,

    pub max_concurrent_archives: usize,
    pub max_concurrent_chunks: usize,
    /// Bound on total in-flight vault requests across all archives.
    pub max_inflight_requests: usize,

    /// Backoff for transient chunk-fetch faults; its attempt count also caps
    /// refetches after a chunk checksum mismatch.
    pub chunk_retry: RetryPolicy,
    /// How many fresh jobs may be initiated for one archive after the vault
    /// aborts or times out the previous one.
    pub job_retry_attempts: usize,

    pub poll_interval: Duration,
    /// Ceiling on waiting for one job to become ready.
    pub job_ready_ceiling: Duration,
    /// How long in-flight work may drain after a cancel before being
    /// abandoned.
    pub cancel_grace: Duration,

    /// Sink bucket receiving every object this engine writes.
    pub sink_bucket: String,
    pub duplicate_archive_policy: DuplicateArchivePolicy,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chunk_size: tree_hash::DEFAULT_LEAF_SIZE as u64,
            leaf_size: tree_hash::DEFAULT_LEAF_SIZE,
            max_concurrent_archives: 8,
            max_concurrent_chunks: 4,
            max_inflight_requests: 32,
            chunk_retry: RetryPolicy::default(),
            job_retry_attempts: 2,
            poll_interval: Duration::from_secs(2),
            job_ready_ceiling: Duration::from_secs(15 * 60),
            cancel_grace: Duration::from_secs(5),
            sink_bucket: "vault-restore".to_string(),
            duplicate_archive_policy: DuplicateArchivePolicy::SingleJob,
        }
    }
}

impl RetrievalConfig {
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_leaf_size(mut self, leaf_size: usize) -> Self {
        self.leaf_size = leaf_size;
        self
    }

    pub fn with_max_concurrent_archives(mut self, n: usize) -> Self {
        self.max_concurrent_archives = n;
        self
    }

    pub fn with_max_concurrent_chunks(mut self, n: usize) -> Self {
        self.max_concurrent_chunks = n;
        self
    }

    pub fn with_max_inflight_requests(mut self, n: usize) -> Self {
        self.max_inflight_requests = n;
        self
    }

    pub fn with_chunk_retry(mut self, policy: RetryPolicy) -> Self {
        self.chunk_retry = policy;
        self
    }

    pub fn with_job_retry_attempts(mut self, attempts: usize) -> Self {
        self.job_retry_attempts = attempts;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_ready_ceiling(mut self, ceiling: Duration) -> Self {
        self.job_ready_ceiling = ceiling;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_sink_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.sink_bucket = bucket.into();
        self
    }

    pub fn with_duplicate_archive_policy(mut self, policy: DuplicateArchivePolicy) -> Self {
        self.duplicate_archive_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.leaf_size == 0 {
            return Err(RetrievalError::InvalidInput("chunk and leaf sizes must be positive".to_string()));
        }
        if self.chunk_size % self.leaf_size as u64 != 0 {
            return Err(RetrievalError::InvalidInput(format!(
                "chunk size {} is not a multiple of leaf size {}",
                self.chunk_size, self.leaf_size
            )));
        }
        if self.max_concurrent_archives == 0 || self.max_concurrent_chunks == 0 || self.max_inflight_requests == 0 {
            return Err(RetrievalError::InvalidInput("concurrency bounds must be positive".to_string()));
        }
        if self.sink_bucket.is_empty() {
            return Err(RetrievalError::InvalidInput("sink bucket must not be empty".to_string()));
        }
        Ok(())
    }
}
