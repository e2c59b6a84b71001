use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::{Result, VaultClientError};
use crate::interface::VaultClient;
use crate::types::{ByteRange, JobDescription, JobKind, JobOutput, JobStatus};

const MOCK_CREATION_DATE: &str = "2023-04-24T14:07:34.000Z";

struct ArchiveEntry {
    body: Bytes,
    description: String,
}

struct JobEntry {
    kind: JobKind,
    archive_id: Option<String>,
    polls_remaining: u32,
    failed: bool,
}

#[derive(Default)]
struct MockState {
    jobs: HashMap<String, JobEntry>,
    job_seq: u64,
    initiations: HashMap<(JobKind, Option<String>), u32>,
    initiate_faults: u32,
    fetch_faults: u32,
    corrupt_fetch: HashSet<String>,
}

/// In-memory vault for tests. Holds a fixed set of archives, serves a
/// rendered inventory for inventory jobs, and supports scripted misbehavior:
/// delayed job readiness, vault-side job failure, transient fault countdowns,
/// and a one-shot corrupted fetch per archive.
pub struct MockVaultClient {
    vault_name: String,
    archives: BTreeMap<String, ArchiveEntry>,
    inventory_override: Option<Bytes>,
    leaf_size: usize,
    ready_after_polls: u32,
    failing_archives: HashSet<String>,
    state: Mutex<MockState>,
}

impl MockVaultClient {
    pub fn builder(vault_name: impl Into<String>) -> MockVaultClientBuilder {
        MockVaultClientBuilder {
            vault_name: vault_name.into(),
            archives: BTreeMap::new(),
            inventory_override: None,
            leaf_size: tree_hash::DEFAULT_LEAF_SIZE,
            ready_after_polls: 0,
            failing_archives: HashSet::new(),
            initiate_faults: 0,
            fetch_faults: 0,
            corrupt_fetch: HashSet::new(),
        }
    }

    /// How many times `initiate_job` was called for this kind and archive.
    pub fn initiate_count(&self, kind: JobKind, archive_id: Option<&str>) -> u32 {
        let state = self.state.lock().unwrap();
        state
            .initiations
            .get(&(kind, archive_id.map(str::to_string)))
            .copied()
            .unwrap_or(0)
    }

    fn check_vault(&self, vault_name: &str) -> Result<()> {
        if vault_name != self.vault_name {
            return Err(VaultClientError::NotFound(format!("no such vault: {vault_name}")));
        }
        Ok(())
    }

    fn render_inventory(&self) -> Bytes {
        if let Some(body) = &self.inventory_override {
            return body.clone();
        }
        let mut out = String::new();
        out.push_str("ArchiveId,ArchiveDescription,CreationDate,Size,SHA256TreeHash\r\n");
        for (archive_id, entry) in &self.archives {
            let hash = tree_hash::compute(&entry.body, self.leaf_size);
            out.push_str(&format!(
                "{},{},{},{},{}\r\n",
                csv_field(archive_id),
                csv_field(&entry.description),
                MOCK_CREATION_DATE,
                entry.body.len(),
                hash.hex()
            ));
        }
        Bytes::from(out)
    }

    fn job_body(&self, job: &JobEntry) -> Result<Bytes> {
        match job.kind {
            JobKind::InventoryRetrieval => Ok(self.render_inventory()),
            JobKind::ArchiveRetrieval => {
                let archive_id = job.archive_id.as_deref().unwrap_or_default();
                self.archives
                    .get(archive_id)
                    .map(|e| e.body.clone())
                    .ok_or_else(|| VaultClientError::NotFound(format!("no such archive: {archive_id}")))
            },
        }
    }
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

#[async_trait]
impl VaultClient for MockVaultClient {
    async fn initiate_job(&self, vault_name: &str, kind: JobKind, archive_id: Option<&str>) -> Result<String> {
        self.check_vault(vault_name)?;
        if kind == JobKind::ArchiveRetrieval {
            let archive_id = archive_id
                .ok_or_else(|| VaultClientError::Other("archive retrieval requires an archive id".to_string()))?;
            if !self.archives.contains_key(archive_id) {
                return Err(VaultClientError::NotFound(format!("no such archive: {archive_id}")));
            }
        }

        let mut state = self.state.lock().unwrap();
        *state
            .initiations
            .entry((kind, archive_id.map(str::to_string)))
            .or_insert(0) += 1;
        if state.initiate_faults > 0 {
            state.initiate_faults -= 1;
            return Err(VaultClientError::Transient("simulated initiate fault".to_string()));
        }

        state.job_seq += 1;
        let job_id = format!("mock-job-{:04}", state.job_seq);
        let failed = archive_id.is_some_and(|id| self.failing_archives.contains(id));
        state.jobs.insert(job_id.clone(), JobEntry {
            kind,
            archive_id: archive_id.map(str::to_string),
            polls_remaining: self.ready_after_polls,
            failed,
        });
        debug!(job_id, kind = kind.as_str(), "mock vault accepted job");
        Ok(job_id)
    }

    async fn describe_job(&self, vault_name: &str, job_id: &str) -> Result<JobDescription> {
        self.check_vault(vault_name)?;
        let mut state = self.state.lock().unwrap();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| VaultClientError::NotFound(format!("no such job: {job_id}")))?;

        if job.failed {
            return Ok(JobDescription {
                job_id: job_id.to_string(),
                status: JobStatus::Failed,
                size_bytes: None,
                content_hash: None,
                status_message: Some("simulated vault-side job failure".to_string()),
            });
        }
        if job.polls_remaining > 0 {
            job.polls_remaining -= 1;
            return Ok(JobDescription {
                job_id: job_id.to_string(),
                status: JobStatus::InProgress,
                size_bytes: None,
                content_hash: None,
                status_message: None,
            });
        }

        let kind = job.kind;
        let job_snapshot = JobEntry {
            kind,
            archive_id: job.archive_id.clone(),
            polls_remaining: 0,
            failed: false,
        };
        drop(state);
        let body = self.job_body(&job_snapshot)?;
        let content_hash = match kind {
            JobKind::ArchiveRetrieval => Some(tree_hash::compute(&body, self.leaf_size)),
            JobKind::InventoryRetrieval => None,
        };
        Ok(JobDescription {
            job_id: job_id.to_string(),
            status: JobStatus::Succeeded,
            size_bytes: Some(body.len() as u64),
            content_hash,
            status_message: None,
        })
    }

    async fn get_job_output(&self, vault_name: &str, job_id: &str, range: Option<ByteRange>) -> Result<JobOutput> {
        self.check_vault(vault_name)?;
        let (job_snapshot, corrupt) = {
            let mut state = self.state.lock().unwrap();
            if state.fetch_faults > 0 {
                state.fetch_faults -= 1;
                return Err(VaultClientError::Transient("simulated fetch fault".to_string()));
            }
            let job = state
                .jobs
                .get(job_id)
                .ok_or_else(|| VaultClientError::NotFound(format!("no such job: {job_id}")))?;
            if job.failed || job.polls_remaining > 0 {
                return Err(VaultClientError::Other(format!("job output not available: {job_id}")));
            }
            let snapshot = JobEntry {
                kind: job.kind,
                archive_id: job.archive_id.clone(),
                polls_remaining: 0,
                failed: false,
            };
            let corrupt = match &snapshot.archive_id {
                Some(id) => state.corrupt_fetch.remove(id),
                None => false,
            };
            (snapshot, corrupt)
        };

        let body = self.job_body(&job_snapshot)?;
        let slice = match range {
            None => body,
            Some(r) => {
                if r.end > body.len() as u64 || r.start > r.end {
                    return Err(VaultClientError::InvalidRange {
                        requested: r.range_header(),
                        size: body.len() as u64,
                    });
                }
                body.slice(r.start as usize..r.end as usize)
            },
        };

        let checksum = match job_snapshot.kind {
            JobKind::ArchiveRetrieval => Some(tree_hash::compute(&slice, self.leaf_size)),
            JobKind::InventoryRetrieval => None,
        };
        let data = if corrupt && !slice.is_empty() {
            let mut garbled = slice.to_vec();
            garbled[0] ^= 0xff;
            Bytes::from(garbled)
        } else {
            slice
        };
        Ok(JobOutput { data, checksum })
    }
}

/// Configures a [`MockVaultClient`] before it is shared across tasks.
pub struct MockVaultClientBuilder {
    vault_name: String,
    archives: BTreeMap<String, ArchiveEntry>,
    inventory_override: Option<Bytes>,
    leaf_size: usize,
    ready_after_polls: u32,
    failing_archives: HashSet<String>,
    initiate_faults: u32,
    fetch_faults: u32,
    corrupt_fetch: HashSet<String>,
}

impl MockVaultClientBuilder {
    pub fn archive(self, archive_id: impl Into<String>, body: impl Into<Bytes>) -> Self {
        let id = archive_id.into();
        let description = format!("description for {id}");
        self.archive_with_description(id, body, description)
    }

    pub fn archive_with_description(
        mut self,
        archive_id: impl Into<String>,
        body: impl Into<Bytes>,
        description: impl Into<String>,
    ) -> Self {
        self.archives.insert(archive_id.into(), ArchiveEntry {
            body: body.into(),
            description: description.into(),
        });
        self
    }

    /// Serve this exact body for inventory jobs instead of rendering one
    /// from the configured archives.
    pub fn inventory_body(mut self, body: impl Into<Bytes>) -> Self {
        self.inventory_override = Some(body.into());
        self
    }

    pub fn leaf_size(mut self, leaf_size: usize) -> Self {
        self.leaf_size = leaf_size;
        self
    }

    /// Every job reports `InProgress` for this many describes before
    /// succeeding.
    pub fn ready_after_polls(mut self, polls: u32) -> Self {
        self.ready_after_polls = polls;
        self
    }

    /// Jobs for this archive complete as vault-side failures.
    pub fn fail_archive_job(mut self, archive_id: impl Into<String>) -> Self {
        self.failing_archives.insert(archive_id.into());
        self
    }

    /// The next `n` initiations fail with a transient error.
    pub fn transient_initiate_faults(mut self, n: u32) -> Self {
        self.initiate_faults = n;
        self
    }

    /// The next `n` output fetches fail with a transient error.
    pub fn transient_fetch_faults(mut self, n: u32) -> Self {
        self.fetch_faults = n;
        self
    }

    /// The first fetched range of this archive comes back garbled while its
    /// declared checksum still describes the true bytes.
    pub fn corrupt_first_fetch(mut self, archive_id: impl Into<String>) -> Self {
        self.corrupt_fetch.insert(archive_id.into());
        self
    }

    pub fn build(self) -> MockVaultClient {
        MockVaultClient {
            vault_name: self.vault_name,
            archives: self.archives,
            inventory_override: self.inventory_override,
            leaf_size: self.leaf_size,
            ready_after_polls: self.ready_after_polls,
            failing_archives: self.failing_archives,
            state: Mutex::new(MockState {
                initiate_faults: self.initiate_faults,
                fetch_faults: self.fetch_faults,
                corrupt_fetch: self.corrupt_fetch,
                ..Default::default()
            }),
        }
    }
}
