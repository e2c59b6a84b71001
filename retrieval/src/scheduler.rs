use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use inventory::ArchiveRecord;
use job_store::{JobKey, JobKind, JobRecord, JobState, JobStore, JobStoreError, SinkLocation};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tracing::{debug, error, info, warn};
use tree_hash::TreeDigest;
use vault_client::{
    retry_transient, ByteRange, JobCompletionSource, JobKind as WireJobKind, RetryPolicy, VaultClient,
    VaultClientError,
};

use crate::assembler::ArchiveAssembler;
use crate::chunk_plan::chunk_plan;
use crate::config::RetrievalConfig;
use crate::error::{Result, RetrievalError};
use crate::sink::ObjectSink;

/// Drives every retrieval unit through its durable state machine.
///
/// One scheduler instance is shared by all archive workers of a run. It owns
/// the global in-flight request bound; per-archive chunk concurrency is bound
/// separately inside [`RetrievalScheduler::download_archive`]. All record
/// writes go through conditional puts, so a second worker racing on the same
/// unit loses the write, adopts the stored record, and recomputes its next
/// transition instead of double-advancing.
pub struct RetrievalScheduler {
    vault: Arc<dyn VaultClient>,
    completion: Arc<dyn JobCompletionSource>,
    store: Arc<dyn JobStore>,
    sink: Arc<dyn ObjectSink>,
    config: RetrievalConfig,
    inflight: Arc<Semaphore>,
    cancelled: Arc<AtomicBool>,
}

impl RetrievalScheduler {
    pub fn new(
        vault: Arc<dyn VaultClient>,
        completion: Arc<dyn JobCompletionSource>,
        store: Arc<dyn JobStore>,
        sink: Arc<dyn ObjectSink>,
        config: RetrievalConfig,
    ) -> Result<Self> {
        config.validate()?;
        let inflight = Arc::new(Semaphore::new(config.max_inflight_requests));
        Ok(Self {
            vault,
            completion,
            store,
            sink,
            config,
            inflight,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Shared flag observed at every suspension point. Setting it stops the
    /// run at the next checkpoint; no record is left mid-transition.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Conditional write of `record`. Returns `true` if our write landed.
    /// On a state conflict the stored record is adopted into `record` and
    /// `false` is returned so the caller recomputes its transition.
    async fn commit(&self, record: &mut JobRecord, expected_prior: Option<JobState>) -> Result<bool> {
        match self.store.put_if(record, expected_prior).await {
            Ok(()) => Ok(true),
            Err(JobStoreError::StateConflict { .. }) => {
                let stored = self.store.get(&record.key).await?.ok_or_else(|| {
                    RetrievalError::Internal(format!("record {} vanished during conflict resolution", record.key.partition_key))
                })?;
                debug!(
                    unit = %record.key.partition_key,
                    stored_state = %stored.state,
                    "lost a conditional write; adopting stored record"
                );
                *record = stored;
                Ok(false)
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Creates the unit's record, or adopts the existing one. Under
    /// concurrent claims for the same key exactly one insert succeeds; every
    /// other claimant observes the winner's record.
    async fn claim(&self, template: JobRecord) -> Result<JobRecord> {
        if let Some(existing) = self.store.get(&template.key).await? {
            debug!(unit = %template.key.partition_key, state = %existing.state, "adopting existing record");
            return Ok(existing);
        }
        let mut record = template;
        if self.commit(&mut record, None).await? {
            info!(unit = %record.key.partition_key, "created job record");
        }
        Ok(record)
    }

    async fn fail(&self, record: &mut JobRecord, reason: String) -> Result<()> {
        error!(unit = %record.key.partition_key, state = %record.state, reason, "retrieval unit failed");
        let prior = record.state;
        record.state = JobState::Failed;
        record.failure_reason = Some(reason);
        record.completion_timestamp = Some(Utc::now());
        self.commit(record, Some(prior)).await?;
        Ok(())
    }

    async fn acquire_request_slot(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        self.inflight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RetrievalError::Internal("request semaphore closed".to_string()))
    }

    async fn initiate(
        &self,
        vault_name: &str,
        kind: WireJobKind,
        archive_id: Option<&str>,
    ) -> std::result::Result<String, VaultClientError> {
        let _slot = self
            .inflight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| VaultClientError::Other("request semaphore closed".to_string()))?;
        retry_transient(self.config.chunk_retry, "initiate_job", || {
            self.vault.initiate_job(vault_name, kind, archive_id)
        })
        .await
    }

    /// Watches a record another worker is driving until it changes, up to
    /// `bound`. Returns `true` if the record moved; `false` means the owner
    /// is presumed dead and the caller should take the phase over.
    async fn wait_for_progress(&self, record: &mut JobRecord, bound: std::time::Duration) -> Result<bool> {
        let from_state = record.state;
        let from_job = record.job_id.clone();
        let deadline = tokio::time::Instant::now() + bound;
        while tokio::time::Instant::now() < deadline {
            if self.is_cancelled() {
                return Err(RetrievalError::Cancelled);
            }
            tokio::time::sleep(self.config.poll_interval).await;
            let stored = self.store.get(&record.key).await?.ok_or_else(|| {
                RetrievalError::Internal(format!("record {} vanished mid-run", record.key.partition_key))
            })?;
            let moved = stored.state != from_state || stored.job_id != from_job;
            *record = stored;
            if moved {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Runs one archive to a terminal state. Per-archive failures end in a
    /// durable `Failed` record and a normal return; only store unavailability
    /// and cancellation propagate as errors.
    ///
    /// Side-effecting phases (vault initiation, the chunk download) run only
    /// in the worker whose conditional write entered the owning state; every
    /// other worker racing on the same unit watches the record instead.
    pub async fn run_archive(
        &self,
        workflow_run_id: &str,
        vault_name: &str,
        archive: &ArchiveRecord,
        unit_id: &str,
    ) -> Result<JobState> {
        let key = JobKey::meta(JobKind::ArchiveRetrieval, unit_id);
        let mut template = JobRecord::new(key, workflow_run_id, JobKind::ArchiveRetrieval, vault_name, SinkLocation {
            bucket: self.config.sink_bucket.clone(),
            key: format!("{workflow_run_id}/archives/{unit_id}"),
        });
        template.archive_id = Some(archive.archive_id.clone());
        template.archive_size = archive.size_bytes;
        template.description = archive.description.clone();

        let mut record = self.claim(template).await?;
        let mut leaf_digests: Option<Vec<TreeDigest>> = None;
        let mut job_attempts_left = self.config.job_retry_attempts;
        let mut owns_request = false;
        let mut owns_download = false;

        loop {
            if record.state.is_terminal() {
                return Ok(record.state);
            }
            if self.is_cancelled() {
                info!(unit = %record.key.partition_key, state = %record.state, "cancelled; leaving last durable state");
                return Err(RetrievalError::Cancelled);
            }

            match record.state {
                JobState::Pending => {
                    record.state = JobState::JobRequested;
                    record.job_id = None;
                    owns_request = self.commit(&mut record, Some(JobState::Pending)).await?;
                },
                JobState::JobRequested => {
                    if record.job_id.is_some() {
                        record.state = JobState::JobInProgress;
                        self.commit(&mut record, Some(JobState::JobRequested)).await?;
                    } else if owns_request {
                        match self
                            .initiate(vault_name, WireJobKind::ArchiveRetrieval, Some(&archive.archive_id))
                            .await
                        {
                            Ok(job_id) => {
                                info!(unit = %record.key.partition_key, job_id, "archive retrieval job initiated");
                                record.state = JobState::JobInProgress;
                                record.job_id = Some(job_id);
                                self.commit(&mut record, Some(JobState::JobRequested)).await?;
                                owns_request = false;
                            },
                            Err(e) => self.fail(&mut record, format!("job initiation failed: {e}")).await?,
                        }
                    } else if !self.wait_for_progress(&mut record, self.config.job_ready_ceiling).await? {
                        // Whoever won the request phase is gone; take it over.
                        owns_request = true;
                    }
                },
                JobState::JobInProgress => {
                    let Some(job_id) = record.job_id.clone() else {
                        // Inconsistent record adopted from elsewhere; restart.
                        record.state = JobState::Pending;
                        self.commit(&mut record, Some(JobState::JobInProgress)).await?;
                        continue;
                    };
                    match self
                        .completion
                        .wait_ready(vault_name, &job_id, self.config.job_ready_ceiling)
                        .await
                    {
                        Ok(description) => {
                            if let Some(size) = description.size_bytes {
                                if size != archive.size_bytes {
                                    self.fail(
                                        &mut record,
                                        format!(
                                            "vault job size {size} disagrees with inventory size {}",
                                            archive.size_bytes
                                        ),
                                    )
                                    .await?;
                                    continue;
                                }
                            }
                            if let Some(declared) = &description.content_hash {
                                if *declared != archive.content_hash {
                                    self.fail(
                                        &mut record,
                                        format!(
                                            "vault job hash {declared} disagrees with inventory hash {}",
                                            archive.content_hash
                                        ),
                                    )
                                    .await?;
                                    continue;
                                }
                            }
                            record.state = JobState::JobReady;
                            self.commit(&mut record, Some(JobState::JobInProgress)).await?;
                        },
                        Err(
                            e @ (VaultClientError::JobAborted { .. } | VaultClientError::CompletionTimeout { .. }),
                        ) => {
                            if job_attempts_left > 0 {
                                job_attempts_left -= 1;
                                warn!(
                                    unit = %record.key.partition_key,
                                    job_id,
                                    attempts_left = job_attempts_left,
                                    "job unusable, initiating a fresh one: {e}"
                                );
                                record.state = JobState::Pending;
                                record.job_id = None;
                                self.commit(&mut record, Some(JobState::JobInProgress)).await?;
                            } else {
                                self.fail(&mut record, format!("job retries exhausted: {e}")).await?;
                            }
                        },
                        Err(e) => self.fail(&mut record, format!("completion wait failed: {e}")).await?,
                    }
                },
                JobState::JobReady => {
                    record.state = JobState::Downloading;
                    owns_download = self.commit(&mut record, Some(JobState::JobReady)).await?;
                },
                JobState::Downloading => {
                    if owns_download {
                        let Some(job_id) = record.job_id.clone() else {
                            self.fail(&mut record, "downloading without a job id".to_string()).await?;
                            continue;
                        };
                        match self.download_archive(vault_name, &job_id, &record).await {
                            Ok(digests) => {
                                leaf_digests = Some(digests);
                                record.state = JobState::Verifying;
                                self.commit(&mut record, Some(JobState::Downloading)).await?;
                            },
                            Err(e) if e.is_fatal() => return Err(e),
                            Err(e) => self.fail(&mut record, format!("download failed: {e}")).await?,
                        }
                    } else if !self.wait_for_progress(&mut record, self.config.job_ready_ceiling).await? {
                        owns_download = true;
                    }
                },
                JobState::Verifying => match leaf_digests.take() {
                    Some(digests) => {
                        let computed = tree_hash::combine(&digests);
                        if computed == archive.content_hash {
                            let reference = self.sink.finalize(&record.sink_location).await?;
                            info!(unit = %record.key.partition_key, reference, "archive stored");
                            record.state = JobState::Stored;
                            record.completion_timestamp = Some(Utc::now());
                            self.commit(&mut record, Some(JobState::Verifying)).await?;
                        } else {
                            self.fail(
                                &mut record,
                                format!(
                                    "archive hash mismatch: expected {}, computed {computed}",
                                    archive.content_hash
                                ),
                            )
                            .await?;
                        }
                    },
                    None => {
                        // Another worker holds the chunk digests. If it never
                        // finishes, the fetch has to be redone from scratch.
                        if !self.wait_for_progress(&mut record, self.config.job_ready_ceiling).await? {
                            record.state = JobState::Downloading;
                            owns_download = self.commit(&mut record, Some(JobState::Verifying)).await?;
                        }
                    },
                },
                JobState::Stored | JobState::Failed => return Ok(record.state),
            }
        }
    }

    /// Fetches all chunks of one ready job, bounded by the per-archive chunk
    /// pool and the global request pool, writing through the reorder buffer.
    /// Returns the ordered leaf digests of every accepted chunk.
    async fn download_archive(&self, vault_name: &str, job_id: &str, record: &JobRecord) -> Result<Vec<TreeDigest>> {
        let plan = chunk_plan(record.archive_size, self.config.chunk_size);
        if plan.is_empty() {
            self.sink.put_whole(&record.sink_location, Bytes::new()).await?;
            return Ok(Vec::new());
        }
        let chunk_count = plan.len();
        let assembler = Arc::new(ArchiveAssembler::new(
            self.sink.clone(),
            record.sink_location.clone(),
            record.archive_size,
        ));
        let chunk_pool = Arc::new(Semaphore::new(self.config.max_concurrent_chunks));
        let mut tasks: JoinSet<Result<(usize, Vec<TreeDigest>)>> = JoinSet::new();

        for (index, range) in plan.into_iter().enumerate() {
            let slot = chunk_pool
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| RetrievalError::Internal("chunk semaphore closed".to_string()))?;
            if self.is_cancelled() {
                tasks.abort_all();
                return Err(RetrievalError::Cancelled);
            }
            let vault = self.vault.clone();
            let inflight = self.inflight.clone();
            let cancelled = self.cancelled.clone();
            let assembler = assembler.clone();
            let vault_name = vault_name.to_string();
            let job_id = job_id.to_string();
            let leaf_size = self.config.leaf_size;
            let policy = self.config.chunk_retry;
            tasks.spawn(async move {
                let _slot = slot;
                let (data, digests) =
                    fetch_verified_chunk(vault, inflight, cancelled, &vault_name, &job_id, range, leaf_size, policy)
                        .await?;
                assembler.accept(range.start, data).await?;
                Ok((index, digests))
            });
        }

        let mut per_chunk: Vec<Option<Vec<TreeDigest>>> = vec![None; chunk_count];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((index, digests))) => per_chunk[index] = Some(digests),
                Ok(Err(e)) => {
                    tasks.abort_all();
                    return Err(e);
                },
                Err(e) if e.is_cancelled() => {},
                Err(e) => {
                    tasks.abort_all();
                    return Err(e.into());
                },
            }
        }
        assembler.finish().await?;

        let mut leaves = Vec::new();
        for slot in per_chunk {
            let digests = slot.ok_or_else(|| RetrievalError::Internal("chunk finished without digests".to_string()))?;
            leaves.extend(digests);
        }
        Ok(leaves)
    }

    /// Runs the inventory listing to completion and returns its body. The
    /// reduced path skips `Verifying`; the stored object is the CSV itself.
    /// On resume after success the body is refetched from the recorded job
    /// without a new initiation.
    pub async fn run_inventory(&self, workflow_run_id: &str, vault_name: &str) -> Result<Bytes> {
        let key = JobKey::meta(JobKind::InventoryRetrieval, workflow_run_id);
        let template = JobRecord::new(key, workflow_run_id, JobKind::InventoryRetrieval, vault_name, SinkLocation {
            bucket: self.config.sink_bucket.clone(),
            key: format!("{workflow_run_id}/inventory/0.csv"),
        });
        let mut record = self.claim(template).await?;
        let mut job_attempts_left = self.config.job_retry_attempts;

        loop {
            if self.is_cancelled() && !record.state.is_terminal() {
                return Err(RetrievalError::Cancelled);
            }

            match record.state {
                JobState::Pending => match self.initiate(vault_name, WireJobKind::InventoryRetrieval, None).await {
                    Ok(job_id) => {
                        info!(run_id = workflow_run_id, job_id, "inventory retrieval job initiated");
                        record.state = JobState::JobRequested;
                        record.job_id = Some(job_id);
                        self.commit(&mut record, Some(JobState::Pending)).await?;
                    },
                    Err(e) => {
                        self.fail(&mut record, format!("inventory job initiation failed: {e}")).await?;
                        return Err(e.into());
                    },
                },
                JobState::JobRequested => {
                    record.state = JobState::JobInProgress;
                    self.commit(&mut record, Some(JobState::JobRequested)).await?;
                },
                JobState::JobInProgress => {
                    let Some(job_id) = record.job_id.clone() else {
                        record.state = JobState::Pending;
                        self.commit(&mut record, Some(JobState::JobInProgress)).await?;
                        continue;
                    };
                    match self
                        .completion
                        .wait_ready(vault_name, &job_id, self.config.job_ready_ceiling)
                        .await
                    {
                        Ok(_) => {
                            record.state = JobState::JobReady;
                            self.commit(&mut record, Some(JobState::JobInProgress)).await?;
                        },
                        Err(
                            e @ (VaultClientError::JobAborted { .. } | VaultClientError::CompletionTimeout { .. }),
                        ) if job_attempts_left > 0 => {
                            job_attempts_left -= 1;
                            warn!(run_id = workflow_run_id, job_id, "inventory job unusable, re-initiating: {e}");
                            record.state = JobState::Pending;
                            record.job_id = None;
                            self.commit(&mut record, Some(JobState::JobInProgress)).await?;
                        },
                        Err(e) => {
                            self.fail(&mut record, format!("inventory completion wait failed: {e}")).await?;
                            return Err(e.into());
                        },
                    }
                },
                JobState::JobReady => {
                    record.state = JobState::Downloading;
                    self.commit(&mut record, Some(JobState::JobReady)).await?;
                },
                JobState::Downloading => {
                    let Some(job_id) = record.job_id.clone() else {
                        let reason = "downloading inventory without a job id".to_string();
                        self.fail(&mut record, reason.clone()).await?;
                        return Err(RetrievalError::Internal(reason));
                    };
                    let body = self.fetch_whole_output(vault_name, &job_id).await?;
                    self.sink.put_whole(&record.sink_location, body.clone()).await?;
                    self.sink.finalize(&record.sink_location).await?;
                    record.state = JobState::Stored;
                    record.completion_timestamp = Some(Utc::now());
                    self.commit(&mut record, Some(JobState::Downloading)).await?;
                    info!(run_id = workflow_run_id, bytes = body.len(), "inventory stored");
                    return Ok(body);
                },
                JobState::Stored => {
                    let Some(job_id) = record.job_id.clone() else {
                        return Err(RetrievalError::Internal("stored inventory record has no job id".to_string()));
                    };
                    debug!(run_id = workflow_run_id, job_id, "inventory already stored; refetching body");
                    return self.fetch_whole_output(vault_name, &job_id).await;
                },
                JobState::Failed if job_attempts_left > 0 => {
                    job_attempts_left -= 1;
                    warn!(run_id = workflow_run_id, "previous inventory attempt failed; restarting");
                    record.state = JobState::Pending;
                    record.job_id = None;
                    record.failure_reason = None;
                    record.completion_timestamp = None;
                    self.commit(&mut record, Some(JobState::Failed)).await?;
                },
                JobState::Failed => {
                    return Err(RetrievalError::Internal(
                        record
                            .failure_reason
                            .clone()
                            .unwrap_or_else(|| "inventory retrieval failed".to_string()),
                    ));
                },
                JobState::Verifying => {
                    return Err(RetrievalError::Internal(
                        "inventory record in verifying state; the reduced path never enters it".to_string(),
                    ));
                },
            }
        }
    }

    async fn fetch_whole_output(&self, vault_name: &str, job_id: &str) -> Result<Bytes> {
        let _slot = self.acquire_request_slot().await?;
        let output = retry_transient(self.config.chunk_retry, "get_job_output", || {
            self.vault.get_job_output(vault_name, job_id, None)
        })
        .await?;
        Ok(output.data)
    }
}

/// One chunk fetch with its own bounded retry loop: transient faults back
/// off and retry; a checksum mismatch discards the bytes and refetches the
/// same range (transit corruption is retryable, the source is not).
#[allow(clippy::too_many_arguments)]
async fn fetch_verified_chunk(
    vault: Arc<dyn VaultClient>,
    inflight: Arc<Semaphore>,
    cancelled: Arc<AtomicBool>,
    vault_name: &str,
    job_id: &str,
    range: ByteRange,
    leaf_size: usize,
    policy: RetryPolicy,
) -> Result<(Bytes, Vec<TreeDigest>)> {
    let mut delays = ExponentialBackoff::from_millis(policy.base_delay.as_millis().min(u64::MAX as u128) as u64)
        .max_delay(policy.max_delay)
        .map(jitter);
    let mut last_err: Option<RetrievalError> = None;

    for attempt in 1..=policy.max_attempts.max(1) {
        if cancelled.load(Ordering::Relaxed) {
            return Err(RetrievalError::Cancelled);
        }
        let outcome = {
            let _slot = inflight
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| RetrievalError::Internal("request semaphore closed".to_string()))?;
            vault.get_job_output(vault_name, job_id, Some(range)).await
        };

        match outcome {
            Ok(output) if output.data.len() as u64 != range.length() => {
                warn!(job_id, range = %range.range_header(), attempt, got = output.data.len(), "short chunk read");
                last_err = Some(RetrievalError::Internal(format!(
                    "short read for range {}: got {} bytes",
                    range.range_header(),
                    output.data.len()
                )));
            },
            Ok(output) => {
                let digests = tree_hash::leaf_digests(&output.data, leaf_size);
                let computed = tree_hash::combine(&digests);
                match output.checksum {
                    Some(declared) if declared != computed => {
                        warn!(
                            job_id,
                            range = %range.range_header(),
                            attempt,
                            %declared,
                            %computed,
                            "chunk checksum mismatch; discarding and refetching"
                        );
                        last_err = Some(RetrievalError::Integrity {
                            unit: format!("job {job_id} range {}", range.range_header()),
                            expected: declared,
                            actual: computed,
                        });
                    },
                    _ => return Ok((output.data, digests)),
                }
            },
            Err(e) if e.is_retryable() => {
                warn!(job_id, range = %range.range_header(), attempt, "transient chunk fault: {e}");
                last_err = Some(e.into());
            },
            Err(e) => return Err(e.into()),
        }

        if attempt < policy.max_attempts {
            if let Some(delay) = delays.next() {
                tokio::time::sleep(delay).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| RetrievalError::Internal("chunk fetch produced no outcome".to_string())))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use job_store::MemoryJobStore;
    use vault_client::{MockVaultClient, PollingCompletionSource};

    use super::*;
    use crate::sink::MemoryObjectSink;

    struct Harness {
        vault: Arc<MockVaultClient>,
        store: Arc<MemoryJobStore>,
        sink: Arc<MemoryObjectSink>,
        scheduler: Arc<RetrievalScheduler>,
    }

    fn harness(vault: MockVaultClient, config: RetrievalConfig) -> Harness {
        let vault = Arc::new(vault);
        let store = Arc::new(MemoryJobStore::new());
        let sink = Arc::new(MemoryObjectSink::new());
        let completion: Arc<dyn JobCompletionSource> = Arc::new(PollingCompletionSource::new(
            vault.clone() as Arc<dyn VaultClient>,
            Duration::from_millis(1),
        ));
        let scheduler = Arc::new(
            RetrievalScheduler::new(
                vault.clone() as Arc<dyn VaultClient>,
                completion,
                store.clone() as Arc<dyn JobStore>,
                sink.clone() as Arc<dyn ObjectSink>,
                config,
            )
            .unwrap(),
        );
        Harness {
            vault,
            store,
            sink,
            scheduler,
        }
    }

    fn test_config() -> RetrievalConfig {
        RetrievalConfig::default()
            .with_chunk_size(4)
            .with_leaf_size(4)
            .with_chunk_retry(RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            })
            .with_poll_interval(Duration::from_millis(1))
            .with_job_ready_ceiling(Duration::from_secs(5))
    }

    fn archive_record(archive_id: &str, body: &[u8], leaf_size: usize) -> ArchiveRecord {
        ArchiveRecord {
            archive_id: archive_id.to_string(),
            description: format!("description for {archive_id}"),
            creation_date: Utc::now(),
            size_bytes: body.len() as u64,
            content_hash: tree_hash::compute(body, leaf_size),
        }
    }

    #[tokio::test]
    async fn test_archive_reaches_stored() {
        let h = harness(
            MockVaultClient::builder("vault-a").archive("a1", "TESTBODY").leaf_size(4).build(),
            test_config(),
        );
        let archive = archive_record("a1", b"TESTBODY", 4);

        let state = h.scheduler.run_archive("run-1", "vault-a", &archive, "a1").await.unwrap();
        assert_eq!(state, JobState::Stored);

        let record = h
            .store
            .get(&JobKey::meta(JobKind::ArchiveRetrieval, "a1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, JobState::Stored);
        assert!(record.job_id.is_some());
        assert!(record.completion_timestamp.is_some());

        let stored = h.sink.object(&record.sink_location).unwrap();
        assert_eq!(&stored[..], b"TESTBODY");
        assert!(h.sink.is_finalized(&record.sink_location));
    }

    #[tokio::test]
    async fn test_at_most_one_job_under_concurrent_claims() {
        let h = harness(
            MockVaultClient::builder("vault-a").archive("a1", "TESTBODY").leaf_size(4).build(),
            test_config(),
        );
        let archive = Arc::new(archive_record("a1", b"TESTBODY", 4));

        let mut tasks = JoinSet::new();
        for _ in 0..32 {
            let scheduler = h.scheduler.clone();
            let archive = archive.clone();
            tasks.spawn(async move { scheduler.run_archive("run-1", "vault-a", &archive, "a1").await });
        }
        while let Some(joined) = tasks.join_next().await {
            assert_eq!(joined.unwrap().unwrap(), JobState::Stored);
        }
        assert_eq!(h.vault.initiate_count(WireJobKind::ArchiveRetrieval, Some("a1")), 1);
    }

    #[tokio::test]
    async fn test_terminal_record_skips_all_work() {
        let h = harness(
            MockVaultClient::builder("vault-a").archive("a1", "TESTBODY").leaf_size(4).build(),
            test_config(),
        );
        let archive = archive_record("a1", b"TESTBODY", 4);

        h.scheduler.run_archive("run-1", "vault-a", &archive, "a1").await.unwrap();
        let state = h.scheduler.run_archive("run-1", "vault-a", &archive, "a1").await.unwrap();
        assert_eq!(state, JobState::Stored);
        assert_eq!(h.vault.initiate_count(WireJobKind::ArchiveRetrieval, Some("a1")), 1);
    }

    #[tokio::test]
    async fn test_aborted_job_reinitiated_then_failed() {
        let h = harness(
            MockVaultClient::builder("vault-a")
                .archive("a1", "TESTBODY")
                .leaf_size(4)
                .fail_archive_job("a1")
                .build(),
            test_config().with_job_retry_attempts(1),
        );
        let archive = archive_record("a1", b"TESTBODY", 4);

        let state = h.scheduler.run_archive("run-1", "vault-a", &archive, "a1").await.unwrap();
        assert_eq!(state, JobState::Failed);
        // Original job plus one fresh job after the abort.
        assert_eq!(h.vault.initiate_count(WireJobKind::ArchiveRetrieval, Some("a1")), 2);

        let record = h
            .store
            .get(&JobKey::meta(JobKind::ArchiveRetrieval, "a1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert!(record.failure_reason.is_some());
    }

    #[tokio::test]
    async fn test_corrupted_chunk_is_refetched() {
        let h = harness(
            MockVaultClient::builder("vault-a")
                .archive("a1", "TESTBODY")
                .leaf_size(4)
                .corrupt_first_fetch("a1")
                .build(),
            test_config(),
        );
        let archive = archive_record("a1", b"TESTBODY", 4);

        let state = h.scheduler.run_archive("run-1", "vault-a", &archive, "a1").await.unwrap();
        assert_eq!(state, JobState::Stored);
        let record = h
            .store
            .get(&JobKey::meta(JobKind::ArchiveRetrieval, "a1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&h.sink.object(&record.sink_location).unwrap()[..], b"TESTBODY");
    }

    #[tokio::test]
    async fn test_transient_initiation_faults_are_retried() {
        let h = harness(
            MockVaultClient::builder("vault-a")
                .archive("a1", "TESTBODY")
                .leaf_size(4)
                .transient_initiate_faults(2)
                .build(),
            test_config(),
        );
        let archive = archive_record("a1", b"TESTBODY", 4);

        let state = h.scheduler.run_archive("run-1", "vault-a", &archive, "a1").await.unwrap();
        assert_eq!(state, JobState::Stored);
        assert_eq!(h.vault.initiate_count(WireJobKind::ArchiveRetrieval, Some("a1")), 3);
    }

    #[tokio::test]
    async fn test_inventory_reduced_path() {
        let h = harness(
            MockVaultClient::builder("vault-a")
                .archive("a1", "TESTBODY")
                .archive("a2", "TESTBODY2")
                .leaf_size(4)
                .build(),
            test_config(),
        );

        let body = h.scheduler.run_inventory("run-1", "vault-a").await.unwrap();
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.starts_with("ArchiveId,ArchiveDescription,CreationDate,Size,SHA256TreeHash\r\n"));

        let record = h
            .store
            .get(&JobKey::meta(JobKind::InventoryRetrieval, "run-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, JobState::Stored);
        assert!(h.sink.is_finalized(&record.sink_location));

        // Resume refetches the body without a second initiation.
        let again = h.scheduler.run_inventory("run-1", "vault-a").await.unwrap();
        assert_eq!(again, body);
        assert_eq!(h.vault.initiate_count(WireJobKind::InventoryRetrieval, None), 1);
    }

    #[tokio::test]
    async fn test_store_outage_aborts_instead_of_failing_the_unit() {
        let h = harness(
            MockVaultClient::builder("vault-a")
                .archive("a1", "TESTBODY")
                .leaf_size(4)
                .ready_after_polls(u32::MAX)
                .build(),
            test_config().with_job_ready_ceiling(Duration::from_millis(50)),
        );
        let archive = archive_record("a1", b"TESTBODY", 4);

        let scheduler = h.scheduler.clone();
        let worker =
            tokio::spawn(async move { scheduler.run_archive("run-1", "vault-a", &archive, "a1").await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.store.set_unavailable(true);

        // A broken store is fatal for the run, not a per-unit Failed record.
        let err = worker.await.unwrap().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            RetrievalError::Store(JobStoreError::Unavailable(_))
        ));

        h.store.set_unavailable(false);
        let record = h
            .store
            .get(&JobKey::meta(JobKind::ArchiveRetrieval, "a1"))
            .await
            .unwrap()
            .unwrap();
        assert!(!record.state.is_terminal());
    }

    #[tokio::test]
    async fn test_cancellation_leaves_durable_state() {
        let h = harness(
            MockVaultClient::builder("vault-a").archive("a1", "TESTBODY").leaf_size(4).build(),
            test_config(),
        );
        let archive = archive_record("a1", b"TESTBODY", 4);

        h.scheduler.cancellation_flag().store(true, Ordering::Relaxed);
        let err = h.scheduler.run_archive("run-1", "vault-a", &archive, "a1").await.unwrap_err();
        assert!(matches!(err, RetrievalError::Cancelled));

        let record = h
            .store
            .get(&JobKey::meta(JobKind::ArchiveRetrieval, "a1"))
            .await
            .unwrap()
            .unwrap();
        assert!(!record.state.is_terminal());
        assert_eq!(h.vault.initiate_count(WireJobKind::ArchiveRetrieval, Some("a1")), 0);
    }
}
