use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use inventory::InventoryReader;
use job_store::{JobState, JobStore};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::config::DuplicateArchivePolicy;
use crate::error::{Result, RetrievalError};
use crate::scheduler::RetrievalScheduler;

/// Caller-supplied input for one workflow run.
#[derive(Debug, Clone)]
pub struct WorkflowInput {
    pub workflow_run_id: String,
    pub vault_name: String,
}

/// Outcome of one completed (or drained) workflow run.
#[derive(Debug, Default, Clone)]
pub struct RunReport {
    pub scheduled_archives: usize,
    pub stored_archives: usize,
    pub failed_archives: usize,
    pub malformed_inventory_files: usize,
}

/// Aggregate per-state counts over every record of a run, read back from the
/// state store.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunStatus {
    counts: BTreeMap<JobState, usize>,
}

impl RunStatus {
    pub fn count(&self, state: JobState) -> usize {
        self.counts.get(&state).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn is_complete(&self) -> bool {
        self.counts
            .iter()
            .all(|(state, count)| state.is_terminal() || *count == 0)
    }

    pub fn counts(&self) -> &BTreeMap<JobState, usize> {
        &self.counts
    }
}

/// Handle to a running workflow.
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    cancel: Arc<AtomicBool>,
    grace: Duration,
    join: JoinHandle<Result<RunReport>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn wait(self) -> Result<RunReport> {
        self.join.await?
    }

    /// Requests cancellation and lets in-flight work drain for the
    /// configured grace period before abandoning it. Every record is left in
    /// its last durable state, ready for a future resume.
    pub async fn cancel(mut self) -> Result<()> {
        self.cancel.store(true, Ordering::Relaxed);
        info!(run_id = %self.run_id, "cancellation requested");
        match tokio::time::timeout(self.grace, &mut self.join).await {
            Ok(joined) => match joined {
                Ok(Ok(_)) | Ok(Err(RetrievalError::Cancelled)) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(e.into()),
            },
            Err(_) => {
                warn!(run_id = %self.run_id, "grace period elapsed; abandoning in-flight work");
                self.join.abort();
                let _ = (&mut self.join).await;
                Ok(())
            },
        }
    }
}

/// Groups one inventory-processing pass into a workflow run: retrieve the
/// inventory, then fan out one archive state machine per parsed record. The
/// parser's lazy sequence feeds the bounded archive pool directly, so a
/// multi-million-entry inventory is never materialized as a list.
pub struct WorkflowCoordinator {
    scheduler: Arc<RetrievalScheduler>,
    store: Arc<dyn JobStore>,
}

impl WorkflowCoordinator {
    pub fn new(scheduler: Arc<RetrievalScheduler>, store: Arc<dyn JobStore>) -> Self {
        Self { scheduler, store }
    }

    /// Starts (or idempotently resumes) the run described by `input`.
    /// Malformed input is rejected up front; nothing is scheduled.
    pub fn start(&self, input: WorkflowInput) -> Result<RunHandle> {
        if input.workflow_run_id.trim().is_empty() {
            return Err(RetrievalError::InvalidInput("workflow_run_id must not be empty".to_string()));
        }
        if input.vault_name.trim().is_empty() {
            return Err(RetrievalError::InvalidInput("vault_name must not be empty".to_string()));
        }

        let scheduler = self.scheduler.clone();
        let cancel = scheduler.cancellation_flag();
        let grace = scheduler.config().cancel_grace;
        let run_id = input.workflow_run_id.clone();
        info!(run_id = %run_id, vault = %input.vault_name, "workflow run starting");
        let join = tokio::spawn(async move { run_workflow(scheduler, input).await });
        Ok(RunHandle {
            run_id,
            cancel,
            grace,
            join,
        })
    }

    pub async fn status(&self, workflow_run_id: &str) -> Result<RunStatus> {
        let records = self.store.list_run(workflow_run_id).await?;
        let mut counts = BTreeMap::new();
        for record in records {
            *counts.entry(record.state).or_insert(0) += 1;
        }
        Ok(RunStatus { counts })
    }
}

async fn run_workflow(scheduler: Arc<RetrievalScheduler>, input: WorkflowInput) -> Result<RunReport> {
    let run_id = input.workflow_run_id;
    let vault_name = input.vault_name;
    let body = scheduler.run_inventory(&run_id, &vault_name).await?;
    let report = fan_out_inventory_files(scheduler, &run_id, &vault_name, vec![body]).await?;
    info!(
        run_id = %run_id,
        scheduled = report.scheduled_archives,
        stored = report.stored_archives,
        failed = report.failed_archives,
        "workflow run finished"
    );
    Ok(report)
}

/// Two-level fan-out: files, then archives within each file. A malformed
/// file stops only its own record stream; archives already scheduled from it
/// and all sibling files proceed.
async fn fan_out_inventory_files(
    scheduler: Arc<RetrievalScheduler>,
    run_id: &str,
    vault_name: &str,
    files: Vec<Bytes>,
) -> Result<RunReport> {
    let cancelled = scheduler.cancellation_flag();
    let archive_pool = Arc::new(Semaphore::new(scheduler.config().max_concurrent_archives));
    let policy = scheduler.config().duplicate_archive_policy;
    let mut tasks: JoinSet<Result<JobState>> = JoinSet::new();
    let mut report = RunReport::default();
    let mut run_cancelled = false;

    'files: for (file_index, file) in files.into_iter().enumerate() {
        for parsed in InventoryReader::new(Cursor::new(file)) {
            let archive = match parsed {
                Ok(archive) => archive,
                Err(e) => {
                    error!(file_index, "malformed inventory file: {e}");
                    report.malformed_inventory_files += 1;
                    continue 'files;
                },
            };

            // Surface already-finished workers before blocking on a slot.
            while let Some(joined) = tasks.try_join_next() {
                collect_archive_outcome(joined, &mut report, &mut run_cancelled)?;
            }

            if cancelled.load(Ordering::Relaxed) {
                run_cancelled = true;
                break 'files;
            }
            let permit = archive_pool
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| RetrievalError::Internal("archive semaphore closed".to_string()))?;

            let unit_id = match policy {
                DuplicateArchivePolicy::SingleJob => archive.archive_id.clone(),
                DuplicateArchivePolicy::PerInventoryFile => format!("{}#{file_index}", archive.archive_id),
            };
            let scheduler = scheduler.clone();
            let run_id = run_id.to_string();
            let vault_name = vault_name.to_string();
            report.scheduled_archives += 1;
            tasks.spawn(async move {
                let _slot = permit;
                scheduler.run_archive(&run_id, &vault_name, &archive, &unit_id).await
            });
        }
    }

    while let Some(joined) = tasks.join_next().await {
        collect_archive_outcome(joined, &mut report, &mut run_cancelled)?;
    }

    if run_cancelled {
        return Err(RetrievalError::Cancelled);
    }
    Ok(report)
}

fn collect_archive_outcome(
    joined: std::result::Result<Result<JobState>, tokio::task::JoinError>,
    report: &mut RunReport,
    run_cancelled: &mut bool,
) -> Result<()> {
    match joined {
        Ok(Ok(JobState::Stored)) => report.stored_archives += 1,
        Ok(Ok(JobState::Failed)) => report.failed_archives += 1,
        Ok(Ok(state)) => {
            // A worker only returns a non-terminal state when it stopped at
            // a cancellation checkpoint.
            warn!(%state, "archive worker stopped before a terminal state");
            *run_cancelled = true;
        },
        Ok(Err(RetrievalError::Cancelled)) => *run_cancelled = true,
        Ok(Err(e)) => return Err(e),
        Err(e) if e.is_cancelled() => *run_cancelled = true,
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use inventory::{ArchiveRecord, InventoryWriter};
    use job_store::{JobKey, JobKind, MemoryJobStore};
    use vault_client::{
        JobCompletionSource, JobKind as WireJobKind, MockVaultClient, PollingCompletionSource, RetryPolicy,
        VaultClient,
    };

    use super::*;
    use crate::config::RetrievalConfig;
    use crate::sink::{MemoryObjectSink, ObjectSink};

    struct Harness {
        vault: Arc<MockVaultClient>,
        store: Arc<MemoryJobStore>,
        scheduler: Arc<RetrievalScheduler>,
        coordinator: WorkflowCoordinator,
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
        let coordinator = WorkflowCoordinator::new(scheduler.clone(), store.clone() as Arc<dyn JobStore>);
        Harness {
            vault,
            store,
            scheduler,
            coordinator,
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
            .with_cancel_grace(Duration::from_millis(200))
    }

    fn inventory_file(records: &[(&str, &[u8])]) -> Bytes {
        let mut writer = InventoryWriter::new(Vec::new());
        for (archive_id, body) in records {
            writer
                .write_record(&ArchiveRecord {
                    archive_id: archive_id.to_string(),
                    description: format!("description for {archive_id}"),
                    creation_date: chrono::Utc::now(),
                    size_bytes: body.len() as u64,
                    content_hash: tree_hash::compute(body, 4),
                })
                .unwrap();
        }
        Bytes::from(writer.finish().unwrap())
    }

    #[tokio::test]
    async fn test_run_stores_every_archive() {
        let h = harness(
            MockVaultClient::builder("vault-a")
                .archive("a1", "TESTBODY")
                .archive("a2", "TESTBODY2")
                .leaf_size(4)
                .build(),
            test_config(),
        );

        let handle = h
            .coordinator
            .start(WorkflowInput {
                workflow_run_id: "run-1".into(),
                vault_name: "vault-a".into(),
            })
            .unwrap();
        let report = handle.wait().await.unwrap();
        assert_eq!(report.scheduled_archives, 2);
        assert_eq!(report.stored_archives, 2);
        assert_eq!(report.failed_archives, 0);

        let status = h.coordinator.status("run-1").await.unwrap();
        // Two archives plus the inventory record.
        assert_eq!(status.count(JobState::Stored), 3);
        assert!(status.is_complete());
    }

    #[tokio::test]
    async fn test_empty_input_rejected() {
        let h = harness(MockVaultClient::builder("vault-a").build(), test_config());
        let err = h
            .coordinator
            .start(WorkflowInput {
                workflow_run_id: "  ".into(),
                vault_name: "vault-a".into(),
            })
            .unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidInput(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_malformed_file_isolated_from_siblings() {
        let h = harness(
            MockVaultClient::builder("vault-a").archive("a1", "TESTBODY").leaf_size(4).build(),
            test_config(),
        );

        let good = inventory_file(&[("a1", b"TESTBODY")]);
        let bad = Bytes::from_static(b"ArchiveId,ArchiveDescription,CreationDate,Size,SHA256TreeHash\r\nonly,two\r\n");
        let report = fan_out_inventory_files(h.scheduler.clone(), "run-1", "vault-a", vec![bad, good])
            .await
            .unwrap();

        assert_eq!(report.malformed_inventory_files, 1);
        assert_eq!(report.scheduled_archives, 1);
        assert_eq!(report.stored_archives, 1);
    }

    #[tokio::test]
    async fn test_duplicate_archive_single_job_policy() {
        let h = harness(
            MockVaultClient::builder("vault-a").archive("a1", "TESTBODY").leaf_size(4).build(),
            test_config(),
        );

        let file = inventory_file(&[("a1", b"TESTBODY")]);
        let report =
            fan_out_inventory_files(h.scheduler.clone(), "run-1", "vault-a", vec![file.clone(), file])
                .await
                .unwrap();

        assert_eq!(report.scheduled_archives, 2);
        assert_eq!(report.stored_archives, 2);
        assert_eq!(h.vault.initiate_count(WireJobKind::ArchiveRetrieval, Some("a1")), 1);
    }

    #[tokio::test]
    async fn test_duplicate_archive_per_file_policy() {
        let h = harness(
            MockVaultClient::builder("vault-a").archive("a1", "TESTBODY").leaf_size(4).build(),
            test_config().with_duplicate_archive_policy(DuplicateArchivePolicy::PerInventoryFile),
        );

        let file = inventory_file(&[("a1", b"TESTBODY")]);
        fan_out_inventory_files(h.scheduler.clone(), "run-1", "vault-a", vec![file.clone(), file])
            .await
            .unwrap();

        assert_eq!(h.vault.initiate_count(WireJobKind::ArchiveRetrieval, Some("a1")), 2);
        assert!(h.store.get(&JobKey::meta(JobKind::ArchiveRetrieval, "a1#0")).await.unwrap().is_some());
        assert!(h.store.get(&JobKey::meta(JobKind::ArchiveRetrieval, "a1#1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cancel_leaves_resumable_state() {
        let h = harness(
            MockVaultClient::builder("vault-a")
                .archive("a1", "TESTBODY")
                .leaf_size(4)
                .ready_after_polls(u32::MAX)
                .build(),
            test_config().with_poll_interval(Duration::from_millis(5)),
        );

        let handle = h
            .coordinator
            .start(WorkflowInput {
                workflow_run_id: "run-1".into(),
                vault_name: "vault-a".into(),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel().await.unwrap();

        let status = h.coordinator.status("run-1").await.unwrap();
        assert!(!status.is_complete());
        assert_eq!(status.count(JobState::Failed), 0);
    }
}
