use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{JobStoreError, Result};
use crate::record::{JobKey, JobRecord, JobState};
use crate::store::JobStore;

/// In-memory [`JobStore`] used by tests and the demo path. The conditional
/// write is performed under one mutex, which gives the same atomicity the
/// durable backend provides via conditional expressions.
#[derive(Default)]
pub struct MemoryJobStore {
    records: Mutex<HashMap<(String, String), JobRecord>>,
    unavailable: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates store infrastructure being down; every call fails with
    /// [`JobStoreError::Unavailable`] until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(JobStoreError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }

    fn map_key(key: &JobKey) -> (String, String) {
        (key.partition_key.clone(), key.sort_key.clone())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(String, String), JobRecord>>> {
        self.records
            .lock()
            .map_err(|e| JobStoreError::Unavailable(format!("store mutex poisoned: {e}")))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, key: &JobKey) -> Result<Option<JobRecord>> {
        self.check_available()?;
        Ok(self.lock()?.get(&Self::map_key(key)).cloned())
    }

    async fn put_if(&self, record: &JobRecord, expected_prior: Option<JobState>) -> Result<()> {
        self.check_available()?;
        let mut records = self.lock()?;
        let map_key = Self::map_key(&record.key);

        let actual = records.get(&map_key).map(|r| r.state);
        if actual != expected_prior {
            return Err(JobStoreError::StateConflict {
                expected: expected_prior,
                actual,
            });
        }

        debug!(
            partition_key = %record.key.partition_key,
            state = %record.state,
            "job record written"
        );
        records.insert(map_key, record.clone());
        Ok(())
    }

    async fn delete(&self, key: &JobKey) -> Result<()> {
        self.check_available()?;
        self.lock()?.remove(&Self::map_key(key));
        Ok(())
    }

    async fn list_run(&self, workflow_run_id: &str) -> Result<Vec<JobRecord>> {
        self.check_available()?;
        let records = self.lock()?;
        Ok(records
            .values()
            .filter(|r| r.workflow_run_id == workflow_run_id)
            .cloned()
            .collect())
    }
}
