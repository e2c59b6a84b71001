use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{Result, VaultClientError};
use crate::interface::VaultClient;
use crate::types::{JobDescription, JobStatus};

/// Resolves "job accepted" into "job output is retrievable" exactly once per
/// job. The transport is abstract: a poll loop and a push notification both
/// satisfy this contract.
#[async_trait]
pub trait JobCompletionSource: Send + Sync {
    /// Waits until the job succeeds, fails, or the ceiling elapses.
    /// Success returns the final description (with size and content hash);
    /// a failed job is a [`VaultClientError::JobAborted`]; exceeding the
    /// ceiling is a retryable [`VaultClientError::CompletionTimeout`].
    async fn wait_ready(&self, vault_name: &str, job_id: &str, ceiling: Duration) -> Result<JobDescription>;
}

/// Poll-based completion source over `describe_job`.
pub struct PollingCompletionSource {
    client: Arc<dyn VaultClient>,
    poll_interval: Duration,
}

impl PollingCompletionSource {
    pub fn new(client: Arc<dyn VaultClient>, poll_interval: Duration) -> Self {
        Self { client, poll_interval }
    }
}

#[async_trait]
impl JobCompletionSource for PollingCompletionSource {
    async fn wait_ready(&self, vault_name: &str, job_id: &str, ceiling: Duration) -> Result<JobDescription> {
        let wait = async {
            loop {
                let description = self.client.describe_job(vault_name, job_id).await?;
                match description.status {
                    JobStatus::Succeeded => {
                        info!(job_id, "vault job ready");
                        return Ok(description);
                    },
                    JobStatus::Failed => {
                        return Err(VaultClientError::JobAborted {
                            job_id: job_id.to_string(),
                            reason: description
                                .status_message
                                .unwrap_or_else(|| "vault reported job failure".to_string()),
                        });
                    },
                    JobStatus::InProgress => {
                        debug!(job_id, "vault job still in progress");
                        tokio::time::sleep(self.poll_interval).await;
                    },
                }
            }
        };

        match tokio::time::timeout(ceiling, wait).await {
            Ok(result) => result,
            Err(_) => Err(VaultClientError::CompletionTimeout {
                job_id: job_id.to_string(),
                waited_secs: ceiling.as_secs(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockVaultClient;
    use crate::types::JobKind;

    #[tokio::test]
    async fn test_polls_until_ready() {
        let client: Arc<dyn VaultClient> = Arc::new(
            MockVaultClient::builder("vault-a")
                .archive("a1", "TESTBODY")
                .ready_after_polls(3)
                .build(),
        );
        let job_id = client
            .initiate_job("vault-a", JobKind::ArchiveRetrieval, Some("a1"))
            .await
            .unwrap();

        let source = PollingCompletionSource::new(client, Duration::from_millis(1));
        let description = source.wait_ready("vault-a", &job_id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(description.status, JobStatus::Succeeded);
        assert_eq!(description.size_bytes, Some(8));
    }

    #[tokio::test]
    async fn test_failed_job_is_aborted_error() {
        let client: Arc<dyn VaultClient> = Arc::new(
            MockVaultClient::builder("vault-a")
                .archive("a1", "TESTBODY")
                .fail_archive_job("a1")
                .build(),
        );
        let job_id = client
            .initiate_job("vault-a", JobKind::ArchiveRetrieval, Some("a1"))
            .await
            .unwrap();

        let source = PollingCompletionSource::new(client, Duration::from_millis(1));
        let err = source.wait_ready("vault-a", &job_id, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, VaultClientError::JobAborted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_surfaces_as_timeout() {
        let client: Arc<dyn VaultClient> = Arc::new(
            MockVaultClient::builder("vault-a")
                .archive("a1", "TESTBODY")
                .ready_after_polls(u32::MAX)
                .build(),
        );
        let job_id = client
            .initiate_job("vault-a", JobKind::ArchiveRetrieval, Some("a1"))
            .await
            .unwrap();

        let source = PollingCompletionSource::new(client, Duration::from_millis(10));
        let err = source
            .wait_ready("vault-a", &job_id, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultClientError::CompletionTimeout { .. }));
        assert!(err.is_retryable());
    }
}
