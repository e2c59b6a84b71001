use thiserror::Error;
use tree_hash::TreeDigest;

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error(transparent)]
    Vault(#[from] vault_client::VaultClientError),

    #[error(transparent)]
    Store(#[from] job_store::JobStoreError),

    #[error(transparent)]
    Inventory(#[from] inventory::InventoryError),

    /// Computed hash does not match the declared hash. Non-retryable for the
    /// same bytes; a fresh fetch of the same range may still succeed.
    #[error("integrity check failed for {unit}: expected {expected}, computed {actual}")]
    Integrity {
        unit: String,
        expected: TreeDigest,
        actual: TreeDigest,
    },

    #[error("object sink error: {0}")]
    Sink(String),

    #[error("workflow run cancelled")]
    Cancelled,

    /// Malformed workflow input. Fatal: rejected before any work starts.
    #[error("invalid workflow input: {0}")]
    InvalidInput(String),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RetrievalError {
    /// Failures that abort the whole workflow run instead of failing one
    /// archive: a broken state store, bad input, or cancellation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RetrievalError::Store(job_store::JobStoreError::Unavailable(_))
                | RetrievalError::InvalidInput(_)
                | RetrievalError::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, RetrievalError>;
