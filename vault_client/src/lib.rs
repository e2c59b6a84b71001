//! Client interface to the cold-storage vault service.
//!
//! The vault's API is asynchronous and job-based: a retrieval is initiated,
//! runs on the vault's side for some time, and its output only becomes
//! fetchable once the job reports success. This crate defines the narrow
//! trait the orchestration engine consumes, the retry helper for transient
//! faults, the polling completion source that resolves job readiness, and an
//! in-memory mock vault for tests.

mod completion;
mod error;
mod interface;
mod mock;
mod retry;
mod types;

pub use completion::{JobCompletionSource, PollingCompletionSource};
pub use error::{Result, VaultClientError};
pub use interface::VaultClient;
pub use mock::{MockVaultClient, MockVaultClientBuilder};
pub use retry::{retry_transient, RetryPolicy};
pub use types::{ByteRange, JobDescription, JobKind, JobOutput, JobStatus};
