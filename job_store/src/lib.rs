//! Durable per-job retrieval state.
//!
//! Every retrieval unit (one archive, or one inventory listing) has exactly
//! one [`JobRecord`] keyed by `(partition_key, sort_key)`. All writes are
//! conditional on the record's current state, which is what lets many
//! concurrent workers share the store without locks: a losing writer gets a
//! [`JobStoreError::StateConflict`], re-reads, and recomputes its transition.

mod error;
mod memory;
mod record;
mod store;

pub use error::{JobStoreError, Result};
pub use memory::MemoryJobStore;
pub use record::{JobKey, JobKind, JobRecord, JobState, SinkLocation, META_SORT_KEY};
pub use store::JobStore;
