//! Retrieval orchestration engine for cold-storage vaults.
//!
//! A workflow run retrieves a vault's inventory listing through the vault's
//! asynchronous job protocol, then fans out one durable state machine per
//! archive: initiate a retrieval job, wait for it to become ready, download
//! the output in verified chunks through a reorder buffer, check the
//! whole-archive tree hash, and finalize the object in the sink. Every state
//! transition is a conditional write to the job store, so a run can be
//! killed and resumed at any point without duplicating work.

mod assembler;
mod chunk_plan;
mod config;
mod error;
mod scheduler;
mod sink;
mod workflow;

pub use assembler::ArchiveAssembler;
pub use chunk_plan::chunk_plan;
pub use config::{DuplicateArchivePolicy, RetrievalConfig};
pub use error::{Result, RetrievalError};
pub use scheduler::RetrievalScheduler;
pub use sink::{MemoryObjectSink, ObjectSink};
pub use workflow::{RunHandle, RunReport, RunStatus, WorkflowCoordinator, WorkflowInput};
