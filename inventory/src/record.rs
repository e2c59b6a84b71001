use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tree_hash::TreeDigest;

/// One row of vault inventory. Immutable once parsed; read-shared between the
/// workflow fan-out and the per-archive schedulers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    /// Opaque vault-assigned identifier, unique within a vault.
    pub archive_id: String,
    /// Free text; may contain the field delimiter and quote characters.
    pub description: String,
    pub creation_date: DateTime<Utc>,
    pub size_bytes: u64,
    /// The vault's declared tree hash for the whole archive.
    pub content_hash: TreeDigest,
}
