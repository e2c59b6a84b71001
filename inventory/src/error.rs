use thiserror::Error;

#[derive(Error, Debug)]
pub enum InventoryError {
    /// The inventory file does not conform to the tabular export format.
    /// Fails the owning inventory job; sibling files are unaffected.
    #[error("malformed inventory at record {record}: {reason}")]
    Malformed { record: usize, reason: String },

    #[error("I/O error reading inventory: {0}")]
    Io(#[from] std::io::Error),
}

impl InventoryError {
    pub(crate) fn malformed(record: usize, reason: impl Into<String>) -> Self {
        InventoryError::Malformed {
            record,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, InventoryError>;
