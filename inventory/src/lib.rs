//! Parsing and writing of the vault's tabular inventory export.
//!
//! The format is five comma-separated columns with CRLF record terminators.
//! A field may be wrapped in double quotes; a literal quote inside a quoted
//! field is doubled (no backslash escapes). The first record of every file is
//! a fixed header row that is validated and discarded.

mod error;
mod parser;
mod record;
mod writer;

pub use error::{InventoryError, Result};
pub use parser::InventoryReader;
pub use record::ArchiveRecord;
pub use writer::InventoryWriter;

/// Header columns of every inventory file, in order.
pub const INVENTORY_HEADER: [&str; 5] =
    ["ArchiveId", "ArchiveDescription", "CreationDate", "Size", "SHA256TreeHash"];
