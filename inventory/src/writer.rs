use std::io::Write;

use crate::error::Result;
use crate::record::ArchiveRecord;
use crate::INVENTORY_HEADER;

/// Writes inventory files in the vault's tabular export format. Used by the
/// mock vault and by tests; the quoting rules mirror [`crate::InventoryReader`]
/// exactly so that anything written here round-trips.
pub struct InventoryWriter<W: Write> {
    output: W,
    header_written: bool,
}

impl<W: Write> InventoryWriter<W> {
    pub fn new(output: W) -> Self {
        Self {
            output,
            header_written: false,
        }
    }

    pub fn write_record(&mut self, record: &ArchiveRecord) -> Result<()> {
        if !self.header_written {
            self.write_row(&INVENTORY_HEADER.map(String::from))?;
            self.header_written = true;
        }

        let row = [
            record.archive_id.clone(),
            record.description.clone(),
            record.creation_date.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            record.size_bytes.to_string(),
            record.content_hash.hex(),
        ];
        self.write_row(&row)
    }

    pub fn finish(mut self) -> Result<W> {
        if !self.header_written {
            self.write_row(&INVENTORY_HEADER.map(String::from))?;
            self.header_written = true;
        }
        self.output.flush()?;
        Ok(self.output)
    }

    fn write_row(&mut self, fields: &[String; 5]) -> Result<()> {
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                self.output.write_all(b",")?;
            }
            self.write_field(field)?;
        }
        self.output.write_all(b"\r\n")?;
        Ok(())
    }

    fn write_field(&mut self, field: &str) -> Result<()> {
        let needs_quoting = field.bytes().any(|b| matches!(b, b',' | b'"' | b'\r' | b'\n'));
        if !needs_quoting {
            self.output.write_all(field.as_bytes())?;
            return Ok(());
        }

        self.output.write_all(b"\"")?;
        for b in field.bytes() {
            if b == b'"' {
                self.output.write_all(b"\"\"")?;
            } else {
                self.output.write_all(&[b])?;
            }
        }
        self.output.write_all(b"\"")?;
        Ok(())
    }
}
