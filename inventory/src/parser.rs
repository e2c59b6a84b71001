use std::io::BufRead;

use chrono::DateTime;
use tracing::debug;
use tree_hash::TreeDigest;

use crate::error::{InventoryError, Result};
use crate::record::ArchiveRecord;
use crate::INVENTORY_HEADER;

const DELIMITER: u8 = b',';
const QUOTE: u8 = b'"';

/// Lazily parses one inventory file into [`ArchiveRecord`]s.
///
/// The header row is validated and discarded on the first call to `next`.
/// Parsing is purely a function of the input stream; duplicate archive ids
/// are passed through (deduplication is the scheduler's concern). Once an
/// error is yielded the iterator is fused.
pub struct InventoryReader<R: BufRead> {
    input: R,
    /// 1-based index of the next record, counting the header as record 1.
    record_index: usize,
    header_checked: bool,
    done: bool,
}

enum FieldState {
    Start,
    Unquoted,
    Quoted,
    /// Saw a quote inside a quoted field; either the field ends here or the
    /// quote is doubled.
    QuoteInQuoted,
    /// Saw a CR outside quotes; a LF must follow.
    ExpectLf,
}

impl<R: BufRead> InventoryReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            record_index: 1,
            header_checked: false,
            done: false,
        }
    }

    fn next_byte(&mut self) -> Result<Option<u8>> {
        let buf = self.input.fill_buf()?;
        match buf.first().copied() {
            Some(b) => {
                self.input.consume(1);
                Ok(Some(b))
            },
            None => Ok(None),
        }
    }

    /// Reads one raw record, honoring quoting rules. Returns `None` at end of
    /// input. A final record without a trailing CRLF is accepted.
    fn read_raw_record(&mut self) -> Result<Option<Vec<String>>> {
        let record = self.record_index;
        let mut fields: Vec<String> = Vec::with_capacity(INVENTORY_HEADER.len());
        let mut field: Vec<u8> = Vec::new();
        let mut state = FieldState::Start;
        let mut saw_any = false;

        let mut push_field = |fields: &mut Vec<String>, field: &mut Vec<u8>| -> Result<()> {
            let text = String::from_utf8(std::mem::take(field))
                .map_err(|_| InventoryError::malformed(record, "field is not valid UTF-8"))?;
            fields.push(text);
            Ok(())
        };

        loop {
            let byte = self.next_byte()?;
            let Some(b) = byte else {
                // End of input.
                return match state {
                    FieldState::Start if !saw_any => Ok(None),
                    FieldState::Quoted => {
                        Err(InventoryError::malformed(record, "unterminated quoted field at end of input"))
                    },
                    FieldState::ExpectLf => Err(InventoryError::malformed(record, "CR not followed by LF")),
                    _ => {
                        push_field(&mut fields, &mut field)?;
                        self.record_index += 1;
                        Ok(Some(fields))
                    },
                };
            };
            saw_any = true;

            match state {
                FieldState::Start => match b {
                    QUOTE => state = FieldState::Quoted,
                    DELIMITER => push_field(&mut fields, &mut field)?,
                    b'\r' => state = FieldState::ExpectLf,
                    _ => {
                        field.push(b);
                        state = FieldState::Unquoted;
                    },
                },
                FieldState::Unquoted => match b {
                    DELIMITER => {
                        push_field(&mut fields, &mut field)?;
                        state = FieldState::Start;
                    },
                    b'\r' => state = FieldState::ExpectLf,
                    _ => field.push(b),
                },
                FieldState::Quoted => match b {
                    QUOTE => state = FieldState::QuoteInQuoted,
                    _ => field.push(b),
                },
                FieldState::QuoteInQuoted => match b {
                    QUOTE => {
                        // Doubled quote: one literal quote character.
                        field.push(QUOTE);
                        state = FieldState::Quoted;
                    },
                    DELIMITER => {
                        push_field(&mut fields, &mut field)?;
                        state = FieldState::Start;
                    },
                    b'\r' => state = FieldState::ExpectLf,
                    _ => {
                        return Err(InventoryError::malformed(record, "unexpected character after closing quote"));
                    },
                },
                FieldState::ExpectLf => match b {
                    b'\n' => {
                        push_field(&mut fields, &mut field)?;
                        self.record_index += 1;
                        return Ok(Some(fields));
                    },
                    _ => return Err(InventoryError::malformed(record, "CR not followed by LF")),
                },
            }
        }
    }

    fn check_header(&mut self) -> Result<()> {
        let record = self.record_index;
        let header = self
            .read_raw_record()?
            .ok_or_else(|| InventoryError::malformed(record, "empty inventory file, missing header row"))?;

        if header != INVENTORY_HEADER {
            return Err(InventoryError::malformed(
                record,
                format!("unexpected header row: {}", header.join(",")),
            ));
        }
        debug!("inventory header validated");
        Ok(())
    }

    fn parse_record(&self, record: usize, fields: Vec<String>) -> Result<ArchiveRecord> {
        if fields.len() != INVENTORY_HEADER.len() {
            return Err(InventoryError::malformed(
                record,
                format!("expected {} columns, found {}", INVENTORY_HEADER.len(), fields.len()),
            ));
        }

        let mut fields = fields.into_iter();
        let archive_id = fields.next().unwrap_or_default();
        let description = fields.next().unwrap_or_default();
        let creation_date = fields.next().unwrap_or_default();
        let size = fields.next().unwrap_or_default();
        let hash = fields.next().unwrap_or_default();

        let creation_date = DateTime::parse_from_rfc3339(&creation_date)
            .map_err(|e| InventoryError::malformed(record, format!("invalid creation date {creation_date:?}: {e}")))?
            .to_utc();

        let size_bytes: u64 = size
            .parse()
            .map_err(|_| InventoryError::malformed(record, format!("size {size:?} is not a non-negative integer")))?;

        let content_hash = TreeDigest::from_hex(&hash)
            .map_err(|e| InventoryError::malformed(record, format!("invalid content hash {hash:?}: {e}")))?;

        Ok(ArchiveRecord {
            archive_id,
            description,
            creation_date,
            size_bytes,
            content_hash,
        })
    }
}

impl<R: BufRead> Iterator for InventoryReader<R> {
    type Item = Result<ArchiveRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if !self.header_checked {
            if let Err(e) = self.check_header() {
                self.done = true;
                return Some(Err(e));
            }
            self.header_checked = true;
        }

        let record = self.record_index;
        match self.read_raw_record() {
            Ok(None) => {
                self.done = true;
                None
            },
            Ok(Some(fields)) => match self.parse_record(record, fields) {
                Ok(rec) => Some(Ok(rec)),
                Err(e) => {
                    self.done = true;
                    Some(Err(e))
                },
            },
            Err(e) => {
                self.done = true;
                Some(Err(e))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "ArchiveId,ArchiveDescription,CreationDate,Size,SHA256TreeHash\r\n";
    const HASH_A: &str = "b9f9644670e5fcd37a4c54a478d636fc37c41282d161e3e50cb3fb962aa04285";
    const HASH_B: &str = "4bea3f70ca51a975d37798a63ae730535b79431d14577d7db01691b801d5b9ce";

    fn parse_all(body: &str) -> Vec<Result<ArchiveRecord>> {
        InventoryReader::new(body.as_bytes()).collect()
    }

    fn parse_ok(body: &str) -> Vec<ArchiveRecord> {
        parse_all(body).into_iter().collect::<Result<_>>().unwrap()
    }

    #[test]
    fn test_parses_plain_rows() {
        let body = format!(
            "{HEADER}cf2e306ff9a72790b152fb4af93a1a1d,test.txt,2023-04-24T14:07:34.000Z,8,{HASH_A}\r\n"
        );
        let records = parse_ok(&body);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].archive_id, "cf2e306ff9a72790b152fb4af93a1a1d");
        assert_eq!(records[0].description, "test.txt");
        assert_eq!(records[0].size_bytes, 8);
        assert_eq!(records[0].content_hash.hex(), HASH_A);
    }

    #[test]
    fn test_parses_quoted_description_with_delimiter_and_doubled_quote() {
        let body = format!(
            "{HEADER}de1cf0c183248e153ec9a57c2062073b,\"my archive description,1\"\"2\",2023-04-24T14:07:34.000Z,9,{HASH_B}\r\n"
        );
        let records = parse_ok(&body);
        assert_eq!(records[0].description, "my archive description,1\"2");
        assert_eq!(records[0].size_bytes, 9);
    }

    #[test]
    fn test_quoted_field_may_contain_crlf() {
        let body = format!("{HEADER}a1,\"line one\r\nline two\",2023-04-24T14:07:34.000Z,1,{HASH_A}\r\n");
        let records = parse_ok(&body);
        assert_eq!(records[0].description, "line one\r\nline two");
    }

    #[test]
    fn test_header_mismatch_is_malformed() {
        let body = "ArchiveId,Description,CreationDate,Size,Hash\r\n";
        let results = parse_all(body);
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(InventoryError::Malformed { record: 1, .. })));
    }

    #[test]
    fn test_missing_header_is_malformed() {
        let results = parse_all("");
        assert!(matches!(results[0], Err(InventoryError::Malformed { .. })));
    }

    #[test]
    fn test_column_count_mismatch_is_malformed() {
        let body = format!("{HEADER}a1,only-three-columns,2023-04-24T14:07:34.000Z\r\n");
        let results = parse_all(&body);
        assert!(matches!(results[0], Err(InventoryError::Malformed { record: 2, .. })));
    }

    #[test]
    fn test_negative_size_is_malformed() {
        let body = format!("{HEADER}a1,d,2023-04-24T14:07:34.000Z,-5,{HASH_A}\r\n");
        assert!(matches!(parse_all(&body)[0], Err(InventoryError::Malformed { .. })));
    }

    #[test]
    fn test_bad_hash_is_malformed() {
        let body = format!("{HEADER}a1,d,2023-04-24T14:07:34.000Z,5,nothex\r\n");
        assert!(matches!(parse_all(&body)[0], Err(InventoryError::Malformed { .. })));
    }

    #[test]
    fn test_unterminated_quote_is_malformed() {
        let body = format!("{HEADER}a1,\"never closed,2023-04-24T14:07:34.000Z,5,{HASH_A}\r\n");
        assert!(matches!(parse_all(&body)[0], Err(InventoryError::Malformed { .. })));
    }

    #[test]
    fn test_iterator_fuses_after_error() {
        let body = format!(
            "{HEADER}bad-row\r\na1,d,2023-04-24T14:07:34.000Z,5,{HASH_A}\r\n"
        );
        let results = parse_all(&body);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn test_duplicate_archive_ids_pass_through() {
        let row = format!("dup,one,2023-04-24T14:07:34.000Z,5,{HASH_A}\r\n");
        let body = format!("{HEADER}{row}{row}");
        let records = parse_ok(&body);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].archive_id, records[1].archive_id);
    }

    #[test]
    fn test_final_record_without_crlf_accepted() {
        let body = format!("{HEADER}a1,d,2023-04-24T14:07:34.000Z,5,{HASH_A}");
        let records = parse_ok(&body);
        assert_eq!(records.len(), 1);
    }
}
