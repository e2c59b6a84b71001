use vault_client::ByteRange;

/// Ordered, contiguous, non-overlapping ranges covering `[0, size_bytes)`.
///
/// Recomputed deterministically from the archive size on every resume, so it
/// is never persisted.
pub fn chunk_plan(size_bytes: u64, chunk_size: u64) -> Vec<ByteRange> {
    let mut ranges = Vec::with_capacity(size_bytes.div_ceil(chunk_size.max(1)) as usize);
    let mut start = 0;
    while start < size_bytes {
        let end = (start + chunk_size).min(size_bytes);
        ranges.push(ByteRange::new(start, end));
        start = end;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_multiple() {
        let plan = chunk_plan(9, 3);
        assert_eq!(plan, vec![ByteRange::new(0, 3), ByteRange::new(3, 6), ByteRange::new(6, 9)]);
    }

    #[test]
    fn test_short_final_chunk() {
        let plan = chunk_plan(8, 3);
        assert_eq!(plan, vec![ByteRange::new(0, 3), ByteRange::new(3, 6), ByteRange::new(6, 8)]);
    }

    #[test]
    fn test_single_chunk_when_smaller_than_chunk_size() {
        assert_eq!(chunk_plan(2, 1024), vec![ByteRange::new(0, 2)]);
    }

    #[test]
    fn test_empty_input_has_no_chunks() {
        assert!(chunk_plan(0, 1024).is_empty());
    }

    #[test]
    fn test_plan_covers_input_contiguously() {
        let plan = chunk_plan(1_000_003, 4096);
        assert_eq!(plan[0].start, 0);
        assert_eq!(plan.last().unwrap().end, 1_000_003);
        for pair in plan.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }
}
