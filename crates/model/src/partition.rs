//! Chunk partitioning and `Content-Range` parsing.

use crate::{ByteRange, ModelError};

/// Splits `[0, total)` into contiguous chunks of at most `chunk_size` bytes.
///
/// A zero-length object yields no chunks.
pub fn partition(total: u64, chunk_size: u64) -> Result<Vec<ByteRange>, ModelError> {
    partition_span(0, total, chunk_size)
}

/// Splits an arbitrary span `[start, end)` into contiguous chunks.
pub fn partition_span(start: u64, end: u64, chunk_size: u64) -> Result<Vec<ByteRange>, ModelError> {
    if chunk_size == 0 {
        return Err(ModelError::InvalidChunkSize);
    }
    let mut ranges = Vec::new();
    let mut offset = start;
    while offset < end {
        let next = offset.saturating_add(chunk_size).min(end);
        ranges.push(ByteRange::new(offset, next));
        offset = next;
    }
    Ok(ranges)
}

/// Range of the first request of a download.
///
/// Sized to one chunk, or to the requested range if that is smaller.
pub fn initial_range(requested: Option<ByteRange>, chunk_size: u64) -> ByteRange {
    match requested {
        Some(r) => ByteRange::new(r.start, r.start.saturating_add(chunk_size).min(r.end)),
        None => ByteRange::new(0, chunk_size),
    }
}

/// Ranges still to fetch after the initial request returned `initial`.
///
/// The requested end is clamped to the object's `total` length.
pub fn remaining_ranges(
    requested: Option<ByteRange>,
    initial: ByteRange,
    total: u64,
    chunk_size: u64,
) -> Result<Vec<ByteRange>, ModelError> {
    let end = requested.map_or(total, |r| r.end.min(total));
    partition_span(initial.end, end, chunk_size)
}

/// Parsed `Content-Range` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// Returned span, `None` for an unsatisfied range (`bytes */N`).
    pub range: Option<ByteRange>,
    /// Total length of the remote object.
    pub total: u64,
}

/// Parses `bytes a-b/N` (inclusive `b`) or `bytes */N`.
pub fn parse_content_range(header: &str) -> Result<ContentRange, ModelError> {
    let malformed = || ModelError::MalformedContentRange(header.to_string());

    let rest = header.trim().strip_prefix("bytes").ok_or_else(malformed)?;
    let rest = rest.trim_start();
    let (span, total) = rest.split_once('/').ok_or_else(malformed)?;
    let total: u64 = total.trim().parse().map_err(|_| malformed())?;

    if span.trim() == "*" {
        return Ok(ContentRange { range: None, total });
    }

    let (first, last) = span.split_once('-').ok_or_else(malformed)?;
    let first: u64 = first.trim().parse().map_err(|_| malformed())?;
    let last: u64 = last.trim().parse().map_err(|_| malformed())?;
    if last < first || last >= total {
        return Err(malformed());
    }

    Ok(ContentRange {
        range: Some(ByteRange::new(first, last + 1)),
        total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn partition_ten_mib_by_four() {
        let ranges = partition(10 * MIB, 4 * MIB).unwrap();
        assert_eq!(
            ranges,
            vec![
                ByteRange::new(0, 4 * MIB),
                ByteRange::new(4 * MIB, 8 * MIB),
                ByteRange::new(8 * MIB, 10 * MIB),
            ]
        );
    }

    #[test]
    fn partition_covers_exactly() {
        for (n, c) in [(1u64, 1u64), (7, 3), (9, 3), (100, 7), (4096, 4096), (4097, 4096)] {
            let ranges = partition(n, c).unwrap();
            assert_eq!(ranges.len() as u64, n.div_ceil(c), "n={n} c={c}");
            assert_eq!(ranges.first().unwrap().start, 0);
            assert_eq!(ranges.last().unwrap().end, n);
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
            }
            assert!(ranges.iter().all(|r| r.len() <= c && !r.is_empty()));
        }
    }

    #[test]
    fn partition_empty_and_invalid() {
        assert!(partition(0, 4).unwrap().is_empty());
        assert!(matches!(partition(10, 0), Err(ModelError::InvalidChunkSize)));
    }

    #[test]
    fn initial_range_respects_request() {
        assert_eq!(initial_range(None, 4), ByteRange::new(0, 4));
        assert_eq!(
            initial_range(Some(ByteRange::new(10, 12)), 4),
            ByteRange::new(10, 12)
        );
        assert_eq!(
            initial_range(Some(ByteRange::new(10, 100)), 4),
            ByteRange::new(10, 14)
        );
    }

    #[test]
    fn remaining_after_initial() {
        let initial = initial_range(None, 4);
        let rest = remaining_ranges(None, initial, 10, 4).unwrap();
        assert_eq!(rest, vec![ByteRange::new(4, 8), ByteRange::new(8, 10)]);

        // Initial chunk already covers the whole object.
        assert!(remaining_ranges(None, initial, 3, 4).unwrap().is_empty());

        // Requested end beyond the object is clamped.
        let req = Some(ByteRange::new(2, 100));
        let initial = initial_range(req, 4);
        let rest = remaining_ranges(req, initial, 9, 4).unwrap();
        assert_eq!(rest, vec![ByteRange::new(6, 9)]);
    }

    #[test]
    fn parse_content_range_forms() {
        let cr = parse_content_range("bytes 0-4194303/10485760").unwrap();
        assert_eq!(cr.total, 10 * MIB);
        assert_eq!(cr.range, Some(ByteRange::new(0, 4 * MIB)));

        let empty = parse_content_range("bytes */0").unwrap();
        assert_eq!(empty.total, 0);
        assert_eq!(empty.range, None);
    }

    #[test]
    fn parse_content_range_rejects_garbage() {
        for bad in [
            "",
            "items 0-1/2",
            "bytes 0-1",
            "bytes 0-1/*",
            "bytes 5-1/10",
            "bytes 0-10/10",
            "bytes a-b/10",
        ] {
            assert!(parse_content_range(bad).is_err(), "{bad:?}");
        }
    }
}
