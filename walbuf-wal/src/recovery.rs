//! Startup scanning of existing segments.
//!
//! Nothing here modifies segment files. The scan exists to find where the
//! offset sequence left off, and to report on log health:
//! - Resume: the highest offset in the newest segment that holds a record
//! - Verify: count parseable and unparseable lines across all segments

use crate::entry::probe_offset;
use crate::error::WalError;
use crate::segment::{segment_path, SegmentId, SegmentScanner};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Result of scanning one segment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSummary {
    /// Lines that parsed as records.
    pub valid_records: u64,
    /// Lines that did not parse (torn writes, foreign data).
    pub invalid_lines: u64,
    /// Highest offset seen.
    pub max_offset: Option<u64>,
}

/// Result of WAL verification scan.
#[derive(Debug, Default)]
pub struct RecoveryResult {
    /// Number of valid records found.
    pub valid_records: u64,
    /// Number of unparseable lines found.
    pub invalid_lines: u64,
    /// Segments scanned, ascending.
    pub segments: Vec<SegmentId>,
    /// Segments that contained unparseable lines.
    pub segments_with_errors: Vec<SegmentId>,
    /// Maximum offset found.
    pub max_offset: Option<u64>,
}

/// Scans a single segment file line by line.
pub fn scan_segment(dir: &Path, id: SegmentId) -> Result<SegmentSummary, WalError> {
    let file = File::open(segment_path(dir, id))?;
    let mut reader = BufReader::new(file);
    let mut summary = SegmentSummary::default();
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        if line == b"\n" {
            // Fence left by a reopen after a torn write.
            continue;
        }
        match probe_offset(&line) {
            Some(offset) => {
                summary.valid_records += 1;
                summary.max_offset = Some(summary.max_offset.map_or(offset, |m| m.max(offset)));
            }
            None => summary.invalid_lines += 1,
        }
    }

    Ok(summary)
}

/// Returns the offset the next append should receive.
///
/// Walks `segments` from newest to oldest and stops at the first one holding
/// a record, so a freshly rotated (empty) segment does not reset the
/// sequence.
pub fn resume_offset(dir: &Path, segments: &[SegmentId]) -> Result<u64, WalError> {
    for &id in segments.iter().rev() {
        let summary = scan_segment(dir, id)?;
        if summary.invalid_lines > 0 {
            tracing::warn!(
                "Segment {} has {} unparseable line(s)",
                id,
                summary.invalid_lines
            );
        }
        if let Some(max) = summary.max_offset {
            tracing::debug!("Resuming after offset {} found in segment {}", max, id);
            return max
                .checked_add(1)
                .ok_or(WalError::OffsetExhausted { offset: max });
        }
    }
    Ok(1)
}

/// Verifies WAL integrity without modifying anything.
pub fn verify_wal(dir: impl AsRef<Path>) -> Result<RecoveryResult, WalError> {
    let dir = dir.as_ref();
    let mut result = RecoveryResult {
        segments: SegmentScanner::list_segments(dir)?,
        ..Default::default()
    };

    for &id in &result.segments {
        let summary = scan_segment(dir, id)?;
        result.valid_records += summary.valid_records;
        result.invalid_lines += summary.invalid_lines;
        if summary.invalid_lines > 0 {
            result.segments_with_errors.push(id);
        }
        if let Some(max) = summary.max_offset {
            result.max_offset = Some(result.max_offset.map_or(max, |m| m.max(max)));
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::encode_line;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_segment(dir: &Path, id: SegmentId, offsets: &[u64]) {
        let mut content = Vec::new();
        for &offset in offsets {
            content.extend(encode_line(offset, "t", &json!({"n": offset})).unwrap());
        }
        std::fs::write(segment_path(dir, id), content).unwrap();
    }

    #[test]
    fn test_resume_counts_records_not_bytes() {
        let dir = TempDir::new().unwrap();
        write_segment(dir.path(), 1, &[1, 2, 3]);

        assert_eq!(resume_offset(dir.path(), &[1]).unwrap(), 4);
    }

    #[test]
    fn test_resume_skips_empty_newest_segment() {
        let dir = TempDir::new().unwrap();
        write_segment(dir.path(), 1, &[1, 2]);
        write_segment(dir.path(), 2, &[3, 4, 5]);
        write_segment(dir.path(), 3, &[]);

        assert_eq!(resume_offset(dir.path(), &[1, 2, 3]).unwrap(), 6);
    }

    #[test]
    fn test_resume_fresh_log() {
        let dir = TempDir::new().unwrap();
        write_segment(dir.path(), 1, &[]);
        assert_eq!(resume_offset(dir.path(), &[1]).unwrap(), 1);
        assert_eq!(resume_offset(dir.path(), &[]).unwrap(), 1);
    }

    #[test]
    fn test_resume_ignores_torn_tail() {
        let dir = TempDir::new().unwrap();
        write_segment(dir.path(), 1, &[1, 2]);
        let mut content = std::fs::read(segment_path(dir.path(), 1)).unwrap();
        content.extend_from_slice(b"{\"offset\":3,\"topic\":\"t\",\"pay");
        std::fs::write(segment_path(dir.path(), 1), content).unwrap();

        assert_eq!(resume_offset(dir.path(), &[1]).unwrap(), 3);
    }

    #[test]
    fn test_resume_at_last_offset_fails() {
        let dir = TempDir::new().unwrap();
        write_segment(dir.path(), 1, &[u64::MAX - 1, u64::MAX]);

        let err = resume_offset(dir.path(), &[1]).unwrap_err();
        assert!(matches!(err, WalError::OffsetExhausted { offset } if offset == u64::MAX));
    }

    #[test]
    fn test_verify_wal() {
        let dir = TempDir::new().unwrap();
        write_segment(dir.path(), 1, &[1, 2]);
        write_segment(dir.path(), 2, &[3]);
        std::fs::write(segment_path(dir.path(), 3), b"garbage\n").unwrap();

        let result = verify_wal(dir.path()).unwrap();
        assert_eq!(result.segments, vec![1, 2, 3]);
        assert_eq!(result.valid_records, 3);
        assert_eq!(result.invalid_lines, 1);
        assert_eq!(result.segments_with_errors, vec![3]);
        assert_eq!(result.max_offset, Some(3));
    }
}
