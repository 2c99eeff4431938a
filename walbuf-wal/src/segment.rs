//! WAL segment management.
//!
//! The log is split into numbered segment files:
//! - Naming: `wal_<n>.log`, `n` starting at 1, no zero padding
//! - Rotation: a new segment once the current one reaches the size threshold
//! - Locating: the highest index on disk is the writable segment

use crate::error::WalError;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Segment identifier (contiguous, starting at 1).
pub type SegmentId = u64;

/// First segment index of a fresh log.
pub const FIRST_SEGMENT: SegmentId = 1;

const SEGMENT_PREFIX: &str = "wal_";
const SEGMENT_SUFFIX: &str = ".log";

/// Segment file name format: `wal_<n>.log`.
pub fn segment_filename(id: SegmentId) -> String {
    format!("{}{}{}", SEGMENT_PREFIX, id, SEGMENT_SUFFIX)
}

/// Full path of segment `id` inside `dir`.
pub fn segment_path(dir: &Path, id: SegmentId) -> PathBuf {
    dir.join(segment_filename(id))
}

/// Parse segment ID from filename.
///
/// Only canonical names are accepted: `wal_05.log` would not round-trip
/// through [`segment_filename`], so it is ignored.
pub fn parse_segment_filename(name: &str) -> Option<SegmentId> {
    let digits = name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?;
    if digits.is_empty() || digits.starts_with('0') || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    digits.parse().ok()
}

/// Writer steps a test can force to fail on the next call.
#[cfg(test)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FailPoints {
    pub flush: bool,
    pub sync: bool,
    pub truncate: bool,
}

#[cfg(test)]
fn simulated(step: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("simulated {} failure", step))
}

/// The writable tail of the log: one open segment file behind a buffer.
pub struct Segment {
    id: SegmentId,
    path: PathBuf,
    writer: BufWriter<File>,
    buffer_size: usize,
    /// File length after the last successful sync.
    committed_len: u64,
    /// The file ends in a torn line; the next record must start on a fresh one.
    needs_fence: bool,
    #[cfg(test)]
    fail: FailPoints,
}

impl Segment {
    /// Opens segment `id` for appending, creating it if absent.
    pub fn open(dir: &Path, id: SegmentId, buffer_size: usize) -> io::Result<Self> {
        let path = segment_path(dir, id);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let needs_fence = len > 0 && !ends_with_newline(&mut file)?;
        if needs_fence {
            tracing::warn!(
                "Segment {} ends with an incomplete line; next record starts on a new line",
                path.display()
            );
        }

        Ok(Self {
            id,
            path,
            writer: BufWriter::with_capacity(buffer_size, file),
            buffer_size,
            committed_len: len,
            needs_fence,
            #[cfg(test)]
            fail: FailPoints::default(),
        })
    }

    /// Opens segment `id` after cutting it back to `len` bytes, dropping
    /// anything a failed rollback left behind.
    pub fn open_truncated(dir: &Path, id: SegmentId, buffer_size: usize, len: u64) -> io::Result<Self> {
        let file = OpenOptions::new().write(true).open(segment_path(dir, id))?;
        file.set_len(len)?;
        file.sync_all()?;
        drop(file);
        Self::open(dir, id, buffer_size)
    }

    /// Returns the segment ID.
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Returns the segment file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the length of the file up to the last durable record.
    pub fn committed_len(&self) -> u64 {
        self.committed_len
    }

    /// Returns the segment size as reported by the filesystem.
    pub fn size_on_disk(&self) -> io::Result<u64> {
        Ok(self.writer.get_ref().metadata()?.len())
    }

    /// Buffers a line for writing and returns the bytes queued, fence
    /// included. Nothing is durable until [`Segment::sync`].
    pub fn write_line(&mut self, line: &[u8]) -> io::Result<u64> {
        let mut queued = 0;
        if self.needs_fence {
            self.writer.write_all(b"\n")?;
            queued += 1;
        }
        self.writer.write_all(line)?;
        Ok(queued + line.len() as u64)
    }

    /// Pushes buffered bytes to the OS.
    pub fn flush(&mut self) -> io::Result<()> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail.flush) {
            return Err(simulated("flush"));
        }
        self.writer.flush()
    }

    /// Fsyncs the file and records the new committed length.
    pub fn sync(&mut self) -> io::Result<()> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail.sync) {
            return Err(simulated("sync"));
        }
        let file = self.writer.get_ref();
        file.sync_data()?;
        self.committed_len = file.metadata()?.len();
        self.needs_fence = false;
        Ok(())
    }

    /// Discards uncommitted bytes, both buffered and already written,
    /// returning the segment positioned at its last committed record.
    pub fn rollback(self) -> io::Result<Self> {
        let (file, _unflushed) = self.writer.into_parts();
        #[cfg(test)]
        if self.fail.truncate {
            return Err(simulated("truncate"));
        }
        file.set_len(self.committed_len)?;
        Ok(Self {
            id: self.id,
            path: self.path,
            writer: BufWriter::with_capacity(self.buffer_size, file),
            buffer_size: self.buffer_size,
            committed_len: self.committed_len,
            needs_fence: self.needs_fence,
            #[cfg(test)]
            fail: FailPoints::default(),
        })
    }

    #[cfg(test)]
    pub(crate) fn fail_next(&mut self, points: FailPoints) {
        self.fail = points;
    }

    /// Syncs all file state and closes the handle.
    pub fn close(mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }
}

fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Segment directory scanner.
pub struct SegmentScanner;

impl SegmentScanner {
    /// Lists all segment IDs in a directory, sorted numerically.
    pub fn list_segments(dir: &Path) -> Result<Vec<SegmentId>, WalError> {
        let mut segments = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(id) = parse_segment_filename(&name.to_string_lossy()) {
                segments.push(id);
            }
        }

        segments.sort_unstable();
        Ok(segments)
    }

    /// Returns the highest segment index in `dir`, or [`FIRST_SEGMENT`] when
    /// the directory is missing, unreadable or holds no segments.
    ///
    /// This is the index [`crate::Wal::open`] resumes writing into.
    pub fn latest_segment(dir: &Path) -> SegmentId {
        match Self::list_segments(dir) {
            Ok(segments) => segments.last().copied().unwrap_or(FIRST_SEGMENT),
            Err(WalError::Io(e)) if e.kind() == io::ErrorKind::NotFound => FIRST_SEGMENT,
            Err(e) => {
                tracing::warn!(
                    "Cannot scan {} for segments, starting at {}: {}",
                    dir.display(),
                    FIRST_SEGMENT,
                    e
                );
                FIRST_SEGMENT
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_BUFFER_SIZE;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn test_segment_filename() {
        assert_eq!(segment_filename(1), "wal_1.log");
        assert_eq!(segment_filename(10), "wal_10.log");
        assert_eq!(
            segment_path(Path::new("wal_data"), 3),
            PathBuf::from("wal_data/wal_3.log")
        );
        assert_eq!(
            segment_path(Path::new("wal_data"), 3),
            segment_path(Path::new("wal_data"), 3)
        );
    }

    #[test]
    fn test_parse_segment_filename() {
        assert_eq!(parse_segment_filename("wal_1.log"), Some(1));
        assert_eq!(parse_segment_filename("wal_255.log"), Some(255));
        assert_eq!(parse_segment_filename("wal_0.log"), None);
        assert_eq!(parse_segment_filename("wal_05.log"), None);
        assert_eq!(parse_segment_filename("wal_+5.log"), None);
        assert_eq!(parse_segment_filename("wal_.log"), None);
        assert_eq!(parse_segment_filename("wal_1.txt"), None);
        assert_eq!(parse_segment_filename("other_1.log"), None);
    }

    #[test]
    fn test_latest_segment_is_numeric_max() {
        let dir = TempDir::new().unwrap();
        for name in ["wal_1.log", "wal_2.log", "wal_10.log", "wal_9.log", "notes.txt"] {
            touch(dir.path(), name);
        }
        std::fs::create_dir(dir.path().join("wal_99.log")).unwrap();

        assert_eq!(
            SegmentScanner::list_segments(dir.path()).unwrap(),
            vec![1, 2, 9, 10]
        );
        assert_eq!(SegmentScanner::latest_segment(dir.path()), 10);
    }

    #[test]
    fn test_latest_segment_with_gaps() {
        let dir = TempDir::new().unwrap();
        for name in ["wal_1.log", "wal_2.log", "wal_5.log"] {
            touch(dir.path(), name);
        }
        assert_eq!(SegmentScanner::latest_segment(dir.path()), 5);
    }

    #[test]
    fn test_latest_segment_fresh_start() {
        let dir = TempDir::new().unwrap();
        assert_eq!(SegmentScanner::latest_segment(dir.path()), FIRST_SEGMENT);
        assert_eq!(
            SegmentScanner::latest_segment(&dir.path().join("missing")),
            FIRST_SEGMENT
        );
    }

    #[test]
    fn test_segment_commit_and_size() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path(), 1, DEFAULT_BUFFER_SIZE).unwrap();
        assert_eq!(segment.committed_len(), 0);

        segment.write_line(b"{\"offset\":1}\n").unwrap();
        assert_eq!(segment.size_on_disk().unwrap(), 0, "still buffered");

        segment.flush().unwrap();
        segment.sync().unwrap();
        assert_eq!(segment.size_on_disk().unwrap(), 13);
        assert_eq!(segment.committed_len(), 13);
    }

    #[test]
    fn test_rollback_discards_uncommitted_bytes() {
        let dir = TempDir::new().unwrap();
        let mut segment = Segment::open(dir.path(), 1, DEFAULT_BUFFER_SIZE).unwrap();
        segment.write_line(b"one\n").unwrap();
        segment.flush().unwrap();
        segment.sync().unwrap();

        segment.write_line(b"two\n").unwrap();
        segment.flush().unwrap();
        segment.write_line(b"three\n").unwrap();

        let segment = segment.rollback().unwrap();
        segment.close().unwrap();

        let content = std::fs::read(segment_path(dir.path(), 1)).unwrap();
        assert_eq!(content, b"one\n");
    }

    #[test]
    fn test_reopen_fences_torn_tail() {
        let dir = TempDir::new().unwrap();
        std::fs::write(segment_path(dir.path(), 1), b"{\"offset\":1}\n{\"off").unwrap();

        let mut segment = Segment::open(dir.path(), 1, DEFAULT_BUFFER_SIZE).unwrap();
        segment.write_line(b"{\"offset\":2}\n").unwrap();
        segment.close().unwrap();

        let content = std::fs::read_to_string(segment_path(dir.path(), 1)).unwrap();
        assert_eq!(content, "{\"offset\":1}\n{\"off\n{\"offset\":2}\n");
    }

    #[test]
    fn test_write_line_counts_fence() {
        let dir = TempDir::new().unwrap();
        std::fs::write(segment_path(dir.path(), 1), b"{\"off").unwrap();

        let mut segment = Segment::open(dir.path(), 1, DEFAULT_BUFFER_SIZE).unwrap();
        assert_eq!(segment.write_line(b"{\"offset\":1}\n").unwrap(), 14);
        segment.flush().unwrap();
        segment.sync().unwrap();
        assert_eq!(segment.write_line(b"{\"offset\":2}\n").unwrap(), 13);
    }

    #[test]
    fn test_open_truncated_drops_uncommitted_tail() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            segment_path(dir.path(), 1),
            b"{\"offset\":1}\n{\"offset\":2}\n",
        )
        .unwrap();

        let segment = Segment::open_truncated(dir.path(), 1, DEFAULT_BUFFER_SIZE, 13).unwrap();
        assert_eq!(segment.committed_len(), 13);
        segment.close().unwrap();

        let content = std::fs::read(segment_path(dir.path(), 1)).unwrap();
        assert_eq!(content, b"{\"offset\":1}\n");
    }
}
