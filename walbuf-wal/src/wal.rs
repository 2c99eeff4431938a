//! Main WAL implementation.

use crate::entry;
use crate::error::{RotateStep, WalError};
use crate::recovery;
use crate::segment::{segment_path, Segment, SegmentId, SegmentScanner};
use crate::{DEFAULT_BUFFER_SIZE, DEFAULT_SEGMENT_SIZE};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// WAL configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory to store WAL segments.
    pub dir: PathBuf,
    /// Segment size threshold; checked after each append.
    pub segment_size: u64,
    /// Capacity of the write buffer in front of each segment file.
    pub buffer_size: usize,
}

impl WalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segment_size: DEFAULT_SEGMENT_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }
}

/// Where an acknowledged record landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Offset assigned to the record.
    pub offset: u64,
    /// Segment the record was written to (never the one rotated into).
    pub segment: SegmentId,
    /// Path of that segment.
    pub path: PathBuf,
    /// Whether this append triggered a rotation.
    pub rotated: bool,
}

/// I/O statistics for the WAL.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalStats {
    /// Records acknowledged.
    pub appends: u64,
    /// Total bytes made durable.
    pub bytes_written: u64,
    /// Total fsync operations.
    pub fsyncs: u64,
    /// Completed segment rotations.
    pub rotations: u64,
    /// Appends that returned an error.
    pub failed_appends: u64,
}

enum WriterState {
    /// A segment is open for writing.
    Active(Segment),
    /// A rotation or rollback failed; `pending` must be opened before the next write.
    /// After a failed rollback, `truncate_to` is the segment's last synced length.
    Degraded {
        pending: SegmentId,
        truncate_to: Option<u64>,
    },
    /// Shut down; no further writes.
    Closed,
}

struct WalInner {
    state: WriterState,
    current_segment: SegmentId,
    next_offset: u64,
}

impl WalInner {
    /// Returns the writable segment, first reopening a pending one if a
    /// previous rotation left the writer degraded.
    fn active_segment(&mut self, config: &WalConfig) -> Result<&mut Segment, WalError> {
        if let WriterState::Degraded {
            pending,
            truncate_to,
        } = self.state
        {
            let segment = match truncate_to {
                Some(len) => Segment::open_truncated(&config.dir, pending, config.buffer_size, len),
                None => Segment::open(&config.dir, pending, config.buffer_size),
            }
            .map_err(|source| WalError::Degraded { pending, source })?;
            tracing::info!("WAL writable again on segment {}", pending);
            self.current_segment = pending;
            self.state = WriterState::Active(segment);
        }

        match &mut self.state {
            WriterState::Active(segment) => Ok(segment),
            WriterState::Closed => Err(WalError::Closed),
            WriterState::Degraded { .. } => unreachable!("degraded writer was reopened above"),
        }
    }

    /// Drops whatever the failed write left behind in the current segment.
    fn roll_back(&mut self) {
        if let WriterState::Active(segment) = std::mem::replace(&mut self.state, WriterState::Closed)
        {
            let id = segment.id();
            let committed_len = segment.committed_len();
            self.state = match segment.rollback() {
                Ok(segment) => WriterState::Active(segment),
                Err(e) => {
                    tracing::error!("Rollback of segment {} failed, WAL degraded: {}", id, e);
                    WriterState::Degraded {
                        pending: id,
                        truncate_to: Some(committed_len),
                    }
                }
            };
        }
    }
}

/// Write-Ahead Log.
///
/// One instance owns one directory. Every append runs under a single lock:
/// encode, write, flush, fsync, size check and rotation never interleave
/// between callers.
pub struct Wal {
    config: WalConfig,
    inner: Mutex<WalInner>,
    stats_appends: AtomicU64,
    stats_bytes_written: AtomicU64,
    stats_fsyncs: AtomicU64,
    stats_rotations: AtomicU64,
    stats_failed_appends: AtomicU64,
}

impl Wal {
    /// Opens or creates a WAL at the configured directory.
    ///
    /// Resumes the highest-numbered segment and continues the offset
    /// sequence after the last record found on disk.
    pub fn open(config: WalConfig) -> Result<Self, WalError> {
        let directory_error = |source| WalError::Directory {
            path: config.dir.clone(),
            source,
        };

        std::fs::create_dir_all(&config.dir).map_err(directory_error)?;

        let segment_id = SegmentScanner::latest_segment(&config.dir);
        let segments = SegmentScanner::list_segments(&config.dir).map_err(|e| match e {
            WalError::Io(source) => directory_error(source),
            other => other,
        })?;
        let next_offset = recovery::resume_offset(&config.dir, &segments)?;

        let segment = Segment::open(&config.dir, segment_id, config.buffer_size).map_err(
            |source| WalError::SegmentOpen {
                segment: segment_id,
                path: segment_path(&config.dir, segment_id),
                source,
            },
        )?;

        tracing::info!(
            "WAL opened at {}: {} existing segment(s), writing segment {}, next_offset={}",
            config.dir.display(),
            segments.len(),
            segment_id,
            next_offset
        );

        Ok(Self {
            config,
            inner: Mutex::new(WalInner {
                state: WriterState::Active(segment),
                current_segment: segment_id,
                next_offset,
            }),
            stats_appends: AtomicU64::new(0),
            stats_bytes_written: AtomicU64::new(0),
            stats_fsyncs: AtomicU64::new(0),
            stats_rotations: AtomicU64::new(0),
            stats_failed_appends: AtomicU64::new(0),
        })
    }

    /// Appends a record and makes it durable before returning.
    ///
    /// On `Flush`/`Sync` errors nothing was committed. On `Rotate` errors the
    /// record *was* committed (see [`WalError::committed_offset`]) and the
    /// writer is degraded until the next segment can be opened.
    pub fn append<P>(&self, topic: &str, payload: &P) -> Result<AppendOutcome, WalError>
    where
        P: Serialize + ?Sized,
    {
        let mut guard = self.inner.lock();
        let result = self.append_locked(&mut guard, topic, payload);
        if let Err(e) = &result {
            self.stats_failed_appends.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Append to topic '{}' failed ({}): {}", topic, e.kind(), e);
        }
        result
    }

    fn append_locked<P>(
        &self,
        inner: &mut WalInner,
        topic: &str,
        payload: &P,
    ) -> Result<AppendOutcome, WalError>
    where
        P: Serialize + ?Sized,
    {
        let offset = inner.next_offset;
        let following = offset
            .checked_add(1)
            .ok_or(WalError::OffsetExhausted { offset })?;
        let line = entry::encode_line(offset, topic, payload)?;

        let written = {
            let segment = inner.active_segment(&self.config)?;
            write_durable(segment, &line).map(|bytes| {
                (
                    segment.id(),
                    segment.path().to_path_buf(),
                    bytes,
                    segment.size_on_disk(),
                )
            })
        };
        let (segment_id, path, bytes, size) = match written {
            Ok(written) => written,
            Err(e) => {
                inner.roll_back();
                return Err(e);
            }
        };

        inner.next_offset = following;
        self.stats_appends.fetch_add(1, Ordering::Relaxed);
        self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
        self.stats_bytes_written.fetch_add(bytes, Ordering::Relaxed);
        tracing::trace!("Appended offset {} to segment {}", offset, segment_id);

        let size = size.map_err(|source| WalError::Rotate {
            committed_offset: offset,
            segment: segment_id,
            step: RotateStep::CheckSize,
            source,
        })?;

        let rotated = size >= self.config.segment_size;
        if rotated {
            self.rotate(inner, offset, size)?;
        }

        Ok(AppendOutcome {
            offset,
            segment: segment_id,
            path,
            rotated,
        })
    }

    /// Retires the current segment and activates the next one.
    ///
    /// Runs under the append lock, so no caller sees the gap between the two.
    fn rotate(&self, inner: &mut WalInner, committed_offset: u64, size: u64) -> Result<(), WalError> {
        let old_id = inner.current_segment;
        let Some(next_id) = old_id.checked_add(1) else {
            tracing::error!("Segment {} is the last numbered segment, not rotating", old_id);
            return Err(WalError::Rotate {
                committed_offset,
                segment: old_id,
                step: RotateStep::NextIndex,
                source: std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "segment index space exhausted",
                ),
            });
        };

        let mut old = match std::mem::replace(&mut inner.state, WriterState::Closed) {
            WriterState::Active(segment) => segment,
            other => {
                inner.state = other;
                return Ok(());
            }
        };
        inner.state = WriterState::Degraded {
            pending: next_id,
            truncate_to: None,
        };

        let fail = |step: RotateStep, source: std::io::Error| {
            tracing::error!(
                "Rotation of segment {} failed to {}, WAL degraded: {}",
                old_id,
                step,
                source
            );
            WalError::Rotate {
                committed_offset,
                segment: old_id,
                step,
                source,
            }
        };

        old.flush().map_err(|e| fail(RotateStep::FlushOld, e))?;
        old.close().map_err(|e| fail(RotateStep::CloseOld, e))?;
        let new = Segment::open(&self.config.dir, next_id, self.config.buffer_size)
            .map_err(|e| fail(RotateStep::OpenNew, e))?;

        inner.state = WriterState::Active(new);
        inner.current_segment = next_id;
        self.stats_rotations.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            "Rotated segment {} ({} bytes) -> {}",
            old_id,
            size,
            next_id
        );
        Ok(())
    }

    /// Flushes, syncs and closes the current segment.
    ///
    /// Subsequent appends fail with [`WalError::Closed`]. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        if let WriterState::Active(segment) = std::mem::replace(&mut inner.state, WriterState::Closed)
        {
            let id = segment.id();
            segment
                .close()
                .map_err(|source| WalError::Sync { segment: id, source })?;
            self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                "WAL closed at segment {}, next_offset={}",
                id,
                inner.next_offset
            );
        }
        Ok(())
    }

    /// Returns the offset the next successful append will receive.
    pub fn next_offset(&self) -> u64 {
        self.inner.lock().next_offset
    }

    /// Returns the index of the newest segment opened for writing.
    pub fn current_segment(&self) -> SegmentId {
        self.inner.lock().current_segment
    }

    /// Returns the path of the newest segment opened for writing.
    pub fn current_segment_path(&self) -> PathBuf {
        segment_path(&self.config.dir, self.current_segment())
    }

    /// Returns whether a failed rotation left the writer without a segment.
    pub fn is_degraded(&self) -> bool {
        matches!(self.inner.lock().state, WriterState::Degraded { .. })
    }

    /// Returns whether [`Wal::close`] has been called.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.lock().state, WriterState::Closed)
    }

    /// Returns the WAL directory.
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Returns the configuration this WAL was opened with.
    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    #[cfg(test)]
    fn fail_next(&self, points: crate::segment::FailPoints) {
        if let WriterState::Active(segment) = &mut self.inner.lock().state {
            segment.fail_next(points);
        }
    }

    /// Returns the current I/O statistics.
    pub fn stats(&self) -> WalStats {
        WalStats {
            appends: self.stats_appends.load(Ordering::Relaxed),
            bytes_written: self.stats_bytes_written.load(Ordering::Relaxed),
            fsyncs: self.stats_fsyncs.load(Ordering::Relaxed),
            rotations: self.stats_rotations.load(Ordering::Relaxed),
            failed_appends: self.stats_failed_appends.load(Ordering::Relaxed),
        }
    }
}

/// Writes one line and returns only once it is flushed and fsynced.
///
/// Returns the number of bytes written, including any fence newline.
fn write_durable(segment: &mut Segment, line: &[u8]) -> Result<u64, WalError> {
    let id = segment.id();
    let bytes = segment
        .write_line(line)
        .and_then(|bytes| segment.flush().map(|()| bytes))
        .map_err(|source| WalError::Flush { segment: id, source })?;
    segment
        .sync()
        .map_err(|source| WalError::Sync { segment: id, source })?;
    Ok(bytes)
}
