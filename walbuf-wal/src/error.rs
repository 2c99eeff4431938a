//! WAL error types.

use crate::segment::SegmentId;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Step of a rotation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateStep {
    /// Flushing the outgoing segment's buffer.
    FlushOld,
    /// Syncing and closing the outgoing segment.
    CloseOld,
    /// Opening the incoming segment.
    OpenNew,
    /// Reading the segment size that decides whether to rotate.
    CheckSize,
    /// Computing the index of the incoming segment.
    NextIndex,
}

impl fmt::Display for RotateStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RotateStep::FlushOld => "flush old segment",
            RotateStep::CloseOld => "close old segment",
            RotateStep::OpenNew => "open new segment",
            RotateStep::CheckSize => "read segment size",
            RotateStep::NextIndex => "number next segment",
        };
        f.write_str(s)
    }
}

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("cannot prepare WAL directory '{}': {source}", .path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot open segment {segment} at '{}': {source}", .path.display())]
    SegmentOpen {
        segment: SegmentId,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode log entry: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to flush segment {segment}: {source}")]
    Flush {
        segment: SegmentId,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to sync segment {segment}: {source}")]
    Sync {
        segment: SegmentId,
        #[source]
        source: std::io::Error,
    },

    #[error("offset {committed_offset} committed to segment {segment}, but rotation failed to {step}: {source}")]
    Rotate {
        committed_offset: u64,
        segment: SegmentId,
        step: RotateStep,
        #[source]
        source: std::io::Error,
    },

    #[error("WAL degraded: segment {pending} could not be opened: {source}")]
    Degraded {
        pending: SegmentId,
        #[source]
        source: std::io::Error,
    },

    #[error("offset space exhausted at offset {offset}")]
    OffsetExhausted { offset: u64 },

    #[error("WAL is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WalError {
    /// Returns a stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            WalError::Directory { .. } => "directory",
            WalError::SegmentOpen { .. } => "segment_open",
            WalError::Encode(_) => "encode",
            WalError::Flush { .. } => "flush",
            WalError::Sync { .. } => "sync",
            WalError::Rotate { .. } => "rotate",
            WalError::Degraded { .. } => "degraded",
            WalError::OffsetExhausted { .. } => "offset_exhausted",
            WalError::Closed => "closed",
            WalError::Io(_) => "io",
        }
    }

    /// Returns the offset of a record that was made durable even though the
    /// call reported an error.
    ///
    /// Only rotation failures commit the record before failing.
    pub fn committed_offset(&self) -> Option<u64> {
        match self {
            WalError::Rotate {
                committed_offset, ..
            } => Some(*committed_offset),
            _ => None,
        }
    }

    /// Returns whether a later call may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WalError::Flush { .. }
                | WalError::Sync { .. }
                | WalError::Rotate { .. }
                | WalError::Degraded { .. }
                | WalError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_rotate_error_reports_committed_offset() {
        let err = WalError::Rotate {
            committed_offset: 42,
            segment: 3,
            step: RotateStep::OpenNew,
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(err.committed_offset(), Some(42));
        assert_eq!(err.kind(), "rotate");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("open new segment"));
    }

    #[test]
    fn test_write_failures_are_not_committed() {
        let err = WalError::Sync {
            segment: 1,
            source: io::Error::new(io::ErrorKind::Other, "disk gone"),
        };
        assert_eq!(err.committed_offset(), None);
        assert_eq!(err.kind(), "sync");
        assert!(!WalError::Closed.is_retryable());
    }

    #[test]
    fn test_offset_exhausted_is_terminal() {
        let err = WalError::OffsetExhausted { offset: u64::MAX };
        assert_eq!(err.kind(), "offset_exhausted");
        assert_eq!(err.committed_offset(), None);
        assert!(!err.is_retryable());
    }
}
