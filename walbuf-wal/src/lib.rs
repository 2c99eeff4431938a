//! # walbuf-wal
//!
//! Write-Ahead Log engine for walbuf.
//!
//! This crate provides a durable, append-only log with:
//! - Newline-delimited JSON records, one per line
//! - Numbered segment files with size-based rotation
//! - Flush + fsync before every acknowledged append
//! - Offset resume from the last record on disk

pub mod entry;
pub mod error;
pub mod recovery;
pub mod segment;
pub mod wal;

pub use entry::{LogEntry, DEFAULT_TOPIC};
pub use error::{RotateStep, WalError};
pub use segment::{Segment, SegmentId, SegmentScanner};
pub use wal::{AppendOutcome, Wal, WalConfig, WalStats};

/// Default segment size threshold (64 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Default capacity of the per-segment write buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
