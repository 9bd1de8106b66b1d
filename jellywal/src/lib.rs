//! # jellywal
//!
//! Embedded write-ahead log.
//!
//! This crate provides a durable, append-only log of opaque binary entries with:
//! - 1-based, gap-free entry indices
//! - Segment-based file management with size-triggered rollover
//! - Batched appends with a single fsync per batch
//! - Front and back truncation
//! - Recovery that rebuilds the in-memory index on open
//!
//! ```no_run
//! use jellywal::{Batch, Log, LogConfig};
//!
//! # fn main() -> jellywal::Result<()> {
//! let log = Log::open("/var/lib/app/wal", LogConfig::default())?;
//! let index = log.write(b"hello")?;
//! assert_eq!(&log.read(index)?[..], b"hello");
//!
//! let mut batch = Batch::new();
//! batch.write(b"a");
//! batch.write(b"b");
//! log.write_batch(&mut batch)?;
//! log.close()?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod entry;
pub mod error;
pub mod log;
pub mod recovery;
pub mod segment;

pub use batch::Batch;
pub use error::{Result, WalError};
pub use log::{Log, LogConfig, LogStats};
pub use recovery::{repair_log, verify_log, RecoveryReport};
pub use segment::{Segment, SegmentScanner};

/// Default segment size (20 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 20 * 1024 * 1024;

/// Default directory permissions.
pub const DEFAULT_DIR_PERMS: u32 = 0o750;

/// Default segment file permissions.
pub const DEFAULT_FILE_PERMS: u32 = 0o640;

/// Default number of sealed segment caches kept in memory.
pub const DEFAULT_SEGMENT_CACHE_SIZE: usize = 2;
