//! Log recovery.
//!
//! [`load`] runs once when a log is opened: it rebuilds the ordered segment
//! list from the directory and decodes the tail segment. It never salvages
//! data; a tail that does not decode fails the open.
//!
//! [`verify_log`] and [`repair_log`] are offline tools for an operator
//! dealing with a log that no longer opens:
//! - Partial writes (incomplete records at the end of the tail)
//! - Corrupted sealed segments
//! - Index gaps between segments

use crate::entry;
use crate::error::{Result, WalError};
use crate::segment::{
    create_file, open_tail, read_file, segment_filename, sync_dir, EntryCache, Segment,
    SegmentScanner,
};
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Segment list and tail handle produced by [`load`].
pub(crate) struct Recovered {
    pub segments: Vec<Segment>,
    pub tail: File,
    pub last_index: u64,
}

/// Rebuilds the segment list of the log stored in `dir`.
pub(crate) fn load(dir: &Path, file_perms: u32) -> Result<Recovered> {
    let starts = SegmentScanner::list_segments(dir)?;

    let Some((&tail_start, sealed)) = starts.split_last() else {
        let segment = Segment::with_cache(dir, 1, EntryCache::new());
        let tail = create_file(segment.path(), file_perms)?;
        sync_dir(dir)?;
        tracing::info!("Created new log at {}", dir.display());
        return Ok(Recovered {
            segments: vec![segment],
            tail,
            last_index: 0,
        });
    };

    let mut segments: Vec<Segment> = sealed.iter().map(|&start| Segment::new(dir, start)).collect();

    let path = dir.join(segment_filename(tail_start));
    let (tail, buf) = open_tail(&path, file_perms)?;
    let cache = EntryCache::build(buf).map_err(|e| {
        tracing::error!("Tail segment {} is corrupt: {}", path.display(), e);
        e
    })?;
    let entries = cache.len();
    let last_index = tail_start + entries as u64 - 1;
    segments.push(Segment::with_cache(dir, tail_start, cache));

    tracing::info!(
        "Log recovered: {} segments, first_index={}, last_index={}",
        segments.len(),
        starts[0],
        last_index
    );
    tracing::debug!(
        "Tail segment {} holds {} entries",
        path.display(),
        entries
    );

    Ok(Recovered {
        segments,
        tail,
        last_index,
    })
}

/// Result of a verify or repair scan.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Number of segment files found.
    pub segments: usize,
    /// Number of whole records decoded across all segments.
    pub valid_records: u64,
    /// Bytes at the end of segments that do not form a whole record.
    pub trailing_bytes: u64,
    /// Bytes removed from the tail segment by a repair.
    pub bytes_truncated: u64,
    /// Segments that were repaired.
    pub segments_recovered: Vec<u64>,
    /// Segments with problems that were left untouched.
    pub segments_with_errors: Vec<(u64, String)>,
}

impl RecoveryReport {
    /// Returns whether the log would open and read cleanly.
    pub fn is_clean(&self) -> bool {
        self.trailing_bytes == self.bytes_truncated && self.segments_with_errors.is_empty()
    }
}

/// Outcome of decoding one segment file.
struct SegmentScan {
    records: u64,
    valid_len: u64,
    file_len: u64,
    error: Option<WalError>,
}

fn scan_segment(path: &Path) -> Result<SegmentScan> {
    let buf = read_file(path)?;

    let mut records = 0u64;
    let mut pos = 0usize;
    let mut error = None;

    while pos < buf.len() {
        match entry::decode(&buf[pos..], pos) {
            Ok((header_len, payload_len)) => {
                records += 1;
                pos += header_len + payload_len;
            }
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }

    Ok(SegmentScan {
        records,
        valid_len: pos as u64,
        file_len: buf.len() as u64,
        error,
    })
}

fn scan(dir: &Path, repair: bool) -> Result<RecoveryReport> {
    let starts = SegmentScanner::list_segments(dir)?;
    let mut report = RecoveryReport {
        segments: starts.len(),
        ..Default::default()
    };

    for (i, &start) in starts.iter().enumerate() {
        let path = dir.join(segment_filename(start));
        let scan = scan_segment(&path)?;
        let is_tail = i + 1 == starts.len();

        report.valid_records += scan.records;
        report.trailing_bytes += scan.file_len - scan.valid_len;

        if let Some(next) = starts.get(i + 1) {
            let expected = start + scan.records;
            if scan.error.is_none() && expected != *next {
                report.segments_with_errors.push((
                    start,
                    format!(
                        "holds {} entries but next segment starts at {}",
                        scan.records, next
                    ),
                ));
            }
        }

        let Some(error) = scan.error else {
            continue;
        };

        if repair && is_tail {
            truncate_file(&path, scan.valid_len)?;
            let removed = scan.file_len - scan.valid_len;
            report.bytes_truncated += removed;
            report.segments_recovered.push(start);
            tracing::warn!(
                "Truncated segment {} at offset {} (removed {} bytes)",
                start,
                scan.valid_len,
                removed
            );
        } else {
            report.segments_with_errors.push((start, error.to_string()));
        }
    }

    Ok(report)
}

fn truncate_file(path: &Path, len: u64) -> Result<()> {
    OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|file| {
            file.set_len(len)?;
            file.sync_all()
        })
        .map_err(WalError::io("truncate segment", path))
}

/// Verifies log integrity without modifying anything.
pub fn verify_log(dir: impl AsRef<Path>) -> Result<RecoveryReport> {
    scan(dir.as_ref(), false)
}

/// Repairs the log by cutting a partial write off the tail segment.
///
/// Sealed segments are never modified; problems there are only reported.
pub fn repair_log(dir: impl AsRef<Path>) -> Result<RecoveryReport> {
    scan(dir.as_ref(), true)
}
