//! Log segment management.
//!
//! The log is split into segment files for easier management:
//! - Rollover: New segment when the tail would exceed the size limit
//! - Truncation: Whole segments are deleted, partial ones rewritten
//! - Recovery: Sealed segments are loaded lazily on first read
//!
//! Each segment is named after the index of its first entry, written as 20
//! zero-padded decimal digits so that lexicographic order equals numeric
//! order.

use crate::entry;
use crate::error::{Result, WalError};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Width of a segment file name.
pub const SEGMENT_NAME_LEN: usize = 20;

/// Segment file name format: NNNNNNNNNNNNNNNNNNNN (20 decimal digits)
pub fn segment_filename(start_index: u64) -> String {
    format!("{:020}", start_index)
}

/// Scratch file used while a segment is being rewritten.
pub(crate) fn temp_filename(start_index: u64) -> String {
    format!("{}.TEMP", segment_filename(start_index))
}

/// Parse the start index from a segment file name.
///
/// Only names of exactly 20 ASCII digits with a positive value qualify.
pub fn parse_segment_filename(name: &str) -> Option<u64> {
    if name.len() != SEGMENT_NAME_LEN || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse::<u64>().ok().filter(|&index| index > 0)
}

/// Decoded entry positions of one segment.
///
/// Holds the raw file bytes plus the payload range of every entry, so entry
/// lookup is plain index arithmetic.
#[derive(Debug, Clone, Default)]
pub struct EntryCache {
    buf: BytesMut,
    ranges: Vec<Range<usize>>,
}

impl EntryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the cache by decoding `buf` front to back.
    pub fn build(buf: BytesMut) -> Result<Self> {
        let mut ranges = Vec::new();
        let mut pos = 0;

        while pos < buf.len() {
            let (header_len, payload_len) = entry::decode(&buf[pos..], pos)?;
            let start = pos + header_len;
            ranges.push(start..start + payload_len);
            pos = start + payload_len;
        }

        Ok(Self { buf, ranges })
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Returns whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Returns the encoded size in bytes.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Returns the raw encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Returns the payload of the entry at local offset `k`.
    pub fn payload(&self, k: usize) -> Option<&[u8]> {
        self.ranges.get(k).map(|range| &self.buf[range.clone()])
    }

    /// Returns the byte offset at which the record for entry `k` begins.
    pub fn record_start(&self, k: usize) -> usize {
        match k {
            0 => 0,
            _ => self.ranges[k - 1].end,
        }
    }

    /// Appends already-encoded records. `ranges` are relative to `encoded`.
    pub(crate) fn append_encoded(&mut self, encoded: &[u8], ranges: &[Range<usize>]) {
        let base = self.buf.len();
        self.buf.extend_from_slice(encoded);
        self.ranges
            .extend(ranges.iter().map(|r| r.start + base..r.end + base));
    }

    /// Returns a cache holding entries `k..`, rebased to offset zero.
    pub(crate) fn split_front(&self, k: usize) -> EntryCache {
        let cut = self.record_start(k);
        EntryCache {
            buf: BytesMut::from(&self.buf[cut..]),
            ranges: self.ranges[k..]
                .iter()
                .map(|r| r.start - cut..r.end - cut)
                .collect(),
        }
    }

    /// Drops every entry after local offset `k`.
    pub(crate) fn truncate_back(&mut self, k: usize) {
        let end = self.ranges[k].end;
        self.buf.truncate(end);
        self.ranges.truncate(k + 1);
    }
}

/// A single log segment file.
///
/// The entry cache sits behind its own lock so a sealed segment can be
/// loaded or evicted while other readers hold the log's shared lock.
#[derive(Debug)]
pub struct Segment {
    start_index: u64,
    path: PathBuf,
    cache: Mutex<Option<Arc<EntryCache>>>,
}

impl Segment {
    /// Registers a segment without loading it.
    pub fn new(dir: &Path, start_index: u64) -> Self {
        Self {
            start_index,
            path: dir.join(segment_filename(start_index)),
            cache: Mutex::new(None),
        }
    }

    /// Registers a segment with an already-built cache.
    pub(crate) fn with_cache(dir: &Path, start_index: u64, cache: EntryCache) -> Self {
        Self {
            start_index,
            path: dir.join(segment_filename(start_index)),
            cache: Mutex::new(Some(Arc::new(cache))),
        }
    }

    /// Returns the index of the first entry in this segment.
    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    /// Returns the segment file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns whether the entry cache is in memory.
    pub fn is_loaded(&self) -> bool {
        self.cache.lock().is_some()
    }

    /// Returns the cache, reading and decoding the file if it is not loaded.
    ///
    /// The flag is true when this call performed the load.
    pub(crate) fn load(&self) -> Result<(Arc<EntryCache>, bool)> {
        let mut guard = self.cache.lock();
        if let Some(cache) = guard.as_ref() {
            return Ok((Arc::clone(cache), false));
        }

        let cache = Arc::new(EntryCache::build(read_file(&self.path)?)?);
        *guard = Some(Arc::clone(&cache));
        Ok((cache, true))
    }

    /// Drops the cache. Returns whether one was loaded.
    pub(crate) fn evict(&self) -> bool {
        self.cache.lock().take().is_some()
    }

    /// Mutable access to the cache of the tail segment.
    pub(crate) fn cache_mut(&mut self) -> &mut EntryCache {
        Arc::make_mut(self.cache.get_mut().get_or_insert_with(Default::default))
    }
}

/// Reads a whole segment file into a buffer.
pub(crate) fn read_file(path: &Path) -> Result<BytesMut> {
    let mut file = File::open(path).map_err(WalError::io("open segment", path))?;
    read_to_buf(&mut file, path)
}

fn read_to_buf(file: &mut File, path: &Path) -> Result<BytesMut> {
    let len = file
        .metadata()
        .map_err(WalError::io("stat segment", path))?
        .len() as usize;

    let mut buf = BytesMut::with_capacity(len);
    buf.resize(len, 0);
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_exact(&mut buf[..]))
        .map_err(WalError::io("read segment", path))?;
    Ok(buf)
}

fn open_options(file_perms: u32) -> OpenOptions {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(file_perms);
    }
    #[cfg(not(unix))]
    let _ = file_perms;
    opts
}

/// Creates (or truncates) a segment file for writing.
pub(crate) fn create_file(path: &Path, file_perms: u32) -> Result<File> {
    open_options(file_perms)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(WalError::io("create segment", path))
}

/// Opens an existing segment as the tail: reads its contents and leaves the
/// handle positioned at end-of-file.
pub(crate) fn open_tail(path: &Path, file_perms: u32) -> Result<(File, BytesMut)> {
    let mut file = open_options(file_perms)
        .open(path)
        .map_err(WalError::io("open tail segment", path))?;
    let buf = read_to_buf(&mut file, path)?;
    file.seek(SeekFrom::End(0))
        .map_err(WalError::io("seek tail segment", path))?;
    Ok((file, buf))
}

/// Writes `bytes` to a fresh file and syncs it.
pub(crate) fn write_synced(path: &Path, file_perms: u32, bytes: &[u8]) -> Result<()> {
    let mut file = create_file(path, file_perms)?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(WalError::io("write segment", path))
}

/// Syncs the directory so renames and removals are durable.
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(WalError::io("sync directory", dir))
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Segment directory scanner.
pub struct SegmentScanner;

impl SegmentScanner {
    /// Lists the start indices of all segments in a directory, sorted ascending.
    ///
    /// Directories and files whose names are not segment names are skipped.
    pub fn list_segments(dir: &Path) -> Result<Vec<u64>> {
        let mut segments = Vec::new();

        let entries = std::fs::read_dir(dir).map_err(WalError::io("read directory", dir))?;
        for entry in entries {
            let entry = entry.map_err(WalError::io("read directory", dir))?;
            let file_type = entry
                .file_type()
                .map_err(WalError::io("stat", &entry.path()))?;
            if file_type.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(index) = name.to_str().and_then(parse_segment_filename) {
                segments.push(index);
            }
        }

        segments.sort_unstable();
        Ok(segments)
    }
}
