//! Main log implementation.

use crate::batch::Batch;
use crate::error::{Result, WalError};
use crate::recovery::{self, Recovered};
use crate::segment::{
    create_file, open_tail, segment_filename, sync_dir, temp_filename, write_synced, EntryCache,
    Segment,
};
use crate::{DEFAULT_DIR_PERMS, DEFAULT_FILE_PERMS, DEFAULT_SEGMENT_CACHE_SIZE, DEFAULT_SEGMENT_SIZE};
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, DirBuilder, File};
use std::io::{Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Log configuration.
///
/// Zero values are replaced by their defaults when the log is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Fsync after every write or batch commit.
    pub sync: bool,
    /// Maximum segment size before rollover.
    pub segment_size: u64,
    /// Permission bits for the log directory.
    pub dir_perms: u32,
    /// Permission bits for segment files.
    pub file_perms: u32,
    /// Number of sealed segment caches kept in memory.
    pub segment_cache_size: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            sync: true,
            segment_size: DEFAULT_SEGMENT_SIZE,
            dir_perms: DEFAULT_DIR_PERMS,
            file_perms: DEFAULT_FILE_PERMS,
            segment_cache_size: DEFAULT_SEGMENT_CACHE_SIZE,
        }
    }
}

impl LogConfig {
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    pub fn with_dir_perms(mut self, perms: u32) -> Self {
        self.dir_perms = perms;
        self
    }

    pub fn with_file_perms(mut self, perms: u32) -> Self {
        self.file_perms = perms;
        self
    }

    pub fn with_segment_cache_size(mut self, count: usize) -> Self {
        self.segment_cache_size = count;
        self
    }

    /// Returns a copy with unset fields replaced by their defaults.
    pub fn normalized(mut self) -> Self {
        if self.segment_size == 0 {
            self.segment_size = DEFAULT_SEGMENT_SIZE;
        }
        if self.dir_perms == 0 {
            self.dir_perms = DEFAULT_DIR_PERMS;
        }
        if self.file_perms == 0 {
            self.file_perms = DEFAULT_FILE_PERMS;
        }
        if self.segment_cache_size == 0 {
            self.segment_cache_size = DEFAULT_SEGMENT_CACHE_SIZE;
        }
        self
    }
}

/// I/O statistics for the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogStats {
    /// Total entries appended.
    pub entries_written: u64,
    /// Total encoded bytes appended.
    pub bytes_written: u64,
    /// Total batch commits (a single `write` counts as one).
    pub batches: u64,
    /// Total fsync operations on segment files.
    pub fsyncs: u64,
    /// Total read operations.
    pub reads: u64,
    /// Total segment rollovers.
    pub rollovers: u64,
    /// Sealed segment caches loaded from disk.
    pub cache_loads: u64,
    /// Sealed segment caches dropped.
    pub cache_evictions: u64,
}

/// State guarded by the log's read-write lock.
struct LogState {
    /// All segments, ascending by start index. The last one is the tail.
    segments: Vec<Segment>,
    /// Handle to the tail segment file. `None` once closed.
    tail: Option<File>,
    /// Index of the last entry; `first_index() - 1` when empty.
    last_index: u64,
    /// Reusable batch for single-entry writes.
    batch: Batch,
    /// Reusable encode buffer.
    scratch: BytesMut,
}

impl LogState {
    fn first_index(&self) -> u64 {
        self.segments[0].start_index()
    }

    fn tail_segment(&mut self) -> &mut Segment {
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }

    /// Position of the segment holding `index`. `index` must be in range.
    fn segment_for(&self, index: u64) -> usize {
        self.segments.partition_point(|s| s.start_index() <= index) - 1
    }

    fn check_range(&self, index: u64) -> Result<()> {
        let first = self.first_index();
        if index < first || index > self.last_index {
            return Err(WalError::OutOfRange {
                index,
                first,
                last: self.last_index,
            });
        }
        Ok(())
    }
}

/// Segmented write-ahead log.
///
/// Readers (`read`, `first_index`, `last_index`) share a read lock; every
/// mutation takes the write lock, so entries of one batch always receive
/// consecutive indices.
pub struct Log {
    dir: PathBuf,
    config: LogConfig,
    state: RwLock<LogState>,
    /// Start indices of sealed segments with a loaded cache, oldest first.
    loaded: Mutex<VecDeque<u64>>,
    closed: AtomicBool,
    corrupt: AtomicBool,
    /// I/O statistics counters.
    stats_entries_written: AtomicU64,
    stats_bytes_written: AtomicU64,
    stats_batches: AtomicU64,
    stats_fsyncs: AtomicU64,
    stats_reads: AtomicU64,
    stats_rollovers: AtomicU64,
    stats_cache_loads: AtomicU64,
    stats_cache_evictions: AtomicU64,
}

impl Log {
    /// Opens or creates a log in `dir`.
    pub fn open(dir: impl AsRef<Path>, config: LogConfig) -> Result<Self> {
        let config = config.normalized();
        let dir = dir.as_ref();

        let mut builder = DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(config.dir_perms);
        }
        builder
            .create(dir)
            .map_err(WalError::io("create directory", dir))?;
        let dir = dir
            .canonicalize()
            .map_err(WalError::io("resolve directory", dir))?;

        let Recovered {
            segments,
            tail,
            last_index,
        } = recovery::load(&dir, config.file_perms)?;

        Ok(Self {
            dir,
            config,
            state: RwLock::new(LogState {
                segments,
                tail: Some(tail),
                last_index,
                batch: Batch::new(),
                scratch: BytesMut::new(),
            }),
            loaded: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            corrupt: AtomicBool::new(false),
            stats_entries_written: AtomicU64::new(0),
            stats_bytes_written: AtomicU64::new(0),
            stats_batches: AtomicU64::new(0),
            stats_fsyncs: AtomicU64::new(0),
            stats_reads: AtomicU64::new(0),
            stats_rollovers: AtomicU64::new(0),
            stats_cache_loads: AtomicU64::new(0),
            stats_cache_evictions: AtomicU64::new(0),
        })
    }

    /// Returns the log directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the effective configuration.
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WalError::Closed);
        }
        if self.corrupt.load(Ordering::Acquire) {
            return Err(WalError::Corrupt);
        }
        Ok(())
    }

    /// Flags the log corrupt if `err` reports bad segment data.
    fn observe(&self, err: WalError) -> WalError {
        if err.is_corrupt() && !self.corrupt.swap(true, Ordering::AcqRel) {
            tracing::error!("Log at {} marked corrupt: {}", self.dir.display(), err);
        }
        err
    }

    /// Marks the log unusable after a failure left memory and disk out of step.
    ///
    /// Reopening rebuilds the state from disk.
    fn diverged(&self, err: WalError) -> WalError {
        self.corrupt.store(true, Ordering::Release);
        tracing::error!(
            "Log at {} must be reopened after failed truncation: {}",
            self.dir.display(),
            err
        );
        err
    }

    /// Appends an entry and returns its index.
    pub fn write(&self, data: impl AsRef<[u8]>) -> Result<u64> {
        let mut state = self.state.write();
        self.check_open()?;

        let mut batch = std::mem::take(&mut state.batch);
        batch.clear();
        batch.write(data);
        let result = self.commit(&mut state, &batch);
        batch.clear();
        state.batch = batch;

        result
    }

    /// Appends every entry in `batch` with consecutive indices.
    ///
    /// The batch is cleared on success and left untouched on error.
    pub fn write_batch(&self, batch: &mut Batch) -> Result<()> {
        let mut state = self.state.write();
        self.check_open()?;

        if batch.is_empty() {
            return Ok(());
        }
        self.commit(&mut state, batch)?;
        batch.clear();
        Ok(())
    }

    /// Writes `batch` to the tail, rolling over first if it would not fit.
    /// Returns the index of the last entry written.
    fn commit(&self, state: &mut LogState, batch: &Batch) -> Result<u64> {
        let mut scratch = std::mem::take(&mut state.scratch);
        let ranges = batch.encode_into(&mut scratch);

        let result = self.append(state, &scratch, &ranges);
        scratch.clear();
        state.scratch = scratch;
        result?;

        state.last_index += batch.len() as u64;
        self.stats_entries_written
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.stats_bytes_written
            .fetch_add(batch.encoded_len() as u64, Ordering::Relaxed);
        self.stats_batches.fetch_add(1, Ordering::Relaxed);

        Ok(state.last_index)
    }

    /// Appends encoded records to the tail file and its cache.
    ///
    /// A failed write or sync cuts the file back to its previous length.
    fn append(&self, state: &mut LogState, encoded: &[u8], ranges: &[Range<usize>]) -> Result<()> {
        let tail_size = state.tail_segment().cache_mut().size() as u64;
        if tail_size > 0 && tail_size + encoded.len() as u64 > self.config.segment_size {
            self.roll(state)?;
        }

        let last = state.segments.len() - 1;
        let segment = &mut state.segments[last];
        let file = state.tail.as_mut().ok_or(WalError::Closed)?;
        let prior = segment.cache_mut().size() as u64;

        let written = file.write_all(encoded).and_then(|_| {
            if self.config.sync {
                file.sync_data()?;
                self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        });

        if let Err(e) = written {
            let rolled_back = file
                .set_len(prior)
                .and_then(|_| file.seek(SeekFrom::End(0)));
            if rolled_back.is_err() {
                self.corrupt.store(true, Ordering::Release);
                tracing::error!(
                    "Failed to roll back partial write to {}",
                    segment.path().display()
                );
            }
            return Err(WalError::io("append", segment.path())(e));
        }

        segment.cache_mut().append_encoded(encoded, ranges);
        Ok(())
    }

    /// Seals the tail and starts a new segment at the next index.
    fn roll(&self, state: &mut LogState) -> Result<()> {
        let sealed = state.tail_segment();
        let sealed_start = sealed.start_index();
        let sealed_path = sealed.path().to_path_buf();

        if let Some(file) = state.tail.as_ref() {
            file.sync_data()
                .map_err(WalError::io("sync segment", &sealed_path))?;
            self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
        }

        let next = state.last_index + 1;
        let segment = Segment::with_cache(&self.dir, next, EntryCache::new());
        let file = create_file(segment.path(), self.config.file_perms)?;
        if self.config.sync {
            sync_dir(&self.dir)?;
        }

        state.tail = Some(file);
        state.segments.push(segment);
        self.stats_rollovers.fetch_add(1, Ordering::Relaxed);
        self.note_loaded(sealed_start, &state.segments);

        tracing::debug!("Rolled over to segment {}", next);
        Ok(())
    }

    /// Records that a sealed segment's cache is in memory and evicts the
    /// oldest ones past the configured limit.
    fn note_loaded(&self, start: u64, segments: &[Segment]) {
        let evict: Vec<u64> = {
            let mut loaded = self.loaded.lock();
            loaded.retain(|&s| s != start);
            loaded.push_back(start);
            let excess = loaded.len().saturating_sub(self.config.segment_cache_size);
            loaded.drain(..excess).collect()
        };

        for start in evict {
            let Ok(i) = segments.binary_search_by_key(&start, Segment::start_index) else {
                continue;
            };
            if i + 1 < segments.len() && segments[i].evict() {
                self.stats_cache_evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Evicted cache of segment {}", start);
            }
        }
    }

    /// Reads the entry at `index`.
    pub fn read(&self, index: u64) -> Result<Bytes> {
        let state = self.state.read();
        self.check_open()?;
        state.check_range(index)?;

        let segment = &state.segments[state.segment_for(index)];
        let (cache, loaded) = segment.load().map_err(|e| self.observe(e))?;
        if loaded {
            self.stats_cache_loads.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Loaded cache of segment {}", segment.start_index());
            self.note_loaded(segment.start_index(), &state.segments);
        }

        let local = (index - segment.start_index()) as usize;
        let payload = cache.payload(local).ok_or_else(|| {
            self.observe(WalError::CorruptRecord {
                offset: cache.size(),
                reason: "segment ends before the next segment's start index",
            })
        })?;

        self.stats_reads.fetch_add(1, Ordering::Relaxed);
        Ok(Bytes::copy_from_slice(payload))
    }

    /// Returns the index of the first entry.
    pub fn first_index(&self) -> Result<u64> {
        let state = self.state.read();
        self.check_open()?;
        Ok(state.first_index())
    }

    /// Returns the index of the last entry, or `first_index() - 1` if the log
    /// is empty.
    pub fn last_index(&self) -> Result<u64> {
        let state = self.state.read();
        self.check_open()?;
        Ok(state.last_index)
    }

    /// Returns whether the log holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        let state = self.state.read();
        self.check_open()?;
        Ok(state.last_index < state.first_index())
    }

    /// Discards every entry before `index`, which becomes the first index.
    ///
    /// The segment holding `index` is rewritten to a scratch file first; older
    /// segments are then removed oldest-first and the scratch file renamed
    /// into place, so every intermediate on-disk state opens cleanly.
    pub fn truncate_front(&self, index: u64) -> Result<()> {
        let mut state = self.state.write();
        self.check_open()?;
        state.check_range(index)?;

        if index == state.first_index() {
            return Ok(());
        }

        let i = state.segment_for(index);
        let segment_start = state.segments[i].start_index();
        let is_sealed = i + 1 < state.segments.len();

        let replacement = if index == segment_start {
            None
        } else {
            let (cache, _) = state.segments[i].load().map_err(|e| self.observe(e))?;
            let cache = cache.split_front((index - segment_start) as usize);
            let temp = self.dir.join(temp_filename(index));
            write_synced(&temp, self.config.file_perms, cache.as_bytes())?;
            Some((temp, cache))
        };

        let rewritten = replacement.is_some();
        self.replace_front(&mut state, i, index, replacement)
            .map_err(|e| self.diverged(e))?;

        state.segments.drain(..i);
        self.loaded.lock().retain(|&s| s >= index);
        if rewritten && is_sealed {
            self.note_loaded(index, &state.segments);
        }

        tracing::info!(
            "Truncated front of log to index {} ({} segments remain)",
            index,
            state.segments.len()
        );
        Ok(())
    }

    fn replace_front(
        &self,
        state: &mut LogState,
        i: usize,
        index: u64,
        replacement: Option<(PathBuf, EntryCache)>,
    ) -> Result<()> {
        for segment in &state.segments[..i] {
            remove_file(segment.path())?;
        }

        if let Some((temp, cache)) = replacement {
            let is_tail = i + 1 == state.segments.len();
            let path = self.dir.join(segment_filename(index));
            fs::rename(&temp, &path).map_err(WalError::io("rename segment", &temp))?;

            if is_tail {
                state.tail = None;
            }
            remove_file(state.segments[i].path())?;
            state.segments[i] = Segment::with_cache(&self.dir, index, cache);
            if is_tail {
                let (file, _) = open_tail(&path, self.config.file_perms)?;
                state.tail = Some(file);
            }
        }

        sync_dir(&self.dir)
    }

    /// Discards every entry after `index`, which becomes the last index.
    ///
    /// Later segments are removed newest-first before the truncated segment
    /// replaces the old one by rename, and it becomes the new tail.
    pub fn truncate_back(&self, index: u64) -> Result<()> {
        let mut state = self.state.write();
        self.check_open()?;
        state.check_range(index)?;

        if index == state.last_index {
            return Ok(());
        }

        let i = state.segment_for(index);
        let segment_start = state.segments[i].start_index();

        let (cache, _) = state.segments[i].load().map_err(|e| self.observe(e))?;
        let mut cache = EntryCache::clone(&cache);
        cache.truncate_back((index - segment_start) as usize);
        let temp = self.dir.join(temp_filename(segment_start));
        write_synced(&temp, self.config.file_perms, cache.as_bytes())?;

        self.replace_back(&mut state, i, &temp)
            .map_err(|e| self.diverged(e))?;

        state.segments.truncate(i + 1);
        state.segments[i] = Segment::with_cache(&self.dir, segment_start, cache);
        state.last_index = index;
        self.loaded.lock().retain(|&s| s < segment_start);

        tracing::info!(
            "Truncated back of log to index {} ({} segments remain)",
            index,
            state.segments.len()
        );
        Ok(())
    }

    fn replace_back(&self, state: &mut LogState, i: usize, temp: &Path) -> Result<()> {
        state.tail = None;
        for segment in state.segments[i + 1..].iter().rev() {
            remove_file(segment.path())?;
        }

        let path = state.segments[i].path();
        fs::rename(temp, path).map_err(WalError::io("rename segment", temp))?;
        sync_dir(&self.dir)?;

        let (file, _) = open_tail(path, self.config.file_perms)?;
        state.tail = Some(file);
        Ok(())
    }

    /// Forces a sync of the tail segment regardless of the sync setting.
    pub fn sync(&self) -> Result<()> {
        let state = self.state.write();
        self.check_open()?;

        let segment = &state.segments[state.segments.len() - 1];
        if let Some(file) = state.tail.as_ref() {
            file.sync_data()
                .map_err(WalError::io("sync segment", segment.path()))?;
            self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Evicts every sealed segment cache. Returns how many were dropped.
    pub fn clear_cache(&self) -> usize {
        let state = self.state.read();
        self.loaded.lock().clear();

        let (_, sealed) = match state.segments.split_last() {
            Some(split) => split,
            None => return 0,
        };
        let evicted = sealed.iter().filter(|s| s.evict()).count();
        self.stats_cache_evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// Returns the number of segment files.
    pub fn segment_count(&self) -> usize {
        self.state.read().segments.len()
    }

    /// Returns the start index of every segment, ascending.
    pub fn segment_start_indices(&self) -> Vec<u64> {
        self.state
            .read()
            .segments
            .iter()
            .map(Segment::start_index)
            .collect()
    }

    /// Returns the current I/O statistics.
    pub fn stats(&self) -> LogStats {
        LogStats {
            entries_written: self.stats_entries_written.load(Ordering::Relaxed),
            bytes_written: self.stats_bytes_written.load(Ordering::Relaxed),
            batches: self.stats_batches.load(Ordering::Relaxed),
            fsyncs: self.stats_fsyncs.load(Ordering::Relaxed),
            reads: self.stats_reads.load(Ordering::Relaxed),
            rollovers: self.stats_rollovers.load(Ordering::Relaxed),
            cache_loads: self.stats_cache_loads.load(Ordering::Relaxed),
            cache_evictions: self.stats_cache_evictions.load(Ordering::Relaxed),
        }
    }

    /// Closes the log. Every later call fails with [`WalError::Closed`].
    ///
    /// A corrupt log can still be closed.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(WalError::Closed);
        }

        let mut result = Ok(());
        if let Some(file) = state.tail.take() {
            if self.config.sync && !self.corrupt.load(Ordering::Acquire) {
                let path = state.tail_segment().path().to_path_buf();
                result = file.sync_data().map_err(WalError::io("sync segment", &path));
                if result.is_ok() {
                    self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        tracing::debug!("Closed log at {}", self.dir.display());
        result
    }
}

fn remove_file(path: &Path) -> Result<()> {
    fs::remove_file(path).map_err(WalError::io("remove segment", path))
}
