//! Random access over a chain of sequential containers.
//!
//! A [`FrameSequence`] presents one or more container files as a single
//! indexable run of frames. A background thread builds the index by peeking
//! record heads (stream tag, sub-stream, extent) without decoding slot
//! payloads; each index entry carries a parent pointer to its nearest
//! metadata ancestor, so any frame can be reconstructed fully mixed by
//! decoding only the handful of metadata frames in scope at its position.
//!
//! Decoded frames live in a small cache: metadata frames stay pinned while
//! their container is open (ancestor chains re-visit them constantly), data
//! frames are kept in an eviction window around the most recent accesses.

use crate::codec::{self, ObjectRegistry, HEADER_LEN};
use crate::stager::{LocalStager, Stager};
use evtflow_core::{EvtError, EvtResult, Frame, Stream, StreamMixer};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Default eviction window behind the most recent access.
pub const DEFAULT_BACKWARD: usize = 5;
/// Default eviction window ahead of the most recent access.
pub const DEFAULT_FORWARD: usize = 15;

/// One record's place in the logical sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Logical byte offset into the concatenated container bodies.
    pub offset: u64,
    pub stream: Stream,
    pub sub_stream: Option<String>,
    /// Index of the entry this frame inherits metadata from, if any.
    /// Always points backwards.
    pub parent: Option<usize>,
}

#[derive(Debug, Clone)]
struct ContainerInfo {
    path: PathBuf,
    /// Logical offset of this container's first record.
    start: u64,
    /// Bytes of record data (file length minus the header).
    body_len: u64,
}

#[derive(Debug, Clone)]
struct IndexFailure {
    path: PathBuf,
    ordinal: u64,
    reason: String,
}

/// State shared between the owning sequence and its indexer thread.
struct SeqShared {
    containers: RwLock<Vec<ContainerInfo>>,
    index: RwLock<Vec<IndexEntry>>,
    /// Logical offset of the first unindexed byte. Monotonic while the
    /// indexer runs; rolled back only by [`FrameSequence::close_last_file`].
    indexed_to: AtomicU64,
    complete: AtomicBool,
    stop: AtomicBool,
    failure: Mutex<Option<IndexFailure>>,
}

impl SeqShared {
    fn failure_error(&self) -> Option<EvtError> {
        self.failure.lock().as_ref().map(|f| EvtError::Decode {
            path: f.path.clone(),
            ordinal: f.ordinal,
            reason: f.reason.clone(),
        })
    }
}

/// Indexed, randomly accessible view over a chain of containers.
pub struct FrameSequence {
    shared: Arc<SeqShared>,
    indexer: Option<JoinHandle<()>>,
    cache: FrameCache,
    /// One lazily opened handle per container, parallel to the container
    /// list. Used only by the owning thread.
    readers: Vec<Option<BufReader<File>>>,
    registry: Arc<ObjectRegistry>,
    stager: Arc<dyn Stager>,
    cursor: usize,
}

impl FrameSequence {
    pub fn new() -> Self {
        FrameSequence {
            shared: Arc::new(SeqShared {
                containers: RwLock::new(Vec::new()),
                index: RwLock::new(Vec::new()),
                indexed_to: AtomicU64::new(0),
                complete: AtomicBool::new(true),
                stop: AtomicBool::new(false),
                failure: Mutex::new(None),
            }),
            indexer: None,
            cache: FrameCache::new(DEFAULT_BACKWARD + DEFAULT_FORWARD),
            readers: Vec::new(),
            registry: Arc::new(ObjectRegistry::new()),
            stager: Arc::new(LocalStager),
            cursor: 0,
        }
    }

    /// Size the data-frame eviction window (frames kept behind and ahead of
    /// the latest access).
    pub fn with_window(mut self, n_backward: usize, n_forward: usize) -> Self {
        self.cache = FrameCache::new((n_backward + n_forward).max(1));
        self
    }

    pub fn with_registry(mut self, registry: Arc<ObjectRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_stager(mut self, stager: Arc<dyn Stager>) -> Self {
        self.stager = stager;
        self
    }

    /// Append a container to the chain and start (or restart) indexing it.
    pub fn add_file(&mut self, path: &Path) -> EvtResult<()> {
        self.stager.will_read_later(path);
        let resolved = self.stager.get_readable_path(path)?;
        let len = std::fs::metadata(&resolved)?.len();
        let mut reader = BufReader::new(File::open(&resolved)?);
        codec::read_header(&mut reader, &resolved)?;

        let start = {
            let mut containers = self.shared.containers.write();
            let start = containers.iter().map(|c| c.body_len).sum();
            containers.push(ContainerInfo {
                path: resolved.clone(),
                start,
                body_len: len - HEADER_LEN,
            });
            start
        };
        self.readers.push(Some(reader));
        debug!(path = %resolved.display(), start, "container added to sequence");
        self.shared.complete.store(false, Ordering::SeqCst);
        self.ensure_indexer()
    }

    /// Drop the most recently added container: its index entries, cached
    /// frames and mixing influence all disappear, as if it had never been
    /// added.
    pub fn close_last_file(&mut self) -> EvtResult<()> {
        self.stop_indexer();
        let removed = self.shared.containers.write().pop();
        let Some(removed) = removed else {
            return Err(EvtError::Configuration(
                "sequence has no containers to close".into(),
            ));
        };
        self.readers.truncate(self.shared.containers.read().len());

        let keep = {
            let mut index = self.shared.index.write();
            let keep = index
                .iter()
                .position(|e| e.offset >= removed.start)
                .unwrap_or(index.len());
            // Parent pointers always point backwards, so the retained
            // prefix stays internally consistent.
            index.truncate(keep);
            keep
        };
        self.cache.retain_below(keep);
        self.cursor = self.cursor.min(keep);

        let indexed_to = self
            .shared
            .indexed_to
            .load(Ordering::SeqCst)
            .min(removed.start);
        self.shared.indexed_to.store(indexed_to, Ordering::SeqCst);
        // removed.start is also the total body length of what remains.
        if indexed_to >= removed.start {
            self.shared.complete.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            self.shared.complete.store(false, Ordering::SeqCst);
            self.ensure_indexer()
        }
    }

    /// Number of frames indexed so far. Grows in the background until
    /// [`is_complete`](Self::is_complete).
    pub fn len_indexed(&self) -> usize {
        self.shared.index.read().len()
    }

    /// Whether every record of every added container has been indexed.
    pub fn is_complete(&self) -> bool {
        self.shared.complete.load(Ordering::SeqCst)
    }

    pub fn entry(&self, i: usize) -> Option<IndexEntry> {
        self.shared.index.read().get(i).cloned()
    }

    /// Fetch the `i`-th frame of the sequence, fully mixed. Blocks while the
    /// indexer has not yet reached `i`; `Ok(None)` once the sequence is
    /// known to hold fewer than `i + 1` frames.
    pub fn fetch(&mut self, i: usize) -> EvtResult<Option<Frame>> {
        let entry = loop {
            if let Some(err) = self.shared.failure_error() {
                return Err(err);
            }
            if let Some(entry) = self.entry(i) {
                break entry;
            }
            if self.shared.complete.load(Ordering::SeqCst) {
                // The index may have grown between the lookup and the flag.
                match self.entry(i) {
                    Some(entry) => break entry,
                    None => return Ok(None),
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        self.fetch_merged(i, &entry).map(Some)
    }

    /// Fetch the frame at the cursor and advance it.
    pub fn next_frame(&mut self) -> EvtResult<Option<Frame>> {
        let frame = self.fetch(self.cursor)?;
        if frame.is_some() {
            self.cursor += 1;
        }
        Ok(frame)
    }

    /// Advance the cursor until a frame of `stream` is found and return it.
    pub fn pop_matching(&mut self, stream: Stream) -> EvtResult<Option<Frame>> {
        loop {
            match self.next_frame()? {
                None => return Ok(None),
                Some(frame) if frame.stream() == stream => return Ok(Some(frame)),
                Some(_) => continue,
            }
        }
    }

    /// Reset the cursor to the start of the sequence. The index and cache
    /// are unaffected; re-reading yields identical frames.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    fn fetch_merged(&mut self, i: usize, entry: &IndexEntry) -> EvtResult<Frame> {
        if let Some(frame) = self.cache.get(i) {
            return Ok(frame);
        }
        let mut frame = self.decode_at(i, entry)?;
        if !entry.stream.is_metadata() {
            // Data frames inherit the native keys of the latest frame of
            // every metadata stream, most recent first so the newest binding
            // wins conflicting keys. Metadata frames are served exactly as
            // decoded, matching what a streaming read delivers; a key
            // superseded by a newer frame of its stream never reappears.
            for p in self.metadata_ancestors(i) {
                let ancestor_entry = self.entry(p).ok_or_else(|| EvtError::Decode {
                    path: PathBuf::new(),
                    ordinal: i as u64,
                    reason: format!("index ancestor {p} out of range"),
                })?;
                // Ancestors are pinned in the cache, bounding the lookups.
                let ancestor = self.fetch_merged(p, &ancestor_entry)?;
                frame.merge_native_from(&ancestor);
            }
        }
        self.cache
            .insert(i, frame.clone(), entry.stream.is_metadata());
        Ok(frame)
    }

    /// Index positions of the latest entry of each metadata stream before
    /// `i`, most recent first.
    fn metadata_ancestors(&self, i: usize) -> Vec<usize> {
        let index = self.shared.index.read();
        let mut seen: Vec<Stream> = Vec::new();
        let mut out = Vec::new();
        for j in (0..i.min(index.len())).rev() {
            let stream = index[j].stream;
            if stream.is_metadata() && !seen.contains(&stream) {
                seen.push(stream);
                out.push(j);
            }
        }
        out
    }

    /// Decode the record behind `entry`, unmixed.
    fn decode_at(&mut self, i: usize, entry: &IndexEntry) -> EvtResult<Frame> {
        let (cidx, path, local) = {
            let containers = self.shared.containers.read();
            let (cidx, info) = containers
                .iter()
                .enumerate()
                .rev()
                .find(|(_, c)| entry.offset >= c.start)
                .ok_or_else(|| EvtError::Configuration("index entry has no container".into()))?;
            (cidx, info.path.clone(), HEADER_LEN + entry.offset - info.start)
        };
        if self.readers[cidx].is_none() {
            self.readers[cidx] = Some(BufReader::new(File::open(&path)?));
        }
        let Some(reader) = self.readers[cidx].as_mut() else {
            return Err(EvtError::WorkerGone);
        };
        reader.seek(SeekFrom::Start(local))?;
        codec::read_frame(reader, &self.registry, &path, i as u64)?.ok_or_else(|| {
            EvtError::Decode {
                path,
                ordinal: i as u64,
                reason: "indexed record missing from container".into(),
            }
        })
    }

    fn ensure_indexer(&mut self) -> EvtResult<()> {
        if let Some(handle) = &self.indexer {
            if !handle.is_finished() {
                return Ok(());
            }
        }
        if let Some(handle) = self.indexer.take() {
            let _ = handle.join();
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("evtflow-indexer".into())
            .spawn(move || index_run(shared))?;
        self.indexer = Some(handle);
        Ok(())
    }

    fn stop_indexer(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.indexer.take() {
            if handle.join().is_err() {
                warn!("sequence indexer panicked");
            }
        }
        self.shared.stop.store(false, Ordering::SeqCst);
    }
}

impl Default for FrameSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FrameSequence {
    fn drop(&mut self) {
        self.stop_indexer();
    }
}

/// Recency bookkeeping for the indexer: the tag-only mixer paired with the
/// index position of each metadata stream's latest entry.
struct AncestorIndex {
    mixer: StreamMixer,
    latest: HashMap<Stream, usize>,
}

impl AncestorIndex {
    fn new() -> Self {
        AncestorIndex {
            mixer: StreamMixer::new(),
            latest: HashMap::new(),
        }
    }

    /// Rebuild the recency state from an already-built index prefix.
    fn replay(entries: &[IndexEntry]) -> Self {
        let mut tracker = Self::new();
        for (i, entry) in entries.iter().enumerate() {
            tracker.note(entry.stream, i);
        }
        tracker
    }

    fn note(&mut self, stream: Stream, i: usize) -> Option<usize> {
        let ancestor = self.mixer.observe(stream);
        let parent = ancestor.and_then(|s| self.latest.get(&s).copied());
        if stream.is_metadata() {
            self.latest.insert(stream, i);
        }
        parent
    }
}

fn index_run(shared: Arc<SeqShared>) {
    let mut tracker = {
        let index = shared.index.read();
        AncestorIndex::replay(&index)
    };
    debug!("sequence indexer started");

    loop {
        if shared.stop.load(Ordering::SeqCst) {
            return;
        }
        let pos = shared.indexed_to.load(Ordering::SeqCst);
        let target = {
            let containers = shared.containers.read();
            containers
                .iter()
                .find(|c| pos >= c.start && pos < c.start + c.body_len)
                .map(|c| (c.path.clone(), c.start, c.body_len))
        };
        let Some((path, start, body_len)) = target else {
            shared.complete.store(true, Ordering::SeqCst);
            debug!(
                frames = shared.index.read().len(),
                "sequence index complete"
            );
            return;
        };

        let mut file = match open_at(&path, HEADER_LEN + pos - start) {
            Ok(f) => f,
            Err(e) => {
                record_failure(&shared, &path, 0, e);
                return;
            }
        };

        let mut local = pos;
        while local < start + body_len {
            if shared.stop.load(Ordering::SeqCst) {
                return;
            }
            let ordinal = shared.index.read().len() as u64;
            match codec::peek_frame(&mut file, &path, ordinal) {
                Ok(Some(peeked)) => {
                    let i = ordinal as usize;
                    let parent = tracker.note(peeked.stream, i);
                    shared.index.write().push(IndexEntry {
                        offset: local,
                        stream: peeked.stream,
                        sub_stream: peeked.sub_stream,
                        parent,
                    });
                    local += peeked.total_len;
                    shared.indexed_to.store(local, Ordering::SeqCst);
                }
                Ok(None) => break,
                Err(e) => {
                    record_failure(&shared, &path, ordinal, e);
                    return;
                }
            }
        }
        // Move on to the next container even if this one ended short of its
        // recorded length.
        shared
            .indexed_to
            .store(local.max(start + body_len), Ordering::SeqCst);
    }
}

fn open_at(path: &Path, offset: u64) -> EvtResult<BufReader<File>> {
    let mut file = BufReader::new(File::open(path)?);
    file.seek(SeekFrom::Start(offset))?;
    Ok(file)
}

fn record_failure(shared: &SeqShared, path: &Path, ordinal: u64, error: EvtError) {
    warn!(path = %path.display(), ordinal, error = %error, "sequence indexing failed");
    *shared.failure.lock() = Some(IndexFailure {
        path: path.to_path_buf(),
        ordinal,
        reason: error.to_string(),
    });
}

/// Decoded-frame cache with pinning: metadata frames stay resident, data
/// frames are evicted oldest-access-first beyond the window.
struct FrameCache {
    /// Most recently used first.
    entries: Vec<CacheSlot>,
    window: usize,
}

struct CacheSlot {
    index: usize,
    frame: Frame,
    pinned: bool,
}

impl FrameCache {
    fn new(window: usize) -> Self {
        FrameCache {
            entries: Vec::new(),
            window,
        }
    }

    fn get(&mut self, index: usize) -> Option<Frame> {
        let pos = self.entries.iter().position(|s| s.index == index)?;
        let slot = self.entries.remove(pos);
        let frame = slot.frame.clone();
        self.entries.insert(0, slot);
        Some(frame)
    }

    fn insert(&mut self, index: usize, frame: Frame, pinned: bool) {
        self.entries.retain(|s| s.index != index);
        self.entries.insert(
            0,
            CacheSlot {
                index,
                frame,
                pinned,
            },
        );
        let mut unpinned = 0usize;
        self.entries.retain(|s| {
            if s.pinned {
                return true;
            }
            unpinned += 1;
            unpinned <= self.window
        });
    }

    /// Drop everything at or past `bound` (container closed under it).
    fn retain_below(&mut self, bound: usize) {
        self.entries.retain(|s| s.index < bound);
    }
}
