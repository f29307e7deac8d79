//! Asynchronous container writer: a sink pipeline module that overlaps
//! encoding and file I/O with pipeline computation.
//!
//! The container header is written synchronously at configure time; after
//! that a single worker thread owns the file handle and appends records in
//! task order. The pipeline thread keeps at most `lookahead` writes in
//! flight and blocks on the oldest confirmation when the window is full, so
//! backpressure reaches the pipeline instead of unbounded memory.
//!
//! Streams can be declared *droppable*: a frame of a droppable stream is
//! held back (one per stream, newest wins) and only written once a frame of
//! a non-droppable stream follows it. Metadata that is superseded before any
//! data frame arrives never reaches the file.

use crate::codec;
use crate::stager::{LocalStager, Stager};
use crossbeam_channel::{bounded, Receiver, Sender};
use evtflow_core::{
    EvtError, EvtResult, Frame, Module, ModuleConfig, OutboxSet, RunControl, Stream,
};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Default number of in-flight write tasks.
pub const DEFAULT_LOOKAHEAD: usize = 16;

enum WriteTask {
    Frame {
        frame: Frame,
        done: Sender<EvtResult<()>>,
    },
    Flush {
        done: Sender<EvtResult<()>>,
    },
}

/// Sink module that appends every received frame to one container file.
pub struct FrameWriter {
    path: PathBuf,
    lookahead: usize,
    droppable: Vec<Stream>,
    stager: Arc<dyn Stager>,
    /// Held-back droppable-stream frames in arrival order, one per stream.
    orphans: Vec<(Stream, Frame)>,
    tasks: Option<Sender<WriteTask>>,
    /// Confirmation handles in strict issue order.
    pending: VecDeque<Receiver<EvtResult<()>>>,
    worker: Option<JoinHandle<()>>,
    abort: Arc<AtomicBool>,
    finished: bool,
    queued: u64,
}

impl FrameWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FrameWriter {
            path: path.into(),
            lookahead: DEFAULT_LOOKAHEAD,
            droppable: Vec::new(),
            stager: Arc::new(LocalStager),
            orphans: Vec::new(),
            tasks: None,
            pending: VecDeque::new(),
            worker: None,
            abort: Arc::new(AtomicBool::new(false)),
            finished: false,
            queued: 0,
        }
    }

    pub fn with_lookahead(mut self, depth: usize) -> Self {
        self.lookahead = depth.max(1);
        self
    }

    pub fn with_droppable_streams(mut self, streams: Vec<Stream>) -> Self {
        self.droppable = streams;
        self
    }

    pub fn with_stager(mut self, stager: Arc<dyn Stager>) -> Self {
        self.stager = stager;
        self
    }

    /// Surface failures of writes that have already completed, without
    /// blocking.
    fn drain_ready(&mut self) -> EvtResult<()> {
        while let Some(front) = self.pending.front() {
            match front.try_recv() {
                Ok(result) => {
                    self.pending.pop_front();
                    result?;
                }
                Err(crossbeam_channel::TryRecvError::Empty) => break,
                Err(crossbeam_channel::TryRecvError::Disconnected) => {
                    return Err(EvtError::WorkerGone)
                }
            }
        }
        Ok(())
    }

    fn queue_write(&mut self, frame: Frame) -> EvtResult<()> {
        // Window full: block on the oldest confirmation first.
        while self.pending.len() >= self.lookahead {
            if let Some(front) = self.pending.pop_front() {
                front.recv().map_err(|_| EvtError::WorkerGone)??;
            }
        }
        let tasks = self.tasks.as_ref().ok_or(EvtError::WorkerGone)?;
        let (done, rx) = bounded(1);
        tasks
            .send(WriteTask::Frame { frame, done })
            .map_err(|_| EvtError::WorkerGone)?;
        self.pending.push_back(rx);
        self.queued += 1;
        Ok(())
    }

    fn enqueue(&mut self, frame: Frame) -> EvtResult<()> {
        self.drain_ready()?;
        if self.droppable.contains(&frame.stream()) {
            if let Some(slot) = self.orphans.iter_mut().find(|(s, _)| *s == frame.stream()) {
                debug!(stream = %frame.stream(), "orphan frame superseded before flush");
                slot.1 = frame;
            } else {
                self.orphans.push((frame.stream(), frame));
            }
            return Ok(());
        }
        for (_, orphan) in std::mem::take(&mut self.orphans) {
            self.queue_write(orphan)?;
        }
        self.queue_write(frame)
    }
}

impl Module for FrameWriter {
    fn configure(&mut self, cfg: &ModuleConfig, _ctrl: RunControl) -> EvtResult<()> {
        if let Some(path) = cfg.get_str("path")? {
            self.path = PathBuf::from(path);
        }
        if let Some(depth) = cfg.get_usize("lookahead")? {
            self.lookahead = depth.max(1);
        }
        if let Some(streams) = cfg.get_streams("droppable_streams")? {
            self.droppable = streams;
        }
        if self.path.as_os_str().is_empty() {
            return Err(EvtError::Configuration(
                "writer has no output path configured".into(),
            ));
        }

        let resolved = self.stager.get_writeable_path(&self.path)?;
        let mut file = BufWriter::new(File::create(&resolved)?);
        // Header goes down synchronously, exactly once, before any record.
        codec::write_header(&mut file)?;
        debug!(path = %resolved.display(), "writer configured");

        let (task_tx, task_rx) = crossbeam_channel::unbounded();
        let abort = Arc::clone(&self.abort);
        let worker = std::thread::Builder::new()
            .name("evtflow-writer".into())
            .spawn(move || worker_loop(file, resolved, task_rx, abort))?;
        self.tasks = Some(task_tx);
        self.worker = Some(worker);
        Ok(())
    }

    fn process(&mut self, frame: Frame, _out: &mut OutboxSet) -> EvtResult<()> {
        self.enqueue(frame)
    }

    fn finish(&mut self) -> EvtResult<()> {
        if self.finished {
            return Ok(());
        }
        if !self.orphans.is_empty() {
            // No qualifying frame ever followed them; they are dropped.
            debug!(
                count = self.orphans.len(),
                "discarding unflushed orphan frames"
            );
            self.orphans.clear();
        }
        while let Some(rx) = self.pending.pop_front() {
            rx.recv().map_err(|_| EvtError::WorkerGone)??;
        }
        if let Some(tasks) = &self.tasks {
            let (done, rx) = bounded(1);
            tasks
                .send(WriteTask::Flush { done })
                .map_err(|_| EvtError::WorkerGone)?;
            rx.recv().map_err(|_| EvtError::WorkerGone)??;
        }
        self.tasks = None;
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("writer worker panicked");
            }
        }
        self.finished = true;
        info!(path = %self.path.display(), frames = self.queued, "container written");
        Ok(())
    }
}

impl Drop for FrameWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Dropped without finish(): abandon queued work instead of blocking.
        self.abort.store(true, Ordering::SeqCst);
        self.tasks = None;
        self.pending.clear();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("writer worker panicked");
            }
        }
    }
}

fn worker_loop(
    mut file: BufWriter<File>,
    path: PathBuf,
    tasks: Receiver<WriteTask>,
    abort: Arc<AtomicBool>,
) {
    for task in tasks {
        if abort.load(Ordering::SeqCst) {
            return;
        }
        match task {
            WriteTask::Frame { frame, done } => {
                let result = codec::write_frame(&mut file, &frame)
                    .map(|_| ())
                    .map_err(|e| encode_err(&path, e));
                let fatal = result.is_err();
                if done.send(result).is_err() || fatal {
                    return;
                }
            }
            WriteTask::Flush { done } => {
                let result = file.flush().map_err(|e| EvtError::Encode {
                    path: path.clone(),
                    reason: format!("flush failed: {e}"),
                });
                let fatal = result.is_err();
                if done.send(result).is_err() || fatal {
                    return;
                }
            }
        }
    }
    // Channel closed without a graceful flush request; best effort.
    if let Err(e) = file.flush() {
        warn!(path = %path.display(), error = %e, "final flush of container failed");
    }
    debug!("writer worker exiting");
}

fn encode_err(path: &Path, source: EvtError) -> EvtError {
    match source {
        e @ EvtError::Encode { .. } => e,
        other => EvtError::Encode {
            path: path.to_path_buf(),
            reason: other.to_string(),
        },
    }
}
