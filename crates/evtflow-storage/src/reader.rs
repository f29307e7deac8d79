//! Asynchronous container reader: a driving pipeline module that overlaps
//! file decoding with pipeline computation.
//!
//! One background worker thread owns the open file handle and walks the
//! configured containers in order; the pipeline thread issues read tasks up
//! to a fixed lookahead depth and drains their single-shot completion
//! channels strictly from the front, so frames reach the pipeline in exactly
//! the order they were issued even when decode work completes out of order.
//!
//! A decode error is fatal for the whole run: frame boundaries in the
//! container format are not independently recoverable. The error travels
//! through the same completion channel as a normal result and surfaces on
//! the pipeline thread at the point the frame would have been consumed.

use crate::codec::{self, ObjectRegistry};
use crate::stager::{LocalStager, Stager};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use evtflow_core::{
    EvtError, EvtResult, Frame, Module, ModuleConfig, OutboxSet, RunControl, SourceOutcome,
    StreamMixer,
};
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Default lookahead depth (in-flight read tasks).
pub const DEFAULT_LOOKAHEAD: usize = 16;

type ReadOutcome = EvtResult<Option<Frame>>;

struct ReadTask {
    done: Sender<ReadOutcome>,
}

/// Driving module that reads frames from a list of sequential containers.
pub struct FrameReader {
    paths: Vec<PathBuf>,
    lookahead: usize,
    stager: Arc<dyn Stager>,
    registry: Arc<ObjectRegistry>,
    mixer: StreamMixer,
    tasks: Option<Sender<ReadTask>>,
    /// Completion handles in strict issue order.
    pending: VecDeque<Receiver<ReadOutcome>>,
    worker: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    exhausted: bool,
}

impl FrameReader {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        FrameReader {
            paths,
            lookahead: DEFAULT_LOOKAHEAD,
            stager: Arc::new(LocalStager),
            registry: Arc::new(ObjectRegistry::new()),
            mixer: StreamMixer::new(),
            tasks: None,
            pending: VecDeque::new(),
            worker: None,
            stop: Arc::new(AtomicBool::new(false)),
            exhausted: false,
        }
    }

    pub fn with_lookahead(mut self, depth: usize) -> Self {
        self.lookahead = depth.max(1);
        self
    }

    pub fn with_stager(mut self, stager: Arc<dyn Stager>) -> Self {
        self.stager = stager;
        self
    }

    pub fn with_registry(mut self, registry: Arc<ObjectRegistry>) -> Self {
        self.registry = registry;
        self
    }

    fn deliver(&mut self, frame: Option<Frame>, out: &mut OutboxSet) -> bool {
        match frame {
            Some(mut frame) => {
                self.mixer.mix(&mut frame);
                out.push_to_all(frame);
                true
            }
            None => {
                // All configured files exhausted; tasks issued past the end
                // would only report the same, so retire them with the
                // channel.
                self.exhausted = true;
                self.pending.clear();
                self.tasks = None;
                false
            }
        }
    }

    fn top_up(&mut self) -> EvtResult<()> {
        let Some(tasks) = &self.tasks else {
            return Ok(());
        };
        while self.pending.len() < self.lookahead {
            let (done, rx) = bounded(1);
            tasks
                .send(ReadTask { done })
                .map_err(|_| EvtError::WorkerGone)?;
            self.pending.push_back(rx);
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.tasks = None;
        self.pending.clear();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("reader worker panicked");
            }
        }
    }
}

impl Module for FrameReader {
    fn configure(&mut self, cfg: &ModuleConfig, _ctrl: RunControl) -> EvtResult<()> {
        if let Some(paths) = cfg.get_paths("paths")? {
            self.paths = paths;
        }
        if let Some(depth) = cfg.get_usize("lookahead")? {
            self.lookahead = depth.max(1);
        }
        if self.paths.is_empty() {
            return Err(EvtError::Configuration(
                "reader has no input files configured".into(),
            ));
        }

        let mut resolved = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            self.stager.will_read_later(path);
            resolved.push(self.stager.get_readable_path(path)?);
        }

        // Open and validate the first container eagerly so a bad file list
        // aborts the run before the pipeline starts.
        let first = resolved[0].clone();
        let mut reader = BufReader::new(File::open(&first)?);
        codec::read_header(&mut reader, &first)?;
        debug!(path = %first.display(), files = resolved.len(), "reader configured");

        let (task_tx, task_rx) = unbounded();
        let state = WorkerState {
            resolved,
            file_idx: 0,
            current: Some(reader),
            ordinal: 0,
            registry: Arc::clone(&self.registry),
        };
        let stop = Arc::clone(&self.stop);
        let worker = std::thread::Builder::new()
            .name("evtflow-reader".into())
            .spawn(move || worker_loop(state, task_rx, stop))?;
        self.tasks = Some(task_tx);
        self.worker = Some(worker);
        Ok(())
    }

    fn generate(&mut self, out: &mut OutboxSet) -> EvtResult<SourceOutcome> {
        if self.exhausted {
            return Ok(SourceOutcome::Exhausted);
        }
        let mut emitted = false;

        // Drain completions that have already resolved, strictly from the
        // front: stopping at the first unresolved one preserves issue order
        // without busy-waiting.
        while let Some(front) = self.pending.front() {
            match front.try_recv() {
                Ok(outcome) => {
                    self.pending.pop_front();
                    if !self.deliver(outcome?, out) {
                        break;
                    }
                    emitted = true;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Err(EvtError::WorkerGone),
            }
        }

        if !self.exhausted {
            self.top_up()?;
        }
        if emitted {
            return Ok(SourceOutcome::Produced);
        }
        if self.exhausted {
            return Ok(SourceOutcome::Exhausted);
        }

        // Nothing resolved yet but the pipeline needs output: wait for the
        // oldest in-flight task.
        let Some(front) = self.pending.front() else {
            return Ok(SourceOutcome::Exhausted);
        };
        let outcome = front.recv().map_err(|_| EvtError::WorkerGone)?;
        self.pending.pop_front();
        if self.deliver(outcome?, out) {
            Ok(SourceOutcome::Produced)
        } else {
            Ok(SourceOutcome::Exhausted)
        }
    }

    fn finish(&mut self) -> EvtResult<()> {
        self.shutdown();
        Ok(())
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        // Join before releasing shared state so no in-flight task can
        // reference the reader after destruction.
        self.shutdown();
    }
}

struct WorkerState {
    resolved: Vec<PathBuf>,
    file_idx: usize,
    current: Option<BufReader<File>>,
    ordinal: u64,
    registry: Arc<ObjectRegistry>,
}

impl WorkerState {
    /// Decode the next frame, transparently advancing across configured
    /// files. `Ok(None)` only when every file is exhausted.
    fn read_next(&mut self) -> ReadOutcome {
        loop {
            if self.current.is_none() {
                if self.file_idx >= self.resolved.len() {
                    return Ok(None);
                }
                let path = self.resolved[self.file_idx].clone();
                let mut reader = BufReader::new(File::open(&path)?);
                codec::read_header(&mut reader, &path)?;
                debug!(path = %path.display(), "opened input container");
                self.current = Some(reader);
                self.ordinal = 0;
            }
            let path = self.resolved[self.file_idx].clone();
            let Some(reader) = self.current.as_mut() else {
                return Err(EvtError::WorkerGone);
            };
            match codec::read_frame(reader, &self.registry, &path, self.ordinal)? {
                Some(frame) => {
                    self.ordinal += 1;
                    return Ok(Some(frame));
                }
                None => {
                    self.current = None;
                    self.file_idx += 1;
                }
            }
        }
    }
}

fn worker_loop(mut state: WorkerState, tasks: Receiver<ReadTask>, stop: Arc<AtomicBool>) {
    for task in tasks {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let outcome = state.read_next();
        let fatal = outcome.is_err();
        if task.done.send(outcome).is_err() {
            break;
        }
        if fatal {
            // Decode errors are unrecoverable; stop producing.
            break;
        }
    }
    debug!("reader worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_list_is_a_configuration_error() {
        let mut reader = FrameReader::new(Vec::new());
        let err = reader
            .configure(&ModuleConfig::new(), RunControl::new())
            .unwrap_err();
        assert!(matches!(err, EvtError::Configuration(_)));
    }

    #[test]
    fn missing_file_aborts_before_io() {
        let mut reader = FrameReader::new(vec![PathBuf::from("/no/such/file.evt")]);
        let err = reader
            .configure(&ModuleConfig::new(), RunControl::new())
            .unwrap_err();
        assert!(matches!(err, EvtError::Configuration(_)));
    }
}
