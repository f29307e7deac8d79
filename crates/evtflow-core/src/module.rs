//! Pipeline stages and the queues connecting them.
//!
//! A [`Module`] is one processing stage: an inbox filled by its upstream
//! connection, zero or more named outboxes, and a per-stream dispatch table
//! with pass-the-frame-through defaults. Modules with no inbox are *driving*
//! modules and produce frames from nothing (typically from a file) via
//! [`Module::generate`].

use crate::config::ModuleConfig;
use crate::error::{EvtError, EvtResult};
use crate::frame::Frame;
use crate::stream::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// FIFO of frames jointly owned by the two modules it connects.
///
/// Push is always permitted; an empty pop signals the driving loop to pump
/// the upstream producer again.
#[derive(Debug, Clone, Default)]
pub struct FrameQueue(Arc<Mutex<VecDeque<Frame>>>);

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, frame: Frame) {
        self.0.lock().push_back(frame);
    }

    pub fn pop(&self) -> Option<Frame> {
        self.0.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// The named outboxes of one module.
///
/// A module with no outboxes is a terminal sink; frames pushed "to all" of an
/// empty set are dropped.
#[derive(Debug, Default)]
pub struct OutboxSet {
    boxes: Vec<(String, FrameQueue)>,
}

impl OutboxSet {
    pub(crate) fn add(&mut self, name: impl Into<String>, queue: FrameQueue) {
        self.boxes.push((name.into(), queue));
    }

    /// Push to one named outbox.
    pub fn push(&self, name: &str, frame: Frame) -> EvtResult<()> {
        let queue = self
            .boxes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, q)| q)
            .ok_or_else(|| EvtError::UnknownOutbox {
                name: name.to_string(),
            })?;
        queue.push(frame);
        Ok(())
    }

    /// Push a copy of the frame to every outbox.
    pub fn push_to_all(&self, frame: Frame) {
        let Some(last) = self.boxes.len().checked_sub(1) else {
            return;
        };
        for (_, queue) in &self.boxes[..last] {
            queue.push(frame.clone());
        }
        self.boxes[last].1.push(frame);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.boxes.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

/// What a driving module reported from one [`Module::generate`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOutcome {
    /// At least one frame was pushed to an outbox.
    Produced,
    /// Nothing left to produce; the run can end.
    Exhausted,
}

/// Cloneable handle over the tray's process-wide suspension flag.
///
/// Once set, the driving loop stops issuing new process calls after the
/// current pass completes. This is a graceful end-of-run signal, not a hard
/// abort.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    suspend: Arc<AtomicBool>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_suspension(&self) {
        self.suspend.store(true, Ordering::SeqCst);
    }

    pub fn suspension_requested(&self) -> bool {
        self.suspend.load(Ordering::SeqCst)
    }
}

/// One pipeline processing stage.
///
/// The provided [`process`](Module::process) dispatcher pops nothing itself;
/// the tray pops the inbox and hands the frame in. Handlers may push the
/// frame (same or rebound) to one, some, or all outboxes, or drop it by
/// pushing nothing. Fatal conditions (for example a missing required key)
/// are signalled by returning an error, which propagates out of the driving
/// loop and terminates the run.
pub trait Module: Send {
    /// Receive tunables and the run-control handle before the pipeline
    /// starts. Configuration errors abort the run before any I/O.
    fn configure(&mut self, _cfg: &ModuleConfig, _ctrl: RunControl) -> EvtResult<()> {
        Ok(())
    }

    /// Predicate checked before stream-specific handlers; a `false` frame is
    /// passed to every outbox unmodified. Supports conditional/filtering
    /// modules without duplicating handler code.
    fn should_process(&self, _frame: &Frame) -> bool {
        true
    }

    fn geometry(&mut self, frame: Frame, out: &mut OutboxSet) -> EvtResult<()> {
        out.push_to_all(frame);
        Ok(())
    }

    fn calibration(&mut self, frame: Frame, out: &mut OutboxSet) -> EvtResult<()> {
        out.push_to_all(frame);
        Ok(())
    }

    fn detector_status(&mut self, frame: Frame, out: &mut OutboxSet) -> EvtResult<()> {
        out.push_to_all(frame);
        Ok(())
    }

    fn physics(&mut self, frame: Frame, out: &mut OutboxSet) -> EvtResult<()> {
        out.push_to_all(frame);
        Ok(())
    }

    /// Handler for every stream without a dedicated method.
    fn otherwise(&mut self, frame: Frame, out: &mut OutboxSet) -> EvtResult<()> {
        out.push_to_all(frame);
        Ok(())
    }

    /// Per-stream dispatch. Override only to bypass the dispatch table
    /// entirely (sinks that treat all streams alike do this).
    fn process(&mut self, frame: Frame, out: &mut OutboxSet) -> EvtResult<()> {
        if !self.should_process(&frame) {
            out.push_to_all(frame);
            return Ok(());
        }
        match frame.stream() {
            Stream::GEOMETRY => self.geometry(frame, out),
            Stream::CALIBRATION => self.calibration(frame, out),
            Stream::DETECTOR_STATUS => self.detector_status(frame, out),
            Stream::PHYSICS => self.physics(frame, out),
            _ => self.otherwise(frame, out),
        }
    }

    /// Produce frames from nothing. Only driving (inbox-less) modules
    /// override this.
    fn generate(&mut self, _out: &mut OutboxSet) -> EvtResult<SourceOutcome> {
        Ok(SourceOutcome::Exhausted)
    }

    /// End-of-run hook, invoked once after the driving loop stops.
    fn finish(&mut self) -> EvtResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_is_fifo() {
        let queue = FrameQueue::new();
        queue.push(Frame::new(Stream::GEOMETRY));
        queue.push(Frame::new(Stream::PHYSICS));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().map(|f| f.stream()), Some(Stream::GEOMETRY));
        assert_eq!(queue.pop().map(|f| f.stream()), Some(Stream::PHYSICS));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn push_to_unknown_outbox_fails() {
        let out = OutboxSet::default();
        let err = out.push("missing", Frame::new(Stream::PHYSICS)).unwrap_err();
        assert!(matches!(err, EvtError::UnknownOutbox { .. }));
    }

    #[test]
    fn push_to_all_fans_out() {
        let mut out = OutboxSet::default();
        let a = FrameQueue::new();
        let b = FrameQueue::new();
        out.add("a", a.clone());
        out.add("b", b.clone());
        out.push_to_all(Frame::new(Stream::PHYSICS));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn default_dispatch_passes_through() {
        struct Passthrough;
        impl Module for Passthrough {}

        let mut out = OutboxSet::default();
        let sink = FrameQueue::new();
        out.add("out", sink.clone());

        let mut module = Passthrough;
        module.process(Frame::new(Stream::new('Q')), &mut out).unwrap();
        module.process(Frame::new(Stream::PHYSICS), &mut out).unwrap();
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn should_process_bypasses_handlers() {
        struct DropPhysics;
        impl Module for DropPhysics {
            fn should_process(&self, frame: &Frame) -> bool {
                frame.stream() == Stream::PHYSICS
            }
            fn physics(&mut self, _frame: Frame, _out: &mut OutboxSet) -> EvtResult<()> {
                Ok(()) // drop
            }
        }

        let mut out = OutboxSet::default();
        let sink = FrameQueue::new();
        out.add("out", sink.clone());

        let mut module = DropPhysics;
        module.process(Frame::new(Stream::PHYSICS), &mut out).unwrap();
        module.process(Frame::new(Stream::GEOMETRY), &mut out).unwrap();
        // Physics dropped by the handler, geometry passed straight through.
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.pop().map(|f| f.stream()), Some(Stream::GEOMETRY));
    }
}
