//! The tray: owns the module chain and drives it to completion.
//!
//! Execution is demand-driven: the tray repeatedly pumps the terminal (last
//! added) module; a module whose inbox is empty first pumps its upstream
//! connection, recursively, until a driving module either produces a frame or
//! reports exhaustion. A requested suspension stops the loop after the
//! current pass; handler errors propagate out of `execute` and terminate the
//! run.

use crate::config::ModuleConfig;
use crate::error::{EvtError, EvtResult};
use crate::module::{FrameQueue, Module, OutboxSet, RunControl, SourceOutcome};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct ModuleStats {
    calls: u64,
    busy: Duration,
}

struct ModuleSlot {
    name: String,
    module: Box<dyn Module>,
    inbox: Option<FrameQueue>,
    outboxes: OutboxSet,
    upstream: Option<usize>,
    stats: ModuleStats,
}

enum Pumped {
    Progress,
    Starved,
}

/// The pipeline driver: wires modules together and runs them.
#[derive(Default)]
pub struct Tray {
    slots: Vec<ModuleSlot>,
    names: HashMap<String, usize>,
    control: RunControl,
}

impl Tray {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle to the process-wide suspension flag, usable from any module
    /// or from the driver program.
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    /// Add and eagerly configure a module. Modules are pumped in reverse
    /// add order; the last added module is the terminal one.
    pub fn add_module(
        &mut self,
        name: impl Into<String>,
        module: impl Module + 'static,
        cfg: ModuleConfig,
    ) -> EvtResult<()> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(EvtError::DuplicateModule { name });
        }
        let mut module = Box::new(module);
        module.configure(&cfg, self.control.clone())?;
        debug!(module = %name, "module configured");
        self.names.insert(name.clone(), self.slots.len());
        self.slots.push(ModuleSlot {
            name,
            module,
            inbox: None,
            outboxes: OutboxSet::default(),
            upstream: None,
            stats: ModuleStats::default(),
        });
        Ok(())
    }

    /// Connect `from`'s outbox `outbox` to `to`'s inbox with a fresh queue.
    pub fn connect(&mut self, from: &str, outbox: &str, to: &str) -> EvtResult<()> {
        let from_idx = self.lookup(from)?;
        let to_idx = self.lookup(to)?;
        if from_idx == to_idx {
            return Err(EvtError::Configuration(format!(
                "module '{from}' cannot be connected to itself"
            )));
        }
        if self.slots[to_idx].inbox.is_some() {
            return Err(EvtError::Configuration(format!(
                "module '{to}' already has an inbox"
            )));
        }
        let queue = FrameQueue::new();
        self.slots[from_idx].outboxes.add(outbox, queue.clone());
        self.slots[to_idx].inbox = Some(queue);
        self.slots[to_idx].upstream = Some(from_idx);
        Ok(())
    }

    /// Run until the drivers are exhausted or suspension is requested.
    pub fn execute(&mut self) -> EvtResult<()> {
        self.run(None)
    }

    /// Run for at most `limit` pumps of the terminal module.
    pub fn execute_frames(&mut self, limit: u64) -> EvtResult<()> {
        self.run(Some(limit))
    }

    fn run(&mut self, limit: Option<u64>) -> EvtResult<()> {
        if self.slots.is_empty() {
            return Err(EvtError::Configuration("tray has no modules".into()));
        }
        let sink = self.slots.len() - 1;
        let mut passes: u64 = 0;
        loop {
            if self.control.suspension_requested() {
                debug!("suspension requested, ending run");
                break;
            }
            if limit.is_some_and(|l| passes >= l) {
                break;
            }
            match Self::pump(&mut self.slots, sink)? {
                Pumped::Progress => passes += 1,
                Pumped::Starved => break,
            }
        }
        for slot in &mut self.slots {
            slot.module.finish()?;
        }
        debug!(passes, "run finished");
        Ok(())
    }

    /// Pump one module: pop-and-process a frame from its inbox, pulling from
    /// upstream as needed; driving modules produce via `generate`.
    fn pump(slots: &mut [ModuleSlot], idx: usize) -> EvtResult<Pumped> {
        loop {
            let popped = slots[idx].inbox.as_ref().and_then(FrameQueue::pop);
            if let Some(frame) = popped {
                let slot = &mut slots[idx];
                let started = Instant::now();
                let result = slot.module.process(frame, &mut slot.outboxes);
                slot.stats.calls += 1;
                slot.stats.busy += started.elapsed();
                result?;
                return Ok(Pumped::Progress);
            }
            if slots[idx].inbox.is_none() {
                let slot = &mut slots[idx];
                let started = Instant::now();
                let outcome = slot.module.generate(&mut slot.outboxes);
                slot.stats.calls += 1;
                slot.stats.busy += started.elapsed();
                return match outcome? {
                    SourceOutcome::Produced => Ok(Pumped::Progress),
                    SourceOutcome::Exhausted => Ok(Pumped::Starved),
                };
            }
            // Inbox connected but empty: pull from upstream. The upstream
            // pass may feed a sibling outbox, so loop until either our inbox
            // fills or the chain above is starved.
            let Some(upstream) = slots[idx].upstream else {
                return Ok(Pumped::Starved);
            };
            if let Pumped::Starved = Self::pump(slots, upstream)? {
                return Ok(Pumped::Starved);
            }
        }
    }

    /// Log per-module invocation counts and busy time. Reporting only; the
    /// counters play no part in control flow.
    pub fn usage_report(&self) {
        for slot in &self.slots {
            info!(
                module = %slot.name,
                calls = slot.stats.calls,
                busy_us = slot.stats.busy.as_micros() as u64,
                "module usage"
            );
        }
    }

    fn lookup(&self, name: &str) -> EvtResult<usize> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| EvtError::UnknownModule {
                name: name.to_string(),
            })
    }
}
