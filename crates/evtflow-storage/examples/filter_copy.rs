//! Copy one or more containers into a new one, keeping only physics frames
//! at or above a minimum event id. Metadata frames ride along but are only
//! written when a surviving physics frame still depends on them.
//!
//! Usage: filter_copy <min-event-id> <output> <input>...

use anyhow::{bail, Context, Result};
use evtflow_core::{EventHeader, EvtResult, Frame, Module, ModuleConfig, OutboxSet, Tray};
use evtflow_storage::{FrameReader, FrameWriter};
use std::path::PathBuf;

struct MinEventId {
    min: u64,
}

impl Module for MinEventId {
    fn physics(&mut self, frame: Frame, out: &mut OutboxSet) -> EvtResult<()> {
        let keep = match frame.get_as::<EventHeader>("event_header") {
            Ok(header) => header.event_id >= self.min,
            Err(_) => true,
        };
        if keep {
            out.push_to_all(frame);
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let min: u64 = args
        .next()
        .context("missing <min-event-id>")?
        .parse()
        .context("<min-event-id> must be an integer")?;
    let output = PathBuf::from(args.next().context("missing <output>")?);
    let inputs: Vec<PathBuf> = args.map(PathBuf::from).collect();
    if inputs.is_empty() {
        bail!("no input containers given");
    }

    let mut tray = Tray::new();
    tray.add_module("reader", FrameReader::new(inputs), ModuleConfig::new())?;
    tray.add_module("cut", MinEventId { min }, ModuleConfig::new())?;
    tray.add_module(
        "writer",
        FrameWriter::new(&output),
        ModuleConfig::new().set("droppable_streams", vec!["G", "C", "D"]),
    )?;
    tray.connect("reader", "out", "cut")?;
    tray.connect("cut", "out", "writer")?;
    tray.execute()?;
    tray.usage_report();
    Ok(())
}
