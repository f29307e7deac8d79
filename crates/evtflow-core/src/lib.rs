//! `evtflow-core`
//!
//! Frame/stream model and pipeline engine for the evtflow event-processing
//! framework.
//!
//! This crate provides the data-flow backbone: self-describing frames moving
//! through a chain of processing modules connected by FIFO queues, plus the
//! metadata-inheritance ("mixing") rule that lets slow-changing context
//! frames be implicitly merged into fast-changing data frames.
//!
//! ## Key Types
//!
//! - [`Frame`]: a named, ordered bundle of shared objects tagged with a
//!   [`Stream`]
//! - [`StreamMixer`]: tracks the latest frame per metadata stream and decides
//!   inheritance
//! - [`Module`]: one pipeline stage with an inbox, named outboxes and a
//!   per-stream dispatch table
//! - [`Tray`]: owns the module chain and drives it to completion
//! - [`EvtError`]: central error type for the whole framework
//!
//! ## Example
//!
//! ```rust,no_run
//! use evtflow_core::{Frame, ModuleConfig, Stream, Tray};
//! # use evtflow_core::{EvtResult, Module, OutboxSet};
//! # struct MySource;
//! # impl Module for MySource {}
//! # struct MySink;
//! # impl Module for MySink {}
//! # fn example() -> EvtResult<()> {
//! let mut tray = Tray::new();
//! tray.add_module("source", MySource, ModuleConfig::new())?;
//! tray.add_module("sink", MySink, ModuleConfig::new())?;
//! tray.connect("source", "out", "sink")?;
//! tray.execute()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod frame;
pub mod mixer;
pub mod module;
pub mod stream;
pub mod tray;

pub use config::ModuleConfig;
pub use error::{EvtError, EvtResult};
pub use frame::{Blob, EventHeader, Frame, FrameObject};
pub use mixer::StreamMixer;
pub use module::{FrameQueue, Module, OutboxSet, RunControl, SourceOutcome};
pub use stream::Stream;
pub use tray::Tray;
