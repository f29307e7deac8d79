//! Central error type for the pipeline.
//!
//! `EvtError` consolidates the error sources of the whole framework, mirroring
//! the taxonomy of the design: configuration errors are detected eagerly at
//! configure time and abort before any I/O; decode/encode errors are fatal
//! mid-run because frame boundaries in the container format cannot be
//! resynchronized; a fetch beyond a complete index is *not* an error and is
//! reported as an ordinary `Ok(None)` by the sequence API.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the framework error type.
pub type EvtResult<T> = std::result::Result<T, EvtError>;

/// Primary error type for the event-processing framework.
#[derive(Error, Debug)]
pub enum EvtError {
    /// Missing or contradictory setup, detected at configure time.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Standard I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A corrupt or truncated record in a sequential container.
    ///
    /// Fatal for the run: record boundaries are not independently
    /// recoverable, so decoding cannot resume past the bad record.
    #[error("Decode error in '{path}' at frame {ordinal}: {reason}")]
    Decode {
        path: PathBuf,
        ordinal: u64,
        reason: String,
    },

    /// Failure while serializing or writing a frame record.
    #[error("Encode error for '{path}': {reason}")]
    Encode { path: PathBuf, reason: String },

    /// A name was bound twice within one frame.
    #[error("Frame already contains key '{key}'")]
    DuplicateKey { key: String },

    /// A required frame key is absent.
    #[error("Frame key '{key}' not found")]
    KeyNotFound { key: String },

    /// A frame object or configuration value had an unexpected type.
    #[error("'{key}' is not of the expected type {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
    },

    /// A module pushed to an outbox name that was never connected.
    #[error("Unknown outbox '{name}'")]
    UnknownOutbox { name: String },

    /// A wiring operation referenced a module not in the tray.
    #[error("Unknown module '{name}'")]
    UnknownModule { name: String },

    /// Two modules were added under the same name.
    #[error("Module '{name}' already added")]
    DuplicateModule { name: String },

    /// A module handler signalled a fatal processing error.
    #[error("Module error: {0}")]
    Module(String),

    /// An I/O worker thread terminated unexpectedly.
    #[error("I/O worker thread is gone")]
    WorkerGone,
}
