//! File staging boundary.
//!
//! Every path the storage layer touches is resolved through a [`Stager`],
//! so drivers can transparently substitute staged copies of remote files.
//! The core never talks to remote storage directly; [`LocalStager`] is the
//! plain-filesystem implementation used by default.

use evtflow_core::{EvtError, EvtResult};
use std::path::{Path, PathBuf};
use tracing::trace;

/// Resolves logical paths to locally readable/writeable ones.
pub trait Stager: Send + Sync {
    /// Advance notice that `path` will be read later; staging implementations
    /// may start a prefetch.
    fn will_read_later(&self, _path: &Path) {}

    /// Resolve a path for reading.
    fn get_readable_path(&self, path: &Path) -> EvtResult<PathBuf>;

    /// Resolve a path for writing.
    fn get_writeable_path(&self, path: &Path) -> EvtResult<PathBuf>;
}

/// Pass-through stager for local files.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalStager;

impl Stager for LocalStager {
    fn get_readable_path(&self, path: &Path) -> EvtResult<PathBuf> {
        if !path.is_file() {
            return Err(EvtError::Configuration(format!(
                "input file '{}' does not exist",
                path.display()
            )));
        }
        trace!(path = %path.display(), "resolved readable path");
        Ok(path.to_path_buf())
    }

    fn get_writeable_path(&self, path: &Path) -> EvtResult<PathBuf> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(EvtError::Configuration(format!(
                    "output directory '{}' does not exist",
                    parent.display()
                )));
            }
        }
        Ok(path.to_path_buf())
    }
}
