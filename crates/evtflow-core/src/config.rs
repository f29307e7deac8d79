//! Module configuration objects.
//!
//! Each module receives its tunables (buffer depths, stream lists, paths)
//! through a [`ModuleConfig`] at wiring time, before the pipeline starts.
//! Values are plain JSON values so driver programs can assemble them
//! programmatically or load them from a TOML file via the `config` crate;
//! the core treats them as validated and immutable for the run's duration.

use crate::error::{EvtError, EvtResult};
use crate::stream::Stream;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Immutable bag of tunables handed to a module at configure time.
#[derive(Debug, Clone, Default)]
pub struct ModuleConfig {
    values: BTreeMap<String, Value>,
}

impl ModuleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration table from a TOML file.
    pub fn from_toml_file(path: &Path) -> EvtResult<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| EvtError::Configuration(e.to_string()))?;
        let values: BTreeMap<String, Value> = cfg
            .try_deserialize()
            .map_err(|e| EvtError::Configuration(e.to_string()))?;
        Ok(ModuleConfig { values })
    }

    /// Builder-style setter.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> EvtResult<Option<&str>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(self.mismatch(key, "string")),
        }
    }

    pub fn get_bool(&self, key: &str) -> EvtResult<Option<bool>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(self.mismatch(key, "boolean")),
        }
    }

    pub fn get_u64(&self, key: &str) -> EvtResult<Option<u64>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.mismatch(key, "unsigned integer")),
            Some(_) => Err(self.mismatch(key, "unsigned integer")),
        }
    }

    pub fn get_usize(&self, key: &str) -> EvtResult<Option<usize>> {
        Ok(self.get_u64(key)?.map(|v| v as usize))
    }

    /// A list of single-character stream tags, e.g. `["G", "C"]`.
    pub fn get_streams(&self, key: &str) -> EvtResult<Option<Vec<Stream>>> {
        let Some(value) = self.values.get(key) else {
            return Ok(None);
        };
        let Value::Array(items) = value else {
            return Err(self.mismatch(key, "array of stream tags"));
        };
        let mut streams = Vec::with_capacity(items.len());
        for item in items {
            let tag = match item {
                Value::String(s) if s.chars().count() == 1 => s.chars().next(),
                _ => None,
            };
            match tag {
                Some(c) => streams.push(Stream::new(c)),
                None => return Err(self.mismatch(key, "single-character stream tag")),
            }
        }
        Ok(Some(streams))
    }

    pub fn get_paths(&self, key: &str) -> EvtResult<Option<Vec<PathBuf>>> {
        let Some(value) = self.values.get(key) else {
            return Ok(None);
        };
        let Value::Array(items) = value else {
            return Err(self.mismatch(key, "array of paths"));
        };
        let mut paths = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::String(s) => paths.push(PathBuf::from(s)),
                _ => return Err(self.mismatch(key, "path string")),
            }
        }
        Ok(Some(paths))
    }

    fn mismatch(&self, key: &str, expected: &'static str) -> EvtError {
        EvtError::TypeMismatch {
            key: key.to_string(),
            expected,
        }
    }
}
