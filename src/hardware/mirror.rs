//! Pattern mirror positions and macros

use crate::config::MirrorConfig;
use crate::error::{DaqError, DaqResult};
use std::collections::BTreeMap;
use std::fmt;

/// Named mirror position with one coordinate per controller axis.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorPosition {
    name: String,
    axes: Vec<f64>,
}

impl MirrorPosition {
    /// Create a named position
    pub fn new(name: impl Into<String>, axes: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            axes,
        }
    }

    /// Position name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Axis coordinates, axis 1 first
    pub fn axes(&self) -> &[f64] {
        &self.axes
    }
}

/// Name of a sequence stored on the mirror controller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MirrorMacro(String);

impl MirrorMacro {
    /// Wrap a macro name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Macro name as stored on the controller
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MirrorMacro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lookup table of configured positions.
#[derive(Debug, Clone, Default)]
pub struct PositionTable {
    positions: BTreeMap<String, Vec<f64>>,
}

impl PositionTable {
    /// Build from configuration
    pub fn from_config(config: &MirrorConfig) -> Self {
        Self {
            positions: config.positions.clone(),
        }
    }

    /// Resolve a position by name.
    pub fn get(&self, name: &str) -> DaqResult<MirrorPosition> {
        self.positions
            .get(name)
            .map(|axes| MirrorPosition::new(name, axes.clone()))
            .ok_or_else(|| DaqError::Configuration(format!("unknown mirror position '{name}'")))
    }
}
