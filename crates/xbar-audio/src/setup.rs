//! Setup file format describing a complete routing server.
//!
//! Uses RON (Rust Object Notation) so setups stay human-readable and
//! version-control-friendly: the switch matrix, the devices and their ports,
//! the processing zones with their modules, and the connections by port name.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use xbar_core::{Frames, SampleRate};
use xbar_plugin::{ModuleConfig, StreamDescriptor};

use crate::device::{ClockType, DeviceParams};
use crate::zone::ZonePort;

/// Newest setup format this build understands
pub const SETUP_VERSION: u32 = 1;

/// Switch matrix parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixSetup {
    /// Name of the worker thread
    pub worker_name: String,
    pub period_size: Frames,
    pub sample_rate: SampleRate,
    /// Frames per job execution, defaults to the period size
    #[serde(default)]
    pub copy_size: Option<Frames>,
    /// Let the worker trigger itself instead of following the period clock
    #[serde(default)]
    pub free_running: bool,
}

/// A module to instantiate inside a zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSetup {
    /// Registered factory name, e.g. `"simplemixer"`
    pub type_name: String,
    /// Instance name; commands are dispatched by it
    pub instance: String,
    #[serde(default)]
    pub config: ModuleConfig,
}

fn default_num_periods() -> usize {
    4
}

/// A processing zone: streams, modules in processing order, and its two ports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSetup {
    pub name: String,
    pub frame_length: Frames,
    #[serde(default = "default_num_periods")]
    pub num_periods: usize,
    pub streams: Vec<StreamDescriptor>,
    pub input: ZonePort,
    pub output: ZonePort,
    #[serde(default)]
    pub modules: Vec<ModuleSetup>,
}

/// A matrix connection by port name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionSetup {
    pub source: String,
    pub sink: String,
}

/// Top-level setup structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setup {
    /// Format version for future compatibility
    pub version: u32,

    /// Human-readable setup name
    pub name: String,

    pub matrix: MatrixSetup,

    #[serde(default)]
    pub devices: Vec<DeviceParams>,

    #[serde(default)]
    pub zones: Vec<ZoneSetup>,

    #[serde(default)]
    pub connections: Vec<ConnectionSetup>,
}

impl Setup {
    /// Create an empty setup
    #[must_use]
    pub fn new(name: impl Into<String>, period_size: Frames, sample_rate: SampleRate) -> Self {
        Self {
            version: SETUP_VERSION,
            name: name.into(),
            matrix: MatrixSetup {
                worker_name: "xbar-matrix".to_string(),
                period_size,
                sample_rate,
                copy_size: None,
                free_running: false,
            },
            devices: Vec::new(),
            zones: Vec::new(),
            connections: Vec::new(),
        }
    }

    /// Parse a setup from RON text and check its version
    pub fn parse(text: &str) -> Result<Self, SetupError> {
        let setup: Self =
            ron::from_str(text).map_err(|e| SetupError::DeserializationFailed(e.to_string()))?;

        if setup.version > SETUP_VERSION {
            return Err(SetupError::UnsupportedVersion(setup.version));
        }
        Ok(setup)
    }

    /// Load a setup from a RON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, does not parse, or has a
    /// newer version than this build supports
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SetupError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| SetupError::IoError(e.to_string()))?;
        Self::parse(&text)
    }

    /// Save the setup to a RON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SetupError> {
        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| SetupError::SerializationFailed(e.to_string()))?;

        std::fs::write(path.as_ref(), text).map_err(|e| SetupError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Names of every port the setup creates
    #[must_use]
    pub fn port_names(&self) -> Vec<&str> {
        self.devices
            .iter()
            .flat_map(|d| d.ports.iter().map(|p| p.name.as_str()))
            .chain(
                self.zones
                    .iter()
                    .flat_map(|z| [z.input.name.as_str(), z.output.name.as_str()]),
            )
            .collect()
    }

    /// Check cross references the type system cannot
    ///
    /// Port, device, zone and module instance names must be unique;
    /// connections must name existing ports; at most one device may
    /// provide the clock.
    pub fn validate(&self) -> Result<(), SetupError> {
        let mut ports = HashSet::new();
        for name in self.port_names() {
            if !ports.insert(name) {
                return Err(SetupError::InvalidData(format!("port '{name}' is declared twice")));
            }
        }

        let mut owners = HashSet::new();
        for name in self
            .devices
            .iter()
            .map(|d| d.name.as_str())
            .chain(self.zones.iter().map(|z| z.name.as_str()))
        {
            if !owners.insert(name) {
                return Err(SetupError::InvalidData(format!(
                    "device or zone '{name}' is declared twice"
                )));
            }
        }

        let mut instances = HashSet::new();
        for module in self.zones.iter().flat_map(|z| &z.modules) {
            if !instances.insert(module.instance.as_str()) {
                return Err(SetupError::InvalidData(format!(
                    "module instance '{}' is declared twice",
                    module.instance
                )));
            }
        }

        for connection in &self.connections {
            for name in [&connection.source, &connection.sink] {
                if !ports.contains(name.as_str()) {
                    return Err(SetupError::InvalidData(format!(
                        "connection {} -> {} names unknown port '{name}'",
                        connection.source, connection.sink
                    )));
                }
            }
        }

        let providers = self
            .devices
            .iter()
            .filter(|d| d.clock == ClockType::Provider)
            .count();
        if providers > 1 {
            return Err(SetupError::InvalidData(format!(
                "{providers} devices provide the clock, at most one may"
            )));
        }
        Ok(())
    }
}

/// Errors that can occur during setup operations
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Unsupported setup version: {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid setup data: {0}")]
    InvalidData(String),
}

impl From<SetupError> for xbar_core::Error {
    fn from(err: SetupError) -> Self {
        match err {
            SetupError::InvalidData(_) | SetupError::UnsupportedVersion(_) => {
                Self::InvalidParam(err.to_string())
            }
            _ => Self::Failed(err.to_string()),
        }
    }
}
