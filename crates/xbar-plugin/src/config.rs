//! Stream configuration consumed by processing modules at `init()`.
//!
//! Streams and mappings are fixed for the lifetime of a module. Only the
//! gains attached to them change at runtime.

use serde::{Deserialize, Serialize};
use xbar_core::{ChannelCount, Error, Result};

use crate::Properties;

/// A named, numerically identified channel group inside a module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub id: i32,
    /// Pin name used on the command interface
    pub name: String,
    pub num_channels: ChannelCount,
}

/// One input stream feeding one output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamMapping {
    pub input: i32,
    pub output: i32,
}

/// Read-only configuration handed to a module factory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Module-specific key/value settings
    #[serde(default)]
    pub properties: Properties,
    /// Streams the module may touch
    #[serde(default)]
    pub streams: Vec<StreamDescriptor>,
    /// Streams processed in place
    #[serde(default)]
    pub in_place: Vec<i32>,
    /// Input -> output mappings, in configuration order
    #[serde(default)]
    pub mappings: Vec<StreamMapping>,
}

impl ModuleConfig {
    #[must_use]
    pub fn new(properties: Properties) -> Self {
        Self {
            properties,
            ..Self::default()
        }
    }

    /// Declare a stream
    #[must_use]
    pub fn with_stream(mut self, id: i32, name: &str, num_channels: ChannelCount) -> Self {
        self.streams.push(StreamDescriptor {
            id,
            name: name.to_string(),
            num_channels,
        });
        self
    }

    /// Mark a declared stream as processed in place
    #[must_use]
    pub fn with_in_place(mut self, id: i32) -> Self {
        self.in_place.push(id);
        self
    }

    /// Add an input -> output mapping
    #[must_use]
    pub fn with_mapping(mut self, input: i32, output: i32) -> Self {
        self.mappings.push(StreamMapping { input, output });
        self
    }

    #[must_use]
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Resolve a pin name to its stream id
    #[must_use]
    pub fn stream_id(&self, pin: &str) -> Option<i32> {
        self.streams.iter().find(|s| s.name == pin).map(|s| s.id)
    }

    #[must_use]
    pub fn stream(&self, id: i32) -> Option<&StreamDescriptor> {
        self.streams.iter().find(|s| s.id == id)
    }

    #[must_use]
    pub fn in_place_streams(&self) -> &[i32] {
        &self.in_place
    }

    #[must_use]
    pub fn mappings(&self) -> &[StreamMapping] {
        &self.mappings
    }

    /// Output streams with their mapped inputs, both in first-seen order
    #[must_use]
    pub fn outputs_with_inputs(&self) -> Vec<(i32, Vec<i32>)> {
        let mut grouped: Vec<(i32, Vec<i32>)> = Vec::new();
        for mapping in &self.mappings {
            match grouped.iter_mut().find(|(out, _)| *out == mapping.output) {
                Some((_, inputs)) => inputs.push(mapping.input),
                None => grouped.push((mapping.output, vec![mapping.input])),
            }
        }
        grouped
    }

    /// Check that every referenced stream id is declared and ids/names are unique
    pub fn validate(&self) -> Result<()> {
        for (i, stream) in self.streams.iter().enumerate() {
            if self.streams[..i]
                .iter()
                .any(|s| s.id == stream.id || s.name == stream.name)
            {
                return Err(Error::InitializationFailed(format!(
                    "duplicate stream id {} or name '{}'",
                    stream.id, stream.name
                )));
            }
        }
        let known = |id: i32| self.stream(id).is_some();
        if let Some(id) = self.in_place.iter().copied().find(|&id| !known(id)) {
            return Err(Error::InitializationFailed(format!(
                "in-place stream {id} is not declared"
            )));
        }
        if let Some(m) = self
            .mappings
            .iter()
            .find(|m| !known(m.input) || !known(m.output))
        {
            return Err(Error::InitializationFailed(format!(
                "mapping {} -> {} references an undeclared stream",
                m.input, m.output
            )));
        }
        Ok(())
    }
}
