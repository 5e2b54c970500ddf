//! Processing module abstraction layer.
//!
//! This crate defines the two capabilities every DSP module exposes: a
//! `ProcessingCore` driven once per period on the audio thread, and a
//! `CommandHandler` answering property-set commands on control threads. It
//! also defines the read-only inputs a module consumes (properties and stream
//! configuration) and the per-period stream buffers it processes.

pub mod config;
pub mod properties;

use std::sync::Arc;

pub use config::{ModuleConfig, StreamDescriptor, StreamMapping};
pub use properties::{FromProperty, Properties, PropertyError, PropertyValue};

use xbar_core::{ChannelCount, Error, Frames, Result, Sample, SampleRate};

/// Key selecting the sub-operation of a command
pub const CMD_KEY: &str = "cmd";

/// Processing environment captured by a component at `init()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEnv {
    /// Frames processed per period
    pub frame_length: Frames,
    pub sample_rate: SampleRate,
}

/// Non-interleaved sample buffers of one stream for the current period
#[derive(Debug, Clone)]
pub struct AudioStream {
    id: i32,
    name: Arc<str>,
    channels: Vec<Vec<Sample>>,
}

impl AudioStream {
    #[must_use]
    pub fn new(id: i32, name: &str, num_channels: ChannelCount, frame_length: Frames) -> Self {
        Self {
            id,
            name: Arc::from(name),
            channels: vec![vec![0.0; frame_length]; num_channels],
        }
    }

    #[must_use]
    pub fn id(&self) -> i32 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    #[must_use]
    pub fn num_channels(&self) -> ChannelCount {
        self.channels.len()
    }

    #[must_use]
    pub fn frame_length(&self) -> Frames {
        self.channels.first().map_or(0, Vec::len)
    }

    #[must_use]
    pub fn channels(&self) -> &[Vec<Sample>] {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut [Vec<Sample>] {
        &mut self.channels
    }

    /// Multiply every sample by `gain`
    pub fn scale(&mut self, gain: Sample) {
        for channel in &mut self.channels {
            for sample in channel.iter_mut() {
                *sample *= gain;
            }
        }
    }

    pub fn fill(&mut self, value: Sample) {
        for channel in &mut self.channels {
            channel.fill(value);
        }
    }
}

/// All streams of one audio chain
#[derive(Debug, Clone, Default)]
pub struct StreamBuffers {
    streams: Vec<AudioStream>,
}

impl StreamBuffers {
    #[must_use]
    pub fn new(streams: Vec<AudioStream>) -> Self {
        Self { streams }
    }

    /// Allocate buffers for the given descriptors
    #[must_use]
    pub fn from_descriptors(descriptors: &[StreamDescriptor], frame_length: Frames) -> Self {
        Self::new(
            descriptors
                .iter()
                .map(|d| AudioStream::new(d.id, &d.name, d.num_channels, frame_length))
                .collect(),
        )
    }

    fn index_of(&self, id: i32) -> Option<usize> {
        self.streams.iter().position(|s| s.id == id)
    }

    #[must_use]
    pub fn get(&self, id: i32) -> Option<&AudioStream> {
        self.index_of(id).map(|i| &self.streams[i])
    }

    pub fn get_mut(&mut self, id: i32) -> Option<&mut AudioStream> {
        self.index_of(id).map(move |i| &mut self.streams[i])
    }

    /// Borrow one stream for reading and a different one for writing
    ///
    /// Returns `None` if either id is unknown or both ids are equal.
    pub fn split_pair(&mut self, input: i32, output: i32) -> Option<(&AudioStream, &mut AudioStream)> {
        let i = self.index_of(input)?;
        let o = self.index_of(output)?;
        if i == o {
            return None;
        }
        if i < o {
            let (head, tail) = self.streams.split_at_mut(o);
            Some((&head[i], &mut tail[0]))
        } else {
            let (head, tail) = self.streams.split_at_mut(i);
            Some((&tail[0], &mut head[o]))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &AudioStream> {
        self.streams.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AudioStream> {
        self.streams.iter_mut()
    }

    /// Total channel count across all streams, in declaration order
    #[must_use]
    pub fn total_channels(&self) -> ChannelCount {
        self.streams.iter().map(AudioStream::num_channels).sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// Module-specific per-period DSP, driven by the generic component core
///
/// `process_child` runs on the audio thread. Implementations must not block,
/// allocate, or log per period.
pub trait ProcessingCore: Send {
    /// Called once with the chain environment before the first period
    fn init(&mut self, env: &ChainEnv) -> Result<()>;

    /// Return internal state to its post-init defaults
    fn reset(&mut self) -> Result<()>;

    /// Process one period of the chain's streams
    fn process_child(&mut self, streams: &mut StreamBuffers) -> Result<()>;
}

/// Control-plane command interface of a module
///
/// Called from arbitrary control threads. Runtime changes must be forwarded to
/// the processing core through a lock-free queue.
pub trait CommandHandler: Send + Sync {
    /// Handle one command; results are written into `response`
    fn process_cmd(&self, cmd: &Properties, response: &mut Properties) -> Result<()>;
}

/// Read the required `"cmd"` key and check it against `0..count`
pub fn command_id(cmd: &Properties, count: i32) -> Result<i32> {
    let id: i32 = cmd.get(CMD_KEY)?;
    if (0..count).contains(&id) {
        Ok(id)
    } else {
        Err(Error::InvalidParam(format!(
            "command id {id} out of range 0..{count}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffers() -> StreamBuffers {
        StreamBuffers::from_descriptors(
            &[
                StreamDescriptor {
                    id: 1,
                    name: "a".into(),
                    num_channels: 2,
                },
                StreamDescriptor {
                    id: 2,
                    name: "b".into(),
                    num_channels: 1,
                },
            ],
            8,
        )
    }

    #[test]
    fn test_buffers_from_descriptors() {
        let streams = buffers();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams.total_channels(), 3);
        assert_eq!(streams.get(1).unwrap().frame_length(), 8);
        assert!(streams.get(7).is_none());
    }

    #[test]
    fn test_split_pair_both_orders() {
        let mut streams = buffers();
        streams.get_mut(1).unwrap().fill(0.5);

        let (input, output) = streams.split_pair(1, 2).unwrap();
        output.channels_mut()[0][0] = input.channels()[0][0];
        assert_eq!(streams.get(2).unwrap().channels()[0][0], 0.5);

        let (input, output) = streams.split_pair(2, 1).unwrap();
        assert_eq!(input.id(), 2);
        assert_eq!(output.id(), 1);

        assert!(streams.split_pair(1, 1).is_none());
        assert!(streams.split_pair(1, 9).is_none());
    }

    #[test]
    fn test_scale() {
        let mut stream = AudioStream::new(1, "a", 2, 4);
        stream.fill(2.0);
        stream.scale(0.25);
        assert!(stream.channels().iter().flatten().all(|&s| s == 0.5));
    }

    #[test]
    fn test_command_id() {
        let cmd = Properties::new().with(CMD_KEY, 2);
        assert_eq!(command_id(&cmd, 3).unwrap(), 2);
        assert!(matches!(command_id(&cmd, 2), Err(Error::InvalidParam(_))));
        assert!(matches!(
            command_id(&Properties::new(), 3),
            Err(Error::InvalidParam(_))
        ));
    }
}
