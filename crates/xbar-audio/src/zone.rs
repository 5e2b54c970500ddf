//! Processing zones: an audio chain bound between two matrix ports.
//!
//! The zone owns two ring buffers. Its input port is a matrix sink (the
//! matrix writes into it) and its output port is a matrix source (the
//! matrix reads from it). Each period the zone moves one frame length from
//! the input port into the chain's streams, runs the chain, and writes the
//! result to the output port.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use xbar_core::{Error, Frames, Result};

use crate::chain::AudioChain;
use crate::port::{Port, PortDirection, PortParams};
use crate::ring_buffer::{AccessDirection, RingBuffer, RingBufferParams};

/// One side of a zone: the port name and the streams it carries, in
/// channel order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZonePort {
    pub name: String,
    pub streams: Vec<i32>,
}

/// Port channel -> (stream id, stream channel)
type Routes = SmallVec<[(i32, usize); 8]>;

pub struct ProcessingZone {
    name: Arc<str>,
    chain: AudioChain,
    input: Arc<Port>,
    output: Arc<Port>,
    input_routes: Routes,
    output_routes: Routes,
    periods: u64,
}

impl ProcessingZone {
    /// Create the zone's ring buffers and ports around `chain`
    pub fn new(chain: AudioChain, input: &ZonePort, output: &ZonePort, num_periods: usize) -> Result<Self> {
        let name = Arc::clone(chain.name());
        let input_routes = routes(&chain, input)?;
        let output_routes = routes(&chain, output)?;

        let input = zone_port(&chain, input, input_routes.len(), num_periods, PortDirection::Output)?;
        let output = zone_port(&chain, output, output_routes.len(), num_periods, PortDirection::Input)?;
        tracing::debug!(
            "Zone '{}': {} <- '{}', {} -> '{}'",
            name,
            input_routes.len(),
            input.name(),
            output_routes.len(),
            output.name()
        );

        Ok(Self {
            name,
            chain,
            input,
            output,
            input_routes,
            output_routes,
            periods: 0,
        })
    }

    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Matrix sink feeding the chain
    #[must_use]
    pub fn input(&self) -> &Arc<Port> {
        &self.input
    }

    /// Matrix source carrying the chain's result
    #[must_use]
    pub fn output(&self) -> &Arc<Port> {
        &self.output
    }

    #[must_use]
    pub fn chain(&self) -> &AudioChain {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut AudioChain {
        &mut self.chain
    }

    /// Periods processed so far
    #[must_use]
    pub fn periods(&self) -> u64 {
        self.periods
    }

    /// Process one period if a full frame length of input and output space exist
    ///
    /// REAL-TIME SAFE: no allocation, no locks, no logging. Missing input
    /// or space is reported as `BufferEmpty` / `BufferFull` without touching
    /// either buffer. A chain failure still produces output.
    pub fn process_period(&mut self) -> Result<Frames> {
        let frames = self.chain.env().frame_length;
        let (Some(in_rb), Some(out_rb)) = (self.input.ring_buffer(), self.output.ring_buffer()) else {
            return Err(Error::NotInitialized(format!("zone '{}' has no ring buffers", self.name)));
        };
        if in_rb.update_available(AccessDirection::Read) < frames {
            return Err(Error::BufferEmpty);
        }
        if out_rb.update_available(AccessDirection::Write) < frames {
            return Err(Error::BufferFull);
        }

        transfer(in_rb, AccessDirection::Read, frames, |offset, done, count| {
            let buffers = self.chain.buffers_mut();
            for (k, &(stream_id, channel)) in self.input_routes.iter().enumerate() {
                let Some(stream) = buffers.get_mut(stream_id) else {
                    continue;
                };
                let samples = &mut stream.channels_mut()[channel][done..done + count];
                for (i, sample) in samples.iter_mut().enumerate() {
                    *sample = in_rb.sample_at(self.input.index() + k, offset + i).unwrap_or(0.0);
                }
            }
        })?;

        let result = self.chain.process();

        transfer(out_rb, AccessDirection::Write, frames, |offset, done, count| {
            let buffers = self.chain.buffers();
            for (k, &(stream_id, channel)) in self.output_routes.iter().enumerate() {
                let Some(stream) = buffers.get(stream_id) else {
                    continue;
                };
                for (i, &sample) in stream.channels()[channel][done..done + count].iter().enumerate() {
                    out_rb.store_at(self.output.index() + k, offset + i, sample);
                }
            }
        })?;

        self.periods += 1;
        result.map(|()| frames)
    }
}

/// Walk `frames` frames of a ring buffer window by window
///
/// `visit(offset, done, count)` sees each contiguous region: its offset
/// in the buffer, the frames handled before it and its length.
fn transfer<F>(rb: &RingBuffer, direction: AccessDirection, frames: Frames, mut visit: F) -> Result<()>
where
    F: FnMut(Frames, Frames, Frames),
{
    let mut done = 0;
    while done < frames {
        let window = rb.try_begin_access(direction, frames - done)?;
        visit(window.offset, done, window.frames);
        rb.end_access(direction, window.offset, window.frames)?;
        done += window.frames;
    }
    Ok(())
}

fn routes(chain: &AudioChain, port: &ZonePort) -> Result<Routes> {
    let mut routes = Routes::new();
    for &stream_id in &port.streams {
        let stream = chain.buffers().get(stream_id).ok_or_else(|| {
            Error::InvalidParam(format!(
                "zone '{}': port '{}' names unknown stream {stream_id}",
                chain.name(),
                port.name
            ))
        })?;
        routes.extend((0..stream.num_channels()).map(|channel| (stream_id, channel)));
    }
    if routes.is_empty() {
        return Err(Error::InvalidParam(format!(
            "zone '{}': port '{}' carries no streams",
            chain.name(),
            port.name
        )));
    }
    Ok(routes)
}

fn zone_port(
    chain: &AudioChain,
    port: &ZonePort,
    num_channels: usize,
    num_periods: usize,
    direction: PortDirection,
) -> Result<Arc<Port>> {
    let rb = RingBuffer::new(RingBufferParams::new(
        &port.name,
        num_channels,
        chain.env().frame_length,
        num_periods,
    ))?;
    Ok(Arc::new(
        Port::new(PortParams::new(&port.name, num_channels, direction))?
            .with_ring_buffer(Arc::new(rb))?
            .with_owner(Arc::clone(chain.name())),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::volume;
    use crate::module::ModuleFactory;
    use xbar_plugin::{ChainEnv, ModuleConfig, Properties, StreamDescriptor};

    const ENV: ChainEnv = ChainEnv {
        frame_length: 4,
        sample_rate: 48000,
    };

    fn zone() -> ProcessingZone {
        let streams = [
            StreamDescriptor {
                id: 1,
                name: "left".to_string(),
                num_channels: 1,
            },
            StreamDescriptor {
                id: 2,
                name: "right".to_string(),
                num_channels: 1,
            },
        ];
        let mut chain = AudioChain::new("cabin", ENV, &streams).unwrap();
        let config = ModuleConfig::new(Properties::new())
            .with_stream(1, "left", 1)
            .with_in_place(1);
        let (vol, _handle) = volume::SimpleVolumeFactory
            .create(&config, "cabin.vol")
            .unwrap()
            .into_parts();
        chain.add(vol).unwrap();

        ProcessingZone::new(
            chain,
            &ZonePort {
                name: "cabin.in".to_string(),
                streams: vec![1, 2],
            },
            // Swap the channels on the way out
            &ZonePort {
                name: "cabin.out".to_string(),
                streams: vec![2, 1],
            },
            2,
        )
        .unwrap()
    }

    fn write_frames(rb: &RingBuffer, frames: &[[f32; 2]]) {
        let window = rb.begin_access(AccessDirection::Write, frames.len()).unwrap();
        assert_eq!(window.frames, frames.len());
        for (i, frame) in frames.iter().enumerate() {
            rb.write_sample(0, window.offset + i, frame[0]).unwrap();
            rb.write_sample(1, window.offset + i, frame[1]).unwrap();
        }
        rb.end_access(AccessDirection::Write, window.offset, frames.len()).unwrap();
    }

    #[test]
    fn test_ports() {
        let zone = zone();
        assert_eq!(zone.input().direction(), PortDirection::Output);
        assert_eq!(zone.output().direction(), PortDirection::Input);
        assert_eq!(zone.input().num_channels(), 2);
        assert_eq!(zone.output().ring_buffer().unwrap().capacity(), 8);
        assert_eq!(zone.output().owner().map(|o| &**o), Some("cabin"));
    }

    #[test]
    fn test_period_moves_through_chain() {
        let mut zone = zone();
        let in_rb = Arc::clone(zone.input().ring_buffer().unwrap());
        let out_rb = Arc::clone(zone.output().ring_buffer().unwrap());

        assert!(matches!(zone.process_period(), Err(Error::BufferEmpty)));

        write_frames(&in_rb, &[[0.1, 0.5], [0.2, 0.6], [0.3, 0.7], [0.4, 0.8]]);
        assert_eq!(zone.process_period().unwrap(), 4);
        assert_eq!(in_rb.fill_level(), 0);
        assert_eq!(out_rb.fill_level(), 4);
        assert_eq!(zone.periods(), 1);

        // Unity volume on left, channels swapped
        assert_eq!(out_rb.read_sample(0, 0).unwrap(), 0.5);
        assert_eq!(out_rb.read_sample(1, 0).unwrap(), 0.1);
        assert_eq!(out_rb.read_sample(0, 3).unwrap(), 0.8);
        assert_eq!(out_rb.read_sample(1, 3).unwrap(), 0.4);
    }

    #[test]
    fn test_full_output_leaves_input_untouched() {
        let mut zone = zone();
        let in_rb = Arc::clone(zone.input().ring_buffer().unwrap());

        for _ in 0..2 {
            write_frames(&in_rb, &[[0.0, 0.0]; 4]);
            zone.process_period().unwrap();
        }
        write_frames(&in_rb, &[[0.0, 0.0]; 4]);
        assert!(matches!(zone.process_period(), Err(Error::BufferFull)));
        assert_eq!(in_rb.fill_level(), 4);
    }

    #[test]
    fn test_unknown_stream() {
        let chain = AudioChain::new("cabin", ENV, &[]).unwrap();
        let port = ZonePort {
            name: "cabin.in".to_string(),
            streams: vec![7],
        };
        assert!(matches!(
            ProcessingZone::new(chain, &port, &port, 2),
            Err(Error::InvalidParam(_))
        ));
    }
}
