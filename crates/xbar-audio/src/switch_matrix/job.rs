//! Per-connection transport work.

use std::sync::Arc;

use xbar_core::{ChannelCount, Error, Frames, Result, SampleRate};

use crate::port::Port;
use crate::ring_buffer::{AccessDirection, RingBuffer};

/// Result of one [`SwitchMatrixJob::execute`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOutcome {
    /// Frames delivered to the sink
    pub frames_consumed: Frames,
    /// Source frames this job still has to deliver
    pub frames_still_to_consume: Frames,
}

/// Moves samples from one source port to one sink port
///
/// Several jobs may read the same source ring buffer. The job never moves
/// the source read cursor itself: it tracks how far it has read ahead of the
/// cursor (`ahead`) and the worker advances the cursor once every job of the
/// source has caught up.
#[derive(Debug)]
pub struct SwitchMatrixJob {
    source: Arc<Port>,
    sink: Arc<Port>,
    source_rb: Arc<RingBuffer>,
    sink_rb: Arc<RingBuffer>,
    common_channels: ChannelCount,
    period_size: Frames,
    sample_rate: SampleRate,
    copy_size: Frames,
    ahead: Frames,
    frames_dropped: u64,
}

impl SwitchMatrixJob {
    /// Bridge two ports; both must be bound to a ring buffer
    pub fn new(source: Arc<Port>, sink: Arc<Port>) -> Result<Self> {
        let source_rb = source.ring_buffer().cloned().ok_or_else(|| {
            Error::InvalidParam(format!("source port '{}' has no ring buffer", source.name()))
        })?;
        let sink_rb = sink.ring_buffer().cloned().ok_or_else(|| {
            Error::InvalidParam(format!("sink port '{}' has no ring buffer", sink.name()))
        })?;
        let common_channels = source.num_channels().min(sink.num_channels());

        Ok(Self {
            source,
            sink,
            source_rb,
            sink_rb,
            common_channels,
            period_size: 0,
            sample_rate: 0,
            copy_size: 0,
            ahead: 0,
            frames_dropped: 0,
        })
    }

    /// Record period and rate; clears the carry-over
    pub fn init(&mut self, period_size: Frames, sample_rate: SampleRate) -> Result<()> {
        if period_size == 0 || sample_rate == 0 {
            return Err(Error::InvalidParam(
                "job period size and sample rate must be > 0".to_string(),
            ));
        }
        self.period_size = period_size;
        self.sample_rate = sample_rate;
        self.copy_size = period_size;
        self.ahead = 0;
        Ok(())
    }

    pub fn set_copy_size(&mut self, frames: Frames) {
        if frames > 0 {
            self.copy_size = frames;
        }
    }

    #[must_use]
    pub fn source(&self) -> &Arc<Port> {
        &self.source
    }

    #[must_use]
    pub fn sink(&self) -> &Arc<Port> {
        &self.sink
    }

    #[must_use]
    pub fn source_rb(&self) -> &Arc<RingBuffer> {
        &self.source_rb
    }

    #[must_use]
    pub fn sink_rb(&self) -> &Arc<RingBuffer> {
        &self.sink_rb
    }

    #[must_use]
    pub fn period_size(&self) -> Frames {
        self.period_size
    }

    #[must_use]
    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    #[must_use]
    pub fn copy_size(&self) -> Frames {
        self.copy_size
    }

    /// Frames read beyond the shared source read cursor
    #[must_use]
    pub fn ahead(&self) -> Frames {
        self.ahead
    }

    /// Source frames this job never delivered because it fell behind
    #[must_use]
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// Move the carry-over back after the worker advanced the source cursor
    ///
    /// Returns the frames this job loses when the advance exceeds what it had
    /// read.
    pub fn release(&mut self, advanced: Frames) -> Frames {
        if advanced <= self.ahead {
            self.ahead -= advanced;
            0
        } else {
            let lost = advanced - self.ahead;
            self.ahead = 0;
            self.frames_dropped += lost as u64;
            lost
        }
    }

    /// Copy up to one copy-size of pending source data into the sink
    ///
    /// `source_available` is the source fill level sampled once for all jobs
    /// of the source. Never blocks, even on a sink in blocking mode: a full
    /// sink yields zero frames.
    pub fn execute(&mut self, source_available: Frames) -> JobOutcome {
        let pending = source_available.saturating_sub(self.ahead);
        let wanted = pending
            .min(self.copy_size)
            .min(self.sink_rb.update_available(AccessDirection::Write));

        let capacity = self.source_rb.capacity() as u64;
        let mut read_from = self.source_rb.read_position() + self.ahead as u64;
        let mut copied = 0;

        while copied < wanted {
            let Ok(window) = self
                .sink_rb
                .try_begin_access(AccessDirection::Write, wanted - copied)
            else {
                break;
            };

            for frame in 0..window.frames {
                let src_offset = ((read_from + frame as u64) % capacity) as Frames;
                let dst_offset = window.offset + frame;
                for ch in 0..self.sink.num_channels() {
                    let value = if ch < self.common_channels {
                        self.source_rb
                            .sample_at(self.source.index() + ch, src_offset)
                            .unwrap_or(0.0)
                    } else {
                        0.0
                    };
                    self.sink_rb
                        .store_at(self.sink.index() + ch, dst_offset, value);
                }
            }

            if self
                .sink_rb
                .end_access(AccessDirection::Write, window.offset, window.frames)
                .is_err()
            {
                break;
            }
            copied += window.frames;
            read_from += window.frames as u64;
        }

        self.ahead += copied;
        JobOutcome {
            frames_consumed: copied,
            frames_still_to_consume: pending - copied,
        }
    }
}
