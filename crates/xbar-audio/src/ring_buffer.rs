//! Lock-free multi-channel ring buffer.
//!
//! One reader and one writer access the buffer concurrently through explicit
//! begin/end access windows, the way an ALSA mmap area is accessed:
//!
//! 1. `begin_access` returns the contiguous region (offset + frames) that is
//!    available from the caller's cursor, clamped at the physical end of the
//!    buffer.
//! 2. The caller reads or writes samples inside that region.
//! 3. `end_access` commits, advancing the caller's cursor by exactly the
//!    committed frame count.
//!
//! Each side only ever advances its own cursor. Samples live in atomic slots
//! accessed with relaxed ordering; the cursor store (release) / load (acquire)
//! pair publishes them to the other side, so no lock is needed on the data
//! path. A lock and condition variable exist only for blocking mode, which is
//! reserved for non-real-time tools.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dasp::Sample as _;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use xbar_core::{ChannelCount, DataFormat, Error, Frames, Result, Sample};

static NEXT_RING_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Default wait bound for blocking mode
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// Which cursor an access moves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDirection {
    Read,
    Write,
}

/// Memory layout of the sample storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layout {
    /// Frame-major: `[f0c0, f0c1, f1c0, f1c1, ...]`
    #[default]
    Interleaved,
    /// Channel-major: `[c0f0, c0f1, ..., c1f0, c1f1, ...]`
    NonInterleaved,
}

/// Position of one channel inside the sample storage, in sample units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioArea {
    /// Index of the channel's sample for frame 0
    pub first: usize,
    /// Distance between the channel's samples of consecutive frames
    pub step: usize,
}

impl AudioArea {
    #[inline]
    #[must_use]
    pub const fn index(&self, frame: Frames) -> usize {
        self.first + frame * self.step
    }
}

/// Ring buffer geometry and format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingBufferParams {
    pub name: String,
    pub num_channels: ChannelCount,
    pub period_size: Frames,
    pub num_periods: usize,
    pub format: DataFormat,
    pub layout: Layout,
}

impl RingBufferParams {
    #[must_use]
    pub fn new(name: &str, num_channels: ChannelCount, period_size: Frames, num_periods: usize) -> Self {
        Self {
            name: name.to_string(),
            num_channels,
            period_size,
            num_periods,
            format: DataFormat::Float32,
            layout: Layout::Interleaved,
        }
    }

    #[must_use]
    pub fn with_format(mut self, format: DataFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }
}

/// Region granted by [`RingBuffer::begin_access`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessWindow {
    /// Frame offset of the region inside the buffer
    pub offset: Frames,
    /// Contiguous frames available from `offset`
    pub frames: Frames,
}

/// Fixed-capacity single-reader/single-writer sample ring
pub struct RingBuffer {
    id: u64,
    name: Arc<str>,
    num_channels: ChannelCount,
    period_size: Frames,
    num_periods: usize,
    capacity: Frames,
    format: DataFormat,
    layout: Layout,
    areas: Vec<AudioArea>,
    storage: Box<[AtomicU32]>,
    /// Total frames ever read
    read_pos: AtomicU64,
    /// Total frames ever written
    write_pos: AtomicU64,
    non_blocking: AtomicBool,
    timeout_us: AtomicU64,
    wait_lock: Mutex<()>,
    wakeup: Condvar,
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("name", &self.name)
            .field("num_channels", &self.num_channels)
            .field("capacity", &self.capacity)
            .field("format", &self.format)
            .field("fill_level", &self.fill_level())
            .finish_non_exhaustive()
    }
}

impl RingBuffer {
    /// Allocate a ring buffer of `period_size * num_periods` frames
    pub fn new(params: RingBufferParams) -> Result<Self> {
        if params.num_channels == 0 || params.period_size == 0 || params.num_periods == 0 {
            return Err(Error::InvalidParam(format!(
                "ring buffer '{}' needs channels, period size and period count > 0",
                params.name
            )));
        }

        let capacity = params.period_size * params.num_periods;
        let areas = (0..params.num_channels)
            .map(|ch| match params.layout {
                Layout::Interleaved => AudioArea {
                    first: ch,
                    step: params.num_channels,
                },
                Layout::NonInterleaved => AudioArea {
                    first: ch * capacity,
                    step: 1,
                },
            })
            .collect();
        let storage = (0..capacity * params.num_channels)
            .map(|_| AtomicU32::new(0))
            .collect();

        Ok(Self {
            id: NEXT_RING_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(params.name.as_str()),
            num_channels: params.num_channels,
            period_size: params.period_size,
            num_periods: params.num_periods,
            capacity,
            format: params.format,
            layout: params.layout,
            areas,
            storage,
            read_pos: AtomicU64::new(0),
            write_pos: AtomicU64::new(0),
            non_blocking: AtomicBool::new(true),
            timeout_us: AtomicU64::new(DEFAULT_TIMEOUT.as_micros() as u64),
            wait_lock: Mutex::new(()),
            wakeup: Condvar::new(),
        })
    }

    /// Process-unique identity, stable for the buffer's lifetime
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    #[must_use]
    pub fn num_channels(&self) -> ChannelCount {
        self.num_channels
    }

    #[must_use]
    pub fn period_size(&self) -> Frames {
        self.period_size
    }

    #[must_use]
    pub fn num_periods(&self) -> usize {
        self.num_periods
    }

    /// Capacity in frames
    #[must_use]
    pub fn capacity(&self) -> Frames {
        self.capacity
    }

    #[must_use]
    pub fn format(&self) -> DataFormat {
        self.format
    }

    #[must_use]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Per-channel area descriptors
    #[must_use]
    pub fn areas(&self) -> &[AudioArea] {
        &self.areas
    }

    /// Absolute read cursor (total frames consumed)
    #[must_use]
    pub fn read_position(&self) -> u64 {
        self.read_pos.load(Ordering::Acquire)
    }

    /// Absolute write cursor (total frames produced)
    #[must_use]
    pub fn write_position(&self) -> u64 {
        self.write_pos.load(Ordering::Acquire)
    }

    /// Frames written but not yet read
    #[must_use]
    pub fn fill_level(&self) -> Frames {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.saturating_sub(read) as Frames
    }

    /// Frames currently available for reading or writing
    #[must_use]
    pub fn update_available(&self, direction: AccessDirection) -> Frames {
        let fill = self.fill_level().min(self.capacity);
        match direction {
            AccessDirection::Read => fill,
            AccessDirection::Write => self.capacity - fill,
        }
    }

    /// Switch between non-blocking (default) and blocking access
    pub fn set_non_block_mode(&self, non_blocking: bool) {
        self.non_blocking.store(non_blocking, Ordering::Release);
        if non_blocking {
            // Release anyone still waiting so they observe the new mode
            let _guard = self.wait_lock.lock();
            self.wakeup.notify_all();
        }
    }

    #[must_use]
    pub fn is_non_blocking(&self) -> bool {
        self.non_blocking.load(Ordering::Acquire)
    }

    /// Upper bound for a blocking wait
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_us
            .store(timeout.as_micros() as u64, Ordering::Release);
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_micros(self.timeout_us.load(Ordering::Acquire))
    }

    fn cursor(&self, direction: AccessDirection) -> &AtomicU64 {
        match direction {
            AccessDirection::Read => &self.read_pos,
            AccessDirection::Write => &self.write_pos,
        }
    }

    /// Grant a contiguous region of up to `requested` frames
    ///
    /// In non-blocking mode this returns immediately with whatever is
    /// available. In blocking mode it first waits (bounded by the timeout) for
    /// `requested` frames. Nothing available yields `BufferEmpty` (read) or
    /// `BufferFull` (write); both are retry signals.
    pub fn begin_access(&self, direction: AccessDirection, requested: Frames) -> Result<AccessWindow> {
        if requested == 0 {
            return Err(Error::InvalidParam(format!(
                "ring buffer '{}': zero-frame access",
                self.name
            )));
        }

        let mut available = self.update_available(direction);
        if available < requested && !self.is_non_blocking() {
            available = self.wait_for(direction, requested.min(self.capacity));
        }
        self.grant(direction, requested, available)
    }

    /// Grant a contiguous region of up to `requested` frames without waiting
    ///
    /// Behaves like non-blocking [`begin_access`](Self::begin_access) whatever
    /// the buffer's mode. REAL-TIME SAFE.
    pub fn try_begin_access(&self, direction: AccessDirection, requested: Frames) -> Result<AccessWindow> {
        if requested == 0 {
            return Err(Error::InvalidParam(format!(
                "ring buffer '{}': zero-frame access",
                self.name
            )));
        }
        self.grant(direction, requested, self.update_available(direction))
    }

    fn grant(&self, direction: AccessDirection, requested: Frames, available: Frames) -> Result<AccessWindow> {
        if available == 0 {
            return Err(match direction {
                AccessDirection::Read => Error::BufferEmpty,
                AccessDirection::Write => Error::BufferFull,
            });
        }

        let offset = (self.cursor(direction).load(Ordering::Acquire) % self.capacity as u64) as Frames;
        Ok(AccessWindow {
            offset,
            frames: requested.min(available).min(self.capacity - offset),
        })
    }

    /// Commit `frames` frames of a region obtained from `begin_access`
    pub fn end_access(&self, direction: AccessDirection, offset: Frames, frames: Frames) -> Result<()> {
        if frames == 0 {
            return Ok(());
        }

        let cursor = self.cursor(direction);
        let position = cursor.load(Ordering::Acquire);
        let expected = (position % self.capacity as u64) as Frames;
        if offset != expected {
            return Err(Error::InvalidParam(format!(
                "ring buffer '{}': end_access offset {offset} does not match cursor offset {expected}",
                self.name
            )));
        }
        let limit = self
            .update_available(direction)
            .min(self.capacity - offset);
        if frames > limit {
            return Err(Error::InvalidParam(format!(
                "ring buffer '{}': cannot commit {frames} frames, only {limit} accessible",
                self.name
            )));
        }

        cursor.store(position + frames as u64, Ordering::Release);

        if !self.is_non_blocking() {
            let _guard = self.wait_lock.lock();
            self.wakeup.notify_all();
        }
        Ok(())
    }

    /// Wait until `frames` are available or the timeout expires
    fn wait_for(&self, direction: AccessDirection, frames: Frames) -> Frames {
        let deadline = Instant::now() + self.timeout();
        let mut guard = self.wait_lock.lock();
        loop {
            let available = self.update_available(direction);
            if available >= frames || self.is_non_blocking() {
                return available;
            }
            if self.wakeup.wait_until(&mut guard, deadline).timed_out() {
                return self.update_available(direction);
            }
        }
    }

    /// Drop up to `frames` readable frames; returns how many were dropped
    pub fn consume(&self, frames: Frames) -> Frames {
        let mut remaining = frames;
        while remaining > 0 {
            let Ok(window) = self.try_begin_access(AccessDirection::Read, remaining) else {
                break;
            };
            if self
                .end_access(AccessDirection::Read, window.offset, window.frames)
                .is_err()
            {
                break;
            }
            remaining -= window.frames;
        }
        frames - remaining
    }

    /// Reset both cursors; only valid while neither side is accessing
    pub fn reset(&self) {
        self.read_pos.store(0, Ordering::Release);
        self.write_pos.store(0, Ordering::Release);
    }

    #[inline]
    pub(crate) fn sample_at(&self, channel: usize, offset: Frames) -> Option<Sample> {
        let area = self.areas.get(channel)?;
        if offset >= self.capacity {
            return None;
        }
        let bits = self.storage[area.index(offset)].load(Ordering::Relaxed);
        Some(decode(self.format, bits))
    }

    #[inline]
    pub(crate) fn store_at(&self, channel: usize, offset: Frames, value: Sample) -> bool {
        let Some(area) = self.areas.get(channel) else {
            return false;
        };
        if offset >= self.capacity {
            return false;
        }
        self.storage[area.index(offset)].store(encode(self.format, value), Ordering::Relaxed);
        true
    }

    fn check_channel(&self, channel: usize) -> Result<()> {
        if channel < self.num_channels {
            Ok(())
        } else {
            Err(Error::InvalidParam(format!(
                "ring buffer '{}': channel {channel} out of range (0..{})",
                self.name, self.num_channels
            )))
        }
    }

    /// Read one sample (converted to f32) at a frame offset inside the buffer
    pub fn read_sample(&self, channel: usize, offset: Frames) -> Result<Sample> {
        self.check_channel(channel)?;
        self.sample_at(channel, offset).ok_or_else(|| {
            Error::InvalidParam(format!(
                "ring buffer '{}': offset {offset} out of range",
                self.name
            ))
        })
    }

    /// Write one sample (converted from f32) at a frame offset inside the buffer
    pub fn write_sample(&self, channel: usize, offset: Frames, value: Sample) -> Result<()> {
        self.check_channel(channel)?;
        if self.store_at(channel, offset, value) {
            Ok(())
        } else {
            Err(Error::InvalidParam(format!(
                "ring buffer '{}': offset {offset} out of range",
                self.name
            )))
        }
    }

    /// Write silence to `frames` frames of one channel starting at `offset`
    pub fn zero(&self, channel: usize, offset: Frames, frames: Frames) -> Result<()> {
        self.check_channel(channel)?;
        for frame in offset..(offset + frames).min(self.capacity) {
            self.store_at(channel, frame, 0.0);
        }
        Ok(())
    }
}

#[inline]
fn encode(format: DataFormat, value: Sample) -> u32 {
    match format {
        DataFormat::Int16 => u32::from(value.to_sample::<i16>() as u16),
        DataFormat::Int32 => value.to_sample::<i32>() as u32,
        DataFormat::Float32 => value.to_bits(),
    }
}

#[inline]
fn decode(format: DataFormat, bits: u32) -> Sample {
    match format {
        DataFormat::Int16 => (bits as u16 as i16).to_sample::<f32>(),
        DataFormat::Int32 => (bits as i32).to_sample::<f32>(),
        DataFormat::Float32 => f32::from_bits(bits),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn int16_buffer() -> RingBuffer {
        RingBuffer::new(RingBufferParams::new("test", 2, 192, 4).with_format(DataFormat::Int16))
            .unwrap()
    }

    fn write_frames(rb: &RingBuffer, frames: Frames, value: Sample) -> Frames {
        let window = rb.begin_access(AccessDirection::Write, frames).unwrap();
        for frame in 0..window.frames {
            for ch in 0..rb.num_channels() {
                rb.write_sample(ch, window.offset + frame, value).unwrap();
            }
        }
        rb.end_access(AccessDirection::Write, window.offset, window.frames)
            .unwrap();
        window.frames
    }

    #[test]
    fn test_int16_period_write_read() {
        let rb = int16_buffer();
        assert_eq!(rb.capacity(), 768);

        let value = 1000_i16.to_sample::<f32>();
        assert_eq!(write_frames(&rb, 192, value), 192);
        assert_eq!(rb.update_available(AccessDirection::Read), 192);

        let window = rb.begin_access(AccessDirection::Read, 192).unwrap();
        assert_eq!(window, AccessWindow { offset: 0, frames: 192 });
        for frame in 0..192 {
            for ch in 0..2 {
                let sample = rb.read_sample(ch, window.offset + frame).unwrap();
                assert_eq!(sample.to_sample::<i16>(), 1000);
            }
        }
        rb.end_access(AccessDirection::Read, window.offset, window.frames)
            .unwrap();

        assert_eq!(rb.write_position() - rb.read_position(), 0);
        assert_eq!(rb.update_available(AccessDirection::Read), 0);
        assert_eq!(rb.update_available(AccessDirection::Write), 768);
    }

    #[test]
    fn test_window_clamped_at_physical_end() {
        let rb = int16_buffer();
        assert_eq!(write_frames(&rb, 700, 0.0), 700);
        assert_eq!(rb.consume(700), 700);

        let window = rb.begin_access(AccessDirection::Write, 192).unwrap();
        assert_eq!(window, AccessWindow { offset: 700, frames: 68 });
        rb.end_access(AccessDirection::Write, 700, 68).unwrap();

        let window = rb.begin_access(AccessDirection::Write, 124).unwrap();
        assert_eq!(window, AccessWindow { offset: 0, frames: 124 });
    }

    #[test]
    fn test_empty_and_full_are_transient() {
        let rb = int16_buffer();
        let err = rb.begin_access(AccessDirection::Read, 1).unwrap_err();
        assert!(matches!(err, Error::BufferEmpty));
        assert!(err.is_transient());

        for _ in 0..4 {
            write_frames(&rb, 192, 0.1);
        }
        assert!(matches!(
            rb.begin_access(AccessDirection::Write, 1),
            Err(Error::BufferFull)
        ));
    }

    #[test]
    fn test_end_access_validation() {
        let rb = int16_buffer();
        write_frames(&rb, 10, 0.0);

        let window = rb.begin_access(AccessDirection::Read, 10).unwrap();
        assert!(matches!(
            rb.end_access(AccessDirection::Read, window.offset + 1, 1),
            Err(Error::InvalidParam(_))
        ));
        assert!(matches!(
            rb.end_access(AccessDirection::Read, window.offset, 11),
            Err(Error::InvalidParam(_))
        ));
        assert_eq!(rb.fill_level(), 10);
    }

    #[test]
    fn test_channel_out_of_range() {
        let rb = int16_buffer();
        assert!(matches!(rb.read_sample(2, 0), Err(Error::InvalidParam(_))));
        assert!(matches!(
            rb.write_sample(5, 0, 0.0),
            Err(Error::InvalidParam(_))
        ));
        assert!(matches!(rb.read_sample(0, 768), Err(Error::InvalidParam(_))));
    }

    #[test]
    fn test_invalid_geometry() {
        assert!(RingBuffer::new(RingBufferParams::new("bad", 0, 192, 4)).is_err());
        assert!(RingBuffer::new(RingBufferParams::new("bad", 2, 0, 4)).is_err());
        assert!(RingBuffer::new(RingBufferParams::new("bad", 2, 192, 0)).is_err());
    }

    #[test]
    fn test_non_interleaved_areas() {
        let rb = RingBuffer::new(
            RingBufferParams::new("planar", 3, 4, 2).with_layout(Layout::NonInterleaved),
        )
        .unwrap();
        assert_eq!(rb.areas()[0], AudioArea { first: 0, step: 1 });
        assert_eq!(rb.areas()[2], AudioArea { first: 16, step: 1 });

        rb.write_sample(2, 3, 0.75).unwrap();
        assert_eq!(rb.read_sample(2, 3).unwrap(), 0.75);
        assert_eq!(rb.read_sample(1, 3).unwrap(), 0.0);
    }

    #[test]
    fn test_backlog_conservation() {
        let rb = int16_buffer();
        let mut written = 0_u64;
        let mut read = 0_u64;
        let mut seed = 0x2545_f491_u32;

        for _ in 0..500 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            let frames = (seed >> 16) as usize % 300 + 1;
            if seed & 1 == 0 {
                if let Ok(window) = rb.begin_access(AccessDirection::Write, frames) {
                    rb.end_access(AccessDirection::Write, window.offset, window.frames)
                        .unwrap();
                    written += window.frames as u64;
                }
            } else if let Ok(window) = rb.begin_access(AccessDirection::Read, frames) {
                rb.end_access(AccessDirection::Read, window.offset, window.frames)
                    .unwrap();
                read += window.frames as u64;
            }

            assert_eq!((written - read) as Frames, rb.fill_level());
            assert!(
                rb.update_available(AccessDirection::Read)
                    + rb.update_available(AccessDirection::Write)
                    <= rb.capacity()
            );
        }
    }

    #[test]
    fn test_blocking_read_waits_for_writer() {
        let rb = Arc::new(int16_buffer());
        rb.set_non_block_mode(false);
        rb.set_timeout(Duration::from_secs(2));

        let writer = {
            let rb = Arc::clone(&rb);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                write_frames(&rb, 192, 0.5);
            })
        };

        let window = rb.begin_access(AccessDirection::Read, 192).unwrap();
        assert_eq!(window.frames, 192);
        writer.join().unwrap();
    }

    #[test]
    fn test_blocking_read_times_out_as_retry() {
        let rb = int16_buffer();
        rb.set_non_block_mode(false);
        rb.set_timeout(Duration::from_millis(10));

        let err = rb.begin_access(AccessDirection::Read, 64).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_try_access_ignores_blocking_mode() {
        let rb = int16_buffer();
        rb.set_non_block_mode(false);
        rb.set_timeout(Duration::from_secs(2));
        write_frames(&rb, 32, 0.5);

        let start = Instant::now();
        let window = rb.try_begin_access(AccessDirection::Read, 64).unwrap();
        assert_eq!(window.frames, 32);
        rb.end_access(AccessDirection::Read, window.offset, window.frames)
            .unwrap();
        assert!(matches!(
            rb.try_begin_access(AccessDirection::Read, 64),
            Err(Error::BufferEmpty)
        ));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_concurrent_spsc_preserves_order() {
        const TOTAL: usize = 20_000;
        let rb = Arc::new(
            RingBuffer::new(RingBufferParams::new("spsc", 1, 64, 4).with_format(DataFormat::Int32))
                .unwrap(),
        );

        let writer = {
            let rb = Arc::clone(&rb);
            thread::spawn(move || {
                let mut next = 0_usize;
                while next < TOTAL {
                    let Ok(window) = rb.begin_access(AccessDirection::Write, 48) else {
                        thread::yield_now();
                        continue;
                    };
                    let frames = window.frames.min(TOTAL - next);
                    for i in 0..frames {
                        let value = (next + i) as i32;
                        rb.write_sample(0, window.offset + i, value.to_sample::<f32>())
                            .unwrap();
                    }
                    rb.end_access(AccessDirection::Write, window.offset, frames)
                        .unwrap();
                    next += frames;
                }
            })
        };

        let mut expected = 0_usize;
        while expected < TOTAL {
            let Ok(window) = rb.begin_access(AccessDirection::Read, 100) else {
                thread::yield_now();
                continue;
            };
            for i in 0..window.frames {
                let value = rb.read_sample(0, window.offset + i).unwrap().to_sample::<i32>();
                assert_eq!(value, (expected + i) as i32);
            }
            rb.end_access(AccessDirection::Read, window.offset, window.frames)
                .unwrap();
            expected += window.frames;
        }
        writer.join().unwrap();
    }
}
