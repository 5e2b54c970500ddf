//! Audio devices and their software drivers.
//!
//! A [`Device`] owns one ring buffer and the ports carved out of it. Real
//! hardware backends are outside this crate; [`VirtualDevice`] drives a
//! device in software so setups run without a sound card: a sine source
//! writes one period per clock tick, a sink drains one period and meters it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use dasp::Signal;
use dasp::signal::{ConstHz, Sine};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use xbar_core::{ChannelCount, DataFormat, Error, Frames, Result, Sample, SampleRate};

use crate::port::{Port, PortDirection, PortParams};
use crate::ring_buffer::{AccessDirection, Layout, RingBuffer, RingBufferParams};

/// Whether a device paces the period clock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockType {
    /// The device's period drives the shared clock
    Provider,
    /// The device follows the shared clock
    #[default]
    Receiver,
}

/// What a virtual device does every period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceRole {
    /// Captures a sine tone; data enters the matrix
    SineSource { frequency: f64, amplitude: Sample },
    /// Plays back into a level meter; data leaves the matrix
    Sink,
}

impl DeviceRole {
    /// Port direction every port of this device must have
    #[must_use]
    pub fn port_direction(&self) -> PortDirection {
        match self {
            Self::SineSource { .. } => PortDirection::Input,
            Self::Sink => PortDirection::Output,
        }
    }
}

fn default_num_periods() -> usize {
    4
}

/// Static description of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceParams {
    pub name: String,
    pub sample_rate: SampleRate,
    pub num_channels: ChannelCount,
    #[serde(default)]
    pub format: DataFormat,
    #[serde(default)]
    pub layout: Layout,
    #[serde(default)]
    pub clock: ClockType,
    pub period_size: Frames,
    #[serde(default = "default_num_periods")]
    pub num_periods: usize,
    pub role: DeviceRole,
    #[serde(default)]
    pub ports: Vec<PortParams>,
}

impl DeviceParams {
    #[must_use]
    pub fn new(name: &str, role: DeviceRole, sample_rate: SampleRate, num_channels: ChannelCount, period_size: Frames) -> Self {
        Self {
            name: name.to_string(),
            sample_rate,
            num_channels,
            format: DataFormat::default(),
            layout: Layout::default(),
            clock: ClockType::default(),
            period_size,
            num_periods: default_num_periods(),
            role,
            ports: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: ClockType) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: DataFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: PortParams) -> Self {
        self.ports.push(port);
        self
    }
}

/// A hardware or virtual audio endpoint owning a ring buffer and its ports
pub struct Device {
    name: Arc<str>,
    params: DeviceParams,
    ring_buffer: Arc<RingBuffer>,
    ports: RwLock<Vec<Arc<Port>>>,
    /// Per-channel peak of the last drained period, as f32 bits
    peaks: Box<[AtomicU32]>,
    periods: AtomicU64,
    xruns: AtomicU64,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("role", &self.params.role)
            .field("ring_buffer", &self.ring_buffer)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Allocate the ring buffer and create the configured ports
    pub fn new(params: DeviceParams) -> Result<Self> {
        if params.sample_rate == 0 {
            return Err(Error::InvalidParam(format!(
                "device '{}': sample rate must be > 0",
                params.name
            )));
        }
        let ring_buffer = RingBuffer::new(
            RingBufferParams::new(&params.name, params.num_channels, params.period_size, params.num_periods)
                .with_format(params.format)
                .with_layout(params.layout),
        )?;

        let device = Self {
            name: Arc::from(params.name.as_str()),
            peaks: (0..params.num_channels).map(|_| AtomicU32::new(0)).collect(),
            ring_buffer: Arc::new(ring_buffer),
            ports: RwLock::new(Vec::new()),
            periods: AtomicU64::new(0),
            xruns: AtomicU64::new(0),
            params,
        };
        for port in device.params.ports.clone() {
            device.add_port(port)?;
        }
        Ok(device)
    }

    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    #[must_use]
    pub fn params(&self) -> &DeviceParams {
        &self.params
    }

    #[must_use]
    pub fn sample_rate(&self) -> SampleRate {
        self.params.sample_rate
    }

    #[must_use]
    pub fn period_size(&self) -> Frames {
        self.params.period_size
    }

    #[must_use]
    pub fn clock(&self) -> ClockType {
        self.params.clock
    }

    #[must_use]
    pub fn role(&self) -> &DeviceRole {
        &self.params.role
    }

    #[must_use]
    pub fn ring_buffer(&self) -> &Arc<RingBuffer> {
        &self.ring_buffer
    }

    /// Create a port on this device's ring buffer
    pub fn add_port(&self, params: PortParams) -> Result<Arc<Port>> {
        let expected = self.params.role.port_direction();
        if params.direction != expected {
            return Err(Error::InvalidParam(format!(
                "device '{}' only carries {expected:?} ports, '{}' is {:?}",
                self.name, params.name, params.direction
            )));
        }
        let mut ports = self.ports.write();
        if ports.iter().any(|p| p.name().as_ref() == params.name) {
            return Err(Error::Failed(format!(
                "device '{}' already has a port named '{}'",
                self.name, params.name
            )));
        }
        let port = Arc::new(
            Port::new(params)?
                .with_ring_buffer(Arc::clone(&self.ring_buffer))?
                .with_owner(Arc::clone(&self.name)),
        );
        tracing::debug!("Device '{}': added port '{}'", self.name, port.name());
        ports.push(Arc::clone(&port));
        Ok(port)
    }

    /// Detach a port; the caller must have disconnected it first
    pub fn remove_port(&self, name: &str) -> Result<Arc<Port>> {
        let mut ports = self.ports.write();
        let index = ports
            .iter()
            .position(|p| p.name().as_ref() == name)
            .ok_or_else(|| Error::ObjectNotFound(format!("port '{name}' on device '{}'", self.name)))?;
        Ok(ports.remove(index))
    }

    #[must_use]
    pub fn port(&self, name: &str) -> Option<Arc<Port>> {
        self.ports
            .read()
            .iter()
            .find(|p| p.name().as_ref() == name)
            .cloned()
    }

    #[must_use]
    pub fn ports(&self) -> Vec<Arc<Port>> {
        self.ports.read().clone()
    }

    /// Peak level of a channel during the last metered period
    #[must_use]
    pub fn peak(&self, channel: usize) -> Option<Sample> {
        self.peaks
            .get(channel)
            .map(|p| f32::from_bits(p.load(Ordering::Relaxed)))
    }

    /// Periods this device has been driven for
    #[must_use]
    pub fn periods(&self) -> u64 {
        self.periods.load(Ordering::Relaxed)
    }

    /// Periods that found the buffer full (source) or empty (sink)
    #[must_use]
    pub fn xruns(&self) -> u64 {
        self.xruns.load(Ordering::Relaxed)
    }
}

enum Driver {
    Sine {
        signal: Sine<ConstHz>,
        amplitude: Sample,
    },
    Sink,
}

/// Software driver of one device, owned by the period clock thread
pub struct VirtualDevice {
    device: Arc<Device>,
    driver: Driver,
}

impl VirtualDevice {
    #[must_use]
    pub fn new(device: Arc<Device>) -> Self {
        let driver = match device.role() {
            DeviceRole::SineSource {
                frequency,
                amplitude,
            } => Driver::Sine {
                signal: dasp::signal::rate(f64::from(device.sample_rate()))
                    .const_hz(*frequency)
                    .sine(),
                amplitude: *amplitude,
            },
            DeviceRole::Sink => Driver::Sink,
        };
        Self { device, driver }
    }

    #[must_use]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[must_use]
    pub fn is_source(&self) -> bool {
        matches!(self.driver, Driver::Sine { .. })
    }

    /// Produce or consume one period
    ///
    /// REAL-TIME SAFE: no allocation for up to 8 channels, no locks, no logging.
    /// Returns the frames moved.
    pub fn run_period(&mut self) -> Frames {
        let device = &self.device;
        device.periods.fetch_add(1, Ordering::Relaxed);
        let rb = &device.ring_buffer;
        let period = device.period_size();

        match &mut self.driver {
            Driver::Sine { signal, amplitude } => {
                let mut written = 0;
                while written < period {
                    let Ok(window) = rb.try_begin_access(AccessDirection::Write, period - written) else {
                        break;
                    };
                    for frame in 0..window.frames {
                        let value = signal.next() as Sample * *amplitude;
                        for channel in 0..rb.num_channels() {
                            rb.store_at(channel, window.offset + frame, value);
                        }
                    }
                    if rb
                        .end_access(AccessDirection::Write, window.offset, window.frames)
                        .is_err()
                    {
                        break;
                    }
                    written += window.frames;
                }
                if written < period {
                    device.xruns.fetch_add(1, Ordering::Relaxed);
                }
                written
            }
            Driver::Sink => {
                let mut peaks: SmallVec<[Sample; 8]> = SmallVec::from_elem(0.0, rb.num_channels());
                let mut read = 0;
                while read < period {
                    let Ok(window) = rb.try_begin_access(AccessDirection::Read, period - read) else {
                        break;
                    };
                    for (channel, peak) in peaks.iter_mut().enumerate() {
                        for frame in 0..window.frames {
                            let value = rb.sample_at(channel, window.offset + frame).unwrap_or(0.0);
                            *peak = peak.max(value.abs());
                        }
                    }
                    if rb
                        .end_access(AccessDirection::Read, window.offset, window.frames)
                        .is_err()
                    {
                        break;
                    }
                    read += window.frames;
                }
                if read < period {
                    device.xruns.fetch_add(1, Ordering::Relaxed);
                }
                for (slot, peak) in device.peaks.iter().zip(&peaks) {
                    slot.store(peak.to_bits(), Ordering::Relaxed);
                }
                read
            }
        }
    }
}
