//! Generic audio component core.
//!
//! Every processing module runs inside a [`GenericAudioComponent`]. The
//! component owns the module's [`ProcessingCore`] on the audio thread and
//! adds what all modules share: the enabled/disabled state and stream
//! probes. Control threads reach it through the [`ComponentControl`] handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use xbar_comms::{ControlQueue, EventReceiver, EventSender, ModuleEvent};
use xbar_core::{ChannelCount, Error, Result};
use xbar_plugin::{ChainEnv, ProcessingCore, StreamBuffers, StreamDescriptor};

use crate::probe::{self, DataProbe, ProbeFile, ProbeKind};

/// Stream probes a single component can run at once
pub const MAX_STREAM_PROBES: usize = 8;

const REQUEST_QUEUE_SIZE: usize = 16;
const EVENT_QUEUE_SIZE: usize = 32;

static NEXT_STREAM_PROBE_ID: AtomicU64 = AtomicU64::new(1);

/// Whether `process_child` runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    Enabled,
    Disabled,
}

/// Where a stream probe sits relative to the module's DSP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeTap {
    /// Before `process_child`
    Input,
    /// After `process_child`
    Output,
}

enum ProbeRequest {
    Start {
        id: u64,
        stream_id: i32,
        tap: ProbeTap,
        probe: Box<DataProbe>,
    },
    Stop {
        stream_id: i32,
    },
}

struct RetiredProbe {
    id: u64,
    stream_id: i32,
    probe: Box<DataProbe>,
}

struct StreamProbe {
    id: u64,
    stream_id: i32,
    tap: ProbeTap,
    probe: Box<DataProbe>,
}

struct ActiveStreamProbe {
    id: u64,
    file: ProbeFile,
}

/// Control-thread handle of a component
pub struct ComponentControl {
    name: Arc<str>,
    enabled: AtomicBool,
    sample_rate: AtomicU32,
    streams: HashMap<i32, ChannelCount>,
    requests: ControlQueue<ProbeRequest>,
    retired: Receiver<RetiredProbe>,
    events: EventReceiver<ModuleEvent>,
    probes: Mutex<HashMap<i32, ActiveStreamProbe>>,
}

impl ComponentControl {
    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Processing resumes with the next `process()` call
    pub fn enable_processing(&self) {
        self.enabled.store(true, Ordering::Release);
        tracing::debug!("Component '{}' enabled", self.name);
    }

    /// Processing stops with the next `process()` call
    pub fn disable_processing(&self) {
        self.enabled.store(false, Ordering::Release);
        tracing::debug!("Component '{}' disabled", self.name);
    }

    #[must_use]
    pub fn state(&self) -> ProcessingState {
        if self.enabled.load(Ordering::Acquire) {
            ProcessingState::Enabled
        } else {
            ProcessingState::Disabled
        }
    }

    fn drain_retired(&self, probes: &mut HashMap<i32, ActiveStreamProbe>) {
        for retired in self.retired.try_iter() {
            drop(retired.probe);
            if probes.get(&retired.stream_id).is_some_and(|p| p.id == retired.id) {
                if let Some(mut active) = probes.remove(&retired.stream_id) {
                    active.file.stop();
                }
            }
        }
    }

    /// Queue a probe on one stream; honored at the top of the next period
    pub fn start_probe(
        &self,
        file_prefix: &str,
        inject: bool,
        seconds: u32,
        stream_id: i32,
        tap: ProbeTap,
    ) -> Result<()> {
        let Some(&num_channels) = self.streams.get(&stream_id) else {
            return Err(Error::InvalidParam(format!(
                "component '{}' has no stream {stream_id}",
                self.name
            )));
        };
        let sample_rate = self.sample_rate.load(Ordering::Acquire);
        if sample_rate == 0 {
            return Err(Error::NotInitialized(format!(
                "component '{}' has not been initialized",
                self.name
            )));
        }

        let mut probes = self.probes.lock();
        self.drain_retired(&mut probes);
        if probes.contains_key(&stream_id) {
            return Err(Error::Failed(format!(
                "stream {stream_id} of '{}' is already being probed",
                self.name
            )));
        }
        if probes.len() >= MAX_STREAM_PROBES {
            return Err(Error::Failed(format!(
                "component '{}' reached its probe limit",
                self.name
            )));
        }

        let kind = ProbeKind::from_inject(inject);
        let (data_probe, file) =
            probe::open_probe(file_prefix, kind, num_channels, sample_rate, seconds)?;
        let id = NEXT_STREAM_PROBE_ID.fetch_add(1, Ordering::Relaxed);
        self.requests
            .push(ProbeRequest::Start {
                id,
                stream_id,
                tap,
                probe: Box::new(data_probe),
            })
            .map_err(|_| Error::Failed(format!("probe queue of '{}' is full", self.name)))?;
        probes.insert(stream_id, ActiveStreamProbe { id, file });

        tracing::info!(
            "Component '{}': {:?} probe on stream {} ({:?} tap)",
            self.name,
            kind,
            stream_id,
            tap
        );
        Ok(())
    }

    /// Remove the probe of a stream and finalize its file
    pub fn stop_probe(&self, stream_id: i32) -> Result<()> {
        let mut probes = self.probes.lock();
        self.drain_retired(&mut probes);
        if !probes.contains_key(&stream_id) {
            return Err(Error::Failed(format!(
                "stream {stream_id} of '{}' is not being probed",
                self.name
            )));
        }
        self.requests
            .push(ProbeRequest::Stop { stream_id })
            .map_err(|_| Error::Failed(format!("probe queue of '{}' is full", self.name)))?;
        if let Some(mut active) = probes.remove(&stream_id) {
            active.file.stop();
        }
        tracing::info!("Component '{}': probe on stream {} stopped", self.name, stream_id);
        Ok(())
    }

    #[must_use]
    pub fn is_probing(&self, stream_id: i32) -> bool {
        let mut probes = self.probes.lock();
        self.drain_retired(&mut probes);
        probes.contains_key(&stream_id)
    }

    /// Probe events emitted from the audio thread
    #[must_use]
    pub fn events(&self) -> Vec<ModuleEvent> {
        self.events.drain()
    }
}

/// Audio-thread side of a module
pub struct GenericAudioComponent {
    name: Arc<str>,
    core: Box<dyn ProcessingCore>,
    control: Arc<ComponentControl>,
    requests: rtrb::Consumer<ProbeRequest>,
    retire: Sender<RetiredProbe>,
    events: EventSender<ModuleEvent>,
    probes: Vec<StreamProbe>,
    env: Option<ChainEnv>,
}

impl GenericAudioComponent {
    /// Wrap a processing core; `streams` are the streams it may probe
    pub fn new(
        name: &str,
        core: Box<dyn ProcessingCore>,
        streams: &[StreamDescriptor],
    ) -> (Self, Arc<ComponentControl>) {
        let name: Arc<str> = Arc::from(name);
        let (requests_tx, requests) = xbar_comms::control_queue(REQUEST_QUEUE_SIZE);
        let (retire, retired) = xbar_comms::retire_channel(MAX_STREAM_PROBES);
        let (events, events_rx) = xbar_comms::event_channel(EVENT_QUEUE_SIZE);

        let control = Arc::new(ComponentControl {
            name: Arc::clone(&name),
            enabled: AtomicBool::new(true),
            sample_rate: AtomicU32::new(0),
            streams: streams.iter().map(|s| (s.id, s.num_channels)).collect(),
            requests: requests_tx,
            retired,
            events: events_rx,
            probes: Mutex::new(HashMap::new()),
        });

        let component = Self {
            name,
            core,
            control: Arc::clone(&control),
            requests,
            retire,
            events,
            probes: Vec::with_capacity(MAX_STREAM_PROBES),
            env: None,
        };
        (component, control)
    }

    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    #[must_use]
    pub fn control(&self) -> &Arc<ComponentControl> {
        &self.control
    }

    /// Capture the chain environment and initialize the core
    pub fn init(&mut self, env: &ChainEnv) -> Result<()> {
        if env.frame_length == 0 || env.sample_rate == 0 {
            return Err(Error::InvalidParam(format!(
                "component '{}': frame length and sample rate must be > 0",
                self.name
            )));
        }
        self.core.init(env)?;
        self.env = Some(*env);
        self.control
            .sample_rate
            .store(env.sample_rate, Ordering::Release);
        tracing::debug!(
            "Component '{}' initialized ({} frames @ {} Hz)",
            self.name,
            env.frame_length,
            env.sample_rate
        );
        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        self.core.reset()
    }

    /// Process one period
    ///
    /// Pending probe requests are applied first. The enabled state is read
    /// once, so a toggle never takes effect mid-period.
    pub fn process(&mut self, streams: &mut StreamBuffers) -> Result<()> {
        let Some(env) = self.env else {
            return Err(Error::NotInitialized(format!(
                "component '{}' has not been initialized",
                self.name
            )));
        };

        self.apply_requests();
        let enabled = self.control.enabled.load(Ordering::Acquire);

        self.run_probes(streams, ProbeTap::Input, env.frame_length);
        let result = if enabled {
            self.core.process_child(streams)
        } else {
            Ok(())
        };
        self.run_probes(streams, ProbeTap::Output, env.frame_length);
        self.finish_probes();
        result
    }

    fn apply_requests(&mut self) {
        while let Ok(request) = self.requests.pop() {
            match request {
                ProbeRequest::Start {
                    id,
                    stream_id,
                    tap,
                    probe,
                } => {
                    if self.probes.len() < self.probes.capacity() {
                        self.probes.push(StreamProbe {
                            id,
                            stream_id,
                            tap,
                            probe,
                        });
                    } else {
                        let _ = self.retire.try_send(RetiredProbe { id, stream_id, probe });
                    }
                }
                ProbeRequest::Stop { stream_id } => {
                    if let Some(i) = self.probes.iter().position(|p| p.stream_id == stream_id) {
                        let probe = self.probes.swap_remove(i);
                        let _ = self.retire.try_send(RetiredProbe {
                            id: probe.id,
                            stream_id,
                            probe: probe.probe,
                        });
                    }
                }
            }
        }
    }

    fn run_probes(&mut self, streams: &mut StreamBuffers, tap: ProbeTap, frames: usize) {
        for probe in self.probes.iter_mut().filter(|p| p.tap == tap) {
            let Some(stream) = streams.get_mut(probe.stream_id) else {
                continue;
            };
            let frames = frames.min(stream.frame_length());
            match probe.probe.kind() {
                ProbeKind::Inject => {
                    let channels = stream.channels_mut();
                    probe.probe.inject(frames, |frame, ch, value| {
                        if let Some(channel) = channels.get_mut(ch) {
                            channel[frame] = value;
                        }
                    });
                }
                ProbeKind::Record => {
                    let channels = stream.channels();
                    probe.probe.record(frames, |frame, ch| {
                        channels.get(ch).map_or(0.0, |channel| channel[frame])
                    });
                }
            }
        }
    }

    fn finish_probes(&mut self) {
        let mut i = 0;
        while i < self.probes.len() {
            if self.probes[i].probe.is_finished() {
                let probe = self.probes.swap_remove(i);
                // REAL-TIME SAFE: drop the event rather than block
                let _ = self.events.push(ModuleEvent::ProbingFinished {
                    instance: Arc::clone(&self.name),
                    stream_id: probe.stream_id,
                });
                let _ = self.retire.try_send(RetiredProbe {
                    id: probe.id,
                    stream_id: probe.stream_id,
                    probe: probe.probe,
                });
            } else {
                i += 1;
            }
        }
    }
}
