//! Switch matrix: routes samples from source ports to sink ports.
//!
//! The control side ([`SwitchMatrix`]) keeps the connection table and stages
//! structural changes. A dedicated worker thread owns the jobs and executes
//! them once per trigger.
//!
//! ```text
//! control threads ──► connection table (mutex, map updates only)
//!        │
//!        └─ MatrixChange ──► [rtrb] ──► worker: apply at trigger start,
//!                                        execute jobs, advance sources
//!        ◄── Retired ◄─ [crossbeam] ◄──┘
//!        ◄── MatrixEvent ◄─ [rtrb] ◄───┘
//! ```

pub mod job;
mod worker;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use xbar_comms::{ControlQueue, EventReceiver, MatrixEvent, MatrixStats};
use xbar_core::{Error, Frames, Result, SampleRate};

pub use job::{JobOutcome, SwitchMatrixJob};
pub use worker::{MAX_JOBS, MAX_PROBES, MatrixClock, TriggerSummary, WorkerMode};

use crate::port::{Port, PortDirection, PortHandle};
use crate::probe::{self, ProbeFile, ProbeKind};
use worker::{MatrixChange, Retired, Worker, WorkerCommand};

const CHANGE_QUEUE_SIZE: usize = 64;
const EVENT_QUEUE_SIZE: usize = 256;
const RETIRE_QUEUE_SIZE: usize = 64;
const COMMAND_QUEUE_SIZE: usize = 16;

/// How long a synchronous trigger waits for the worker
const TRIGGER_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_PROBE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
struct Connection {
    source: Arc<Port>,
    sink: Arc<Port>,
}

struct ActiveProbe {
    id: u64,
    port: Arc<Port>,
    file: ProbeFile,
}

struct Running {
    worker_name: String,
    period_size: Frames,
    sample_rate: SampleRate,
    changes: ControlQueue<MatrixChange>,
    commands: Sender<WorkerCommand>,
    retired: Receiver<Retired>,
    events: EventReceiver<MatrixEvent>,
    stats: triple_buffer::Output<MatrixStats>,
    thread: Option<JoinHandle<()>>,
}

enum MatrixState {
    Uninitialized,
    Initialized(Box<Running>),
    Destroyed,
}

struct MatrixInner {
    state: MatrixState,
    /// Multimap keyed by source port
    connections: BTreeMap<PortHandle, Vec<Connection>>,
    /// Sink ring buffer id -> connection driving it
    driven_sinks: HashMap<u64, (PortHandle, PortHandle)>,
    probes: HashMap<PortHandle, ActiveProbe>,
    copy_size: Option<Frames>,
}

impl MatrixInner {
    fn running(&mut self) -> Result<&mut Running> {
        match &mut self.state {
            MatrixState::Initialized(running) => Ok(running),
            MatrixState::Uninitialized => Err(Error::NotInitialized(
                "switch matrix has not been initialized".to_string(),
            )),
            MatrixState::Destroyed => Err(Error::NotInitialized(
                "switch matrix has been destroyed".to_string(),
            )),
        }
    }

    fn connection_count(&self) -> usize {
        self.connections.values().map(Vec::len).sum()
    }

    /// Release objects the worker handed back
    fn drain_retired(&mut self) {
        let MatrixState::Initialized(running) = &self.state else {
            return;
        };
        let retired: Vec<Retired> = running.retired.try_iter().collect();
        for item in retired {
            match item {
                Retired::Job(job) => drop(job),
                Retired::Probe { id, port, probe } => {
                    drop(probe);
                    if self.probes.get(&port).is_some_and(|p| p.id == id) {
                        if let Some(mut active) = self.probes.remove(&port) {
                            active.file.stop();
                            tracing::info!(
                                "Probing of port '{}' finished ({})",
                                active.port.name(),
                                active.file.path().display()
                            );
                        }
                    }
                }
            }
        }
    }

    fn stage(&mut self, change: MatrixChange) -> Result<()> {
        let running = self.running()?;
        running
            .changes
            .push(change)
            .map_err(|_| Error::Failed("switch matrix change queue is full".to_string()))
    }

    fn remove_connection(&mut self, source: &Arc<Port>, sink: &Arc<Port>) -> Result<()> {
        let found = self
            .connections
            .get(&source.handle())
            .is_some_and(|sinks| sinks.iter().any(|c| c.sink.handle() == sink.handle()));
        if !found {
            return Err(Error::Failed(format!(
                "'{}' -> '{}' is not connected",
                source.name(),
                sink.name()
            )));
        }

        self.stage(MatrixChange::RemoveJob {
            source: source.handle(),
            sink: sink.handle(),
        })?;

        if let Some(sinks) = self.connections.get_mut(&source.handle()) {
            sinks.retain(|c| c.sink.handle() != sink.handle());
            if sinks.is_empty() {
                self.connections.remove(&source.handle());
            }
        }
        if let Some(rb) = sink.ring_buffer() {
            self.driven_sinks.remove(&rb.id());
        }
        tracing::info!("Disconnected '{}' -> '{}'", source.name(), sink.name());
        Ok(())
    }
}

/// Connection table and worker control
pub struct SwitchMatrix {
    inner: Mutex<MatrixInner>,
}

impl Default for SwitchMatrix {
    fn default() -> Self {
        Self::new()
    }
}

impl SwitchMatrix {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MatrixInner {
                state: MatrixState::Uninitialized,
                connections: BTreeMap::new(),
                driven_sinks: HashMap::new(),
                probes: HashMap::new(),
                copy_size: None,
            }),
        }
    }

    /// Initialize with an externally clocked worker
    pub fn init(&self, worker_name: &str, period_size: Frames, sample_rate: SampleRate) -> Result<()> {
        self.init_with_mode(worker_name, period_size, sample_rate, WorkerMode::ExternalClock)
    }

    /// Initialize and spawn the worker thread
    pub fn init_with_mode(
        &self,
        worker_name: &str,
        period_size: Frames,
        sample_rate: SampleRate,
        mode: WorkerMode,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, MatrixState::Uninitialized) {
            return Err(Error::Failed(format!(
                "switch matrix '{worker_name}' is already initialized"
            )));
        }
        if period_size == 0 || sample_rate == 0 {
            return Err(Error::InvalidParam(format!(
                "switch matrix '{worker_name}': period size ({period_size}) and sample rate ({sample_rate}) must be > 0"
            )));
        }

        let (changes, changes_rx) = xbar_comms::control_queue(CHANGE_QUEUE_SIZE);
        let (event_tx, events) = xbar_comms::event_channel(EVENT_QUEUE_SIZE);
        let (stats_in, stats) = xbar_comms::stats_channel();
        let (retire_tx, retired) = xbar_comms::retire_channel(RETIRE_QUEUE_SIZE);
        let (commands, commands_rx) = crossbeam_channel::bounded(COMMAND_QUEUE_SIZE);

        let period = Duration::from_secs_f64(period_size as f64 / f64::from(sample_rate));
        let worker = Worker::new(changes_rx, commands_rx, event_tx, stats_in, retire_tx, period, mode);
        let thread = thread::Builder::new()
            .name(worker_name.to_string())
            .spawn(move || worker.run())?;

        tracing::info!(
            "Switch matrix '{}' initialized: period {} frames @ {} Hz, {:?}",
            worker_name,
            period_size,
            sample_rate,
            mode
        );

        inner.state = MatrixState::Initialized(Box::new(Running {
            worker_name: worker_name.to_string(),
            period_size,
            sample_rate,
            changes,
            commands,
            retired,
            events,
            stats,
            thread: Some(thread),
        }));
        Ok(())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        matches!(self.inner.lock().state, MatrixState::Initialized(_))
    }

    /// Period size and sample rate the matrix was initialized with
    pub fn period(&self) -> Result<(Frames, SampleRate)> {
        let mut inner = self.inner.lock();
        let running = inner.running()?;
        Ok((running.period_size, running.sample_rate))
    }

    /// Connect a source (input) port to a sink (output) port
    ///
    /// The new job joins the execution set at the next trigger.
    pub fn connect(&self, source: &Arc<Port>, sink: &Arc<Port>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.drain_retired();
        let (period_size, sample_rate) = {
            let running = inner.running()?;
            (running.period_size, running.sample_rate)
        };

        if source.direction() != PortDirection::Input {
            return Err(Error::InvalidParam(format!(
                "'{}' is not an input port and cannot be a connection source",
                source.name()
            )));
        }
        if sink.direction() != PortDirection::Output {
            return Err(Error::InvalidParam(format!(
                "'{}' is not an output port and cannot be a connection sink",
                sink.name()
            )));
        }
        for port in [source, sink] {
            if port.ring_buffer().is_none() || port.owner().is_none() {
                return Err(Error::InvalidParam(format!(
                    "port '{}' has no ring buffer or owner",
                    port.name()
                )));
            }
        }
        let sink_rb = sink
            .ring_buffer()
            .map(|rb| rb.id())
            .ok_or_else(|| Error::InvalidParam(format!("port '{}' has no ring buffer", sink.name())))?;
        if source.ring_buffer().map(|rb| rb.id()) == Some(sink_rb) {
            return Err(Error::InvalidParam(format!(
                "'{}' and '{}' share one ring buffer",
                source.name(),
                sink.name()
            )));
        }

        let exists = inner
            .connections
            .get(&source.handle())
            .is_some_and(|sinks| sinks.iter().any(|c| c.sink.handle() == sink.handle()));
        if exists {
            return Err(Error::Failed(format!(
                "'{}' -> '{}' is already connected",
                source.name(),
                sink.name()
            )));
        }
        if inner.driven_sinks.contains_key(&sink_rb) {
            return Err(Error::Failed(format!(
                "ring buffer of sink '{}' is already driven by another connection",
                sink.name()
            )));
        }
        if inner.connection_count() >= MAX_JOBS {
            return Err(Error::Failed(format!(
                "connection limit of {MAX_JOBS} reached"
            )));
        }

        let mut job = SwitchMatrixJob::new(Arc::clone(source), Arc::clone(sink))?;
        job.init(period_size, sample_rate)?;
        if let Some(frames) = inner.copy_size {
            job.set_copy_size(frames);
        }
        inner.stage(MatrixChange::AddJob(Box::new(job)))?;

        inner
            .connections
            .entry(source.handle())
            .or_default()
            .push(Connection {
                source: Arc::clone(source),
                sink: Arc::clone(sink),
            });
        inner
            .driven_sinks
            .insert(sink_rb, (source.handle(), sink.handle()));

        tracing::info!("Connected '{}' -> '{}'", source.name(), sink.name());
        Ok(())
    }

    /// Remove one connection; `Failed` if it does not exist
    pub fn disconnect(&self, source: &Arc<Port>, sink: &Arc<Port>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.drain_retired();
        inner.running()?;
        inner.remove_connection(source, sink)
    }

    /// Remove every connection from `source`; `Failed` if there is none
    pub fn remove_connections(&self, source: &Arc<Port>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.drain_retired();
        inner.running()?;

        let sinks: Vec<Arc<Port>> = inner
            .connections
            .get(&source.handle())
            .map(|c| c.iter().map(|c| Arc::clone(&c.sink)).collect())
            .unwrap_or_default();
        if sinks.is_empty() {
            return Err(Error::Failed(format!(
                "'{}' has no connections",
                source.name()
            )));
        }
        for sink in &sinks {
            inner.remove_connection(source, sink)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_connected(&self, source: &Port, sink: &Port) -> bool {
        self.inner
            .lock()
            .connections
            .get(&source.handle())
            .is_some_and(|sinks| sinks.iter().any(|c| c.sink.handle() == sink.handle()))
    }

    /// All connections as (source name, sink name)
    #[must_use]
    pub fn connections(&self) -> Vec<(Arc<str>, Arc<str>)> {
        self.inner
            .lock()
            .connections
            .values()
            .flatten()
            .map(|c| (Arc::clone(c.source.name()), Arc::clone(c.sink.name())))
            .collect()
    }

    /// Frames moved per job per trigger (defaults to the period size)
    pub fn set_copy_size(&self, frames: Frames) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.running()?;
        if frames == 0 {
            return Err(Error::InvalidParam("copy size must be > 0".to_string()));
        }
        inner.stage(MatrixChange::SetCopySize(frames))?;
        inner.copy_size = Some(frames);
        tracing::debug!("Switch matrix copy size set to {} frames", frames);
        Ok(())
    }

    /// Run one trigger on the worker and wait for its summary
    ///
    /// Blocks the caller; a clock thread should post through [`Self::clock`].
    pub fn trigger(&self) -> Result<TriggerSummary> {
        let commands = self.inner.lock().running()?.commands.clone();

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        commands
            .send(WorkerCommand::Trigger(reply_tx))
            .map_err(|_| Error::Failed("switch matrix worker is gone".to_string()))?;
        reply_rx
            .recv_timeout(TRIGGER_TIMEOUT)
            .map_err(|_| Error::Failed("switch matrix worker did not answer".to_string()))
    }

    /// Non-blocking tick handle for a clock provider
    pub fn clock(&self) -> Result<MatrixClock> {
        let mut inner = self.inner.lock();
        Ok(MatrixClock {
            commands: inner.running()?.commands.clone(),
        })
    }

    /// Attach a file-backed probe to a port
    ///
    /// Injection needs an input port, recording an output port.
    pub fn start_probing(
        &self,
        port: &Arc<Port>,
        file_prefix: &str,
        inject: bool,
        seconds: u32,
        sample_rate: SampleRate,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.drain_retired();
        inner.running()?;

        let kind = ProbeKind::from_inject(inject);
        let expected = match kind {
            ProbeKind::Inject => PortDirection::Input,
            ProbeKind::Record => PortDirection::Output,
        };
        if port.direction() != expected {
            return Err(Error::InvalidParam(format!(
                "{kind:?} probe needs an {expected:?} port, '{}' is {:?}",
                port.name(),
                port.direction()
            )));
        }
        if port.ring_buffer().is_none() {
            return Err(Error::InvalidParam(format!(
                "port '{}' has no ring buffer",
                port.name()
            )));
        }
        if inner.probes.contains_key(&port.handle()) {
            return Err(Error::Failed(format!(
                "port '{}' is already being probed",
                port.name()
            )));
        }
        if inner.probes.len() >= MAX_PROBES {
            return Err(Error::Failed(format!("probe limit of {MAX_PROBES} reached")));
        }

        let (data_probe, file) =
            probe::open_probe(file_prefix, kind, port.num_channels(), sample_rate, seconds)?;
        let id = NEXT_PROBE_ID.fetch_add(1, Ordering::Relaxed);
        inner.stage(MatrixChange::AttachProbe {
            id,
            port: Arc::clone(port),
            probe: Box::new(data_probe),
        })?;
        inner.probes.insert(
            port.handle(),
            ActiveProbe {
                id,
                port: Arc::clone(port),
                file,
            },
        );
        tracing::info!("Started {:?} probe on port '{}'", kind, port.name());
        Ok(())
    }

    /// Detach the probe of a port and finalize its file
    pub fn stop_probing(&self, port: &Arc<Port>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.drain_retired();
        inner.running()?;

        if !inner.probes.contains_key(&port.handle()) {
            return Err(Error::Failed(format!(
                "port '{}' is not being probed",
                port.name()
            )));
        }
        inner.stage(MatrixChange::DetachProbe {
            port: port.handle(),
        })?;
        if let Some(mut active) = inner.probes.remove(&port.handle()) {
            active.file.stop();
        }
        tracing::info!("Stopped probing port '{}'", port.name());
        Ok(())
    }

    /// True while a probe is attached to the port
    #[must_use]
    pub fn is_probing(&self, port: &Port) -> bool {
        let mut inner = self.inner.lock();
        inner.drain_retired();
        inner.probes.contains_key(&port.handle())
    }

    /// Pending worker events
    #[must_use]
    pub fn events(&self) -> Vec<MatrixEvent> {
        let mut inner = self.inner.lock();
        inner.drain_retired();
        match &inner.state {
            MatrixState::Initialized(running) => running.events.drain(),
            _ => Vec::new(),
        }
    }

    /// Latest counters published by the worker
    #[must_use]
    pub fn stats(&self) -> MatrixStats {
        let mut inner = self.inner.lock();
        inner.drain_retired();
        match &mut inner.state {
            MatrixState::Initialized(running) => *running.stats.read(),
            _ => MatrixStats::default(),
        }
    }

    /// Stop the worker and drop all connections and probes
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        let MatrixState::Initialized(mut running) =
            std::mem::replace(&mut inner.state, MatrixState::Destroyed)
        else {
            return;
        };

        let _ = running.commands.send(WorkerCommand::Stop);
        if let Some(thread) = running.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Switch matrix worker '{}' panicked", running.worker_name);
            }
        }
        for (_, mut active) in inner.probes.drain() {
            active.file.stop();
        }
        inner.connections.clear();
        inner.driven_sinks.clear();
        tracing::info!("Switch matrix '{}' destroyed", running.worker_name);
    }
}

impl Drop for SwitchMatrix {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortParams;
    use crate::ring_buffer::{AccessDirection, RingBuffer, RingBufferParams};
    use std::thread;
    use std::time::Instant;
    use xbar_core::DataFormat;

    fn port(name: &str, channels: usize, period: Frames, periods: usize, direction: PortDirection) -> Arc<Port> {
        let rb = Arc::new(
            RingBuffer::new(
                RingBufferParams::new(name, channels, period, periods).with_format(DataFormat::Int16),
            )
            .unwrap(),
        );
        Arc::new(
            Port::new(PortParams::new(name, channels, direction))
                .unwrap()
                .with_ring_buffer(rb)
                .unwrap()
                .with_owner(Arc::from("device")),
        )
    }

    fn write(port: &Port, frames: Frames, value: f32) {
        let rb = port.ring_buffer().unwrap();
        let mut left = frames;
        while left > 0 {
            let window = rb.begin_access(AccessDirection::Write, left).unwrap();
            for frame in 0..window.frames {
                for ch in 0..rb.num_channels() {
                    rb.write_sample(ch, window.offset + frame, value).unwrap();
                }
            }
            rb.end_access(AccessDirection::Write, window.offset, window.frames)
                .unwrap();
            left -= window.frames;
        }
    }

    fn matrix() -> SwitchMatrix {
        let matrix = SwitchMatrix::new();
        matrix.init("matrix-test", 192, 48000).unwrap();
        matrix
    }

    #[test]
    fn test_one_period_is_copied_completely() {
        let matrix = matrix();
        let source = port("mic", 2, 192, 4, PortDirection::Input);
        let sink = port("spk", 2, 192, 4, PortDirection::Output);
        write(&source, 192, 0.5);

        matrix.connect(&source, &sink).unwrap();
        let summary = matrix.trigger().unwrap();

        assert_eq!(summary.jobs_executed, 1);
        assert_eq!(summary.frames_copied, 192);
        assert_eq!(summary.frames_still_to_consume, 0);
        assert_eq!(sink.ring_buffer().unwrap().fill_level(), 192);
        assert_eq!(source.ring_buffer().unwrap().fill_level(), 0);
        assert_eq!(sink.ring_buffer().unwrap().read_sample(1, 191).unwrap(), 0.5);
    }

    #[test]
    fn test_clock_tick_does_not_wait_for_control_lock() {
        let matrix = matrix();
        let source = port("mic", 2, 192, 4, PortDirection::Input);
        let sink = port("spk", 2, 192, 4, PortDirection::Output);
        write(&source, 192, 0.5);
        matrix.connect(&source, &sink).unwrap();
        let clock = matrix.clock().unwrap();

        let guard = matrix.inner.lock();
        let start = Instant::now();
        assert!(clock.tick());
        let sink_rb = sink.ring_buffer().unwrap();
        let deadline = start + Duration::from_secs(2);
        while sink_rb.update_available(AccessDirection::Read) < 192 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        let elapsed = start.elapsed();
        drop(guard);

        assert_eq!(sink_rb.fill_level(), 192);
        assert!(elapsed < Duration::from_millis(500), "tick waited {elapsed:?}");
    }

    #[test]
    fn test_init_state_machine() {
        let matrix = SwitchMatrix::new();
        let source = port("a", 1, 64, 2, PortDirection::Input);
        let sink = port("b", 1, 64, 2, PortDirection::Output);

        assert!(matches!(
            matrix.connect(&source, &sink),
            Err(Error::NotInitialized(_))
        ));
        assert!(matches!(matrix.set_copy_size(64), Err(Error::NotInitialized(_))));
        assert!(matches!(matrix.init("m", 0, 48000), Err(Error::InvalidParam(_))));
        assert!(matches!(matrix.init("m", 64, 0), Err(Error::InvalidParam(_))));

        matrix.init("m", 64, 48000).unwrap();
        assert!(matrix.is_initialized());
        assert!(matches!(matrix.init("m", 64, 48000), Err(Error::Failed(_))));
        assert!(matches!(matrix.set_copy_size(0), Err(Error::InvalidParam(_))));
        matrix.set_copy_size(32).unwrap();

        matrix.destroy();
        assert!(!matrix.is_initialized());
        assert!(matches!(matrix.trigger(), Err(Error::NotInitialized(_))));
        assert!(matches!(matrix.init("m", 64, 48000), Err(Error::Failed(_))));
    }

    #[test]
    fn test_connection_uniqueness() {
        let matrix = matrix();
        let source = port("a", 2, 192, 2, PortDirection::Input);
        let sink = port("b", 2, 192, 2, PortDirection::Output);
        let other = port("c", 2, 192, 2, PortDirection::Output);

        matrix.connect(&source, &sink).unwrap();
        assert!(matches!(matrix.connect(&source, &sink), Err(Error::Failed(_))));
        matrix.connect(&source, &other).unwrap();
        assert_eq!(matrix.connections().len(), 2);

        matrix.disconnect(&source, &sink).unwrap();
        assert!(matches!(
            matrix.disconnect(&source, &sink),
            Err(Error::Failed(_))
        ));
        assert_eq!(matrix.connections().len(), 1);
        assert!(matrix.is_connected(&source, &other));
    }

    #[test]
    fn test_remove_connections_on_empty_fails() {
        let matrix = matrix();
        let source = port("a", 2, 192, 2, PortDirection::Input);
        let sinks: Vec<_> = (0..3)
            .map(|i| port(&format!("s{i}"), 2, 192, 2, PortDirection::Output))
            .collect();

        assert!(matches!(
            matrix.remove_connections(&source),
            Err(Error::Failed(_))
        ));
        for sink in &sinks {
            matrix.connect(&source, sink).unwrap();
        }
        matrix.remove_connections(&source).unwrap();
        assert!(matrix.connections().is_empty());
        assert!(matches!(
            matrix.remove_connections(&source),
            Err(Error::Failed(_))
        ));
    }

    #[test]
    fn test_connect_validates_ports() {
        let matrix = matrix();
        let input = port("in", 2, 192, 2, PortDirection::Input);
        let output = port("out", 2, 192, 2, PortDirection::Output);
        let unbound = Arc::new(Port::new(PortParams::new("x", 2, PortDirection::Output)).unwrap());

        assert!(matches!(matrix.connect(&output, &input), Err(Error::InvalidParam(_))));
        assert!(matches!(matrix.connect(&input, &unbound), Err(Error::InvalidParam(_))));

        // A second writer into the same sink ring buffer is rejected
        let other = port("in2", 2, 192, 2, PortDirection::Input);
        matrix.connect(&input, &output).unwrap();
        assert!(matches!(matrix.connect(&other, &output), Err(Error::Failed(_))));
    }

    #[test]
    fn test_events_follow_admission() {
        let matrix = matrix();
        let source = port("nav", 1, 192, 2, PortDirection::Input);
        let sink = port("front", 1, 192, 2, PortDirection::Output);

        matrix.connect(&source, &sink).unwrap();
        assert!(matrix.events().is_empty());
        matrix.trigger().unwrap();
        assert_eq!(
            matrix.events(),
            vec![MatrixEvent::ConnectionEstablished {
                source: Arc::from("nav"),
                sink: Arc::from("front"),
            }]
        );

        matrix.disconnect(&source, &sink).unwrap();
        let summary = matrix.trigger().unwrap();
        assert_eq!(summary.jobs_executed, 0);
        assert!(matches!(
            matrix.events().as_slice(),
            [MatrixEvent::ConnectionRemoved { .. }]
        ));
        assert_eq!(matrix.stats().triggers, 2);
    }

    #[test]
    fn test_fan_out_waits_for_slowest_sink() {
        let matrix = matrix();
        let source = port("src", 2, 192, 4, PortDirection::Input);
        let fast = port("fast", 2, 192, 4, PortDirection::Output);
        let slow = port("slow", 2, 64, 1, PortDirection::Output);

        matrix.connect(&source, &fast).unwrap();
        matrix.connect(&source, &slow).unwrap();
        write(&source, 192, 0.25);

        let summary = matrix.trigger().unwrap();
        assert_eq!(summary.frames_copied, 192 + 64);
        assert_eq!(summary.frames_still_to_consume, 128);
        // The read cursor only moves past what both sinks received
        assert_eq!(source.ring_buffer().unwrap().fill_level(), 128);

        slow.ring_buffer().unwrap().consume(64);
        let summary = matrix.trigger().unwrap();
        assert_eq!(summary.frames_copied, 64);
        assert_eq!(source.ring_buffer().unwrap().fill_level(), 64);
    }

    #[test]
    fn test_full_source_drops_for_lagging_sink() {
        let matrix = matrix();
        let source = port("src", 1, 192, 2, PortDirection::Input);
        let fast = port("fast", 1, 192, 8, PortDirection::Output);
        let stuck = port("stuck", 1, 192, 1, PortDirection::Output);

        matrix.connect(&source, &fast).unwrap();
        matrix.connect(&source, &stuck).unwrap();
        matrix.trigger().unwrap();
        matrix.events();

        // "stuck" takes one period and then never drains
        for _ in 0..3 {
            write(&source, 192, 0.1);
            matrix.trigger().unwrap();
        }

        // Source ran full: one copy size was discarded on behalf of "stuck"
        let stats = matrix.stats();
        assert_eq!(stats.overruns, 1);
        assert_eq!(stats.frames_dropped, 192);
        assert!(matrix.events().iter().any(|e| matches!(
            e,
            MatrixEvent::JobOverrun { sink, frames_dropped: 192, .. } if &**sink == "stuck"
        )));
        assert_eq!(source.ring_buffer().unwrap().fill_level(), 192);
    }

    #[test]
    fn test_record_probe_on_sink() {
        let dir = tempfile::TempDir::new().unwrap();
        let prefix = dir.path().join("spk").to_string_lossy().into_owned();
        let matrix = matrix();
        let source = port("mic", 2, 192, 4, PortDirection::Input);
        let sink = port("spk", 2, 192, 4, PortDirection::Output);
        matrix.connect(&source, &sink).unwrap();

        assert!(matches!(
            matrix.start_probing(&sink, &prefix, true, 1, 48000),
            Err(Error::InvalidParam(_))
        ));
        matrix.start_probing(&sink, &prefix, false, 1, 48000).unwrap();
        assert!(matches!(
            matrix.start_probing(&sink, &prefix, false, 1, 48000),
            Err(Error::Failed(_))
        ));

        write(&source, 192, 0.5);
        matrix.trigger().unwrap();
        matrix.stop_probing(&sink).unwrap();
        assert!(!matrix.is_probing(&sink));
        assert!(matches!(matrix.stop_probing(&sink), Err(Error::Failed(_))));

        let reader = hound::WavReader::open(probe::probe_path(&prefix)).unwrap();
        assert_eq!(reader.len(), 2 * 192);
    }

    #[test]
    fn test_free_running_worker_moves_data() {
        let matrix = SwitchMatrix::new();
        matrix
            .init_with_mode("matrix-free", 192, 48000, WorkerMode::FreeRunning)
            .unwrap();
        let source = port("mic", 2, 192, 4, PortDirection::Input);
        let sink = port("spk", 2, 192, 4, PortDirection::Output);
        matrix.connect(&source, &sink).unwrap();
        write(&source, 192, 0.5);

        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.ring_buffer().unwrap().fill_level() < 192 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(sink.ring_buffer().unwrap().fill_level(), 192);
    }
}
