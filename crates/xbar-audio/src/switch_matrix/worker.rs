//! The switch-matrix worker thread.
//!
//! The worker owns the execution set. Control threads never touch it
//! directly: structural changes arrive through the change queue and are
//! applied at the start of the next trigger, so a job is never added or
//! removed while samples are moving.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use xbar_comms::{EventSender, MatrixEvent, MatrixStats};
use xbar_core::Frames;

use super::job::SwitchMatrixJob;
use crate::port::{Port, PortDirection, PortHandle};
use crate::probe::{DataProbe, ProbeKind};
use crate::ring_buffer::RingBuffer;

/// Upper bound on simultaneously active connections
pub const MAX_JOBS: usize = 256;

/// Upper bound on simultaneously active port probes
pub const MAX_PROBES: usize = 32;

/// Structural change staged by a control thread
pub(crate) enum MatrixChange {
    AddJob(Box<SwitchMatrixJob>),
    RemoveJob {
        source: PortHandle,
        sink: PortHandle,
    },
    SetCopySize(Frames),
    AttachProbe {
        id: u64,
        port: Arc<Port>,
        probe: Box<DataProbe>,
    },
    DetachProbe {
        port: PortHandle,
    },
}

/// Objects handed back to a control thread for release
pub(crate) enum Retired {
    Job(Box<SwitchMatrixJob>),
    Probe {
        id: u64,
        port: PortHandle,
        probe: Box<DataProbe>,
    },
}

/// What drives the worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerMode {
    /// Triggers come from a clock provider or from `trigger()`
    #[default]
    ExternalClock,
    /// The worker triggers itself once per period
    FreeRunning,
}

pub(crate) enum WorkerCommand {
    Tick,
    Trigger(Sender<TriggerSummary>),
    Stop,
}

/// Aggregate of one trigger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerSummary {
    pub jobs_executed: usize,
    /// Frames delivered to sinks in this trigger
    pub frames_copied: Frames,
    /// Source frames still pending across all jobs
    pub frames_still_to_consume: Frames,
}

/// Non-blocking tick handle for a clock provider
#[derive(Clone)]
pub struct MatrixClock {
    pub(crate) commands: Sender<WorkerCommand>,
}

impl MatrixClock {
    /// Request one trigger; false if the worker is gone or backlogged
    pub fn tick(&self) -> bool {
        self.commands.try_send(WorkerCommand::Tick).is_ok()
    }
}

struct PortProbe {
    id: u64,
    port: Arc<Port>,
    probe: Box<DataProbe>,
    /// Absolute ring buffer position up to which the probe has seen data
    position: u64,
}

pub(crate) struct Worker {
    changes: rtrb::Consumer<MatrixChange>,
    commands: Receiver<WorkerCommand>,
    events: EventSender<MatrixEvent>,
    stats: triple_buffer::Input<MatrixStats>,
    retire: Sender<Retired>,
    period: Duration,
    mode: WorkerMode,
    jobs: Vec<Box<SwitchMatrixJob>>,
    probes: Vec<PortProbe>,
    copy_size: Option<Frames>,
    totals: MatrixStats,
}

impl Worker {
    pub(crate) fn new(
        changes: rtrb::Consumer<MatrixChange>,
        commands: Receiver<WorkerCommand>,
        events: EventSender<MatrixEvent>,
        stats: triple_buffer::Input<MatrixStats>,
        retire: Sender<Retired>,
        period: Duration,
        mode: WorkerMode,
    ) -> Self {
        Self {
            changes,
            commands,
            events,
            stats,
            retire,
            period,
            mode,
            jobs: Vec::with_capacity(MAX_JOBS),
            probes: Vec::with_capacity(MAX_PROBES),
            copy_size: None,
            totals: MatrixStats::default(),
        }
    }

    pub(crate) fn run(mut self) {
        let mut next_tick = Instant::now() + self.period;
        loop {
            let command = match self.mode {
                WorkerMode::ExternalClock => match self.commands.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
                WorkerMode::FreeRunning => match self.commands.recv_deadline(next_tick) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => {
                        next_tick += self.period;
                        WorkerCommand::Tick
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
            };

            match command {
                WorkerCommand::Tick => {
                    self.trigger();
                }
                WorkerCommand::Trigger(reply) => {
                    let summary = self.trigger();
                    let _ = reply.send(summary);
                }
                WorkerCommand::Stop => break,
            }
        }
        tracing::debug!(
            "Switch matrix worker exiting after {} triggers",
            self.totals.triggers
        );
    }

    fn retire(&self, item: Retired) {
        // Channel full: the item is dropped here instead, off the happy path
        let _ = self.retire.try_send(item);
    }

    fn emit(&mut self, event: MatrixEvent) {
        // REAL-TIME SAFE: drop the event rather than block when the queue is full
        let _ = self.events.push(event);
    }

    fn apply_changes(&mut self) {
        while let Ok(change) = self.changes.pop() {
            match change {
                MatrixChange::AddJob(mut job) => {
                    if let Some(frames) = self.copy_size {
                        job.set_copy_size(frames);
                    }
                    let event = MatrixEvent::ConnectionEstablished {
                        source: Arc::clone(job.source().name()),
                        sink: Arc::clone(job.sink().name()),
                    };
                    if self.jobs.len() == self.jobs.capacity() {
                        self.retire(Retired::Job(job));
                        continue;
                    }
                    // Keep jobs of one source ring buffer adjacent
                    let rb = job.source_rb().id();
                    let at = self
                        .jobs
                        .iter()
                        .rposition(|j| j.source_rb().id() == rb)
                        .map_or(self.jobs.len(), |i| i + 1);
                    self.jobs.insert(at, job);
                    self.emit(event);
                }
                MatrixChange::RemoveJob { source, sink } => {
                    if let Some(i) = self
                        .jobs
                        .iter()
                        .position(|j| j.source().handle() == source && j.sink().handle() == sink)
                    {
                        let job = self.jobs.remove(i);
                        self.emit(MatrixEvent::ConnectionRemoved {
                            source: Arc::clone(job.source().name()),
                            sink: Arc::clone(job.sink().name()),
                        });
                        self.retire(Retired::Job(job));
                    }
                }
                MatrixChange::SetCopySize(frames) => {
                    self.copy_size = Some(frames);
                    for job in &mut self.jobs {
                        job.set_copy_size(frames);
                    }
                }
                MatrixChange::AttachProbe { id, port, probe } => {
                    let Some(rb) = port.ring_buffer() else {
                        continue;
                    };
                    let position = rb.write_position();
                    let name = Arc::clone(port.name());
                    if self.probes.len() == self.probes.capacity() {
                        self.retire(Retired::Probe {
                            id,
                            port: port.handle(),
                            probe,
                        });
                        continue;
                    }
                    self.probes.push(PortProbe {
                        id,
                        port,
                        probe,
                        position,
                    });
                    self.emit(MatrixEvent::ProbingStarted { port: name });
                }
                MatrixChange::DetachProbe { port } => {
                    if let Some(i) = self.probes.iter().position(|p| p.port.handle() == port) {
                        let probe = self.probes.swap_remove(i);
                        self.retire(Retired::Probe {
                            id: probe.id,
                            port,
                            probe: probe.probe,
                        });
                    }
                }
            }
        }
    }

    /// Execute every job once
    pub(crate) fn trigger(&mut self) -> TriggerSummary {
        self.apply_changes();

        let mut summary = TriggerSummary::default();
        let mut start = 0;
        while start < self.jobs.len() {
            let source_rb = Arc::clone(self.jobs[start].source_rb());
            let end = start
                + self.jobs[start..]
                    .iter()
                    .take_while(|j| j.source_rb().id() == source_rb.id())
                    .count();

            // One snapshot for the whole group so every job sees the same data
            let available = source_rb.fill_level();
            self.inject_probes(&source_rb, available);

            for job in &mut self.jobs[start..end] {
                let outcome = job.execute(available);
                summary.jobs_executed += 1;
                summary.frames_copied += outcome.frames_consumed;
                summary.frames_still_to_consume += outcome.frames_still_to_consume;
            }

            self.advance_group(start, end);
            start = end;
        }

        self.record_probes();
        self.finish_probes();

        self.totals.triggers += 1;
        self.totals.frames_copied += summary.frames_copied as u64;
        self.totals.active_jobs = self.jobs.len();
        self.stats.write(self.totals);
        summary
    }

    /// Move the shared source cursor past what every job of the group has read
    ///
    /// The carry-over is bounded by the source capacity: once the source is
    /// full, up to one copy-size of the oldest frames is discarded and the
    /// jobs that had not read them are charged.
    fn advance_group(&mut self, start: usize, end: usize) {
        let group = &self.jobs[start..end];
        let source_rb = Arc::clone(group[0].source_rb());
        let min_ahead = group.iter().map(|j| j.ahead()).min().unwrap_or(0);

        let mut advance = min_ahead;
        let fill = source_rb.fill_level();
        if fill >= source_rb.capacity() {
            let copy_size = group.iter().map(|j| j.copy_size()).max().unwrap_or(0);
            advance = advance.max(copy_size.min(fill));
        }
        if advance == 0 {
            return;
        }

        source_rb.consume(advance);
        for i in start..end {
            let lost = self.jobs[i].release(advance);
            if lost > 0 {
                self.totals.frames_dropped += lost as u64;
                self.totals.overruns += 1;
                let event = MatrixEvent::JobOverrun {
                    source: Arc::clone(self.jobs[i].source().name()),
                    sink: Arc::clone(self.jobs[i].sink().name()),
                    frames_dropped: lost,
                };
                self.emit(event);
            }
        }
    }

    /// Overwrite fresh source data with file contents
    fn inject_probes(&mut self, source_rb: &RingBuffer, available: Frames) {
        let read = source_rb.read_position();
        let end = read + available as u64;
        let capacity = source_rb.capacity() as u64;

        for tap in &mut self.probes {
            if tap.probe.kind() != ProbeKind::Inject
                || tap.port.direction() != PortDirection::Input
                || !tap
                    .port
                    .ring_buffer()
                    .is_some_and(|rb| rb.id() == source_rb.id())
            {
                continue;
            }
            let from = tap.position.max(read);
            if end <= from {
                continue;
            }
            let index = tap.port.index();
            tap.probe.inject((end - from) as Frames, |frame, channel, value| {
                let offset = ((from + frame as u64) % capacity) as Frames;
                source_rb.store_at(index + channel, offset, value);
            });
            tap.position = end;
        }
    }

    /// Copy what the matrix delivered into recording probes
    fn record_probes(&mut self) {
        for tap in &mut self.probes {
            if tap.probe.kind() != ProbeKind::Record {
                continue;
            }
            let Some(rb) = tap.port.ring_buffer() else {
                continue;
            };
            let written = rb.write_position();
            // Never look further back than the buffer still holds
            let from = tap
                .position
                .max(written.saturating_sub(rb.capacity() as u64));
            if written <= from {
                continue;
            }
            let capacity = rb.capacity() as u64;
            let index = tap.port.index();
            tap.probe.record((written - from) as Frames, |frame, channel| {
                let offset = ((from + frame as u64) % capacity) as Frames;
                rb.sample_at(index + channel, offset).unwrap_or(0.0)
            });
            tap.position = written;
        }
    }

    fn finish_probes(&mut self) {
        let mut i = 0;
        while i < self.probes.len() {
            if self.probes[i].probe.is_finished() {
                let tap = self.probes.swap_remove(i);
                self.emit(MatrixEvent::ProbingFinished {
                    port: Arc::clone(tap.port.name()),
                });
                self.retire(Retired::Probe {
                    id: tap.id,
                    port: tap.port.handle(),
                    probe: tap.probe,
                });
            } else {
                i += 1;
            }
        }
    }
}
