//! Lockless communication primitives between control threads and real-time threads.
//!
//! Control threads (management API, command dispatch) talk to the switch-matrix
//! worker and to module processing cores exclusively through the queues in this
//! crate. The real-time side only ever pops or pushes without blocking; the
//! control side may take a short uncontended lock to serialize several
//! producers onto one single-producer ring.

use std::sync::Arc;

pub use crossbeam_channel;
pub use rtrb;
pub use triple_buffer;

use parking_lot::Mutex;
use xbar_core::{Frames, Sample};

/// Events emitted by the switch-matrix worker
///
/// Names are shared `Arc<str>` handles created at setup time, so emitting an
/// event on the worker thread never allocates.
#[derive(Debug, Clone, PartialEq)]
pub enum MatrixEvent {
    /// A connection was admitted into the execution set
    ConnectionEstablished {
        /// Source port name
        source: Arc<str>,
        /// Sink port name
        sink: Arc<str>,
    },
    /// A connection was removed from the execution set
    ConnectionRemoved {
        /// Source port name
        source: Arc<str>,
        /// Sink port name
        sink: Arc<str>,
    },
    /// Source data was discarded because this connection could not keep up
    JobOverrun {
        /// Source port name
        source: Arc<str>,
        /// Sink port name
        sink: Arc<str>,
        /// Frames this connection never delivered
        frames_dropped: Frames,
    },
    /// A port probe was attached by the worker
    ProbingStarted {
        /// Probed port name
        port: Arc<str>,
    },
    /// A port probe reached its duration (or end of file) and was detached
    ProbingFinished {
        /// Probed port name
        port: Arc<str>,
    },
}

/// Events emitted by processing modules from the audio thread
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleEvent {
    /// In-place gain of a stream changed
    InPlaceGainChanged {
        /// Module instance name
        instance: Arc<str>,
        /// Stream (pin) name
        pin: Arc<str>,
        /// New gain in 1/10 dB
        gain_db10: i32,
        /// New gain as linear factor
        gain: Sample,
    },
    /// Cross-mixer gain of an input/output pair changed
    CrossGainChanged {
        /// Module instance name
        instance: Arc<str>,
        /// Input stream (pin) name
        input_pin: Arc<str>,
        /// Output stream (pin) name
        output_pin: Arc<str>,
        /// New gain in 1/10 dB
        gain_db10: i32,
        /// New gain as linear factor
        gain: Sample,
    },
    /// Volume of a stream changed
    VolumeChanged {
        /// Module instance name
        instance: Arc<str>,
        /// Stream (pin) name
        pin: Arc<str>,
        /// New volume in 1/10 dB
        volume_db10: i32,
        /// New volume as linear factor
        volume: Sample,
    },
    /// Mute state of a stream changed
    MuteChanged {
        /// Module instance name
        instance: Arc<str>,
        /// Stream (pin) name
        pin: Arc<str>,
        /// True when muted
        muted: bool,
    },
    /// A stream probe finished and was detached
    ProbingFinished {
        /// Component instance name
        instance: Arc<str>,
        /// Probed stream id
        stream_id: i32,
    },
}

/// Switch-matrix counters, published once per trigger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatrixStats {
    /// Number of executed triggers
    pub triggers: u64,
    /// Frames delivered to sinks since start
    pub frames_copied: u64,
    /// Source frames discarded because a sink lagged behind
    pub frames_dropped: u64,
    /// Number of overrun incidents
    pub overruns: u64,
    /// Jobs in the execution set after the last trigger
    pub active_jobs: usize,
}

/// Multi-producer front end of a single-producer ring
///
/// Several control threads may push; the lock only serializes producers and is
/// never taken by the consumer, which keeps a plain `rtrb::Consumer`.
pub struct ControlQueue<T> {
    producer: Mutex<rtrb::Producer<T>>,
}

impl<T> ControlQueue<T> {
    /// Push an item, handing it back if the queue is full
    pub fn push(&self, item: T) -> Result<(), T> {
        match self.producer.lock().push(item) {
            Ok(()) => Ok(()),
            Err(rtrb::PushError::Full(item)) => Err(item),
        }
    }

    /// Number of free slots right now
    pub fn free_slots(&self) -> usize {
        self.producer.lock().slots()
    }
}

/// Create a control queue (control threads -> real-time thread)
pub fn control_queue<T>(capacity: usize) -> (ControlQueue<T>, rtrb::Consumer<T>) {
    let (producer, consumer) = rtrb::RingBuffer::new(capacity);
    (
        ControlQueue {
            producer: Mutex::new(producer),
        },
        consumer,
    )
}

/// Event sender (real-time thread, never blocks; drops the event when full)
pub type EventSender<T> = rtrb::Producer<T>;

/// Event receiver shared by control threads
pub struct EventReceiver<T> {
    consumer: Mutex<rtrb::Consumer<T>>,
}

impl<T> EventReceiver<T> {
    /// Pop one event if available
    pub fn try_recv(&self) -> Option<T> {
        self.consumer.lock().pop().ok()
    }

    /// Pop every pending event
    pub fn drain(&self) -> Vec<T> {
        let mut consumer = self.consumer.lock();
        let mut events = Vec::with_capacity(consumer.slots());
        while let Ok(event) = consumer.pop() {
            events.push(event);
        }
        events
    }
}

/// Create an event channel (real-time thread -> control threads)
pub fn event_channel<T>(capacity: usize) -> (EventSender<T>, EventReceiver<T>) {
    let (producer, consumer) = rtrb::RingBuffer::new(capacity);
    (
        producer,
        EventReceiver {
            consumer: Mutex::new(consumer),
        },
    )
}

/// Create the stats channel (worker publishes, control reads the latest)
pub fn stats_channel() -> (
    triple_buffer::Input<MatrixStats>,
    triple_buffer::Output<MatrixStats>,
) {
    triple_buffer::triple_buffer(&MatrixStats::default())
}

/// Create a retire channel
///
/// Objects removed on a real-time thread are sent back here so their memory is
/// released on a control thread. Bounded, so `try_send` never allocates.
pub fn retire_channel<T>(
    capacity: usize,
) -> (crossbeam_channel::Sender<T>, crossbeam_channel::Receiver<T>) {
    crossbeam_channel::bounded(capacity)
}
