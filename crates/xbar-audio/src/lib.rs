//! Real-time audio switching and mixing engine.
//!
//! This crate provides the ring buffer transport, ports and devices, the
//! switch matrix with its worker thread, the generic audio component core
//! with the built-in modules, command dispatch, and the routing engine that
//! ties a setup file together.

pub mod builtin;
pub mod chain;
pub mod clock;
pub mod component;
pub mod device;
pub mod dispatch;
pub mod engine;
pub mod module;
pub mod port;
pub mod probe;
pub mod ring_buffer;
pub mod setup;
pub mod switch_matrix;
pub mod zone;

pub use chain::AudioChain;
pub use clock::{ClockLoad, MatrixDrive, PeriodClock};
pub use component::{ComponentControl, GenericAudioComponent, ProbeTap, ProcessingState};
pub use device::{ClockType, Device, DeviceParams, DeviceRole, VirtualDevice};
pub use dispatch::CmdDispatcher;
pub use engine::RoutingEngine;
pub use module::{Module, ModuleFactory, ModuleHandle, ModuleRegistry};
pub use port::{Port, PortDirection, PortHandle, PortParams};
pub use ring_buffer::{AccessDirection, AccessWindow, AudioArea, Layout, RingBuffer, RingBufferParams};
pub use setup::{Setup, SetupError};
pub use switch_matrix::{SwitchMatrix, SwitchMatrixJob, TriggerSummary, WorkerMode};
pub use zone::{ProcessingZone, ZonePort};
