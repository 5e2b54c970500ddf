//! Routing engine - the process root that owns every part of a setup.
//!
//! The engine builds devices, the switch matrix, zones and modules from a
//! [`Setup`], keeps the control-side handles, and hands the real-time parts
//! to the [`PeriodClock`] while running.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use xbar_comms::{MatrixEvent, MatrixStats, ModuleEvent};
use xbar_core::{Error, Frames, Result, SampleRate};
use xbar_plugin::{ChainEnv, Properties};

use crate::chain::AudioChain;
use crate::clock::{ClockCounters, ClockLoad, MatrixDrive, PeriodClock};
use crate::component::ProbeTap;
use crate::device::{ClockType, Device, VirtualDevice};
use crate::dispatch::CmdDispatcher;
use crate::module::{ModuleHandle, ModuleRegistry};
use crate::port::Port;
use crate::setup::Setup;
use crate::switch_matrix::{SwitchMatrix, WorkerMode};
use crate::zone::ProcessingZone;

/// A routing server built from a setup
pub struct RoutingEngine {
    name: String,
    registry: ModuleRegistry,
    dispatcher: Arc<CmdDispatcher>,
    matrix: Arc<SwitchMatrix>,
    devices: Vec<Arc<Device>>,
    ports: HashMap<String, Arc<Port>>,
    modules: BTreeMap<String, ModuleHandle>,
    sample_rate: SampleRate,
    period: Duration,
    /// What the clock drives, while the clock is stopped
    idle: Option<ClockLoad>,
    clock: Option<PeriodClock>,
    /// Counters of synchronous `run_periods` calls
    counters: ClockCounters,
}

impl RoutingEngine {
    /// Build an engine with the built-in module types
    pub fn new(setup: &Setup) -> Result<Self> {
        Self::with_registry(setup, ModuleRegistry::with_builtins())
    }

    /// Build an engine creating modules through `registry`
    pub fn with_registry(setup: &Setup, registry: ModuleRegistry) -> Result<Self> {
        setup.validate()?;
        tracing::info!("Building routing engine '{}'", setup.name);

        let matrix = Arc::new(SwitchMatrix::new());
        let mode = if setup.matrix.free_running {
            WorkerMode::FreeRunning
        } else {
            WorkerMode::ExternalClock
        };
        matrix.init_with_mode(
            &setup.matrix.worker_name,
            setup.matrix.period_size,
            setup.matrix.sample_rate,
            mode,
        )?;
        if let Some(frames) = setup.matrix.copy_size {
            matrix.set_copy_size(frames)?;
        }

        let mut ports = HashMap::new();
        let mut devices = Vec::with_capacity(setup.devices.len());
        for params in &setup.devices {
            let device = Arc::new(Device::new(params.clone())?);
            for port in device.ports() {
                ports.insert(port.name().to_string(), port);
            }
            devices.push(device);
        }

        let dispatcher = Arc::new(CmdDispatcher::new());
        let mut modules = BTreeMap::new();
        let mut zones = Vec::with_capacity(setup.zones.len());
        for zone_setup in &setup.zones {
            let env = ChainEnv {
                frame_length: zone_setup.frame_length,
                sample_rate: setup.matrix.sample_rate,
            };
            let mut chain = AudioChain::new(&zone_setup.name, env, &zone_setup.streams)?;
            for module_setup in &zone_setup.modules {
                let module = registry.create(
                    &module_setup.type_name,
                    &module_setup.config,
                    &module_setup.instance,
                )?;
                let (component, handle) = module.into_parts();
                chain.add(component)?;
                dispatcher.register(&module_setup.instance, handle.command_handler())?;
                modules.insert(module_setup.instance.clone(), handle);
            }

            let zone = ProcessingZone::new(
                chain,
                &zone_setup.input,
                &zone_setup.output,
                zone_setup.num_periods,
            )?;
            for port in [zone.input(), zone.output()] {
                ports.insert(port.name().to_string(), Arc::clone(port));
            }
            zones.push(zone);
        }

        for connection in &setup.connections {
            let source = lookup(&ports, &connection.source)?;
            let sink = lookup(&ports, &connection.sink)?;
            matrix.connect(source, sink)?;
        }

        let period = clock_period(&devices, setup.matrix.period_size, setup.matrix.sample_rate);
        let idle = ClockLoad {
            matrix: Arc::clone(&matrix),
            drive: if setup.matrix.free_running {
                MatrixDrive::FreeRunning
            } else {
                MatrixDrive::Synchronous
            },
            devices: devices
                .iter()
                .map(|d| VirtualDevice::new(Arc::clone(d)))
                .collect(),
            zones,
        };

        tracing::info!(
            "Routing engine '{}' ready: {} devices, {} zones, {} modules, {} connections",
            setup.name,
            devices.len(),
            idle.zones.len(),
            modules.len(),
            setup.connections.len()
        );

        Ok(Self {
            name: setup.name.clone(),
            registry,
            dispatcher,
            matrix,
            devices,
            ports,
            modules,
            sample_rate: setup.matrix.sample_rate,
            period,
            idle: Some(idle),
            clock: None,
            counters: ClockCounters::default(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<CmdDispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn matrix(&self) -> &Arc<SwitchMatrix> {
        &self.matrix
    }

    /// Wall-clock duration of one period
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    #[must_use]
    pub fn device(&self, name: &str) -> Option<&Arc<Device>> {
        self.devices.iter().find(|d| d.name().as_ref() == name)
    }

    #[must_use]
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    #[must_use]
    pub fn port(&self, name: &str) -> Option<&Arc<Port>> {
        self.ports.get(name)
    }

    /// All port names, sorted
    #[must_use]
    pub fn port_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.ports.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn module(&self, instance: &str) -> Option<&ModuleHandle> {
        self.modules.get(instance)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.clock.is_some()
    }

    /// Hand the real-time parts to the period clock thread
    pub fn start(&mut self) -> Result<()> {
        let load = self
            .idle
            .take()
            .ok_or_else(|| Error::Failed(format!("engine '{}' is already running", self.name)))?;
        match PeriodClock::start("xbar-clock", self.period, load) {
            Ok(clock) => {
                self.clock = Some(clock);
                tracing::info!("Routing engine '{}' started", self.name);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Routing engine '{}' failed to start: {}", self.name, e);
                Err(e)
            }
        }
    }

    /// Stop the clock thread and take the real-time parts back
    pub fn stop(&mut self) -> Result<()> {
        let mut clock = self
            .clock
            .take()
            .ok_or_else(|| Error::Failed(format!("engine '{}' is not running", self.name)))?;
        self.idle = Some(clock.stop()?);
        tracing::info!("Routing engine '{}' stopped", self.name);
        Ok(())
    }

    /// Run `count` periods on the calling thread, without pacing
    pub fn run_periods(&mut self, count: usize) -> Result<()> {
        let load = self.idle.as_mut().ok_or_else(|| {
            Error::Failed(format!("engine '{}' is running on its clock", self.name))
        })?;
        for _ in 0..count {
            load.run_period(&self.counters);
        }
        Ok(())
    }

    /// Periods run so far, by the clock thread or by `run_periods`
    #[must_use]
    pub fn periods(&self) -> u64 {
        self.counters.periods() + self.clock.as_ref().map_or(0, |c| c.counters().periods())
    }

    /// Send a command to a module instance
    pub fn dispatch_cmd(&self, instance: &str, cmd: &Properties) -> Result<Properties> {
        let mut response = Properties::new();
        self.dispatcher.dispatch_cmd(instance, cmd, &mut response)?;
        Ok(response)
    }

    pub fn connect(&self, source: &str, sink: &str) -> Result<()> {
        self.matrix
            .connect(lookup(&self.ports, source)?, lookup(&self.ports, sink)?)
    }

    pub fn disconnect(&self, source: &str, sink: &str) -> Result<()> {
        self.matrix
            .disconnect(lookup(&self.ports, source)?, lookup(&self.ports, sink)?)
    }

    #[must_use]
    pub fn connections(&self) -> Vec<(Arc<str>, Arc<str>)> {
        self.matrix.connections()
    }

    /// Record (output port) or inject (input port) `<prefix>.wav`
    pub fn start_probing(&self, port: &str, file_prefix: &str, inject: bool, seconds: u32) -> Result<()> {
        let port = lookup(&self.ports, port)?;
        let sample_rate = port
            .owner()
            .and_then(|owner| self.device(owner))
            .map_or(self.sample_rate, |d| d.sample_rate());
        self.matrix
            .start_probing(port, file_prefix, inject, seconds, sample_rate)
    }

    pub fn stop_probing(&self, port: &str) -> Result<()> {
        self.matrix.stop_probing(lookup(&self.ports, port)?)
    }

    /// Probe one stream inside a module
    pub fn start_stream_probe(
        &self,
        instance: &str,
        file_prefix: &str,
        inject: bool,
        seconds: u32,
        stream_id: i32,
        tap: ProbeTap,
    ) -> Result<()> {
        self.module_handle(instance)?
            .control()
            .start_probe(file_prefix, inject, seconds, stream_id, tap)
    }

    pub fn stop_stream_probe(&self, instance: &str, stream_id: i32) -> Result<()> {
        self.module_handle(instance)?.control().stop_probe(stream_id)
    }

    fn module_handle(&self, instance: &str) -> Result<&ModuleHandle> {
        self.modules
            .get(instance)
            .ok_or_else(|| Error::ObjectNotFound(format!("module instance '{instance}'")))
    }

    /// Pending switch matrix events
    #[must_use]
    pub fn matrix_events(&self) -> Vec<MatrixEvent> {
        self.matrix.events()
    }

    /// Pending events of every module, grouped by instance name
    #[must_use]
    pub fn module_events(&self) -> Vec<ModuleEvent> {
        self.modules.values().flat_map(ModuleHandle::events).collect()
    }

    #[must_use]
    pub fn stats(&self) -> MatrixStats {
        self.matrix.stats()
    }
}

impl Drop for RoutingEngine {
    fn drop(&mut self) {
        if self.clock.is_some() {
            if let Err(e) = self.stop() {
                tracing::error!("Routing engine '{}' did not stop cleanly: {}", self.name, e);
            }
        }
        // Zones and devices go before the matrix worker is joined
        self.idle = None;
        self.matrix.destroy();
    }
}

fn lookup<'a>(ports: &'a HashMap<String, Arc<Port>>, name: &str) -> Result<&'a Arc<Port>> {
    ports
        .get(name)
        .ok_or_else(|| Error::ObjectNotFound(format!("port '{name}'")))
}

/// Period of the clock-providing device, or the matrix period without one
fn clock_period(devices: &[Arc<Device>], period_size: Frames, sample_rate: SampleRate) -> Duration {
    let (frames, rate) = devices
        .iter()
        .find(|d| d.clock() == ClockType::Provider)
        .map_or((period_size, sample_rate), |d| (d.period_size(), d.sample_rate()));
    Duration::from_secs_f64(frames as f64 / f64::from(rate))
}
