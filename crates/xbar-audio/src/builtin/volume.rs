//! Simple volume - one scalar gain and a mute switch per stream.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use xbar_comms::{ControlQueue, EventSender, ModuleEvent};
use xbar_core::{Error, Result, Sample, gain};
use xbar_plugin::{ChainEnv, CommandHandler, ModuleConfig, ProcessingCore, Properties, StreamBuffers, command_id};

use super::{GAIN_QUEUE_SIZE, MODULE_EVENT_QUEUE_SIZE, apply_module_state, pin_names};
use crate::component::{ComponentControl, GenericAudioComponent};
use crate::module::{Module, ModuleFactory, ModuleHandle};

/// Registered type name
pub const TYPE_NAME: &str = "simplevolume";

/// Initial volume of every stream, in 1/10 dB
pub const VOLUME_PROPERTY: &str = "volume";

/// Sub-operations selected by the `"cmd"` key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeCmd {
    /// `"moduleState"`: `"on"` / `"off"`
    SetModuleState,
    /// `"pin"`, `"volume"` (1/10 dB)
    SetVolume,
    /// `"pin"`, `"mute"` (0 / 1)
    SetMuteState,
    /// `"pin"`; answers `"volume"` (1/10 dB)
    GetVolume,
}

impl VolumeCmd {
    pub const COUNT: i32 = 4;

    #[must_use]
    pub const fn id(self) -> i32 {
        self as i32
    }

    fn from_id(id: i32) -> Option<Self> {
        match id {
            0 => Some(Self::SetModuleState),
            1 => Some(Self::SetVolume),
            2 => Some(Self::SetMuteState),
            3 => Some(Self::GetVolume),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeMessage {
    SetVolume { stream_id: i32, volume_db10: i32 },
    SetMute { stream_id: i32, muted: bool },
}

#[derive(Debug, Clone, Copy)]
struct StreamVolume {
    volume: Sample,
    muted: bool,
}

impl StreamVolume {
    fn gain(self) -> Sample {
        if self.muted { 0.0 } else { self.volume }
    }
}

/// Audio-thread DSP of the simple volume module
pub struct SimpleVolumeCore {
    instance: Arc<str>,
    config: ModuleConfig,
    default_volume_db10: i32,
    volumes: HashMap<i32, StreamVolume>,
    pins: HashMap<i32, Arc<str>>,
    messages: rtrb::Consumer<VolumeMessage>,
    events: EventSender<ModuleEvent>,
}

impl SimpleVolumeCore {
    pub fn new(
        instance: &str,
        config: ModuleConfig,
        messages: rtrb::Consumer<VolumeMessage>,
        events: EventSender<ModuleEvent>,
    ) -> Result<Self> {
        config.validate()?;
        let default_volume_db10 = config.properties().get_or(VOLUME_PROPERTY, 0)?;
        let pins = pin_names(&config);
        Ok(Self {
            instance: Arc::from(instance),
            config,
            default_volume_db10,
            volumes: HashMap::new(),
            pins,
            messages,
            events,
        })
    }

    /// Effective linear gain of a stream (zero while muted)
    #[must_use]
    pub fn gain(&self, stream_id: i32) -> Option<Sample> {
        self.volumes.get(&stream_id).map(|v| v.gain())
    }

    fn defaults(&self) -> HashMap<i32, StreamVolume> {
        let volume = gain::db10_to_linear(self.default_volume_db10);
        self.config
            .in_place_streams()
            .iter()
            .map(|&id| (id, StreamVolume { volume, muted: false }))
            .collect()
    }

    fn apply_messages(&mut self) -> Result<()> {
        while let Ok(message) = self.messages.pop() {
            let stream_id = match message {
                VolumeMessage::SetVolume { stream_id, .. } | VolumeMessage::SetMute { stream_id, .. } => stream_id,
            };
            let pin = self.pins.get(&stream_id).cloned();
            let (Some(slot), Some(pin)) = (self.volumes.get_mut(&stream_id), pin) else {
                return Err(Error::InvalidParam(format!(
                    "{}: stream {stream_id} has no volume",
                    self.instance
                )));
            };
            let event = match message {
                VolumeMessage::SetVolume { volume_db10, .. } => {
                    slot.volume = gain::db10_to_linear(volume_db10);
                    ModuleEvent::VolumeChanged {
                        instance: Arc::clone(&self.instance),
                        pin,
                        volume_db10,
                        volume: slot.volume,
                    }
                }
                VolumeMessage::SetMute { muted, .. } => {
                    slot.muted = muted;
                    ModuleEvent::MuteChanged {
                        instance: Arc::clone(&self.instance),
                        pin,
                        muted,
                    }
                }
            };
            let _ = self.events.push(event);
        }
        Ok(())
    }
}

impl ProcessingCore for SimpleVolumeCore {
    fn init(&mut self, _env: &ChainEnv) -> Result<()> {
        if self.config.in_place_streams().is_empty() {
            return Err(Error::InitializationFailed(format!(
                "{}: volume needs at least one in-place stream",
                self.instance
            )));
        }
        self.volumes = self.defaults();
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.volumes = self.defaults();
        Ok(())
    }

    fn process_child(&mut self, streams: &mut StreamBuffers) -> Result<()> {
        self.apply_messages()?;
        for (&stream_id, volume) in &self.volumes {
            if let Some(stream) = streams.get_mut(stream_id) {
                stream.scale(volume.gain());
            }
        }
        Ok(())
    }
}

/// Control-thread command handler of the simple volume module
pub struct SimpleVolumeCmd {
    instance: Arc<str>,
    config: ModuleConfig,
    control: Arc<ComponentControl>,
    messages: ControlQueue<VolumeMessage>,
    default_volume_db10: i32,
    volume_db10: Mutex<HashMap<i32, i32>>,
}

impl SimpleVolumeCmd {
    pub fn new(
        instance: &str,
        config: ModuleConfig,
        control: Arc<ComponentControl>,
        messages: ControlQueue<VolumeMessage>,
    ) -> Result<Self> {
        let default_volume_db10 = config.properties().get_or(VOLUME_PROPERTY, 0)?;
        let volume_db10 = config
            .in_place_streams()
            .iter()
            .map(|&id| (id, default_volume_db10))
            .collect();
        Ok(Self {
            instance: Arc::from(instance),
            config,
            control,
            messages,
            default_volume_db10,
            volume_db10: Mutex::new(volume_db10),
        })
    }

    /// Resolve `"pin"` to a stream this module controls
    fn stream_id(&self, cmd: &Properties) -> Result<i32> {
        let pin: String = cmd.get("pin")?;
        self.config
            .stream_id(&pin)
            .filter(|id| self.config.in_place_streams().contains(id))
            .ok_or_else(|| Error::InvalidParam(format!("{}: unknown pin '{pin}'", self.instance)))
    }

    fn send(&self, message: VolumeMessage) -> Result<()> {
        self.messages
            .push(message)
            .map_err(|_| Error::Failed(format!("{}: volume queue is full", self.instance)))
    }
}

impl CommandHandler for SimpleVolumeCmd {
    fn process_cmd(&self, cmd: &Properties, response: &mut Properties) -> Result<()> {
        let id = command_id(cmd, VolumeCmd::COUNT)?;
        match VolumeCmd::from_id(id) {
            Some(VolumeCmd::SetModuleState) => apply_module_state(&self.control, cmd),
            Some(VolumeCmd::SetVolume) => {
                let stream_id = self.stream_id(cmd)?;
                let volume_db10: i32 = cmd.get("volume")?;
                self.send(VolumeMessage::SetVolume {
                    stream_id,
                    volume_db10,
                })?;
                self.volume_db10.lock().insert(stream_id, volume_db10);
                tracing::debug!("{}: volume of stream {} -> {} dB/10", self.instance, stream_id, volume_db10);
                Ok(())
            }
            Some(VolumeCmd::SetMuteState) => {
                let stream_id = self.stream_id(cmd)?;
                let muted = match cmd.get::<i32>("mute")? {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(Error::InvalidParam(format!(
                            "mute must be 0 or 1, got {other}"
                        )));
                    }
                };
                self.send(VolumeMessage::SetMute { stream_id, muted })
            }
            Some(VolumeCmd::GetVolume) => {
                let stream_id = self.stream_id(cmd)?;
                let volume = self
                    .volume_db10
                    .lock()
                    .get(&stream_id)
                    .copied()
                    .unwrap_or(self.default_volume_db10);
                response.set("volume", volume);
                Ok(())
            }
            None => Err(Error::InvalidParam(format!("unknown volume command {id}"))),
        }
    }
}

/// Factory for [`TYPE_NAME`]
#[derive(Debug, Default)]
pub struct SimpleVolumeFactory;

impl ModuleFactory for SimpleVolumeFactory {
    fn type_name(&self) -> &str {
        TYPE_NAME
    }

    fn create(&self, config: &ModuleConfig, instance: &str) -> Result<Module> {
        let (queue, messages) = xbar_comms::control_queue(GAIN_QUEUE_SIZE);
        let (events_tx, events) = xbar_comms::event_channel(MODULE_EVENT_QUEUE_SIZE);

        let core = SimpleVolumeCore::new(instance, config.clone(), messages, events_tx)
            .map_err(|e| Error::InitializationFailed(format!("{instance}: {e}")))?;
        let (component, control) =
            GenericAudioComponent::new(instance, Box::new(core), &config.streams);
        let cmd = SimpleVolumeCmd::new(instance, config.clone(), Arc::clone(&control), queue)?;

        Ok(Module::new(
            component,
            ModuleHandle::new(TYPE_NAME, Arc::new(cmd), control, events),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xbar_plugin::{AudioStream, CMD_KEY};

    const ENV: ChainEnv = ChainEnv {
        frame_length: 8,
        sample_rate: 48000,
    };

    fn config() -> ModuleConfig {
        ModuleConfig::new(Properties::new().with(VOLUME_PROPERTY, -60))
            .with_stream(1, "front", 2)
            .with_stream(2, "rear", 2)
            .with_in_place(1)
            .with_in_place(2)
    }

    fn buffers() -> StreamBuffers {
        let mut front = AudioStream::new(1, "front", 2, 8);
        front.fill(1.0);
        let mut rear = AudioStream::new(2, "rear", 2, 8);
        rear.fill(1.0);
        StreamBuffers::new(vec![front, rear])
    }

    fn last_sample(streams: &StreamBuffers, id: i32) -> f32 {
        streams.get(id).unwrap().channels()[1][7]
    }

    #[test]
    fn test_default_volume_applies() {
        let module = SimpleVolumeFactory.create(&config(), "vol").unwrap();
        let (mut component, _handle) = module.into_parts();
        component.init(&ENV).unwrap();

        let mut streams = buffers();
        component.process(&mut streams).unwrap();
        assert_eq!(last_sample(&streams, 1), gain::db10_to_linear(-60));
        assert_eq!(last_sample(&streams, 2), gain::db10_to_linear(-60));
    }

    #[test]
    fn test_volume_and_mute_commands() {
        let module = SimpleVolumeFactory.create(&config(), "vol").unwrap();
        let (mut component, handle) = module.into_parts();
        component.init(&ENV).unwrap();
        let cmd = handle.command_handler();
        let mut response = Properties::new();

        cmd.process_cmd(
            &Properties::new()
                .with(CMD_KEY, VolumeCmd::SetVolume.id())
                .with("pin", "front")
                .with("volume", 0),
            &mut response,
        )
        .unwrap();
        cmd.process_cmd(
            &Properties::new()
                .with(CMD_KEY, VolumeCmd::SetMuteState.id())
                .with("pin", "rear")
                .with("mute", 1),
            &mut response,
        )
        .unwrap();

        let mut streams = buffers();
        component.process(&mut streams).unwrap();
        assert_eq!(last_sample(&streams, 1), 1.0);
        assert_eq!(last_sample(&streams, 2), 0.0);

        let events = handle.events();
        assert!(events.iter().any(|e| matches!(e, ModuleEvent::VolumeChanged { volume_db10: 0, .. })));
        assert!(events.iter().any(|e| matches!(e, ModuleEvent::MuteChanged { muted: true, .. })));

        cmd.process_cmd(
            &Properties::new()
                .with(CMD_KEY, VolumeCmd::GetVolume.id())
                .with("pin", "front"),
            &mut response,
        )
        .unwrap();
        assert_eq!(response.get::<i32>("volume"), Ok(0));

        let bad_mute = Properties::new()
            .with(CMD_KEY, VolumeCmd::SetMuteState.id())
            .with("pin", "rear")
            .with("mute", 3);
        assert!(matches!(
            cmd.process_cmd(&bad_mute, &mut response),
            Err(Error::InvalidParam(_))
        ));
        let bad_pin = Properties::new()
            .with(CMD_KEY, VolumeCmd::GetVolume.id())
            .with("pin", "center");
        assert!(matches!(
            cmd.process_cmd(&bad_pin, &mut response),
            Err(Error::InvalidParam(_))
        ));
    }

    #[test]
    fn test_needs_in_place_stream() {
        let config = ModuleConfig::default().with_stream(1, "front", 2);
        let module = SimpleVolumeFactory.create(&config, "vol").unwrap();
        let (mut component, _handle) = module.into_parts();
        assert!(matches!(
            component.init(&ENV),
            Err(Error::InitializationFailed(_))
        ));
    }
}
