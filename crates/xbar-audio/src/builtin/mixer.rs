//! Simple mixer - in-place gains and gain-weighted cross mixing.

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
pub const TYPE_NAME: &str = "simplemixer";

/// Default gain for every in-place stream and mapping, in 1/10 dB
pub const GAIN_PROPERTY: &str = "gain";

/// Sub-operations selected by the `"cmd"` key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerCmd {
    /// `"moduleState"`: `"on"` / `"off"`
    SetModuleState,
    /// `"pin"`, `"gain"` (1/10 dB)
    SetInPlaceGain,
    /// `"input_pin"`, `"output_pin"`, `"gain"` (1/10 dB)
    SetXMixerGain,
    /// `"pin"`; answers `"gain"` (1/10 dB)
    GetInPlaceGain,
}

impl MixerCmd {
    pub const COUNT: i32 = 4;

    #[must_use]
    pub const fn id(self) -> i32 {
        self as i32
    }

    fn from_id(id: i32) -> Option<Self> {
        match id {
            0 => Some(Self::SetModuleState),
            1 => Some(Self::SetInPlaceGain),
            2 => Some(Self::SetXMixerGain),
            3 => Some(Self::GetInPlaceGain),
            _ => None,
        }
    }
}

/// Gain update queued from a control thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerMessage {
    SetInPlaceGain { stream_id: i32, gain_db10: i32 },
    SetCrossGain { input: i32, output: i32, gain_db10: i32 },
}

/// Audio-thread DSP of the simple mixer
///
/// ## Signal Flow
///
/// ```text
/// in-place stream --[gain]--> same stream
///
/// input A --[gain A->O]--\
///                          (+)--> output O
/// input B --[gain B->O]--/
/// ```
///
/// The first mapped input of an output assigns, later inputs accumulate, in
/// configuration order.
pub struct SimpleMixerCore {
    instance: Arc<str>,
    config: ModuleConfig,
    default_gain_db10: i32,
    in_place_gains: HashMap<i32, Sample>,
    cross_gains: HashMap<(i32, i32), Sample>,
    outputs: Vec<(i32, Vec<i32>)>,
    pins: HashMap<i32, Arc<str>>,
    messages: rtrb::Consumer<MixerMessage>,
    events: EventSender<ModuleEvent>,
    missing_gains: u64,
}

impl SimpleMixerCore {
    pub fn new(
        instance: &str,
        config: ModuleConfig,
        messages: rtrb::Consumer<MixerMessage>,
        events: EventSender<ModuleEvent>,
    ) -> Result<Self> {
        config.validate()?;
        let default_gain_db10 = config.properties().get_or(GAIN_PROPERTY, 0)?;
        let pins = pin_names(&config);
        Ok(Self {
            instance: Arc::from(instance),
            config,
            default_gain_db10,
            in_place_gains: HashMap::new(),
            cross_gains: HashMap::new(),
            outputs: Vec::new(),
            pins,
            messages,
            events,
            missing_gains: 0,
        })
    }

    /// Mappings mixed as silence because their cross gain was missing
    #[must_use]
    pub fn missing_gains(&self) -> u64 {
        self.missing_gains
    }

    /// Linear in-place gain of a stream, if it is processed in place
    #[must_use]
    pub fn in_place_gain(&self, stream_id: i32) -> Option<Sample> {
        self.in_place_gains.get(&stream_id).copied()
    }

    /// Linear cross gain of a mapping
    #[must_use]
    pub fn cross_gain(&self, input: i32, output: i32) -> Option<Sample> {
        self.cross_gains.get(&(input, output)).copied()
    }

    fn pin(&self, stream_id: i32) -> Arc<str> {
        self.pins
            .get(&stream_id)
            .cloned()
            .unwrap_or_else(|| Arc::from(""))
    }

    /// Apply queued gain changes; an unknown stream aborts the period
    fn apply_messages(&mut self) -> Result<()> {
        while let Ok(message) = self.messages.pop() {
            match message {
                MixerMessage::SetInPlaceGain {
                    stream_id,
                    gain_db10,
                } => {
                    let Some(slot) = self.in_place_gains.get_mut(&stream_id) else {
                        return Err(Error::InvalidParam(format!(
                            "stream {stream_id} is not processed in place"
                        )));
                    };
                    let linear = gain::db10_to_linear(gain_db10);
                    *slot = linear;
                    let event = ModuleEvent::InPlaceGainChanged {
                        instance: Arc::clone(&self.instance),
                        pin: self.pin(stream_id),
                        gain_db10,
                        gain: linear,
                    };
                    let _ = self.events.push(event);
                }
                MixerMessage::SetCrossGain {
                    input,
                    output,
                    gain_db10,
                } => {
                    let Some(slot) = self.cross_gains.get_mut(&(input, output)) else {
                        return Err(Error::InvalidParam(format!(
                            "no mapping from stream {input} to stream {output}"
                        )));
                    };
                    let linear = gain::db10_to_linear(gain_db10);
                    *slot = linear;
                    let event = ModuleEvent::CrossGainChanged {
                        instance: Arc::clone(&self.instance),
                        input_pin: self.pin(input),
                        output_pin: self.pin(output),
                        gain_db10,
                        gain: linear,
                    };
                    let _ = self.events.push(event);
                }
            }
        }
        Ok(())
    }
}

impl ProcessingCore for SimpleMixerCore {
    fn init(&mut self, _env: &ChainEnv) -> Result<()> {
        let default_gain = gain::db10_to_linear(self.default_gain_db10);

        self.in_place_gains = self
            .config
            .in_place_streams()
            .iter()
            .map(|&id| (id, default_gain))
            .collect();

        self.cross_gains.clear();
        for mapping in self.config.mappings() {
            if mapping.input == mapping.output {
                return Err(Error::InitializationFailed(format!(
                    "{}: stream {} is mapped onto itself",
                    self.instance, mapping.input
                )));
            }
            if self
                .cross_gains
                .insert((mapping.input, mapping.output), default_gain)
                .is_some()
            {
                return Err(Error::InitializationFailed(format!(
                    "{}: duplicate mapping {} -> {}",
                    self.instance, mapping.input, mapping.output
                )));
            }
        }
        self.outputs = self.config.outputs_with_inputs();

        tracing::debug!(
            "Mixer '{}': {} in-place streams, {} mappings, default gain {} dB/10",
            self.instance,
            self.in_place_gains.len(),
            self.cross_gains.len(),
            self.default_gain_db10
        );
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let default_gain = gain::db10_to_linear(self.default_gain_db10);
        self.in_place_gains.values_mut().for_each(|g| *g = default_gain);
        self.cross_gains.values_mut().for_each(|g| *g = default_gain);
        Ok(())
    }

    fn process_child(&mut self, streams: &mut StreamBuffers) -> Result<()> {
        self.apply_messages()?;

        for &stream_id in self.config.in_place_streams() {
            let gain = self.in_place_gains.get(&stream_id).copied().unwrap_or(0.0);
            if let Some(stream) = streams.get_mut(stream_id) {
                stream.scale(gain);
            }
        }

        for (output, inputs) in &self.outputs {
            for (position, input) in inputs.iter().enumerate() {
                let gain = match self.cross_gains.get(&(*input, *output)) {
                    Some(gain) => *gain,
                    None => {
                        self.missing_gains += 1;
                        0.0
                    }
                };
                let Some((source, target)) = streams.split_pair(*input, *output) else {
                    continue;
                };
                for (ch, out) in target.channels_mut().iter_mut().enumerate() {
                    let src = source.channels().get(ch);
                    for (frame, sample) in out.iter_mut().enumerate() {
                        let value = src.and_then(|c| c.get(frame)).copied().unwrap_or(0.0) * gain;
                        if position == 0 {
                            *sample = value;
                        } else {
                            *sample += value;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Control-thread command handler of the simple mixer
pub struct SimpleMixerCmd {
    instance: Arc<str>,
    config: ModuleConfig,
    control: Arc<ComponentControl>,
    messages: ControlQueue<MixerMessage>,
    /// Last requested in-place gains (1/10 dB) answered by `GetInPlaceGain`
    in_place_db10: Mutex<HashMap<i32, i32>>,
}

impl SimpleMixerCmd {
    pub fn new(
        instance: &str,
        config: ModuleConfig,
        control: Arc<ComponentControl>,
        messages: ControlQueue<MixerMessage>,
    ) -> Result<Self> {
        let default_gain_db10 = config.properties().get_or(GAIN_PROPERTY, 0)?;
        let in_place_db10 = config
            .in_place_streams()
            .iter()
            .map(|&id| (id, default_gain_db10))
            .collect();
        Ok(Self {
            instance: Arc::from(instance),
            config,
            control,
            messages,
            in_place_db10: Mutex::new(in_place_db10),
        })
    }

    fn stream_id(&self, cmd: &Properties, key: &str) -> Result<i32> {
        let pin: String = cmd.get(key)?;
        self.config.stream_id(&pin).ok_or_else(|| {
            Error::InvalidParam(format!("{}: unknown pin '{pin}'", self.instance))
        })
    }

    fn send(&self, message: MixerMessage) -> Result<()> {
        self.messages
            .push(message)
            .map_err(|_| Error::Failed(format!("{}: gain queue is full", self.instance)))
    }

    fn set_in_place_gain(&self, cmd: &Properties) -> Result<()> {
        let stream_id = self.stream_id(cmd, "pin")?;
        let gain_db10: i32 = cmd.get("gain")?;
        let mut mirror = self.in_place_db10.lock();
        let Some(current) = mirror.get_mut(&stream_id) else {
            return Err(Error::InvalidParam(format!(
                "{}: stream {stream_id} is not processed in place",
                self.instance
            )));
        };
        self.send(MixerMessage::SetInPlaceGain {
            stream_id,
            gain_db10,
        })?;
        *current = gain_db10;
        tracing::debug!("{}: in-place gain of stream {} -> {} dB/10", self.instance, stream_id, gain_db10);
        Ok(())
    }

    fn set_cross_gain(&self, cmd: &Properties) -> Result<()> {
        let input = self.stream_id(cmd, "input_pin")?;
        let output = self.stream_id(cmd, "output_pin")?;
        let gain_db10: i32 = cmd.get("gain")?;
        if !self
            .config
            .mappings()
            .iter()
            .any(|m| m.input == input && m.output == output)
        {
            return Err(Error::InvalidParam(format!(
                "{}: no mapping from stream {input} to stream {output}",
                self.instance
            )));
        }
        self.send(MixerMessage::SetCrossGain {
            input,
            output,
            gain_db10,
        })?;
        tracing::debug!("{}: cross gain {} -> {} set to {} dB/10", self.instance, input, output, gain_db10);
        Ok(())
    }

    fn get_in_place_gain(&self, cmd: &Properties, response: &mut Properties) -> Result<()> {
        let stream_id = self.stream_id(cmd, "pin")?;
        let gain_db10 = self.in_place_db10.lock().get(&stream_id).copied().ok_or_else(|| {
            Error::InvalidParam(format!(
                "{}: stream {stream_id} is not processed in place",
                self.instance
            ))
        })?;
        response.set("gain", gain_db10);
        Ok(())
    }
}

impl CommandHandler for SimpleMixerCmd {
    fn process_cmd(&self, cmd: &Properties, response: &mut Properties) -> Result<()> {
        let id = command_id(cmd, MixerCmd::COUNT)?;
        match MixerCmd::from_id(id) {
            Some(MixerCmd::SetModuleState) => apply_module_state(&self.control, cmd),
            Some(MixerCmd::SetInPlaceGain) => self.set_in_place_gain(cmd),
            Some(MixerCmd::SetXMixerGain) => self.set_cross_gain(cmd),
            Some(MixerCmd::GetInPlaceGain) => self.get_in_place_gain(cmd, response),
            None => Err(Error::InvalidParam(format!("unknown mixer command {id}"))),
        }
    }
}

/// Factory for [`TYPE_NAME`]
#[derive(Debug, Default)]
pub struct SimpleMixerFactory;

impl ModuleFactory for SimpleMixerFactory {
    fn type_name(&self) -> &str {
        TYPE_NAME
    }

    fn create(&self, config: &ModuleConfig, instance: &str) -> Result<Module> {
        let (queue, messages) = xbar_comms::control_queue(GAIN_QUEUE_SIZE);
        let (events_tx, events) = xbar_comms::event_channel(MODULE_EVENT_QUEUE_SIZE);

        let core = SimpleMixerCore::new(instance, config.clone(), messages, events_tx)
            .map_err(|e| Error::InitializationFailed(format!("{instance}: {e}")))?;
        let (component, control) =
            GenericAudioComponent::new(instance, Box::new(core), &config.streams);
        let cmd = SimpleMixerCmd::new(instance, config.clone(), Arc::clone(&control), queue)?;

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
        frame_length: 4,
        sample_rate: 48000,
    };

    fn config() -> ModuleConfig {
        ModuleConfig::new(Properties::new().with(GAIN_PROPERTY, 0))
            .with_stream(1, "nav", 1)
            .with_stream(2, "media", 1)
            .with_stream(3, "out", 1)
            .with_stream(4, "solo", 1)
            .with_in_place(1)
            .with_mapping(1, 3)
            .with_mapping(2, 3)
            .with_mapping(2, 4)
    }

    struct Fixture {
        core: SimpleMixerCore,
        queue: ControlQueue<MixerMessage>,
        events: xbar_comms::EventReceiver<ModuleEvent>,
    }

    fn fixture(config: ModuleConfig) -> Fixture {
        let (queue, messages) = xbar_comms::control_queue(8);
        let (events_tx, events) = xbar_comms::event_channel(8);
        let mut core = SimpleMixerCore::new("mixer", config, messages, events_tx).unwrap();
        core.init(&ENV).unwrap();
        Fixture {
            core,
            queue,
            events,
        }
    }

    fn streams(nav: [f32; 4], media: [f32; 4]) -> StreamBuffers {
        let mut nav_stream = AudioStream::new(1, "nav", 1, 4);
        nav_stream.channels_mut()[0].copy_from_slice(&nav);
        let mut media_stream = AudioStream::new(2, "media", 1, 4);
        media_stream.channels_mut()[0].copy_from_slice(&media);
        let mut out = AudioStream::new(3, "out", 1, 4);
        out.fill(9.0);
        let mut solo = AudioStream::new(4, "solo", 1, 4);
        solo.fill(9.0);
        StreamBuffers::new(vec![nav_stream, media_stream, out, solo])
    }

    fn samples(streams: &StreamBuffers, id: i32) -> Vec<f32> {
        streams.get(id).unwrap().channels()[0].clone()
    }

    #[test]
    fn test_in_place_gain_scales_stream() {
        let mut fx = fixture(config());
        fx.queue
            .push(MixerMessage::SetInPlaceGain {
                stream_id: 1,
                gain_db10: -60,
            })
            .unwrap();

        let mut buffers = streams([0.5, -0.25, 1.0, 0.0], [0.0; 4]);
        fx.core.process_child(&mut buffers).unwrap();

        let g = gain::db10_to_linear(-60);
        assert_eq!(fx.core.in_place_gain(1), Some(g));
        assert_eq!(samples(&buffers, 1), vec![0.5 * g, -0.25 * g, 1.0 * g, 0.0]);
        assert!(matches!(
            fx.events.drain().as_slice(),
            [ModuleEvent::InPlaceGainChanged { gain_db10: -60, pin, .. }] if &**pin == "nav"
        ));
    }

    #[test]
    fn test_silence_default_gain_is_exact_zero() {
        let config = config();
        let config = ModuleConfig {
            properties: Properties::new().with(GAIN_PROPERTY, -1500),
            ..config
        };
        let mut fx = fixture(config);
        let mut buffers = streams([0.5, 0.7, -1.0, 0.1], [0.3; 4]);
        fx.core.process_child(&mut buffers).unwrap();
        assert_eq!(samples(&buffers, 1), vec![0.0; 4]);
        assert_eq!(samples(&buffers, 4), vec![0.0; 4]);
    }

    #[test]
    fn test_overlap_add_first_assigns_then_accumulates() {
        let mut fx = fixture(config());
        fx.queue
            .push(MixerMessage::SetCrossGain {
                input: 1,
                output: 3,
                gain_db10: -60,
            })
            .unwrap();
        fx.queue
            .push(MixerMessage::SetCrossGain {
                input: 2,
                output: 3,
                gain_db10: -120,
            })
            .unwrap();
        fx.queue
            .push(MixerMessage::SetCrossGain {
                input: 2,
                output: 4,
                gain_db10: -20,
            })
            .unwrap();
        // Keep the nav stream unscaled so it feeds the mix as written
        fx.queue
            .push(MixerMessage::SetInPlaceGain {
                stream_id: 1,
                gain_db10: 0,
            })
            .unwrap();

        let a = [0.1, 0.2, -0.3, 0.4];
        let b = [0.5, -0.6, 0.7, 0.05];
        let mut buffers = streams(a, b);
        fx.core.process_child(&mut buffers).unwrap();

        let (ga, gb) = (gain::db10_to_linear(-60), gain::db10_to_linear(-120));
        let out = samples(&buffers, 3);
        for i in 0..4 {
            assert_eq!(out[i], a[i] * ga + b[i] * gb);
        }

        // A single mapped input overwrites the stale output exactly once
        let g = gain::db10_to_linear(-20);
        let solo = samples(&buffers, 4);
        for i in 0..4 {
            assert_eq!(solo[i], b[i] * g);
        }
    }

    #[test]
    fn test_missing_cross_gain_mixes_silence_and_counts() {
        let mut fx = fixture(config());
        fx.core.cross_gains.remove(&(2, 4));

        let mut buffers = streams([0.5; 4], [0.3; 4]);
        fx.core.process_child(&mut buffers).unwrap();
        fx.core.process_child(&mut buffers).unwrap();

        assert_eq!(samples(&buffers, 4), vec![0.0; 4]);
        assert_eq!(fx.core.missing_gains(), 2);
        assert!(fx.events.drain().is_empty());
    }

    #[test]
    fn test_unknown_stream_message_aborts_period() {
        let mut fx = fixture(config());
        fx.queue
            .push(MixerMessage::SetInPlaceGain {
                stream_id: 2,
                gain_db10: -60,
            })
            .unwrap();
        let mut buffers = streams([0.5; 4], [0.5; 4]);
        assert!(matches!(
            fx.core.process_child(&mut buffers),
            Err(Error::InvalidParam(_))
        ));
        assert_eq!(samples(&buffers, 3), vec![9.0; 4]);

        // Next period runs normally
        fx.core.process_child(&mut buffers).unwrap();
        assert_eq!(samples(&buffers, 3), vec![1.0; 4]);
    }

    #[test]
    fn test_duplicate_mapping_fails_init() {
        let (_queue, messages) = xbar_comms::control_queue(8);
        let (events_tx, _events) = xbar_comms::event_channel(8);
        let mut core =
            SimpleMixerCore::new("mixer", config().with_mapping(1, 3), messages, events_tx).unwrap();
        assert!(matches!(
            core.init(&ENV),
            Err(Error::InitializationFailed(_))
        ));
    }

    #[test]
    fn test_commands_through_module() {
        let module = SimpleMixerFactory.create(&config(), "mixer").unwrap();
        let (mut component, handle) = module.into_parts();
        component.init(&ENV).unwrap();
        let cmd = handle.command_handler();
        let mut response = Properties::new();

        let set = Properties::new()
            .with(CMD_KEY, MixerCmd::SetInPlaceGain.id())
            .with("pin", "nav")
            .with("gain", -30);
        cmd.process_cmd(&set, &mut response).unwrap();

        let get = Properties::new()
            .with(CMD_KEY, MixerCmd::GetInPlaceGain.id())
            .with("pin", "nav");
        cmd.process_cmd(&get, &mut response).unwrap();
        assert_eq!(response.get::<i32>("gain"), Ok(-30));

        let bad_pin = Properties::new()
            .with(CMD_KEY, MixerCmd::SetInPlaceGain.id())
            .with("pin", "media")
            .with("gain", -30);
        assert!(matches!(
            cmd.process_cmd(&bad_pin, &mut response),
            Err(Error::InvalidParam(_))
        ));

        let cross = Properties::new()
            .with(CMD_KEY, MixerCmd::SetXMixerGain.id())
            .with("input_pin", "media")
            .with("output_pin", "out")
            .with("gain", -1440);
        cmd.process_cmd(&cross, &mut response).unwrap();

        let mut buffers = streams([1.0; 4], [1.0; 4]);
        component.process(&mut buffers).unwrap();
        let g = gain::db10_to_linear(-30);
        assert_eq!(samples(&buffers, 3), vec![g; 4]);
        assert_eq!(handle.events().len(), 2);

        let off = Properties::new()
            .with(CMD_KEY, MixerCmd::SetModuleState.id())
            .with("moduleState", "off");
        cmd.process_cmd(&off, &mut response).unwrap();
        let mut buffers = streams([1.0; 4], [1.0; 4]);
        component.process(&mut buffers).unwrap();
        assert_eq!(samples(&buffers, 3), vec![9.0; 4]);

        let out_of_range = Properties::new().with(CMD_KEY, MixerCmd::COUNT);
        assert!(cmd.process_cmd(&out_of_range, &mut response).is_err());
    }
}
