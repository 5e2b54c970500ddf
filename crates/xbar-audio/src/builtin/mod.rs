//! Built-in processing modules.
//!
//! Both modules follow the same split: a core that runs on the audio thread
//! and a command handler that runs on control threads. The two only talk
//! through a bounded message queue (control → audio) and an event queue
//! (audio → control).

pub mod mixer;
pub mod volume;

use std::collections::HashMap;
use std::sync::Arc;

use xbar_core::{Error, Result};
use xbar_plugin::{ModuleConfig, Properties};

use crate::component::ComponentControl;
use crate::module::ModuleFactory;

/// Capacity of the control → audio gain queue of one module
pub(crate) const GAIN_QUEUE_SIZE: usize = 64;

/// Capacity of the audio → control event queue of one module
pub(crate) const MODULE_EVENT_QUEUE_SIZE: usize = 128;

/// Handle the `"moduleState"` command shared by all modules
pub(crate) fn apply_module_state(control: &ComponentControl, cmd: &Properties) -> Result<()> {
    let state: String = cmd.get("moduleState")?;
    match state.as_str() {
        "on" => control.enable_processing(),
        "off" => control.disable_processing(),
        other => {
            return Err(Error::InvalidParam(format!(
                "moduleState must be \"on\" or \"off\", got \"{other}\""
            )));
        }
    }
    Ok(())
}

/// Stream id → pin name, used to label events
pub(crate) fn pin_names(config: &ModuleConfig) -> HashMap<i32, Arc<str>> {
    config
        .streams
        .iter()
        .map(|s| (s.id, Arc::from(s.name.as_str())))
        .collect()
}

/// Factories of every built-in module type
#[must_use]
pub fn factories() -> Vec<Arc<dyn ModuleFactory>> {
    vec![
        Arc::new(mixer::SimpleMixerFactory),
        Arc::new(volume::SimpleVolumeFactory),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{GenericAudioComponent, ProcessingState};
    use xbar_plugin::{ChainEnv, ProcessingCore, StreamBuffers};

    struct Passthrough;

    impl ProcessingCore for Passthrough {
        fn init(&mut self, _env: &ChainEnv) -> Result<()> {
            Ok(())
        }

        fn reset(&mut self) -> Result<()> {
            Ok(())
        }

        fn process_child(&mut self, _streams: &mut StreamBuffers) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_factory_type_names() {
        let names: Vec<String> = factories()
            .iter()
            .map(|f| f.type_name().to_string())
            .collect();
        assert_eq!(names, vec!["simplemixer", "simplevolume"]);
    }

    #[test]
    fn test_module_state() {
        let (_component, control) = GenericAudioComponent::new("m", Box::new(Passthrough), &[]);

        apply_module_state(&control, &Properties::new().with("moduleState", "off")).unwrap();
        assert_eq!(control.state(), ProcessingState::Disabled);
        apply_module_state(&control, &Properties::new().with("moduleState", "on")).unwrap();
        assert_eq!(control.state(), ProcessingState::Enabled);

        assert!(matches!(
            apply_module_state(&control, &Properties::new().with("moduleState", "maybe")),
            Err(Error::InvalidParam(_))
        ));
        assert!(matches!(
            apply_module_state(&control, &Properties::new()),
            Err(Error::InvalidParam(_))
        ));
    }
}
