//! Audio chains: an ordered list of components sharing one set of stream buffers.

use std::sync::Arc;

use xbar_core::{Error, Result};
use xbar_plugin::{ChainEnv, StreamBuffers, StreamDescriptor};

use crate::component::GenericAudioComponent;

pub struct AudioChain {
    name: Arc<str>,
    env: ChainEnv,
    buffers: StreamBuffers,
    components: Vec<GenericAudioComponent>,
}

impl AudioChain {
    /// Allocate one period of buffers for every stream of the chain
    pub fn new(name: &str, env: ChainEnv, streams: &[StreamDescriptor]) -> Result<Self> {
        if env.frame_length == 0 || env.sample_rate == 0 {
            return Err(Error::InvalidParam(format!(
                "chain '{name}': frame length and sample rate must be > 0"
            )));
        }
        for (i, stream) in streams.iter().enumerate() {
            if streams[..i].iter().any(|s| s.id == stream.id) {
                return Err(Error::InvalidParam(format!(
                    "chain '{name}': stream id {} declared twice",
                    stream.id
                )));
            }
        }
        Ok(Self {
            name: Arc::from(name),
            env,
            buffers: StreamBuffers::from_descriptors(streams, env.frame_length),
            components: Vec::new(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    #[must_use]
    pub fn env(&self) -> ChainEnv {
        self.env
    }

    /// Initialize a component with the chain environment and append it
    pub fn add(&mut self, mut component: GenericAudioComponent) -> Result<()> {
        component.init(&self.env)?;
        tracing::debug!("Chain '{}': appended '{}'", self.name, component.name());
        self.components.push(component);
        Ok(())
    }

    /// Component names in processing order
    #[must_use]
    pub fn component_names(&self) -> Vec<Arc<str>> {
        self.components.iter().map(|c| Arc::clone(c.name())).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    #[must_use]
    pub fn buffers(&self) -> &StreamBuffers {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut StreamBuffers {
        &mut self.buffers
    }

    pub fn reset(&mut self) -> Result<()> {
        for component in &mut self.components {
            component.reset()?;
        }
        Ok(())
    }

    /// Run every component once, in order
    ///
    /// A failing component does not stop the ones after it; the first
    /// error is returned once the pass is complete.
    pub fn process(&mut self) -> Result<()> {
        let mut first_error = None;
        for component in &mut self.components {
            if let Err(e) = component.process(&mut self.buffers) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
