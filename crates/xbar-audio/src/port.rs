//! Ports: named, directional windows onto a device's ring buffer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use xbar_core::{ChannelCount, Error, Result};

use crate::ring_buffer::RingBuffer;

static NEXT_PORT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Direction of a port as seen from the switch matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDirection {
    /// Data enters the matrix here (connection source)
    Input,
    /// Data leaves the matrix here (connection sink)
    Output,
}

/// Process-unique port identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortHandle(u64);

/// Static description of a port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortParams {
    pub name: String,
    /// Application-level id
    #[serde(default)]
    pub id: i32,
    pub num_channels: ChannelCount,
    /// First ring buffer channel covered by this port
    #[serde(default)]
    pub index: usize,
    pub direction: PortDirection,
}

impl PortParams {
    #[must_use]
    pub fn new(name: &str, num_channels: ChannelCount, direction: PortDirection) -> Self {
        Self {
            name: name.to_string(),
            id: 0,
            num_channels,
            index: 0,
            direction,
        }
    }

    #[must_use]
    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: i32) -> Self {
        self.id = id;
        self
    }
}

/// A port covering `num_channels` channels of a ring buffer starting at `index`
#[derive(Debug)]
pub struct Port {
    handle: PortHandle,
    name: Arc<str>,
    params: PortParams,
    ring_buffer: Option<Arc<RingBuffer>>,
    owner: Option<Arc<str>>,
}

impl Port {
    pub fn new(params: PortParams) -> Result<Self> {
        if params.num_channels == 0 {
            return Err(Error::InvalidParam(format!(
                "port '{}' needs at least one channel",
                params.name
            )));
        }
        Ok(Self {
            handle: PortHandle(NEXT_PORT_HANDLE.fetch_add(1, Ordering::Relaxed)),
            name: Arc::from(params.name.as_str()),
            params,
            ring_buffer: None,
            owner: None,
        })
    }

    /// Bind the port to a ring buffer; the channel window must fit inside it
    pub fn with_ring_buffer(mut self, ring_buffer: Arc<RingBuffer>) -> Result<Self> {
        let end = self.params.index + self.params.num_channels;
        if end > ring_buffer.num_channels() {
            return Err(Error::InvalidParam(format!(
                "port '{}' covers channels {}..{end}, ring buffer '{}' has {}",
                self.name,
                self.params.index,
                ring_buffer.name(),
                ring_buffer.num_channels()
            )));
        }
        self.ring_buffer = Some(ring_buffer);
        Ok(self)
    }

    #[must_use]
    pub fn with_owner(mut self, owner: Arc<str>) -> Self {
        self.owner = Some(owner);
        self
    }

    #[must_use]
    pub fn handle(&self) -> PortHandle {
        self.handle
    }

    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    #[must_use]
    pub fn id(&self) -> i32 {
        self.params.id
    }

    #[must_use]
    pub fn num_channels(&self) -> ChannelCount {
        self.params.num_channels
    }

    /// First ring buffer channel of this port
    #[must_use]
    pub fn index(&self) -> usize {
        self.params.index
    }

    #[must_use]
    pub fn direction(&self) -> PortDirection {
        self.params.direction
    }

    #[must_use]
    pub fn ring_buffer(&self) -> Option<&Arc<RingBuffer>> {
        self.ring_buffer.as_ref()
    }

    /// Name of the owning device or zone
    #[must_use]
    pub fn owner(&self) -> Option<&Arc<str>> {
        self.owner.as_ref()
    }

    #[must_use]
    pub fn params(&self) -> &PortParams {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring_buffer::RingBufferParams;

    fn ring_buffer(channels: ChannelCount) -> Arc<RingBuffer> {
        Arc::new(RingBuffer::new(RingBufferParams::new("rb", channels, 64, 2)).unwrap())
    }

    #[test]
    fn test_channel_window_must_fit() {
        let port = Port::new(PortParams::new("front", 2, PortDirection::Output).with_index(2))
            .unwrap()
            .with_ring_buffer(ring_buffer(4))
            .unwrap();
        assert_eq!(port.index(), 2);
        assert_eq!(port.num_channels(), 2);

        let err = Port::new(PortParams::new("rear", 2, PortDirection::Output).with_index(3))
            .unwrap()
            .with_ring_buffer(ring_buffer(4))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParam(_)));
    }

    #[test]
    fn test_handles_are_unique() {
        let a = Port::new(PortParams::new("a", 1, PortDirection::Input)).unwrap();
        let b = Port::new(PortParams::new("a", 1, PortDirection::Input)).unwrap();
        assert_ne!(a.handle(), b.handle());
        assert!(a.ring_buffer().is_none());
        assert!(a.owner().is_none());
    }

    #[test]
    fn test_zero_channels_rejected() {
        assert!(Port::new(PortParams::new("a", 0, PortDirection::Input)).is_err());
    }
}
