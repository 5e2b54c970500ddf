//! Core types, error taxonomy, and constants shared across the xbar crates.
//!
//! This crate provides fundamental building blocks that all other xbar crates depend on.

use serde::{Deserialize, Serialize};

/// Sample rate in Hz
pub type SampleRate = u32;

/// Number of audio frames (samples per channel)
pub type Frames = usize;

/// Processing sample type (all DSP and format conversion goes through f32)
pub type Sample = f32;

/// Number of audio channels
pub type ChannelCount = usize;

/// Common sample rates
pub mod sample_rates {
    use super::SampleRate;

    /// 44.1 kHz sample rate (CD quality)
    pub const SR_44100: SampleRate = 44100;
    /// 48 kHz sample rate (professional audio standard)
    pub const SR_48000: SampleRate = 48000;
    /// 96 kHz sample rate (high resolution audio)
    pub const SR_96000: SampleRate = 96000;
}

/// Period sizes commonly used by devices and the switch matrix
pub mod period_sizes {
    use super::Frames;

    /// 64 frames per period (~1.3ms @ 48kHz)
    pub const PERIOD_64: Frames = 64;
    /// 192 frames per period (4ms @ 48kHz, typical automotive/embedded cadence)
    pub const PERIOD_192: Frames = 192;
    /// 256 frames per period (~5.3ms @ 48kHz)
    pub const PERIOD_256: Frames = 256;
}

/// Storage format of samples inside a ring buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataFormat {
    /// Signed 16 bit PCM
    Int16,
    /// Signed 32 bit PCM
    Int32,
    /// 32 bit IEEE float, nominal range [-1.0, 1.0]
    #[default]
    Float32,
}

impl DataFormat {
    /// Width of one sample in bits
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::Int16 => 16,
            Self::Int32 | Self::Float32 => 32,
        }
    }
}

/// Gain encoding used on the command interface.
///
/// Gains travel as integers in units of 1/10 dB. Anything at or below
/// [`SILENCE_DB10`](gain::SILENCE_DB10) means exact silence.
pub mod gain {
    /// -144.0 dB, the silence threshold in 1/10 dB units
    pub const SILENCE_DB10: i32 = -1440;

    /// Convert a 1/10 dB value into a linear factor (`10^(value/200)`)
    #[must_use]
    pub fn db10_to_linear(value: i32) -> f32 {
        if value <= SILENCE_DB10 {
            0.0
        } else {
            10.0_f32.powf(value as f32 / 200.0)
        }
    }

    /// Convert a linear factor back into 1/10 dB, rounded to the nearest step
    #[must_use]
    pub fn linear_to_db10(linear: f32) -> i32 {
        if linear <= 0.0 {
            return SILENCE_DB10;
        }
        let db10 = (200.0 * linear.log10()).round() as i32;
        db10.max(SILENCE_DB10)
    }
}

/// Common error type
///
/// The variants mirror the status codes every routing and processing
/// operation can report. `BufferEmpty` and `BufferFull` are transient: the
/// caller retries in a later period instead of escalating.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Generic failure (duplicate entry, missing connection, queue full, ...)
    #[error("Operation failed: {0}")]
    Failed(String),

    /// Bad argument, missing key, or out-of-range id
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    /// The object has not been initialized yet
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// Nothing available to read
    #[error("Buffer empty")]
    BufferEmpty,

    /// No space available to write
    #[error("Buffer full")]
    BufferFull,

    /// Fatal to module or component bring-up
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Lookup miss in a connection or module table
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for conditions the caller should retry in a later period
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::BufferEmpty | Self::BufferFull)
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rates() {
        assert_eq!(sample_rates::SR_48000, 48000);
    }

    #[test]
    fn test_db10_to_linear() {
        assert_eq!(gain::db10_to_linear(0), 1.0);
        assert!((gain::db10_to_linear(-60) - 0.501_187).abs() < 1e-5);
        assert!((gain::db10_to_linear(60) - 1.995_262).abs() < 1e-5);
    }

    #[test]
    fn test_silence_threshold() {
        assert_eq!(gain::db10_to_linear(gain::SILENCE_DB10), 0.0);
        assert_eq!(gain::db10_to_linear(-2000), 0.0);
        assert!(gain::db10_to_linear(gain::SILENCE_DB10 + 1) > 0.0);
    }

    #[test]
    fn test_linear_to_db10() {
        assert_eq!(gain::linear_to_db10(1.0), 0);
        assert_eq!(gain::linear_to_db10(0.0), gain::SILENCE_DB10);
        assert_eq!(gain::linear_to_db10(gain::db10_to_linear(-120)), -120);
    }

    #[test]
    fn test_transient_errors() {
        assert!(Error::BufferEmpty.is_transient());
        assert!(Error::BufferFull.is_transient());
        assert!(!Error::Failed("x".into()).is_transient());
    }
}
