//! Audio capture and playback device contracts
//!
//! The session never talks to hardware directly; it drives an
//! [`AudioRecorder`] and an [`AudioPlayer`] through the [`AudioCoordinator`].

pub mod coordinator;
#[cfg(feature = "audio-io")]
pub mod input;
#[cfg(feature = "audio-io")]
pub mod output;
pub mod player;
pub mod tone;

pub use coordinator::AudioCoordinator;
#[cfg(feature = "audio-io")]
pub use input::CpalRecorder;
#[cfg(feature = "audio-io")]
pub use output::CpalPlayer;
pub use player::{PlaybackBuffer, StreamPlayer};
pub use tone::ToneRecorder;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Sample rate used on the wire in both directions
pub const SAMPLE_RATE: u32 = 24_000;

/// One chunk of captured mono PCM16 audio
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AudioFrame {
    pub mono: Vec<i16>,
}

impl AudioFrame {
    pub fn new(mono: Vec<i16>) -> Self {
        Self { mono }
    }

    /// Convert float samples in [-1.0, 1.0] to PCM16
    pub fn from_f32(samples: &[f32]) -> Self {
        let mono = samples
            .iter()
            .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .collect();
        Self { mono }
    }

    pub fn len(&self) -> usize {
        self.mono.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mono.is_empty()
    }
}

/// Per-frame callback installed by `record`
pub type FrameSink = Box<dyn FnMut(AudioFrame) + Send + 'static>;

/// Capture device lifecycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecorderStatus {
    /// Not begun, or ended
    #[default]
    Ended,
    /// Device open, no frames delivered
    Idle,
    /// Delivering frames to the sink
    Recording,
}

impl RecorderStatus {
    pub fn is_recording(&self) -> bool {
        matches!(self, RecorderStatus::Recording)
    }
}

impl std::fmt::Display for RecorderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecorderStatus::Ended => write!(f, "Ended"),
            RecorderStatus::Idle => write!(f, "Idle"),
            RecorderStatus::Recording => write!(f, "Recording"),
        }
    }
}

/// Where playback stopped when it was interrupted
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackOffset {
    pub track_id: String,
    /// Samples of the track already played
    pub offset: u64,
}

/// Microphone capture device
#[async_trait]
pub trait AudioRecorder: Send {
    /// Open the device
    async fn begin(&mut self) -> Result<()>;

    /// Start delivering frames to `sink`, replacing any previous sink
    async fn record(&mut self, sink: FrameSink) -> Result<()>;

    /// Stop delivering frames, keep the device open
    async fn pause(&mut self) -> Result<()>;

    /// Close the device
    async fn end(&mut self) -> Result<()>;

    fn status(&self) -> RecorderStatus;
}

/// Streaming playback device
#[async_trait]
pub trait AudioPlayer: Send {
    /// Open the output
    async fn connect(&mut self) -> Result<()>;

    /// Stop playback and drop queued audio
    ///
    /// Returns the track that was playing and how far it got, if any.
    async fn interrupt(&mut self) -> Option<TrackOffset>;

    /// Queue PCM16 audio for a track
    fn add_pcm(&mut self, track_id: &str, samples: &[i16]);

    fn is_connected(&self) -> bool;
}
