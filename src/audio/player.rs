//! Track-aware playback queue
//!
//! Assistant audio arrives in chunks tagged with the conversation item it
//! belongs to. The queue remembers how much of the current track has been
//! played so an interrupt can tell the backend where the user cut in.

use super::{AudioPlayer, TrackOffset};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

/// How many interrupted track ids are remembered for dropping late chunks
const INTERRUPTED_HISTORY: usize = 16;

struct Chunk {
    track_id: String,
    samples: VecDeque<i16>,
}

/// Samples of one track played so far, across all of its chunks
struct Progress {
    track_id: String,
    played: u64,
}

#[derive(Default)]
struct QueueState {
    chunks: VecDeque<Chunk>,
    /// Track currently (or most recently) reaching the output
    progress: Option<Progress>,
    /// Tracks cut off by an interrupt, newest last
    interrupted: VecDeque<String>,
}

impl QueueState {
    fn played(&self, track_id: &str) -> u64 {
        match &self.progress {
            Some(progress) if progress.track_id == track_id => progress.played,
            _ => 0,
        }
    }

    fn advance(&mut self, track_id: &str, samples: u64) {
        match &mut self.progress {
            Some(progress) if progress.track_id == track_id => progress.played += samples,
            _ => {
                self.progress = Some(Progress {
                    track_id: track_id.to_string(),
                    played: samples,
                })
            }
        }
    }

    fn mark_interrupted(&mut self, track_id: String) {
        if self.interrupted.contains(&track_id) {
            return;
        }
        if self.interrupted.len() == INTERRUPTED_HISTORY {
            self.interrupted.pop_front();
        }
        self.interrupted.push_back(track_id);
    }
}

/// Shared playback queue, filled by the session and drained by the device
#[derive(Clone, Default)]
pub struct PlaybackBuffer {
    state: Arc<Mutex<QueueState>>,
}

impl PlaybackBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue samples for `track_id`
    pub fn push(&self, track_id: &str, samples: &[i16]) {
        let mut state = self.state.lock();
        if state.interrupted.iter().any(|id| id == track_id) {
            debug!("Dropping {} samples for interrupted track {}", samples.len(), track_id);
            return;
        }

        match state.chunks.back_mut() {
            Some(chunk) if chunk.track_id == track_id => chunk.samples.extend(samples.iter().copied()),
            _ => state.chunks.push_back(Chunk {
                track_id: track_id.to_string(),
                samples: samples.iter().copied().collect(),
            }),
        }
    }

    /// Fill `out` with the next samples, padding with silence
    ///
    /// Returns how many real samples were written.
    pub fn pull(&self, out: &mut [i16]) -> usize {
        let mut state = self.state.lock();
        let mut written = 0;

        while written < out.len() {
            let Some(chunk) = state.chunks.front_mut() else {
                break;
            };

            let start = written;
            while written < out.len() {
                match chunk.samples.pop_front() {
                    Some(sample) => {
                        out[written] = sample;
                        written += 1;
                    }
                    None => break,
                }
            }

            let drained = chunk.samples.is_empty();
            let track_id = chunk.track_id.clone();
            state.advance(&track_id, (written - start) as u64);
            if drained {
                state.chunks.pop_front();
            }
        }

        out[written..].fill(0);
        written
    }

    /// Drop all queued audio, reporting the track that was playing
    ///
    /// The offset counts every sample of the track played so far, including
    /// chunks that finished before this one arrived.
    pub fn interrupt(&self) -> Option<TrackOffset> {
        let mut state = self.state.lock();
        let current = state.chunks.front().map(|chunk| TrackOffset {
            track_id: chunk.track_id.clone(),
            offset: state.played(&chunk.track_id),
        });

        let ids: Vec<String> = state.chunks.drain(..).map(|chunk| chunk.track_id).collect();
        for id in ids {
            state.mark_interrupted(id);
        }
        state.progress = None;
        current
    }

    /// Whether any audio is waiting to be played
    pub fn is_playing(&self) -> bool {
        !self.state.lock().chunks.is_empty()
    }

    /// Samples waiting across all tracks
    pub fn queued_samples(&self) -> usize {
        self.state
            .lock()
            .chunks
            .iter()
            .map(|chunk| chunk.samples.len())
            .sum()
    }

    /// Interrupted track ids currently remembered
    pub fn interrupted_tracks(&self) -> usize {
        self.state.lock().interrupted.len()
    }

    /// Forget everything, including interrupted track ids
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.chunks.clear();
        state.progress = None;
        state.interrupted.clear();
    }
}

/// Headless player backed by a [`PlaybackBuffer`]
///
/// Whoever owns the output drains the buffer with [`PlaybackBuffer::pull`].
#[derive(Default)]
pub struct StreamPlayer {
    buffer: PlaybackBuffer,
    connected: bool,
}

impl StreamPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a player over an existing buffer
    pub fn with_buffer(buffer: PlaybackBuffer) -> Self {
        Self {
            buffer,
            connected: false,
        }
    }

    pub fn buffer(&self) -> &PlaybackBuffer {
        &self.buffer
    }
}

#[async_trait]
impl AudioPlayer for StreamPlayer {
    async fn connect(&mut self) -> Result<()> {
        // Every session starts with an empty queue
        self.buffer.reset();
        if !self.connected {
            self.connected = true;
            info!("Stream player connected");
        }
        Ok(())
    }

    async fn interrupt(&mut self) -> Option<TrackOffset> {
        self.buffer.interrupt()
    }

    fn add_pcm(&mut self, track_id: &str, samples: &[i16]) {
        self.buffer.push(track_id, samples);
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
