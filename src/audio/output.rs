//! Assistant audio playback through cpal
//!
//! The output stream drains a [`PlaybackBuffer`]; the buffer keeps track
//! offsets, so interrupting here reports exactly where playback stopped.

use super::{AudioPlayer, PlaybackBuffer, TrackOffset, SAMPLE_RATE};
use crate::{Result, SessionError};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Playback device on the default cpal output
pub struct CpalPlayer {
    buffer: PlaybackBuffer,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalPlayer {
    pub fn new() -> Self {
        Self {
            buffer: PlaybackBuffer::new(),
            stop_tx: None,
            thread: None,
        }
    }

    pub fn buffer(&self) -> &PlaybackBuffer {
        &self.buffer
    }

    /// Close the output stream
    pub fn close(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("Playback thread panicked");
            }
            info!("Stopped audio playback");
        }
    }
}

impl Default for CpalPlayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioPlayer for CpalPlayer {
    async fn connect(&mut self) -> Result<()> {
        // Every session starts with an empty queue
        self.buffer.reset();
        if self.thread.is_some() {
            warn!("Already playing");
            return Ok(());
        }

        let (stop_tx, stop_rx) = bounded(1);
        let (ready_tx, ready_rx) = bounded(1);
        let buffer = self.buffer.clone();

        let handle = thread::Builder::new()
            .name("parley-playback".into())
            .spawn(move || run_output_stream(buffer, stop_rx, ready_tx))
            .map_err(|e| SessionError::AudioDevice(format!("Failed to spawn playback thread: {}", e)))?;

        let ready = tokio::task::spawn_blocking(move || ready_rx.recv())
            .await
            .map_err(|e| SessionError::AudioDevice(format!("Playback startup failed: {}", e)))?
            .map_err(|_| SessionError::AudioDevice("Playback thread exited early".into()))?;

        match ready {
            Ok(()) => {
                self.stop_tx = Some(stop_tx);
                self.thread = Some(handle);
                info!("Started audio playback");
                Ok(())
            }
            Err(e) => {
                let _ = handle.join();
                Err(e)
            }
        }
    }

    async fn interrupt(&mut self) -> Option<TrackOffset> {
        self.buffer.interrupt()
    }

    fn add_pcm(&mut self, track_id: &str, samples: &[i16]) {
        self.buffer.push(track_id, samples);
    }

    fn is_connected(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for CpalPlayer {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_output_stream(buffer: PlaybackBuffer, stop_rx: Receiver<()>, ready_tx: Sender<Result<()>>) {
    let stream = match open_output_stream(buffer) {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let _ = stop_rx.recv();
    drop(stream);
    debug!("Playback stream closed");
}

fn open_output_stream(buffer: PlaybackBuffer) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| SessionError::AudioDevice("No output device available".into()))?;

    info!(
        "Using output device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let config: cpal::StreamConfig = device
        .default_output_config()
        .map_err(|e| SessionError::AudioDevice(format!("Failed to get output config: {}", e)))?
        .into();

    if config.sample_rate.0 != SAMPLE_RATE {
        warn!(
            "Output device runs at {}Hz, assistant audio is {}Hz",
            config.sample_rate.0, SAMPLE_RATE
        );
    }

    let channels = config.channels as usize;
    let mut scratch: Vec<i16> = Vec::new();

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                scratch.resize(frames, 0);
                buffer.pull(&mut scratch);

                for (frame, sample) in data.chunks_mut(channels).zip(scratch.iter()) {
                    let value = *sample as f32 / i16::MAX as f32;
                    frame.fill(value);
                }
            },
            |err| error!("Audio output stream error: {}", err),
            None,
        )
        .map_err(|e| SessionError::AudioDevice(format!("Failed to build output stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| SessionError::AudioDevice(format!("Failed to start output stream: {}", e)))?;

    Ok(stream)
}
