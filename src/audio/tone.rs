//! Synthetic capture device
//!
//! Produces a sine tone in 20ms frames on a tokio task. Used when no real
//! input device is compiled in.

use super::{AudioFrame, AudioRecorder, FrameSink, RecorderStatus, SAMPLE_RATE};
use crate::{Result, SessionError};
use async_trait::async_trait;
use std::f32::consts::TAU;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

const FRAME_MS: u64 = 20;

pub struct ToneRecorder {
    frequency: f32,
    amplitude: f32,
    status: RecorderStatus,
    task: Option<JoinHandle<()>>,
}

impl ToneRecorder {
    pub fn new(frequency: f32) -> Self {
        Self {
            frequency,
            amplitude: 0.2,
            status: RecorderStatus::Ended,
            task: None,
        }
    }

    fn stop_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Default for ToneRecorder {
    fn default() -> Self {
        Self::new(440.0)
    }
}

#[async_trait]
impl AudioRecorder for ToneRecorder {
    async fn begin(&mut self) -> Result<()> {
        self.status = RecorderStatus::Idle;
        Ok(())
    }

    async fn record(&mut self, mut sink: FrameSink) -> Result<()> {
        if self.status == RecorderStatus::Ended {
            return Err(SessionError::AudioDevice(
                "Cannot record before the capture device is begun".into(),
            ));
        }
        self.stop_task();

        let frequency = self.frequency;
        let amplitude = self.amplitude;
        let frame_len = (SAMPLE_RATE as u64 * FRAME_MS / 1000) as usize;

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_MS));
            let mut phase = 0.0f32;
            let step = TAU * frequency / SAMPLE_RATE as f32;

            loop {
                ticker.tick().await;
                let samples: Vec<f32> = (0..frame_len)
                    .map(|_| {
                        let sample = phase.sin() * amplitude;
                        phase = (phase + step) % TAU;
                        sample
                    })
                    .collect();
                sink(AudioFrame::from_f32(&samples));
            }
        }));

        self.status = RecorderStatus::Recording;
        debug!("Tone capture started at {}Hz", frequency);
        Ok(())
    }

    async fn pause(&mut self) -> Result<()> {
        if self.status == RecorderStatus::Ended {
            return Err(SessionError::AudioDevice(
                "Cannot pause a capture device that was never begun".into(),
            ));
        }
        self.stop_task();
        self.status = RecorderStatus::Idle;
        Ok(())
    }

    async fn end(&mut self) -> Result<()> {
        self.stop_task();
        self.status = RecorderStatus::Ended;
        Ok(())
    }

    fn status(&self) -> RecorderStatus {
        self.status
    }
}

impl Drop for ToneRecorder {
    fn drop(&mut self) {
        self.stop_task();
    }
}
