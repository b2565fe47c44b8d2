//! Single owner of the capture and playback devices
//!
//! The coordinator is state-agnostic: it never looks at the connection.
//! The session controller decides when capture runs and is responsible for
//! calling [`AudioCoordinator::end`] during teardown.

use super::{AudioPlayer, AudioRecorder, FrameSink, RecorderStatus, TrackOffset};
use crate::Result;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct AudioCoordinator {
    recorder: Mutex<Box<dyn AudioRecorder>>,
    player: Mutex<Box<dyn AudioPlayer>>,
}

impl AudioCoordinator {
    pub fn new(recorder: Box<dyn AudioRecorder>, player: Box<dyn AudioPlayer>) -> Self {
        Self {
            recorder: Mutex::new(recorder),
            player: Mutex::new(player),
        }
    }

    // === Capture ===

    /// Open the capture device
    pub async fn begin(&self) -> Result<()> {
        let mut recorder = self.recorder.lock().await;
        if recorder.status() != RecorderStatus::Ended {
            debug!("Recorder already begun");
            return Ok(());
        }
        recorder.begin().await?;
        info!("Capture device opened");
        Ok(())
    }

    /// Start forwarding frames to `sink`
    pub async fn record(&self, sink: FrameSink) -> Result<()> {
        self.recorder.lock().await.record(sink).await?;
        debug!("Capture streaming");
        Ok(())
    }

    /// Stop forwarding frames
    pub async fn pause(&self) -> Result<()> {
        self.recorder.lock().await.pause().await?;
        debug!("Capture paused");
        Ok(())
    }

    /// Pause only if frames are currently flowing
    ///
    /// Returns whether a pause was issued.
    pub async fn pause_if_recording(&self) -> Result<bool> {
        let mut recorder = self.recorder.lock().await;
        if !recorder.status().is_recording() {
            return Ok(false);
        }
        recorder.pause().await?;
        debug!("Capture paused");
        Ok(true)
    }

    /// Close the capture device
    pub async fn end(&self) -> Result<()> {
        let mut recorder = self.recorder.lock().await;
        if recorder.status() == RecorderStatus::Ended {
            return Ok(());
        }
        recorder.end().await?;
        info!("Capture device closed");
        Ok(())
    }

    pub async fn recorder_status(&self) -> RecorderStatus {
        self.recorder.lock().await.status()
    }

    // === Playback ===

    /// Open the playback device
    pub async fn connect_player(&self) -> Result<()> {
        self.player.lock().await.connect().await?;
        info!("Playback device connected");
        Ok(())
    }

    /// Cut off whatever the assistant is saying
    pub async fn interrupt(&self) -> Option<TrackOffset> {
        let offset = self.player.lock().await.interrupt().await;
        if let Some(offset) = &offset {
            debug!(
                "Interrupted track {} at sample {}",
                offset.track_id, offset.offset
            );
        }
        offset
    }

    /// Queue assistant audio
    pub async fn add_pcm(&self, track_id: &str, samples: &[i16]) {
        self.player.lock().await.add_pcm(track_id, samples);
    }

    pub async fn player_connected(&self) -> bool {
        self.player.lock().await.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioFrame, StreamPlayer};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingRecorder {
        status: RecorderStatus,
        pauses: Arc<AtomicUsize>,
        ends: Arc<AtomicUsize>,
        sink: Option<FrameSink>,
    }

    #[async_trait]
    impl AudioRecorder for CountingRecorder {
        async fn begin(&mut self) -> Result<()> {
            self.status = RecorderStatus::Idle;
            Ok(())
        }

        async fn record(&mut self, mut sink: FrameSink) -> Result<()> {
            sink(AudioFrame::new(vec![1, 2]));
            self.sink = Some(sink);
            self.status = RecorderStatus::Recording;
            Ok(())
        }

        async fn pause(&mut self) -> Result<()> {
            self.pauses.fetch_add(1, Ordering::SeqCst);
            self.status = RecorderStatus::Idle;
            Ok(())
        }

        async fn end(&mut self) -> Result<()> {
            self.ends.fetch_add(1, Ordering::SeqCst);
            self.sink = None;
            self.status = RecorderStatus::Ended;
            Ok(())
        }

        fn status(&self) -> RecorderStatus {
            self.status
        }
    }

    #[tokio::test]
    async fn test_capture_lifecycle() {
        let recorder = CountingRecorder::default();
        let pauses = Arc::clone(&recorder.pauses);
        let ends = Arc::clone(&recorder.ends);
        let audio = AudioCoordinator::new(Box::new(recorder), Box::new(StreamPlayer::new()));

        audio.begin().await.unwrap();
        assert_eq!(audio.recorder_status().await, RecorderStatus::Idle);

        let frames = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&frames);
        audio
            .record(Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        assert_eq!(frames.load(Ordering::SeqCst), 1);
        assert!(audio.recorder_status().await.is_recording());

        assert!(audio.pause_if_recording().await.unwrap());
        assert!(!audio.pause_if_recording().await.unwrap());
        assert_eq!(pauses.load(Ordering::SeqCst), 1);

        audio.end().await.unwrap();
        audio.end().await.unwrap();
        assert_eq!(ends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_playback_interrupt() {
        let audio = AudioCoordinator::new(
            Box::new(CountingRecorder::default()),
            Box::new(StreamPlayer::new()),
        );

        assert!(!audio.player_connected().await);
        audio.connect_player().await.unwrap();
        assert!(audio.player_connected().await);

        assert_eq!(audio.interrupt().await, None);
        audio.add_pcm("item_9", &[0; 16]).await;
        let offset = audio.interrupt().await.unwrap();
        assert_eq!(offset.track_id, "item_9");
    }
}
