//! Shared test doubles for session integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use parley::audio::{AudioFrame, AudioRecorder, FrameSink, PlaybackBuffer, RecorderStatus, StreamPlayer};
use parley::backend::LoopbackClient;
use parley::permission::{MicrophoneAccess, MicrophoneLease, PermissionStatus};
use parley::{SessionConfig, SessionController, SessionError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

type RecordHook = Box<dyn Fn() + Send + Sync>;

/// Observable state of a [`MockRecorder`]
#[derive(Default)]
pub struct RecorderSpy {
    pub begins: AtomicUsize,
    pub records: AtomicUsize,
    pub pauses: AtomicUsize,
    pub ends: AtomicUsize,
    pub fail_begin: AtomicBool,
    pub fail_end: AtomicBool,
    status: Mutex<RecorderStatus>,
    sink: Mutex<Option<FrameSink>>,
    on_record: Mutex<Option<RecordHook>>,
    begin_gate: Mutex<Option<Arc<Notify>>>,
}

impl RecorderSpy {
    pub fn status(&self) -> RecorderStatus {
        *self.status.lock()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Deliver one captured frame if capture is running
    pub fn push_frame(&self, samples: usize) -> bool {
        if !self.status().is_recording() {
            return false;
        }
        match self.sink.lock().as_mut() {
            Some(sink) => {
                sink(AudioFrame::new(vec![100; samples]));
                true
            }
            None => false,
        }
    }

    /// Make `begin` wait until the returned gate is notified
    pub fn hold_begin(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.begin_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Run `hook` at the moment capture starts
    pub fn on_record(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_record.lock() = Some(Box::new(hook));
    }
}

pub struct MockRecorder {
    spy: Arc<RecorderSpy>,
}

impl MockRecorder {
    pub fn new() -> (Self, Arc<RecorderSpy>) {
        let spy = Arc::new(RecorderSpy::default());
        (
            Self {
                spy: Arc::clone(&spy),
            },
            spy,
        )
    }
}

#[async_trait]
impl AudioRecorder for MockRecorder {
    async fn begin(&mut self) -> parley::Result<()> {
        self.spy.begins.fetch_add(1, Ordering::SeqCst);
        let gate = self.spy.begin_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.spy.fail_begin.load(Ordering::SeqCst) {
            return Err(SessionError::AudioDevice("no input device".into()));
        }
        *self.spy.status.lock() = RecorderStatus::Idle;
        Ok(())
    }

    async fn record(&mut self, sink: FrameSink) -> parley::Result<()> {
        if self.spy.status() == RecorderStatus::Ended {
            return Err(SessionError::AudioDevice("recorder not begun".into()));
        }
        if let Some(hook) = self.spy.on_record.lock().as_ref() {
            hook();
        }
        self.spy.records.fetch_add(1, Ordering::SeqCst);
        *self.spy.sink.lock() = Some(sink);
        *self.spy.status.lock() = RecorderStatus::Recording;
        Ok(())
    }

    async fn pause(&mut self) -> parley::Result<()> {
        if self.spy.status() == RecorderStatus::Ended {
            return Err(SessionError::AudioDevice("recorder not begun".into()));
        }
        self.spy.pauses.fetch_add(1, Ordering::SeqCst);
        *self.spy.status.lock() = RecorderStatus::Idle;
        Ok(())
    }

    async fn end(&mut self) -> parley::Result<()> {
        self.spy.ends.fetch_add(1, Ordering::SeqCst);
        *self.spy.sink.lock() = None;
        *self.spy.status.lock() = RecorderStatus::Ended;
        if self.spy.fail_end.load(Ordering::SeqCst) {
            return Err(SessionError::AudioDevice("device vanished during close".into()));
        }
        Ok(())
    }

    fn status(&self) -> RecorderStatus {
        self.spy.status()
    }
}

/// Microphone permission source under test control
pub struct MockMicrophone {
    pub allow: AtomicBool,
    pub acquisitions: AtomicUsize,
    status: Mutex<Option<watch::Receiver<PermissionStatus>>>,
}

impl MockMicrophone {
    /// No query primitive; access is decided by `allow` on request
    pub fn prompting(allow: bool) -> Arc<Self> {
        Arc::new(Self {
            allow: AtomicBool::new(allow),
            acquisitions: AtomicUsize::new(0),
            status: Mutex::new(None),
        })
    }

    /// Query primitive driven by the returned sender
    pub fn queryable(initial: PermissionStatus) -> (Arc<Self>, watch::Sender<PermissionStatus>) {
        let (tx, rx) = watch::channel(initial);
        let microphone = Arc::new(Self {
            allow: AtomicBool::new(initial != PermissionStatus::Denied),
            acquisitions: AtomicUsize::new(0),
            status: Mutex::new(Some(rx)),
        });
        (microphone, tx)
    }
}

#[async_trait]
impl MicrophoneAccess for MockMicrophone {
    fn capture_supported(&self) -> bool {
        true
    }

    async fn query(&self) -> Option<watch::Receiver<PermissionStatus>> {
        self.status.lock().clone()
    }

    async fn acquire(&self) -> parley::Result<MicrophoneLease> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        if self.allow.load(Ordering::SeqCst) {
            Ok(MicrophoneLease::closed())
        } else {
            Err(SessionError::PermissionDenied)
        }
    }
}

/// A session wired to test doubles
pub struct Harness {
    pub session: SessionController,
    pub client: Arc<LoopbackClient>,
    pub recorder: Arc<RecorderSpy>,
    pub playback: PlaybackBuffer,
    pub microphone: Arc<MockMicrophone>,
}

impl Harness {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_microphone(config, MockMicrophone::prompting(true))
    }

    pub fn with_microphone(config: SessionConfig, microphone: Arc<MockMicrophone>) -> Self {
        let client = Arc::new(LoopbackClient::new());
        let (recorder, spy) = MockRecorder::new();
        let playback = PlaybackBuffer::new();

        let session = SessionController::builder(client.clone())
            .with_config(config)
            .with_recorder(Box::new(recorder))
            .with_player(Box::new(StreamPlayer::with_buffer(playback.clone())))
            .with_microphone(microphone.clone())
            .build()
            .expect("session builds");

        Self {
            session,
            client,
            recorder: spy,
            playback,
            microphone,
        }
    }

    /// Build, start and connect
    pub async fn connected(config: SessionConfig) -> Self {
        let harness = Self::new(config);
        harness.session.start().await.expect("session starts");
        harness.session.connect().await.expect("session connects");
        harness
    }
}

/// Let spawned tasks run
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
