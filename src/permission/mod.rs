//! Microphone permission gating
//!
//! All microphone use goes through the [`PermissionGate`]. The platform is
//! reached through [`MicrophoneAccess`], which may or may not offer a status
//! query; when it does, status changes made outside the app (e.g. revoking
//! access in the OS settings mid-session) are pushed into the gate.

#[cfg(feature = "audio-io")]
pub mod cpal_access;

#[cfg(feature = "audio-io")]
pub use cpal_access::CpalMicrophone;

use crate::events::{EventBus, SessionEvent};
use crate::{Result, SessionError};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Gate state as seen by the session
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PermissionState {
    /// Query in progress
    #[default]
    Checking,
    Granted,
    Denied,
    /// Must be requested explicitly on first use
    Prompt,
}

impl PermissionState {
    pub fn is_granted(&self) -> bool {
        matches!(self, PermissionState::Granted)
    }
}

impl std::fmt::Display for PermissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionState::Checking => write!(f, "Checking"),
            PermissionState::Granted => write!(f, "Granted"),
            PermissionState::Denied => write!(f, "Denied"),
            PermissionState::Prompt => write!(f, "Prompt"),
        }
    }
}

/// Status reported by a platform permission query
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
    Prompt,
}

impl From<PermissionStatus> for PermissionState {
    fn from(status: PermissionStatus) -> Self {
        match status {
            PermissionStatus::Granted => PermissionState::Granted,
            PermissionStatus::Denied => PermissionState::Denied,
            PermissionStatus::Prompt => PermissionState::Prompt,
        }
    }
}

/// A microphone handle acquired only to prove access works
///
/// Released explicitly or on drop, whichever comes first.
pub struct MicrophoneLease {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl MicrophoneLease {
    /// Lease whose handle is freed by `release`
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Lease for a handle the platform already closed
    pub fn closed() -> Self {
        Self { release: None }
    }

    /// Free the underlying handle
    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for MicrophoneLease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Platform permission primitives
#[async_trait]
pub trait MicrophoneAccess: Send + Sync {
    /// Whether the platform can capture audio at all
    fn capture_supported(&self) -> bool;

    /// Current permission status with change notifications
    ///
    /// `None` when the platform has no query primitive (or the query failed).
    async fn query(&self) -> Option<watch::Receiver<PermissionStatus>>;

    /// Acquire the microphone
    async fn acquire(&self) -> Result<MicrophoneLease>;
}

/// Permission source for headless hosts
///
/// The status is whatever was last set; leases own nothing.
pub struct StaticMicrophone {
    status: watch::Sender<PermissionStatus>,
}

impl StaticMicrophone {
    pub fn new(status: PermissionStatus) -> Self {
        let (status, _) = watch::channel(status);
        Self { status }
    }

    pub fn granted() -> Self {
        Self::new(PermissionStatus::Granted)
    }

    /// Change the reported status, as a platform settings change would
    pub fn set_status(&self, status: PermissionStatus) {
        self.status.send_replace(status);
    }
}

#[async_trait]
impl MicrophoneAccess for StaticMicrophone {
    fn capture_supported(&self) -> bool {
        true
    }

    async fn query(&self) -> Option<watch::Receiver<PermissionStatus>> {
        Some(self.status.subscribe())
    }

    async fn acquire(&self) -> Result<MicrophoneLease> {
        match *self.status.borrow() {
            PermissionStatus::Denied => Err(SessionError::PermissionDenied),
            PermissionStatus::Granted | PermissionStatus::Prompt => Ok(MicrophoneLease::closed()),
        }
    }
}

/// Tracks microphone permission and requests it on demand
#[derive(Clone)]
pub struct PermissionGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    access: Arc<dyn MicrophoneAccess>,
    state: Arc<RwLock<PermissionState>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    events: Option<EventBus>,
}

impl Drop for GateInner {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.get_mut().take() {
            handle.abort();
        }
    }
}

impl PermissionGate {
    pub fn new(access: Arc<dyn MicrophoneAccess>) -> Self {
        Self::build(access, None)
    }

    /// Create a gate that announces state changes on the event bus
    pub fn with_events(access: Arc<dyn MicrophoneAccess>, events: EventBus) -> Self {
        Self::build(access, Some(events))
    }

    fn build(access: Arc<dyn MicrophoneAccess>, events: Option<EventBus>) -> Self {
        Self {
            inner: Arc::new(GateInner {
                access,
                state: Arc::new(RwLock::new(PermissionState::Checking)),
                watcher: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn state(&self) -> PermissionState {
        *self.inner.state.read()
    }

    pub fn is_granted(&self) -> bool {
        self.state().is_granted()
    }

    /// Resolve the current permission from the platform
    ///
    /// Subscribes to platform change notifications when a query primitive
    /// exists, replacing any earlier subscription.
    pub async fn check(&self) -> PermissionState {
        self.set_state(PermissionState::Checking);

        if !self.inner.access.capture_supported() {
            warn!("Platform has no audio capture capability");
            self.set_state(PermissionState::Denied);
            return PermissionState::Denied;
        }

        match self.inner.access.query().await {
            Some(rx) => {
                let status: PermissionState = (*rx.borrow()).into();
                self.set_state(status);
                self.watch(rx);
                status
            }
            None => {
                debug!("No permission query available, access must be requested");
                self.set_state(PermissionState::Prompt);
                PermissionState::Prompt
            }
        }
    }

    /// Ask the platform for the microphone
    ///
    /// The acquired handle is released immediately; this is a capability check,
    /// not a capture session.
    pub async fn request(&self) -> bool {
        match self.inner.access.acquire().await {
            Ok(lease) => {
                lease.release();
                info!("Microphone permission granted");
                self.set_state(PermissionState::Granted);
                true
            }
            Err(e) => {
                warn!("Microphone permission request failed: {}", e);
                self.set_state(PermissionState::Denied);
                false
            }
        }
    }

    /// Granted already, or granted by a fresh request
    pub async fn ensure_granted(&self) -> bool {
        if self.is_granted() {
            return true;
        }
        self.request().await
    }

    /// Stop listening for platform permission changes
    pub fn unsubscribe(&self) {
        if let Some(handle) = self.inner.watcher.lock().take() {
            handle.abort();
            debug!("Permission change subscription dropped");
        }
    }

    fn watch(&self, mut rx: watch::Receiver<PermissionStatus>) {
        let state = Arc::clone(&self.inner.state);
        let events = self.inner.events.clone();

        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let next: PermissionState = (*rx.borrow_and_update()).into();
                info!("Microphone permission changed by platform: {}", next);
                apply_state(&state, events.as_ref(), next);
            }
            debug!("Permission status source closed");
        });

        if let Some(previous) = self.inner.watcher.lock().replace(handle) {
            previous.abort();
        }
    }

    fn set_state(&self, next: PermissionState) {
        apply_state(&self.inner.state, self.inner.events.as_ref(), next);
    }
}

fn apply_state(state: &RwLock<PermissionState>, events: Option<&EventBus>, next: PermissionState) {
    let changed = {
        let mut current = state.write();
        let changed = *current != next;
        *current = next;
        changed
    };

    if changed {
        if let Some(events) = events {
            events.publish(SessionEvent::PermissionChanged(next));
        }
    }
}
