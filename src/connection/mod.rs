//! Connection lifecycle with bounded exponential reconnects
//!
//! [`ConnectionManager`] is the only writer of [`ConnectionState`]. Every
//! transition into `Disconnected`, whatever the path, resets the reconnect
//! attempt counter and runs the registered disconnect hooks before the
//! transition is announced.

use crate::backend::RealtimeClient;
use crate::error_report::{ErrorKind, ErrorReporter};
use crate::events::{EventBus, SessionEvent};
use crate::{Result, SessionError};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

/// Backoff settings and the live attempt counter
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    attempt: u32,
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `min(base * 2^(attempt - 1), max)`; attempts are 1-based
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    fn advance(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(3, 1000, 10_000)
    }
}

/// Out-of-band outcomes of the reconnect procedure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionNotice {
    /// A scheduled attempt brought the connection back
    Reconnected,
    /// All attempts failed; the loss is now fatal
    ReconnectExhausted,
}

type DisconnectHook = Box<dyn Fn() + Send + Sync>;

struct Inner {
    state: ConnectionState,
    policy: ReconnectPolicy,
    timer: Option<JoinHandle<()>>,
    /// Bumped by every explicit disconnect; stale attempts compare against it
    epoch: u64,
}

impl Inner {
    /// Returns the new state if it changed
    fn transition(&mut self, next: ConnectionState) -> Option<ConnectionState> {
        if next == ConnectionState::Disconnected {
            self.policy.reset();
        }
        if self.state == next {
            return None;
        }
        debug!("Connection {} -> {}", self.state, next);
        self.state = next;
        Some(next)
    }
}

struct Shared {
    client: Arc<dyn RealtimeClient>,
    inner: Mutex<Inner>,
    errors: ErrorReporter,
    events: Option<EventBus>,
    state_tx: watch::Sender<ConnectionState>,
    notice_tx: mpsc::UnboundedSender<ConnectionNotice>,
    notice_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionNotice>>>,
    disconnect_hooks: Mutex<Vec<DisconnectHook>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.get_mut().timer.take() {
            timer.abort();
        }
    }
}

enum ReconnectPlan {
    Scheduled {
        changed: Option<ConnectionState>,
        attempt: u32,
        delay: Duration,
    },
    Exhausted {
        changed: Option<ConnectionState>,
        attempts: u32,
    },
}

/// Owns the connection state machine against the voice backend
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(client: Arc<dyn RealtimeClient>, policy: ReconnectPolicy, errors: ErrorReporter) -> Self {
        Self::build(client, policy, errors, None)
    }

    /// Create a manager that announces transitions on the event bus
    pub fn with_events(
        client: Arc<dyn RealtimeClient>,
        policy: ReconnectPolicy,
        errors: ErrorReporter,
        events: EventBus,
    ) -> Self {
        Self::build(client, policy, errors, Some(events))
    }

    fn build(
        client: Arc<dyn RealtimeClient>,
        policy: ReconnectPolicy,
        errors: ErrorReporter,
        events: Option<EventBus>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        Self {
            shared: Arc::new(Shared {
                client,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    policy,
                    timer: None,
                    epoch: 0,
                }),
                errors,
                events,
                state_tx,
                notice_tx,
                notice_rx: Mutex::new(Some(notice_rx)),
                disconnect_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    // === Queries ===

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current reconnect attempt (0 when idle)
    pub fn attempt(&self) -> u32 {
        self.shared.inner.lock().policy.attempt()
    }

    /// Snapshot of the backoff policy
    pub fn policy(&self) -> ReconnectPolicy {
        self.shared.inner.lock().policy.clone()
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.shared
            .inner
            .lock()
            .timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Take the reconnect outcome receiver (only the first caller gets it)
    pub fn take_notices(&self) -> Option<mpsc::UnboundedReceiver<ConnectionNotice>> {
        self.shared.notice_rx.lock().take()
    }

    /// Run `hook` on every transition into `Disconnected`
    pub fn on_disconnected(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.shared.disconnect_hooks.lock().push(Box::new(hook));
    }

    // === Transitions ===

    /// Open the connection
    ///
    /// Only valid from `Disconnected`. A failure is reported as a Connection
    /// error and returned so the caller can unwind its own setup.
    pub async fn connect(&self) -> Result<()> {
        let (changed, epoch) = {
            let mut inner = self.shared.inner.lock();
            if inner.state != ConnectionState::Disconnected {
                return Err(SessionError::InvalidState(format!(
                    "Cannot connect while {}",
                    inner.state
                )));
            }
            (inner.transition(ConnectionState::Connecting), inner.epoch)
        };
        self.announce(changed);

        info!("Connecting to voice backend");
        let result = self.shared.client.connect().await;

        let outcome = {
            let mut inner = self.shared.inner.lock();
            if inner.epoch != epoch {
                None
            } else if result.is_ok() {
                inner.policy.reset();
                Some(inner.transition(ConnectionState::Connected))
            } else {
                Some(inner.transition(ConnectionState::Disconnected))
            }
        };

        let Some(changed) = outcome else {
            if result.is_ok() {
                self.shared.client.disconnect().await;
            }
            return Err(SessionError::InvalidState(
                "Connect superseded by disconnect".into(),
            ));
        };

        match result {
            Ok(()) => {
                info!("Connected to voice backend");
                self.shared.errors.clear();
                self.announce(changed);
                Ok(())
            }
            Err(e) => {
                error!("Connection failed: {}", e);
                self.announce(changed);
                self.shared.errors.set(ErrorKind::Connection, Some(e.to_string().as_str()));
                Err(e)
            }
        }
    }

    /// React to the backend dropping an established connection
    pub fn handle_unexpected_disconnect(&self) {
        let changed = {
            let mut inner = self.shared.inner.lock();
            if inner.state != ConnectionState::Connected {
                debug!("Ignoring connection loss while {}", inner.state);
                return;
            }
            inner.transition(ConnectionState::Disconnected)
        };

        warn!("Connection lost, attempting to reconnect");
        self.announce(changed);
        self.reconnect();
    }

    /// Close the connection and cancel any pending reconnect
    ///
    /// Safe to call in any state; from `Disconnected` it only cancels the timer.
    pub async fn disconnect(&self) {
        let (was, changed) = {
            let mut inner = self.shared.inner.lock();
            if let Some(timer) = inner.timer.take() {
                timer.abort();
                debug!("Cancelled pending reconnect");
            }
            inner.epoch += 1;
            inner.policy.reset();
            let was = inner.state;
            (was, inner.transition(ConnectionState::Disconnected))
        };

        if was == ConnectionState::Disconnected {
            return;
        }

        self.shared.client.disconnect().await;
        info!("Disconnected from voice backend");
        self.announce(changed);
    }

    /// Cancel the pending reconnect timer without touching the connection
    pub fn cancel_reconnect(&self) {
        if let Some(timer) = self.shared.inner.lock().timer.take() {
            timer.abort();
            debug!("Cancelled pending reconnect");
        }
    }

    /// Forget earlier failed attempts
    pub fn reset_reconnect_attempts(&self) {
        self.shared.inner.lock().policy.reset();
    }

    fn reconnect(&self) {
        let plan = {
            let mut inner = self.shared.inner.lock();
            self.plan_reconnect(&mut inner)
        };
        self.finish_plan(plan);
    }

    fn plan_reconnect(&self, inner: &mut Inner) -> ReconnectPlan {
        inner.timer = None;

        if inner.policy.is_exhausted() {
            let attempts = inner.policy.attempt();
            return ReconnectPlan::Exhausted {
                changed: inner.transition(ConnectionState::Disconnected),
                attempts,
            };
        }

        let attempt = inner.policy.advance();
        let delay = inner.policy.delay_for(attempt);
        let changed = inner.transition(ConnectionState::Reconnecting);
        let epoch = inner.epoch;

        let weak = Arc::downgrade(&self.shared);
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            attempt_reconnect(weak, epoch).await;
        }));

        ReconnectPlan::Scheduled {
            changed,
            attempt,
            delay,
        }
    }

    fn announce(&self, changed: Option<ConnectionState>) {
        let Some(state) = changed else {
            return;
        };

        if state == ConnectionState::Disconnected {
            for hook in self.shared.disconnect_hooks.lock().iter() {
                hook();
            }
        }

        self.shared.state_tx.send_replace(state);
        if let Some(events) = &self.shared.events {
            events.publish(SessionEvent::ConnectionChanged(state));
        }
    }
}

enum AttemptOutcome {
    Stale,
    Reconnected(Option<ConnectionState>),
    Failed(ReconnectPlan),
}

async fn attempt_reconnect(shared: Weak<Shared>, epoch: u64) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let manager = ConnectionManager { shared };

    {
        let inner = manager.shared.inner.lock();
        if inner.epoch != epoch || inner.state != ConnectionState::Reconnecting {
            return;
        }
    }

    let result = manager.shared.client.connect().await;

    let outcome = {
        let mut inner = manager.shared.inner.lock();
        if inner.epoch != epoch {
            AttemptOutcome::Stale
        } else {
            match &result {
                Ok(()) => {
                    inner.timer = None;
                    inner.policy.reset();
                    AttemptOutcome::Reconnected(inner.transition(ConnectionState::Connected))
                }
                Err(e) => {
                    warn!("Reconnection failed: {}", e);
                    AttemptOutcome::Failed(manager.plan_reconnect(&mut inner))
                }
            }
        }
    };

    match outcome {
        AttemptOutcome::Stale => {
            if result.is_ok() {
                manager.shared.client.disconnect().await;
            }
        }
        AttemptOutcome::Reconnected(changed) => {
            info!("Reconnected successfully");
            manager.shared.errors.clear();
            manager.announce(changed);
            let _ = manager.shared.notice_tx.send(ConnectionNotice::Reconnected);
        }
        AttemptOutcome::Failed(plan) => manager.finish_plan(plan),
    }
}

impl ConnectionManager {
    fn finish_plan(&self, plan: ReconnectPlan) {
        match plan {
            ReconnectPlan::Scheduled {
                changed,
                attempt,
                delay,
            } => {
                info!(
                    "Reconnecting in {}ms (attempt {}/{})",
                    delay.as_millis(),
                    attempt,
                    self.policy().max_attempts()
                );
                self.announce(changed);
            }
            ReconnectPlan::Exhausted { changed, attempts } => {
                error!("Max reconnect attempts reached ({})", attempts);
                self.announce(changed);
                self.shared.errors.set(
                    ErrorKind::Connection,
                    Some("Reconnect attempts exhausted"),
                );
                let _ = self.shared.notice_tx.send(ConnectionNotice::ReconnectExhausted);
            }
        }
    }
}
