//! Top-level session controller
//!
//! Every command either completes or rolls back: a failed connect leaves no
//! device open, and teardown keeps going past individual device errors.

use super::log::{EventLog, EventSource, LoggedEvent};
use super::memory::SharedMemory;
use super::state::{SessionState, TurnDetectionMode};
use crate::audio::{AudioCoordinator, AudioFrame, AudioPlayer, AudioRecorder, FrameSink, StreamPlayer};
use crate::backend::{ClientEvent, ContentItem, RealtimeClient, SessionUpdate};
use crate::config::SessionConfig;
use crate::connection::{ConnectionManager, ConnectionNotice, ConnectionState};
use crate::error_report::{ErrorKind, ErrorRecord, ErrorReporter};
use crate::events::{EventBus, SessionEvent};
use crate::permission::{MicrophoneAccess, PermissionGate, PermissionState};
use crate::tools::{SetMemoryTool, ToolDispatcher};
use crate::{Result, SessionError};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, TryRecvError};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Builder for a [`SessionController`]
pub struct SessionBuilder {
    config: SessionConfig,
    client: Arc<dyn RealtimeClient>,
    recorder: Option<Box<dyn AudioRecorder>>,
    player: Option<Box<dyn AudioPlayer>>,
    microphone: Option<Arc<dyn MicrophoneAccess>>,
}

impl SessionBuilder {
    pub fn new(client: Arc<dyn RealtimeClient>) -> Self {
        Self {
            config: SessionConfig::default(),
            client,
            recorder: None,
            player: None,
            microphone: None,
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_recorder(mut self, recorder: Box<dyn AudioRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Playback device; defaults to a headless [`StreamPlayer`]
    pub fn with_player(mut self, player: Box<dyn AudioPlayer>) -> Self {
        self.player = Some(player);
        self
    }

    pub fn with_microphone(mut self, microphone: Arc<dyn MicrophoneAccess>) -> Self {
        self.microphone = Some(microphone);
        self
    }

    pub fn build(self) -> Result<SessionController> {
        self.config.validate()?;

        let recorder = self
            .recorder
            .ok_or_else(|| SessionError::Config("A capture device is required".into()))?;
        let microphone = self
            .microphone
            .ok_or_else(|| SessionError::Config("A microphone permission source is required".into()))?;
        let player = self
            .player
            .unwrap_or_else(|| Box::new(StreamPlayer::new()));

        let (events, events_rx) = EventBus::new(self.config.events.channel_capacity);
        let errors = ErrorReporter::with_events(events.clone());
        let memory = SharedMemory::with_events(events.clone());

        let tools = ToolDispatcher::new(memory.writer());
        tools.register(SetMemoryTool);

        let connection = ConnectionManager::with_events(
            Arc::clone(&self.client),
            self.config.reconnect.policy(),
            errors.clone(),
            events.clone(),
        );

        let state = Arc::new(RwLock::new(SessionState::new(
            self.config.session.turn_detection,
        )));

        // Losing the connection always ends push-to-talk
        {
            let state = Arc::clone(&state);
            let events = events.clone();
            connection.on_disconnected(move || {
                let was_recording = std::mem::replace(&mut state.write().is_recording, false);
                if was_recording {
                    events.publish(SessionEvent::RecordingChanged(false));
                }
            });
        }

        let core = SessionCore {
            permission: PermissionGate::with_events(microphone, events.clone()),
            audio: AudioCoordinator::new(recorder, player),
            client: self.client,
            config: self.config,
            connection,
            errors,
            tools,
            memory,
            state,
            log: Mutex::new(EventLog::new()),
            events,
            connect_in_flight: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        };

        Ok(SessionController {
            core: Arc::new(core),
            events_rx,
            pump: Mutex::new(None),
        })
    }
}

struct SessionCore {
    config: SessionConfig,
    client: Arc<dyn RealtimeClient>,
    connection: ConnectionManager,
    audio: AudioCoordinator,
    permission: PermissionGate,
    errors: ErrorReporter,
    tools: ToolDispatcher,
    memory: SharedMemory,
    state: Arc<RwLock<SessionState>>,
    log: Mutex<EventLog>,
    events: EventBus,
    /// Set for the whole connect sequence, devices included
    connect_in_flight: AtomicBool,
    /// Bumped by every disconnect; a connect started earlier is abandoned
    generation: AtomicU64,
}

/// Clears the in-flight flag however the connect sequence ends
struct ConnectFlag<'a>(&'a AtomicBool);

impl<'a> ConnectFlag<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for ConnectFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Handle the UI drives the voice session through
pub struct SessionController {
    core: Arc<SessionCore>,
    events_rx: Receiver<SessionEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    pub fn builder(client: Arc<dyn RealtimeClient>) -> SessionBuilder {
        SessionBuilder::new(client)
    }

    /// Resolve microphone permission and start consuming backend events
    ///
    /// Call once after building. After [`SessionController::shutdown`] the
    /// controller cannot be started again.
    pub async fn start(&self) -> Result<PermissionState> {
        {
            let mut pump = self.pump.lock();
            if pump.is_some() {
                return Err(SessionError::InvalidState("Session already started".into()));
            }

            let notices = self.core.connection.take_notices().ok_or_else(|| {
                SessionError::InvalidState("Session was shut down and cannot restart".into())
            })?;
            let client_events = self.core.client.subscribe();
            let core = Arc::clone(&self.core);
            *pump = Some(tokio::spawn(run_event_pump(core, client_events, notices)));
        }

        let permission = self.core.permission.check().await;
        info!("Session started, microphone permission {}", permission);
        Ok(permission)
    }

    /// Stop the event pump, permission subscription and any reconnect timer
    pub fn shutdown(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.core.permission.unsubscribe();
        self.core.connection.cancel_reconnect();
        info!("Session shut down");
    }

    // === Commands ===

    /// Open a session: permission, devices, connection, greeting
    ///
    /// Requires [`SessionController::start`]; without the event pump nobody
    /// would react to connection loss or tool calls.
    pub async fn connect(&self) -> Result<()> {
        if self.pump.lock().is_none() {
            return Err(SessionError::InvalidState(
                "Session must be started before connecting".into(),
            ));
        }
        self.core.connect().await
    }

    /// Tear everything down; never fails
    pub async fn disconnect(&self) {
        self.core.disconnect().await
    }

    /// Push-to-talk press
    pub async fn start_recording(&self) -> Result<()> {
        self.core.start_recording().await
    }

    /// Push-to-talk release
    pub async fn stop_recording(&self) -> Result<()> {
        self.core.stop_recording().await
    }

    /// Switch turn detection; returns whether the new mode is manual
    pub async fn set_turn_detection_mode(&self, mode: TurnDetectionMode) -> bool {
        self.core.set_turn_detection_mode(mode).await
    }

    pub fn delete_conversation_item(&self, id: &str) -> Result<()> {
        self.core.delete_conversation_item(id)
    }

    /// Ask for microphone access explicitly
    pub async fn request_microphone_permission(&self) -> bool {
        self.core.permission.request().await
    }

    pub fn clear_error(&self) {
        self.core.errors.clear();
    }

    // === Queries ===

    pub fn connection_state(&self) -> ConnectionState {
        self.core.connection.state()
    }

    pub fn permission_state(&self) -> PermissionState {
        self.core.permission.state()
    }

    pub fn session_state(&self) -> SessionState {
        self.core.state.read().clone()
    }

    pub fn is_recording(&self) -> bool {
        self.core.state.read().is_recording
    }

    pub fn turn_detection_mode(&self) -> TurnDetectionMode {
        self.core.state.read().turn_detection_mode
    }

    pub fn error(&self) -> ErrorRecord {
        self.core.errors.current()
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.core.memory
    }

    /// Register additional tools here before connecting
    pub fn tools(&self) -> &ToolDispatcher {
        &self.core.tools
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.core.connection
    }

    pub fn event_log(&self) -> Vec<LoggedEvent> {
        self.core.log.lock().entries().to_vec()
    }

    /// Elapsed session time at `timestamp`, as `mm:ss.hh`
    pub fn format_elapsed(&self, timestamp: DateTime<Utc>) -> String {
        self.core.state.read().format_elapsed(timestamp)
    }

    /// Try to receive a session event (non-blocking)
    pub fn try_recv_event(&self) -> Option<SessionEvent> {
        match self.events_rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                warn!("Session event channel disconnected");
                None
            }
        }
    }

    /// Receiver for UIs that select over several channels
    pub fn event_receiver(&self) -> Receiver<SessionEvent> {
        self.events_rx.clone()
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
        self.core.connection.cancel_reconnect();
    }
}

impl SessionCore {
    async fn connect(&self) -> Result<()> {
        let Some(_flag) = ConnectFlag::acquire(&self.connect_in_flight) else {
            return Err(SessionError::InvalidState("Connect already in progress".into()));
        };
        let generation = self.generation.load(Ordering::Acquire);

        self.errors.clear();

        if !self.permission.ensure_granted().await {
            let err = SessionError::PermissionDenied;
            self.errors.report(&err);
            return Err(err);
        }

        let state = self.connection.state();
        if state != ConnectionState::Disconnected {
            return Err(SessionError::InvalidState(format!(
                "Cannot connect while {}",
                state
            )));
        }

        self.state.write().start(Utc::now());
        self.log.lock().clear();

        if let Err(e) = self.open_devices().await {
            error!("Failed to open audio devices: {}", e);
            self.errors.report(&e);
            self.release_devices().await;
            self.state.write().reset();
            return Err(e);
        }

        if self.superseded(generation) {
            info!("Connect abandoned, session was disconnected while opening devices");
            self.release_devices().await;
            self.state.write().reset();
            return Err(SessionError::InvalidState("Connect superseded by disconnect".into()));
        }

        self.configure_session();

        // Reported by the connection manager, which also rejects a connect
        // that a disconnect overtook
        if let Err(e) = self.connection.connect().await {
            self.release_devices().await;
            self.state.write().reset();
            return Err(e);
        }

        if let Err(e) = self.after_connect().await {
            error!("Session setup failed after connecting: {}", e);
            self.errors.report(&e);
            self.connection.disconnect().await;
            self.release_devices().await;
            self.state.write().reset();
            return Err(e);
        }

        info!("Session connected");
        Ok(())
    }

    async fn open_devices(&self) -> Result<()> {
        self.audio.begin().await?;
        self.audio.connect_player().await?;
        Ok(())
    }

    /// Push turn detection, instructions and tools to the backend
    fn configure_session(&self) {
        let mode = self.state.read().turn_detection_mode;
        let mut update = SessionUpdate::new(mode.turn_detection()).with_tools(self.tools.definitions());
        if let Some(instructions) = &self.config.session.instructions {
            update = update.with_instructions(instructions.clone());
        }

        self.log_event(EventSource::Client, "session.update");
        if let Err(e) = self.client.update_session(update) {
            warn!("Failed to configure session: {}", e);
        }
    }

    async fn after_connect(&self) -> Result<()> {
        let greeting = &self.config.session.greeting;
        if !greeting.is_empty() {
            self.log_event(EventSource::Client, "conversation.item.create");
            self.client
                .send_user_message_content(vec![ContentItem::text(greeting.clone())])?;
        }

        let mode = TurnDetectionMode::from_backend(self.client.turn_detection_type());
        if mode == TurnDetectionMode::ServerDetected {
            self.audio.record(self.capture_sink()).await?;
            debug!("Streaming capture for server turn detection");
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.connection.disconnect().await;

        self.state.write().reset();
        self.memory.clear();
        self.log.lock().clear();

        if let Some(e) = self.release_devices().await {
            self.errors.set(ErrorKind::General, Some(e.to_string().as_str()));
        }
        info!("Session disconnected");
    }

    /// Close capture and flush playback, continuing past failures
    async fn release_devices(&self) -> Option<SessionError> {
        let mut failure = None;

        if let Err(e) = self.audio.end().await {
            error!("Failed to close capture device: {}", e);
            failure = Some(e);
        }
        self.audio.interrupt().await;

        failure
    }

    async fn start_recording(&self) -> Result<()> {
        if !self.permission.ensure_granted().await {
            let err = SessionError::PermissionDenied;
            self.errors.report(&err);
            return Err(err);
        }

        if !self.state.read().turn_detection_mode.is_manual() {
            warn!("Push-to-talk used while the server detects turns");
        }

        self.set_recording(true);
        if let Err(e) = self.begin_utterance().await {
            error!("Start recording error: {}", e);
            self.set_recording(false);
            self.errors.set(ErrorKind::Microphone, Some(e.to_string().as_str()));
            return Err(e);
        }
        Ok(())
    }

    async fn begin_utterance(&self) -> Result<()> {
        // Cut the assistant off before the user speaks over it
        if let Some(offset) = self.audio.interrupt().await {
            self.log_event(EventSource::Client, "response.cancel");
            self.client
                .cancel_response(&offset.track_id, offset.offset)
                .await?;
        }
        self.audio.record(self.capture_sink()).await
    }

    async fn stop_recording(&self) -> Result<()> {
        self.set_recording(false);

        let result = async {
            self.audio.pause().await?;
            self.log_event(EventSource::Client, "response.create");
            self.client.create_response()
        }
        .await;

        if let Err(e) = &result {
            error!("Stop recording error: {}", e);
            self.errors.set(ErrorKind::General, Some(e.to_string().as_str()));
        }
        result
    }

    async fn set_turn_detection_mode(&self, mode: TurnDetectionMode) -> bool {
        if mode.is_manual() {
            match self.audio.pause_if_recording().await {
                Ok(true) => self.set_recording(false),
                Ok(false) => {}
                Err(e) => self.errors.report(&e),
            }
        }

        self.state.write().turn_detection_mode = mode;
        info!("Turn detection set to {}", mode);

        self.log_event(EventSource::Client, "session.update");
        if let Err(e) = self.client.update_session(SessionUpdate::new(mode.turn_detection())) {
            warn!("Failed to update turn detection: {}", e);
        }

        if mode == TurnDetectionMode::ServerDetected && self.connection.is_connected() {
            if let Err(e) = self.audio.record(self.capture_sink()).await {
                self.errors.report(&e);
            }
        }

        mode.is_manual()
    }

    fn delete_conversation_item(&self, id: &str) -> Result<()> {
        self.log_event(EventSource::Client, "conversation.item.delete");
        self.client.delete_item(id).map_err(|e| {
            self.errors.set(ErrorKind::General, Some(e.to_string().as_str()));
            e
        })
    }

    // === Backend events ===

    async fn handle_client_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::ConnectionLost { reason } => {
                self.log_event(EventSource::Server, "connection.lost");
                if self.connection.state() != ConnectionState::Connected {
                    debug!("Connection loss while {}: {}", self.connection.state(), reason);
                    return;
                }

                warn!("Connection lost: {}", reason);
                if let Err(e) = self.audio.pause_if_recording().await {
                    warn!("Failed to pause capture after connection loss: {}", e);
                }
                self.connection.handle_unexpected_disconnect();
            }
            ClientEvent::ToolCall {
                call_id,
                name,
                arguments,
            } => {
                self.log_event(EventSource::Server, "response.function_call_arguments.done");
                let result = self.tools.dispatch(&name, arguments).await;
                self.events.publish(SessionEvent::ToolCompleted {
                    name: name.clone(),
                    success: result.is_success(),
                });

                self.log_event(EventSource::Client, "conversation.item.create");
                if let Err(e) = self.client.submit_tool_result(&call_id, &result) {
                    warn!("Failed to return result of {}: {}", name, e);
                    return;
                }
                self.log_event(EventSource::Client, "response.create");
                if let Err(e) = self.client.create_response() {
                    warn!("Failed to request response after {}: {}", name, e);
                }
            }
            ClientEvent::AudioDelta { item_id, samples } => {
                self.log_event(EventSource::Server, "response.audio.delta");
                self.audio.add_pcm(&item_id, &samples).await;
            }
            ClientEvent::ServerEvent { kind } => {
                self.log_event(EventSource::Server, kind);
            }
        }
    }

    async fn handle_notice(&self, notice: ConnectionNotice) {
        match notice {
            ConnectionNotice::Reconnected => {
                let mode = self.state.read().turn_detection_mode;
                if mode == TurnDetectionMode::ServerDetected {
                    if let Err(e) = self.audio.record(self.capture_sink()).await {
                        self.errors.report(&e);
                    }
                }
            }
            ConnectionNotice::ReconnectExhausted => {
                // The connection error stays visible; only resources go
                warn!("Reconnect exhausted, releasing session resources");
                self.release_devices().await;
                self.state.write().reset();
                self.memory.clear();
            }
        }
    }

    // === Helpers ===

    fn superseded(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) != generation
    }

    fn capture_sink(&self) -> FrameSink {
        let client = Arc::clone(&self.client);
        Box::new(move |frame: AudioFrame| {
            if let Err(e) = client.append_input_audio(&frame.mono) {
                debug!("Dropping captured frame: {}", e);
            }
        })
    }

    fn set_recording(&self, recording: bool) {
        let changed = {
            let mut state = self.state.write();
            std::mem::replace(&mut state.is_recording, recording) != recording
        };
        if changed {
            self.events.publish(SessionEvent::RecordingChanged(recording));
        }
    }

    fn log_event(&self, source: EventSource, kind: impl Into<String>) {
        self.log.lock().record(source, kind);
    }
}

async fn run_event_pump(
    core: Arc<SessionCore>,
    mut client_events: broadcast::Receiver<ClientEvent>,
    mut notices: mpsc::UnboundedReceiver<ConnectionNotice>,
) {
    debug!("Event pump started");
    loop {
        tokio::select! {
            event = client_events.recv() => match event {
                Ok(event) => core.handle_client_event(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event pump lagged, {} backend events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(notice) = notices.recv() => core.handle_notice(notice).await,
        }
    }
    debug!("Event pump stopped");
}
