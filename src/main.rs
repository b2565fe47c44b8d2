use anyhow::{Context, Result};
use parley::backend::{ClientEvent, LoopbackClient};
use parley::{SessionConfig, SessionController, TurnDetectionMode};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting parley session demo");

    let config = match SessionConfig::default_path() {
        Some(path) => SessionConfig::load_or_default(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };

    // Offline backend that answers every response request with 100ms of audio
    let client = Arc::new(LoopbackClient::new().with_reply_audio(vec![0; 2400]));
    let session = build_session(config, client.clone())?;

    let permission = session.start().await?;
    info!("Microphone permission: {}", permission);

    session.connect().await?;

    // One push-to-talk turn
    session.start_recording().await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    session.stop_recording().await?;
    info!("Sent {} captured samples", client.input_samples());

    // The assistant stores something through a tool
    client.emit(ClientEvent::ToolCall {
        call_id: "call_demo".into(),
        name: "set_memory".into(),
        arguments: json!({ "key": "favorite_color", "value": "green" }),
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    info!("Memory: {:?}", session.memory().snapshot());

    // Transport drops; the session reconnects on its own
    client.drop_connection("demo network blip");
    tokio::time::sleep(Duration::from_millis(1500)).await;
    info!("Connection after blip: {}", session.connection_state());

    let manual = session
        .set_turn_detection_mode(TurnDetectionMode::ServerDetected)
        .await;
    info!("Push-to-talk enabled: {}", manual);
    tokio::time::sleep(Duration::from_millis(200)).await;

    session.disconnect().await;

    for entry in session.event_log() {
        info!("{:?} {} x{}", entry.source, entry.kind, entry.count);
    }
    while let Some(event) = session.try_recv_event() {
        info!("Event: {:?}", event);
    }

    let error = session.error();
    if error.has_error {
        warn!("Last error: {}", error.message);
    }

    session.shutdown();
    Ok(())
}

#[cfg(feature = "audio-io")]
fn build_session(config: SessionConfig, client: Arc<LoopbackClient>) -> Result<SessionController> {
    use parley::audio::{CpalPlayer, CpalRecorder};
    use parley::permission::CpalMicrophone;

    Ok(SessionController::builder(client)
        .with_config(config)
        .with_recorder(Box::new(CpalRecorder::new()))
        .with_player(Box::new(CpalPlayer::new()))
        .with_microphone(Arc::new(CpalMicrophone::new()))
        .build()?)
}

#[cfg(not(feature = "audio-io"))]
fn build_session(config: SessionConfig, client: Arc<LoopbackClient>) -> Result<SessionController> {
    use parley::audio::{StreamPlayer, ToneRecorder};
    use parley::permission::StaticMicrophone;

    Ok(SessionController::builder(client)
        .with_config(config)
        .with_recorder(Box::new(ToneRecorder::default()))
        .with_player(Box::new(StreamPlayer::new()))
        .with_microphone(Arc::new(StaticMicrophone::granted()))
        .build()?)
}
