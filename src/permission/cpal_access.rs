//! Desktop microphone access through cpal
//!
//! Desktop hosts have no permission status query, so the gate resolves to
//! `Prompt` and the first request opens (and immediately closes) an input
//! stream on the default device.

use super::{MicrophoneAccess, MicrophoneLease, PermissionStatus};
use crate::{Result, SessionError};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Default, Clone, Copy)]
pub struct CpalMicrophone;

impl CpalMicrophone {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MicrophoneAccess for CpalMicrophone {
    fn capture_supported(&self) -> bool {
        cpal::default_host()
            .input_devices()
            .map(|mut devices| devices.next().is_some())
            .unwrap_or(false)
    }

    async fn query(&self) -> Option<watch::Receiver<PermissionStatus>> {
        None
    }

    async fn acquire(&self) -> Result<MicrophoneLease> {
        // cpal streams are not Send; open and drop the test stream on a blocking thread
        tokio::task::spawn_blocking(open_default_input)
            .await
            .map_err(|e| SessionError::Microphone(format!("Access check task failed: {}", e)))??;

        Ok(MicrophoneLease::closed())
    }
}

fn open_default_input() -> Result<()> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| SessionError::Microphone("No input device available".into()))?;

    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    let config = device
        .default_input_config()
        .map_err(|e| SessionError::Microphone(format!("Failed to get input config: {}", e)))?;

    let stream = device
        .build_input_stream(
            &config.into(),
            |_: &[f32], _: &cpal::InputCallbackInfo| {},
            |err| debug!("Access check stream error: {}", err),
            None,
        )
        .map_err(|e| SessionError::Microphone(format!("Failed to open input stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| SessionError::Microphone(format!("Failed to start input stream: {}", e)))?;
    drop(stream);

    info!("Microphone access check succeeded on {}", name);
    Ok(())
}
