//! Integration tests for the session controller
//!
//! These drive the full controller against the loopback backend and mock
//! devices, checking the lifecycle and ordering guarantees end to end.

mod common;

use common::{settle, Harness, MockMicrophone, RecorderSpy};
use parley::audio::RecorderStatus;
use parley::backend::{
    ClientCall, ClientEvent, ContentItem, RealtimeClient, SessionUpdate, TurnDetection,
};
use parley::permission::PermissionStatus;
use parley::{
    ConnectionState, ErrorKind, PermissionState, SessionConfig, SessionError, SessionEvent,
    TurnDetectionMode,
};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn server_vad() -> SessionConfig {
    SessionConfig::default().with_turn_detection(TurnDetectionMode::ServerDetected)
}

#[tokio::test]
async fn test_connect_opens_devices_and_greets() {
    let config = SessionConfig::default().with_greeting("hello there");
    let h = Harness::connected(config).await;

    assert_eq!(h.session.connection_state(), ConnectionState::Connected);
    assert_eq!(h.session.permission_state(), PermissionState::Granted);
    assert_eq!(h.recorder.status(), RecorderStatus::Idle);
    assert!(h.session.session_state().start_time.is_some());

    let greeting = ClientCall::SendUserMessage(vec![ContentItem::text("hello there")]);
    assert_eq!(h.client.count_calls(|c| *c == greeting), 1);

    // Manual turns: nothing streams until push-to-talk
    assert_eq!(RecorderSpy::count(&h.recorder.records), 0);
}

#[tokio::test]
async fn test_connect_streams_capture_with_server_turns() {
    let h = Harness::connected(server_vad()).await;

    assert_eq!(RecorderSpy::count(&h.recorder.records), 1);
    assert!(h.recorder.push_frame(480));
    assert_eq!(h.client.input_samples(), 480);
}

#[tokio::test]
async fn test_connect_pushes_session_configuration() {
    let config = server_vad().with_instructions("be brief");
    let h = Harness::connected(config).await;

    let updates: Vec<SessionUpdate> = h
        .client
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            ClientCall::UpdateSession(update) => Some(update),
            _ => None,
        })
        .collect();

    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].turn_detection, Some(TurnDetection::server_vad()));
    assert_eq!(updates[0].instructions.as_deref(), Some("be brief"));
    assert!(updates[0].tools.iter().any(|t| t.name == "set_memory"));
}

#[tokio::test]
async fn test_connect_refused_permission_makes_no_network_call() {
    let h = Harness::with_microphone(SessionConfig::default(), MockMicrophone::prompting(false));
    h.session.start().await.unwrap();

    let err = h.session.connect().await.unwrap_err();
    assert_eq!(err, SessionError::PermissionDenied);
    assert_eq!(h.session.error().kind, Some(ErrorKind::Microphone));
    assert_eq!(h.session.permission_state(), PermissionState::Denied);
    assert!(h.client.calls().is_empty());
    assert_eq!(RecorderSpy::count(&h.recorder.begins), 0);
}

#[tokio::test]
async fn test_connect_failure_rolls_back_devices() {
    let h = Harness::new(SessionConfig::default());
    h.session.start().await.unwrap();
    h.client.fail_next_connects(1);

    assert!(h.session.connect().await.is_err());
    assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);
    assert_eq!(h.session.error().kind, Some(ErrorKind::Connection));
    assert_eq!(h.recorder.status(), RecorderStatus::Ended);
    assert_eq!(h.session.session_state().start_time, None);

    // A later attempt works from a clean slate
    h.session.connect().await.unwrap();
    assert_eq!(h.session.connection_state(), ConnectionState::Connected);
    assert!(!h.session.error().has_error);
}

#[tokio::test]
async fn test_connect_requires_started_session() {
    let h = Harness::new(SessionConfig::default());

    let err = h.session.connect().await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidState(_)));
    assert!(h.client.calls().is_empty());
    assert_eq!(RecorderSpy::count(&h.recorder.begins), 0);

    h.session.start().await.unwrap();
    h.session.shutdown();
    assert!(matches!(
        h.session.connect().await,
        Err(SessionError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_second_connect_while_opening_devices_is_rejected() {
    let h = Harness::new(SessionConfig::default());
    h.session.start().await.unwrap();
    let gate = h.recorder.hold_begin();

    let connecting = h.session.connect();
    tokio::pin!(connecting);
    assert!(futures::poll!(connecting.as_mut()).is_pending());

    let second = h.session.connect().await;
    assert!(matches!(second, Err(SessionError::InvalidState(_))));

    gate.notify_one();
    connecting.await.unwrap();

    // The first session keeps its capture device
    assert_eq!(h.session.connection_state(), ConnectionState::Connected);
    assert_eq!(h.recorder.status(), RecorderStatus::Idle);
    assert_eq!(RecorderSpy::count(&h.recorder.begins), 1);
    assert_eq!(RecorderSpy::count(&h.recorder.ends), 0);
    assert_eq!(h.client.connect_attempts(), 1);
}

#[tokio::test]
async fn test_disconnect_while_opening_devices_abandons_connect() {
    let h = Harness::new(SessionConfig::default());
    h.session.start().await.unwrap();
    let gate = h.recorder.hold_begin();

    let connecting = h.session.connect();
    tokio::pin!(connecting);
    assert!(futures::poll!(connecting.as_mut()).is_pending());

    let (connected, ()) = tokio::join!(connecting, async {
        gate.notify_one();
        h.session.disconnect().await;
    });

    assert!(matches!(connected, Err(SessionError::InvalidState(_))));
    assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);
    assert_eq!(h.client.connect_attempts(), 0);
    assert_eq!(h.recorder.status(), RecorderStatus::Ended);
    assert_eq!(h.session.session_state().start_time, None);
    assert!(!h.session.error().has_error);

    // Nothing is left behind for the next attempt
    gate.notify_one();
    h.session.connect().await.unwrap();
    assert_eq!(h.session.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_device_failure_aborts_before_network() {
    let h = Harness::new(SessionConfig::default());
    h.session.start().await.unwrap();
    h.recorder.fail_begin.store(true, Ordering::SeqCst);

    assert!(h.session.connect().await.is_err());
    assert_eq!(h.session.error().kind, Some(ErrorKind::Microphone));
    assert_eq!(h.client.connect_attempts(), 0);
    assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_start_recording_refused_permission() {
    let h = Harness::with_microphone(SessionConfig::default(), MockMicrophone::prompting(false));
    h.session.start().await.unwrap();

    let err = h.session.start_recording().await.unwrap_err();
    assert_eq!(err, SessionError::PermissionDenied);
    assert!(!h.session.is_recording());
    assert_eq!(h.session.error().kind, Some(ErrorKind::Microphone));
    assert_eq!(RecorderSpy::count(&h.recorder.records), 0);
    assert!(h.client.calls().is_empty());
}

#[tokio::test]
async fn test_push_to_talk_cancels_playing_response_first() {
    let h = Harness::connected(SessionConfig::default()).await;

    h.client.emit(ClientEvent::AudioDelta {
        item_id: "item_reply".into(),
        samples: vec![1; 2400],
    });
    settle().await;
    assert!(h.playback.is_playing());

    let mut played = [0i16; 600];
    h.playback.pull(&mut played);

    let client = h.client.clone();
    h.recorder.on_record(move || {
        let cancelled = client.count_calls(|c| matches!(c, ClientCall::CancelResponse { .. }));
        assert_eq!(cancelled, 1, "capture began before the response was cancelled");
    });

    h.session.start_recording().await.unwrap();
    assert!(h.session.is_recording());
    assert!(!h.playback.is_playing());

    let cancels: Vec<_> = h
        .client
        .calls()
        .into_iter()
        .filter(|c| matches!(c, ClientCall::CancelResponse { .. }))
        .collect();
    assert_eq!(
        cancels,
        vec![ClientCall::CancelResponse {
            track_id: "item_reply".into(),
            offset: 600,
        }]
    );

    assert!(h.recorder.push_frame(240));
    assert_eq!(h.client.input_samples(), 240);

    h.session.stop_recording().await.unwrap();
    assert!(!h.session.is_recording());
    assert_eq!(RecorderSpy::count(&h.recorder.pauses), 1);
    assert_eq!(h.client.count_calls(|c| matches!(c, ClientCall::CreateResponse)), 1);
}

#[tokio::test]
async fn test_push_to_talk_without_playback_skips_cancel() {
    let h = Harness::connected(SessionConfig::default()).await;

    h.session.start_recording().await.unwrap();
    assert_eq!(
        h.client.count_calls(|c| matches!(c, ClientCall::CancelResponse { .. })),
        0
    );
    assert_eq!(RecorderSpy::count(&h.recorder.records), 1);
}

#[tokio::test]
async fn test_stop_recording_failure_is_general() {
    let h = Harness::new(SessionConfig::default());
    h.session.start().await.unwrap();

    // Never connected, so the recorder was never begun
    assert!(h.session.stop_recording().await.is_err());
    assert_eq!(h.session.error().kind, Some(ErrorKind::General));
}

#[tokio::test]
async fn test_manual_mode_pauses_capture_once() {
    let h = Harness::connected(server_vad()).await;
    assert_eq!(h.recorder.status(), RecorderStatus::Recording);

    assert!(h.session.set_turn_detection_mode(TurnDetectionMode::Manual).await);
    assert!(h.session.set_turn_detection_mode(TurnDetectionMode::Manual).await);

    assert_eq!(RecorderSpy::count(&h.recorder.pauses), 1);
    assert_eq!(h.recorder.status(), RecorderStatus::Idle);

    let last_update = h.client.calls().into_iter().rev().find_map(|c| match c {
        ClientCall::UpdateSession(update) => Some(update),
        _ => None,
    });
    assert_eq!(last_update, Some(SessionUpdate::new(None)));
}

#[tokio::test]
async fn test_server_mode_starts_streaming_when_connected() {
    let h = Harness::connected(SessionConfig::default()).await;

    let manual = h
        .session
        .set_turn_detection_mode(TurnDetectionMode::ServerDetected)
        .await;
    assert!(!manual);
    assert_eq!(h.session.turn_detection_mode(), TurnDetectionMode::ServerDetected);
    assert_eq!(h.recorder.status(), RecorderStatus::Recording);
}

#[tokio::test]
async fn test_server_mode_while_disconnected_only_updates_session() {
    let h = Harness::new(SessionConfig::default());
    h.session.start().await.unwrap();

    assert!(!h.session.set_turn_detection_mode(TurnDetectionMode::ServerDetected).await);
    assert_eq!(RecorderSpy::count(&h.recorder.records), 0);
    assert_eq!(
        h.client.count_calls(|c| matches!(c, ClientCall::UpdateSession(_))),
        1
    );
}

#[tokio::test]
async fn test_disconnect_clears_memory_and_releases_devices() {
    let h = Harness::connected(server_vad()).await;

    h.client.emit(ClientEvent::ToolCall {
        call_id: "call_1".into(),
        name: "set_memory".into(),
        arguments: json!({ "key": "pickup", "value": "3pm" }),
    });
    settle().await;
    assert_eq!(h.session.memory().get("pickup"), Some(json!("3pm")));

    h.session.disconnect().await;

    assert!(h.session.memory().is_empty());
    assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);
    assert_eq!(h.recorder.status(), RecorderStatus::Ended);
    assert_eq!(h.session.session_state().start_time, None);
    assert!(h.session.event_log().is_empty());
    assert!(!h.client.is_connected());
}

#[tokio::test]
async fn test_disconnect_on_empty_memory_stays_empty() {
    let h = Harness::new(SessionConfig::default());
    h.session.start().await.unwrap();

    h.session.disconnect().await;
    assert!(h.session.memory().is_empty());
    assert!(!h.session.error().has_error);
}

#[tokio::test]
async fn test_disconnect_continues_past_device_errors() {
    let h = Harness::connected(SessionConfig::default()).await;
    h.session.memory().writer().set("k", json!(1));
    h.recorder.fail_end.store(true, Ordering::SeqCst);

    h.session.disconnect().await;

    assert_eq!(h.session.error().kind, Some(ErrorKind::General));
    assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);
    assert!(h.session.memory().is_empty());
    assert!(!h.client.is_connected());
}

#[tokio::test]
async fn test_tool_call_round_trip() {
    let h = Harness::connected(SessionConfig::default()).await;
    h.client.clear_calls();

    h.client.emit(ClientEvent::ToolCall {
        call_id: "call_7".into(),
        name: "set_memory".into(),
        arguments: json!({ "key": "favorite_color", "value": "blue" }),
    });
    settle().await;

    let calls = h.client.calls();
    assert_eq!(
        calls[0],
        ClientCall::SubmitToolResult {
            call_id: "call_7".into(),
            result: json!({ "success": true, "message": "Saved favorite_color", "key": "favorite_color" }),
        }
    );
    assert_eq!(calls[1], ClientCall::CreateResponse);

    let events: Vec<_> = std::iter::from_fn(|| h.session.try_recv_event()).collect();
    assert!(events.contains(&SessionEvent::ToolCompleted {
        name: "set_memory".into(),
        success: true
    }));
    assert!(events.contains(&SessionEvent::MemoryUpdated));
}

#[tokio::test]
async fn test_unknown_tool_call_keeps_session_alive() {
    let h = Harness::connected(SessionConfig::default()).await;

    h.client.emit(ClientEvent::ToolCall {
        call_id: "call_x".into(),
        name: "unknown_tool".into(),
        arguments: json!({}),
    });
    settle().await;

    let submitted = h.client.calls().into_iter().find_map(|c| match c {
        ClientCall::SubmitToolResult { result, .. } => Some(result),
        _ => None,
    });
    assert_eq!(submitted, Some(json!({ "success": false, "error": "unknown tool" })));
    assert_eq!(h.session.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_faulting_tool_is_contained() {
    let h = Harness::connected(SessionConfig::default()).await;
    h.session.tools().register_fn(
        parley::tools::ToolDefinition {
            name: "route_students".into(),
            description: "Plan a pickup route".into(),
            parameters: json!({ "type": "object", "properties": {}, "required": [] }),
        },
        |_, _| panic!("route table corrupted"),
    );

    h.client.emit(ClientEvent::ToolCall {
        call_id: "call_r".into(),
        name: "route_students".into(),
        arguments: json!({}),
    });
    settle().await;

    let submitted = h.client.calls().into_iter().find_map(|c| match c {
        ClientCall::SubmitToolResult { result, .. } => Some(result),
        _ => None,
    });
    assert_eq!(submitted.unwrap()["success"], json!(false));
    assert_eq!(h.session.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_delete_conversation_item() {
    let h = Harness::connected(SessionConfig::default()).await;
    h.session.delete_conversation_item("item_42").unwrap();
    assert_eq!(
        h.client.count_calls(|c| *c == ClientCall::DeleteItem("item_42".into())),
        1
    );

    h.session.disconnect().await;
    assert!(h.session.delete_conversation_item("item_42").is_err());
}

#[tokio::test]
async fn test_permission_revoked_by_platform() {
    let (microphone, status) = MockMicrophone::queryable(PermissionStatus::Granted);
    let h = Harness::with_microphone(SessionConfig::default(), microphone);

    assert_eq!(h.session.start().await.unwrap(), PermissionState::Granted);

    status.send(PermissionStatus::Denied).unwrap();
    settle().await;
    assert_eq!(h.session.permission_state(), PermissionState::Denied);

    // The next use asks again and is refused
    h.microphone.allow.store(false, Ordering::SeqCst);
    assert!(h.session.start_recording().await.is_err());
    assert_eq!(h.microphone.acquisitions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_server_events_are_logged() {
    let h = Harness::connected(SessionConfig::default()).await;
    for _ in 0..3 {
        h.client.emit(ClientEvent::ServerEvent {
            kind: "response.audio_transcript.delta".into(),
        });
    }
    settle().await;

    let log = h.session.event_log();
    let transcript = log
        .iter()
        .find(|e| e.kind == "response.audio_transcript.delta")
        .unwrap();
    assert_eq!(transcript.count, 3);
    assert!(log.iter().any(|e| e.kind == "session.update"));
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let h = Harness::new(SessionConfig::default());
    h.session.start().await.unwrap();
    assert!(matches!(
        h.session.start().await,
        Err(SessionError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_builder_requires_devices() {
    let client = Arc::new(parley::backend::LoopbackClient::new());
    let result = parley::SessionController::builder(client).build();
    assert!(matches!(result, Err(SessionError::Config(_))));
}
