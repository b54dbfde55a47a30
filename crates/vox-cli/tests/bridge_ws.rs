//! Bridge protocol integration tests over a real WebSocket connection.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use vox_core::bridge::{self, BridgeState};
use vox_core::capture::device::{
    AudioDeviceKind, AudioInput, DeviceBackend, PlaybackSink, VideoInput,
};
use vox_core::channels::ChannelStore;
use vox_core::config::VideoMode;
use vox_core::resources::NoPrompts;
use vox_core::session::client::{LiveConnection, LiveTransport, TransportEvent};
use vox_core::session::events::SessionError;
use vox_core::session::wire::ClientFrame;
use vox_core::session::{ControllerDeps, SessionController};

type UiSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Microphone that stays open but silent.
struct QuietAudio;

#[async_trait]
impl AudioInput for QuietAudio {
    async fn read_chunk(&mut self) -> Result<Vec<i16>, SessionError> {
        std::future::pending().await
    }
}

struct NullPlayback;

#[async_trait]
impl PlaybackSink for NullPlayback {
    async fn play(&mut self, _pcm: &[u8]) -> Result<(), SessionError> {
        Ok(())
    }
}

struct StubBackend;

impl DeviceBackend for StubBackend {
    fn open_audio(&self, _kind: AudioDeviceKind) -> Result<Box<dyn AudioInput>, SessionError> {
        Ok(Box::new(QuietAudio))
    }

    fn open_video(&self, mode: VideoMode) -> Result<Box<dyn VideoInput>, SessionError> {
        Err(SessionError::device(format!("no {mode:?} capture in tests")))
    }

    fn open_playback(&self) -> Result<Box<dyn PlaybackSink>, SessionError> {
        Ok(Box::new(NullPlayback))
    }
}

/// Remote endpoint that accepts the connection and stays silent.
struct QuietTransport;

#[async_trait]
impl LiveTransport for QuietTransport {
    async fn connect(&self, _setup: &ClientFrame) -> Result<LiveConnection, SessionError> {
        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(32);
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(32);
        tokio::spawn(async move {
            while out_rx.recv().await.is_some() {}
            drop(in_tx);
        });
        Ok(LiveConnection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

async fn spawn_bridge() -> String {
    let (events, _) = broadcast::channel(1024);
    let channels = Arc::new(ChannelStore::new(events.clone()));
    let deps = ControllerDeps {
        transport: Arc::new(QuietTransport),
        devices: Arc::new(StubBackend),
        prompts: Arc::new(NoPrompts),
    };
    let (controller, _task) = SessionController::spawn(deps, channels, events.clone());
    let state = BridgeState { controller, events };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = bridge::serve_on(listener, state).await;
    });
    format!("ws://{addr}/ws")
}

async fn connect(url: &str) -> UiSocket {
    let (socket, _response) = connect_async(url).await.expect("bridge reachable");
    socket
}

async fn send(socket: &mut UiSocket, body: Value) {
    socket
        .send(Message::Text(body.to_string()))
        .await
        .expect("send command");
}

async fn next_event(socket: &mut UiSocket) -> Value {
    loop {
        let message = tokio::time::timeout(std::time::Duration::from_secs(5), socket.next())
            .await
            .expect("event within timeout")
            .expect("connection open")
            .expect("valid frame");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("valid JSON event");
        }
    }
}

/// Reads events until one matches, panicking after a bounded number.
async fn wait_for(socket: &mut UiSocket, predicate: impl Fn(&Value) -> bool) -> Value {
    for _ in 0..50 {
        let event = next_event(socket).await;
        if predicate(&event) {
            return event;
        }
    }
    panic!("expected event never arrived");
}

fn is_status(event: &Value, status: &str) -> bool {
    event["type"] == "status" && event["status"] == status
}

#[tokio::test]
async fn test_new_connection_receives_status_snapshot() {
    let url = spawn_bridge().await;
    let mut socket = connect(&url).await;

    let event = next_event(&mut socket).await;
    assert_eq!(event["type"], "status");
    assert_eq!(event["status"], "idle");
    assert_eq!(event["isRunning"], false);
    assert!(event["timestamp"].as_f64().is_some());
}

#[tokio::test]
async fn test_concurrent_get_resources_identical_snapshots() {
    let url = spawn_bridge().await;
    let mut first = connect(&url).await;
    let mut second = connect(&url).await;
    // Skip the connection snapshots.
    next_event(&mut first).await;
    next_event(&mut second).await;

    send(&mut first, json!({ "command": "get_resources" })).await;
    send(&mut second, json!({ "command": "get_resources" })).await;

    let a = wait_for(&mut first, |e| e["type"] == "resources").await;
    let b = wait_for(&mut second, |e| e["type"] == "resources").await;
    assert_eq!(a["resources"], b["resources"]);
    assert!(a["resources"]["languages"].as_array().unwrap().len() > 1);
    assert!(
        a["resources"]["availableChannels"]
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c == "conversation")
    );

    // No session state was touched.
    let mut third = connect(&url).await;
    let snapshot = next_event(&mut third).await;
    assert!(is_status(&snapshot, "idle"));
}

#[tokio::test]
async fn test_session_survives_ui_disconnect() {
    let url = spawn_bridge().await;
    let mut first = connect(&url).await;
    next_event(&mut first).await;

    send(&mut first, json!({ "command": "start", "config": {} })).await;
    wait_for(&mut first, |e| is_status(e, "streaming")).await;

    // A second UI comes and goes; the session must not care.
    let mut second = connect(&url).await;
    let snapshot = next_event(&mut second).await;
    assert!(is_status(&snapshot, "streaming"));
    drop(second);

    // Still running: a typed message flows through to the chat channel.
    send(
        &mut first,
        json!({ "command": "send_message", "message": "hello" }),
    )
    .await;
    let chat = wait_for(&mut first, |e| e["type"] == "chat_message").await;
    assert_eq!(chat["sender"], "user");
    assert_eq!(chat["channel"], "conversation");
    assert_eq!(chat["message"], "hello");

    // A reconnecting UI resumes receiving events.
    let mut third = connect(&url).await;
    let snapshot = next_event(&mut third).await;
    assert!(is_status(&snapshot, "streaming"));

    send(&mut first, json!({ "command": "stop" })).await;
    wait_for(&mut first, |e| is_status(e, "idle")).await;
    wait_for(&mut third, |e| is_status(e, "idle")).await;
}

#[tokio::test]
async fn test_start_while_running_is_rejected() {
    let url = spawn_bridge().await;
    let mut socket = connect(&url).await;
    next_event(&mut socket).await;

    send(&mut socket, json!({ "command": "start", "config": {} })).await;
    wait_for(&mut socket, |e| is_status(e, "streaming")).await;

    send(&mut socket, json!({ "command": "start", "config": {} })).await;
    // The command echo reports the session still running, then the
    // rejection arrives as an error event.
    wait_for(&mut socket, |e| is_status(e, "streaming")).await;
    let error = wait_for(&mut socket, |e| e["type"] == "error").await;
    assert!(
        error["error"]
            .as_str()
            .unwrap()
            .contains("already running")
    );

    send(&mut socket, json!({ "command": "stop" })).await;
    wait_for(&mut socket, |e| is_status(e, "idle")).await;
}

#[tokio::test]
async fn test_stop_while_idle_echoes_idle_only() {
    let url = spawn_bridge().await;
    let mut socket = connect(&url).await;
    next_event(&mut socket).await;

    send(&mut socket, json!({ "command": "stop" })).await;
    let event = next_event(&mut socket).await;
    assert!(is_status(&event, "idle"), "got {event}");
}

#[tokio::test]
async fn test_invalid_command_yields_error_event() {
    let url = spawn_bridge().await;
    let mut socket = connect(&url).await;
    next_event(&mut socket).await;

    send(&mut socket, json!({ "command": "reboot" })).await;
    let event = wait_for(&mut socket, |e| e["type"] == "error").await;
    assert!(event["error"].as_str().unwrap().contains("invalid command"));
}

#[tokio::test]
async fn test_feedback_loop_config_rejected() {
    let url = spawn_bridge().await;
    let mut socket = connect(&url).await;
    next_event(&mut socket).await;

    send(
        &mut socket,
        json!({
            "command": "start",
            "config": { "audioSource": "computer", "responseModality": "AUDIO" }
        }),
    )
    .await;
    let error = wait_for(&mut socket, |e| e["type"] == "error").await;
    assert!(error["error"].as_str().unwrap().contains("feedback loop"));
    // State is untouched: a fresh connection still snapshots idle.
    let mut second = connect(&url).await;
    let snapshot = next_event(&mut second).await;
    assert!(is_status(&snapshot, "idle"));
}
