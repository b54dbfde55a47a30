//! Session lifecycle: one controller actor owning the single active session.
//!
//! The controller is the only writer of session state; UIs mirror the
//! status events it broadcasts and never assert running state on their own.
//! Commands arrive over a channel from the bridge, notices arrive from the
//! session client, and every transition lands on the event bus.

pub mod client;
pub mod events;
pub mod transport;
pub mod wire;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bridge::protocol::BridgeEvent;
use crate::capture::CaptureManager;
use crate::capture::device::DeviceBackend;
use crate::capture::recorder::Recorder;
use crate::channels::{ChannelStore, ChatSender, CONVERSATION_CHANNEL};
use crate::config::{ResponseModality, SessionConfig, TEARDOWN_TIMEOUT, ValidatedConfig};
use crate::resources::{PromptSource, ResourceCatalog};
use crate::router::OutputRouter;
use crate::session::client::{LiveTransport, SessionClient, SessionNotice, chunk_channel};
use crate::session::events::{Chunk, SessionError, SessionState, now_millis};
use crate::tools::builtins::registry_with_builtins;
use crate::tools::ToolExecutor;

/// External collaborators a session is assembled from.
pub struct ControllerDeps {
    pub transport: Arc<dyn LiveTransport>,
    pub devices: Arc<dyn DeviceBackend>,
    pub prompts: Arc<dyn PromptSource>,
}

/// Commands driving the controller.
pub enum ControllerCommand {
    Start {
        config: SessionConfig,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    SendMessage {
        text: String,
    },
    ClearChannel {
        channel: String,
    },
    Snapshot {
        reply: oneshot::Sender<StatusSnapshot>,
    },
    Resources {
        reply: oneshot::Sender<ResourceCatalog>,
    },
}

/// Point-in-time view of session state for late-joining UIs.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub state: SessionState,
    pub session_id: Option<Uuid>,
    pub started_at: Option<f64>,
}

/// Cloneable handle for issuing controller commands.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<ControllerCommand>,
}

impl ControllerHandle {
    /// # Errors
    /// Returns the start rejection (config or device error).
    pub async fn start(&self, config: SessionConfig) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.send(ControllerCommand::Start { config, reply }).await;
        response
            .await
            .unwrap_or_else(|_| Err(SessionError::config("controller unavailable")))
    }

    pub async fn stop(&self) {
        let (reply, response) = oneshot::channel();
        self.send(ControllerCommand::Stop { reply }).await;
        let _ = response.await;
    }

    pub async fn send_message(&self, text: impl Into<String>) {
        self.send(ControllerCommand::SendMessage { text: text.into() })
            .await;
    }

    pub async fn clear_channel(&self, channel: impl Into<String>) {
        self.send(ControllerCommand::ClearChannel {
            channel: channel.into(),
        })
        .await;
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let (reply, response) = oneshot::channel();
        self.send(ControllerCommand::Snapshot { reply }).await;
        response.await.unwrap_or(StatusSnapshot {
            state: SessionState::Idle,
            session_id: None,
            started_at: None,
        })
    }

    pub async fn resources(&self) -> Option<ResourceCatalog> {
        let (reply, response) = oneshot::channel();
        self.send(ControllerCommand::Resources { reply }).await;
        response.await.ok()
    }

    async fn send(&self, command: ControllerCommand) {
        if self.commands.send(command).await.is_err() {
            tracing::error!("session controller is gone");
        }
    }
}

struct ActiveSession {
    id: Uuid,
    started_at: f64,
    cancel: CancellationToken,
    chunk_tx: mpsc::Sender<Chunk>,
    notices: mpsc::Receiver<SessionNotice>,
    tasks: Vec<JoinHandle<()>>,
    router: Arc<OutputRouter>,
    recorder: Option<Arc<Recorder>>,
    initial_message: Option<String>,
    text_sequence: u64,
}

pub struct SessionController {
    deps: ControllerDeps,
    channels: Arc<ChannelStore>,
    events: broadcast::Sender<BridgeEvent>,
    commands: mpsc::Receiver<ControllerCommand>,
    state: SessionState,
    active: Option<ActiveSession>,
}

enum Wake {
    Command(Option<ControllerCommand>),
    Notice(Option<SessionNotice>),
}

impl SessionController {
    /// Spawns the controller actor.
    pub fn spawn(
        deps: ControllerDeps,
        channels: Arc<ChannelStore>,
        events: broadcast::Sender<BridgeEvent>,
    ) -> (ControllerHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let controller = Self {
            deps,
            channels,
            events,
            commands: command_rx,
            state: SessionState::Idle,
            active: None,
        };
        let task = tokio::spawn(controller.run());
        (
            ControllerHandle {
                commands: command_tx,
            },
            task,
        )
    }

    async fn run(mut self) {
        loop {
            let commands = &mut self.commands;
            let active = &mut self.active;
            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                notice = async {
                    match active.as_mut() {
                        Some(session) => session.notices.recv().await,
                        None => std::future::pending().await,
                    }
                } => Wake::Notice(notice),
            };

            match wake {
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Command(None) => {
                    // Every handle dropped: shut the session down and exit.
                    if self.active.is_some() {
                        self.teardown().await;
                    }
                    return;
                }
                Wake::Notice(Some(notice)) => self.handle_notice(notice).await,
                Wake::Notice(None) => {
                    // Client task vanished without a final notice.
                    tracing::error!("session client ended unexpectedly");
                    self.teardown().await;
                    self.set_state(SessionState::Idle);
                }
            }
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::info!(from = %self.state, to = %state, "session state");
            self.state = state;
        }
        let _ = self.events.send(BridgeEvent::status(state));
    }

    fn emit_error(&self, error: &SessionError) {
        let _ = self
            .events
            .send(BridgeEvent::error(error.to_string(), error.details.clone()));
    }

    fn log(&self, level: &str, message: impl Into<String>) {
        let _ = self.events.send(BridgeEvent::log(level, message));
    }

    async fn handle_command(&mut self, command: ControllerCommand) {
        match command {
            ControllerCommand::Start { config, reply } => {
                let result = self.handle_start(config);
                let _ = reply.send(result);
            }
            ControllerCommand::Stop { reply } => {
                self.handle_stop().await;
                let _ = reply.send(());
            }
            ControllerCommand::SendMessage { text } => self.handle_send_message(text),
            ControllerCommand::ClearChannel { channel } => {
                self.channels.clear(&channel);
                self.log("info", format!("cleared {channel} channel"));
            }
            ControllerCommand::Snapshot { reply } => {
                let _ = reply.send(StatusSnapshot {
                    state: self.state,
                    session_id: self.active.as_ref().map(|active| active.id),
                    started_at: self.active.as_ref().map(|active| active.started_at),
                });
            }
            ControllerCommand::Resources { reply } => {
                let _ = reply.send(ResourceCatalog::snapshot(
                    &self.deps.prompts,
                    self.channels.names(),
                ));
            }
        }
    }

    /// Starts a session, or rejects with a config/device error without
    /// touching the running session's state or channels.
    fn handle_start(&mut self, config: SessionConfig) -> Result<(), SessionError> {
        if self.active.is_some() {
            let error = SessionError::config("session is already running");
            self.emit_error(&error);
            return Err(error);
        }

        let validated = match config.validate() {
            Ok(validated) => validated,
            Err(error) => {
                self.emit_error(&error);
                return Err(error);
            }
        };

        match self.assemble_session(&validated) {
            Ok(active) => {
                self.active = Some(active);
                self.set_state(SessionState::Connecting);
                self.log("info", "session starting");
                Ok(())
            }
            Err(error) => {
                self.emit_error(&error);
                // Startup failures leave state untouched (still idle/error).
                let _ = self.events.send(BridgeEvent::status(self.state));
                Err(error)
            }
        }
    }

    /// Opens devices and wires every task of a new session. Fails fast
    /// before any chunk is produced.
    fn assemble_session(&self, config: &ValidatedConfig) -> Result<ActiveSession, SessionError> {
        let cancel = CancellationToken::new();

        // Playback first: its device error should surface before capture
        // producers exist.
        let playback = match config.response_modality {
            ResponseModality::Audio => Some(self.deps.devices.open_playback()?),
            ResponseModality::Text => None,
        };

        let recorder = if config.record_conversation {
            match Recorder::create() {
                Ok(recorder) => Some(Arc::new(recorder)),
                Err(err) => {
                    tracing::warn!(error = %err, "recording unavailable, continuing without");
                    None
                }
            }
        } else {
            None
        };

        let router = Arc::new(OutputRouter::new(
            Arc::clone(&self.channels),
            recorder.clone(),
        ));

        let (chunk_tx, chunk_rx) = chunk_channel();
        let capture = CaptureManager::start(
            config,
            &self.deps.devices,
            chunk_tx.clone(),
            recorder.clone(),
            cancel.clone(),
        )?;

        // Registered before the session starts; read-only while it runs.
        let registry = Arc::new(registry_with_builtins(Arc::clone(&self.channels)));
        let (tool_tx, tool_rx) = mpsc::channel(32);
        let executor = ToolExecutor::new(Arc::clone(&registry), tool_tx);

        let setup = wire::setup_frame(config, registry.declarations());
        let (notice_tx, notice_rx) = mpsc::channel(64);

        let mut tasks = capture.into_tasks();
        if let Some(sink) = playback {
            tasks.push(router.spawn_playback(sink, cancel.clone()));
        }
        tasks.push(SessionClient::spawn(
            Arc::clone(&self.deps.transport),
            setup,
            chunk_rx,
            tool_rx,
            executor,
            Arc::clone(&router),
            notice_tx,
            cancel.clone(),
        ));

        Ok(ActiveSession {
            id: Uuid::new_v4(),
            started_at: now_millis(),
            cancel,
            chunk_tx,
            notices: notice_rx,
            tasks,
            router,
            recorder,
            initial_message: config.initial_message.clone(),
            text_sequence: 0,
        })
    }

    async fn handle_stop(&mut self) {
        if self.active.is_none() {
            // Stop while idle: no error, just echo the (now idle) status.
            self.set_state(SessionState::Idle);
            return;
        }
        self.set_state(SessionState::Closing);
        self.teardown().await;
        self.set_state(SessionState::Idle);
        self.log("info", "session stopped");
    }

    fn handle_send_message(&mut self, text: String) {
        let Some(active) = self.active.as_mut() else {
            self.log("warning", "cannot send message: no session is running");
            return;
        };
        self.channels
            .append(CONVERSATION_CHANNEL, ChatSender::User, text.clone());
        let chunk = Chunk::text(text, active.text_sequence);
        active.text_sequence += 1;
        if active.chunk_tx.try_send(chunk).is_err() {
            tracing::warn!("outbound queue full, user message dropped");
            self.log("warning", "message not sent: outbound queue is full");
        }
    }

    async fn handle_notice(&mut self, notice: SessionNotice) {
        match notice {
            SessionNotice::Connected => {
                self.set_state(SessionState::Streaming);
                // First connect carries the initial message; reconnects
                // must not repeat it.
                if let Some(active) = self.active.as_mut()
                    && let Some(message) = active.initial_message.take()
                {
                    let chunk = Chunk::text(message, active.text_sequence);
                    active.text_sequence += 1;
                    let _ = active.chunk_tx.try_send(chunk);
                }
            }
            SessionNotice::TurnComplete => {
                tracing::debug!("turn complete");
            }
            SessionNotice::Interrupted => {
                self.set_state(SessionState::Interrupted);
            }
            SessionNotice::Resumed => {
                self.set_state(SessionState::Streaming);
            }
            SessionNotice::Closed => {
                self.set_state(SessionState::Closing);
                self.teardown().await;
                self.set_state(SessionState::Idle);
                self.log("info", "session ended");
            }
            SessionNotice::Fatal(error) => {
                self.emit_error(&error);
                self.teardown().await;
                self.set_state(SessionState::Error);
            }
        }
    }

    /// Cancels every session task and joins them within the teardown
    /// budget; stragglers (e.g. a hung device read) are aborted so handles
    /// are never leaked.
    async fn teardown(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.cancel.cancel();
        active.router.playback_queue().close();

        let deadline = Instant::now() + TEARDOWN_TIMEOUT;
        for mut task in active.tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut task).await.is_err() {
                tracing::warn!("session task did not stop in time, aborting");
                task.abort();
            }
        }

        if let Some(recorder) = active.recorder
            && let Err(err) = recorder.finalize()
        {
            tracing::warn!(error = %err, "failed to finalize recording");
        }
        tracing::info!(session = %active.id, "session torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing::FakeBackend;
    use crate::resources::NoPrompts;
    use crate::session::client::{LiveConnection, TransportEvent};
    use crate::session::events::SessionErrorKind;
    use crate::session::wire::ClientFrame;
    use async_trait::async_trait;

    /// Transport whose connections succeed and stay open quietly.
    struct QuietTransport;

    #[async_trait]
    impl LiveTransport for QuietTransport {
        async fn connect(&self, _setup: &ClientFrame) -> Result<LiveConnection, SessionError> {
            let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(32);
            let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(32);
            tokio::spawn(async move {
                // Swallow outbound traffic and keep the inbound side open.
                while out_rx.recv().await.is_some() {}
                drop(in_tx);
            });
            Ok(LiveConnection {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }

    /// Transport that always refuses connections.
    struct DeadTransport;

    #[async_trait]
    impl LiveTransport for DeadTransport {
        async fn connect(&self, _setup: &ClientFrame) -> Result<LiveConnection, SessionError> {
            Err(SessionError::connection("refused"))
        }
    }

    struct Fixture {
        handle: ControllerHandle,
        events: broadcast::Receiver<BridgeEvent>,
        channels: Arc<ChannelStore>,
        _task: JoinHandle<()>,
    }

    fn fixture(transport: Arc<dyn LiveTransport>, backend: FakeBackend) -> Fixture {
        let (event_tx, event_rx) = broadcast::channel(256);
        let channels = Arc::new(ChannelStore::new(event_tx.clone()));
        let deps = ControllerDeps {
            transport,
            devices: Arc::new(backend),
            prompts: Arc::new(NoPrompts),
        };
        let (handle, task) = SessionController::spawn(deps, Arc::clone(&channels), event_tx);
        Fixture {
            handle,
            events: event_rx,
            channels,
            _task: task,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<BridgeEvent>) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn wait_for_state(handle: &ControllerHandle, want: SessionState) {
        tokio::time::timeout(std::time::Duration::from_secs(60), async {
            loop {
                if handle.snapshot().await.state == want {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("state never reached {want}"));
    }

    #[tokio::test]
    async fn test_start_reaches_streaming_then_stop_reaches_idle() {
        let fx = fixture(Arc::new(QuietTransport), FakeBackend::default());
        fx.handle.start(SessionConfig::default()).await.unwrap();
        wait_for_state(&fx.handle, SessionState::Streaming).await;

        fx.handle.stop().await;
        assert_eq!(fx.handle.snapshot().await.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_start_while_running_is_config_error_and_changes_nothing() {
        let mut fx = fixture(Arc::new(QuietTransport), FakeBackend::default());
        fx.handle.start(SessionConfig::default()).await.unwrap();
        wait_for_state(&fx.handle, SessionState::Streaming).await;
        fx.channels.append("notes", ChatSender::Tool, "kept");
        let _ = drain(&mut fx.events);

        let err = fx.handle.start(SessionConfig::default()).await.unwrap_err();
        assert_eq!(err.kind, SessionErrorKind::Config);
        assert_eq!(fx.handle.snapshot().await.state, SessionState::Streaming);
        assert_eq!(fx.channels.messages("notes").len(), 1);

        // One error event, no status transition away from streaming.
        let events = drain(&mut fx.events);
        assert!(events.iter().any(|e| matches!(e, BridgeEvent::Error { .. })));
        assert!(!events.iter().any(|e| matches!(
            e,
            BridgeEvent::Status { status, .. } if *status != SessionState::Streaming
        )));
    }

    #[tokio::test]
    async fn test_stop_while_idle_echoes_idle_without_error() {
        let mut fx = fixture(Arc::new(QuietTransport), FakeBackend::default());
        let _ = drain(&mut fx.events);
        fx.handle.stop().await;

        let events = drain(&mut fx.events);
        let statuses: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                BridgeEvent::Status { status, .. } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![SessionState::Idle]);
        assert!(!events.iter().any(|e| matches!(e, BridgeEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_device_error_aborts_startup_without_state_change() {
        let mut fx = fixture(
            Arc::new(QuietTransport),
            FakeBackend {
                audio_unavailable: true,
                ..FakeBackend::default()
            },
        );
        let _ = drain(&mut fx.events);

        let err = fx.handle.start(SessionConfig::default()).await.unwrap_err();
        assert_eq!(err.kind, SessionErrorKind::Device);
        assert_eq!(fx.handle.snapshot().await.state, SessionState::Idle);

        let events = drain(&mut fx.events);
        let errors = events
            .iter()
            .filter(|e| matches!(e, BridgeEvent::Error { .. }))
            .count();
        assert_eq!(errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_exhaustion_reaches_error_then_restartable() {
        let mut fx = fixture(Arc::new(DeadTransport), FakeBackend::default());
        fx.handle.start(SessionConfig::default()).await.unwrap();
        wait_for_state(&fx.handle, SessionState::Error).await;

        let events = drain(&mut fx.events);
        let errors = events
            .iter()
            .filter(|e| matches!(e, BridgeEvent::Error { .. }))
            .count();
        assert_eq!(errors, 1, "exactly one terminal error event");

        // Explicit stop leaves Error for Idle.
        fx.handle.stop().await;
        assert_eq!(fx.handle.snapshot().await.state, SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_with_hung_capture_still_reaches_idle() {
        let fx = fixture(
            Arc::new(QuietTransport),
            FakeBackend {
                audio_chunks: 0, // device read hangs forever
                ..FakeBackend::default()
            },
        );
        fx.handle.start(SessionConfig::default()).await.unwrap();
        wait_for_state(&fx.handle, SessionState::Streaming).await;

        fx.handle.stop().await;
        assert_eq!(fx.handle.snapshot().await.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_send_message_appends_user_chat() {
        let fx = fixture(Arc::new(QuietTransport), FakeBackend::default());
        fx.handle.start(SessionConfig::default()).await.unwrap();
        wait_for_state(&fx.handle, SessionState::Streaming).await;

        fx.handle.send_message("hello out there").await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let messages = fx.channels.messages(CONVERSATION_CHANNEL);
        assert!(
            messages
                .iter()
                .any(|m| m.sender == ChatSender::User && m.text == "hello out there")
        );
        fx.handle.stop().await;
    }

    #[tokio::test]
    async fn test_resources_snapshot_is_consistent() {
        let fx = fixture(Arc::new(QuietTransport), FakeBackend::default());
        let (a, b) = tokio::join!(fx.handle.resources(), fx.handle.resources());
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a, b);
        assert!(a.available_channels.contains(&"conversation".to_string()));
        assert_eq!(fx.handle.snapshot().await.state, SessionState::Idle);
    }
}
