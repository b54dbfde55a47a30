//! Bridge server: the local WebSocket endpoint UIs talk to.
//!
//! Each connection gets the current status snapshot immediately, then a
//! merged stream of broadcast events and direct replies. The running
//! session is independent of UI connectivity: connections can come and go
//! without touching the controller's state, and a reconnecting UI simply
//! resubscribes to the event bus.

pub mod protocol;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::bridge::protocol::{BridgeCommand, BridgeEvent};
use crate::session::ControllerHandle;

/// Shared state for bridge handlers.
#[derive(Clone)]
pub struct BridgeState {
    pub controller: ControllerHandle,
    pub events: broadcast::Sender<BridgeEvent>,
}

pub fn router(state: BridgeState) -> Router {
    Router::new()
        .route("/ws", get(bridge_ws))
        .with_state(state)
}

/// Serves the bridge on an already-bound listener.
///
/// # Errors
/// Returns an error if serving fails.
pub async fn serve_on(listener: TcpListener, state: BridgeState) -> anyhow::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "bridge server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Binds and serves the bridge.
///
/// # Errors
/// Returns an error if the address cannot be bound.
pub async fn serve(addr: &str, state: BridgeState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind bridge address {addr}: {e}"))?;
    serve_on(listener, state).await
}

async fn bridge_ws(State(state): State<BridgeState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

type UiSink = SplitSink<WebSocket, Message>;

async fn handle_connection(socket: WebSocket, state: BridgeState) {
    tracing::info!("UI connected");
    let (mut sink, mut stream) = socket.split();

    // Late-joining UIs observe correct state immediately.
    let snapshot = state.controller.snapshot().await;
    if send_event(&mut sink, &BridgeEvent::status(snapshot.state))
        .await
        .is_err()
    {
        return;
    }

    let mut events = state.events.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_event(&mut sink, &event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "slow UI connection missed events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if handle_message(&state, &mut sink, &text).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "UI connection error");
                    break;
                }
            },
        }
    }
    tracing::info!("UI disconnected");
}

async fn handle_message(
    state: &BridgeState,
    sink: &mut UiSink,
    text: &str,
) -> Result<(), axum::Error> {
    let command = match serde_json::from_str::<BridgeCommand>(text) {
        Ok(command) => command,
        Err(err) => {
            tracing::warn!(error = %err, "invalid bridge command");
            return send_event(
                sink,
                &BridgeEvent::error(format!("invalid command: {err}"), None),
            )
            .await;
        }
    };

    match command {
        BridgeCommand::Start { config } => {
            // Rejections surface on the event bus; the reply just settles
            // ordering so this UI always sees a status after the command.
            let _ = state.controller.start(config).await;
            let snapshot = state.controller.snapshot().await;
            send_event(sink, &BridgeEvent::status(snapshot.state)).await?;
        }
        BridgeCommand::Stop {} => {
            state.controller.stop().await;
            let snapshot = state.controller.snapshot().await;
            send_event(sink, &BridgeEvent::status(snapshot.state)).await?;
        }
        BridgeCommand::GetResources {} => {
            // Direct reply: only the requesting UI needs the catalog.
            if let Some(catalog) = state.controller.resources().await {
                send_event(sink, &BridgeEvent::resources(catalog)).await?;
            }
        }
        BridgeCommand::SendMessage { message } => {
            state.controller.send_message(message).await;
        }
        BridgeCommand::ClearChannel { channel } => {
            state.controller.clear_channel(channel).await;
        }
    }
    Ok(())
}

async fn send_event(sink: &mut UiSink, event: &BridgeEvent) -> Result<(), axum::Error> {
    let body = serde_json::to_string(event)
        .unwrap_or_else(|_| r#"{"type":"error","error":"serialization failed"}"#.to_string());
    sink.send(Message::Text(body)).await
}
