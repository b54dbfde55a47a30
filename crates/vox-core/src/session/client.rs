//! Duplex client for the remote live endpoint.
//!
//! One driver task owns the connection for the active session: a single
//! writer multiplexes capture chunks, typed text, and tool results into the
//! outbound stream (FIFO per source kind), while the receive side decodes
//! inbound frames and dispatches them to the output router, the tool
//! executor, and the session controller.
//!
//! An unexpected close with a non-terminal code is retried at a fixed
//! interval inside a bounded window without surfacing anything to consumers;
//! exhausting the window emits exactly one fatal connection error. A clean
//! close (code 1000) ends the session without retry.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{OUTBOUND_QUEUE_DEPTH, RECONNECT_INTERVAL, RECONNECT_WINDOW};
use crate::router::OutputRouter;
use crate::session::events::{Chunk, InboundEvent, SessionError};
use crate::session::wire::{self, ClientFrame};
use crate::tools::{ToolExecutor, ToolResult};

/// WebSocket normal-closure code; everything else is retried.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// What the transport pump reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One JSON text frame from the endpoint.
    Frame(String),
    /// The connection closed.
    Closed { code: u16, reason: String },
}

/// An established connection: bounded channel handoff on both sides, the
/// socket itself pumped by the transport's internal task.
pub struct LiveConnection {
    pub outbound: mpsc::Sender<ClientFrame>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// Opens connections to the remote endpoint.
///
/// `connect` must deliver the setup frame before returning, so a chunk can
/// never overtake session setup, including across reconnects.
#[async_trait]
pub trait LiveTransport: Send + Sync {
    async fn connect(&self, setup: &ClientFrame) -> Result<LiveConnection, SessionError>;
}

/// Out-of-band notifications to the session controller.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    /// The connection is up (also after a silent reconnect).
    Connected,
    TurnComplete,
    /// The user barged in on the model.
    Interrupted,
    /// Content resumed after an interruption.
    Resumed,
    /// The connection ended cleanly (or the client was cancelled).
    Closed,
    /// Retry budget exhausted; terminal.
    Fatal(SessionError),
}

/// Creates the bounded chunk queue feeding the send loop.
pub fn chunk_channel() -> (mpsc::Sender<Chunk>, mpsc::Receiver<Chunk>) {
    mpsc::channel(OUTBOUND_QUEUE_DEPTH)
}

pub struct SessionClient {
    transport: Arc<dyn LiveTransport>,
    setup: ClientFrame,
    chunk_rx: mpsc::Receiver<Chunk>,
    tool_rx: mpsc::Receiver<ToolResult>,
    executor: ToolExecutor,
    router: Arc<OutputRouter>,
    notices: mpsc::Sender<SessionNotice>,
    cancel: CancellationToken,
    interrupted: bool,
}

enum StreamOutcome {
    Cancelled,
    CleanClose,
    Lost { code: u16, reason: String },
}

impl SessionClient {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        transport: Arc<dyn LiveTransport>,
        setup: ClientFrame,
        chunk_rx: mpsc::Receiver<Chunk>,
        tool_rx: mpsc::Receiver<ToolResult>,
        executor: ToolExecutor,
        router: Arc<OutputRouter>,
        notices: mpsc::Sender<SessionNotice>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let client = Self {
            transport,
            setup,
            chunk_rx,
            tool_rx,
            executor,
            router,
            notices,
            cancel,
            interrupted: false,
        };
        tokio::spawn(client.run())
    }

    async fn run(mut self) {
        // One retry window per outage; cleared when streaming resumes.
        let mut retry_deadline: Option<Instant> = None;

        loop {
            if self.cancel.is_cancelled() {
                let _ = self.notices.send(SessionNotice::Closed).await;
                return;
            }

            let connected = tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = self.notices.send(SessionNotice::Closed).await;
                    return;
                }
                result = self.transport.connect(&self.setup) => result,
            };

            match connected {
                Ok(connection) => {
                    retry_deadline = None;
                    let _ = self.notices.send(SessionNotice::Connected).await;
                    match self.stream(connection).await {
                        StreamOutcome::Cancelled | StreamOutcome::CleanClose => {
                            let _ = self.notices.send(SessionNotice::Closed).await;
                            return;
                        }
                        StreamOutcome::Lost { code, reason } => {
                            tracing::warn!(code, reason, "connection lost, retrying");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "connect attempt failed");
                }
            }

            // Inside the retry window nothing is surfaced; past it, one
            // terminal error.
            let deadline = *retry_deadline.get_or_insert_with(|| Instant::now() + RECONNECT_WINDOW);
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = self.notices.send(SessionNotice::Closed).await;
                    return;
                }
                () = tokio::time::sleep(RECONNECT_INTERVAL) => {}
            }
            if Instant::now() >= deadline {
                let error = SessionError::connection(format!(
                    "connection lost and not recovered within {}s",
                    RECONNECT_WINDOW.as_secs()
                ));
                let _ = self.notices.send(SessionNotice::Fatal(error)).await;
                return;
            }
        }
    }

    /// Streams over one established connection until it ends.
    async fn stream(&mut self, connection: LiveConnection) -> StreamOutcome {
        let LiveConnection {
            outbound,
            mut inbound,
        } = connection;
        let mut chunks_open = true;
        let mut tools_open = true;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return StreamOutcome::Cancelled,

                chunk = self.chunk_rx.recv(), if chunks_open => match chunk {
                    Some(chunk) => {
                        let frame = wire::chunk_frame(&chunk);
                        if outbound.send(frame).await.is_err() {
                            return StreamOutcome::Lost {
                                code: 1006,
                                reason: "writer closed".to_string(),
                            };
                        }
                    }
                    None => chunks_open = false,
                },

                result = self.tool_rx.recv(), if tools_open => match result {
                    Some(result) => {
                        let frame = wire::tool_response_frame(std::slice::from_ref(&result));
                        if outbound.send(frame).await.is_err() {
                            return StreamOutcome::Lost {
                                code: 1006,
                                reason: "writer closed".to_string(),
                            };
                        }
                    }
                    None => tools_open = false,
                },

                event = inbound.recv() => match event {
                    Some(TransportEvent::Frame(text)) => self.handle_frame(&text).await,
                    Some(TransportEvent::Closed { code, reason }) => {
                        if code == NORMAL_CLOSE_CODE {
                            tracing::info!(reason, "connection closed cleanly");
                            return StreamOutcome::CleanClose;
                        }
                        return StreamOutcome::Lost { code, reason };
                    }
                    None => {
                        return StreamOutcome::Lost {
                            code: 1006,
                            reason: "transport dropped".to_string(),
                        };
                    }
                },
            }
        }
    }

    /// Decodes and dispatches one inbound frame. Malformed frames are
    /// logged and dropped; they never end the session.
    async fn handle_frame(&mut self, text: &str) {
        let events = match wire::decode(text) {
            Ok(events) => events,
            Err(err) => {
                tracing::warn!(error = %err, details = ?err.details, "dropping malformed frame");
                return;
            }
        };

        for event in events {
            match &event {
                InboundEvent::AudioOut { .. } | InboundEvent::TextOut { .. } => {
                    if self.interrupted {
                        self.interrupted = false;
                        let _ = self.notices.send(SessionNotice::Resumed).await;
                    }
                    self.router.route(&event);
                }
                InboundEvent::ToolCallRequest { call_id, name, args } => {
                    self.executor
                        .dispatch(call_id.clone(), name.clone(), args.clone());
                }
                InboundEvent::TurnComplete => {
                    self.router.route(&event);
                    let _ = self.notices.send(SessionNotice::TurnComplete).await;
                }
                InboundEvent::Interruption => {
                    self.interrupted = true;
                    self.router.route(&event);
                    let _ = self.notices.send(SessionNotice::Interrupted).await;
                }
                // The transport reports closure out of band.
                InboundEvent::ConnectionClosed { .. } => {}
            }
        }
    }
}
