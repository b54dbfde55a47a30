//! WebSocket transport to the remote live endpoint.
//!
//! `connect` performs the handshake, delivers the setup frame, and leaves a
//! pair of pump tasks translating between the socket and the bounded
//! channels the session client drives. The writer pump is the only task
//! touching the sink, keeping the connection single-writer.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::config::OUTBOUND_QUEUE_DEPTH;
use crate::session::client::{LiveConnection, LiveTransport, TransportEvent};
use crate::session::events::SessionError;
use crate::session::wire::{self, ClientFrame};

pub struct WsTransport {
    endpoint: String,
    api_key: String,
}

impl WsTransport {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    fn url(&self) -> Result<Url, SessionError> {
        let mut url = Url::parse(&self.endpoint).map_err(|e| {
            SessionError::connection(format!("invalid endpoint URL: {}", self.endpoint))
                .with_details(e.to_string())
        })?;
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }
}

#[async_trait]
impl LiveTransport for WsTransport {
    async fn connect(&self, setup: &ClientFrame) -> Result<LiveConnection, SessionError> {
        let url = self.url()?;
        let (socket, _response) = connect_async(url.as_str()).await.map_err(|e| {
            SessionError::connection("failed to open live connection").with_details(e.to_string())
        })?;
        tracing::info!("live connection established");

        let (mut sink, mut stream) = socket.split();
        sink.send(Message::Text(wire::encode(setup)))
            .await
            .map_err(|e| {
                SessionError::connection("failed to send session setup")
                    .with_details(e.to_string())
            })?;

        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(OUTBOUND_QUEUE_DEPTH);
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(64);

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(err) = sink.send(Message::Text(wire::encode(&frame))).await {
                    tracing::debug!(error = %err, "write failed, closing writer pump");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let event = match message {
                    Ok(Message::Text(text)) => TransportEvent::Frame(text),
                    Ok(Message::Binary(data)) => {
                        TransportEvent::Frame(String::from_utf8_lossy(&data).into_owned())
                    }
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.into_owned()))
                            .unwrap_or((1005, String::new()));
                        let _ = in_tx.send(TransportEvent::Closed { code, reason }).await;
                        return;
                    }
                    Ok(_) => continue, // ping/pong/raw frames
                    Err(err) => {
                        let _ = in_tx
                            .send(TransportEvent::Closed {
                                code: 1006,
                                reason: err.to_string(),
                            })
                            .await;
                        return;
                    }
                };
                if in_tx.send(event).await.is_err() {
                    return; // session client is gone
                }
            }
            let _ = in_tx
                .send(TransportEvent::Closed {
                    code: 1006,
                    reason: "connection reset".to_string(),
                })
                .await;
        });

        Ok(LiveConnection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_carries_api_key() {
        let transport = WsTransport::new("wss://example.test/v1/live", "secret");
        let url = transport.url().unwrap();
        assert_eq!(url.query(), Some("key=secret"));
    }

    #[test]
    fn test_invalid_endpoint_is_connection_error() {
        let transport = WsTransport::new("not a url", "secret");
        let err = transport.url().unwrap_err();
        assert_eq!(
            err.kind,
            crate::session::events::SessionErrorKind::Connection
        );
    }
}
