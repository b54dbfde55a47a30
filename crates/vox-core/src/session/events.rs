//! Session data model: chunks, inbound events, states, and the error taxonomy.
//!
//! Everything that crosses a task boundary inside the engine is one of the
//! tagged types defined here, so every dispatch site can match exhaustively.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Origin of an outbound chunk. Ordering is FIFO per source kind only;
/// there is no global order across kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Audio,
    Video,
    Text,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Audio => write!(f, "audio"),
            SourceKind::Video => write!(f, "video"),
            SourceKind::Text => write!(f, "text"),
        }
    }
}

/// Payload of a captured or typed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPayload {
    /// Raw bytes (PCM audio, encoded video frame).
    Binary(Bytes),
    /// User-typed text, sent with end-of-turn.
    Text(String),
}

/// One timestamped unit of captured or typed data sent toward the remote
/// endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub source: SourceKind,
    pub payload: ChunkPayload,
    /// MIME type of the payload (e.g. "audio/pcm", "image/jpeg").
    pub mime_type: String,
    /// Monotonic per-source sequence number, assigned by the producer.
    pub sequence: u64,
    /// Capture time, epoch milliseconds.
    pub timestamp: f64,
}

impl Chunk {
    pub fn audio(pcm: Bytes, sequence: u64) -> Self {
        Self {
            source: SourceKind::Audio,
            payload: ChunkPayload::Binary(pcm),
            mime_type: "audio/pcm".to_string(),
            sequence,
            timestamp: now_millis(),
        }
    }

    pub fn video(jpeg: Bytes, sequence: u64) -> Self {
        Self {
            source: SourceKind::Video,
            payload: ChunkPayload::Binary(jpeg),
            mime_type: "image/jpeg".to_string(),
            sequence,
            timestamp: now_millis(),
        }
    }

    pub fn text(text: impl Into<String>, sequence: u64) -> Self {
        Self {
            source: SourceKind::Text,
            payload: ChunkPayload::Text(text.into()),
            mime_type: "text/plain".to_string(),
            sequence,
            timestamp: now_millis(),
        }
    }
}

/// Current epoch time in milliseconds (bridge protocol timestamp format).
pub fn now_millis() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

/// One decoded unit of data or control signal received from the remote
/// endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Assistant audio (raw PCM at the receive sample rate).
    AudioOut { pcm: Bytes },
    /// Assistant text destined for a named channel.
    TextOut { channel: String, text: String },
    /// Remote request to execute a locally registered tool.
    ToolCallRequest {
        call_id: String,
        name: String,
        args: Value,
    },
    /// The model finished its turn.
    TurnComplete,
    /// The user barged in; queued playback is stale.
    Interruption,
    /// The connection closed (clean or not).
    ConnectionClosed { code: u16, reason: String },
}

/// Session lifecycle states.
///
/// `Error` is only left by an explicit stop/start; everything else flows
/// `Idle -> Connecting -> Streaming <-> Interrupted -> Closing -> Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Interrupted,
    Closing,
    Error,
}

impl SessionState {
    /// Whether a session is live from the UI's point of view.
    pub fn is_running(self) -> bool {
        !matches!(self, SessionState::Idle | SessionState::Error)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Streaming => write!(f, "streaming"),
            SessionState::Interrupted => write!(f, "interrupted"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Error => write!(f, "error"),
        }
    }
}

/// Error categories for `SessionError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionErrorKind {
    /// Capture device unavailable or failed. Aborts startup, never retried.
    Device,
    /// Invalid or conflicting settings. Rejected locally, no state change.
    Config,
    /// Network session failure beyond the retry budget. Terminal.
    Connection,
    /// Malformed inbound frame. Logged and dropped, session continues.
    Protocol,
    /// Tool lookup/validation/execution failure. Recovered as a tool result.
    Tool,
}

impl fmt::Display for SessionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionErrorKind::Device => write!(f, "device"),
            SessionErrorKind::Config => write!(f, "config"),
            SessionErrorKind::Connection => write!(f, "connection"),
            SessionErrorKind::Protocol => write!(f, "protocol"),
            SessionErrorKind::Tool => write!(f, "tool"),
        }
    }
}

/// Structured engine error with kind and details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    /// Error category
    pub kind: SessionErrorKind,
    /// One-line summary suitable for display
    pub message: String,
    /// Optional additional details (e.g. the raw frame or OS error)
    pub details: Option<String>,
}

impl SessionError {
    pub fn new(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::Device, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::Config, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::Connection, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::Protocol, message)
    }

    pub fn tool(message: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::Tool, message)
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for SessionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_running_flags() {
        assert!(!SessionState::Idle.is_running());
        assert!(!SessionState::Error.is_running());
        assert!(SessionState::Connecting.is_running());
        assert!(SessionState::Streaming.is_running());
        assert!(SessionState::Interrupted.is_running());
        assert!(SessionState::Closing.is_running());
    }

    #[test]
    fn test_session_error_display() {
        let err = SessionError::device("no input device").with_details("ALSA: busy");
        assert_eq!(err.to_string(), "device: no input device");
        assert_eq!(err.details.as_deref(), Some("ALSA: busy"));
    }

    #[test]
    fn test_chunk_constructors_tag_source() {
        let a = Chunk::audio(Bytes::from_static(&[0, 1]), 7);
        assert_eq!(a.source, SourceKind::Audio);
        assert_eq!(a.mime_type, "audio/pcm");
        assert_eq!(a.sequence, 7);

        let t = Chunk::text("hello", 0);
        assert_eq!(t.source, SourceKind::Text);
        assert!(matches!(t.payload, ChunkPayload::Text(ref s) if s == "hello"));
    }
}
