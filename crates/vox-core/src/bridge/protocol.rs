//! Bridge wire protocol: commands a UI sends and events the core emits.
//!
//! One JSON record per WebSocket message, discriminated by `command`
//! (UI -> core) or `type` (core -> UI). Timestamps are epoch milliseconds,
//! matching what frontends feed straight into `Date`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SessionConfig;
use crate::resources::ResourceCatalog;
use crate::session::events::{SessionState, now_millis};

/// Commands a UI can issue.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum BridgeCommand {
    Start {
        #[serde(default)]
        config: SessionConfig,
    },
    Stop {},
    GetResources {},
    SendMessage {
        message: String,
    },
    ClearChannel {
        channel: String,
    },
}

/// Events the core emits toward UIs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    Status {
        status: SessionState,
        #[serde(rename = "isRunning")]
        is_running: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        timestamp: f64,
    },
    Error {
        error: String,
        #[serde(rename = "stackTrace", skip_serializing_if = "Option::is_none")]
        stack_trace: Option<String>,
        timestamp: f64,
    },
    Resources {
        resources: ResourceCatalog,
        timestamp: f64,
    },
    ChatMessage {
        sender: String,
        message: String,
        channel: String,
        timestamp: f64,
    },
    LogMessage {
        level: String,
        message: String,
        timestamp: f64,
    },
    ChannelAdded {
        channel: String,
        timestamp: f64,
    },
}

impl BridgeEvent {
    pub fn status(state: SessionState) -> Self {
        BridgeEvent::Status {
            status: state,
            is_running: state.is_running(),
            data: None,
            timestamp: now_millis(),
        }
    }

    pub fn error(error: impl Into<String>, stack_trace: Option<String>) -> Self {
        BridgeEvent::Error {
            error: error.into(),
            stack_trace,
            timestamp: now_millis(),
        }
    }

    pub fn resources(resources: ResourceCatalog) -> Self {
        BridgeEvent::Resources {
            resources,
            timestamp: now_millis(),
        }
    }

    pub fn chat_message(
        sender: impl Into<String>,
        message: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        BridgeEvent::ChatMessage {
            sender: sender.into(),
            message: message.into(),
            channel: channel.into(),
            timestamp: now_millis(),
        }
    }

    pub fn log(level: impl Into<String>, message: impl Into<String>) -> Self {
        BridgeEvent::LogMessage {
            level: level.into(),
            message: message.into(),
            timestamp: now_millis(),
        }
    }

    pub fn channel_added(channel: impl Into<String>) -> Self {
        BridgeEvent::ChannelAdded {
            channel: channel.into(),
            timestamp: now_millis(),
        }
    }
}
