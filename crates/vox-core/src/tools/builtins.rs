//! Builtin tools every session carries.

use std::sync::Arc;

use chrono::Local;
use serde_json::json;

use crate::channels::{ChannelStore, ChatSender, CONVERSATION_CHANNEL};
use crate::tools::{ParamSpec, ParamType, ToolRegistry, ToolSchema};

/// Builds a registry seeded with the builtin tools.
///
/// `send_channel_message` posts into the shared channel store, so the model
/// can surface structured side-channel output (notes, reminders) in the UI.
pub fn registry_with_builtins(channels: Arc<ChannelStore>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(
        "get_current_time",
        ToolSchema::new("Returns the current local date and time"),
        Arc::new(|_args| {
            Box::pin(async {
                let now = Local::now();
                Ok(json!({
                    "datetime": now.to_rfc3339(),
                    "weekday": now.format("%A").to_string(),
                }))
            })
        }),
    );

    registry.register(
        "send_channel_message",
        ToolSchema::new(
            "Sends a message to a named channel in the chat interface, \
             creating the channel if it does not exist",
        )
        .with_param(ParamSpec::required(
            "message",
            ParamType::String,
            "The message to send",
        ))
        .with_param(ParamSpec::optional(
            "channel",
            ParamType::String,
            "Target channel name (defaults to the conversation channel)",
        )),
        Arc::new(move |args| {
            let channels = Arc::clone(&channels);
            Box::pin(async move {
                let message = args["message"]
                    .as_str()
                    .ok_or("missing message")?
                    .to_string();
                let channel = args["channel"]
                    .as_str()
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or(CONVERSATION_CHANNEL)
                    .to_string();

                if ChannelStore::is_protected(&channel) {
                    return Err(format!("cannot send message to protected channel: {channel}"));
                }

                channels.append(&channel, ChatSender::Tool, message);
                Ok(json!({ "result": format!("message sent to {channel} channel") }))
            })
        }),
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TOOL_TIMEOUT;
    use tokio::sync::broadcast;

    fn channels() -> Arc<ChannelStore> {
        let (tx, _rx) = broadcast::channel(64);
        Arc::new(ChannelStore::new(tx))
    }

    #[tokio::test]
    async fn test_send_channel_message_creates_channel() {
        let store = channels();
        let registry = registry_with_builtins(Arc::clone(&store));
        let result = registry
            .invoke(
                "send_channel_message",
                "call-1",
                json!({ "message": "remember milk", "channel": "reminders" }),
                TOOL_TIMEOUT,
            )
            .await;
        assert!(!result.is_error());
        assert_eq!(store.messages("reminders").len(), 1);
    }

    #[tokio::test]
    async fn test_protected_channels_refused() {
        let store = channels();
        let registry = registry_with_builtins(Arc::clone(&store));
        for channel in ["logs", "status"] {
            let result = registry
                .invoke(
                    "send_channel_message",
                    "call-2",
                    json!({ "message": "nope", "channel": channel }),
                    TOOL_TIMEOUT,
                )
                .await;
            assert!(result.is_error());
            assert!(store.messages(channel).is_empty());
        }
    }

    #[tokio::test]
    async fn test_get_current_time_returns_datetime() {
        let registry = registry_with_builtins(channels());
        let result = registry
            .invoke("get_current_time", "call-3", json!({}), TOOL_TIMEOUT)
            .await;
        assert!(!result.is_error());
        assert!(result.response_payload()["datetime"].is_string());
    }
}
