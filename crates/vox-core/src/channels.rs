//! Named chat channels exposed to UIs.
//!
//! Channels are append-only sequences of chat messages. They are created
//! lazily on first message (with exactly one `channel_added` notification
//! per new name) and are never removed; `clear` empties a channel in place.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::bridge::protocol::BridgeEvent;
use crate::session::events::now_millis;

/// Channel the model's spoken/streamed replies land in.
pub const CONVERSATION_CHANNEL: &str = "conversation";
/// Channels that exist from the start.
pub const INITIAL_CHANNELS: &[&str] = &["conversation", "logs", "status"];
/// Channels tools are not allowed to post into.
pub const PROTECTED_CHANNELS: &[&str] = &["logs", "status"];

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatSender {
    User,
    Assistant,
    System,
    Tool,
}

impl ChatSender {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatSender::User => "user",
            ChatSender::Assistant => "assistant",
            ChatSender::System => "system",
            ChatSender::Tool => "tool",
        }
    }
}

/// One entry in a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender: ChatSender,
    pub text: String,
    pub timestamp: f64,
}

#[derive(Default)]
struct Inner {
    /// Channel name -> ordered messages. Insertion order is tracked
    /// separately so the resource catalog lists channels stably.
    channels: HashMap<String, Vec<ChatMessage>>,
    order: Vec<String>,
}

/// Concurrent append-only channel store.
///
/// Appends from capture routing, tool execution, and bridge commands may
/// interleave; the mutex serializes them so no update is lost and the
/// `channel_added` notification fires exactly once per name.
pub struct ChannelStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<BridgeEvent>,
}

impl ChannelStore {
    pub fn new(events: broadcast::Sender<BridgeEvent>) -> Self {
        let mut inner = Inner::default();
        for name in INITIAL_CHANNELS {
            inner.channels.insert((*name).to_string(), Vec::new());
            inner.order.push((*name).to_string());
        }
        Self {
            inner: Mutex::new(inner),
            events,
        }
    }

    /// Whether tools are barred from posting to this channel.
    pub fn is_protected(name: &str) -> bool {
        PROTECTED_CHANNELS.contains(&name)
    }

    /// Appends a message, creating the channel on first use.
    ///
    /// Returns the stored message. Emits `channel_added` (once per new
    /// name) followed by the `chat_message` event.
    pub fn append(&self, channel: &str, sender: ChatSender, text: impl Into<String>) -> ChatMessage {
        let message = ChatMessage {
            id: Uuid::new_v4(),
            sender,
            text: text.into(),
            timestamp: now_millis(),
        };

        let added = {
            let mut inner = self.inner.lock().expect("channel store poisoned");
            let added = if inner.channels.contains_key(channel) {
                false
            } else {
                inner.channels.insert(channel.to_string(), Vec::new());
                inner.order.push(channel.to_string());
                true
            };
            inner
                .channels
                .get_mut(channel)
                .expect("channel just ensured")
                .push(message.clone());
            added
        };

        if added {
            tracing::info!(channel, "channel created");
            let _ = self.events.send(BridgeEvent::channel_added(channel));
        }
        let _ = self.events.send(BridgeEvent::chat_message(
            sender.as_str(),
            message.text.clone(),
            channel,
        ));

        message
    }

    /// Empties a channel without removing it. Unknown names are a no-op.
    pub fn clear(&self, channel: &str) {
        let mut inner = self.inner.lock().expect("channel store poisoned");
        if let Some(messages) = inner.channels.get_mut(channel) {
            messages.clear();
        }
    }

    /// Channel names in creation order.
    pub fn names(&self) -> Vec<String> {
        self.inner.lock().expect("channel store poisoned").order.clone()
    }

    /// Messages currently held by a channel.
    pub fn messages(&self, channel: &str) -> Vec<ChatMessage> {
        self.inner
            .lock()
            .expect("channel store poisoned")
            .channels
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (ChannelStore, broadcast::Receiver<BridgeEvent>) {
        let (tx, rx) = broadcast::channel(64);
        (ChannelStore::new(tx), rx)
    }

    fn drain(rx: &mut broadcast::Receiver<BridgeEvent>) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_initial_channels_exist_without_notification() {
        let (store, mut rx) = store();
        assert_eq!(store.names(), vec!["conversation", "logs", "status"]);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_channel_added_fires_exactly_once() {
        let (store, mut rx) = store();
        store.append("notes", ChatSender::Tool, "first");
        store.append("notes", ChatSender::Tool, "second");

        let events = drain(&mut rx);
        let added: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, BridgeEvent::ChannelAdded { .. }))
            .collect();
        assert_eq!(added.len(), 1);

        let messages = store.messages("notes");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "first");
        assert_eq!(messages[1].text, "second");
    }

    #[test]
    fn test_clear_empties_but_keeps_channel() {
        let (store, _rx) = store();
        store.append("notes", ChatSender::Tool, "hello");
        store.clear("notes");
        assert!(store.messages("notes").is_empty());
        assert!(store.names().contains(&"notes".to_string()));
    }

    #[test]
    fn test_concurrent_appends_lose_nothing() {
        use std::sync::Arc;

        let (tx, _rx) = broadcast::channel(1024);
        let store = Arc::new(ChannelStore::new(tx));
        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    store.append(
                        CONVERSATION_CHANNEL,
                        ChatSender::User,
                        format!("{worker}-{i}"),
                    );
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.messages(CONVERSATION_CHANNEL).len(), 400);
    }

    #[test]
    fn test_per_channel_order_preserved() {
        let (store, _rx) = store();
        for i in 0..10 {
            store.append(CONVERSATION_CHANNEL, ChatSender::User, format!("m{i}"));
        }
        let texts: Vec<_> = store
            .messages(CONVERSATION_CHANNEL)
            .into_iter()
            .map(|m| m.text)
            .collect();
        let expected: Vec<_> = (0..10).map(|i| format!("m{i}")).collect();
        assert_eq!(texts, expected);
    }
}
