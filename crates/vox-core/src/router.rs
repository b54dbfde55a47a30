//! Fans inbound events out to the playback and text sinks.
//!
//! The two sinks are isolated: audio is handed to a bounded queue the
//! playback task drains in arrival order, and text is appended to channels
//! synchronously. Neither path ever awaits the other, so a stalled playback
//! device cannot delay text delivery (or vice versa).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::device::PlaybackSink;
use crate::capture::recorder::Recorder;
use crate::channels::{ChannelStore, ChatSender, CONVERSATION_CHANNEL};
use crate::config::PLAYBACK_QUEUE_DEPTH;
use crate::session::events::InboundEvent;

/// Coalesced assistant text is flushed past this many buffered characters
/// even without a sentence break.
const TEXT_FLUSH_THRESHOLD: usize = 800;

/// Bounded FIFO of audio chunks awaiting playback.
///
/// Overflow drops the *oldest* queued chunk: under sustained backpressure
/// the freshest audio is the most useful, and added latency stays bounded.
pub struct PlaybackQueue {
    inner: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl PlaybackQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueues a chunk without blocking, dropping the oldest on overflow.
    pub fn push(&self, pcm: Bytes) {
        {
            let mut queue = self.inner.lock().expect("playback queue poisoned");
            if queue.len() >= self.capacity {
                queue.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(dropped, "playback queue full, dropped oldest chunk");
            }
            queue.push_back(pcm);
        }
        self.notify.notify_one();
    }

    /// Dequeues the next chunk, waiting until one arrives or the queue is
    /// closed.
    pub async fn pop(&self) -> Option<Bytes> {
        loop {
            {
                let mut queue = self.inner.lock().expect("playback queue poisoned");
                if let Some(pcm) = queue.pop_front() {
                    return Some(pcm);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Discards everything queued but not yet played.
    pub fn clear(&self) {
        self.inner.lock().expect("playback queue poisoned").clear();
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("playback queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chunks dropped due to overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Buffers streamed assistant text fragments into readable messages.
#[derive(Default)]
struct TextCoalescer {
    buffer: String,
}

impl TextCoalescer {
    /// Appends a fragment; returns a message to emit when a natural break
    /// is reached or enough text has accumulated.
    fn push(&mut self, fragment: &str) -> Option<String> {
        self.buffer.push_str(fragment);
        let at_break = fragment.ends_with(['\n', '.', '!', '?']);
        if at_break || self.buffer.len() > TEXT_FLUSH_THRESHOLD {
            self.take()
        } else {
            None
        }
    }

    fn take(&mut self) -> Option<String> {
        let text = std::mem::take(&mut self.buffer);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// Routes inbound content events to their sinks.
pub struct OutputRouter {
    playback: Arc<PlaybackQueue>,
    channels: Arc<ChannelStore>,
    coalescer: Mutex<TextCoalescer>,
    recorder: Option<Arc<Recorder>>,
}

impl OutputRouter {
    pub fn new(channels: Arc<ChannelStore>, recorder: Option<Arc<Recorder>>) -> Self {
        Self {
            playback: Arc::new(PlaybackQueue::new(PLAYBACK_QUEUE_DEPTH)),
            channels,
            coalescer: Mutex::new(TextCoalescer::default()),
            recorder,
        }
    }

    pub fn playback_queue(&self) -> Arc<PlaybackQueue> {
        Arc::clone(&self.playback)
    }

    /// Dispatches one inbound event. Never blocks on a sink.
    pub fn route(&self, event: &InboundEvent) {
        match event {
            InboundEvent::AudioOut { pcm } => {
                self.playback.push(pcm.clone());
            }
            InboundEvent::TextOut { channel, text } => {
                let flushed = self
                    .coalescer
                    .lock()
                    .expect("coalescer poisoned")
                    .push(text);
                if let Some(message) = flushed {
                    self.channels.append(channel, ChatSender::Assistant, message);
                }
            }
            InboundEvent::TurnComplete => {
                self.flush_text();
            }
            InboundEvent::Interruption => {
                // Queued-but-unplayed audio is stale once the user barges in.
                self.playback.clear();
                self.flush_text();
            }
            // Handled by the tool executor and session controller.
            InboundEvent::ToolCallRequest { .. } | InboundEvent::ConnectionClosed { .. } => {}
        }
    }

    /// Emits any partially coalesced text to the conversation channel.
    pub fn flush_text(&self) {
        let flushed = self.coalescer.lock().expect("coalescer poisoned").take();
        if let Some(message) = flushed {
            self.channels
                .append(CONVERSATION_CHANNEL, ChatSender::Assistant, message);
        }
    }

    /// Spawns the playback task, draining the queue into `sink` in strict
    /// arrival order until cancelled or the queue closes.
    pub fn spawn_playback(
        &self,
        mut sink: Box<dyn PlaybackSink>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(&self.playback);
        let recorder = self.recorder.clone();
        tokio::spawn(async move {
            loop {
                let pcm = tokio::select! {
                    () = cancel.cancelled() => break,
                    pcm = queue.pop() => match pcm {
                        Some(pcm) => pcm,
                        None => break,
                    },
                };
                if let Some(recorder) = &recorder {
                    recorder.write_inbound(&pcm);
                }
                if let Err(err) = sink.play(&pcm).await {
                    tracing::warn!(error = %err, "playback sink failed, stopping playback");
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;

    fn router() -> (OutputRouter, Arc<ChannelStore>) {
        let (tx, _rx) = broadcast::channel(256);
        let channels = Arc::new(ChannelStore::new(tx));
        (OutputRouter::new(Arc::clone(&channels), None), channels)
    }

    fn audio(n: u8) -> InboundEvent {
        InboundEvent::AudioOut {
            pcm: Bytes::from(vec![n]),
        }
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = PlaybackQueue::new(3);
        for n in 0..5u8 {
            queue.push(Bytes::from(vec![n]));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        // The two oldest chunks (0, 1) were dropped.
        let first = queue.inner.lock().unwrap().front().cloned().unwrap();
        assert_eq!(first[0], 2);
    }

    #[tokio::test]
    async fn test_pop_returns_in_arrival_order() {
        let queue = PlaybackQueue::new(8);
        for n in 0..4u8 {
            queue.push(Bytes::from(vec![n]));
        }
        for n in 0..4u8 {
            assert_eq!(queue.pop().await.unwrap()[0], n);
        }
    }

    #[tokio::test]
    async fn test_close_wakes_waiter() {
        let queue = Arc::new(PlaybackQueue::new(2));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[test]
    fn test_stalled_playback_never_delays_text() {
        let (router, channels) = router();
        // Saturate the playback queue well past capacity with no consumer.
        for n in 0..(PLAYBACK_QUEUE_DEPTH as u8).saturating_add(20) {
            router.route(&audio(n));
        }
        router.route(&InboundEvent::TextOut {
            channel: CONVERSATION_CHANNEL.to_string(),
            text: "still delivered.".to_string(),
        });
        let messages = channels.messages(CONVERSATION_CHANNEL);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "still delivered.");
        assert!(router.playback.dropped() > 0);
    }

    #[test]
    fn test_interruption_clears_playback_queue() {
        let (router, _channels) = router();
        for n in 0..5u8 {
            router.route(&audio(n));
        }
        assert_eq!(router.playback.len(), 5);
        router.route(&InboundEvent::Interruption);
        assert!(router.playback.is_empty());
    }

    #[test]
    fn test_text_coalesces_until_sentence_break() {
        let (router, channels) = router();
        for fragment in ["Hello", ", ", "world"] {
            router.route(&InboundEvent::TextOut {
                channel: CONVERSATION_CHANNEL.to_string(),
                text: fragment.to_string(),
            });
        }
        assert!(channels.messages(CONVERSATION_CHANNEL).is_empty());
        router.route(&InboundEvent::TextOut {
            channel: CONVERSATION_CHANNEL.to_string(),
            text: "!".to_string(),
        });
        let messages = channels.messages(CONVERSATION_CHANNEL);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "Hello, world!");
    }

    #[test]
    fn test_turn_complete_flushes_partial_text() {
        let (router, channels) = router();
        router.route(&InboundEvent::TextOut {
            channel: CONVERSATION_CHANNEL.to_string(),
            text: "no punctuation yet".to_string(),
        });
        router.route(&InboundEvent::TurnComplete);
        let messages = channels.messages(CONVERSATION_CHANNEL);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "no punctuation yet");
    }

    #[test]
    fn test_long_buffer_flushes_without_break() {
        let (router, channels) = router();
        let fragment = "a".repeat(801);
        router.route(&InboundEvent::TextOut {
            channel: CONVERSATION_CHANNEL.to_string(),
            text: fragment,
        });
        assert_eq!(channels.messages(CONVERSATION_CHANNEL).len(), 1);
    }
}
