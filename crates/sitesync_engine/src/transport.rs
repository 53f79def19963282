//! Transport layer abstraction for sync messages.

use crate::error::SyncResult;
use parking_lot::{Mutex, RwLock};
use sitesync_protocol::{AnnouncePresence, Changes, Message, RejectChanges, StartStreaming};
use std::collections::VecDeque;
use std::sync::Arc;

/// Result of a non-blocking changeset send.
///
/// Backpressure is signalled, never absorbed: a transport must not
/// queue unboundedly. Callers own the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame was handed to the channel.
    Sent,
    /// Outbound buffer is over the backpressure threshold.
    BufferFull,
    /// Channel is currently down and reconnecting.
    Reconnecting,
}

/// Wire format used on a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// Compact binary framing, the high-throughput default.
    #[default]
    Binary,
    /// JSON framing for low-volume or debug transports.
    Json,
}

impl WireFormat {
    /// Encodes a message in this format.
    pub fn encode(&self, message: &Message) -> Vec<u8> {
        match self {
            WireFormat::Binary => message.encode(),
            WireFormat::Json => message.encode_json(),
        }
    }

    /// Decodes a message in this format.
    pub fn decode(&self, frame: &[u8]) -> sitesync_codec::CodecResult<Message> {
        match self {
            WireFormat::Binary => Message::decode(frame),
            WireFormat::Json => Message::decode_json(frame),
        }
    }
}

/// Callbacks invoked when a decoded message of the matching type
/// arrives on a transport.
pub trait TransportHandler: Send + Sync {
    /// A changeset batch arrived.
    fn on_changes(&self, message: Changes);

    /// The peer told us where to stream from.
    fn on_start_streaming(&self, message: StartStreaming);

    /// The peer rejected our stream and reported its true watermark.
    fn on_reset_stream(&self, message: RejectChanges);

    /// A peer announced itself (server side; clients ignore this).
    fn on_announce_presence(&self, message: AnnouncePresence) {
        let _ = message;
    }

    /// The underlying channel (re)opened cleanly.
    fn on_connected(&self) {}
}

/// A sync transport carries encoded messages over one physical channel.
///
/// One encoded message per physical frame; implementations exist per
/// channel kind (reconnecting WebSocket, in-process pair, server-side
/// socket wrapper, mock for testing).
pub trait Transport: Send + Sync {
    /// Sends a changeset batch without blocking.
    fn send_changes(&self, message: &Changes) -> SyncResult<SendOutcome>;

    /// Sends a presence announcement.
    fn announce_presence(&self, message: &AnnouncePresence) -> SyncResult<()>;

    /// Sends a rejection.
    fn reject_changes(&self, message: &RejectChanges) -> SyncResult<()>;

    /// Sends a stream-start instruction.
    fn start_streaming(&self, message: &StartStreaming) -> SyncResult<()>;

    /// Registers the handler for inbound messages.
    fn set_handler(&self, handler: Arc<dyn TransportHandler>);

    /// Opens the channel.
    fn start(&self) -> SyncResult<()>;

    /// Closes the channel. Idempotent.
    fn close(&self) -> SyncResult<()>;
}

/// A mock transport for testing.
///
/// Records every sent message and lets tests script `send_changes`
/// outcomes (defaulting to `Sent`) and inject inbound messages.
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<Message>>,
    outcomes: Mutex<VecDeque<SendOutcome>>,
    handler: RwLock<Option<Arc<dyn TransportHandler>>>,
    started: Mutex<bool>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the outcome for the next `send_changes` call.
    pub fn push_outcome(&self, outcome: SendOutcome) {
        self.outcomes.lock().push_back(outcome);
    }

    /// Queues the same outcome `n` times.
    pub fn push_outcomes(&self, outcome: SendOutcome, n: usize) {
        let mut outcomes = self.outcomes.lock();
        for _ in 0..n {
            outcomes.push_back(outcome);
        }
    }

    /// Every message sent so far.
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    /// Every changeset batch sent so far.
    pub fn sent_changes(&self) -> Vec<Changes> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| match m {
                Message::Changes(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    /// Delivers an inbound message to the registered handler.
    pub fn deliver(&self, message: Message) {
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            match message {
                Message::Changes(msg) => handler.on_changes(msg),
                Message::StartStreaming(msg) => handler.on_start_streaming(msg),
                Message::RejectChanges(msg) => handler.on_reset_stream(msg),
                Message::AnnouncePresence(msg) => handler.on_announce_presence(msg),
            }
        }
    }

    /// Signals a clean reopen to the registered handler.
    pub fn fire_connected(&self) {
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler.on_connected();
        }
    }

    /// Whether `start` has been called.
    pub fn is_started(&self) -> bool {
        *self.started.lock()
    }
}

impl Transport for MockTransport {
    fn send_changes(&self, message: &Changes) -> SyncResult<SendOutcome> {
        let outcome = self
            .outcomes
            .lock()
            .pop_front()
            .unwrap_or(SendOutcome::Sent);
        if outcome == SendOutcome::Sent {
            self.sent.lock().push(Message::Changes(message.clone()));
        }
        Ok(outcome)
    }

    fn announce_presence(&self, message: &AnnouncePresence) -> SyncResult<()> {
        self.sent
            .lock()
            .push(Message::AnnouncePresence(message.clone()));
        Ok(())
    }

    fn reject_changes(&self, message: &RejectChanges) -> SyncResult<()> {
        self.sent
            .lock()
            .push(Message::RejectChanges(message.clone()));
        Ok(())
    }

    fn start_streaming(&self, message: &StartStreaming) -> SyncResult<()> {
        self.sent
            .lock()
            .push(Message::StartStreaming(message.clone()));
        Ok(())
    }

    fn set_handler(&self, handler: Arc<dyn TransportHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn start(&self) -> SyncResult<()> {
        *self.started.lock() = true;
        Ok(())
    }

    fn close(&self) -> SyncResult<()> {
        *self.started.lock() = false;
        *self.handler.write() = None;
        Ok(())
    }
}
