//! Reconnecting socket wrapper and its transport adapter.
//!
//! The physical WebSocket (or any frame-oriented channel) sits behind
//! [`SocketFactory`]/[`SocketLink`], so the reconnect state machine is
//! independent of the socket library and fully testable.

use crate::config::BackoffConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::{SendOutcome, Transport, TransportHandler, WireFormat};
use parking_lot::{Mutex, RwLock};
use sitesync_protocol::{AnnouncePresence, Changes, Message, RejectChanges, StartStreaming};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Normal (clean) close code.
pub const CLOSE_NORMAL: u16 = 1000;
/// Protocol error close code, used for undecodable frames.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Abnormal closure, as reported for dropped connections.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Connection state of a [`ReconnectingSocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Not connected and not trying to be.
    Closed,
    /// Connection attempt in progress.
    Connecting,
    /// Connected and usable.
    Open,
    /// Lost the connection; a reconnect is scheduled.
    Reconnecting,
}

/// An open physical channel.
pub trait SocketLink: Send + Sync {
    /// Queues one frame for sending.
    fn send(&self, frame: &[u8]) -> SyncResult<()>;

    /// Bytes queued but not yet flushed to the wire.
    fn buffered(&self) -> usize;

    /// Closes the channel.
    fn close(&self);
}

/// Events delivered by the physical channel.
pub trait SocketDelegate: Send + Sync {
    /// The channel finished opening.
    fn on_open(&self);

    /// One complete frame arrived.
    fn on_frame(&self, frame: &[u8]);

    /// The channel closed with the given close code.
    fn on_close(&self, code: u16);
}

/// Opens physical channels; one implementation per socket library.
pub trait SocketFactory: Send + Sync {
    /// Starts connecting to `url`, delivering events to `delegate`.
    fn connect(
        &self,
        url: &str,
        delegate: Arc<dyn SocketDelegate>,
    ) -> SyncResult<Arc<dyn SocketLink>>;
}

/// Events a [`ReconnectingSocket`] reports to its owner.
pub trait SocketObserver: Send + Sync {
    /// The socket (re)opened cleanly.
    fn on_socket_open(&self);

    /// A frame arrived.
    fn on_socket_frame(&self, frame: &[u8]);

    /// The socket closed for good (clean close or fatal error).
    fn on_socket_closed(&self);
}

/// A socket that survives its transport.
///
/// `Closed → Connecting → Open → {Closed | Reconnecting}`. Errors and
/// abnormal closes reconnect with exponential backoff from the
/// configured floor up to the ceiling; a visibility signal while
/// reconnecting resets the backoff and retries immediately, so a
/// foregrounded user is not punished with a long-tail delay
/// accumulated while backgrounded.
pub struct ReconnectingSocket {
    factory: Arc<dyn SocketFactory>,
    url: String,
    backoff: BackoffConfig,
    inner: Mutex<SocketInner>,
    observer: RwLock<Option<Arc<dyn SocketObserver>>>,
    weak: Weak<Self>,
}

struct SocketInner {
    state: SocketState,
    link: Option<Arc<dyn SocketLink>>,
    next_delay: Duration,
    pending_reconnect: Option<Duration>,
    user_closed: bool,
}

impl ReconnectingSocket {
    /// Creates a closed socket; call [`ReconnectingSocket::open`].
    pub fn new(
        factory: Arc<dyn SocketFactory>,
        url: impl Into<String>,
        backoff: BackoffConfig,
    ) -> Arc<Self> {
        let connect_floor = backoff.connect_floor;
        Arc::new_cyclic(|weak| Self {
            factory,
            url: url.into(),
            backoff,
            inner: Mutex::new(SocketInner {
                state: SocketState::Closed,
                link: None,
                next_delay: connect_floor,
                pending_reconnect: None,
                user_closed: false,
            }),
            observer: RwLock::new(None),
            weak: weak.clone(),
        })
    }

    /// Registers the owner to receive socket events.
    pub fn set_observer(&self, observer: Arc<dyn SocketObserver>) {
        *self.observer.write() = Some(observer);
    }

    /// Current connection state.
    pub fn state(&self) -> SocketState {
        self.inner.lock().state
    }

    /// True when frames can be sent.
    pub fn is_open(&self) -> bool {
        self.state() == SocketState::Open
    }

    /// Bytes queued on the link but not yet flushed.
    pub fn buffered(&self) -> usize {
        let inner = self.inner.lock();
        inner.link.as_ref().map(|l| l.buffered()).unwrap_or(0)
    }

    /// The delay until the scheduled reconnect, if one is pending.
    pub fn pending_reconnect(&self) -> Option<Duration> {
        self.inner.lock().pending_reconnect
    }

    /// Begins connecting. Safe to call while already connecting.
    pub fn open(&self) {
        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, SocketState::Connecting | SocketState::Open) {
                return;
            }
            inner.user_closed = false;
            inner.pending_reconnect = None;
            inner.state = SocketState::Connecting;
        }
        self.connect_now();
    }

    /// Invoked by the host when the scheduled reconnect delay elapses.
    pub fn on_retry_timer(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.user_closed || inner.pending_reconnect.is_none() {
                return;
            }
            inner.pending_reconnect = None;
            inner.state = SocketState::Connecting;
        }
        self.connect_now();
    }

    /// Visibility signal: the app came back to the foreground.
    ///
    /// While reconnecting this resets the backoff to the floor and
    /// reconnects immediately.
    pub fn on_visible(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state != SocketState::Reconnecting {
                return;
            }
            inner.next_delay = self.backoff.connect_floor;
            inner.pending_reconnect = None;
            inner.state = SocketState::Connecting;
        }
        self.connect_now();
    }

    /// Closes for good; no reconnect will follow. Idempotent.
    pub fn close(&self) {
        let link = {
            let mut inner = self.inner.lock();
            inner.user_closed = true;
            inner.state = SocketState::Closed;
            inner.pending_reconnect = None;
            inner.link.take()
        };
        if let Some(link) = link {
            link.close();
        }
    }

    /// Fatal close after a protocol error: never reconnects, and the
    /// owner is told the socket is gone.
    pub fn close_protocol_error(&self) {
        error!("closing socket after protocol error");
        let observer = self.observer.read().clone();
        self.close();
        if let Some(observer) = observer {
            observer.on_socket_closed();
        }
    }

    /// Sends one frame on the open link.
    pub fn send_frame(&self, frame: &[u8]) -> SyncResult<()> {
        let link = {
            let inner = self.inner.lock();
            if inner.state != SocketState::Open {
                return Err(SyncError::NotConnected);
            }
            inner.link.clone()
        };
        match link {
            Some(link) => link.send(frame),
            None => Err(SyncError::NotConnected),
        }
    }

    fn connect_now(&self) {
        let delegate: Arc<dyn SocketDelegate> = match self.weak.upgrade() {
            Some(this) => this,
            None => return,
        };
        match self.factory.connect(&self.url, delegate) {
            Ok(link) => {
                let mut inner = self.inner.lock();
                if inner.user_closed {
                    drop(inner);
                    link.close();
                    return;
                }
                inner.link = Some(link);
                // State stays Connecting until on_open fires.
            }
            Err(err) => {
                warn!(error = %err, url = %self.url, "socket connect failed");
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&self) {
        let mut inner = self.inner.lock();
        if inner.user_closed {
            return;
        }
        inner.link = None;
        inner.state = SocketState::Reconnecting;
        let delay = inner.next_delay;
        inner.next_delay = BackoffConfig::doubled(delay, self.backoff.connect_ceiling);
        inner.pending_reconnect = Some(delay);
        debug!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
    }
}

impl SocketDelegate for ReconnectingSocket {
    fn on_open(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.user_closed {
                return;
            }
            inner.state = SocketState::Open;
            inner.next_delay = self.backoff.connect_floor;
        }
        if let Some(observer) = self.observer.read().clone() {
            observer.on_socket_open();
        }
    }

    fn on_frame(&self, frame: &[u8]) {
        if let Some(observer) = self.observer.read().clone() {
            observer.on_socket_frame(frame);
        }
    }

    fn on_close(&self, code: u16) {
        let clean = {
            let mut inner = self.inner.lock();
            if inner.user_closed {
                inner.state = SocketState::Closed;
                inner.link = None;
                return;
            }
            if code == CLOSE_NORMAL {
                inner.state = SocketState::Closed;
                inner.link = None;
                true
            } else {
                false
            }
        };
        if clean {
            if let Some(observer) = self.observer.read().clone() {
                observer.on_socket_closed();
            }
        } else {
            self.schedule_reconnect();
        }
    }
}

/// Adapts a [`ReconnectingSocket`] to the [`Transport`] trait.
///
/// Maps socket state to send outcomes: a closed/reconnecting socket
/// yields `Reconnecting`, a link buffered past the threshold yields
/// `BufferFull`. An inbound frame that fails to decode closes the
/// connection with a protocol error and is never partially processed.
pub struct SocketTransport {
    socket: Arc<ReconnectingSocket>,
    format: WireFormat,
    buffer_limit: usize,
    handler: RwLock<Option<Arc<dyn TransportHandler>>>,
}

impl SocketTransport {
    /// Wraps a socket, registering for its events.
    pub fn new(
        socket: Arc<ReconnectingSocket>,
        format: WireFormat,
        buffer_limit: usize,
    ) -> Arc<Self> {
        let transport = Arc::new(Self {
            socket,
            format,
            buffer_limit,
            handler: RwLock::new(None),
        });
        transport
            .socket
            .set_observer(Arc::clone(&transport) as Arc<dyn SocketObserver>);
        transport
    }

    /// The wrapped socket.
    pub fn socket(&self) -> &Arc<ReconnectingSocket> {
        &self.socket
    }

    fn send_control(&self, message: Message) -> SyncResult<()> {
        if !self.socket.is_open() {
            return Err(SyncError::NotConnected);
        }
        self.socket.send_frame(&self.format.encode(&message))
    }
}

impl SocketObserver for SocketTransport {
    fn on_socket_open(&self) {
        if let Some(handler) = self.handler.read().clone() {
            handler.on_connected();
        }
    }

    fn on_socket_frame(&self, frame: &[u8]) {
        let message = match self.format.decode(frame) {
            Ok(message) => message,
            Err(err) => {
                error!(error = %err, "undecodable frame");
                self.socket.close_protocol_error();
                return;
            }
        };
        let handler = match self.handler.read().clone() {
            Some(handler) => handler,
            None => return,
        };
        match message {
            Message::Changes(msg) => handler.on_changes(msg),
            Message::StartStreaming(msg) => handler.on_start_streaming(msg),
            Message::RejectChanges(msg) => handler.on_reset_stream(msg),
            Message::AnnouncePresence(msg) => handler.on_announce_presence(msg),
        }
    }

    fn on_socket_closed(&self) {}
}

impl Transport for SocketTransport {
    fn send_changes(&self, message: &Changes) -> SyncResult<SendOutcome> {
        if !self.socket.is_open() {
            return Ok(SendOutcome::Reconnecting);
        }
        if self.socket.buffered() >= self.buffer_limit {
            return Ok(SendOutcome::BufferFull);
        }
        self.socket
            .send_frame(&self.format.encode(&Message::Changes(message.clone())))?;
        Ok(SendOutcome::Sent)
    }

    fn announce_presence(&self, message: &AnnouncePresence) -> SyncResult<()> {
        self.send_control(Message::AnnouncePresence(message.clone()))
    }

    fn reject_changes(&self, message: &RejectChanges) -> SyncResult<()> {
        self.send_control(Message::RejectChanges(message.clone()))
    }

    fn start_streaming(&self, message: &StartStreaming) -> SyncResult<()> {
        self.send_control(Message::StartStreaming(message.clone()))
    }

    fn set_handler(&self, handler: Arc<dyn TransportHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn start(&self) -> SyncResult<()> {
        self.socket.open();
        Ok(())
    }

    fn close(&self) -> SyncResult<()> {
        *self.handler.write() = None;
        self.socket.close();
        Ok(())
    }
}
