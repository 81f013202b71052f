//! The per-connection [`Client`] record and the capabilities it exposes to applications.
use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        OnceLock,
    },
};

use ::http::StatusCode;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::{
    close::CloseCode,
    codec::Outbound,
    frame::Frame,
    http::{Request, Response},
    message::Payload,
    Result, WebSocketError,
};

/// Identifies one connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ClientId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Instructions for the task that owns the write half of a socket.
#[derive(Debug)]
pub(crate) enum Command {
    Write(Outbound),
    /// Flush what was queued, then shut the socket down.
    Shutdown,
}

/// Writes one message to the peer.
pub trait Sender {
    /// Queues `payload` as a single final frame.
    ///
    /// # Errors
    /// `ConnectionClosed` before the handshake completed, once the connection is closing, or
    /// after the socket went away.
    fn send(&self, payload: Payload) -> Result<()>;
}

/// Ends the connection.
pub trait Closer {
    /// Sends a close frame carrying `code`, then ends the socket. Closing twice does nothing.
    fn close_with(&self, code: CloseCode) -> Result<()>;

    /// Closes with `1000 Normal Closure`.
    fn close(&self) -> Result<()> {
        self.close_with(CloseCode::Normal)
    }
}

/// Free-form per-connection values owned by the application.
pub trait ParameterBag {
    fn parameter(&self, key: &str) -> Option<String>;

    /// Stores `value` under `key`, returning the previous value.
    fn set_parameter(&self, key: &str, value: String) -> Option<String>;

    fn remove_parameter(&self, key: &str) -> Option<String>;
}

/// One TCP connection, from accept until it leaves the registry.
///
/// A `Client` is shared (`Arc<Client>`) between the task driving the connection, the
/// registry and the application. Everything mutable in here is either set once or behind a
/// lock; the protocol state (partial frames and messages) lives in the connection task.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    peer_addr: Option<SocketAddr>,
    request: OnceLock<Request>,
    sub_protocol: OnceLock<String>,
    established: AtomicBool,
    closing: AtomicBool,
    user: RwLock<Option<String>>,
    parameters: RwLock<HashMap<String, String>>,
    tx: mpsc::UnboundedSender<Command>,
}

impl Client {
    pub(crate) fn new(
        id: ClientId,
        peer_addr: Option<SocketAddr>,
        tx: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            peer_addr,
            request: OnceLock::new(),
            sub_protocol: OnceLock::new(),
            established: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            user: RwLock::new(None),
            parameters: RwLock::new(HashMap::new()),
            tx,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// A copy of the upgrade request, once it was parsed.
    pub fn request(&self) -> Option<Request> {
        self.request.get().cloned()
    }

    /// The sub-protocol agreed on during the handshake.
    pub fn sub_protocol(&self) -> Option<&str> {
        self.sub_protocol.get().map(String::as_str)
    }

    /// `true` once the `101` answer was queued.
    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    /// `true` once a close frame was queued or the connection failed. Never resets.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// The authenticated user, if the application set one.
    pub fn user(&self) -> Option<String> {
        self.user.read().clone()
    }

    pub fn set_user(&self, user: Option<String>) {
        *self.user.write() = user;
    }

    pub fn parameters(&self) -> HashMap<String, String> {
        self.parameters.read().clone()
    }

    /// Answers the upgrade request with an HTTP error and ends the socket.
    ///
    /// Only meaningful before the handshake completed; afterwards use [`Closer::close_with`].
    pub fn reject(&self, status: StatusCode) -> Result<()> {
        if self.is_established() || !self.mark_closing() {
            return Ok(());
        }
        self.write(Response::error(status))?;
        self.shutdown()
    }

    /// Queues a ping carrying `payload` (at most 125 bytes).
    pub fn ping(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        let payload = payload.as_ref();
        if payload.len() as u64 > crate::protocol::MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }
        self.ensure_open()?;
        self.write(Frame::ping(payload))
    }

    pub(crate) fn set_request(&self, request: Request) {
        let _ = self.request.set(request);
    }

    pub(crate) fn set_sub_protocol(&self, sub_protocol: String) {
        let _ = self.sub_protocol.set(sub_protocol);
    }

    pub(crate) fn mark_established(&self) {
        self.established.store(true, Ordering::Release);
    }

    /// Flips the closing flag. Returns `true` only for the call that flipped it.
    pub(crate) fn mark_closing(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn write(&self, item: impl Into<Outbound>) -> Result<()> {
        self.tx
            .send(Command::Write(item.into()))
            .map_err(|_| WebSocketError::ConnectionClosed)
    }

    pub(crate) fn shutdown(&self) -> Result<()> {
        self.tx
            .send(Command::Shutdown)
            .map_err(|_| WebSocketError::ConnectionClosed)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_established() && !self.is_closing() {
            Ok(())
        } else {
            Err(WebSocketError::ConnectionClosed)
        }
    }
}

impl Sender for Client {
    fn send(&self, payload: Payload) -> Result<()> {
        self.ensure_open()?;
        self.write(Frame::from(payload))
    }
}

impl Closer for Client {
    fn close_with(&self, code: CloseCode) -> Result<()> {
        if !self.mark_closing() {
            return Ok(());
        }
        if self.is_established() {
            self.write(Frame::close(code, ""))?;
        }
        self.shutdown()
    }
}

impl ParameterBag for Client {
    fn parameter(&self, key: &str) -> Option<String> {
        self.parameters.read().get(key).cloned()
    }

    fn set_parameter(&self, key: &str, value: String) -> Option<String> {
        self.parameters.write().insert(key.to_owned(), value)
    }

    fn remove_parameter(&self, key: &str) -> Option<String> {
        self.parameters.write().remove(key)
    }
}
