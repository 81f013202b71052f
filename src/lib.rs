//! # yawss
//! A WebSocket server (RFC 6455) that owns its TCP connections end to end: it performs the
//! HTTP upgrade handshake itself, decodes and encodes the binary framing format, reassembles
//! fragmented messages, validates text payloads and hands complete messages to an
//! [`Application`].
//!
//! No HTTP server library sits in front of it. Each accepted socket is driven by its own
//! task through the connection state machine:
//!
//! ```text
//! AwaitingHandshake -> Establishing -> Established -> Closing -> Closed
//! ```
//!
//! Connected clients are kept in a [`ClientRegistry`] so the rest of a program can address
//! them by [`ClientId`], for example to broadcast a message to everybody.
//!
//! # Server Example
//! ```no_run
//! use std::sync::Arc;
//! use yawss::{Application, Client, HandlerResult, Options, Payload, Request, Sender, Server};
//!
//! struct Echo;
//!
//! impl Application for Echo {
//!     fn handle_message(&self, client: &Arc<Client>, _: &Request, payload: Payload) -> HandlerResult {
//!         client.send(payload)?;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> yawss::Result<()> {
//!     let server = Server::bind(Options::default().with_port(8080), Echo).await?;
//!     server.run().await
//! }
//! ```
//!
//! # Protocol versions
//! Two protocol implementations are registered by default: RFC 6455 (`Sec-WebSocket-Version: 13`)
//! and the older HyBi drafts (versions 6 to 12), which share the RFC 6455 framing.
//!
//! # Memory Safety
//! - The handshake buffer is capped (default 4 KiB) before the header block completes
//! - Frame and message payloads are capped (defaults 1 MiB and 2 MiB)
//! - Any protocol violation is fatal to that one connection only

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod application;
pub mod client;
pub mod close;
pub mod codec;
pub mod connection;
pub mod frame;
pub mod handshake;
pub mod http;
mod mask;
pub mod message;
pub mod options;
pub mod policy;
pub mod protocol;
pub mod registry;
mod server;
mod stream;
pub mod utf8;

use thiserror::Error;

pub use application::{Application, HandlerResult};
pub use client::{Client, ClientId, Closer, ParameterBag, Sender};
pub use close::CloseCode;
pub use frame::{Frame, OpCode};
pub use crate::http::{Request, Response};
pub use message::{Message, Payload};
pub use options::Options;
pub use registry::{ClientRegistry, MemoryDriver, StorageDriver};
pub use server::{Server, ServerHandle};
pub use stream::MaybeTlsStream;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Boxed error returned by application callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur while serving a WebSocket connection.
///
/// The variants fall into four groups:
///
/// - Handshake errors (malformed or oversized upgrade request, unsupported version)
/// - Framing errors (reserved bits, missing mask, bad continuation order, oversized control frames)
/// - Payload errors (invalid UTF-8, oversized messages)
/// - Registry, application and I/O errors
///
/// Every error is local to the connection it was raised on. [`WebSocketError::status_code`] and
/// [`WebSocketError::close_code`] tell the connection how to report it to the peer.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// The request line or a header line of the upgrade request could not be parsed.
    #[error("Malformed request: {0}")]
    MalformedRequest(&'static str),

    /// The upgrade request grew past the configured maximum before its header block ended.
    #[error("Request too large")]
    RequestTooLarge,

    /// No registered protocol implementation accepts the requested `Sec-WebSocket-Version`.
    #[error("Unsupported protocol version")]
    UnsupportedProtocol,

    /// The upgrade request failed one of the RFC 6455 handshake preconditions.
    #[error("Handshake verification failed")]
    HandshakeFailed,

    /// The client never completed its upgrade request within the handshake timeout.
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// Reserved bits in the WebSocket frame header are set when they should be 0.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A client sent a frame without a masking key.
    #[error("Client frame is not masked")]
    UnmaskedFrame,

    /// A control frame (ping, pong, or close) was received with the FIN bit not set.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame payload exceeds 125 bytes.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// A 64-bit payload length has its most significant bit set.
    #[error("Invalid payload length")]
    InvalidPayloadLength,

    /// The frame header carries an opcode outside of the ones defined by RFC 6455.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A continuation frame arrived without a message to continue, or a new data frame
    /// arrived while a fragmented message was still open.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// A close frame carried a 1 byte payload.
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// A close frame carried a status code that must not appear on the wire.
    #[error("Invalid close code")]
    InvalidCloseCode,

    /// A text message or a close reason is not valid UTF-8.
    #[error("Invalid payload")]
    InvalidPayload,

    /// A frame or a reassembled message exceeds the configured maximum size.
    #[error("Frame too large")]
    FrameTooLarge,

    /// The frame or message was read before all of its bytes arrived.
    #[error("Frame is not coalesced")]
    NotCoalesced,

    /// The registry has no client with this id.
    #[error("Client not found: {0}")]
    ClientNotFound(ClientId),

    /// The registry already holds a client with this id.
    #[error("Duplicate client: {0}")]
    DuplicateClient(ClientId),

    /// Returned when attempting to write to a connection that is closing or closed.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// An application callback failed.
    #[error("Application error: {0}")]
    Application(BoxError),

    /// The TLS configuration could not be used.
    #[error("TLS error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    /// Wraps standard I/O errors that may occur during WebSocket communication.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl WebSocketError {
    /// The HTTP status used to reject a connection that fails before the upgrade completes.
    pub fn status_code(&self) -> ::http::StatusCode {
        use ::http::StatusCode;

        match self {
            Self::MalformedRequest(_) | Self::HandshakeFailed => StatusCode::BAD_REQUEST,
            Self::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsupportedProtocol => StatusCode::UPGRADE_REQUIRED,
            Self::HandshakeTimeout => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The close code used to fail an established connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::ReservedBitsNotZero
            | Self::UnmaskedFrame
            | Self::ControlFrameFragmented
            | Self::ControlFrameTooLarge
            | Self::InvalidPayloadLength
            | Self::InvalidOpCode(_)
            | Self::InvalidContinuationFrame
            | Self::InvalidCloseFrame
            | Self::InvalidCloseCode => CloseCode::Protocol,
            Self::InvalidPayload => CloseCode::Invalid,
            Self::FrameTooLarge => CloseCode::Size,
            _ => CloseCode::Error,
        }
    }

    /// Returns `true` for errors caused by the peer breaking the framing rules.
    pub fn is_protocol_violation(&self) -> bool {
        self.close_code() == CloseCode::Protocol
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            WebSocketError::MalformedRequest("request line").status_code(),
            ::http::StatusCode::BAD_REQUEST
        );
        assert_eq!(
            WebSocketError::RequestTooLarge.status_code().as_u16(),
            413
        );
        assert_eq!(
            WebSocketError::UnsupportedProtocol.status_code().as_u16(),
            426
        );
        assert_eq!(
            WebSocketError::ClientNotFound(ClientId::from(7)).status_code().as_u16(),
            500
        );
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(WebSocketError::ReservedBitsNotZero.close_code(), CloseCode::Protocol);
        assert_eq!(WebSocketError::UnmaskedFrame.close_code(), CloseCode::Protocol);
        assert_eq!(WebSocketError::InvalidPayload.close_code(), CloseCode::Invalid);
        assert_eq!(WebSocketError::FrameTooLarge.close_code(), CloseCode::Size);
        assert_eq!(WebSocketError::InvalidPayloadLength.close_code(), CloseCode::Protocol);
        assert_eq!(WebSocketError::ConnectionClosed.close_code(), CloseCode::Error);

        assert!(WebSocketError::InvalidContinuationFrame.is_protocol_violation());
        assert!(!WebSocketError::InvalidPayload.is_protocol_violation());
    }
}
