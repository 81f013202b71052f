//! Protocol versions and their negotiation.
//!
//! A [`Protocol`] decides whether it can serve a handshake, builds the `101` answer and
//! validates inbound frame headers. [`Negotiator`] picks the implementation for a request
//! from its `Sec-WebSocket-Version` header.
use std::{fmt, ops::RangeInclusive, sync::Arc};

use ::http::{header, HeaderValue, StatusCode};

use crate::{
    frame::FrameHeader,
    handshake,
    http::{Request, Response},
    Result, WebSocketError,
};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: u64 = 125;

/// One version of the WebSocket protocol.
pub trait Protocol: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// The `Sec-WebSocket-Version` values this implementation serves.
    fn versions(&self) -> RangeInclusive<u8>;

    fn is_version(&self, version: u8) -> bool {
        self.versions().contains(&version)
    }

    /// Runs the handshake checks with this protocol's version predicate.
    fn verify(&self, request: &Request) -> bool {
        handshake::verify_all(request, |version| self.is_version(version))
    }

    /// Builds the `101 Switching Protocols` answer for a verified request.
    ///
    /// # Errors
    /// `HandshakeFailed` if the request carries no `Sec-WebSocket-Key`.
    fn handshake_response(&self, request: &Request, sub_protocol: Option<&str>) -> Result<Response> {
        let key = request
            .header(header::SEC_WEBSOCKET_KEY)
            .ok_or(WebSocketError::HandshakeFailed)?;
        let accept = handshake::sec_websocket_accept(key.trim().as_bytes());

        let mut response = Response::new(StatusCode::SWITCHING_PROTOCOLS)
            .with_header(header::UPGRADE, HeaderValue::from_static("websocket"))
            .with_header(header::CONNECTION, HeaderValue::from_static("Upgrade"))
            .try_with_header(header::SEC_WEBSOCKET_ACCEPT, &accept)?;

        if let Some(sub_protocol) = sub_protocol {
            response = response.try_with_header(header::SEC_WEBSOCKET_PROTOCOL, sub_protocol)?;
        }

        Ok(response)
    }

    /// Checks an inbound frame header before its payload is buffered.
    ///
    /// # Errors
    /// - `ReservedBitsNotZero` when RSV1-3 are set; no extension is negotiated.
    /// - `UnmaskedFrame` for a client frame without a masking key.
    /// - `ControlFrameFragmented` / `ControlFrameTooLarge` for control frames that are not
    ///   final or carry more than 125 bytes.
    /// - `InvalidPayloadLength` when a 64-bit length has its most significant bit set.
    /// - `FrameTooLarge` when the payload exceeds `max_payload`.
    fn validate_frame(&self, header: &FrameHeader, max_payload: usize) -> Result<()> {
        if header.rsv != 0 {
            return Err(WebSocketError::ReservedBitsNotZero);
        }

        if header.mask.is_none() {
            return Err(WebSocketError::UnmaskedFrame);
        }

        if header.opcode.is_control() {
            if !header.fin {
                return Err(WebSocketError::ControlFrameFragmented);
            }
            if header.payload_len > MAX_CONTROL_PAYLOAD {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
        }

        if header.payload_len >> 63 != 0 {
            return Err(WebSocketError::InvalidPayloadLength);
        }

        if header.payload_len > max_payload as u64 {
            return Err(WebSocketError::FrameTooLarge);
        }

        Ok(())
    }
}

/// RFC 6455, `Sec-WebSocket-Version: 13`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rfc6455;

impl Protocol for Rfc6455 {
    fn name(&self) -> &'static str {
        "RFC6455"
    }

    fn versions(&self) -> RangeInclusive<u8> {
        13..=13
    }
}

/// The HyBi drafts 6 to 12. They frame messages exactly like RFC 6455 and only differ in
/// the version number clients announce.
#[derive(Debug, Clone, Copy, Default)]
pub struct HyBi10;

impl Protocol for HyBi10 {
    fn name(&self) -> &'static str {
        "HyBi10"
    }

    fn versions(&self) -> RangeInclusive<u8> {
        6..=12
    }
}

/// Chooses a [`Protocol`] for an upgrade request.
///
/// Implementations are tried in registration order; the first whose version predicate
/// accepts the request wins.
#[derive(Debug, Clone)]
pub struct Negotiator {
    protocols: Vec<Arc<dyn Protocol>>,
}

impl Default for Negotiator {
    /// RFC 6455 first, then HyBi10.
    fn default() -> Self {
        Self::new()
            .with_protocol(Arc::new(Rfc6455))
            .with_protocol(Arc::new(HyBi10))
    }
}

impl Negotiator {
    /// A negotiator that supports nothing yet.
    pub fn new() -> Self {
        Self {
            protocols: Vec::new(),
        }
    }

    pub fn with_protocol(mut self, protocol: Arc<dyn Protocol>) -> Self {
        self.protocols.push(protocol);
        self
    }

    pub fn is_supported(&self, request: &Request) -> bool {
        self.find(request).is_some()
    }

    /// # Errors
    /// `UnsupportedProtocol` if no implementation accepts the requested version.
    pub fn select(&self, request: &Request) -> Result<Arc<dyn Protocol>> {
        self.find(request).ok_or(WebSocketError::UnsupportedProtocol)
    }

    fn find(&self, request: &Request) -> Option<Arc<dyn Protocol>> {
        let version = handshake::requested_version(request)?;
        self.protocols
            .iter()
            .find(|protocol| protocol.is_version(version))
            .cloned()
    }

    /// Every supported version, newest first, as sent in a `426` answer.
    pub fn supported_versions(&self) -> String {
        let mut versions: Vec<u8> = self
            .protocols
            .iter()
            .flat_map(|protocol| protocol.versions())
            .collect();
        versions.sort_unstable_by(|a, b| b.cmp(a));
        versions.dedup();

        versions
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}
