//! # Frame
//!
//! The `frame` module implements WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! ### Frame Binary Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! A [`Frame`] owns the raw wire bytes of one frame. Outgoing frames are built complete with
//! [`Frame::new`]; incoming frames start empty and grow through [`Frame::add_buffer`] as socket
//! reads arrive. Nothing about the header is cached: every query re-parses the buffered bytes,
//! so a length prefix split across two reads is picked up as soon as it is complete.
//!
//! ```rust
//! use yawss::frame::{Frame, OpCode};
//!
//! let wire = Frame::masked("Hello", true, OpCode::Text, [0x37, 0xfa, 0x21, 0x3d]);
//!
//! let mut frame = Frame::default();
//! frame.add_buffer(&wire.as_bytes()[..3]);
//! assert!(!frame.is_coalesced());
//! frame.add_buffer(&wire.as_bytes()[3..]);
//! assert!(frame.is_coalesced());
//!
//! frame.unmask().unwrap();
//! assert_eq!(frame.payload().unwrap(), b"Hello");
//! ```
use bytes::{Bytes, BytesMut};

use crate::{close::CloseCode, mask::apply_mask, Result, WebSocketError};

/// WebSocket operation code (OpCode) that determines the semantic meaning and handling of a frame.
///
/// # Data Frame OpCodes
/// - `Continuation`: Continues a fragmented message started by another data frame
/// - `Text`: Contains UTF-8 encoded text data
/// - `Binary`: Contains raw binary data
///
/// # Control Frame OpCodes
/// - `Close`: Initiates or confirms connection closure
/// - `Ping`: Tests connection liveness, requiring a `Pong` response
/// - `Pong`: Responds to a `Ping` frame
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved; frames using them are rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` if the `OpCode` represents a control frame (`Close`, `Ping`, or `Pong`).
    ///
    /// Control frames cannot be fragmented and carry at most 125 bytes of payload.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// Header fields of a frame, available once the length prefix and masking key are buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Indicates if this is the final fragment in a message.
    pub fin: bool,
    /// RSV1, RSV2 and RSV3 as the low three bits.
    pub rsv: u8,
    pub opcode: OpCode,
    /// The masking key, if the MASK bit is set.
    pub mask: Option<[u8; 4]>,
    /// Declared payload length.
    pub payload_len: u64,
    /// Size of everything before the payload, in bytes (2 to 14).
    pub header_len: usize,
}

impl FrameHeader {
    /// Total size of the frame on the wire, or `None` if it does not fit in memory.
    pub fn frame_len(&self) -> Option<usize> {
        usize::try_from(self.payload_len)
            .ok()?
            .checked_add(self.header_len)
    }
}

pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// One WebSocket frame, stored as its raw wire bytes.
///
/// A frame is *coalesced* once the buffer holds at least as many bytes as the header declares.
/// Bytes past that point belong to the next frame and can be split off with
/// [`Frame::extract_overflow`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    buffer: BytesMut,
}

impl Frame {
    /// Encodes an unmasked frame, the form every server-to-client frame takes.
    ///
    /// # Parameters
    /// - `payload`: The frame payload data.
    /// - `fin`: Indicates if this frame is the final fragment in a message.
    /// - `opcode`: The operation code of the frame.
    pub fn new(payload: impl AsRef<[u8]>, fin: bool, opcode: OpCode) -> Self {
        Self::encode(payload.as_ref(), fin, opcode, None)
    }

    /// Encodes a frame masked with `key`, the form every client-to-server frame takes.
    pub fn masked(payload: impl AsRef<[u8]>, fin: bool, opcode: OpCode, key: [u8; 4]) -> Self {
        Self::encode(payload.as_ref(), fin, opcode, Some(key))
    }

    /// Encodes a frame masked with a random key.
    pub fn with_random_mask(payload: impl AsRef<[u8]>, fin: bool, opcode: OpCode) -> Self {
        Self::masked(payload, fin, opcode, rand::random())
    }

    /// Creates a final text frame.
    pub fn text(payload: impl AsRef<[u8]>) -> Self {
        Self::new(payload, true, OpCode::Text)
    }

    /// Creates a final binary frame.
    pub fn binary(payload: impl AsRef<[u8]>) -> Self {
        Self::new(payload, true, OpCode::Binary)
    }

    pub fn ping(payload: impl AsRef<[u8]>) -> Self {
        Self::new(payload, true, OpCode::Ping)
    }

    pub fn pong(payload: impl AsRef<[u8]>) -> Self {
        Self::new(payload, true, OpCode::Pong)
    }

    /// Creates a close frame carrying `code` followed by the UTF-8 `reason`.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason);
        Self::new(payload, true, OpCode::Close)
    }

    /// Creates a close frame with a raw payload.
    ///
    /// This method does not validate if `payload` is a valid close frame payload.
    pub fn close_raw(payload: impl AsRef<[u8]>) -> Self {
        Self::new(payload, true, OpCode::Close)
    }

    /// Starts a frame from bytes read off the wire.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let mut frame = Self::default();
        frame.add_buffer(bytes);
        frame
    }

    fn encode(payload: &[u8], fin: bool, opcode: OpCode, mask: Option<[u8; 4]>) -> Self {
        let mut head = [0; MAX_HEAD_SIZE];
        let size = fmt_head(&mut head, payload.len(), fin, opcode, mask);

        let mut buffer = BytesMut::with_capacity(size + payload.len());
        buffer.extend_from_slice(&head[..size]);
        let start = buffer.len();
        buffer.extend_from_slice(payload);
        if let Some(key) = mask {
            apply_mask(&mut buffer[start..], key);
        }

        Self { buffer }
    }

    /// Appends bytes received from the socket.
    pub fn add_buffer(&mut self, bytes: impl AsRef<[u8]>) {
        self.buffer.extend_from_slice(bytes.as_ref());
    }

    /// Parses the header from the buffered bytes.
    ///
    /// # Returns
    /// - `Ok(Some(header))` once the whole header, including extended length and masking key, is buffered.
    /// - `Ok(None)` while more bytes are needed.
    /// - `Err(WebSocketError::InvalidOpCode)` if the opcode is reserved.
    pub fn header(&self) -> Result<Option<FrameHeader>> {
        let buf = &self.buffer[..];
        if buf.len() < 2 {
            return Ok(None);
        }

        let fin = buf[0] & 0b1000_0000 != 0;
        let rsv = (buf[0] & 0b0111_0000) >> 4;
        let opcode = OpCode::try_from(buf[0] & 0b0000_1111)?;
        let masked = buf[1] & 0b1000_0000 != 0;
        let length_code = buf[1] & 0x7F;

        let extra = match length_code {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let header_len = 2 + extra + if masked { 4 } else { 0 };
        if buf.len() < header_len {
            return Ok(None);
        }

        let payload_len = match extra {
            0 => u64::from(length_code),
            2 => u64::from(u16::from_be_bytes([buf[2], buf[3]])),
            _ => {
                let mut length = [0; 8];
                length.copy_from_slice(&buf[2..10]);
                u64::from_be_bytes(length)
            }
        };

        let mask = masked.then(|| {
            let mut key = [0; 4];
            key.copy_from_slice(&buf[header_len - 4..header_len]);
            key
        });

        Ok(Some(FrameHeader {
            fin,
            rsv,
            opcode,
            mask,
            payload_len,
            header_len,
        }))
    }

    fn require_header(&self) -> Result<FrameHeader> {
        self.header()?.ok_or(WebSocketError::NotCoalesced)
    }

    /// Returns `true` once every byte the header declares has been buffered.
    ///
    /// The length prefix may itself arrive split across reads, so this re-parses the
    /// header on each call.
    pub fn is_coalesced(&self) -> bool {
        match self.header() {
            Ok(Some(header)) => header
                .frame_len()
                .is_some_and(|len| self.buffer.len() >= len),
            _ => false,
        }
    }

    pub fn is_final(&self) -> Result<bool> {
        Ok(self.require_header()?.fin)
    }

    pub fn opcode(&self) -> Result<OpCode> {
        Ok(self.require_header()?.opcode)
    }

    pub fn is_masked(&self) -> Result<bool> {
        Ok(self.require_header()?.mask.is_some())
    }

    pub fn masking_key(&self) -> Result<Option<[u8; 4]>> {
        Ok(self.require_header()?.mask)
    }

    /// Declared payload length.
    pub fn payload_len(&self) -> Result<u64> {
        Ok(self.require_header()?.payload_len)
    }

    /// The payload bytes as they were received, still masked unless [`Frame::unmask`] ran.
    pub fn payload(&self) -> Result<&[u8]> {
        let header = self.require_header()?;
        let end = header.frame_len().ok_or(WebSocketError::FrameTooLarge)?;
        if self.buffer.len() < end {
            return Err(WebSocketError::NotCoalesced);
        }
        Ok(&self.buffer[header.header_len..end])
    }

    /// A copy of the payload with the masking key removed.
    pub fn unmasked_payload(&self) -> Result<Bytes> {
        let mut payload = BytesMut::from(self.payload()?);
        if let Some(key) = self.masking_key()? {
            apply_mask(&mut payload, key);
        }
        Ok(payload.freeze())
    }

    /// Removes the mask from a coalesced frame in place.
    ///
    /// The payload is XORed with the masking key, the key is dropped from the header and the
    /// MASK bit is cleared, leaving a valid unmasked frame. Calling it on an unmasked frame
    /// does nothing.
    pub fn unmask(&mut self) -> Result<()> {
        let header = self.require_header()?;
        let end = header.frame_len().ok_or(WebSocketError::FrameTooLarge)?;
        if self.buffer.len() < end {
            return Err(WebSocketError::NotCoalesced);
        }

        let Some(key) = header.mask else {
            return Ok(());
        };

        let payload_len = end - header.header_len;
        let mut rest = self.buffer.split_off(header.header_len);
        apply_mask(&mut rest[..payload_len], key);

        self.buffer.truncate(header.header_len - 4);
        self.buffer[1] &= 0x7F;
        self.buffer.unsplit(rest);

        Ok(())
    }

    /// Splits off the bytes buffered past the end of this frame.
    ///
    /// When two frames arrive in one socket read, the second one's bytes end up here and must
    /// be fed into a fresh frame.
    pub fn extract_overflow(&mut self) -> Option<BytesMut> {
        let len = self.header().ok()??.frame_len()?;
        if self.buffer.len() > len {
            Some(self.buffer.split_off(len))
        } else {
            None
        }
    }

    /// Number of bytes buffered so far.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// The raw wire bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Bytes {
        self.buffer.freeze()
    }
}

impl From<BytesMut> for Frame {
    fn from(buffer: BytesMut) -> Self {
        Self { buffer }
    }
}

/// Formats a frame header into `head` and returns its size.
///
/// # Panics
/// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
fn fmt_head(head: &mut [u8], len: usize, fin: bool, opcode: OpCode, mask: Option<[u8; 4]>) -> usize {
    head[0] = (fin as u8) << 7 | u8::from(opcode);

    let size = if len < 126 {
        head[1] = len as u8;
        2
    } else if len < 65536 {
        head[1] = 126;
        head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        4
    } else {
        head[1] = 127;
        head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
        10
    };

    if let Some(mask) = mask {
        head[1] |= 0x80;
        head[size..size + 4].copy_from_slice(&mask);
        size + 4
    } else {
        size
    }
}
