//! Message reassembly ([RFC 6455 Section 5.4](https://datatracker.ietf.org/doc/html/rfc6455#section-5.4)).
//!
//! A message is one text or binary frame, optionally followed by continuation frames, the
//! last of which carries the FIN bit.
use bytes::{Bytes, BytesMut};

use crate::{
    frame::{Frame, OpCode},
    utf8, Result, WebSocketError,
};

/// An ordered sequence of coalesced frames forming one logical payload.
#[derive(Debug, Clone, Default)]
pub struct Message {
    frames: Vec<Frame>,
    len: usize,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a coalesced data frame.
    ///
    /// The first frame must be `Text` or `Binary`; every later one must be `Continuation`.
    ///
    /// # Errors
    /// - `NotCoalesced` if the frame is still missing bytes.
    /// - `InvalidContinuationFrame` if the frame breaks the ordering above, or the message
    ///   already received its final frame.
    pub fn add_frame(&mut self, frame: Frame) -> Result<()> {
        if !frame.is_coalesced() {
            return Err(WebSocketError::NotCoalesced);
        }

        let opcode = frame.opcode()?;
        let valid = if self.frames.is_empty() {
            matches!(opcode, OpCode::Text | OpCode::Binary)
        } else {
            opcode == OpCode::Continuation && !self.is_coalesced()
        };
        if !valid {
            return Err(WebSocketError::InvalidContinuationFrame);
        }

        self.len += frame.payload()?.len();
        self.frames.push(frame);
        Ok(())
    }

    /// `true` once the last appended frame is final.
    pub fn is_coalesced(&self) -> bool {
        self.frames
            .last()
            .is_some_and(|frame| frame.is_coalesced() && frame.is_final().unwrap_or(false))
    }

    /// The opcode of the first frame, `None` for an empty message.
    pub fn opcode(&self) -> Option<OpCode> {
        self.frames.first().and_then(|frame| frame.opcode().ok())
    }

    /// Number of frames received so far.
    pub fn count(&self) -> usize {
        self.frames.len()
    }

    /// Payload bytes received so far, across all frames.
    pub fn payload_len(&self) -> usize {
        self.len
    }

    /// Concatenates the unmasked payload of every frame.
    ///
    /// # Errors
    /// `NotCoalesced` until the final frame arrived.
    pub fn payload(&self) -> Result<Bytes> {
        if !self.is_coalesced() {
            return Err(WebSocketError::NotCoalesced);
        }

        let mut payload = BytesMut::with_capacity(self.len);
        for frame in &self.frames {
            payload.extend_from_slice(&frame.unmasked_payload()?);
        }
        Ok(payload.freeze())
    }

    /// Turns the message into a typed payload, validating text as UTF-8.
    ///
    /// # Errors
    /// - `NotCoalesced` until the final frame arrived.
    /// - `InvalidPayload` for a text message that is not valid UTF-8.
    pub fn into_payload(self) -> Result<Payload> {
        let payload = self.payload()?;
        match self.opcode() {
            Some(OpCode::Text) => {
                if !utf8::is_valid(&payload) {
                    return Err(WebSocketError::InvalidPayload);
                }
                // SAFETY: the validator accepted the whole payload as UTF-8.
                let text = unsafe { String::from_utf8_unchecked(payload.to_vec()) };
                Ok(Payload::Text(text))
            }
            _ => Ok(Payload::Binary(payload)),
        }
    }
}

/// A complete message payload exchanged with the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub fn opcode(&self) -> OpCode {
        match self {
            Self::Text(_) => OpCode::Text,
            Self::Binary(_) => OpCode::Binary,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    /// The text, if this is a text payload.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Self::Binary(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value.into())
    }
}

impl From<Payload> for Frame {
    fn from(value: Payload) -> Self {
        Frame::new(value.as_bytes(), true, value.opcode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_frame(payload: &str, fin: bool, opcode: OpCode) -> Frame {
        Frame::from_bytes(Frame::with_random_mask(payload, fin, opcode).as_bytes())
    }

    #[test]
    fn test_empty_message_is_not_coalesced() {
        let message = Message::new();
        assert!(!message.is_coalesced());
        assert_eq!(message.opcode(), None);
        assert!(matches!(message.payload(), Err(WebSocketError::NotCoalesced)));
    }

    #[test]
    fn test_single_frame() {
        let mut message = Message::new();
        message.add_frame(client_frame("hello", true, OpCode::Text)).unwrap();

        assert!(message.is_coalesced());
        assert_eq!(message.opcode(), Some(OpCode::Text));
        assert_eq!(message.into_payload().unwrap(), Payload::Text("hello".into()));
    }

    #[test]
    fn test_fragmented_message() {
        let mut message = Message::new();
        message.add_frame(client_frame("Hel", false, OpCode::Binary)).unwrap();
        assert!(!message.is_coalesced());
        message.add_frame(client_frame("lo, ", false, OpCode::Continuation)).unwrap();
        assert!(!message.is_coalesced());
        message.add_frame(client_frame("world", true, OpCode::Continuation)).unwrap();

        assert!(message.is_coalesced());
        assert_eq!(message.count(), 3);
        assert_eq!(message.payload_len(), 12);
        assert_eq!(message.opcode(), Some(OpCode::Binary));
        assert_eq!(&message.payload().unwrap()[..], b"Hello, world");
    }

    #[test]
    fn test_rejects_leading_continuation() {
        let mut message = Message::new();
        let err = message
            .add_frame(client_frame("x", true, OpCode::Continuation))
            .unwrap_err();
        assert!(matches!(err, WebSocketError::InvalidContinuationFrame));
    }

    #[test]
    fn test_rejects_second_data_frame() {
        let mut message = Message::new();
        message.add_frame(client_frame("a", false, OpCode::Text)).unwrap();
        let err = message.add_frame(client_frame("b", true, OpCode::Text)).unwrap_err();
        assert!(matches!(err, WebSocketError::InvalidContinuationFrame));
    }

    #[test]
    fn test_rejects_frames_after_final() {
        let mut message = Message::new();
        message.add_frame(client_frame("a", true, OpCode::Text)).unwrap();
        let err = message
            .add_frame(client_frame("b", true, OpCode::Continuation))
            .unwrap_err();
        assert!(matches!(err, WebSocketError::InvalidContinuationFrame));
    }

    #[test]
    fn test_rejects_partial_frame() {
        let wire = Frame::with_random_mask("partial", true, OpCode::Text);
        let frame = Frame::from_bytes(&wire.as_bytes()[..4]);
        assert!(matches!(
            Message::new().add_frame(frame),
            Err(WebSocketError::NotCoalesced)
        ));
    }

    #[test]
    fn test_invalid_utf8_text() {
        let wire = Frame::masked([0xC0u8, 0x80], true, OpCode::Text, [1, 2, 3, 4]);
        let mut message = Message::new();
        message.add_frame(Frame::from_bytes(wire.as_bytes())).unwrap();
        assert!(matches!(
            message.into_payload(),
            Err(WebSocketError::InvalidPayload)
        ));
    }

    #[test]
    fn test_text_payload_keeps_every_code_point() {
        let text = "a\u{7F}\u{80}\u{7FF}\u{800}\u{FFFF}\u{10000}\u{10FFFF}";
        let mut message = Message::new();
        message.add_frame(client_frame(text, true, OpCode::Text)).unwrap();
        assert_eq!(message.into_payload().unwrap(), Payload::Text(text.to_owned()));
    }

    #[test]
    fn test_utf8_split_across_frames() {
        let text = "€uro".as_bytes();
        let mut message = Message::new();
        message
            .add_frame(Frame::from_bytes(Frame::masked(&text[..1], false, OpCode::Text, [3; 4]).as_bytes()))
            .unwrap();
        message
            .add_frame(Frame::from_bytes(
                Frame::masked(&text[1..], true, OpCode::Continuation, [4; 4]).as_bytes(),
            ))
            .unwrap();
        assert_eq!(message.into_payload().unwrap(), Payload::Text("€uro".into()));
    }

    #[test]
    fn test_payload_into_frame() {
        let frame = Frame::from(Payload::from("hi"));
        assert_eq!(frame.as_bytes(), b"\x81\x02hi");

        let frame = Frame::from(Payload::from(vec![1u8, 2]));
        assert_eq!(frame.as_bytes(), b"\x82\x02\x01\x02");
    }
}
