//! `tokio_util` codecs for the bytes that cross a connection.
//!
//! The server side of a connection only ever *writes* through a codec: everything it sends
//! (the handshake answer, then frames) is an [`Outbound`] item handed to [`Encoder`].
//! Inbound bytes go through the incremental [`Frame`] pipeline of the connection instead.
//!
//! [`Decoder`] reads whole frames off a stream and is meant for the peer's side, for
//! example a test client talking to the server.
use bytes::BytesMut;
use tokio_util::codec;

use crate::{
    frame::{Frame, MAX_HEAD_SIZE},
    http::Response,
    WebSocketError,
};

/// Something written to a client socket.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// An HTTP response; the first thing written on every connection.
    Response(Response),
    /// A frame, only after a `101` answer.
    Frame(Frame),
}

impl From<Response> for Outbound {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl From<Frame> for Outbound {
    fn from(frame: Frame) -> Self {
        Self::Frame(frame)
    }
}

/// Serializes [`Outbound`] items.
///
/// Frames are already stored in wire format, so encoding them is a copy.
#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder;

impl codec::Encoder<Outbound> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Outbound::Response(response) => {
                response.encode(dst);
                Ok(())
            }
            Outbound::Frame(frame) => {
                dst.extend_from_slice(frame.as_bytes());
                Ok(())
            }
        }
    }
}

/// Splits a byte stream into coalesced, unmasked frames.
///
/// Frame headers are not validated beyond their opcode: masking rules differ per direction
/// and are left to the caller.
#[derive(Debug, Clone)]
pub struct Decoder {
    max_payload_size: usize,
}

impl Decoder {
    /// Creates a new `Decoder` rejecting payloads over `max_payload_size` bytes.
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// # Returns
    /// - `Ok(Some(frame))` once a whole frame is buffered; its bytes are removed from `src`.
    /// - `Ok(None)` while more data is needed.
    /// - `Err(WebSocketError)` for a reserved opcode or an oversized payload.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let head = Frame::from_bytes(&src[..src.len().min(MAX_HEAD_SIZE)]);
        let Some(header) = head.header()? else {
            return Ok(None);
        };

        if header.payload_len > self.max_payload_size as u64 {
            return Err(WebSocketError::FrameTooLarge);
        }
        let len = header.frame_len().ok_or(WebSocketError::FrameTooLarge)?;

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let mut frame = Frame::from(src.split_to(len));
        frame.unmask()?;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{close::CloseCode, OpCode};
    use ::http::StatusCode;
    use tokio_util::codec::{Decoder as _, Encoder as _};

    #[test]
    fn test_encode_response_then_frames() {
        let mut dst = BytesMut::new();
        let mut encoder = Encoder;

        encoder
            .encode(Outbound::from(Response::new(StatusCode::SWITCHING_PROTOCOLS)), &mut dst)
            .unwrap();
        encoder.encode(Outbound::from(Frame::text("hi")), &mut dst).unwrap();
        encoder
            .encode(Outbound::from(Frame::close(CloseCode::Normal, "")), &mut dst)
            .unwrap();

        assert_eq!(
            &dst[..],
            b"HTTP/1.1 101 Switching Protocols\r\n\r\n\x81\x02hi\x88\x02\x03\xE8"
        );
    }

    #[test]
    fn test_decode_split_stream() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(Frame::text("first").as_bytes());
        wire.extend_from_slice(Frame::masked("second", true, OpCode::Binary, [1, 2, 3, 4]).as_bytes());

        let mut decoder = Decoder::new(1024);
        let mut src = BytesMut::new();
        let mut frames = Vec::new();
        for byte in wire {
            src.extend_from_slice(&[byte]);
            while let Some(frame) = decoder.decode(&mut src).unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].opcode().unwrap(), OpCode::Text);
        assert_eq!(frames[0].payload().unwrap(), b"first");
        assert_eq!(frames[1].opcode().unwrap(), OpCode::Binary);
        assert!(!frames[1].is_masked().unwrap());
        assert_eq!(frames[1].payload().unwrap(), b"second");
        assert!(src.is_empty());
    }

    #[test]
    fn test_decode_rejects_large_payload() {
        let mut src = BytesMut::from(Frame::binary(vec![0; 100]).as_bytes());
        assert!(matches!(
            Decoder::new(99).decode(&mut src),
            Err(WebSocketError::FrameTooLarge)
        ));
    }
}
