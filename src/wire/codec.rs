//! Length-delimited CBOR framing over a TLS byte stream.
//!
//! One [`Message`] maps to exactly one frame. A frame whose length prefix
//! exceeds the configured maximum is rejected without being buffered; the
//! connection is closed rather than reading and discarding the oversized
//! frame, so a peer cannot use it to hold a socket open indefinitely.

use std::fmt;
use std::io;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::wire::message::Message;

/// The default maximum message size, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65535;

/// A framing or encoding failure on the message transport.
#[derive(Debug)]
pub enum CodecError {
    /// The peer's frame length prefix exceeded the configured maximum.
    MsgTooLarge { limit: usize },
    /// The frame's CBOR body did not decode into a well-formed message.
    Malformed(ciborium::de::Error<io::Error>),
    Io(io::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::MsgTooLarge { limit } => {
                write!(f, "message frame exceeds the {limit}-byte limit")
            }
            CodecError::Malformed(e) => write!(f, "malformed message: {e}"),
            CodecError::Io(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Malformed(e) => Some(e),
            CodecError::Io(e) => Some(e),
            CodecError::MsgTooLarge { .. } => None,
        }
    }
}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        CodecError::Io(e)
    }
}

/// A `tokio_util::codec::{Encoder,Decoder}` pair splitting a byte stream
/// into length-delimited CBOR message frames.
pub struct MessageCodec {
    frames: LengthDelimitedCodec,
    max_message_size: usize,
}

impl MessageCodec {
    pub fn new(max_message_size: usize) -> Self {
        MessageCodec {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(max_message_size)
                .length_field_length(4)
                .new_codec(),
            max_message_size,
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        MessageCodec::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let frame = match self.frames.decode(src) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) if is_frame_too_long(&e) => {
                return Err(CodecError::MsgTooLarge {
                    limit: self.max_message_size,
                })
            }
            Err(e) => return Err(CodecError::Io(e)),
        };
        let message: Message =
            ciborium::de::from_reader(frame.as_ref()).map_err(CodecError::Malformed)?;
        Ok(Some(message))
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, message: &Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = Vec::new();
        ciborium::ser::into_writer(message, &mut body)
            .map_err(|e| CodecError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        if body.len() > self.max_message_size {
            return Err(CodecError::MsgTooLarge {
                limit: self.max_message_size,
            });
        }
        self.frames
            .encode(Bytes::from(body), dst)
            .map_err(CodecError::Io)
    }
}

// `LengthDelimitedCodec` reports an oversized frame as an `InvalidData` io
// error whose message contains "frame"; there is no dedicated error variant
// to match on instead.
fn is_frame_too_long(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::InvalidData && e.to_string().contains("frame")
}
