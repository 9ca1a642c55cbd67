//! [`tokio_util::codec`] adapter for WebSocket frames.
//!
//! [`FrameCodec`] decodes with [`parse_frame`] and encodes with the masking rule of its
//! [`Role`]: clients mask every frame with a fresh key, servers never mask.

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{parse_frame, Frame, MAX_HEAD_SIZE},
    protocol::Role,
    WebSocketError,
};

/// A combined encoder and decoder for WebSocket frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    role: Role,
    max_payload_size: Option<usize>,
}

impl FrameCodec {
    /// Creates a codec for `role`, rejecting incoming frames larger than `max_payload_size`.
    pub fn new(role: Role, max_payload_size: Option<usize>) -> Self {
        Self {
            role,
            max_payload_size,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn max_payload_size(&self) -> Option<usize> {
        self.max_payload_size
    }
}

impl codec::Decoder for FrameCodec {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched until a whole frame is buffered.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match parse_frame(src, self.max_payload_size)? {
            Some((frame, consumed)) => {
                src.advance(consumed);
                Ok(Some(frame))
            }
            None => {
                // at least the largest header is needed before anything can be decided
                src.reserve(MAX_HEAD_SIZE.saturating_sub(src.len()));
                Ok(None)
            }
        }
    }
}

impl codec::Encoder<Frame> for FrameCodec {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mask = match self.role {
            Role::Client => Some(rand::random()),
            Role::Server => None,
        };
        frame.encode_into(dst, mask);
        Ok(())
    }
}
