// src/core/protocol/codec.rs

//! Implements the length-prefixed JSON framing and the corresponding
//! `Encoder` and `Decoder` for network communication.

use super::message::Message;
use crate::core::FlomError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the big-endian length prefix in front of every payload.
const LENGTH_PREFIX: usize = 4;

/// Protocol-level limit to keep a misbehaving peer from growing our buffers.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// A `tokio_util::codec` implementation for encoding and decoding `Message`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlomCodec;

impl Encoder<Message> for FlomCodec {
    type Error = FlomError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FlomError::FrameTooLarge(payload.len()));
        }
        dst.reserve(LENGTH_PREFIX + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for FlomCodec {
    type Item = Message;
    type Error = FlomError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(FlomError::FrameTooLarge(len));
        }

        if src.len() < LENGTH_PREFIX + len {
            // Not enough data yet; make room for the rest of the frame.
            src.reserve(LENGTH_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let payload = src.split_to(len);
        let message = serde_json::from_slice(&payload)?;
        Ok(Some(message))
    }
}

impl FlomCodec {
    /// Encodes a message into a standalone buffer, as sent in one datagram.
    pub fn encode_to_vec(message: &Message) -> Result<Vec<u8>, FlomError> {
        let mut buf = BytesMut::new();
        FlomCodec.encode(message.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }

    /// Decodes a datagram that must contain exactly one complete frame.
    pub fn decode_datagram(datagram: &[u8]) -> Result<Message, FlomError> {
        let mut buf = BytesMut::from(datagram);
        match FlomCodec.decode(&mut buf)? {
            Some(message) if buf.is_empty() => Ok(message),
            Some(_) => Err(FlomError::InvalidFrame(
                "trailing bytes after datagram frame".to_string(),
            )),
            None => Err(FlomError::InvalidFrame("truncated datagram".to_string())),
        }
    }
}
