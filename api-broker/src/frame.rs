//! Multipart wire framing.
//!
//! Each frame on the wire is `flags: u8 | len: u32 (big-endian) | body`. Bit 0
//! of `flags` means more frames follow; a message ends at the first frame with
//! that bit clear. Addressed messages are two-frame units: the client
//! identifier (always flagged as more) followed by the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::identity::{ClientId, InvalidClientId};

/// Frames of a single message, in wire order.
pub type Multipart = Vec<Bytes>;

const FLAG_MORE: u8 = 0x01;
const FRAME_HEADER_LEN: usize = 5;

pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Frames a single message may span.
pub const MAX_MESSAGE_FRAMES: usize = 16;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("message spans more than {max} frames")]
    TooManyFrames { max: usize },
    #[error("unknown frame flags {0:#04x}")]
    UnknownFlags(u8),
    #[error("cannot encode a message without frames")]
    EmptyMessage,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Codec that turns a byte stream into [`Multipart`] messages and back.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_len: usize,
    partial: Multipart,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            partial: Vec::new(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Multipart;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Multipart>, FrameError> {
        loop {
            if src.len() < FRAME_HEADER_LEN {
                src.reserve(FRAME_HEADER_LEN - src.len());
                return Ok(None);
            }

            let flags = src[0];
            if flags & !FLAG_MORE != 0 {
                return Err(FrameError::UnknownFlags(flags));
            }
            let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
            if len > self.max_frame_len {
                return Err(FrameError::TooLarge {
                    len,
                    max: self.max_frame_len,
                });
            }
            if self.partial.len() >= MAX_MESSAGE_FRAMES {
                return Err(FrameError::TooManyFrames {
                    max: MAX_MESSAGE_FRAMES,
                });
            }

            let total = FRAME_HEADER_LEN + len;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            src.advance(FRAME_HEADER_LEN);
            self.partial.push(src.split_to(len).freeze());

            if flags & FLAG_MORE == 0 {
                return Ok(Some(std::mem::take(&mut self.partial)));
            }
        }
    }
}

impl Encoder<Multipart> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, message: Multipart, dst: &mut BytesMut) -> Result<(), FrameError> {
        if message.is_empty() {
            return Err(FrameError::EmptyMessage);
        }

        let last = message.len() - 1;
        for (index, part) in message.iter().enumerate() {
            if part.len() > self.max_frame_len {
                return Err(FrameError::TooLarge {
                    len: part.len(),
                    max: self.max_frame_len,
                });
            }
            let len = u32::try_from(part.len()).map_err(|_| FrameError::TooLarge {
                len: part.len(),
                max: u32::MAX as usize,
            })?;

            dst.reserve(FRAME_HEADER_LEN + part.len());
            dst.put_u8(if index < last { FLAG_MORE } else { 0 });
            dst.put_u32(len);
            dst.extend_from_slice(part);
        }
        Ok(())
    }
}

/// Why an addressed message could not be split into identifier and payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedEnvelope {
    #[error("message carries no frames")]
    Empty,
    #[error(transparent)]
    Identity(#[from] InvalidClientId),
    #[error("identifier {0} is not followed by a payload frame")]
    MissingPayload(ClientId),
}

/// Splits `[identifier, payload, ..]` into its parts.
///
/// Frames after the payload are ignored.
pub fn split_addressed(message: Multipart) -> Result<(ClientId, Bytes), MalformedEnvelope> {
    let mut frames = message.into_iter();
    let identity = frames.next().ok_or(MalformedEnvelope::Empty)?;
    let client = ClientId::try_from(identity.as_ref())?;
    let payload = frames
        .next()
        .ok_or(MalformedEnvelope::MissingPayload(client))?;
    Ok((client, payload))
}

pub fn addressed(client: ClientId, payload: Bytes) -> Multipart {
    vec![client.to_bytes(), payload]
}
