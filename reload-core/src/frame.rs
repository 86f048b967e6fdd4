//! Link framing: `Data` and `Ack` frames.
//!
//! ```text
//! Data: type u8 (128) | sequence u32 | payload<u24>
//! Ack:  type u8 (129) | sequence u32
//! ```
//!
//! One frame carries one complete message payload; there is no fragmentation.

use bytes::Bytes;

use crate::codec::{CodecError, LengthWidth, WireReader, WireWriter};

pub const DATA_TAG: u8 = 128;
pub const ACK_TAG: u8 = 129;

/// Largest payload a Data frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = LengthWidth::U24.max();

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data { sequence: u32, payload: Bytes },
    Ack { sequence: u32 },
}

impl Frame {
    pub fn sequence(&self) -> u32 {
        match self {
            Frame::Data { sequence, .. } | Frame::Ack { sequence } => *sequence,
        }
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut w = WireWriter::new();
        match self {
            Frame::Data { sequence, payload } => {
                w.put_u8(DATA_TAG);
                w.put_u32(*sequence);
                w.put_opaque(LengthWidth::U24, payload)?;
            }
            Frame::Ack { sequence } => {
                w.put_u8(ACK_TAG);
                w.put_u32(*sequence);
            }
        }
        Ok(w.finish())
    }

    fn decode_from(r: &mut WireReader<'_>, max_payload: usize) -> Result<Self, FrameError> {
        match r.get_u8()? {
            DATA_TAG => {
                let sequence = r.get_u32()?;
                let len = r.read_length(LengthWidth::U24)?;
                if len > max_payload {
                    return Err(FrameError::Oversized {
                        len,
                        max: max_payload,
                    });
                }
                let payload = Bytes::copy_from_slice(r.get_bytes(len)?);
                Ok(Frame::Data { sequence, payload })
            }
            ACK_TAG => Ok(Frame::Ack {
                sequence: r.get_u32()?,
            }),
            other => Err(FrameError::UnknownType(other)),
        }
    }

    /// Decode a buffer holding exactly one frame (one datagram).
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        Self::decode_bounded(bytes, MAX_FRAME_PAYLOAD)
    }

    /// Like [`decode`](Self::decode), refusing Data payloads longer than `max_payload`.
    pub fn decode_bounded(bytes: &[u8], max_payload: usize) -> Result<Self, FrameError> {
        let mut r = WireReader::new(bytes);
        let frame = Self::decode_from(&mut r, max_payload)?;
        r.finish()?;
        Ok(frame)
    }

    /// Decode one frame from the front of a stream buffer. Returns the frame and the number
    /// of bytes consumed, or `None` when more bytes are needed.
    pub fn decode_prefix(bytes: &[u8]) -> Result<Option<(Self, usize)>, FrameError> {
        Self::decode_prefix_bounded(bytes, MAX_FRAME_PAYLOAD)
    }

    /// Like [`decode_prefix`](Self::decode_prefix). An oversized Data frame fails as soon as
    /// its length prefix is readable, before the payload has arrived.
    pub fn decode_prefix_bounded(
        bytes: &[u8],
        max_payload: usize,
    ) -> Result<Option<(Self, usize)>, FrameError> {
        let mut r = WireReader::new(bytes);
        match Self::decode_from(&mut r, max_payload) {
            Ok(frame) => Ok(Some((frame, bytes.len() - r.remaining()))),
            Err(FrameError::Codec(CodecError::Truncated { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unknown frame type {0}")]
    UnknownType(u8),
    #[error("data payload of {len} bytes exceeds limit {max}")]
    Oversized { len: usize, max: usize },
    #[error(transparent)]
    Codec(#[from] CodecError),
}
