//! Codec framework: big-endian primitives and self-delimiting, length-prefixed fields.
//!
//! A field is written by reserving a fixed-width length placeholder, writing the payload and
//! back-patching the placeholder with the number of bytes actually written. Reading slices
//! exactly the declared length into a bounded sub-reader; a nested decode must consume its
//! sub-reader completely.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::CodecConfig;
use crate::message::ErrorCode;

/// Width of a length placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthWidth {
    U8,
    U16,
    U24,
    U32,
}

impl LengthWidth {
    /// Bytes the placeholder occupies on the wire.
    pub const fn bytes(self) -> usize {
        match self {
            LengthWidth::U8 => 1,
            LengthWidth::U16 => 2,
            LengthWidth::U24 => 3,
            LengthWidth::U32 => 4,
        }
    }

    /// Largest payload length the placeholder can express.
    pub const fn max(self) -> usize {
        match self {
            LengthWidth::U8 => 0xff,
            LengthWidth::U16 => 0xffff,
            LengthWidth::U24 => 0x00ff_ffff,
            LengthWidth::U32 => u32::MAX as usize,
        }
    }
}

/// Malformed-input and encoding failures. Always fatal to the single message being processed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("truncated input: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("{0} trailing bytes after field")]
    TrailingBytes(usize),
    #[error("unsupported type code {0}")]
    UnsupportedType(u16),
    #[error("unsupported {kind} algorithm {code}")]
    UnsupportedAlgorithm { kind: &'static str, code: u8 },
    #[error("field of {len} bytes exceeds length prefix limit {max}")]
    LengthOverflow { len: usize, max: usize },
    #[error("message of {size} bytes exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },
    #[error("malformed input: {0}")]
    Malformed(String),
}

impl CodecError {
    /// Error code reported to the originator of a message that failed to decode.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            CodecError::MessageTooLarge { .. } => ErrorCode::MESSAGE_TOO_LARGE,
            _ => ErrorCode::INVALID_MESSAGE,
        }
    }
}

/// Growable output buffer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn put_slice(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Write a length-prefixed field whose payload is produced by `body`.
    pub fn put_field<F>(&mut self, width: LengthWidth, body: F) -> Result<(), CodecError>
    where
        F: FnOnce(&mut Self) -> Result<(), CodecError>,
    {
        let placeholder = self.buf.len();
        self.buf.put_bytes(0, width.bytes());
        let start = self.buf.len();
        body(self)?;
        let len = self.buf.len() - start;
        if len > width.max() {
            return Err(CodecError::LengthOverflow {
                len,
                max: width.max(),
            });
        }
        let be = (len as u32).to_be_bytes();
        self.buf[placeholder..start].copy_from_slice(&be[4 - width.bytes()..]);
        Ok(())
    }

    /// Write `data` as an opaque length-prefixed field.
    pub fn put_opaque(&mut self, width: LengthWidth, data: &[u8]) -> Result<(), CodecError> {
        self.put_field(width, |w| {
            w.put_slice(data);
            Ok(())
        })
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Bounded cursor over an input buffer. Never reads past its slice.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::Truncated {
                needed: n,
                available: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn peek_u8(&self) -> Result<u8, CodecError> {
        self.buf.first().copied().ok_or(CodecError::Truncated {
            needed: 1,
            available: 0,
        })
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?.get_u8())
    }

    pub fn get_u16(&mut self) -> Result<u16, CodecError> {
        Ok(self.take(2)?.get_u16())
    }

    pub fn get_u24(&mut self) -> Result<u32, CodecError> {
        Ok(self.take(3)?.get_uint(3) as u32)
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        Ok(self.take(4)?.get_u32())
    }

    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        Ok(self.take(8)?.get_u64())
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.take(n)
    }

    /// Consume everything left in this reader.
    pub fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    pub fn read_length(&mut self, width: LengthWidth) -> Result<usize, CodecError> {
        let len = match width {
            LengthWidth::U8 => self.get_u8()? as usize,
            LengthWidth::U16 => self.get_u16()? as usize,
            LengthWidth::U24 => self.get_u24()? as usize,
            LengthWidth::U32 => self.get_u32()? as usize,
        };
        Ok(len)
    }

    /// Slice out the next length-prefixed field as its own reader.
    pub fn field(&mut self, width: LengthWidth) -> Result<WireReader<'a>, CodecError> {
        let len = self.read_length(width)?;
        Ok(WireReader::new(self.take(len)?))
    }

    /// Bytes of the next length-prefixed field.
    pub fn opaque(&mut self, width: LengthWidth) -> Result<&'a [u8], CodecError> {
        let len = self.read_length(width)?;
        self.take(len)
    }

    /// Decode the next field with `f`, which must consume all of it.
    pub fn decode_field<T, F>(&mut self, width: LengthWidth, f: F) -> Result<T, CodecError>
    where
        F: FnOnce(&mut WireReader<'a>) -> Result<T, CodecError>,
    {
        let mut sub = self.field(width)?;
        let value = f(&mut sub)?;
        sub.finish()?;
        Ok(value)
    }

    /// Fails if unread bytes remain.
    pub fn finish(self) -> Result<(), CodecError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(CodecError::TrailingBytes(self.buf.len()))
        }
    }
}

/// A protocol entity with a self-delimiting binary form.
pub trait WireObject: Sized {
    fn encode(&self, w: &mut WireWriter, cfg: &CodecConfig) -> Result<(), CodecError>;

    fn decode(r: &mut WireReader<'_>, cfg: &CodecConfig) -> Result<Self, CodecError>;

    fn to_bytes(&self, cfg: &CodecConfig) -> Result<Bytes, CodecError> {
        let mut w = WireWriter::new();
        self.encode(&mut w, cfg)?;
        Ok(w.finish())
    }

    /// Decode from a buffer that holds exactly one object.
    fn from_bytes(bytes: &[u8], cfg: &CodecConfig) -> Result<Self, CodecError> {
        let mut r = WireReader::new(bytes);
        let value = Self::decode(&mut r, cfg)?;
        r.finish()?;
        Ok(value)
    }
}

/// Decode a field holding a sequence of `T` back to back.
pub fn decode_list<T: WireObject>(
    r: &mut WireReader<'_>,
    width: LengthWidth,
    cfg: &CodecConfig,
) -> Result<Vec<T>, CodecError> {
    r.decode_field(width, |list| {
        let mut out = Vec::new();
        while !list.is_empty() {
            out.push(T::decode(list, cfg)?);
        }
        Ok(out)
    })
}

/// Encode `items` back to back inside one length-prefixed field.
pub fn encode_list<T: WireObject>(
    w: &mut WireWriter,
    width: LengthWidth,
    items: &[T],
    cfg: &CodecConfig,
) -> Result<(), CodecError> {
    w.put_field(width, |w| {
        for item in items {
            item.encode(w, cfg)?;
        }
        Ok(())
    })
}
