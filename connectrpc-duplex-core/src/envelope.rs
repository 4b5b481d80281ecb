//! Length-prefixed envelope framing.
//!
//! Every streaming protocol frames messages the same way:
//!
//! ```text
//! [flags:1][length:4, big endian][payload:length]
//! ```
//!
//! The meaning of the flag bits differs per protocol, so decoders take an
//! `allowed_flags` mask and reject any frame carrying other bits.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::EnvelopeError;

/// Envelope flag bits.
pub mod flags {
    /// Payload is compressed with the negotiated encoding.
    pub const COMPRESSED: u8 = 0x01;
    /// Connect end-of-stream frame carrying the JSON trailer document.
    pub const CONNECT_END_STREAM: u8 = 0x02;
    /// gRPC-Web trailer frame carrying an HTTP/1-style header block.
    pub const GRPC_WEB_TRAILER: u8 = 0x80;
}

/// Envelope header size (flags + length).
pub const HEADER_SIZE: usize = 5;

/// A single decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub flags: u8,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(flags: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            flags,
            payload: payload.into(),
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & flags::COMPRESSED != 0
    }

    /// Size of this frame on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

fn check_flags(value: u8, allowed_flags: u8) -> Result<(), EnvelopeError> {
    if value & !allowed_flags != 0 {
        return Err(EnvelopeError::MalformedFrame(value));
    }
    Ok(())
}

fn payload_len(len: usize) -> Result<u32, EnvelopeError> {
    u32::try_from(len).map_err(|_| EnvelopeError::FrameTooLarge {
        size: len,
        limit: u32::MAX as usize,
    })
}

/// Encode a payload into a single frame.
pub fn encode_frame(payload: &[u8], flags: u8) -> Result<Bytes, EnvelopeError> {
    let len = payload_len(payload.len())?;
    let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    frame.put_u8(flags);
    frame.put_u32(len);
    frame.extend_from_slice(payload);
    Ok(frame.freeze())
}

/// Read one frame from `reader`.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary. A stream
/// that ends inside a header or payload yields
/// [`EnvelopeError::UnexpectedEof`].
pub async fn decode_frame<R>(
    reader: &mut R,
    allowed_flags: u8,
) -> Result<Option<Envelope>, EnvelopeError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(EnvelopeError::UnexpectedEof {
                expected: HEADER_SIZE,
                actual: filled,
            });
        }
        filled += n;
    }

    let frame_flags = header[0];
    check_flags(frame_flags, allowed_flags)?;
    let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;

    // Grow with the data actually read so a lying length cannot force a huge allocation.
    let mut payload = Vec::with_capacity(length.min(64 * 1024));
    let read = (&mut *reader)
        .take(length as u64)
        .read_to_end(&mut payload)
        .await?;
    if read < length {
        return Err(EnvelopeError::UnexpectedEof {
            expected: length,
            actual: read,
        });
    }

    Ok(Some(Envelope::new(frame_flags, payload)))
}

/// Incremental frame codec for byte streams delivered in arbitrary chunks.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    allowed_flags: u8,
    max_message_size: Option<usize>,
}

impl EnvelopeCodec {
    pub fn new(allowed_flags: u8) -> Self {
        Self {
            allowed_flags,
            max_message_size: None,
        }
    }

    /// Reject frames whose declared payload exceeds `limit` bytes.
    pub fn with_max_message_size(mut self, limit: Option<usize>) -> Self {
        self.max_message_size = limit;
        self
    }

    pub fn allowed_flags(&self) -> u8 {
        self.allowed_flags
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = EnvelopeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, EnvelopeError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let frame_flags = src[0];
        check_flags(frame_flags, self.allowed_flags)?;
        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        match self.max_message_size {
            Some(limit) if length > limit => {
                return Err(EnvelopeError::FrameTooLarge {
                    size: length,
                    limit,
                });
            }
            _ => {}
        }

        if src.len() < HEADER_SIZE + length {
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).freeze();
        Ok(Some(Envelope {
            flags: frame_flags,
            payload,
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>, EnvelopeError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None if buf.len() < HEADER_SIZE => Err(EnvelopeError::UnexpectedEof {
                expected: HEADER_SIZE,
                actual: buf.len(),
            }),
            None => {
                let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
                Err(EnvelopeError::UnexpectedEof {
                    expected: length,
                    actual: buf.len() - HEADER_SIZE,
                })
            }
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = EnvelopeError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), EnvelopeError> {
        let len = payload_len(item.payload.len())?;
        dst.reserve(HEADER_SIZE + item.payload.len());
        dst.put_u8(item.flags);
        dst.put_u32(len);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}
