//! Application framing on top of a channel.
//!
//! A frame is a 4-byte little-endian length followed by exactly that many
//! bytes. A zero-length frame is legal and carries no payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{TransportError, TransportResult};

/// Size of the length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Largest application frame accepted by [`decode_frame`].
pub const MAX_APP_FRAME: usize = 16 * 1024 * 1024;

/// Prefix `payload` with its little-endian length.
pub fn encode_frame(payload: &[u8]) -> TransportResult<Bytes> {
    if payload.len() > MAX_APP_FRAME {
        return Err(TransportError::Framing(format!(
            "frame of {} bytes exceeds maximum {MAX_APP_FRAME}",
            payload.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Pull one complete frame out of `buf`, leaving any trailing bytes.
///
/// Returns `Ok(None)` when more input is needed.
pub fn decode_frame(buf: &mut BytesMut) -> TransportResult<Option<Bytes>> {
    if buf.len() < LENGTH_PREFIX {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_APP_FRAME {
        return Err(TransportError::Framing(format!(
            "declared frame length {len} exceeds maximum {MAX_APP_FRAME}"
        )));
    }
    if buf.len() < LENGTH_PREFIX + len {
        return Ok(None);
    }
    buf.advance(LENGTH_PREFIX);
    Ok(Some(buf.split_to(len).freeze()))
}
