//! Session wire format.
//!
//! Every message exchanged on an authenticated session is a mux frame:
//!
//! ```text
//! [u8: kind][u32 LE: channel id][u32 LE: payload length][payload bytes]
//! ```
//!
//! Handshake frames (`Hello`, `AuthRequest`, `AuthSuccess`, `AuthFailure`)
//! and global requests use channel id 0. Channel ids are allocated by the
//! side that opens the channel and are never reused within a session.

use std::fmt;
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum payload carried by a single frame (16 MiB).
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

/// Fixed header size: kind + channel id + length.
pub const FRAME_HEADER_LEN: usize = 1 + 4 + 4;

/// Message kinds on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Hello = 0x01,
    AuthRequest = 0x02,
    AuthSuccess = 0x03,
    AuthFailure = 0x04,
    GlobalRequest = 0x08,
    ChannelOpen = 0x10,
    ChannelOpenConfirm = 0x11,
    ChannelOpenFailure = 0x12,
    ChannelData = 0x13,
    ChannelClose = 0x14,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => Self::Hello,
            0x02 => Self::AuthRequest,
            0x03 => Self::AuthSuccess,
            0x04 => Self::AuthFailure,
            0x08 => Self::GlobalRequest,
            0x10 => Self::ChannelOpen,
            0x11 => Self::ChannelOpenConfirm,
            0x12 => Self::ChannelOpenFailure,
            0x13 => Self::ChannelData,
            0x14 => Self::ChannelClose,
            _ => return None,
        })
    }
}

/// One decoded mux frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub channel: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, channel: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            channel,
            payload: payload.into(),
        }
    }

    /// A frame with no channel and no payload.
    pub fn control(kind: FrameKind) -> Self {
        Self::new(kind, 0, Bytes::new())
    }
}

/// Why a channel offer was refused. Numbering follows SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Prohibited,
    ConnectionFailed,
    UnknownChannelType,
    ResourceShortage,
}

impl RejectReason {
    pub fn code(self) -> u32 {
        match self {
            Self::Prohibited => 1,
            Self::ConnectionFailed => 2,
            Self::UnknownChannelType => 3,
            Self::ResourceShortage => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Prohibited),
            2 => Some(Self::ConnectionFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Prohibited => "administratively prohibited",
            Self::ConnectionFailed => "connect failed",
            Self::UnknownChannelType => "unknown channel type",
            Self::ResourceShortage => "resource shortage",
        };
        f.write_str(s)
    }
}

/// Payload of a `ChannelOpenFailure` frame: `u32 LE reason` + UTF-8 message.
pub fn encode_rejection(reason: RejectReason, message: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + message.len());
    buf.put_u32_le(reason.code());
    buf.put_slice(message.as_bytes());
    buf.freeze()
}

/// Inverse of [`encode_rejection`]. Unknown reason codes map to
/// `ConnectionFailed`.
pub fn decode_rejection(mut payload: Bytes) -> io::Result<(RejectReason, String)> {
    if payload.len() < 4 {
        return Err(invalid("open failure payload too short"));
    }
    let code = payload.get_u32_le();
    let reason = RejectReason::from_code(code).unwrap_or(RejectReason::ConnectionFailed);
    let message = String::from_utf8_lossy(&payload).into_owned();
    Ok((reason, message))
}

/// Codec for mux frames over a byte stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let kind_byte = src[0];
        let len = u32::from_le_bytes([src[5], src[6], src[7], src[8]]) as usize;
        if len > MAX_FRAME_PAYLOAD {
            return Err(invalid(format!(
                "frame payload {len} exceeds maximum {MAX_FRAME_PAYLOAD}"
            )));
        }
        let kind = FrameKind::from_u8(kind_byte)
            .ok_or_else(|| invalid(format!("unknown frame kind 0x{kind_byte:02x}")))?;

        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(1);
        let channel = src.get_u32_le();
        src.advance(4);
        let payload = src.split_to(len).freeze();

        Ok(Some(Frame {
            kind,
            channel,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> io::Result<()> {
        if frame.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(invalid(format!(
                "frame payload {} exceeds maximum {MAX_FRAME_PAYLOAD}",
                frame.payload.len()
            )));
        }
        dst.reserve(FRAME_HEADER_LEN + frame.payload.len());
        dst.put_u8(frame.kind as u8);
        dst.put_u32_le(frame.channel);
        dst.put_u32_le(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}
