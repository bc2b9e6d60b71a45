//! Channels: independent bidirectional byte streams within a session.

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{TransportError, TransportResult};
use crate::framing;
use crate::session::SessionShared;
use crate::wire::{self, Frame, FrameKind, RejectReason};

/// Largest payload placed in a single data frame.
const MAX_CHUNK: usize = 32 * 1024;

/// An open channel.
///
/// Dropping a channel closes it. Reads return end-of-stream once the peer
/// closes the channel or the session ends.
pub struct Channel {
    id: u32,
    channel_type: String,
    shared: Arc<SessionShared>,
    inbound: mpsc::Receiver<Bytes>,
    buffer: BytesMut,
    closed: bool,
}

impl Channel {
    pub(crate) fn new(
        id: u32,
        channel_type: String,
        shared: Arc<SessionShared>,
        inbound: mpsc::Receiver<Bytes>,
    ) -> Self {
        Self {
            id,
            channel_type,
            shared,
            inbound,
            buffer: BytesMut::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Read raw bytes. Returns 0 at end-of-stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        if self.buffer.is_empty() && !self.fill().await {
            return Ok(0);
        }
        let n = buf.len().min(self.buffer.len());
        buf[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer.advance(n);
        Ok(n)
    }

    /// Write raw bytes.
    pub async fn write(&mut self, data: &[u8]) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        for chunk in data.chunks(MAX_CHUNK) {
            self.shared
                .send(Frame::new(
                    FrameKind::ChannelData,
                    self.id,
                    Bytes::copy_from_slice(chunk),
                ))
                .await?;
        }
        Ok(())
    }

    /// Read one length-prefixed application frame.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly between frames; an
    /// end-of-stream in the middle of a frame is an error.
    pub async fn read_frame(&mut self) -> TransportResult<Option<Bytes>> {
        loop {
            if let Some(frame) = framing::decode_frame(&mut self.buffer)? {
                return Ok(Some(frame));
            }
            if !self.fill().await {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::Framing(format!(
                    "channel ended with {} bytes of a partial frame",
                    self.buffer.len()
                )));
            }
        }
    }

    /// Write one length-prefixed application frame.
    pub async fn write_frame(&mut self, payload: &[u8]) -> TransportResult<()> {
        let frame = framing::encode_frame(payload)?;
        self.write(&frame).await
    }

    /// Close the channel, waiting for the close to be queued.
    pub async fn close(mut self) -> TransportResult<()> {
        self.closed = true;
        self.shared.remove_route(self.id);
        self.shared
            .send(Frame::new(FrameKind::ChannelClose, self.id, Bytes::new()))
            .await
    }

    async fn fill(&mut self) -> bool {
        match self.inbound.recv().await {
            Some(chunk) => {
                self.buffer.extend_from_slice(&chunk);
                true
            }
            None => false,
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.shared.remove_route(self.id);
        self.shared.close_nowait(self.id);
        debug!(channel = self.id, channel_type = %self.channel_type, "channel closed");
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("channel_type", &self.channel_type)
            .finish()
    }
}

/// A channel the peer wants to open. Must be accepted or rejected.
pub struct ChannelOffer {
    id: u32,
    channel_type: String,
    shared: Arc<SessionShared>,
}

impl ChannelOffer {
    pub(crate) fn new(id: u32, channel_type: String, shared: Arc<SessionShared>) -> Self {
        Self {
            id,
            channel_type,
            shared,
        }
    }

    /// The channel type name the peer asked for.
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    pub async fn accept(self) -> TransportResult<Channel> {
        let inbound = self.shared.register_route(self.id);
        if let Err(err) = self
            .shared
            .send(Frame::new(FrameKind::ChannelOpenConfirm, self.id, Bytes::new()))
            .await
        {
            self.shared.remove_route(self.id);
            return Err(err);
        }
        debug!(channel = self.id, channel_type = %self.channel_type, "channel accepted");
        Ok(Channel::new(self.id, self.channel_type, self.shared, inbound))
    }

    pub async fn reject(self, reason: RejectReason, message: &str) -> TransportResult<()> {
        debug!(channel = self.id, channel_type = %self.channel_type, %reason, "channel rejected");
        self.shared
            .send(Frame::new(
                FrameKind::ChannelOpenFailure,
                self.id,
                wire::encode_rejection(reason, message),
            ))
            .await
    }
}

impl fmt::Debug for ChannelOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOffer")
            .field("id", &self.id)
            .field("channel_type", &self.channel_type)
            .finish()
    }
}
