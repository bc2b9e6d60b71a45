//! Channel handlers served by every Kappa node.

use async_trait::async_trait;
use tracing::debug;

use kappa_transport::{Channel, ChannelContext, ChannelHandler};

/// Channel type used by Kappa clients.
pub const CLIENT_CHANNEL: &str = "kappa-client";

/// Writes every frame back to the sender. A zero-length frame ends the
/// channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl ChannelHandler for EchoHandler {
    async fn handle(&self, ctx: ChannelContext, mut channel: Channel) -> anyhow::Result<()> {
        let mut frames = 0usize;
        loop {
            let frame = tokio::select! {
                _ = ctx.dying() => break,
                frame = channel.read_frame() => frame?,
            };
            let Some(frame) = frame else { break };
            if frame.is_empty() {
                break;
            }
            channel.write_frame(&frame).await?;
            frames += 1;
        }
        debug!(user = %ctx.user(), channel = channel.id(), frames, "echo channel finished");
        if let Err(err) = channel.close().await {
            debug!(error = %err, "echo channel close after session end");
        }
        Ok(())
    }
}
