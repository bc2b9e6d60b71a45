//! Channel handler registry.
//!
//! Maps a channel-type name to the handler that serves channels of that
//! type. Built once before the server is configured and never mutated
//! afterwards, so lookups need no lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::WaitForCancellationFuture;

use kappa_core::Supervisor;

use crate::auth::Permissions;
use crate::channel::Channel;

/// Serves one accepted channel to completion.
///
/// The handler owns the channel exclusively; returning closes it. An
/// error is logged by the server and affects only this channel.
#[async_trait]
pub trait ChannelHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: ChannelContext, channel: Channel) -> anyhow::Result<()>;
}

/// Connection-scoped facts handed to every handler.
#[derive(Clone)]
pub struct ChannelContext {
    sup: Supervisor,
    user: String,
    permissions: Arc<Permissions>,
    remote_addr: SocketAddr,
}

impl ChannelContext {
    pub(crate) fn new(
        sup: Supervisor,
        user: String,
        permissions: Permissions,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            sup,
            user,
            permissions: Arc::new(permissions),
            remote_addr,
        }
    }

    /// The authenticated user name.
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The connection's supervisor. Handlers may spawn helpers under it.
    pub fn supervisor(&self) -> &Supervisor {
        &self.sup
    }

    /// Resolves when the connection starts shutting down.
    pub fn dying(&self) -> WaitForCancellationFuture<'_> {
        self.sup.dying()
    }

    pub fn is_dying(&self) -> bool {
        self.sup.is_dying()
    }
}

/// Immutable map of channel type to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<String, Arc<dyn ChannelHandler>>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Look up the handler for `channel_type`.
    pub fn get(&self, channel_type: &str) -> Option<Arc<dyn ChannelHandler>> {
        self.handlers.get(channel_type).cloned()
    }

    pub fn contains(&self, channel_type: &str) -> bool {
        self.handlers.contains_key(channel_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered channel type names, sorted.
    pub fn channel_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl FromIterator<(String, Arc<dyn ChannelHandler>)> for HandlerRegistry {
    fn from_iter<I: IntoIterator<Item = (String, Arc<dyn ChannelHandler>)>>(iter: I) -> Self {
        Self {
            handlers: Arc::new(iter.into_iter().collect()),
        }
    }
}

/// Collects handlers before freezing them into a [`HandlerRegistry`].
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, Arc<dyn ChannelHandler>>,
}

impl HandlerRegistryBuilder {
    /// Register `handler` for `channel_type`. A later registration for the
    /// same name replaces the earlier one.
    pub fn handler(mut self, channel_type: impl Into<String>, handler: impl ChannelHandler) -> Self {
        self.handlers.insert(channel_type.into(), Arc::new(handler));
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}
