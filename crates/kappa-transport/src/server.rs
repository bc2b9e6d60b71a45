//! Transport server: accept loop, per-connection handshake, and channel
//! dispatch.
//!
//! # Architecture
//!
//! ```text
//! root supervisor
//!   └── accept loop ─── listener supervisor (child)
//!                          └── connection task (handshake)
//!                                └── connection supervisor (child)
//!                                      ├── read pump / write pump
//!                                      ├── global request discard
//!                                      ├── dispatch loop
//!                                      └── one task per accepted channel
//! ```
//!
//! A failed handshake or an unknown channel type ends only that
//! connection. A failed handler ends only its channel. `stop()` cancels
//! the root and waits for every level to unwind.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use kappa_core::{Supervisor, TaskFailure};

use crate::auth::Authenticators;
use crate::channel::ChannelOffer;
use crate::error::{TransportError, TransportResult};
use crate::handshake;
use crate::identity::HostIdentity;
use crate::registry::{ChannelContext, HandlerRegistry};
use crate::session::{self, Role};
use crate::wire::{FrameCodec, RejectReason};

/// Default bound on a single `accept` call.
pub const DEFAULT_ACCEPT_DEADLINE: Duration = Duration::from_secs(1);

/// Default bound on TLS plus authentication for a new connection.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything needed to configure a [`TransportServer`].
#[derive(Clone)]
pub struct TransportConfig {
    /// `host:port`, or `:port` for all interfaces.
    pub bind_address: String,
    pub accept_deadline: Duration,
    pub handshake_timeout: Duration,
    pub identity: HostIdentity,
    pub authenticators: Authenticators,
    pub registry: HandlerRegistry,
}

impl TransportConfig {
    pub fn new(
        bind_address: impl Into<String>,
        identity: HostIdentity,
        authenticators: Authenticators,
        registry: HandlerRegistry,
    ) -> Self {
        Self {
            bind_address: bind_address.into(),
            accept_deadline: DEFAULT_ACCEPT_DEADLINE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            identity,
            authenticators,
            registry,
        }
    }

    pub fn with_accept_deadline(mut self, deadline: Duration) -> Self {
        self.accept_deadline = deadline;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// State shared by the accept loop and every connection task.
struct Shared {
    acceptor: TlsAcceptor,
    authenticators: Authenticators,
    registry: HandlerRegistry,
    local_addr: SocketAddr,
    accept_deadline: Duration,
    handshake_timeout: Duration,
}

/// The authenticated, channel-multiplexing server.
pub struct TransportServer {
    listener: Mutex<Option<std::net::TcpListener>>,
    shared: Arc<Shared>,
    sup: Supervisor,
}

impl TransportServer {
    /// Validate the configuration and open the listening socket.
    ///
    /// Nothing is accepted until [`start`](Self::start).
    pub fn configure(config: TransportConfig) -> TransportResult<Self> {
        if config.authenticators.is_empty() {
            return Err(TransportError::Configuration(
                "no authentication method configured".into(),
            ));
        }
        let addr = resolve_bind_address(&config.bind_address)?;
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|e| TransportError::Configuration(format!("listen on {addr}: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| TransportError::Configuration(format!("listen on {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;
        let tls = config.identity.server_config()?;

        debug!(%local_addr, channel_types = ?config.registry.channel_types(), "transport configured");

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            shared: Arc::new(Shared {
                acceptor: TlsAcceptor::from(tls),
                authenticators: config.authenticators,
                registry: config.registry,
                local_addr,
                accept_deadline: config.accept_deadline,
                handshake_timeout: config.handshake_timeout,
            }),
            sup: Supervisor::new(),
        })
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Start accepting connections. Returns immediately.
    pub fn start(&self) -> TransportResult<()> {
        let std_listener = self
            .listener
            .lock()
            .expect("listener lock")
            .take()
            .ok_or(TransportError::AlreadyStarted)?;
        let listener = TcpListener::from_std(std_listener)?;

        info!(addr = %self.shared.local_addr, "transport server started");
        self.sup
            .spawn(accept_loop(listener, Arc::clone(&self.shared), self.sup.clone()));
        Ok(())
    }

    /// Stop accepting, tear down every connection, and wait for all tasks.
    ///
    /// Returns the first failure recorded by the listener or any
    /// connection.
    pub async fn stop(&self) -> Result<(), TaskFailure> {
        info!(addr = %self.shared.local_addr, "transport server stopping");
        self.sup.cancel(None);
        let result = self.sup.wait().await;
        info!(addr = %self.shared.local_addr, "transport server stopped");
        result
    }
}

/// Parse a bind address. `":9022"` binds all interfaces.
pub fn resolve_bind_address(bind: &str) -> TransportResult<SocketAddr> {
    let bind = bind.trim();
    if bind.is_empty() {
        return Err(TransportError::Configuration("bind address is empty".into()));
    }
    let candidate = if bind.starts_with(':') {
        format!("0.0.0.0{bind}")
    } else {
        bind.to_string()
    };
    candidate
        .to_socket_addrs()
        .map_err(|e| TransportError::Configuration(format!("invalid bind address {bind:?}: {e}")))?
        .next()
        .ok_or_else(|| {
            TransportError::Configuration(format!("bind address {bind:?} resolved to nothing"))
        })
}

// ── Accept loop ─────────────────────────────────────────────────────

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, sup: Supervisor) -> anyhow::Result<()> {
    let conns = sup.child();

    while !sup.is_dying() {
        match tokio::time::timeout(shared.accept_deadline, listener.accept()).await {
            Err(_) => {
                trace!("accept deadline elapsed");
            }
            Ok(Err(err)) => {
                warn!(error = %err, "accept failed");
            }
            Ok(Ok((stream, remote))) => {
                debug!(%remote, "accepted connection");
                let shared = Arc::clone(&shared);
                let parent = conns.clone();
                conns.spawn(async move {
                    let result = handle_connection(stream, remote, shared, parent).await;
                    if let Err(err) = &result {
                        warn!(%remote, error = %err, "connection failed");
                    }
                    result
                });
            }
        }
    }

    drop(listener);
    trace!("accept loop exiting, waiting for connections");
    conns.wait().await?;
    Ok(())
}

// ── Per-connection handling ─────────────────────────────────────────

async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    shared: Arc<Shared>,
    parent: Supervisor,
) -> anyhow::Result<()> {
    let _ = stream.set_nodelay(true);
    let local = stream.local_addr()?;

    let handshake = async {
        let tls = shared
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| TransportError::Handshake(format!("tls: {e}")))?;
        let mut framed = Framed::new(tls, FrameCodec);
        let authed =
            handshake::server_handshake(&mut framed, &shared.authenticators, remote, local).await?;
        Ok::<_, TransportError>((framed, authed))
    };

    // The raw stream is dropped (and the socket closed) on any failure.
    let (framed, authed) = tokio::select! {
        _ = parent.dying() => return Ok(()),
        result = tokio::time::timeout(shared.handshake_timeout, handshake) => match result {
            Err(_) => return Err(TransportError::Handshake("timed out".into()).into()),
            Ok(outcome) => outcome?,
        },
    };
    info!(%remote, user = %authed.user, "client authenticated");

    let conn = parent.child();
    let parts = session::spawn_session(framed, &conn, Role::Acceptor);
    conn.spawn(discard_global_requests(parts.globals, conn.clone()));

    let ctx = ChannelContext::new(conn.clone(), authed.user, authed.permissions, remote);
    conn.spawn_critical(dispatch_channels(
        parts.offers,
        shared.registry.clone(),
        ctx,
        conn.clone(),
    ));

    let result = conn.wait().await;
    debug!(%remote, "connection closed");
    result.map_err(Into::into)
}

async fn discard_global_requests(mut globals: mpsc::Receiver<Bytes>, conn: Supervisor) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = conn.dying() => return Ok(()),
            request = globals.recv() => match request {
                Some(payload) => trace!(len = payload.len(), "discarding global request"),
                None => return Ok(()),
            },
        }
    }
}

/// Serve channel offers in arrival order until the connection dies, the
/// peer stops offering, or an offer names an unknown channel type.
async fn dispatch_channels(
    mut offers: mpsc::Receiver<ChannelOffer>,
    registry: HandlerRegistry,
    ctx: ChannelContext,
    conn: Supervisor,
) -> anyhow::Result<()> {
    let remote = ctx.remote_addr();

    loop {
        let offer = tokio::select! {
            _ = conn.dying() => break,
            offer = offers.recv() => match offer {
                Some(offer) => offer,
                None => break,
            },
        };

        let channel_type = offer.channel_type().to_string();
        let Some(handler) = registry.get(&channel_type) else {
            warn!(%remote, %channel_type, "rejecting unknown channel type");
            let message = format!("unknown channel type: {channel_type}");
            if let Err(err) = offer.reject(RejectReason::UnknownChannelType, &message).await {
                debug!(%remote, error = %err, "rejection not delivered");
            }
            break;
        };

        let channel = offer.accept().await?;
        let ctx = ctx.clone();
        conn.spawn(async move {
            let id = channel.id();
            if let Err(err) = handler.handle(ctx, channel).await {
                warn!(%remote, %channel_type, channel = id, error = %err, "channel handler failed");
            }
            Ok(())
        });
    }

    conn.cancel(None);
    Ok(())
}
