//! Transport client: connect, authenticate, and open channels.

use std::net::SocketAddr;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::debug;

use kappa_core::Supervisor;

use crate::channel::Channel;
use crate::error::{TransportError, TransportResult};
use crate::handshake;
use crate::identity::HostKeyPolicy;
use crate::session::{self, Role, SessionHandle};
use crate::wire::FrameCodec;

/// How the client proves its identity.
#[derive(Clone)]
pub enum ClientAuth {
    PublicKey(SigningKey),
    Password(String),
}

impl std::fmt::Debug for ClientAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PublicKey(key) => f
                .debug_tuple("PublicKey")
                .field(&hex::encode(key.verifying_key().as_bytes()))
                .finish(),
            Self::Password(_) => f.write_str("Password(..)"),
        }
    }
}

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub user: String,
    pub auth: ClientAuth,
    pub host_key: HostKeyPolicy,
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(user: impl Into<String>, auth: ClientAuth, host_key: HostKeyPolicy) -> Self {
        Self {
            user: user.into(),
            auth,
            host_key,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// An authenticated session to a Kappa node.
///
/// The session stays up until [`close`](Self::close) is called, the
/// client is dropped, or the server hangs up.
pub struct TransportClient {
    session: SessionHandle,
    sup: Supervisor,
    remote: SocketAddr,
}

impl TransportClient {
    pub async fn connect(addr: SocketAddr, config: ClientConfig) -> TransportResult<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Handshake(format!("connect to {addr} timed out")))??;
        let _ = stream.set_nodelay(true);

        let connector = TlsConnector::from(config.host_key.client_config()?);
        let server_name = ServerName::IpAddress(addr.ip().into());
        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| TransportError::Handshake(format!("tls: {e}")))?;

        let mut framed = Framed::new(tls, FrameCodec);
        handshake::client_handshake(&mut framed, &config.user, &config.auth).await?;
        debug!(%addr, user = %config.user, "authenticated to server");

        let sup = Supervisor::new();
        // Servers never open channels toward clients; dropping the offer
        // queue makes the session refuse them.
        let parts = session::spawn_session(framed, &sup, Role::Initiator);

        Ok(Self {
            session: parts.handle,
            sup,
            remote: addr,
        })
    }

    /// Open a channel of the given type.
    pub async fn open_channel(&self, channel_type: &str) -> TransportResult<Channel> {
        self.session.open_channel(channel_type).await
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Resolves once the session has ended for any reason.
    pub async fn closed(&self) {
        self.session.supervisor().dying().await;
    }

    pub fn is_closed(&self) -> bool {
        self.sup.is_dying()
    }

    /// Close the session and wait for its pumps to finish.
    pub async fn close(self) -> TransportResult<()> {
        self.sup.cancel(None);
        self.sup
            .wait()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.sup.cancel(None);
    }
}
