//! kappa-transport: the client-facing RPC transport of a Kappa node.
//!
//! A TLS listener whose sessions are authenticated by public key or
//! password and then multiplexed into typed channels. Each channel type
//! is served by a [`ChannelHandler`] looked up in an immutable
//! [`HandlerRegistry`].
//!
//! ```text
//! TCP ─▶ TLS (host identity) ─▶ challenge auth ─▶ session
//!                                                   ├── channel "kappa-client" ─▶ handler
//!                                                   └── channel "…"            ─▶ handler
//! ```
//!
//! Inside a channel, application messages use a 4-byte little-endian
//! length prefix (see [`framing`]).

pub mod auth;
pub mod channel;
pub mod client;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod identity;
pub mod registry;
pub mod server;
mod session;
pub mod wire;

pub use auth::{
    AuthLogCallback, AuthMethod, Authenticators, ConnMetadata, PasswordAuthenticator, Permissions,
    PublicKeyAuthenticator,
};
pub use channel::{Channel, ChannelOffer};
pub use client::{ClientAuth, ClientConfig, TransportClient};
pub use error::{AuthError, TransportError, TransportResult};
pub use identity::{HostIdentity, HostKeyPolicy};
pub use registry::{ChannelContext, ChannelHandler, HandlerRegistry, HandlerRegistryBuilder};
pub use server::{TransportConfig, TransportServer};
pub use wire::RejectReason;

pub use ed25519_dalek::{SigningKey, VerifyingKey};
