//! kappa-server: a Kappa cluster node.
//!
//! Ties the [`kappa_transport`] RPC server and the [`kappa_membership`]
//! pipeline together behind [`Server`], configured from a [`ServerConfig`].

pub mod auth;
pub mod config;
pub mod handlers;
pub mod server;

pub use auth::{AuthorizedKeys, auth_log};
pub use config::{ConfigError, GossipSection, ServerConfig};
pub use handlers::{CLIENT_CHANNEL, EchoHandler};
pub use server::{GossipFactory, Server, ServerBuilder, node_tags};
