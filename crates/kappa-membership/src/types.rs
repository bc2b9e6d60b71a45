//! Core membership types: gossip members and validated peer records.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Role tag value advertised by every Kappa server.
pub const SERVER_ROLE: &str = "kappa-server";

/// Gossip tag names.
pub mod tags {
    pub const ID: &str = "id";
    pub const ROLE: &str = "role";
    pub const CLUSTER: &str = "cluster";
    pub const BUILD: &str = "build";
    pub const PORT: &str = "port";
    pub const BOOTSTRAP: &str = "bootstrap";
    pub const EXPECT: &str = "expect";
    pub const DATACENTER: &str = "dc";
    pub const SERVICE: &str = "service";
}

/// Liveness of a gossip member as seen by the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Alive,
    Leaving,
    Left,
    Failed,
    /// Removed from the member list; only ever set on reconciliation
    /// requests for reap events.
    Reaped,
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Alive => "alive",
            Self::Leaving => "leaving",
            Self::Left => "left",
            Self::Failed => "failed",
            Self::Reaped => "reaped",
        };
        f.write_str(s)
    }
}

/// A raw gossip member descriptor, not yet validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    /// Gossip address.
    pub addr: IpAddr,
    /// Gossip port.
    pub port: u16,
    pub tags: HashMap<String, String>,
    pub status: MemberStatus,
}

impl Member {
    pub fn new(name: impl Into<String>, addr: IpAddr, port: u16) -> Self {
        Self {
            name: name.into(),
            addr,
            port,
            tags: HashMap::new(),
            status: MemberStatus::Alive,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_status(mut self, status: MemberStatus) -> Self {
        self.status = status;
        self
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// `addr:port` of the member's gossip endpoint.
    pub fn gossip_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

/// A validated Kappa server peer.
///
/// `addr` is the peer's transport endpoint: its gossip IP with the port
/// taken from the `port` tag. It is also the record's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDetails {
    pub name: String,
    pub role: String,
    pub cluster: String,
    pub datacenter: Option<String>,
    pub service: Option<String>,
    pub port: u16,
    pub bootstrap: bool,
    /// Expected cluster size advertised by the peer; 0 when absent.
    pub expect: usize,
    pub addr: SocketAddr,
}

impl NodeDetails {
    /// Identity key in the node directory.
    pub fn key(&self) -> String {
        self.addr.to_string()
    }
}

impl fmt::Display for NodeDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NodeDetails{{name: {:?}, role: {:?}, cluster: {:?}, addr: \"{}\"}}",
            self.name, self.role, self.cluster, self.addr
        )
    }
}
