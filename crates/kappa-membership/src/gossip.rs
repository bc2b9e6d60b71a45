//! The gossip overlay seen from a Kappa node.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::MembershipResult;
use crate::types::Member;
use crate::validate::MergeValidator;

/// Default gossip port.
pub const DEFAULT_GOSSIP_PORT: u16 = 7946;

/// Settings for one node's gossip endpoint.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub node_name: String,
    pub bind_addr: IpAddr,
    pub bind_port: u16,
    /// Address other members should use to reach this node; defaults to
    /// `bind_addr`.
    pub advertise_addr: Option<IpAddr>,
    pub advertise_port: Option<u16>,
    pub tags: HashMap<String, String>,
    /// Vets foreign members before pools merge; merges are unchecked when unset.
    pub validator: Option<MergeValidator>,
}

impl GossipConfig {
    pub fn new(node_name: impl Into<String>, bind_addr: IpAddr, bind_port: u16) -> Self {
        Self {
            node_name: node_name.into(),
            bind_addr,
            bind_port,
            advertise_addr: None,
            advertise_port: None,
            tags: HashMap::new(),
            validator: None,
        }
    }

    pub fn with_advertise(mut self, addr: Option<IpAddr>, port: Option<u16>) -> Self {
        self.advertise_addr = addr;
        self.advertise_port = port;
        self
    }

    pub fn with_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_validator(mut self, validator: MergeValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// The `(addr, port)` this node is known by.
    pub fn advertised(&self) -> (IpAddr, u16) {
        (
            self.advertise_addr.unwrap_or(self.bind_addr),
            self.advertise_port.unwrap_or(self.bind_port),
        )
    }
}

/// A gossip membership provider.
///
/// Implementations deliver [`MembershipEvent`](crate::MembershipEvent)s on
/// the channel they were constructed with.
#[async_trait]
pub trait GossipProvider: Send + Sync {
    /// Begin participating; emits a Join for the local member.
    async fn start(&self) -> MembershipResult<()>;

    /// Contact the given `host:port` seeds; returns how many were reached.
    async fn join(&self, seeds: &[String]) -> MembershipResult<usize>;

    /// Announce a graceful departure.
    async fn leave(&self) -> MembershipResult<()>;

    /// Stop participating.
    async fn shutdown(&self) -> MembershipResult<()>;

    fn local_member(&self) -> Member;

    /// Every member known locally, including departed ones.
    fn members(&self) -> Vec<Member>;

    /// Replace the local member's tags and gossip the change.
    async fn set_tags(&self, tags: HashMap<String, String>) -> MembershipResult<()>;

    /// Broadcast a user event to the cluster.
    async fn user_event(&self, name: &str, payload: Bytes) -> MembershipResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertised_falls_back_to_bind() {
        let cfg = GossipConfig::new("a", "10.0.0.1".parse().unwrap(), DEFAULT_GOSSIP_PORT);
        assert_eq!(cfg.advertised(), ("10.0.0.1".parse().unwrap(), 7946));

        let cfg = cfg.with_advertise(Some("192.168.1.1".parse().unwrap()), None);
        assert_eq!(cfg.advertised(), ("192.168.1.1".parse().unwrap(), 7946));
    }
}
