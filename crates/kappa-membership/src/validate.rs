//! Turning raw gossip members into validated peer records.

use std::net::SocketAddr;

use thiserror::Error;

use crate::types::{Member, NodeDetails, SERVER_ROLE, tags};

/// Why a gossip member is not a usable Kappa server peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("member {member} has no role tag")]
    MissingRole { member: String },

    #[error("member {member} has role {role:?}, not a kappa server")]
    NotAServer { member: String, role: String },

    #[error("member {member} has no cluster tag")]
    MissingCluster { member: String },

    #[error("member {member} has no port tag")]
    MissingPort { member: String },

    #[error("member {member} port {value:?} is not a valid port")]
    InvalidPort { member: String, value: String },

    #[error("member {member} expect {value:?} is not an integer")]
    InvalidExpect { member: String, value: String },

    #[error("member {member} is part of cluster {found:?}, expected {expected:?}")]
    ClusterMismatch {
        member: String,
        expected: String,
        found: String,
    },
}

/// Check that `member` is a Kappa server; returns its `(role, cluster)`.
pub fn validate_member(member: &Member) -> Result<(String, String), ValidationError> {
    let role = member.tag(tags::ROLE).ok_or_else(|| ValidationError::MissingRole {
        member: member.name.clone(),
    })?;
    if role != SERVER_ROLE {
        return Err(ValidationError::NotAServer {
            member: member.name.clone(),
            role: role.to_string(),
        });
    }
    let cluster = member
        .tag(tags::CLUSTER)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ValidationError::MissingCluster {
            member: member.name.clone(),
        })?;
    Ok((role.to_string(), cluster.to_string()))
}

/// Build the full peer record for a server member.
pub fn node_details(member: &Member) -> Result<NodeDetails, ValidationError> {
    let (role, cluster) = validate_member(member)?;

    let port_tag = member.tag(tags::PORT).ok_or_else(|| ValidationError::MissingPort {
        member: member.name.clone(),
    })?;
    let port: u16 = port_tag.parse().map_err(|_| ValidationError::InvalidPort {
        member: member.name.clone(),
        value: port_tag.to_string(),
    })?;

    let expect = match member.tag(tags::EXPECT) {
        Some(value) => value.parse().map_err(|_| ValidationError::InvalidExpect {
            member: member.name.clone(),
            value: value.to_string(),
        })?,
        None => 0,
    };

    Ok(NodeDetails {
        name: member.name.clone(),
        role,
        cluster,
        datacenter: member.tag(tags::DATACENTER).map(str::to_string),
        service: member.tag(tags::SERVICE).map(str::to_string),
        port,
        bootstrap: member.tags.contains_key(tags::BOOTSTRAP),
        expect,
        addr: SocketAddr::new(member.addr, port),
    })
}

/// Vets the members of another gossip pool before the two pools merge.
#[derive(Debug, Clone)]
pub struct MergeValidator {
    cluster: String,
}

impl MergeValidator {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    /// Every incoming member must be a complete server record of our cluster.
    pub fn notify_merge(&self, members: &[Member]) -> Result<(), ValidationError> {
        for member in members {
            let node = node_details(member)?;
            if node.cluster != self.cluster {
                return Err(ValidationError::ClusterMismatch {
                    member: member.name.clone(),
                    expected: self.cluster.clone(),
                    found: node.cluster,
                });
            }
        }
        Ok(())
    }
}
