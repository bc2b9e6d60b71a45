//! Node directory: the set of known Kappa server peers.
//!
//! Keyed by the peer's transport address, so one address has at most one
//! record. Every operation takes the single lock and every query returns
//! an owned snapshot.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::types::NodeDetails;

#[derive(Debug, Default)]
pub struct NodeDirectory {
    nodes: Mutex<BTreeMap<String, NodeDetails>>,
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the record for `node.addr`. Returns `true` if
    /// the address was not known before.
    pub fn upsert(&self, node: NodeDetails) -> bool {
        self.nodes
            .lock()
            .expect("directory lock")
            .insert(node.key(), node)
            .is_none()
    }

    /// Remove the record with the same address as `node`; a no-op if absent.
    pub fn remove(&self, node: &NodeDetails) -> Option<NodeDetails> {
        self.remove_addr(&node.addr)
    }

    pub fn remove_addr(&self, addr: &SocketAddr) -> Option<NodeDetails> {
        self.nodes
            .lock()
            .expect("directory lock")
            .remove(&addr.to_string())
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<NodeDetails> {
        self.nodes
            .lock()
            .expect("directory lock")
            .get(&addr.to_string())
            .cloned()
    }

    /// Snapshot of every record, ordered by address.
    pub fn list(&self) -> Vec<NodeDetails> {
        self.nodes
            .lock()
            .expect("directory lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().expect("directory lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn filter<F>(&self, predicate: F) -> Vec<NodeDetails>
    where
        F: Fn(&NodeDetails) -> bool,
    {
        self.nodes
            .lock()
            .expect("directory lock")
            .values()
            .filter(|n| predicate(n))
            .cloned()
            .collect()
    }

    pub fn find_by_role(&self, role: &str) -> Vec<NodeDetails> {
        self.filter(|n| n.role == role)
    }

    pub fn find_by_datacenter(&self, datacenter: &str) -> Vec<NodeDetails> {
        self.filter(|n| n.datacenter.as_deref() == Some(datacenter))
    }

    pub fn find_by_service(&self, service: &str) -> Vec<NodeDetails> {
        self.filter(|n| n.service.as_deref() == Some(service))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SERVER_ROLE;
    use proptest::prelude::*;

    fn node(name: &str, addr: &str, role: &str) -> NodeDetails {
        let addr: SocketAddr = addr.parse().unwrap();
        NodeDetails {
            name: name.into(),
            role: role.into(),
            cluster: "local".into(),
            datacenter: None,
            service: None,
            port: addr.port(),
            bootstrap: false,
            expect: 0,
            addr,
        }
    }

    #[test]
    fn upsert_overwrites_same_address() {
        let dir = NodeDirectory::new();
        assert!(dir.upsert(node("old", "10.0.0.1:9022", SERVER_ROLE)));
        assert!(!dir.upsert(node("new", "10.0.0.1:9022", SERVER_ROLE)));

        assert_eq!(dir.len(), 1);
        let got = dir.get(&"10.0.0.1:9022".parse().unwrap()).unwrap();
        assert_eq!(got.name, "new");
    }

    #[test]
    fn remove_absent_is_a_noop() {
        let dir = NodeDirectory::new();
        dir.upsert(node("a", "10.0.0.1:9022", SERVER_ROLE));
        assert!(dir.remove(&node("b", "10.0.0.2:9022", SERVER_ROLE)).is_none());
        assert_eq!(dir.len(), 1);

        assert!(dir.remove(&node("a", "10.0.0.1:9022", SERVER_ROLE)).is_some());
        assert!(dir.is_empty());
    }

    #[test]
    fn list_is_a_snapshot() {
        let dir = NodeDirectory::new();
        dir.upsert(node("a", "10.0.0.1:9022", SERVER_ROLE));
        let snapshot = dir.list();
        dir.upsert(node("b", "10.0.0.2:9022", SERVER_ROLE));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(dir.list().len(), 2);
    }

    #[test]
    fn find_by_datacenter_and_service() {
        let dir = NodeDirectory::new();
        let mut a = node("a", "10.0.0.1:9022", SERVER_ROLE);
        a.datacenter = Some("dc1".into());
        a.service = Some("query".into());
        let mut b = node("b", "10.0.0.2:9022", SERVER_ROLE);
        b.datacenter = Some("dc2".into());
        dir.upsert(a);
        dir.upsert(b);

        let dc1 = dir.find_by_datacenter("dc1");
        assert_eq!(dc1.len(), 1);
        assert_eq!(dc1[0].name, "a");
        assert_eq!(dir.find_by_service("query").len(), 1);
        assert!(dir.find_by_service("storage").is_empty());
    }

    proptest! {
        #[test]
        fn find_by_role_returns_exactly_matching(
            roles in prop::collection::vec(prop::sample::select(vec!["X", "Y", "Z"]), 0..20),
        ) {
            let dir = NodeDirectory::new();
            for (i, role) in roles.iter().enumerate() {
                dir.upsert(node(&format!("n{i}"), &format!("10.0.0.{}:9022", i + 1), role));
            }

            let found = dir.find_by_role("X");
            let expected = roles.iter().filter(|r| **r == "X").count();
            prop_assert_eq!(found.len(), expected);
            prop_assert!(found.iter().all(|n| n.role == "X"));
        }

        #[test]
        fn repeated_upserts_keep_one_entry_per_address(
            names in prop::collection::vec("[a-z]{1,8}", 1..10),
        ) {
            let dir = NodeDirectory::new();
            for name in &names {
                dir.upsert(node(name, "10.0.0.1:9022", SERVER_ROLE));
            }
            prop_assert_eq!(dir.len(), 1);
            let last = names.last().unwrap();
            prop_assert_eq!(&dir.list()[0].name, last);
        }
    }
}
