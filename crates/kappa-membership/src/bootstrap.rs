//! Bootstrap coordinator.
//!
//! A node started with an expected cluster size waits until that many
//! distinct servers of its cluster are known, then declares the cluster
//! formed exactly once. Any peer that disagrees on the expected size, or
//! that was started in single-node bootstrap mode, aborts the attempt;
//! the next Join retries.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::sync::watch;
use tracing::{error, info};

use crate::types::NodeDetails;

/// Result of one bootstrap attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Expected count is 0; nothing to do.
    Disabled,
    /// A previous attempt already formed the cluster.
    AlreadyComplete,
    /// Not enough peers yet.
    Waiting { have: usize, need: usize },
    /// A peer conflicts with our configuration; no state changed.
    Aborted(String),
    /// The cluster formed with these peers.
    Completed(Vec<NodeDetails>),
}

#[derive(Debug)]
struct BootstrapState {
    expect: usize,
    complete: bool,
}

#[derive(Debug)]
pub struct BootstrapCoordinator {
    cluster: String,
    state: Mutex<BootstrapState>,
    formed: watch::Sender<Option<Vec<NodeDetails>>>,
}

impl BootstrapCoordinator {
    pub fn new(cluster: impl Into<String>, expect: usize) -> Self {
        let (formed, _) = watch::channel(None);
        Self {
            cluster: cluster.into(),
            state: Mutex::new(BootstrapState {
                expect,
                complete: false,
            }),
            formed,
        }
    }

    /// Remaining expected count; 0 once complete or when disabled.
    pub fn expected(&self) -> usize {
        self.state.lock().expect("bootstrap lock").expect
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().expect("bootstrap lock").complete
    }

    /// Observe the formation peer set; `None` until the cluster forms.
    pub fn subscribe(&self) -> watch::Receiver<Option<Vec<NodeDetails>>> {
        self.formed.subscribe()
    }

    /// Try to complete bootstrap given the currently known peers.
    pub fn maybe_bootstrap(&self, peers: &[NodeDetails]) -> BootstrapOutcome {
        let mut state = self.state.lock().expect("bootstrap lock");
        if state.complete {
            return BootstrapOutcome::AlreadyComplete;
        }
        if state.expect == 0 {
            return BootstrapOutcome::Disabled;
        }

        let mut seen: BTreeSet<SocketAddr> = BTreeSet::new();
        let mut formation = Vec::new();
        for peer in peers {
            if peer.cluster != self.cluster {
                error!(member = %peer.name, cluster = %peer.cluster, "member has a conflicting cluster, ignoring");
                continue;
            }
            if peer.expect != 0 && peer.expect != state.expect {
                error!(
                    member = %peer.name,
                    expect = peer.expect,
                    local_expect = state.expect,
                    "member has a conflicting expect value, all nodes should expect the same number"
                );
                return BootstrapOutcome::Aborted(format!(
                    "member {} expects {} servers, local node expects {}",
                    peer.name, peer.expect, state.expect
                ));
            }
            if peer.bootstrap {
                error!(member = %peer.name, "member is in bootstrap mode, expect disabled");
                return BootstrapOutcome::Aborted(format!(
                    "member {} is in bootstrap mode",
                    peer.name
                ));
            }
            if seen.insert(peer.addr) {
                formation.push(peer.clone());
            }
        }

        if seen.len() < state.expect {
            return BootstrapOutcome::Waiting {
                have: seen.len(),
                need: state.expect,
            };
        }

        state.expect = 0;
        state.complete = true;
        drop(state);

        let addrs: Vec<String> = formation.iter().map(NodeDetails::key).collect();
        info!(cluster = %self.cluster, peers = ?addrs, "cluster bootstrap complete");
        self.formed.send_replace(Some(formation.clone()));
        BootstrapOutcome::Completed(formation)
    }
}
