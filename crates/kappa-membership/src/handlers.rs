//! Member and user event handlers wired into the [`EventRouter`].
//!
//! [`EventRouter`]: crate::router::EventRouter

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::bootstrap::{BootstrapCoordinator, BootstrapOutcome};
use crate::directory::NodeDirectory;
use crate::event::{EventKind, UserEvent, is_kappa_event, raw_event_name};
use crate::router::{MemberEventHandler, UserEventHandler};
use crate::types::Member;
use crate::validate::node_details;

/// Adds joining and updated servers of the local cluster to the directory,
/// then gives the bootstrap coordinator a chance to form the cluster.
pub struct NodeJoinHandler {
    directory: Arc<NodeDirectory>,
    cluster: String,
    bootstrap: Option<Arc<BootstrapCoordinator>>,
}

impl NodeJoinHandler {
    pub fn new(directory: Arc<NodeDirectory>, cluster: impl Into<String>) -> Self {
        Self {
            directory,
            cluster: cluster.into(),
            bootstrap: None,
        }
    }

    pub fn with_bootstrap(mut self, coordinator: Arc<BootstrapCoordinator>) -> Self {
        self.bootstrap = Some(coordinator);
        self
    }
}

impl MemberEventHandler for NodeJoinHandler {
    fn handle_member_event(&self, kind: EventKind, members: &[Member]) {
        let mut saw_server = false;
        for member in members {
            let node = match node_details(member) {
                Ok(node) => node,
                Err(err) => {
                    debug!(member = %member.name, error = %err, "skipping member");
                    continue;
                }
            };
            if node.cluster != self.cluster {
                warn!(
                    member = %node.name,
                    cluster = %node.cluster,
                    local_cluster = %self.cluster,
                    "member belongs to another cluster, ignoring"
                );
                continue;
            }
            info!(node = %node, ?kind, "adding server");
            self.directory.upsert(node);
            saw_server = true;
        }

        if kind != EventKind::Join || !saw_server {
            return;
        }
        let Some(coordinator) = &self.bootstrap else {
            return;
        };
        if coordinator.is_complete() {
            return;
        }
        if let BootstrapOutcome::Waiting { have, need } =
            coordinator.maybe_bootstrap(&self.directory.list())
        {
            debug!(have, need, "waiting for more servers before bootstrap");
        }
    }
}

/// Removes departed and failed servers from the directory.
pub struct NodeLeaveHandler {
    directory: Arc<NodeDirectory>,
}

impl NodeLeaveHandler {
    pub fn new(directory: Arc<NodeDirectory>) -> Self {
        Self { directory }
    }
}

impl MemberEventHandler for NodeLeaveHandler {
    fn handle_member_event(&self, kind: EventKind, members: &[Member]) {
        for member in members {
            let node = match node_details(member) {
                Ok(node) => node,
                Err(err) => {
                    debug!(member = %member.name, error = %err, "skipping member");
                    continue;
                }
            };
            if self.directory.remove(&node).is_some() {
                info!(node = %node, ?kind, "removing server");
            }
        }
    }
}

/// Forwards `kappa-event:` user events, prefix stripped, to the
/// application event channel.
pub struct PrefixedUserEventHandler {
    tx: mpsc::Sender<UserEvent>,
}

impl PrefixedUserEventHandler {
    pub fn new(tx: mpsc::Sender<UserEvent>) -> Self {
        Self { tx }
    }
}

impl UserEventHandler for PrefixedUserEventHandler {
    fn handle_user_event(&self, event: UserEvent) {
        if !is_kappa_event(&event.name) {
            warn!(event = %event.name, "unhandled user event");
            return;
        }
        let name = raw_event_name(&event.name).to_string();
        debug!(event = %name, "user event");
        match self.tx.try_send(UserEvent::new(name, event.payload)) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(event = %event.name, "user event channel full, event dropped");
            }
            Err(TrySendError::Closed(event)) => {
                debug!(event = %event.name, "user event channel closed");
            }
        }
    }
}
