//! Kappa cluster membership.
//!
//! Consumes events from a gossip overlay and turns them into the local view
//! of the cluster:
//!
//! - [`EventRouter`] dispatches each [`MembershipEvent`] to its handler and
//!   forwards members to a [`Reconciler`].
//! - [`NodeJoinHandler`] / [`NodeLeaveHandler`] keep the [`NodeDirectory`]
//!   of server peers current.
//! - [`LeaderGatedReconciler`] queues changes for the consensus layer, on
//!   the leader only.
//! - [`BootstrapCoordinator`] forms the cluster once the expected number of
//!   servers has been seen.
//! - [`GossipProvider`] abstracts the overlay; [`LocalGossip`] is an
//!   in-process implementation.

pub mod bootstrap;
pub mod directory;
pub mod error;
pub mod event;
pub mod gossip;
pub mod handlers;
pub mod local;
pub mod reconcile;
pub mod router;
pub mod types;
pub mod validate;

pub use bootstrap::{BootstrapCoordinator, BootstrapOutcome};
pub use directory::NodeDirectory;
pub use error::{MembershipError, MembershipResult};
pub use event::{
    EVENT_PREFIX, EventKind, MembershipEvent, UserEvent, event_name, is_kappa_event,
    raw_event_name,
};
pub use gossip::{DEFAULT_GOSSIP_PORT, GossipConfig, GossipProvider};
pub use handlers::{NodeJoinHandler, NodeLeaveHandler, PrefixedUserEventHandler};
pub use local::{GossipHub, LocalGossip};
pub use reconcile::{LeaderCheck, LeaderGatedReconciler};
pub use router::{EventRouter, MemberEventHandler, Reconciler, UserEventHandler};
pub use types::{Member, MemberStatus, NodeDetails, SERVER_ROLE, tags};
pub use validate::{MergeValidator, ValidationError, node_details, validate_member};
