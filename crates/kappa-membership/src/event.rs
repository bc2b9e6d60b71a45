//! Membership events delivered by the gossip layer.

use bytes::Bytes;

use crate::types::Member;

/// Prefix that marks a user event as addressed to Kappa.
pub const EVENT_PREFIX: &str = "kappa-event:";

/// Name under which a Kappa user event travels on the gossip layer.
pub fn event_name(name: &str) -> String {
    format!("{EVENT_PREFIX}{name}")
}

pub fn is_kappa_event(name: &str) -> bool {
    name.starts_with(EVENT_PREFIX)
}

/// Strip the Kappa prefix; names without it are returned unchanged.
pub fn raw_event_name(name: &str) -> &str {
    name.strip_prefix(EVENT_PREFIX).unwrap_or(name)
}

/// The kind of a [`MembershipEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Join,
    Update,
    Leave,
    Failed,
    Reap,
    User,
    Unknown,
}

/// An application event broadcast over the gossip layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEvent {
    pub name: String,
    pub payload: Bytes,
}

impl UserEvent {
    pub fn new(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Join(Vec<Member>),
    Update(Vec<Member>),
    Leave(Vec<Member>),
    Failed(Vec<Member>),
    Reap(Vec<Member>),
    User(UserEvent),
    /// Anything the gossip layer produced that Kappa does not model.
    Unknown(String),
}

impl MembershipEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Join(_) => EventKind::Join,
            Self::Update(_) => EventKind::Update,
            Self::Leave(_) => EventKind::Leave,
            Self::Failed(_) => EventKind::Failed,
            Self::Reap(_) => EventKind::Reap,
            Self::User(_) => EventKind::User,
            Self::Unknown(_) => EventKind::Unknown,
        }
    }

    /// Members carried by a member event; empty for user and unknown events.
    pub fn members(&self) -> &[Member] {
        match self {
            Self::Join(m) | Self::Update(m) | Self::Leave(m) | Self::Failed(m) | Self::Reap(m) => m,
            Self::User(_) | Self::Unknown(_) => &[],
        }
    }

    /// Whether the event's members are forwarded for reconciliation.
    pub fn is_reconcile_worthy(&self) -> bool {
        matches!(
            self.kind(),
            EventKind::Join
                | EventKind::Update
                | EventKind::Leave
                | EventKind::Failed
                | EventKind::Reap
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_name_helpers() {
        let name = event_name("deploy");
        assert_eq!(name, "kappa-event:deploy");
        assert!(is_kappa_event(&name));
        assert_eq!(raw_event_name(&name), "deploy");

        assert!(!is_kappa_event("consul:deploy"));
        assert_eq!(raw_event_name("consul:deploy"), "consul:deploy");
    }

    #[test]
    fn kinds_and_reconcile_worthiness() {
        let join = MembershipEvent::Join(vec![]);
        let user = MembershipEvent::User(UserEvent::new("x", Bytes::new()));
        let unknown = MembershipEvent::Unknown("query".into());

        assert_eq!(join.kind(), EventKind::Join);
        assert!(join.is_reconcile_worthy());
        assert!(MembershipEvent::Reap(vec![]).is_reconcile_worthy());
        assert!(!user.is_reconcile_worthy());
        assert!(!unknown.is_reconcile_worthy());
        assert!(user.members().is_empty());
    }
}
