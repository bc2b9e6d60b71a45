//! Membership event router.
//!
//! Dispatches each gossip event to the handler for its kind, then forwards
//! every member of a reconcile-worthy event to the reconciler:
//!
//! | Event   | Handler          | Reconciled               |
//! |---------|------------------|--------------------------|
//! | Join    | `node_joined`    | yes                      |
//! | Update  | `node_updated`   | yes                      |
//! | Leave   | `node_left`      | yes                      |
//! | Failed  | `node_failed`    | yes                      |
//! | Reap    | none             | yes, status `Reaped`     |
//! | User    | `user_event`     | no                       |
//! | Unknown | logged           | no                       |

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use kappa_core::Supervisor;

use crate::event::{EventKind, MembershipEvent, UserEvent};
use crate::types::{Member, MemberStatus};

/// Handles the members of one membership event.
pub trait MemberEventHandler: Send + Sync {
    fn handle_member_event(&self, kind: EventKind, members: &[Member]);
}

/// Handles user events.
pub trait UserEventHandler: Send + Sync {
    fn handle_user_event(&self, event: UserEvent);
}

/// Receives individual members whose state should be reconciled with the
/// authoritative store.
pub trait Reconciler: Send + Sync {
    fn reconcile(&self, member: Member);
}

#[derive(Clone, Default)]
pub struct EventRouter {
    node_joined: Option<Arc<dyn MemberEventHandler>>,
    node_updated: Option<Arc<dyn MemberEventHandler>>,
    node_left: Option<Arc<dyn MemberEventHandler>>,
    node_failed: Option<Arc<dyn MemberEventHandler>>,
    user_event: Option<Arc<dyn UserEventHandler>>,
    reconciler: Option<Arc<dyn Reconciler>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node_joined(mut self, handler: Arc<dyn MemberEventHandler>) -> Self {
        self.node_joined = Some(handler);
        self
    }

    pub fn with_node_updated(mut self, handler: Arc<dyn MemberEventHandler>) -> Self {
        self.node_updated = Some(handler);
        self
    }

    pub fn with_node_left(mut self, handler: Arc<dyn MemberEventHandler>) -> Self {
        self.node_left = Some(handler);
        self
    }

    pub fn with_node_failed(mut self, handler: Arc<dyn MemberEventHandler>) -> Self {
        self.node_failed = Some(handler);
        self
    }

    pub fn with_user_event(mut self, handler: Arc<dyn UserEventHandler>) -> Self {
        self.user_event = Some(handler);
        self
    }

    pub fn with_reconciler(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    /// Route a single event.
    pub fn route(&self, event: MembershipEvent) {
        let kind = event.kind();
        let members = match event {
            MembershipEvent::Join(members) => {
                Self::dispatch(&self.node_joined, kind, &members);
                members
            }
            MembershipEvent::Update(members) => {
                Self::dispatch(&self.node_updated, kind, &members);
                members
            }
            MembershipEvent::Leave(members) => {
                Self::dispatch(&self.node_left, kind, &members);
                members
            }
            MembershipEvent::Failed(members) => {
                Self::dispatch(&self.node_failed, kind, &members);
                members
            }
            MembershipEvent::Reap(members) => members,
            MembershipEvent::User(user) => {
                if let Some(handler) = &self.user_event {
                    handler.handle_user_event(user);
                }
                return;
            }
            MembershipEvent::Unknown(description) => {
                warn!(event = %description, "unhandled membership event");
                return;
            }
        };

        let Some(reconciler) = &self.reconciler else {
            return;
        };
        for mut member in members {
            if kind == EventKind::Reap {
                member.status = MemberStatus::Reaped;
            }
            reconciler.reconcile(member);
        }
    }

    fn dispatch(handler: &Option<Arc<dyn MemberEventHandler>>, kind: EventKind, members: &[Member]) {
        if let Some(handler) = handler {
            handler.handle_member_event(kind, members);
        }
    }

    /// Route events in delivery order until the channel closes or `sup`
    /// starts dying.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<MembershipEvent>,
        sup: Supervisor,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = sup.dying() => {
                    debug!("membership event loop stopping");
                    return Ok(());
                }
                event = events.recv() => match event {
                    Some(event) => self.route(event),
                    None => {
                        debug!("membership event channel closed");
                        return Ok(());
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(EventKind, Vec<String>)>>,
        users: Mutex<Vec<UserEvent>>,
        reconciled: Mutex<Vec<Member>>,
    }

    impl MemberEventHandler for Recorder {
        fn handle_member_event(&self, kind: EventKind, members: &[Member]) {
            let names = members.iter().map(|m| m.name.clone()).collect();
            self.calls.lock().unwrap().push((kind, names));
        }
    }

    impl UserEventHandler for Recorder {
        fn handle_user_event(&self, event: UserEvent) {
            self.users.lock().unwrap().push(event);
        }
    }

    impl Reconciler for Recorder {
        fn reconcile(&self, member: Member) {
            self.reconciled.lock().unwrap().push(member);
        }
    }

    fn member(name: &str) -> Member {
        Member::new(name, "10.0.0.1".parse().unwrap(), 7946)
    }

    fn router(rec: &Arc<Recorder>) -> EventRouter {
        EventRouter::new()
            .with_node_joined(rec.clone())
            .with_node_updated(rec.clone())
            .with_node_left(rec.clone())
            .with_node_failed(rec.clone())
            .with_user_event(rec.clone())
            .with_reconciler(rec.clone())
    }

    #[test]
    fn join_dispatches_then_reconciles_each_member() {
        let rec = Arc::new(Recorder::default());
        router(&rec).route(MembershipEvent::Join(vec![member("a"), member("b")]));

        let calls = rec.calls.lock().unwrap();
        assert_eq!(*calls, vec![(EventKind::Join, vec!["a".to_string(), "b".to_string()])]);
        let reconciled = rec.reconciled.lock().unwrap();
        assert_eq!(reconciled.len(), 2);
        assert!(reconciled.iter().all(|m| m.status == MemberStatus::Alive));
    }

    #[test]
    fn failed_keeps_status_and_reap_forces_reaped() {
        let rec = Arc::new(Recorder::default());
        let r = router(&rec);
        r.route(MembershipEvent::Failed(vec![
            member("a").with_status(MemberStatus::Failed),
        ]));
        r.route(MembershipEvent::Reap(vec![
            member("a").with_status(MemberStatus::Failed),
        ]));

        let calls = rec.calls.lock().unwrap();
        assert_eq!(*calls, vec![(EventKind::Failed, vec!["a".to_string()])]);

        let statuses: Vec<_> = rec.reconciled.lock().unwrap().iter().map(|m| m.status).collect();
        assert_eq!(statuses, vec![MemberStatus::Failed, MemberStatus::Reaped]);
    }

    #[test]
    fn user_and_unknown_events_are_not_reconciled() {
        let rec = Arc::new(Recorder::default());
        let r = router(&rec);
        r.route(MembershipEvent::User(UserEvent::new("kappa-event:x", Bytes::from_static(b"1"))));
        r.route(MembershipEvent::Unknown("query".into()));

        assert_eq!(rec.users.lock().unwrap().len(), 1);
        assert!(rec.reconciled.lock().unwrap().is_empty());
        assert!(rec.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_handlers_are_skipped() {
        let rec = Arc::new(Recorder::default());
        let r = EventRouter::new().with_reconciler(rec.clone());
        r.route(MembershipEvent::Leave(vec![member("a")]));
        assert_eq!(rec.reconciled.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_routes_in_order_until_channel_closes() {
        let rec = Arc::new(Recorder::default());
        let (tx, rx) = mpsc::channel(8);
        let sup = Supervisor::new();

        tx.send(MembershipEvent::Join(vec![member("a")])).await.unwrap();
        tx.send(MembershipEvent::Update(vec![member("a")])).await.unwrap();
        tx.send(MembershipEvent::Leave(vec![member("a")])).await.unwrap();
        drop(tx);

        router(&rec).run(rx, sup).await.unwrap();

        let kinds: Vec<_> = rec.calls.lock().unwrap().iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec![EventKind::Join, EventKind::Update, EventKind::Leave]);
    }

    #[tokio::test]
    async fn run_stops_when_supervisor_dies() {
        let (_tx, rx) = mpsc::channel::<MembershipEvent>(8);
        let sup = Supervisor::new();
        let loop_sup = sup.clone();
        let handle = tokio::spawn(EventRouter::new().run(rx, loop_sup));

        sup.cancel(None);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exited")
            .unwrap()
            .unwrap();
    }
}
