//! Leader-gated reconciliation.
//!
//! Only the leader forwards membership changes to the consensus layer.
//! Forwarding never blocks the event loop: when the queue is full the
//! update is dropped.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

use crate::router::Reconciler;
use crate::types::Member;

/// Answers "is this node the current leader?".
pub type LeaderCheck = Arc<dyn Fn() -> bool + Send + Sync>;

pub struct LeaderGatedReconciler {
    is_leader: LeaderCheck,
    tx: mpsc::Sender<Member>,
}

impl LeaderGatedReconciler {
    pub fn new(is_leader: LeaderCheck, tx: mpsc::Sender<Member>) -> Self {
        Self { is_leader, tx }
    }

    /// Build a reconciler together with the receiving end of a queue of
    /// `capacity` requests.
    pub fn channel(is_leader: LeaderCheck, capacity: usize) -> (Self, mpsc::Receiver<Member>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(is_leader, tx), rx)
    }
}

impl Reconciler for LeaderGatedReconciler {
    fn reconcile(&self, member: Member) {
        if !(self.is_leader)() {
            return;
        }
        match self.tx.try_send(member) {
            Ok(()) => {}
            Err(TrySendError::Full(member)) => {
                trace!(member = %member.name, status = %member.status, "reconcile queue full, update dropped");
            }
            Err(TrySendError::Closed(member)) => {
                debug!(member = %member.name, "reconcile queue closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemberStatus;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn member(name: &str) -> Member {
        Member::new(name, "10.0.0.1".parse().unwrap(), 7946)
    }

    #[test]
    fn follower_enqueues_nothing() {
        let (rec, mut rx) = LeaderGatedReconciler::channel(Arc::new(|| false), 4);
        rec.reconcile(member("a"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn leader_enqueues_exactly_once() {
        let (rec, mut rx) = LeaderGatedReconciler::channel(Arc::new(|| true), 4);
        rec.reconcile(member("a").with_status(MemberStatus::Failed));

        let got = rx.try_recv().unwrap();
        assert_eq!(got.name, "a");
        assert_eq!(got.status, MemberStatus::Failed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (rec, mut rx) = LeaderGatedReconciler::channel(Arc::new(|| true), 1);
        rec.reconcile(member("a"));
        rec.reconcile(member("b"));

        assert_eq!(rx.try_recv().unwrap().name, "a");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_queue_is_tolerated() {
        let (rec, rx) = LeaderGatedReconciler::channel(Arc::new(|| true), 1);
        drop(rx);
        rec.reconcile(member("a"));
    }

    #[test]
    fn leadership_is_checked_per_call() {
        let leader = Arc::new(AtomicBool::new(false));
        let flag = leader.clone();
        let (rec, mut rx) =
            LeaderGatedReconciler::channel(Arc::new(move || flag.load(Ordering::SeqCst)), 4);

        rec.reconcile(member("a"));
        leader.store(true, Ordering::SeqCst);
        rec.reconcile(member("b"));

        assert_eq!(rx.try_recv().unwrap().name, "b");
        assert!(rx.try_recv().is_err());
    }
}
