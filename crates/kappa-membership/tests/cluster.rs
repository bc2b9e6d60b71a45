//! Wires the router, handlers and in-process gossip together the way a
//! server node does.

use std::sync::Arc;
use std::time::Duration;

use kappa_core::Supervisor;
use kappa_membership::{
    BootstrapCoordinator, EventRouter, GossipConfig, GossipHub, GossipProvider,
    LeaderGatedReconciler, LocalGossip, Member, MemberStatus, MergeValidator, NodeDirectory,
    NodeJoinHandler, NodeLeaveHandler, PrefixedUserEventHandler, SERVER_ROLE, UserEvent, tags,
};
use tokio::sync::mpsc;

struct TestNode {
    gossip: LocalGossip,
    directory: Arc<NodeDirectory>,
    bootstrap: Arc<BootstrapCoordinator>,
    reconciled: mpsc::Receiver<Member>,
    user_events: mpsc::Receiver<UserEvent>,
    sup: Supervisor,
}

fn spawn_node(hub: &GossipHub, name: &str, ip: &str, expect: usize) -> TestNode {
    let directory = Arc::new(NodeDirectory::new());
    let bootstrap = Arc::new(BootstrapCoordinator::new("local", expect));
    let (reconciler, reconciled) = LeaderGatedReconciler::channel(Arc::new(|| true), 64);
    let (user_tx, user_events) = mpsc::channel(16);

    let join = Arc::new(
        NodeJoinHandler::new(directory.clone(), "local").with_bootstrap(bootstrap.clone()),
    );
    let leave = Arc::new(NodeLeaveHandler::new(directory.clone()));
    let router = EventRouter::new()
        .with_node_joined(join.clone())
        .with_node_updated(join)
        .with_node_left(leave.clone())
        .with_node_failed(leave)
        .with_user_event(Arc::new(PrefixedUserEventHandler::new(user_tx)))
        .with_reconciler(Arc::new(reconciler));

    let (events_tx, events_rx) = mpsc::channel(64);
    let cfg = GossipConfig::new(name, ip.parse().unwrap(), 7946)
        .with_tags(
            [
                (tags::ROLE, SERVER_ROLE.to_string()),
                (tags::CLUSTER, "local".to_string()),
                (tags::PORT, "9022".to_string()),
                (tags::EXPECT, expect.to_string()),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
        )
        .with_validator(MergeValidator::new("local"));

    let sup = Supervisor::new();
    let loop_sup = sup.clone();
    sup.spawn(router.run(events_rx, loop_sup));

    TestNode {
        gossip: LocalGossip::new(hub.clone(), cfg, events_tx),
        directory,
        bootstrap,
        reconciled,
        user_events,
        sup,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn three_nodes_bootstrap_after_the_third_joins() {
    let hub = GossipHub::new();
    let a = spawn_node(&hub, "a", "10.0.0.1", 3);
    let b = spawn_node(&hub, "b", "10.0.0.2", 3);
    let c = spawn_node(&hub, "c", "10.0.0.3", 3);

    a.gossip.start().await.unwrap();
    b.gossip.start().await.unwrap();
    b.gossip.join(&["10.0.0.1:7946".into()]).await.unwrap();
    eventually(|| a.directory.len() == 2 && b.directory.len() == 2).await;
    assert!(!a.bootstrap.is_complete());

    c.gossip.start().await.unwrap();
    c.gossip.join(&["10.0.0.1:7946".into()]).await.unwrap();
    for node in [&a, &b, &c] {
        eventually(|| node.bootstrap.is_complete()).await;
        assert_eq!(node.directory.len(), 3);
    }

    let formed = a.bootstrap.subscribe().borrow().clone().unwrap();
    assert_eq!(formed.len(), 3);

    for node in [a, b, c] {
        node.sup.cancel(None);
        node.sup.wait().await.unwrap();
    }
}

#[tokio::test]
async fn departures_update_directory_and_reconcile() {
    let hub = GossipHub::new();
    let mut a = spawn_node(&hub, "a", "10.0.0.1", 0);
    let b = spawn_node(&hub, "b", "10.0.0.2", 0);
    let c = spawn_node(&hub, "c", "10.0.0.3", 0);
    for node in [&a, &b, &c] {
        node.gossip.start().await.unwrap();
    }
    b.gossip.join(&["a".into()]).await.unwrap();
    c.gossip.join(&["a".into()]).await.unwrap();
    eventually(|| a.directory.len() == 3).await;

    b.gossip.leave().await.unwrap();
    hub.fail_node("c").await.unwrap();
    hub.reap_node("c").await.unwrap();
    eventually(|| a.directory.len() == 1).await;

    let mut statuses = Vec::new();
    eventually(|| {
        while let Ok(member) = a.reconciled.try_recv() {
            statuses.push((member.name, member.status));
        }
        statuses.contains(&("c".to_string(), MemberStatus::Reaped))
    })
    .await;
    assert!(statuses.contains(&("b".to_string(), MemberStatus::Left)));
    assert!(statuses.contains(&("c".to_string(), MemberStatus::Failed)));
}

#[tokio::test]
async fn prefixed_user_events_reach_the_application() {
    let hub = GossipHub::new();
    let mut a = spawn_node(&hub, "a", "10.0.0.1", 0);
    a.gossip.start().await.unwrap();

    a.gossip
        .user_event("kappa-event:deploy", "v2".into())
        .await
        .unwrap();
    a.gossip.user_event("other", "x".into()).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), a.user_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.name, "deploy");
    assert_eq!(&event.payload[..], b"v2");
}
