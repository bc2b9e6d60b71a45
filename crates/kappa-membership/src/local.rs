//! In-process gossip overlay.
//!
//! A [`GossipHub`] stands in for the network: every [`LocalGossip`] created
//! against the same hub can see the others. Nodes start in a pool of their
//! own and pools merge when one node joins a member of another, with the
//! same event semantics a real overlay produces. Events are computed under
//! the hub lock and delivered after it is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::error::{MembershipError, MembershipResult};
use crate::event::{MembershipEvent, UserEvent};
use crate::gossip::{GossipConfig, GossipProvider};
use crate::types::{Member, MemberStatus};
use crate::validate::MergeValidator;

type Outbox = Vec<(mpsc::Sender<MembershipEvent>, MembershipEvent)>;

struct HubNode {
    member: Member,
    pool: u64,
    events: mpsc::Sender<MembershipEvent>,
    validator: Option<MergeValidator>,
}

impl HubNode {
    fn alive(&self) -> bool {
        self.member.status == MemberStatus::Alive
    }
}

#[derive(Default)]
struct HubState {
    nodes: HashMap<String, HubNode>,
    next_pool: u64,
}

impl HubState {
    fn pool_of(&self, name: &str) -> Option<u64> {
        self.nodes.get(name).map(|n| n.pool)
    }

    fn pool_members(&self, pool: u64) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .nodes
            .values()
            .filter(|n| n.pool == pool)
            .map(|n| n.member.clone())
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    fn alive_in_pool(&self, pool: u64) -> Vec<Member> {
        self.pool_members(pool)
            .into_iter()
            .filter(|m| m.status == MemberStatus::Alive)
            .collect()
    }

    /// Queue `event` for every alive node of `pool`, optionally skipping one.
    fn broadcast(&self, out: &mut Outbox, pool: u64, skip: Option<&str>, event: &MembershipEvent) {
        for (name, node) in &self.nodes {
            if node.pool != pool || !node.alive() || skip == Some(name.as_str()) {
                continue;
            }
            out.push((node.events.clone(), event.clone()));
        }
    }

    fn find_seed(&self, seed: &str) -> Option<&HubNode> {
        self.nodes.values().find(|n| {
            n.alive() && (n.member.name == seed || n.member.gossip_addr().to_string() == seed)
        })
    }
}

async fn deliver(outbox: Outbox) {
    for (tx, event) in outbox {
        if tx.send(event).await.is_err() {
            trace!("membership event receiver dropped");
        }
    }
}

/// Shared in-process gossip medium.
#[derive(Clone, Default)]
pub struct GossipHub {
    state: Arc<Mutex<HubState>>,
}

impl GossipHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes the hub knows, in any state.
    pub fn len(&self) -> usize {
        self.state.lock().expect("hub lock").nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark `name` as failed, as failure detection would, and tell its pool.
    pub async fn fail_node(&self, name: &str) -> MembershipResult<()> {
        let outbox = {
            let mut state = self.state.lock().expect("hub lock");
            let node = state
                .nodes
                .get_mut(name)
                .ok_or_else(|| MembershipError::UnknownMember(name.to_string()))?;
            node.member.status = MemberStatus::Failed;
            let pool = node.pool;
            let event = MembershipEvent::Failed(vec![node.member.clone()]);

            let mut out = Outbox::new();
            state.broadcast(&mut out, pool, Some(name), &event);
            out
        };
        info!(member = %name, "member failed");
        deliver(outbox).await;
        Ok(())
    }

    /// Drop `name` from the member lists entirely and tell its pool.
    pub async fn reap_node(&self, name: &str) -> MembershipResult<()> {
        let outbox = {
            let mut state = self.state.lock().expect("hub lock");
            let node = state
                .nodes
                .remove(name)
                .ok_or_else(|| MembershipError::UnknownMember(name.to_string()))?;
            let event = MembershipEvent::Reap(vec![node.member]);

            let mut out = Outbox::new();
            state.broadcast(&mut out, node.pool, None, &event);
            out
        };
        info!(member = %name, "member reaped");
        deliver(outbox).await;
        Ok(())
    }
}

impl std::fmt::Debug for GossipHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipHub").field("nodes", &self.len()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// A [`GossipProvider`] backed by a [`GossipHub`].
pub struct LocalGossip {
    hub: GossipHub,
    config: GossipConfig,
    events: mpsc::Sender<MembershipEvent>,
    lifecycle: Mutex<Lifecycle>,
}

impl LocalGossip {
    pub fn new(
        hub: GossipHub,
        config: GossipConfig,
        events: mpsc::Sender<MembershipEvent>,
    ) -> Self {
        Self {
            hub,
            config,
            events,
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    fn name(&self) -> &str {
        &self.config.node_name
    }

    fn configured_member(&self) -> Member {
        let (addr, port) = self.config.advertised();
        Member::new(self.name(), addr, port).with_tags(self.config.tags.clone())
    }

    fn ensure_running(&self) -> MembershipResult<()> {
        match *self.lifecycle.lock().expect("lifecycle lock") {
            Lifecycle::Running => Ok(()),
            Lifecycle::Idle => Err(MembershipError::NotStarted),
            Lifecycle::Stopped => Err(MembershipError::Shutdown),
        }
    }

    /// Merge the local pool with the pool of `seed`.
    fn merge_with(&self, state: &mut HubState, seed: &str, out: &mut Outbox) -> MembershipResult<bool> {
        let Some(target) = state.find_seed(seed) else {
            debug!(%seed, "seed not reachable");
            return Ok(false);
        };
        let theirs = target.pool;
        let their_validator = target.validator.clone();
        let ours = state
            .pool_of(self.name())
            .ok_or_else(|| MembershipError::UnknownMember(self.name().to_string()))?;
        if ours == theirs {
            return Ok(true);
        }

        let local = state.alive_in_pool(ours);
        let remote = state.alive_in_pool(theirs);
        if let Some(validator) = &self.config.validator {
            validator.notify_merge(&remote)?;
        }
        if let Some(validator) = their_validator {
            validator.notify_merge(&local)?;
        }

        for node in state.nodes.values_mut() {
            if node.pool == ours {
                node.pool = theirs;
            }
        }
        for member in &local {
            if let Some(node) = state.nodes.get(&member.name) {
                out.push((node.events.clone(), MembershipEvent::Join(remote.clone())));
            }
        }
        for member in &remote {
            if let Some(node) = state.nodes.get(&member.name) {
                out.push((node.events.clone(), MembershipEvent::Join(local.clone())));
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl GossipProvider for LocalGossip {
    async fn start(&self) -> MembershipResult<()> {
        let outbox = {
            let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock");
            match *lifecycle {
                Lifecycle::Running => return Err(MembershipError::AlreadyStarted),
                Lifecycle::Stopped => return Err(MembershipError::Shutdown),
                Lifecycle::Idle => {}
            }

            let mut state = self.hub.state.lock().expect("hub lock");
            if state.nodes.get(self.name()).is_some_and(HubNode::alive) {
                return Err(MembershipError::NameConflict(self.name().to_string()));
            }
            let pool = state.next_pool;
            state.next_pool += 1;
            let member = self.configured_member();
            state.nodes.insert(
                self.name().to_string(),
                HubNode {
                    member: member.clone(),
                    pool,
                    events: self.events.clone(),
                    validator: self.config.validator.clone(),
                },
            );
            *lifecycle = Lifecycle::Running;
            vec![(self.events.clone(), MembershipEvent::Join(vec![member]))]
        };
        let (addr, port) = self.config.advertised();
        info!(node = %self.name(), %addr, port, "gossip started");
        deliver(outbox).await;
        Ok(())
    }

    async fn join(&self, seeds: &[String]) -> MembershipResult<usize> {
        self.ensure_running()?;
        let mut outbox = Outbox::new();
        let mut reached = 0;
        let result = {
            let mut state = self.hub.state.lock().expect("hub lock");
            let mut result = Ok(());
            for seed in seeds {
                match self.merge_with(&mut state, seed, &mut outbox) {
                    Ok(true) => reached += 1,
                    Ok(false) => {}
                    Err(err) => {
                        result = Err(err);
                        break;
                    }
                }
            }
            result
        };
        deliver(outbox).await;
        result?;

        if reached == 0 && !seeds.is_empty() {
            return Err(MembershipError::JoinFailed(format!(
                "none of {} seeds could be reached",
                seeds.len()
            )));
        }
        info!(node = %self.name(), reached, "joined cluster");
        Ok(reached)
    }

    async fn leave(&self) -> MembershipResult<()> {
        self.ensure_running()?;
        let outbox = {
            let mut state = self.hub.state.lock().expect("hub lock");
            let Some(node) = state.nodes.get_mut(self.name()) else {
                return Ok(());
            };
            node.member.status = MemberStatus::Left;
            let pool = node.pool;
            let event = MembershipEvent::Leave(vec![node.member.clone()]);
            let mut out = Outbox::new();
            state.broadcast(&mut out, pool, Some(self.name()), &event);
            out
        };
        info!(node = %self.name(), "left cluster");
        deliver(outbox).await;
        Ok(())
    }

    async fn shutdown(&self) -> MembershipResult<()> {
        let outbox = {
            let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock");
            if *lifecycle != Lifecycle::Running {
                *lifecycle = Lifecycle::Stopped;
                return Ok(());
            }
            *lifecycle = Lifecycle::Stopped;

            let mut state = self.hub.state.lock().expect("hub lock");
            let mut out = Outbox::new();
            if let Some(node) = state.nodes.get_mut(self.name())
                && node.member.status == MemberStatus::Alive
            {
                node.member.status = MemberStatus::Failed;
                let pool = node.pool;
                let event = MembershipEvent::Failed(vec![node.member.clone()]);
                state.broadcast(&mut out, pool, Some(self.name()), &event);
            }
            out
        };
        debug!(node = %self.name(), "gossip shut down");
        deliver(outbox).await;
        Ok(())
    }

    fn local_member(&self) -> Member {
        let state = self.hub.state.lock().expect("hub lock");
        state
            .nodes
            .get(self.name())
            .map(|n| n.member.clone())
            .unwrap_or_else(|| self.configured_member())
    }

    fn members(&self) -> Vec<Member> {
        let state = self.hub.state.lock().expect("hub lock");
        match state.pool_of(self.name()) {
            Some(pool) => state.pool_members(pool),
            None => vec![self.configured_member()],
        }
    }

    async fn set_tags(&self, tags: HashMap<String, String>) -> MembershipResult<()> {
        self.ensure_running()?;
        let outbox = {
            let mut state = self.hub.state.lock().expect("hub lock");
            let node = state
                .nodes
                .get_mut(self.name())
                .ok_or_else(|| MembershipError::UnknownMember(self.name().to_string()))?;
            node.member.tags = tags;
            let pool = node.pool;
            let event = MembershipEvent::Update(vec![node.member.clone()]);
            let mut out = Outbox::new();
            state.broadcast(&mut out, pool, None, &event);
            out
        };
        deliver(outbox).await;
        Ok(())
    }

    async fn user_event(&self, name: &str, payload: Bytes) -> MembershipResult<()> {
        self.ensure_running()?;
        let outbox = {
            let state = self.hub.state.lock().expect("hub lock");
            let pool = state
                .pool_of(self.name())
                .ok_or_else(|| MembershipError::UnknownMember(self.name().to_string()))?;
            let event = MembershipEvent::User(UserEvent::new(name, payload));
            let mut out = Outbox::new();
            state.broadcast(&mut out, pool, None, &event);
            out
        };
        deliver(outbox).await;
        Ok(())
    }
}
