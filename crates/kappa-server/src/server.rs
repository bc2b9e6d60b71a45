//! The Kappa server node.
//!
//! Assembles the transport server, the gossip overlay and the membership
//! pipeline behind one start/stop lifecycle:
//!
//! ```text
//! start: transport ─▶ event loop ─▶ gossip ─▶ join(existing_nodes)
//! stop:  transport ─▶ gossip leave ─▶ gossip shutdown ─▶ event loop
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{info, warn};

use kappa_core::Supervisor;
use kappa_membership::{
    BootstrapCoordinator, EventRouter, GossipConfig, GossipHub, GossipProvider, LeaderCheck,
    LeaderGatedReconciler, LocalGossip, Member, MembershipEvent, MergeValidator, NodeDirectory,
    NodeJoinHandler, NodeLeaveHandler, PrefixedUserEventHandler, SERVER_ROLE, UserEvent,
    event_name, tags,
};
use kappa_transport::{
    Authenticators, HandlerRegistry, HostIdentity, TransportConfig, TransportServer,
};

use crate::auth::{AuthorizedKeys, auth_log};
use crate::config::ServerConfig;
use crate::handlers::{CLIENT_CHANNEL, EchoHandler};

/// Builds the gossip provider for a node from its gossip settings and the
/// sender its events must be delivered on.
pub type GossipFactory =
    Box<dyn FnOnce(GossipConfig, mpsc::Sender<MembershipEvent>) -> Arc<dyn GossipProvider> + Send>;

pub struct ServerBuilder {
    config: ServerConfig,
    identity: Option<HostIdentity>,
    authenticators: Option<Authenticators>,
    registry: Option<HandlerRegistry>,
    gossip: Option<GossipFactory>,
    is_leader: Option<LeaderCheck>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            identity: None,
            authenticators: None,
            registry: None,
            gossip: None,
            is_leader: None,
        }
    }

    /// Host identity; otherwise loaded from `host_cert`/`host_key`, or
    /// generated.
    pub fn with_identity(mut self, identity: HostIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Authenticators; otherwise built from the `authorized_keys` file.
    pub fn with_authenticators(mut self, authenticators: Authenticators) -> Self {
        self.authenticators = Some(authenticators);
        self
    }

    /// Channel handlers; otherwise echo on `kappa-client`.
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_gossip(mut self, factory: GossipFactory) -> Self {
        self.gossip = Some(factory);
        self
    }

    /// Use an in-process overlay shared with other nodes on `hub`.
    pub fn with_gossip_hub(self, hub: GossipHub) -> Self {
        self.with_gossip(Box::new(move |cfg, events| {
            Arc::new(LocalGossip::new(hub, cfg, events)) as Arc<dyn GossipProvider>
        }))
    }

    /// Leadership predicate gating reconciliation; defaults to always true.
    pub fn with_leader_check(mut self, is_leader: LeaderCheck) -> Self {
        self.is_leader = Some(is_leader);
        self
    }

    pub fn build(self) -> anyhow::Result<Server> {
        let config = self.config;
        config.validate()?;

        let identity = match (self.identity, &config.host_cert, &config.host_key) {
            (Some(identity), _, _) => identity,
            (None, Some(cert), Some(key)) => HostIdentity::load(cert, key)
                .with_context(|| format!("load host identity from {}", cert.display()))?,
            _ => HostIdentity::generate(&[config.node_name.clone(), "localhost".to_string()])?,
        };
        let host_fingerprint = identity.fingerprint();

        let authenticators = match (self.authenticators, &config.authorized_keys) {
            (Some(auths), _) => auths,
            (None, Some(path)) => {
                let keys = AuthorizedKeys::load(path)?;
                info!(path = %path.display(), users = keys.users(), "authorized keys loaded");
                Authenticators::new()
                    .with_public_key(keys)
                    .with_auth_log(auth_log())
            }
            (None, None) => anyhow::bail!("no authenticators configured and no authorized_keys file"),
        };

        let registry = self.registry.unwrap_or_else(|| {
            HandlerRegistry::builder()
                .handler(CLIENT_CHANNEL, EchoHandler)
                .build()
        });

        let transport = TransportServer::configure(
            TransportConfig::new(config.bind_address.clone(), identity, authenticators, registry)
                .with_accept_deadline(config.accept_deadline()),
        )?;
        let transport_addr = transport.local_addr();

        let directory = Arc::new(NodeDirectory::new());
        let bootstrap = Arc::new(BootstrapCoordinator::new(
            config.cluster_name.clone(),
            config.bootstrap_expect,
        ));
        let is_leader = self.is_leader.unwrap_or_else(|| Arc::new(|| true));
        let (reconciler, reconcile_rx) =
            LeaderGatedReconciler::channel(is_leader, config.reconcile_buffer);
        let (user_tx, user_rx) = mpsc::channel(config.user_event_buffer);

        let join = Arc::new(
            NodeJoinHandler::new(directory.clone(), config.cluster_name.clone())
                .with_bootstrap(bootstrap.clone()),
        );
        let leave = Arc::new(NodeLeaveHandler::new(directory.clone()));
        let router = EventRouter::new()
            .with_node_joined(join.clone())
            .with_node_updated(join)
            .with_node_left(leave.clone())
            .with_node_failed(leave)
            .with_user_event(Arc::new(PrefixedUserEventHandler::new(user_tx)))
            .with_reconciler(Arc::new(reconciler));

        let (events_tx, events_rx) = mpsc::channel(config.event_buffer);
        let gossip_config = GossipConfig::new(
            config.node_name.clone(),
            config.gossip.bind_addr,
            config.gossip.bind_port,
        )
        .with_advertise(config.gossip.advertise_addr, config.gossip.advertise_port)
        .with_tags(node_tags(&config, transport_addr.port()))
        .with_validator(MergeValidator::new(config.cluster_name.clone()));

        let factory: GossipFactory = match self.gossip {
            Some(factory) => factory,
            None => Box::new(standalone_gossip),
        };
        let gossip = factory(gossip_config, events_tx);

        Ok(Server {
            config,
            host_fingerprint,
            transport,
            gossip,
            pipeline: Mutex::new(Some((router, events_rx))),
            directory,
            bootstrap,
            reconcile_rx: Mutex::new(Some(reconcile_rx)),
            user_rx: Mutex::new(Some(user_rx)),
            sup: Supervisor::new(),
        })
    }
}

fn standalone_gossip(
    cfg: GossipConfig,
    events: mpsc::Sender<MembershipEvent>,
) -> Arc<dyn GossipProvider> {
    Arc::new(LocalGossip::new(GossipHub::new(), cfg, events))
}

/// Gossip tags describing this node.
pub fn node_tags(config: &ServerConfig, port: u16) -> HashMap<String, String> {
    let mut out = HashMap::from([
        (tags::ID.to_string(), config.node_name.clone()),
        (tags::ROLE.to_string(), SERVER_ROLE.to_string()),
        (tags::CLUSTER.to_string(), config.cluster_name.clone()),
        (tags::BUILD.to_string(), config.build.clone()),
        (tags::PORT.to_string(), port.to_string()),
    ]);
    if config.bootstrap {
        out.insert(tags::BOOTSTRAP.to_string(), "1".to_string());
    }
    if config.bootstrap_expect != 0 {
        out.insert(tags::EXPECT.to_string(), config.bootstrap_expect.to_string());
    }
    if let Some(dc) = &config.datacenter {
        out.insert(tags::DATACENTER.to_string(), dc.clone());
    }
    if let Some(service) = &config.service {
        out.insert(tags::SERVICE.to_string(), service.clone());
    }
    out
}

type Pipeline = (EventRouter, mpsc::Receiver<MembershipEvent>);

pub struct Server {
    config: ServerConfig,
    host_fingerprint: String,
    transport: TransportServer,
    gossip: Arc<dyn GossipProvider>,
    pipeline: Mutex<Option<Pipeline>>,
    directory: Arc<NodeDirectory>,
    bootstrap: Arc<BootstrapCoordinator>,
    reconcile_rx: Mutex<Option<mpsc::Receiver<Member>>>,
    user_rx: Mutex<Option<mpsc::Receiver<UserEvent>>>,
    sup: Supervisor,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    /// Start serving and join the cluster.
    ///
    /// A failed join is fatal unless this node bootstraps the cluster
    /// itself.
    pub async fn start(&self) -> anyhow::Result<()> {
        let (router, events) = self
            .pipeline
            .lock()
            .expect("pipeline lock")
            .take()
            .context("server already started")?;

        self.transport.start()?;
        let loop_sup = self.sup.clone();
        self.sup.spawn(router.run(events, loop_sup));
        self.gossip.start().await?;

        info!(
            node = %self.config.node_name,
            cluster = %self.config.cluster_name,
            addr = %self.local_addr(),
            "kappa server started"
        );

        if self.config.existing_nodes.is_empty() {
            return Ok(());
        }
        match self.gossip.join(&self.config.existing_nodes).await {
            Ok(reached) => {
                info!(reached, seeds = ?self.config.existing_nodes, "joined existing nodes");
                Ok(())
            }
            Err(err) if self.config.bootstrap => {
                warn!(error = %err, "failed to join existing nodes, continuing in bootstrap mode");
                Ok(())
            }
            Err(err) => Err(anyhow::Error::new(err).context("join existing nodes")),
        }
    }

    /// Stop serving, leave the cluster, and wait for every task.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let transport = self.transport.stop().await;
        if let Err(err) = self.gossip.leave().await {
            warn!(error = %err, "gossip leave failed");
        }
        if let Err(err) = self.gossip.shutdown().await {
            warn!(error = %err, "gossip shutdown failed");
        }
        self.sup.cancel(None);
        let pipeline = self.sup.wait().await;
        info!(node = %self.config.node_name, "kappa server stopped");

        transport.context("transport server")?;
        pipeline.context("membership event loop")?;
        Ok(())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Transport listener address.
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// SHA-256 fingerprint clients pin.
    pub fn host_fingerprint(&self) -> &str {
        &self.host_fingerprint
    }

    pub fn directory(&self) -> Arc<NodeDirectory> {
        self.directory.clone()
    }

    pub fn bootstrap(&self) -> Arc<BootstrapCoordinator> {
        self.bootstrap.clone()
    }

    pub fn members(&self) -> Vec<Member> {
        self.gossip.members()
    }

    pub fn local_member(&self) -> Member {
        self.gossip.local_member()
    }

    /// Join more gossip seeds; returns how many were reached.
    pub async fn join(&self, seeds: &[String]) -> anyhow::Result<usize> {
        Ok(self.gossip.join(seeds).await?)
    }

    /// Broadcast an application event to the cluster.
    pub async fn user_event(&self, name: &str, payload: Bytes) -> anyhow::Result<()> {
        Ok(self.gossip.user_event(&event_name(name), payload).await?)
    }

    /// Members the leader should reconcile. Can be taken once.
    pub fn take_reconcile_stream(&self) -> Option<mpsc::Receiver<Member>> {
        self.reconcile_rx.lock().expect("reconcile lock").take()
    }

    /// Application user events, prefix stripped. Can be taken once.
    pub fn take_user_events(&self) -> Option<mpsc::Receiver<UserEvent>> {
        self.user_rx.lock().expect("user event lock").take()
    }
}
