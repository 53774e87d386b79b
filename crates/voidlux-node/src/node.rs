//! The node: construction root and control-plane surface.

use crate::NodeConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, error, info, warn};
use voidlux_agents::{AgentBridge, AgentRegistry, NullBridge};
use voidlux_consensus::{
    AcceptAll, ConsensusEngine, Elector, PartitionDetector, ReadError,
};
use voidlux_core::{
    Agent, AgentId, ConsensusLogEntry, NodeId, NodeRole, ProposalId, Result, SwarmEvent, Task,
    TaskId, UpgradeRecord,
};
use voidlux_discovery::{Dht, PeerObserver, TopologyView, UdpConfig, UdpDiscovery};
use voidlux_gossip::{GossipEngine, LamportClock};
use voidlux_mesh::{Connection, MeshConfig, MeshHandler, MeshServer, PeerManager};
use voidlux_storage::{ConsensusStore, SwarmStore};
use voidlux_tasks::{Dispatcher, QueueClaimResolver, TaskQueue};
use voidlux_upgrade::{CommitSwitcher, NullSwitcher, UpgradeConfig, UpgradeCoordinator};
use voidlux_wire::{Hello, Message};

/// A running VoidLux node.
pub struct Node {
    config: NodeConfig,
    node_id: NodeId,
    p2p_addr: SocketAddr,
    store: Arc<SwarmStore>,
    clock: Arc<LamportClock>,
    mesh: Arc<MeshServer>,
    peers: Arc<PeerManager>,
    dht: Arc<Dht>,
    gossip: Arc<GossipEngine>,
    elector: Arc<Elector>,
    consensus: Arc<ConsensusEngine>,
    partition: Arc<PartitionDetector>,
    queue: Arc<TaskQueue>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<AgentRegistry>,
    upgrade: Arc<UpgradeCoordinator>,
    events_tx: broadcast::Sender<SwarmEvent>,
    shutdown_tx: watch::Sender<bool>,
}

impl Node {
    /// Builds and starts a node: opens storage, binds the mesh, wires
    /// every component, recovers orphans, dials the seeds, and spawns
    /// the background loops.
    pub async fn start(config: NodeConfig) -> anyhow::Result<Arc<Self>> {
        Self::start_with(config, Arc::new(NullBridge), Arc::new(NullSwitcher::new("dev"))).await
    }

    /// As [`Node::start`], with explicit bridge and switcher
    /// implementations (the production launcher provides real ones).
    pub async fn start_with(
        config: NodeConfig,
        bridge: Arc<dyn AgentBridge>,
        switcher: Arc<dyn CommitSwitcher>,
    ) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;

        let store = Arc::new(SwarmStore::open(
            config
                .data_dir
                .join(format!("swarm-{}.db", config.p2p_port)),
        )?);
        let node_id = store.node_id()?;
        let clock = Arc::new(LamportClock::new(store.lamport_clock()?));

        let consensus_store = Arc::new(ConsensusStore::open(
            config
                .data_dir
                .join(format!("consensus-{}.db", node_id.to_hex())),
        )?);

        info!(
            node_id = %node_id.short(),
            role = %config.role,
            "starting node"
        );

        let (events_tx, _) = broadcast::channel(1024);
        let (shutdown_tx, _) = watch::channel(false);

        let listen_addr: SocketAddr =
            format!("{}:{}", config.listen_host, config.p2p_port).parse()?;
        let mut mesh_config = MeshConfig::new(node_id, config.role, listen_addr);
        mesh_config.http_port = config.http_port;
        mesh_config.auth_secret = config.auth_secret.clone();
        let mesh = MeshServer::new(mesh_config);

        let peers = Arc::new(PeerManager::new(node_id));
        let dht = Dht::new(node_id, config.p2p_port);

        let gossip = GossipEngine::new(
            node_id,
            Arc::clone(&clock),
            Arc::clone(&mesh),
            Arc::clone(&store),
            events_tx.clone(),
        );

        let partition = PartitionDetector::new(Arc::clone(&peers), config.initial_cluster_size());

        let elector_log_store = Arc::clone(&consensus_store);
        let elector = Elector::new(
            node_id,
            config.election.clone(),
            Arc::clone(&mesh),
            Arc::clone(&clock),
            Box::new(move || elector_log_store.last_index().unwrap_or(0)),
        );

        let consensus = ConsensusEngine::new(
            node_id,
            Arc::clone(&mesh),
            Arc::clone(&clock),
            Arc::clone(&consensus_store),
            Arc::clone(&elector),
            Arc::clone(&partition),
            Arc::new(AcceptAll),
        );

        let wake = Arc::new(Notify::new());
        let queue = TaskQueue::new(
            node_id,
            Arc::clone(&store),
            Arc::clone(&gossip),
            Arc::clone(&wake),
        );
        let resolver = QueueClaimResolver::new(node_id, Arc::clone(&store));
        gossip.set_claim_resolver(Arc::clone(&resolver) as Arc<dyn voidlux_gossip::ClaimResolver>);

        let dispatcher = Dispatcher::new(
            node_id,
            Arc::clone(&store),
            Arc::clone(&mesh),
            Arc::clone(&elector),
            Arc::clone(&partition),
            Arc::clone(&wake),
        );

        let registry = AgentRegistry::new(
            node_id,
            Arc::clone(&store),
            Arc::clone(&gossip),
            Arc::clone(&queue),
            Arc::clone(&dispatcher),
            bridge,
        );

        // Losing a claim race frees the local agent.
        let loss_registry = Arc::clone(&registry);
        resolver.set_local_loss_hook(Box::new(move |_task, agent_id| {
            let registry = Arc::clone(&loss_registry);
            tokio::spawn(async move {
                if let Err(e) = registry.release_after_lost_claim(&agent_id).await {
                    warn!(error = %e, "failed to release agent after lost claim");
                }
            });
        }));

        let upgrade = UpgradeCoordinator::new(
            node_id,
            UpgradeConfig::default(),
            Arc::clone(&mesh),
            Arc::clone(&peers),
            Arc::clone(&consensus_store),
            switcher,
        );

        let observer: Arc<dyn PeerObserver> = Arc::new(DialingObserver {
            peers: Arc::clone(&peers),
            mesh: Arc::clone(&mesh),
        });

        let handler = Arc::new(SwarmHandler {
            peers: Arc::clone(&peers),
            dht: Arc::clone(&dht),
            gossip: Arc::clone(&gossip),
            consensus: Arc::clone(&consensus),
            elector: Arc::clone(&elector),
            registry: Arc::clone(&registry),
            upgrade: Arc::clone(&upgrade),
            dispatcher: Arc::clone(&dispatcher),
            observer: Arc::clone(&observer),
            events_tx: events_tx.clone(),
        });
        mesh.set_handler(handler);

        let p2p_addr = mesh.start().await?;

        if config.role == NodeRole::Emperor {
            elector.assume_leadership();
        }

        // Orphan recovery before anything can dispatch.
        let recovered = queue.recover_orphans().await?;
        if recovered > 0 {
            info!(recovered, "orphaned tasks requeued");
        }

        let node = Arc::new(Self {
            config,
            node_id,
            p2p_addr,
            store,
            clock,
            mesh,
            peers,
            dht,
            gossip,
            elector,
            consensus,
            partition,
            queue,
            dispatcher,
            registry,
            upgrade,
            events_tx,
            shutdown_tx,
        });

        node.dial_seeds().await;
        node.spawn_loops(observer);

        Ok(node)
    }

    async fn dial_seeds(&self) {
        for seed in &self.config.seeds {
            let Some((host, port)) = seed.rsplit_once(':') else {
                continue;
            };
            let Ok(port) = port.parse::<u16>() else {
                continue;
            };
            self.peers.observe(host, port, None);
            if let Err(e) = self.mesh.connect_to(host, port).await {
                debug!(seed = %seed, error = %e, "seed dial failed, manager will retry");
            }
        }
    }

    fn spawn_loops(self: &Arc<Self>, observer: Arc<dyn PeerObserver>) {
        let sd = || self.shutdown_tx.subscribe();

        tokio::spawn(Arc::clone(&self.peers).run(Arc::clone(&self.mesh), sd()));
        tokio::spawn(Arc::clone(&self.dht).run(Arc::clone(&self.mesh), sd()));
        tokio::spawn(voidlux_discovery::run_pex(
            Arc::clone(&self.mesh),
            Arc::clone(&self.peers),
            sd(),
        ));
        tokio::spawn(Arc::clone(&self.gossip).run_anti_entropy(sd()));
        tokio::spawn(Arc::clone(&self.gossip).run_clock_persistence(sd()));
        tokio::spawn(Arc::clone(&self.elector).run(sd()));
        tokio::spawn(Arc::clone(&self.consensus).run(sd()));
        tokio::spawn(Arc::clone(&self.partition).run(sd()));
        tokio::spawn(Arc::clone(&self.dispatcher).run(sd()));
        tokio::spawn(Arc::clone(&self.registry).run(sd()));

        if self.config.udp_discovery {
            UdpDiscovery::new(UdpConfig {
                node_id: self.node_id,
                p2p_port: self.p2p_addr.port(),
                http_port: self.config.http_port,
                role: self.config.role,
                discovery_port: self.config.discovery_port,
            })
            .spawn(observer, sd());
        }

        // Local assignments bypass the network.
        let registry = Arc::clone(&self.registry);
        let mut local_assigns = self.dispatcher.take_local_assignments();
        let mut shutdown = sd();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    Some(msg) = local_assigns.recv() => {
                        if let Message::TaskAssign(assign) = msg {
                            if let Err(e) = registry.handle_assign(None, &assign).await {
                                warn!(error = %e, "local assignment failed");
                            }
                        }
                    }
                }
            }
        });

        // Leader changes feed the registry, the event bus, and the
        // dispatcher.
        let registry = Arc::clone(&self.registry);
        let dispatcher = Arc::clone(&self.dispatcher);
        let events = self.events_tx.clone();
        let mut leader_watch = self.elector.watch_leader();
        let mut shutdown = sd();
        tokio::spawn(async move {
            // A leader seated before this task subscribed (emperor by
            // configuration) is already in the watch value.
            let info = *leader_watch.borrow_and_update();
            registry.set_recognized_leader(info.leader);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    changed = leader_watch.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let info = *leader_watch.borrow();
                        registry.set_recognized_leader(info.leader);
                        let _ = events.send(SwarmEvent::LeaderChanged {
                            leader: info.leader,
                            term: info.term,
                        });
                        dispatcher.trigger();
                    }
                }
            }
        });
    }

    // ---- identity & views ------------------------------------------

    /// This node's id.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The bound P2P address.
    #[must_use]
    pub fn p2p_addr(&self) -> SocketAddr {
        self.p2p_addr
    }

    /// The current leader view.
    #[must_use]
    pub fn leader(&self) -> voidlux_consensus::LeaderInfo {
        self.elector.leader()
    }

    /// True while this node holds the throne.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.elector.is_leader()
    }

    /// Online peer count.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.online_count()
    }

    /// True while this node can see a majority of the cluster.
    #[must_use]
    pub fn has_quorum(&self) -> bool {
        self.partition.has_quorum()
    }

    /// Topology snapshot for the dashboard.
    #[must_use]
    pub fn topology(&self) -> TopologyView {
        TopologyView::snapshot(self.node_id, self.config.role, &self.peers, &self.dht)
    }

    /// Subscribes to the event bus.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SwarmEvent> {
        self.events_tx.subscribe()
    }

    // ---- control-plane surface -------------------------------------

    /// Enqueues a task.
    pub async fn enqueue(&self, task: Task) -> Result<Task> {
        self.queue.enqueue(task).await
    }

    /// Claims a task for a local agent.
    pub async fn claim(&self, task_id: &TaskId, agent_id: &AgentId) -> Result<bool> {
        self.queue.claim(task_id, agent_id).await
    }

    /// Completes a task.
    pub async fn complete(&self, task_id: &TaskId, result: Option<&str>) -> Result<bool> {
        self.queue.complete(task_id, result).await
    }

    /// Fails a task.
    pub async fn fail(&self, task_id: &TaskId, reason: &str) -> Result<bool> {
        self.queue.fail(task_id, reason).await
    }

    /// Cancels a task.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<bool> {
        self.queue.cancel(task_id).await
    }

    /// Requeues a non-terminal task.
    pub async fn requeue(&self, task_id: &TaskId, reason: &str) -> Result<bool> {
        self.queue.requeue(task_id, reason).await
    }

    /// Fetches one task.
    pub fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        self.queue.get(task_id)
    }

    /// All tasks in the local replica.
    pub fn tasks(&self) -> Result<Vec<Task>> {
        self.queue.list()
    }

    /// All agents in the local replica.
    pub fn agents(&self) -> Result<Vec<Agent>> {
        Ok(self.store.list_agents()?)
    }

    /// Registers a locally-hosted agent.
    pub async fn register_agent(&self, agent: Agent) -> Result<Agent> {
        self.registry.register(agent).await
    }

    /// Deregisters a locally-owned agent.
    pub async fn deregister_agent(&self, agent_id: &AgentId) -> Result<bool> {
        self.registry.deregister(agent_id).await
    }

    /// Reports an agent's task outcome (called by the session bridge).
    pub async fn finish_agent_task(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        result: std::result::Result<Option<String>, String>,
    ) -> Result<()> {
        self.registry.finish_task(agent_id, task_id, result).await
    }

    /// Starts a distributed decision.
    pub async fn propose(
        &self,
        operation: &str,
        payload: serde_json::Value,
    ) -> Result<ProposalId> {
        self.consensus.propose(operation, payload).await
    }

    /// Linearizable read of the consensus log (leader + lease only).
    pub fn read_consistent(&self) -> std::result::Result<Vec<ConsensusLogEntry>, ReadError> {
        self.consensus.read_consistent()
    }

    /// Stale read of the local consensus log.
    pub fn read_stale(&self) -> Result<Vec<ConsensusLogEntry>> {
        self.consensus.read_stale()
    }

    /// Drives a rolling upgrade (seneschal only).
    pub async fn start_upgrade(
        &self,
        target_commit: &str,
        initiated_by: &str,
    ) -> Result<UpgradeRecord> {
        if self.config.role != NodeRole::Seneschal {
            return Err(voidlux_core::Error::conflict(
                "upgrades run on the seneschal",
            ));
        }
        self.upgrade.start_upgrade(target_commit, initiated_by).await
    }

    /// Upgrade history.
    pub fn upgrade_history(&self) -> Result<Vec<UpgradeRecord>> {
        self.upgrade.history()
    }

    /// Stops every loop, flushes the clock, and closes the mesh.
    pub async fn shutdown(&self) {
        info!(node_id = %self.node_id.short(), "shutting down");
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.store.save_lamport_clock(self.clock.current()) {
            warn!(error = %e, "clock flush on shutdown failed");
        }
        self.mesh.shutdown().await;
    }
}

/// Discovery funnel that also dials fresh addresses right away instead
/// of waiting for the 15-second reconnect tick.
struct DialingObserver {
    peers: Arc<PeerManager>,
    mesh: Arc<MeshServer>,
}

impl PeerObserver for DialingObserver {
    fn observe(
        &self,
        host: &str,
        p2p_port: u16,
        node_id: Option<NodeId>,
        _role: Option<NodeRole>,
    ) {
        let fresh = self.peers.observe(host, p2p_port, node_id);
        let already_connected = node_id
            .map(|id| self.mesh.connection_for(&id).is_some())
            .unwrap_or(false);
        if fresh && !already_connected {
            let mesh = Arc::clone(&self.mesh);
            let host = host.to_string();
            tokio::spawn(async move {
                if let Err(e) = mesh.connect_to(&host, p2p_port).await {
                    debug!(host = %host, port = p2p_port, error = %e, "observed peer dial failed");
                }
            });
        }
    }
}

/// Routes mesh traffic to the owning component.
#[derive(Clone)]
struct SwarmHandler {
    peers: Arc<PeerManager>,
    dht: Arc<Dht>,
    gossip: Arc<GossipEngine>,
    consensus: Arc<ConsensusEngine>,
    elector: Arc<Elector>,
    registry: Arc<AgentRegistry>,
    upgrade: Arc<UpgradeCoordinator>,
    dispatcher: Arc<Dispatcher>,
    observer: Arc<dyn PeerObserver>,
    events_tx: broadcast::Sender<SwarmEvent>,
}

impl SwarmHandler {
    async fn dispatch(self, conn: Arc<Connection>, msg: Message) {
        match &msg {
            // Gossip + pull sync.
            Message::TaskCreate(_)
            | Message::TaskClaim(_)
            | Message::TaskUpdate(_)
            | Message::TaskComplete(_)
            | Message::TaskFail(_)
            | Message::TaskCancel(_)
            | Message::TaskSyncReq(_)
            | Message::TaskSyncRsp(_)
            | Message::AgentRegister(_)
            | Message::AgentHeartbeat(_)
            | Message::AgentDeregister(_)
            | Message::AgentSyncReq(_)
            | Message::AgentSyncRsp(_) => {
                match self.gossip.handle_message(&conn, &msg).await {
                    Ok(_) => self.dispatcher.trigger(),
                    Err(e @ voidlux_core::Error::Storage(_)) => {
                        // Storage failures are fatal: abort so the
                        // supervisor restarts us with intact files.
                        error!(error = %e, "fatal storage error in gossip apply");
                        std::process::exit(1);
                    }
                    Err(e) => warn!(error = %e, "gossip apply failed"),
                }
            }

            Message::TaskAssign(assign) => {
                if let Err(e) = self.registry.handle_assign(conn.node_id(), assign).await {
                    warn!(error = %e, "assignment handling failed");
                }
            }

            // Election.
            Message::EmperorHeartbeat(hb) => self.elector.on_heartbeat(hb).await,
            Message::ElectionStart(start) => self.elector.on_election_start(start).await,
            Message::ElectionVictory(victory) => self.elector.on_victory(victory),
            Message::CensusRequest(_) => {
                if let Err(e) = self.registry.announce_census().await {
                    warn!(error = %e, "census announcement failed");
                }
            }

            // Consensus.
            Message::ConsensusPropose(propose) => {
                self.consensus.handle_propose(conn.remote_addr, propose).await;
            }
            Message::ConsensusVote(vote) => self.consensus.handle_vote(vote).await,
            Message::ConsensusCommit(commit) => {
                self.consensus.handle_commit(conn.remote_addr, commit).await;
            }
            Message::ConsensusAbort(abort) => self.consensus.handle_abort(abort),
            Message::ConsensusSyncReq(req) => self.consensus.handle_sync_req(&conn, req).await,
            Message::ConsensusSyncRsp(rsp) => self.consensus.handle_sync_rsp(rsp),

            // Discovery.
            Message::Pex(pex) => {
                for entry in &pex.peers {
                    self.observer.observe(
                        &entry.host,
                        entry.p2p_port,
                        Some(entry.node_id),
                        Some(entry.role),
                    );
                }
            }
            Message::DhtLookup(lookup) => {
                let rsp = Message::DhtLookupRsp(self.dht.handle_lookup(lookup));
                if let Err(e) = conn.send(&rsp).await {
                    debug!(error = %e, "dht lookup response failed");
                }
            }
            Message::DhtLookupRsp(rsp) => self.dht.handle_lookup_rsp(rsp, &self.observer),
            Message::DhtAnnounce(announce) => {
                self.dht
                    .handle_announce(announce, &conn.remote_addr.ip().to_string(), &self.observer);
            }

            // Upgrade.
            Message::UpgradeRequest(req) => self.upgrade.handle_request(req).await,
            Message::UpgradeStatus(report) => self.upgrade.handle_status(report),

            // Handled inside the mesh; never routed here.
            Message::Hello(_)
            | Message::Ping(_)
            | Message::Pong(_)
            | Message::AuthChallenge(_)
            | Message::AuthResponse(_)
            | Message::AuthReject(_) => {}
        }
    }
}

impl MeshHandler for SwarmHandler {
    fn on_peer_ready(&self, conn: Arc<Connection>, hello: Hello) {
        self.peers.peer_ready(&hello, conn.remote_addr);
        self.dht.record_peer(
            hello.node_id,
            &conn.remote_addr.ip().to_string(),
            hello.p2p_port,
        );
        let _ = self.events_tx.send(SwarmEvent::PeerConnected {
            node_id: hello.node_id,
        });

        // Eager convergence on every fresh connection.
        let gossip = Arc::clone(&self.gossip);
        let consensus = Arc::clone(&self.consensus);
        let peer = hello.node_id;
        tokio::spawn(async move {
            gossip.request_agent_sync(&conn).await;
            consensus.request_sync(&peer).await;
        });
    }

    fn on_message(&self, conn: Arc<Connection>, msg: Message) {
        if let Some(node_id) = conn.node_id() {
            self.peers.touch(&node_id);
        }
        // Handlers must return promptly; the work runs on its own task.
        tokio::spawn(self.clone().dispatch(conn, msg));
    }

    fn on_disconnect(&self, _addr: SocketAddr, node_id: Option<NodeId>) {
        if let Some(id) = node_id {
            self.peers.mark_offline(&id);
            let _ = self.events_tx.send(SwarmEvent::PeerDisconnected { node_id: id });
        }
    }

    fn on_latency(&self, node_id: NodeId, rtt_ms: f64) {
        self.peers.record_latency(&node_id, rtt_ms);
    }
}
