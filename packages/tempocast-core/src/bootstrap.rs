//! Service bootstrap and background task wiring.
//!
//! [`CoreServices`] is the dependency container shared by the coordinator
//! and endpoint paths: one disciplined clock, one session store, one
//! cluster state, one telemetry sink. `bootstrap_services` builds it from a
//! [`Config`]; `start_background_tasks` spawns the periodic drivers
//! (status broadcast, election ticks, scheduler, quality sampling, the
//! upstream link). Shutdown is a single cancellation token fanned out as
//! child tokens, so every driver stops within one of its own intervals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cluster::{candidate_score, ElectionAction, RebindPlanner};
use crate::clock::{LinkStats, SharedClock};
use crate::events::{ClusterEvent, EventEmitter};
use crate::protocol::{Envelope, Message, NodeRole, NodeStatusInfo};
use crate::protocol_constants::NODE_STATUS_INTERVAL_SECS;
use crate::renderer::{LogRenderer, Renderer};
use crate::scheduler::{FutureBuffer, NetworkQuality};
use crate::services::{CommandRouter, ConnectionBudget, SessionStore};
use crate::state::{ClusterState, Config};
use crate::telemetry::Telemetry;
use crate::utils::{monotonic_secs, now_millis, unix_secs};

/// Cadence of election engine ticks.
const ELECTION_TICK_MS: u64 = 200;

/// Shared dependency container for one node.
pub struct CoreServices {
    pub config: Config,
    /// The disciplined clock. Masters serve it; everyone else converges it.
    pub clock: SharedClock,
    /// Probe delivery counters for the upstream link.
    pub link_stats: Arc<LinkStats>,
    /// Attached sessions (coordinator roles; empty on pure endpoints).
    pub sessions: Arc<SessionStore>,
    /// Media-control validation and fan-out.
    pub router: Arc<CommandRouter>,
    /// Election and membership state.
    pub cluster: Arc<ClusterState>,
    /// Per-address session budget.
    pub budget: Arc<ConnectionBudget>,
    /// Telemetry counters (also the event emitter).
    pub telemetry: Arc<Telemetry>,
    /// Event sink shared by all services.
    pub emitter: Arc<dyn EventEmitter>,
    /// The future buffer; present on rendering endpoints only.
    pub buffer: Option<Arc<FutureBuffer>>,
    /// Failover planner for the upstream link.
    pub planner: Mutex<RebindPlanner>,
    /// node_id -> last known control address, learned from handshakes.
    pub addr_book: Mutex<HashMap<String, String>>,
    /// Outbound queue of the current upstream link, when connected.
    pub peer_outbound: RwLock<Option<mpsc::Sender<Envelope>>>,
    /// Per-node envelope sequence counter, shared with the probe driver.
    sequence: Arc<AtomicU64>,
    cancel: CancellationToken,
}

/// Builds the full service graph with the default (logging) renderer.
pub fn bootstrap_services(config: Config) -> Arc<CoreServices> {
    bootstrap_services_with_renderer(config, Arc::new(LogRenderer))
}

/// Builds the full service graph with an injected renderer backend.
pub fn bootstrap_services_with_renderer(
    config: Config,
    renderer: Arc<dyn Renderer>,
) -> Arc<CoreServices> {
    let clock = SharedClock::new();
    let telemetry = Arc::new(Telemetry::new());
    let emitter: Arc<dyn EventEmitter> = Arc::clone(&telemetry) as Arc<dyn EventEmitter>;
    let sessions = Arc::new(SessionStore::new());
    let router = Arc::new(CommandRouter::new(clock.clone(), Arc::clone(&sessions)));
    let cluster = Arc::new(ClusterState::new(&config));

    match config.role {
        NodeRole::Master => {
            // Anchor the shared timescale near Unix time; replicas and
            // clients converge to it through probes.
            clock.seed_epoch(unix_secs() - monotonic_secs());
            cluster.registry.promote_self(&config.node_id, 0);
            cluster.engine.lock().bootstrap_leader(monotonic_secs());
            log::info!("[Bootstrap] {} starting as master", config.node_id);
        }
        NodeRole::Replica => {
            log::info!("[Bootstrap] {} starting as replica", config.node_id);
        }
        NodeRole::Client => {
            log::info!("[Bootstrap] {} starting as endpoint", config.node_id);
        }
    }

    let buffer = if config.role == NodeRole::Client {
        Some(Arc::new(FutureBuffer::new(
            clock.clone(),
            renderer,
            Arc::clone(&emitter),
        )))
    } else {
        None
    };

    Arc::new(CoreServices {
        budget: Arc::new(ConnectionBudget::with_limit(config.max_sessions_per_addr)),
        config,
        clock,
        link_stats: Arc::new(LinkStats::new()),
        sessions,
        router,
        cluster,
        telemetry,
        emitter,
        buffer,
        planner: Mutex::new(RebindPlanner::new()),
        addr_book: Mutex::new(HashMap::new()),
        peer_outbound: RwLock::new(None),
        sequence: Arc::new(AtomicU64::new(0)),
        cancel: CancellationToken::new(),
    })
}

impl CoreServices {
    /// A child token tied to process shutdown.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Next per-node envelope sequence number.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// The shared sequence counter, for drivers that stamp their own
    /// envelopes.
    #[must_use]
    pub fn sequence_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.sequence)
    }

    /// Wraps a payload in this node's envelope.
    #[must_use]
    pub fn envelope(&self, body: Message) -> Envelope {
        Envelope::new(&self.config.node_id, self.next_sequence(), body)
    }

    /// This node's current health snapshot.
    #[must_use]
    pub fn own_status(&self) -> NodeStatusInfo {
        let rtt = self.clock.last_rtt();
        let loss = self.link_stats.loss_ratio();
        NodeStatusInfo {
            role: self.cluster.role(),
            connected_clients: self.sessions.client_count(),
            cpu: self.config.health.cpu,
            mem: self.config.health.mem,
            battery: self.config.health.battery,
            net_quality: NetworkQuality::from_metrics(rtt, loss).as_score(),
            avg_rtt: rtt,
            loss,
        }
    }

    /// This node's current candidate score.
    #[must_use]
    pub fn self_score(&self) -> f64 {
        candidate_score(&self.own_status())
    }

    /// Queues a message on the upstream link, or buffers it for replay
    /// after re-bind when no master is reachable.
    pub fn queue_upstream(&self, envelope: Envelope) {
        let sent = {
            let guard = self.peer_outbound.read();
            match guard.as_ref() {
                Some(tx) => tx.try_send(envelope.clone()).is_ok(),
                None => false,
            }
        };
        if !sent {
            self.planner.lock().buffer_command(envelope);
        }
    }

    /// Sends a message on the upstream link if one is connected.
    pub fn send_peer(&self, envelope: Envelope) {
        if let Some(tx) = self.peer_outbound.read().as_ref() {
            if tx.try_send(envelope).is_err() {
                log::warn!("[Bootstrap] Upstream link queue full, message dropped");
            }
        }
    }

    /// Broadcasts this node's `node_status` to every attached session and
    /// the upstream link.
    pub fn broadcast_status(&self) {
        let envelope = self.envelope(Message::NodeStatus(self.own_status()));
        self.sessions.fan_out(&envelope, NodeRole::Client, "");
        self.sessions.fan_out(&envelope, NodeRole::Replica, "");
        self.send_peer(envelope);
    }

    /// Executes election side effects produced by the engine.
    pub fn apply_election_actions(&self, actions: Vec<ElectionAction>) {
        for action in actions {
            match action {
                ElectionAction::BroadcastClaim {
                    election_id,
                    term,
                    score,
                    current_master,
                } => {
                    self.cluster.registry.clear_master(term);
                    self.emitter.emit_cluster(ClusterEvent::MasterLost {
                        last_master_id: current_master.clone(),
                        term,
                        timestamp: now_millis(),
                    });
                    let envelope = self.envelope(Message::MasterElection {
                        election_id,
                        candidate_score: score,
                        current_master,
                        term,
                    });
                    self.sessions.fan_out(&envelope, NodeRole::Replica, "");
                    self.send_peer(envelope);
                }
                ElectionAction::BecomeLeader { term } => {
                    *self.cluster.role.write() = NodeRole::Master;
                    self.cluster
                        .registry
                        .promote_self(&self.config.node_id, term);
                    self.emitter.emit_cluster(ClusterEvent::LeaderElected {
                        leader_id: self.config.node_id.clone(),
                        term,
                        timestamp: now_millis(),
                    });
                    self.emitter.emit_cluster(ClusterEvent::RoleChanged {
                        role: "master".to_string(),
                        term,
                        timestamp: now_millis(),
                    });
                    // Promotion is announced immediately, not on the next
                    // 2s status tick.
                    self.broadcast_status();
                }
                ElectionAction::StepDown { term } => {
                    if self.cluster.role() == NodeRole::Master {
                        *self.cluster.role.write() = NodeRole::Replica;
                    }
                    self.emitter.emit_cluster(ClusterEvent::RoleChanged {
                        role: "replica".to_string(),
                        term,
                        timestamp: now_millis(),
                    });
                }
            }
        }
    }

    /// Spawns the periodic drivers appropriate for this node's role.
    pub fn start_background_tasks(self: &Arc<Self>) {
        if let Some(buffer) = &self.buffer {
            tokio::spawn(Arc::clone(buffer).run(self.cancel_token()));
            tokio::spawn(
                Arc::clone(buffer)
                    .run_quality_sampler(Arc::clone(&self.link_stats), self.cancel_token()),
            );
        }

        tokio::spawn(Arc::clone(self).run_status_broadcaster(self.cancel_token()));

        if self.config.role != NodeRole::Client {
            tokio::spawn(Arc::clone(self).run_election_driver(self.cancel_token()));
        }

        if self.config.role == NodeRole::Client || !self.config.peers.is_empty() {
            tokio::spawn(crate::net::client::run_link(
                Arc::clone(self),
                self.cancel_token(),
            ));
        }

        log::info!("[Bootstrap] Background tasks started");
    }

    /// Broadcasts `node_status` every 2 s.
    async fn run_status_broadcaster(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(Duration::from_secs(NODE_STATUS_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.broadcast_status(),
            }
        }
    }

    /// Ticks the election engine and executes its actions.
    async fn run_election_driver(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(Duration::from_millis(ELECTION_TICK_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let score = self.self_score();
                    let actions = self.cluster.engine.lock().tick(score, monotonic_secs());
                    self.apply_election_actions(actions);
                }
            }
        }
    }

    /// Signals every background task and session to stop.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Shutting down");
        self.cancel.cancel();
        if let Some(buffer) = &self.buffer {
            buffer.cancel_all();
        }
    }
}
