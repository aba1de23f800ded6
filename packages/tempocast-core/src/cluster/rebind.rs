//! Client-side failover: re-binding to a new master.
//!
//! When the master becomes unreachable, a client buffers outbound commands,
//! probes the known replicas in order of their last-advertised score, and
//! resumes once a node answers as master with a term at least as new as the
//! last one seen. The disciplined clock is never reset across a re-bind -
//! the first probes to the new master converge the offset through the
//! normal EMA.

use std::collections::{HashMap, VecDeque};

use crate::protocol::{ClusterInfo, Envelope, NodeRole};

/// Upper bound on commands buffered while the master is unreachable.
const REBIND_BUFFER_CAPACITY: usize = 256;

/// Tracks replica candidates and buffers commands during failover.
#[derive(Debug)]
pub struct RebindPlanner {
    last_seen_term: u64,
    /// Replica ids in the order the master last advertised them.
    advertised_order: Vec<String>,
    /// Last directly-observed score per replica (from `node_status`).
    scores: HashMap<String, f64>,
    buffered: VecDeque<Envelope>,
    dropped: u64,
}

impl RebindPlanner {
    /// Creates an empty planner at term 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_seen_term: 0,
            advertised_order: Vec::new(),
            scores: HashMap::new(),
            buffered: VecDeque::new(),
            dropped: 0,
        }
    }

    /// The newest election term this client has observed.
    #[must_use]
    pub fn last_seen_term(&self) -> u64 {
        self.last_seen_term
    }

    /// Ingests the `cluster_info` block of a server `hello`.
    pub fn update_cluster_info(&mut self, info: &ClusterInfo) {
        self.last_seen_term = self.last_seen_term.max(info.term);
        self.advertised_order = info.replica_ids.clone();
    }

    /// Records a replica's advertised score from its `node_status`.
    pub fn note_status(&mut self, node_id: &str, role: NodeRole, score: f64) {
        if role == NodeRole::Replica {
            self.scores.insert(node_id.to_string(), score);
            if !self.advertised_order.iter().any(|id| id == node_id) {
                self.advertised_order.push(node_id.to_string());
            }
        }
    }

    /// Replica ids to probe, best last-advertised score first. Replicas
    /// without a directly-observed score keep their advertised order after
    /// the scored ones.
    #[must_use]
    pub fn probe_order(&self) -> Vec<String> {
        let mut order = self.advertised_order.clone();
        order.sort_by(|a, b| {
            let score_a = self.scores.get(a);
            let score_b = self.scores.get(b);
            match (score_a, score_b) {
                (Some(x), Some(y)) => y.total_cmp(x),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
        });
        order
    }

    /// Buffers a command while no master is reachable. The oldest command
    /// is dropped once the buffer is full.
    pub fn buffer_command(&mut self, envelope: Envelope) {
        if self.buffered.len() == REBIND_BUFFER_CAPACITY {
            self.buffered.pop_front();
            self.dropped += 1;
        }
        self.buffered.push_back(envelope);
    }

    /// Commands dropped due to buffer overflow during the outage.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Number of commands currently buffered.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Evaluates a probed node's answer. Accepts only a master whose term
    /// is at least as new as the last seen; on acceptance, returns the
    /// buffered commands for replay in order.
    pub fn try_accept(&mut self, role: NodeRole, term: u64) -> Option<Vec<Envelope>> {
        if role != NodeRole::Master || term < self.last_seen_term {
            return None;
        }
        self.last_seen_term = term;
        Some(self.buffered.drain(..).collect())
    }
}

impl Default for RebindPlanner {
    fn default() -> Self {
        Self::new()
    }
}
