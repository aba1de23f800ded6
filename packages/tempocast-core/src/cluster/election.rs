//! Coordinator election state machine.
//!
//! `FOLLOWER → CANDIDATE → LEADER` with a score-based decision instead of a
//! vote count: every node that times out on master silence broadcasts its
//! candidate score for the new term, gathers competing claims for a fixed
//! window, and the best score (ties to the lowest node id) promotes itself.
//! A higher term observed at any point demotes the node to follower.
//!
//! The engine is a pure state machine over `(input, now)`; the driver task
//! owns timers and I/O and executes the returned actions.

use uuid::Uuid;

use crate::protocol_constants::{ELECTION_GATHER_SECS, ELECTION_TIMEOUT_SECS};

/// Election timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct ElectionConfig {
    /// Master silence before a follower becomes a candidate, seconds.
    pub timeout: f64,
    /// Gather window for competing claims, seconds.
    pub gather: f64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            timeout: ELECTION_TIMEOUT_SECS,
            gather: ELECTION_GATHER_SECS,
        }
    }
}

/// Current role in the election state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionRole {
    Follower,
    Candidate,
    Leader,
}

/// Side effects the driver must perform.
#[derive(Debug, Clone, PartialEq)]
pub enum ElectionAction {
    /// Broadcast a `master_election` message for `term`.
    BroadcastClaim {
        election_id: String,
        term: u64,
        score: f64,
        current_master: Option<String>,
    },
    /// This node won: assume mastership and broadcast `node_status`
    /// with `role: master` immediately.
    BecomeLeader { term: u64 },
    /// A better candidate or higher term won; revert to follower duties.
    StepDown { term: u64 },
}

/// Best claim seen for the current term.
#[derive(Debug, Clone)]
struct Claim {
    score: f64,
    node_id: String,
}

impl Claim {
    /// Higher score wins; equal scores go to the lowest node id.
    fn beats(&self, other: &Claim) -> bool {
        match self.score.total_cmp(&other.score) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.node_id < other.node_id,
        }
    }
}

/// The election state machine for one node.
#[derive(Debug)]
pub struct ElectionEngine {
    node_id: String,
    config: ElectionConfig,
    role: ElectionRole,
    term: u64,
    current_master: Option<String>,
    last_master_seen: f64,
    gather_until: Option<f64>,
    best_claim: Option<Claim>,
}

impl ElectionEngine {
    /// Creates a follower that considers the master alive as of `now`.
    #[must_use]
    pub fn new(node_id: String, config: ElectionConfig, now: f64) -> Self {
        Self {
            node_id,
            config,
            role: ElectionRole::Follower,
            term: 0,
            current_master: None,
            last_master_seen: now,
            gather_until: None,
            best_claim: None,
        }
    }

    /// Seeds this node as the leader of term 0, for a node configured as
    /// the initial master. No broadcast is needed; its `node_status` does
    /// the announcing.
    pub fn bootstrap_leader(&mut self, now: f64) {
        self.role = ElectionRole::Leader;
        self.current_master = Some(self.node_id.clone());
        self.last_master_seen = now;
    }

    /// Current role.
    #[must_use]
    pub fn role(&self) -> ElectionRole {
        self.role
    }

    /// Current term.
    #[must_use]
    pub fn term(&self) -> u64 {
        self.term
    }

    /// Master this node currently follows, if any.
    #[must_use]
    pub fn current_master(&self) -> Option<&str> {
        self.current_master.as_deref()
    }

    /// Feeds evidence that `master_id` is alive and claiming mastership at
    /// `term` (a master heartbeat or `node_status{role: master}`).
    pub fn on_master_seen(&mut self, master_id: &str, term: u64, now: f64) -> Vec<ElectionAction> {
        if term < self.term {
            // Stale claim from a deposed master; ignore.
            return Vec::new();
        }

        let mut actions = Vec::new();
        if term > self.term || self.role != ElectionRole::Leader {
            if self.role == ElectionRole::Leader {
                log::warn!(
                    "[Election] Yielding to {master_id} at term {term} (was leader at {})",
                    self.term
                );
                actions.push(ElectionAction::StepDown { term });
            }
            self.role = ElectionRole::Follower;
            self.gather_until = None;
            self.best_claim = None;
            self.term = term;
            self.current_master = Some(master_id.to_string());
            self.last_master_seen = now;
        } else if self.role == ElectionRole::Leader && master_id == self.node_id {
            self.last_master_seen = now;
        }
        actions
    }

    /// Feeds a peer's `master_election` claim.
    pub fn on_claim(
        &mut self,
        from_node: &str,
        term: u64,
        score: f64,
        now: f64,
    ) -> Vec<ElectionAction> {
        if term > self.term {
            // Late to the party: adopt the term and become a follower. The
            // winner announces itself via node_status.
            let mut actions = Vec::new();
            if self.role == ElectionRole::Leader {
                actions.push(ElectionAction::StepDown { term });
            }
            self.term = term;
            self.role = ElectionRole::Follower;
            self.gather_until = None;
            self.best_claim = None;
            self.current_master = None;
            // Give the new term's winner a full timeout before re-electing.
            self.last_master_seen = now;
            return actions;
        }

        if term == self.term && self.role == ElectionRole::Candidate {
            let claim = Claim {
                score,
                node_id: from_node.to_string(),
            };
            let better = match &self.best_claim {
                Some(best) => claim.beats(best),
                None => true,
            };
            if better {
                self.best_claim = Some(claim);
            }
        }
        Vec::new()
    }

    /// Advances timers. `self_score` is this node's current candidate score.
    pub fn tick(&mut self, self_score: f64, now: f64) -> Vec<ElectionAction> {
        match self.role {
            ElectionRole::Follower => {
                if now - self.last_master_seen >= self.config.timeout {
                    self.start_election(self_score, now)
                } else {
                    Vec::new()
                }
            }
            ElectionRole::Candidate => {
                let deadline = self.gather_until.unwrap_or(now);
                if now < deadline {
                    return Vec::new();
                }
                self.gather_until = None;
                let own = Claim {
                    score: self_score,
                    node_id: self.node_id.clone(),
                };
                let won = match &self.best_claim {
                    Some(best) => !best.beats(&own),
                    None => true,
                };
                self.best_claim = None;
                if won {
                    log::info!(
                        "[Election] Won term {} with score {self_score:.3}",
                        self.term
                    );
                    self.role = ElectionRole::Leader;
                    self.current_master = Some(self.node_id.clone());
                    self.last_master_seen = now;
                    vec![ElectionAction::BecomeLeader { term: self.term }]
                } else {
                    log::info!(
                        "[Election] Lost term {} to {:?}",
                        self.term,
                        self.current_master
                    );
                    self.role = ElectionRole::Follower;
                    // The winner's node_status will arrive shortly; restart
                    // the silence timer rather than re-electing instantly.
                    self.last_master_seen = now;
                    vec![ElectionAction::StepDown { term: self.term }]
                }
            }
            ElectionRole::Leader => Vec::new(),
        }
    }

    /// Transitions to candidate and emits the claim broadcast.
    fn start_election(&mut self, self_score: f64, now: f64) -> Vec<ElectionAction> {
        self.term += 1;
        self.role = ElectionRole::Candidate;
        self.gather_until = Some(now + self.config.gather);
        self.best_claim = None;
        let election_id = Uuid::new_v4().to_string();
        log::warn!(
            "[Election] Master {:?} silent for {:.1}s; candidate at term {}",
            self.current_master,
            now - self.last_master_seen,
            self.term
        );
        let current_master = self.current_master.take();
        vec![ElectionAction::BroadcastClaim {
            election_id,
            term: self.term,
            score: self_score,
            current_master,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CFG: ElectionConfig = ElectionConfig {
        timeout: 3.0,
        gather: 0.5,
    };

    fn follower(id: &str, now: f64) -> ElectionEngine {
        ElectionEngine::new(id.to_string(), CFG, now)
    }

    #[test]
    fn quiet_master_keeps_followers_passive() {
        let mut engine = follower("b", 0.0);
        engine.on_master_seen("a", 1, 0.0);
        assert!(engine.tick(0.8, 2.9).is_empty());
        assert_eq!(engine.role(), ElectionRole::Follower);
    }

    #[test]
    fn silence_starts_an_election_at_next_term() {
        let mut engine = follower("b", 0.0);
        engine.on_master_seen("a", 1, 0.0);
        let actions = engine.tick(0.8, 3.0);
        assert_eq!(engine.role(), ElectionRole::Candidate);
        assert_eq!(engine.term(), 2);
        match &actions[..] {
            [ElectionAction::BroadcastClaim {
                term,
                score,
                current_master,
                ..
            }] => {
                assert_eq!(*term, 2);
                assert_eq!(*score, 0.8);
                assert_eq!(current_master.as_deref(), Some("a"));
            }
            other => panic!("expected broadcast, got {other:?}"),
        }
    }

    #[test]
    fn best_score_wins_the_gather() {
        // S4: A partitioned; B (0.8) and C (0.85) race at term 2.
        let mut b = follower("b", 0.0);
        let mut c = follower("c", 0.0);
        b.on_master_seen("a", 1, 0.0);
        c.on_master_seen("a", 1, 0.0);

        assert!(!b.tick(0.8, 3.0).is_empty());
        assert!(!c.tick(0.85, 3.0).is_empty());

        b.on_claim("c", 2, 0.85, 3.1);
        c.on_claim("b", 2, 0.8, 3.1);

        let b_actions = b.tick(0.8, 3.5);
        let c_actions = c.tick(0.85, 3.5);

        assert_eq!(c.role(), ElectionRole::Leader);
        assert!(matches!(c_actions[..], [ElectionAction::BecomeLeader { term: 2 }]));
        assert_eq!(b.role(), ElectionRole::Follower);
        assert!(matches!(b_actions[..], [ElectionAction::StepDown { term: 2 }]));
    }

    #[test]
    fn score_tie_breaks_to_lowest_node_id() {
        let mut a = follower("a", 0.0);
        let mut b = follower("b", 0.0);
        a.tick(0.7, 3.0);
        b.tick(0.7, 3.0);
        a.on_claim("b", 1, 0.7, 3.1);
        b.on_claim("a", 1, 0.7, 3.1);

        assert!(matches!(
            a.tick(0.7, 3.5)[..],
            [ElectionAction::BecomeLeader { .. }]
        ));
        assert_eq!(b.tick(0.7, 3.5), vec![ElectionAction::StepDown { term: 1 }]);
    }

    #[test]
    fn higher_term_demotes_a_leader() {
        let mut engine = follower("b", 0.0);
        engine.tick(0.9, 3.0);
        engine.tick(0.9, 3.6);
        assert_eq!(engine.role(), ElectionRole::Leader);

        let actions = engine.on_master_seen("c", 5, 4.0);
        assert_eq!(engine.role(), ElectionRole::Follower);
        assert_eq!(engine.term(), 5);
        assert_eq!(engine.current_master(), Some("c"));
        assert!(matches!(actions[..], [ElectionAction::StepDown { term: 5 }]));
    }

    #[test]
    fn stale_master_claim_is_ignored() {
        let mut engine = follower("b", 0.0);
        engine.on_master_seen("c", 5, 0.0);
        engine.on_master_seen("a", 2, 1.0);
        assert_eq!(engine.current_master(), Some("c"));
        assert_eq!(engine.term(), 5);
    }

    #[test]
    fn higher_term_claim_resets_a_candidate() {
        let mut engine = follower("b", 0.0);
        engine.tick(0.8, 3.0);
        assert_eq!(engine.role(), ElectionRole::Candidate);
        assert_eq!(engine.term(), 1);

        engine.on_claim("z", 7, 0.2, 3.1);
        assert_eq!(engine.role(), ElectionRole::Follower);
        assert_eq!(engine.term(), 7);

        // The new timeout starts from the claim; no instant re-election.
        assert!(engine.tick(0.8, 3.2).is_empty());
    }

    #[test]
    fn at_most_one_leader_per_term() {
        // Three-way race: exactly one BecomeLeader among equal terms.
        let ids = ["a", "b", "c"];
        let scores = [0.5, 0.9, 0.7];
        let mut engines: Vec<ElectionEngine> =
            ids.iter().map(|id| follower(*id, 0.0)).collect();

        for (i, engine) in engines.iter_mut().enumerate() {
            engine.tick(scores[i], 3.0);
        }
        for i in 0..3 {
            for j in 0..3 {
                if i != j {
                    let (from, term, score) = (ids[j], 1, scores[j]);
                    engines[i].on_claim(from, term, score, 3.1);
                }
            }
        }
        let mut leaders = 0;
        for (i, engine) in engines.iter_mut().enumerate() {
            let actions = engine.tick(scores[i], 3.5);
            if matches!(actions[..], [ElectionAction::BecomeLeader { .. }]) {
                leaders += 1;
            }
        }
        assert_eq!(leaders, 1);
        assert_eq!(engines[1].role(), ElectionRole::Leader);
    }
}
