//! Raft protocol state machine
//!
//! `RaftCore` is synchronous and transport-agnostic: it consumes RPCs and
//! responses, mutates term/vote/log state (persisting before it answers),
//! and queues role changes and committed entries for the async driver in
//! [`crate::node`] to publish.

use crate::error::ConsensusError;
use crate::log::ReplicationLog;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse,
};
use crate::storage::LogStorage;
use crate::types::{
    ApplyMsg, ConsensusStats, EntryPayload, HardState, LogEntry, NodeRole, RaftConfig, RoleChange,
    Snapshot,
};
use sequencer_types::NodeId;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Next message a leader owes a follower
#[derive(Debug, Clone)]
pub enum Outbound {
    Append(AppendEntriesRequest),
    Snapshot(InstallSnapshotRequest),
}

pub struct RaftCore {
    id: NodeId,
    /// Voting members other than this node
    peers: Vec<NodeId>,
    /// Non-voting replication targets
    learners: BTreeSet<NodeId>,
    max_entries_per_append: usize,

    role: NodeRole,
    current_term: u64,
    voted_for: Option<NodeId>,
    log: ReplicationLog,
    commit_index: u64,
    /// Highest index already handed to the state machine
    last_delivered: u64,
    leader_id: Option<NodeId>,
    last_heartbeat: Instant,
    /// Observers neither vote, start elections, nor accept AppendEntries
    participating: bool,
    /// A node that joined through sync replicates as a learner and never votes
    voter: bool,
    /// Install the next leader snapshot even if it is not ahead of the commit index
    awaiting_snapshot: bool,

    votes: HashSet<NodeId>,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    last_ack: HashMap<NodeId, Instant>,

    pending_snapshot: Option<Snapshot>,
    events: Vec<RoleChange>,
    stats: ConsensusStats,
}

impl RaftCore {
    /// Load persisted term, vote, log and snapshot. Always starts as Follower.
    pub fn new(config: &RaftConfig, storage: Arc<dyn LogStorage>) -> Result<Self, ConsensusError> {
        let (log, snapshot) = ReplicationLog::open(storage)?;
        let hard_state = log.storage().load_hard_state()?;
        let base = log.base_index();

        tracing::info!(
            "Node {} restored term {} (voted for {:?}), log {}..={}",
            config.node_id,
            hard_state.current_term,
            hard_state.voted_for,
            base,
            log.last_index()
        );

        Ok(Self {
            id: config.node_id,
            peers: config.peers.iter().copied().filter(|&p| p != config.node_id).collect(),
            learners: BTreeSet::new(),
            max_entries_per_append: config.max_entries_per_append.max(1),
            role: NodeRole::Follower,
            current_term: hard_state.current_term,
            voted_for: hard_state.voted_for,
            log,
            commit_index: base,
            last_delivered: base,
            leader_id: None,
            last_heartbeat: Instant::now(),
            participating: !config.join_as_observer,
            voter: !config.join_as_observer,
            awaiting_snapshot: false,
            votes: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            last_ack: HashMap::new(),
            pending_snapshot: snapshot,
            events: Vec::new(),
            stats: ConsensusStats::default(),
        })
    }

    // === Accessors ===

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn log(&self) -> &ReplicationLog {
        &self.log
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn is_participating(&self) -> bool {
        self.participating
    }

    pub fn is_voter(&self) -> bool {
        self.voter
    }

    /// Every node a leader replicates to
    pub fn replication_targets(&self) -> Vec<NodeId> {
        self.peers.iter().chain(self.learners.iter()).copied().collect()
    }

    pub fn is_learner(&self, node: NodeId) -> bool {
        self.learners.contains(&node)
    }

    pub fn match_index_of(&self, node: NodeId) -> u64 {
        self.match_index.get(&node).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> ConsensusStats {
        ConsensusStats {
            current_term: self.current_term,
            commit_index: self.commit_index,
            last_log_index: self.log.last_index(),
            ..self.stats.clone()
        }
    }

    /// Strict majority of voters including this node
    pub fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    // === Persistence helpers ===

    fn persist_hard_state(&self) -> Result<(), ConsensusError> {
        self.log.storage().save_hard_state(&HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        })?;
        Ok(())
    }

    /// Adopt `term` (if newer) and become Follower under `leader`
    fn step_down(&mut self, term: u64, leader: Option<NodeId>) -> Result<(), ConsensusError> {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.persist_hard_state()?;
        }
        let was = self.role;
        let old_leader = self.leader_id;
        self.role = NodeRole::Follower;
        self.leader_id = leader;
        self.votes.clear();

        if was != NodeRole::Follower || old_leader != leader {
            if was != NodeRole::Follower {
                tracing::info!(
                    "Node {} stepped down to follower (was {:?}, term {})",
                    self.id,
                    was,
                    self.current_term
                );
            }
            self.events.push(RoleChange::BecameFollower {
                term: self.current_term,
                leader_id: leader,
            });
        }
        Ok(())
    }

    // === Elections ===

    pub fn election_due(&self, now: Instant, timeout: Duration) -> bool {
        self.participating
            && self.voter
            && self.role != NodeRole::Leader
            && now.saturating_duration_since(self.last_heartbeat) >= timeout
    }

    /// A learner that has not heard from any leader within `timeout`
    pub fn leader_silent(&self, now: Instant, timeout: Duration) -> bool {
        self.participating
            && !self.voter
            && now.saturating_duration_since(self.last_heartbeat) >= timeout
    }

    pub fn reset_election_timer(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    /// Increment the term, vote for self and return the vote request to fan out.
    /// A single-node cluster becomes leader immediately.
    pub fn start_election(&mut self) -> Result<RequestVoteRequest, ConsensusError> {
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.persist_hard_state()?;

        self.role = NodeRole::Candidate;
        self.leader_id = None;
        self.votes.clear();
        self.votes.insert(self.id);
        self.last_heartbeat = Instant::now();
        self.stats.elections_started += 1;
        self.events.push(RoleChange::BecameCandidate {
            term: self.current_term,
        });
        tracing::info!("Node {} starting election for term {}", self.id, self.current_term);

        if self.votes.len() >= self.quorum() {
            self.become_leader()?;
        }

        Ok(RequestVoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        })
    }

    /// Candidate log at least as up to date as ours: `(lastTerm, lastIndex)` lexicographic
    pub fn is_log_up_to_date(&self, last_log_term: u64, last_log_index: u64) -> bool {
        (last_log_term, last_log_index) >= (self.log.last_term(), self.log.last_index())
    }

    pub fn handle_request_vote(
        &mut self,
        req: &RequestVoteRequest,
    ) -> Result<RequestVoteResponse, ConsensusError> {
        if !self.participating || !self.voter || req.term < self.current_term {
            return Ok(RequestVoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }
        // Candidates outside the voting membership never move our term
        if !self.peers.contains(&req.candidate_id) {
            tracing::debug!(
                "Node {} ignoring vote request from non-member {} (term {})",
                self.id,
                req.candidate_id,
                req.term
            );
            return Ok(RequestVoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        if req.term > self.current_term {
            self.step_down(req.term, None)?;
        }

        let already_voted = self.voted_for.is_some_and(|v| v != req.candidate_id);
        if already_voted || !self.is_log_up_to_date(req.last_log_term, req.last_log_index) {
            tracing::debug!(
                "Node {} denied vote to {} in term {}",
                self.id,
                req.candidate_id,
                req.term
            );
            return Ok(RequestVoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        self.voted_for = Some(req.candidate_id);
        self.persist_hard_state()?;
        self.last_heartbeat = Instant::now();
        tracing::debug!("Node {} voted for {} in term {}", self.id, req.candidate_id, req.term);

        Ok(RequestVoteResponse {
            term: self.current_term,
            vote_granted: true,
        })
    }

    /// Count a vote for the election held in `election_term`
    pub fn handle_vote_response(
        &mut self,
        from: NodeId,
        election_term: u64,
        resp: &RequestVoteResponse,
    ) -> Result<(), ConsensusError> {
        if resp.term > self.current_term {
            return self.step_down(resp.term, None);
        }
        if self.role != NodeRole::Candidate
            || self.current_term != election_term
            || !resp.vote_granted
            || !self.peers.contains(&from)
        {
            return Ok(());
        }

        self.votes.insert(from);
        if self.votes.len() >= self.quorum() {
            self.become_leader()?;
        }
        Ok(())
    }

    fn become_leader(&mut self) -> Result<(), ConsensusError> {
        self.role = NodeRole::Leader;
        self.leader_id = Some(self.id);
        self.stats.terms_led += 1;

        let next = self.log.last_index() + 1;
        let now = Instant::now();
        for target in self.replication_targets() {
            self.next_index.insert(target, next);
            self.match_index.insert(target, 0);
            self.last_ack.insert(target, now);
        }

        tracing::info!(
            "Node {} became leader for term {} with {} votes",
            self.id,
            self.current_term,
            self.votes.len()
        );
        self.events.push(RoleChange::BecameLeader {
            term: self.current_term,
        });

        // Entries from earlier terms commit through this one
        self.log
            .append(LogEntry::new(next, self.current_term, EntryPayload::Noop))?;
        self.advance_commit();
        Ok(())
    }

    // === Replication (leader side) ===

    /// Append a new entry; returns its `(index, term)`
    pub fn propose(&mut self, payload: EntryPayload) -> Result<(u64, u64), ConsensusError> {
        if self.role != NodeRole::Leader {
            return Err(ConsensusError::NotLeader {
                leader_hint: self.leader_id,
            });
        }
        let index = self.log.last_index() + 1;
        self.log
            .append(LogEntry::new(index, self.current_term, payload))?;
        self.advance_commit();
        Ok((index, self.current_term))
    }

    /// Build the next AppendEntries (or InstallSnapshot when the follower is
    /// behind the compacted prefix) for `peer`
    pub fn outbound_for(&self, peer: NodeId) -> Result<Outbound, ConsensusError> {
        if self.role != NodeRole::Leader {
            return Err(ConsensusError::NotLeader {
                leader_hint: self.leader_id,
            });
        }
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1)
            .max(1);
        let prev_log_index = next - 1;

        if prev_log_index < self.log.base_index() {
            let snapshot = self.log.storage().load_snapshot()?.ok_or_else(|| {
                ConsensusError::LogInconsistency {
                    index: prev_log_index,
                    detail: "log compacted without a snapshot".to_string(),
                }
            })?;
            return Ok(Outbound::Snapshot(self.snapshot_request(snapshot)));
        }

        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        Ok(Outbound::Append(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries: self.log.entries_from(next, self.max_entries_per_append),
            leader_commit: self.commit_index,
        }))
    }

    /// InstallSnapshot carrying `snapshot` and the log entries after it
    pub fn snapshot_request(&self, snapshot: Snapshot) -> InstallSnapshotRequest {
        let tail = self
            .log
            .entries_from(snapshot.last_included_index + 1, self.max_entries_per_append);
        InstallSnapshotRequest {
            term: self.current_term,
            leader_id: self.id,
            snapshot,
            tail,
            leader_commit: self.commit_index,
        }
    }

    fn note_ack(&mut self, peer: NodeId) {
        self.last_ack.insert(peer, Instant::now());
    }

    /// Process a follower's AppendEntries reply. Returns true when the
    /// follower still lags and another round should be sent right away.
    pub fn handle_append_response(
        &mut self,
        peer: NodeId,
        req: &AppendEntriesRequest,
        resp: &AppendEntriesResponse,
    ) -> Result<bool, ConsensusError> {
        if resp.term > self.current_term {
            self.step_down(resp.term, None)?;
            return Ok(false);
        }
        if self.role != NodeRole::Leader || req.term != self.current_term {
            return Ok(false);
        }
        self.note_ack(peer);

        if resp.success {
            let matched = req.prev_log_index + req.entries.len() as u64;
            let current = self.match_index_of(peer);
            self.match_index.insert(peer, current.max(matched));
            self.next_index.insert(peer, current.max(matched) + 1);
            self.advance_commit();
        } else {
            self.stats.append_rejections += 1;
            let next = self.next_index.get(&peer).copied().unwrap_or(1);
            let backed_off = next.saturating_sub(1).min(resp.match_index + 1).max(1);
            tracing::debug!(
                "Node {} rejected append at {}, retrying from {}",
                peer,
                req.prev_log_index,
                backed_off
            );
            self.next_index.insert(peer, backed_off);
        }

        let next = self.next_index.get(&peer).copied().unwrap_or(1);
        Ok(next <= self.log.last_index())
    }

    /// Process an InstallSnapshot reply. Returns true on a successful install.
    pub fn handle_snapshot_response(
        &mut self,
        peer: NodeId,
        req: &InstallSnapshotRequest,
        resp: &InstallSnapshotResponse,
    ) -> Result<bool, ConsensusError> {
        if resp.term > self.current_term {
            self.step_down(resp.term, None)?;
            return Ok(false);
        }
        if self.role != NodeRole::Leader || req.term != self.current_term || !resp.success {
            return Ok(false);
        }
        self.note_ack(peer);
        let current = self.match_index_of(peer);
        let matched = current.max(resp.match_index);
        self.match_index.insert(peer, matched);
        self.next_index.insert(peer, matched + 1);
        self.advance_commit();
        Ok(true)
    }

    /// Commit the highest current-term index stored on a majority of voters
    fn advance_commit(&mut self) {
        if self.role != NodeRole::Leader {
            return;
        }
        let mut matched: Vec<u64> = self.peers.iter().map(|p| self.match_index_of(*p)).collect();
        matched.push(self.log.last_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = matched[self.quorum() - 1];
        if candidate > self.commit_index && self.log.term_at(candidate) == Some(self.current_term) {
            tracing::debug!("Node {} commit index {} -> {}", self.id, self.commit_index, candidate);
            self.commit_index = candidate;
        }
    }

    /// Step down when a majority has not answered within `window`
    pub fn check_quorum(&mut self, now: Instant, window: Duration) -> bool {
        if self.role != NodeRole::Leader {
            return true;
        }
        let reachable = 1 + self
            .peers
            .iter()
            .filter(|p| {
                self.last_ack
                    .get(p)
                    .is_some_and(|at| now.saturating_duration_since(*at) < window)
            })
            .count();
        if reachable >= self.quorum() {
            return true;
        }

        tracing::warn!(
            "Node {} lost quorum in term {} ({} of {} reachable), stepping down",
            self.id,
            self.current_term,
            reachable,
            self.peers.len() + 1
        );
        self.role = NodeRole::Follower;
        self.leader_id = None;
        self.last_heartbeat = now;
        self.events.push(RoleChange::BecameFollower {
            term: self.current_term,
            leader_id: None,
        });
        false
    }

    pub fn add_learner(&mut self, node: NodeId, match_index: u64) {
        if node == self.id || self.peers.contains(&node) {
            return;
        }
        if self.learners.insert(node) {
            tracing::info!("Node {} registered learner {} at index {}", self.id, node, match_index);
        }
        self.match_index.insert(node, match_index);
        self.next_index.insert(node, match_index + 1);
        self.last_ack.insert(node, Instant::now());
    }

    pub fn set_participating(&mut self, participating: bool) {
        self.participating = participating;
        self.last_heartbeat = Instant::now();
        if !participating && self.role != NodeRole::Follower {
            tracing::info!("Node {} leaving {:?} role to resync", self.id, self.role);
            self.role = NodeRole::Follower;
            self.leader_id = None;
            self.votes.clear();
            self.events.push(RoleChange::BecameFollower {
                term: self.current_term,
                leader_id: None,
            });
        }
    }

    /// Stop accepting appends until a leader snapshot replaces local state
    pub fn begin_resync(&mut self) {
        self.awaiting_snapshot = true;
        self.set_participating(false);
    }

    pub fn is_awaiting_snapshot(&self) -> bool {
        self.awaiting_snapshot
    }

    // === Replication (follower side) ===

    pub fn handle_append_entries(
        &mut self,
        req: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, ConsensusError> {
        let reject = |core: &Self, hint: u64| AppendEntriesResponse {
            term: core.current_term,
            success: false,
            match_index: hint,
        };

        if !self.participating || req.term < self.current_term {
            return Ok(reject(self, self.log.last_index()));
        }

        if req.term > self.current_term || self.role != NodeRole::Follower || self.leader_id != Some(req.leader_id) {
            self.step_down(req.term, Some(req.leader_id))?;
        }
        self.last_heartbeat = Instant::now();

        // Anything at or below our snapshot is committed and therefore matches
        let base = self.log.base_index();
        if req.prev_log_index >= base && !self.log.matches(req.prev_log_index, req.prev_log_term) {
            let hint = self
                .log
                .last_index()
                .min(req.prev_log_index.saturating_sub(1));
            tracing::debug!(
                "Node {} log mismatch at {} (term {}), hint {}",
                self.id,
                req.prev_log_index,
                req.prev_log_term,
                hint
            );
            return Ok(reject(self, hint));
        }

        self.log.merge(&req.entries, self.commit_index)?;

        let last_new = req.prev_log_index + req.entries.len() as u64;
        if req.leader_commit > self.commit_index {
            let target = req.leader_commit.min(last_new).min(self.log.last_index());
            self.commit_index = self.commit_index.max(target);
        }

        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            match_index: last_new.max(base),
        })
    }

    /// Install a leader's snapshot wholesale and append its tail
    pub fn handle_install_snapshot(
        &mut self,
        req: &InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, ConsensusError> {
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
                success: false,
                match_index: self.log.last_index(),
            });
        }
        if req.term > self.current_term || self.role != NodeRole::Follower || self.leader_id != Some(req.leader_id) {
            self.step_down(req.term, Some(req.leader_id))?;
        }
        self.last_heartbeat = Instant::now();

        let snapshot = &req.snapshot;
        if snapshot.last_included_index > self.commit_index || self.awaiting_snapshot {
            self.awaiting_snapshot = false;
            self.log.storage().save_snapshot(snapshot)?;
            self.log
                .reset_to_snapshot(snapshot.last_included_index, snapshot.last_included_term)?;
            self.commit_index = snapshot.last_included_index;
            self.last_delivered = snapshot.last_included_index;
            self.pending_snapshot = Some(snapshot.clone());
            tracing::info!(
                "Node {} installed snapshot through {} (term {}) from leader {}",
                self.id,
                snapshot.last_included_index,
                snapshot.last_included_term,
                req.leader_id
            );
        }

        self.log.merge(&req.tail, self.commit_index)?;
        let last_new = snapshot.last_included_index + req.tail.len() as u64;
        if req.leader_commit > self.commit_index {
            let target = req.leader_commit.min(last_new).min(self.log.last_index());
            self.commit_index = self.commit_index.max(target);
        }

        Ok(InstallSnapshotResponse {
            term: self.current_term,
            success: true,
            match_index: last_new,
        })
    }

    // === Output ===

    /// Role changes since the last call
    pub fn take_events(&mut self) -> Vec<RoleChange> {
        std::mem::take(&mut self.events)
    }

    /// Snapshot to install (if any) followed by newly committed entries
    pub fn take_apply(&mut self) -> Vec<ApplyMsg> {
        let mut out = Vec::new();
        if let Some(snapshot) = self.pending_snapshot.take() {
            out.push(ApplyMsg::Snapshot(snapshot));
        }
        if self.commit_index > self.last_delivered {
            let mut entries = self.log.entries_between(self.last_delivered, self.commit_index);
            for entry in entries.iter_mut() {
                entry.committed = true;
            }
            if let Some(last) = entries.last() {
                self.last_delivered = last.index;
                out.push(ApplyMsg::Entries(entries));
            }
        }
        out
    }

    /// Persist a state machine snapshot and discard the log it covers
    pub fn compact(&mut self, snapshot: Snapshot) -> Result<(), ConsensusError> {
        let index = snapshot.last_included_index;
        if index <= self.log.base_index() || index > self.last_delivered {
            return Ok(());
        }
        self.log.storage().save_snapshot(&snapshot)?;
        self.log.compact_through(index, snapshot.last_included_term)?;
        tracing::debug!("Node {} compacted log through {}", self.id, index);
        Ok(())
    }
}
