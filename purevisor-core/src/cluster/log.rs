//! Replicated log
//!
//! Strongly consistent ordered log: randomized-timeout leader election,
//! append replication with conflict convergence, majority commit gated on
//! the leader's current term, and configuration changes that take effect
//! at apply time. The log is tick-driven: a wall-clock millisecond value
//! arrives from outside and is the only time source. Inbound messages are
//! processed serially; mutable state is owned by the single driving
//! thread.
//!
//! Wire format: a 20-byte little-endian header {type, from-node, term,
//! payload-length} followed by a postcard-encoded message body.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

use crate::cluster::{ClusterTransport, NodeId};
use crate::config::CoreConfig;
use crate::uuid::Rng64;

/// Monotonic election epoch.
pub type Term = u64;

/// One-based position in the log.
pub type LogIndex = u64;

/// Replicated-log errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogError {
    /// Submissions are accepted by the leader only.
    NotLeader,
    /// Undecodable or truncated wire bytes.
    BadMessage,
    UnknownNode,
}

/// Node role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Entry type carried alongside the opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Leader no-op, used to commit the new term quickly.
    Noop,
    /// Replicated volume write (payload: postcard `VolumeWrite`).
    Write,
    /// Membership change, effective at apply time.
    AddNode(NodeId),
    RemoveNode(NodeId),
    /// Volume removal ordered behind every prior write.
    DeleteVolume,
    Custom(u8),
}

/// One log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

/// Sink for committed entries, invoked in commit order.
pub trait ApplyHook {
    fn apply(&mut self, entry: &LogEntry);
}

/// Durable storage for the state a node must not lose across restarts:
/// the current term with its vote, and the entry suffix. The log calls
/// these hooks before acting on the corresponding volatile state.
pub trait StableStore {
    fn save_term(&mut self, term: Term, voted_for: Option<NodeId>);
    fn append_entries(&mut self, entries: &[LogEntry]);
    /// Discard persisted entries at `from` and beyond (conflict rewrite).
    fn truncate_entries(&mut self, from: LogIndex);
}

/// Apply sink that ignores everything.
pub struct NullApply;

impl ApplyHook for NullApply {
    fn apply(&mut self, _entry: &LogEntry) {}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Message {
    RequestVote {
        term: Term,
        candidate: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    },
    VoteReply {
        term: Term,
        granted: bool,
    },
    AppendEntries {
        term: Term,
        leader: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    },
    AppendReply {
        term: Term,
        success: bool,
        match_index: LogIndex,
    },
}

impl Message {
    fn wire_type(&self) -> u32 {
        match self {
            Message::RequestVote { .. } => 1,
            Message::VoteReply { .. } => 2,
            Message::AppendEntries { .. } => 3,
            Message::AppendReply { .. } => 4,
        }
    }
}

/// Bytes in the wire header: type (4), from-node (4), term (8), length (4).
pub const WIRE_HEADER_LEN: usize = 20;
const_assert_eq!(WIRE_HEADER_LEN, 4 + 4 + 8 + 4);

fn encode(from: NodeId, term: Term, msg: &Message) -> Vec<u8> {
    let body = postcard::to_allocvec(msg).unwrap_or_default();
    let mut out = Vec::with_capacity(WIRE_HEADER_LEN + body.len());
    out.extend_from_slice(&msg.wire_type().to_le_bytes());
    out.extend_from_slice(&from.to_le_bytes());
    out.extend_from_slice(&term.to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

fn decode(bytes: &[u8]) -> Result<(NodeId, Message), LogError> {
    if bytes.len() < WIRE_HEADER_LEN {
        return Err(LogError::BadMessage);
    }
    let from = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let len = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]) as usize;
    let body = bytes.get(WIRE_HEADER_LEN..WIRE_HEADER_LEN + len).ok_or(LogError::BadMessage)?;
    let msg: Message = postcard::from_bytes(body).map_err(|_| LogError::BadMessage)?;
    Ok((from, msg))
}

/// Leader-side replication progress for one follower.
#[derive(Debug, Clone, Copy)]
struct Follower {
    next_index: LogIndex,
    match_index: LogIndex,
    last_contact_ms: u64,
}

/// Per-node replicated-log state machine.
pub struct ReplicatedLog {
    id: NodeId,
    peers: Vec<NodeId>,
    role: Role,
    current_term: Term,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    leader: Option<NodeId>,
    followers: BTreeMap<NodeId, Follower>,
    votes: Vec<NodeId>,
    /// Set by the first tick; until then no time base exists and timers
    /// stay unarmed (a node whose first tick lands far past boot must not
    /// call an election off the stale epoch).
    started: bool,
    election_deadline_ms: u64,
    next_heartbeat_ms: u64,
    heartbeat_ms: u64,
    election_min_ms: u64,
    election_window_ms: u64,
    now_ms: u64,
    rng: Rng64,
    transport: Box<dyn ClusterTransport>,
    apply: Box<dyn ApplyHook>,
    stable: Option<Box<dyn StableStore>>,
}

impl ReplicatedLog {
    pub fn new(
        id: NodeId,
        cfg: &CoreConfig,
        transport: Box<dyn ClusterTransport>,
        apply: Box<dyn ApplyHook>,
        seed: u64,
    ) -> Self {
        let mut log = ReplicatedLog {
            id,
            peers: Vec::new(),
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            leader: None,
            followers: BTreeMap::new(),
            votes: Vec::new(),
            started: false,
            election_deadline_ms: 0,
            next_heartbeat_ms: 0,
            heartbeat_ms: cfg.heartbeat_ms,
            election_min_ms: cfg.election_min_ms,
            election_window_ms: cfg.election_max_ms.saturating_sub(cfg.election_min_ms).max(1),
            now_ms: 0,
            rng: Rng64::new(seed ^ ((id as u64) << 32 | id as u64)),
            transport,
            apply,
            stable: None,
        };
        log.reset_election_deadline(0);
        log
    }

    /// Attach durable storage for term/vote and the entry suffix.
    pub fn set_stable_store(&mut self, store: Box<dyn StableStore>) {
        self.stable = Some(store);
    }

    /// Bootstrap-time membership, before any traffic flows. Runtime
    /// changes go through `add_node`/`remove_node` log entries.
    pub fn add_peer(&mut self, node: NodeId) {
        if node != self.id && !self.peers.contains(&node) {
            self.peers.push(node);
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.leader
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn last_index(&self) -> LogIndex {
        self.log.len() as LogIndex
    }

    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get(index as usize - 1)
    }

    /// Whether the entry at `index` with `term` is durably committed.
    pub fn is_committed(&self, index: LogIndex, term: Term) -> bool {
        index <= self.commit_index && self.entry(index).map_or(false, |e| e.term == term)
    }

    /// Leader-only append. Returns the assigned index; the caller may poll
    /// `is_committed` before acknowledging its own caller.
    pub fn submit(&mut self, kind: EntryKind, payload: Vec<u8>) -> Result<LogIndex, LogError> {
        if self.role != Role::Leader {
            return Err(LogError::NotLeader);
        }
        let index = self.last_index() + 1;
        let term = self.current_term;
        let entry = LogEntry { index, term, kind, payload };
        if let Some(store) = self.stable.as_mut() {
            store.append_entries(core::slice::from_ref(&entry));
        }
        self.log.push(entry);
        if self.peers.is_empty() {
            self.try_advance_commit();
        } else {
            self.broadcast_appends();
        }
        Ok(index)
    }

    /// Submit a membership addition.
    pub fn add_node(&mut self, node: NodeId) -> Result<LogIndex, LogError> {
        self.submit(EntryKind::AddNode(node), Vec::new())
    }

    /// Submit a membership removal.
    pub fn remove_node(&mut self, node: NodeId) -> Result<LogIndex, LogError> {
        self.submit(EntryKind::RemoveNode(node), Vec::new())
    }

    /// Advance timers. The single suspension-free unit of time that moves
    /// leader election and heartbeating.
    pub fn tick(&mut self, now_ms: u64) {
        self.now_ms = now_ms;
        if !self.started {
            self.started = true;
            self.reset_election_deadline(now_ms);
            return;
        }
        match self.role {
            Role::Leader => {
                if now_ms >= self.next_heartbeat_ms {
                    self.broadcast_appends();
                    self.next_heartbeat_ms = now_ms + self.heartbeat_ms;
                }
            }
            Role::Follower | Role::Candidate => {
                if now_ms >= self.election_deadline_ms {
                    self.start_election();
                }
            }
        }
    }

    /// Feed one inbound wire message.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<(), LogError> {
        let (from, msg) = decode(bytes)?;
        match msg {
            Message::RequestVote { term, candidate, last_log_index, last_log_term } => {
                self.on_request_vote(from, term, candidate, last_log_index, last_log_term)
            }
            Message::VoteReply { term, granted } => self.on_vote_reply(from, term, granted),
            Message::AppendEntries { term, leader, prev_log_index, prev_log_term, entries, leader_commit } => {
                self.on_append(from, term, leader, prev_log_index, prev_log_term, entries, leader_commit)
            }
            Message::AppendReply { term, success, match_index } => {
                self.on_append_reply(from, term, success, match_index)
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Elections
    // ------------------------------------------------------------------

    fn start_election(&mut self) {
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.persist_term();
        self.votes.clear();
        self.votes.push(self.id);
        self.leader = None;
        self.reset_election_deadline(self.now_ms);
        log!("log node {}: election started, term {}", self.id, self.current_term);
        let msg = Message::RequestVote {
            term: self.current_term,
            candidate: self.id,
            last_log_index: self.last_index(),
            last_log_term: self.last_term(),
        };
        self.send_to_all(&msg);
        if self.votes.len() >= self.majority() {
            self.become_leader();
        }
    }

    fn on_request_vote(
        &mut self,
        from: NodeId,
        term: Term,
        candidate: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) {
        if term > self.current_term {
            self.step_down(term);
        }
        let log_ok = last_log_term > self.last_term()
            || (last_log_term == self.last_term() && last_log_index >= self.last_index());
        let granted = term == self.current_term
            && log_ok
            && self.voted_for.map_or(true, |v| v == candidate);
        if granted {
            self.voted_for = Some(candidate);
            self.persist_term();
            self.reset_election_deadline(self.now_ms);
        }
        let reply = Message::VoteReply { term: self.current_term, granted };
        self.send_to(from, &reply);
    }

    fn on_vote_reply(&mut self, from: NodeId, term: Term, granted: bool) {
        if term > self.current_term {
            self.step_down(term);
            return;
        }
        if self.role != Role::Candidate || term != self.current_term || !granted {
            return;
        }
        if !self.votes.contains(&from) {
            self.votes.push(from);
        }
        if self.votes.len() >= self.majority() {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.leader = Some(self.id);
        self.followers.clear();
        let next = self.last_index() + 1;
        let now = self.now_ms;
        for &peer in &self.peers {
            self.followers.insert(peer, Follower { next_index: next, match_index: 0, last_contact_ms: now });
        }
        self.next_heartbeat_ms = now + self.heartbeat_ms;
        log!("log node {}: leader of term {}", self.id, self.current_term);
        self.broadcast_appends();
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn on_append(
        &mut self,
        from: NodeId,
        term: Term,
        leader: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) {
        if term < self.current_term {
            let reply = Message::AppendReply { term: self.current_term, success: false, match_index: 0 };
            self.send_to(from, &reply);
            return;
        }
        // Equal or higher term: a competing candidate or stale leader
        // yields to the sender.
        if term > self.current_term || self.role != Role::Follower {
            self.step_down(term);
        }
        self.leader = Some(leader);
        self.reset_election_deadline(self.now_ms);

        let prev_ok = prev_log_index == 0
            || self
                .entry(prev_log_index)
                .map_or(false, |e| e.term == prev_log_term);
        if !prev_ok {
            let reply = Message::AppendReply { term: self.current_term, success: false, match_index: 0 };
            self.send_to(from, &reply);
            return;
        }

        // Accepted entries overwrite any conflicting suffix.
        for entry in &entries {
            let pos = entry.index as usize;
            if pos <= self.log.len() {
                if self.log[pos - 1].term != entry.term {
                    self.log.truncate(pos - 1);
                    if let Some(store) = self.stable.as_mut() {
                        store.truncate_entries(entry.index);
                        store.append_entries(core::slice::from_ref(entry));
                    }
                    self.log.push(entry.clone());
                }
            } else {
                if let Some(store) = self.stable.as_mut() {
                    store.append_entries(core::slice::from_ref(entry));
                }
                self.log.push(entry.clone());
            }
        }
        let match_index = prev_log_index + entries.len() as LogIndex;
        if leader_commit > self.commit_index {
            self.commit_index = core::cmp::min(leader_commit, self.last_index());
            self.apply_committed();
        }
        let reply = Message::AppendReply { term: self.current_term, success: true, match_index };
        self.send_to(from, &reply);
    }

    fn on_append_reply(&mut self, from: NodeId, term: Term, success: bool, match_index: LogIndex) {
        if term > self.current_term {
            self.step_down(term);
            return;
        }
        if self.role != Role::Leader {
            return;
        }
        let Some(follower) = self.followers.get_mut(&from) else {
            return;
        };
        follower.last_contact_ms = self.now_ms;
        if success {
            follower.match_index = follower.match_index.max(match_index);
            follower.next_index = follower.match_index + 1;
            self.try_advance_commit();
        } else {
            // Converge on the latest common prefix and retry immediately.
            follower.next_index = follower.next_index.saturating_sub(1).max(1);
            self.send_append_to(from);
        }
    }

    /// Commit rule: replicated to a majority and created in the leader's
    /// current term.
    fn try_advance_commit(&mut self) {
        let majority = self.majority();
        let mut n = self.last_index();
        while n > self.commit_index {
            let replicated = 1 + self.followers.values().filter(|f| f.match_index >= n).count();
            let current_term = self.entry(n).map_or(false, |e| e.term == self.current_term);
            if replicated >= majority && current_term {
                self.commit_index = n;
                self.apply_committed();
                break;
            }
            n -= 1;
        }
    }

    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = self.log[index as usize - 1].clone();
            // Configuration changes become effective here, on every node.
            match entry.kind {
                EntryKind::AddNode(node) => {
                    self.add_peer(node);
                    if self.role == Role::Leader && node != self.id {
                        let next = self.last_index() + 1;
                        let now = self.now_ms;
                        self.followers
                            .entry(node)
                            .or_insert(Follower { next_index: next, match_index: 0, last_contact_ms: now });
                    }
                }
                EntryKind::RemoveNode(node) => {
                    self.peers.retain(|&p| p != node);
                    self.followers.remove(&node);
                }
                _ => {}
            }
            self.apply.apply(&entry);
            self.last_applied = index;
        }
    }

    fn broadcast_appends(&mut self) {
        let peers = self.peers.clone();
        for peer in peers {
            self.send_append_to(peer);
        }
    }

    fn send_append_to(&mut self, peer: NodeId) {
        let next = self.followers.get(&peer).map_or(self.last_index() + 1, |f| f.next_index);
        let prev_log_index = next - 1;
        let prev_log_term = if prev_log_index == 0 {
            0
        } else {
            self.entry(prev_log_index).map_or(0, |e| e.term)
        };
        let entries: Vec<LogEntry> = self.log.get(next as usize - 1..).unwrap_or(&[]).to_vec();
        let msg = Message::AppendEntries {
            term: self.current_term,
            leader: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };
        self.send_to(peer, &msg);
    }

    // ------------------------------------------------------------------
    // Role changes and plumbing
    // ------------------------------------------------------------------

    fn step_down(&mut self, term: Term) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.persist_term();
        }
        if self.role == Role::Leader {
            log_warn!("log node {}: stepping down in term {}", self.id, term);
        }
        self.role = Role::Follower;
        self.votes.clear();
        self.followers.clear();
        self.leader = None;
        self.reset_election_deadline(self.now_ms);
    }

    fn persist_term(&mut self) {
        if let Some(store) = self.stable.as_mut() {
            store.save_term(self.current_term, self.voted_for);
        }
    }

    fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn last_term(&self) -> Term {
        self.log.last().map_or(0, |e| e.term)
    }

    fn reset_election_deadline(&mut self, now_ms: u64) {
        let jitter = self.rng.next_u64() % self.election_window_ms;
        self.election_deadline_ms = now_ms + self.election_min_ms + jitter;
    }

    fn send_to(&mut self, peer: NodeId, msg: &Message) {
        let bytes = encode(self.id, self.current_term, msg);
        self.transport.send(peer, &bytes);
    }

    fn send_to_all(&mut self, msg: &Message) {
        let bytes = encode(self.id, self.current_term, msg);
        let peers = self.peers.clone();
        for peer in peers {
            self.transport.send(peer, &bytes);
        }
    }
}
