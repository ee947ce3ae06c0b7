//! The consensus state machine: elections (with prevote), log replication,
//! commit advancement, snapshot install and membership changes.

use ::log::debug;
use rand::Rng;

use crate::log::Log;
use crate::node::Node;
use crate::{
    AppendEntries, AppendEntriesResponse, Callbacks, Entry, EntryResponse, InstallSnapshot,
    InstallSnapshotResponse, LogIndex, MembershipEvent, NodeId, RaftError, RaftResult, RequestVote,
    RequestVoteResponse, State, Term, LOGTYPE_ADD_NODE, LOGTYPE_DEMOTE_NODE, LOGTYPE_REMOVE_NODE,
    NODE_NONE, VOTE_GRANTED, VOTE_NOT_GRANTED, VOTE_UNKNOWN_NODE,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectStatus {
    Disconnected,
    Connected,
    Connecting,
    Disconnecting,
}

pub struct Server {
    /* persistent (through the persist_* callbacks) */
    current_term: Term,
    voted_for: NodeId,
    log: Log,

    /* volatile */
    commit_idx: LogIndex,
    last_applied_idx: LogIndex,
    state: State,
    /// candidate that has not yet won the prevote round
    prevote: bool,
    timeout_elapsed: i32,
    election_timeout: i32,
    election_timeout_rand: i32,
    request_timeout: i32,

    nodes: Vec<Node>,
    node_id: NodeId,
    leader_id: NodeId,

    /// index of an uncommitted voting-configuration entry, or -1
    voting_cfg_change_log_idx: LogIndex,
    connected: ConnectStatus,

    snapshot_in_progress: bool,
    snapshot_last_idx: LogIndex,
    snapshot_last_term: Term,
}

impl Default for Server {
    fn default() -> Self {
        Server::new()
    }
}

impl Server {
    pub fn new() -> Self {
        let mut s = Server {
            current_term: 0,
            voted_for: NODE_NONE,
            log: Log::new(),
            commit_idx: 0,
            last_applied_idx: 0,
            state: State::Follower,
            prevote: false,
            timeout_elapsed: 0,
            election_timeout: 1000,
            election_timeout_rand: 0,
            request_timeout: 200,
            nodes: Vec::new(),
            node_id: NODE_NONE,
            leader_id: NODE_NONE,
            voting_cfg_change_log_idx: -1,
            connected: ConnectStatus::Disconnected,
            snapshot_in_progress: false,
            snapshot_last_idx: 0,
            snapshot_last_term: 0,
        };
        s.randomize_election_timeout();
        s
    }

    /* ---- properties ---- */

    pub fn set_election_timeout(&mut self, msec: i32) {
        self.election_timeout = msec;
        self.randomize_election_timeout();
    }

    pub fn set_request_timeout(&mut self, msec: i32) {
        self.request_timeout = msec;
    }

    pub fn election_timeout(&self) -> i32 {
        self.election_timeout
    }

    pub fn request_timeout(&self) -> i32 {
        self.request_timeout
    }

    pub fn timeout_elapsed(&self) -> i32 {
        self.timeout_elapsed
    }

    pub fn randomize_election_timeout(&mut self) {
        // [election_timeout, 2 * election_timeout)
        self.election_timeout_rand =
            self.election_timeout + rand::thread_rng().gen_range(0..self.election_timeout.max(1));
    }

    pub fn nodeid(&self) -> NodeId {
        self.node_id
    }

    pub fn state(&self) -> State {
        self.state
    }

    fn set_state(&mut self, state: State) {
        if state == State::Leader {
            self.leader_id = self.node_id;
        }
        self.state = state;
    }

    pub fn is_follower(&self) -> bool {
        self.state == State::Follower
    }

    pub fn is_leader(&self) -> bool {
        self.state == State::Leader
    }

    pub fn is_candidate(&self) -> bool {
        self.state == State::Candidate
    }

    pub fn is_prevoted_candidate(&self) -> bool {
        self.state == State::Candidate && !self.prevote
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> NodeId {
        self.voted_for
    }

    pub fn current_leader(&self) -> NodeId {
        self.leader_id
    }

    pub fn current_idx(&self) -> LogIndex {
        self.log.current_idx()
    }

    pub fn commit_idx(&self) -> LogIndex {
        self.commit_idx
    }

    pub fn last_applied_idx(&self) -> LogIndex {
        self.last_applied_idx
    }

    /// Reload helper for persistent state.
    pub fn set_last_applied_idx(&mut self, idx: LogIndex) {
        self.last_applied_idx = idx;
    }

    pub fn log_count(&self) -> LogIndex {
        self.log.count()
    }

    pub fn first_entry_idx(&self) -> LogIndex {
        self.log.base() + 1
    }

    pub fn snapshot_last_idx(&self) -> LogIndex {
        self.snapshot_last_idx
    }

    pub fn snapshot_last_term(&self) -> Term {
        self.snapshot_last_term
    }

    pub fn set_snapshot_metadata(&mut self, term: Term, idx: LogIndex) {
        self.snapshot_last_term = term;
        self.snapshot_last_idx = idx;
    }

    pub fn snapshot_in_progress(&self) -> bool {
        self.snapshot_in_progress
    }

    pub fn num_snapshottable_logs(&self) -> LogIndex {
        self.commit_idx - self.log.base()
    }

    pub fn is_connected(&self) -> ConnectStatus {
        self.connected
    }

    pub fn entry(&self, idx: LogIndex) -> Option<&Entry> {
        self.log.get_at(idx)
    }

    /// Term at `idx`, falling back to the compacted base.
    fn entry_term(&self, idx: LogIndex) -> Option<Term> {
        if let Some(e) = self.log.get_at(idx) {
            Some(e.term)
        } else if idx == self.log.base() {
            Some(self.log.base_term())
        } else {
            None
        }
    }

    pub fn last_log_term(&self) -> Term {
        self.entry_term(self.current_idx()).expect("log tail has a term")
    }

    pub fn set_commit_idx(&mut self, idx: LogIndex) {
        assert!(self.commit_idx <= idx);
        assert!(idx <= self.current_idx());
        self.commit_idx = idx;
    }

    pub fn set_current_term(&mut self, cb: &mut dyn Callbacks, term: Term) -> RaftResult<()> {
        if self.current_term < term {
            cb.persist_term(term, NODE_NONE)?;
            self.current_term = term;
            self.voted_for = NODE_NONE;
        }
        Ok(())
    }

    pub fn vote_for_nodeid(&mut self, cb: &mut dyn Callbacks, nodeid: NodeId) -> RaftResult<()> {
        cb.persist_vote(nodeid)?;
        self.voted_for = nodeid;
        Ok(())
    }

    /* ---- membership ---- */

    fn node_pos(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    /// Voting status is derived from the newest offered cfg entry affecting
    /// the node; falls back to the committed view.
    pub fn node_is_voting(&self, id: NodeId) -> bool {
        let n = match self.node(id) {
            Some(n) => n,
            None => return false,
        };
        if n.offered_idx == -1 {
            return self.node_is_voting_committed(id);
        }
        match self.log.get_at(n.offered_idx) {
            Some(e) => e.etype == LOGTYPE_ADD_NODE,
            None => true,
        }
    }

    pub fn node_is_voting_committed(&self, id: NodeId) -> bool {
        let n = match self.node(id) {
            Some(n) => n,
            None => return false,
        };
        if n.applied_idx < 0 {
            return false;
        }
        match self.log.get_at(n.applied_idx) {
            Some(e) => e.etype == LOGTYPE_ADD_NODE,
            None => true,
        }
    }

    /// Active unless explicitly marked for removal.
    pub fn node_is_active(&self, id: NodeId) -> bool {
        let n = match self.node(id) {
            Some(n) => n,
            None => return false,
        };
        if n.offered_idx == -1 {
            return self.node_is_addition_committed(id);
        }
        match self.log.get_at(n.offered_idx) {
            Some(e) => e.etype != LOGTYPE_REMOVE_NODE,
            None => true,
        }
    }

    pub fn node_is_addition_committed(&self, id: NodeId) -> bool {
        let n = match self.node(id) {
            Some(n) => n,
            None => return false,
        };
        if n.applied_idx < -1 {
            return false;
        }
        match self.log.get_at(n.applied_idx) {
            Some(e) => e.etype != LOGTYPE_REMOVE_NODE,
            None => true,
        }
    }

    pub fn num_voting_nodes(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| self.node_is_active(n.id) && self.node_is_voting(n.id))
            .count()
    }

    pub fn add_node(&mut self, cb: &mut dyn Callbacks, id: NodeId, is_self: bool) -> Option<NodeId> {
        if let Some(n) = self.node_mut(id) {
            // voting status is log-derived; adding twice is only legal while
            // the node is still known as non-voting
            if n.applied_idx < 0 {
                n.applied_idx = 0;
            }
            return if !self.node_is_voting(id) { Some(id) } else { None };
        }
        let mut n = Node::new(id);
        n.applied_idx = 0;
        self.nodes.push(n);
        if is_self {
            self.node_id = id;
        }
        cb.notify_membership_event(id, MembershipEvent::Add);
        Some(id)
    }

    pub fn add_non_voting_node(
        &mut self,
        cb: &mut dyn Callbacks,
        id: NodeId,
        is_self: bool,
    ) -> Option<NodeId> {
        if self.node(id).is_some() {
            return None;
        }
        let mut n = Node::new(id);
        n.applied_idx = -1;
        self.nodes.push(n);
        if is_self {
            self.node_id = id;
        }
        cb.notify_membership_event(id, MembershipEvent::Add);
        Some(id)
    }

    pub fn remove_node(&mut self, cb: &mut dyn Callbacks, id: NodeId) {
        cb.notify_membership_event(id, MembershipEvent::Remove);
        let pos = self.node_pos(id).expect("removing unknown node");
        self.nodes.remove(pos);
    }

    /* ---- role transitions ---- */

    pub fn become_follower(&mut self) {
        debug!("raft: becoming follower");
        self.set_state(State::Follower);
        self.randomize_election_timeout();
        self.timeout_elapsed = 0;
    }

    pub fn become_candidate(&mut self, cb: &mut dyn Callbacks) -> RaftResult<()> {
        debug!("raft: becoming candidate (prevote), term {}", self.current_term);
        self.set_state(State::Candidate);
        self.prevote = true;
        for n in self.nodes.iter_mut() {
            n.vote_for_me(false);
        }
        let me = self.node_id;
        if let Some(n) = self.node_mut(me) {
            n.vote_for_me(true);
        }
        self.randomize_election_timeout();
        self.timeout_elapsed = 0;
        self.request_votes(cb)
    }

    pub fn become_prevoted_candidate(&mut self, cb: &mut dyn Callbacks) -> RaftResult<()> {
        debug!("raft: prevote won, starting real election");
        self.prevote = false;
        self.set_current_term(cb, self.current_term + 1)?;
        for n in self.nodes.iter_mut() {
            n.vote_for_me(false);
        }
        self.vote_for_nodeid(cb, self.node_id)?;
        let me = self.node_id;
        if let Some(n) = self.node_mut(me) {
            n.vote_for_me(true);
        }
        self.leader_id = NODE_NONE;
        self.request_votes(cb)
    }

    fn request_votes(&mut self, cb: &mut dyn Callbacks) -> RaftResult<()> {
        for id in self.node_ids() {
            if id != self.node_id && self.node_is_active(id) && self.node_is_voting(id) {
                self.send_requestvote(cb, id)?;
            }
        }
        Ok(())
    }

    pub fn become_leader(&mut self, cb: &mut dyn Callbacks) {
        debug!("raft: becoming leader, term {}", self.current_term);
        self.set_state(State::Leader);
        self.timeout_elapsed = 0;
        let next = self.current_idx() + 1;
        for n in self.nodes.iter_mut() {
            n.set_next_idx(next);
            n.match_idx = 0;
        }
        for id in self.node_ids() {
            if id != self.node_id && self.node_is_active(id) {
                let _ = self.send_appendentries(cb, id);
            }
        }
    }

    pub fn election_start(&mut self, cb: &mut dyn Callbacks) -> RaftResult<()> {
        debug!(
            "raft: election starting: timeout {} elapsed {} term {} ci {}",
            self.election_timeout_rand,
            self.timeout_elapsed,
            self.current_term,
            self.current_idx()
        );
        self.become_candidate(cb)
    }

    /* ---- timers ---- */

    pub fn periodic(&mut self, cb: &mut dyn Callbacks, msec_elapsed: i32) -> RaftResult<()> {
        self.timeout_elapsed += msec_elapsed;

        // a lone voting node promotes itself
        let me = self.node_id;
        if self.num_voting_nodes() == 1
            && self.node(me).is_some()
            && self.node_is_voting(me)
            && self.node_is_active(me)
            && !self.is_leader()
        {
            self.become_leader(cb);
        }

        if self.state == State::Leader {
            if self.request_timeout <= self.timeout_elapsed {
                let _ = self.send_appendentries_all(cb);
            }
        } else if self.election_timeout_rand <= self.timeout_elapsed && !self.snapshot_in_progress {
            if 1 < self.num_voting_nodes() && self.node(me).is_some() && self.node_is_voting(me) {
                let _ = self.election_start(cb);
            }
        }

        if self.last_applied_idx < self.commit_idx && !self.snapshot_in_progress {
            self.apply_all(cb)?;
        }
        Ok(())
    }

    /* ---- log plumbing with cfg bookkeeping ---- */

    /// Appends entries (reload path and internal use). `*n` reports how many
    /// were accepted by the log callback.
    pub fn append_entries(
        &mut self,
        cb: &mut dyn Callbacks,
        entries: &[Entry],
        n: &mut usize,
    ) -> RaftResult<()> {
        let first = self.current_idx() + 1;
        let res = self.log.append(cb, entries, n);
        self.offer_bookkeeping(cb, first, *n);
        res
    }

    fn offer_bookkeeping(&mut self, cb: &mut dyn Callbacks, first_idx: LogIndex, count: usize) {
        let mut touched: Vec<(LogIndex, NodeId, bool)> = Vec::new();
        for i in 0..count as LogIndex {
            let idx = first_idx + i;
            let e = match self.log.get_at(idx) {
                Some(e) => e,
                None => continue,
            };
            if !e.is_cfg_change() {
                continue;
            }
            let voting = e.is_voting_cfg_change();
            let node_id = cb.log_get_node_id(e, idx);
            touched.push((idx, node_id, voting));
        }
        for (idx, node_id, voting) in touched {
            if voting {
                self.voting_cfg_change_log_idx = idx;
            }
            if let Some(n) = self.node_mut(node_id) {
                n.offered_idx = idx;
            }
        }
    }

    pub fn delete_entry_from_idx(&mut self, cb: &mut dyn Callbacks, idx: LogIndex) -> RaftResult<()> {
        assert!(self.commit_idx < idx);
        if idx <= self.voting_cfg_change_log_idx {
            self.voting_cfg_change_log_idx = -1;
        }
        self.log.delete(cb, idx)?;
        self.reset_node_indices(cb, idx);
        // nodes whose addition was rolled back disappear with the entries
        let inactive: Vec<NodeId> = self
            .node_ids()
            .into_iter()
            .filter(|&id| !self.node_is_active(id))
            .collect();
        for id in inactive {
            assert!(id != self.node_id, "cannot remove self");
            self.remove_node(cb, id);
        }
        Ok(())
    }

    /// Re-derive every node's `offered_idx` from the log suffix below
    /// `max_idx` (after tail deletion).
    pub fn reset_node_indices(&mut self, cb: &mut dyn Callbacks, max_idx: LogIndex) {
        let mut remaining = self.nodes.len();
        let mut idx = max_idx;
        while remaining > 0 && idx > self.last_applied_idx {
            let (node_id, _etype) = {
                let e = match self.log.get_at(idx) {
                    Some(e) => e,
                    None => break,
                };
                if !e.is_cfg_change() {
                    idx -= 1;
                    continue;
                }
                (cb.log_get_node_id(e, idx), e.etype)
            };
            if let Some(n) = self.node_mut(node_id) {
                if n.offered_idx > max_idx || n.offered_idx < idx {
                    n.offered_idx = idx;
                    remaining -= 1;
                }
            }
            idx -= 1;
        }
    }

    /* ---- client entries ---- */

    pub fn recv_entry(&mut self, cb: &mut dyn Callbacks, ety: &Entry) -> RaftResult<EntryResponse> {
        if ety.is_voting_cfg_change() {
            if self.voting_cfg_change_log_idx != -1 {
                return Err(RaftError::OneVotingChangeOnly);
            }
            if self.snapshot_in_progress {
                return Err(RaftError::SnapshotInProgress);
            }
        }
        if !self.is_leader() {
            return Err(RaftError::NotLeader);
        }

        debug!(
            "raft: received entry t:{} id:{} idx:{}",
            self.current_term,
            ety.id,
            self.current_idx() + 1
        );

        let mut e = ety.clone();
        e.term = self.current_term;
        let mut k = 1usize;
        self.append_entries(cb, std::slice::from_ref(&e), &mut k)?;
        assert_eq!(k, 1);

        for id in self.node_ids() {
            if id == self.node_id || !self.node_is_active(id) || !self.node_is_voting(id) {
                continue;
            }
            // only poke peers that are exactly one entry behind, to avoid
            // congesting stragglers
            let next = self.node(id).map(|n| n.next_idx).unwrap_or(0);
            if next == self.current_idx() {
                let _ = self.send_appendentries(cb, id);
            }
        }

        if self.num_voting_nodes() == 1 {
            self.set_commit_idx(self.current_idx());
        }

        if e.is_voting_cfg_change() {
            self.voting_cfg_change_log_idx = self.current_idx();
        }

        Ok(EntryResponse { id: e.id, idx: self.current_idx(), term: self.current_term })
    }

    pub fn entry_response_committed(&self, r: &EntryResponse) -> i32 {
        match self.entry_term(r.idx) {
            None => {
                if r.idx <= self.log.base() {
                    // compacted: committed iff it was ours this term
                    if r.term == self.current_term {
                        1
                    } else {
                        -1
                    }
                } else {
                    0
                }
            }
            Some(term) => {
                if r.term != term {
                    -1
                } else if r.idx <= self.commit_idx {
                    1
                } else {
                    0
                }
            }
        }
    }

    /* ---- votes ---- */

    pub fn send_requestvote(&mut self, cb: &mut dyn Callbacks, to: NodeId) -> RaftResult<()> {
        assert!(to != self.node_id);
        let rv = RequestVote {
            term: if self.prevote { self.current_term + 1 } else { self.current_term },
            last_log_idx: self.current_idx(),
            last_log_term: self.last_log_term(),
            candidate_id: self.node_id,
            prevote: self.prevote,
        };
        cb.send_requestvote(to, &rv)
    }

    fn should_grant_vote(&self, vr: &RequestVote) -> bool {
        if self.node(self.node_id).is_some() && !self.node_is_voting(self.node_id) {
            return false;
        }
        if vr.term < self.current_term {
            return false;
        }
        if !vr.prevote && self.voted_for != NODE_NONE && self.voted_for != vr.candidate_id {
            return false;
        }
        let current_idx = self.current_idx();
        let term = self.entry_term(current_idx).expect("log tail has a term");
        if term < vr.last_log_term {
            return true;
        }
        vr.last_log_term == term && current_idx <= vr.last_log_idx
    }

    pub fn recv_requestvote(
        &mut self,
        cb: &mut dyn Callbacks,
        from: NodeId,
        vr: &RequestVote,
        r: &mut RequestVoteResponse,
    ) -> RaftResult<()> {
        let mut e = Ok(());
        let node = self.node(from).map(|n| n.id).or_else(|| self.node(vr.candidate_id).map(|n| n.id));

        // leader stickiness: a live leader suppresses elections
        if self.leader_id != NODE_NONE
            && Some(self.leader_id) != node
            && self.timeout_elapsed < self.election_timeout
        {
            r.vote_granted = VOTE_NOT_GRANTED;
            r.term = self.current_term;
            r.prevote = vr.prevote;
            return Ok(());
        }

        if self.current_term < vr.term && !vr.prevote {
            e = self.set_current_term(cb, vr.term);
            if e.is_err() {
                r.vote_granted = VOTE_NOT_GRANTED;
                r.term = self.current_term;
                r.prevote = vr.prevote;
                return e;
            }
            self.become_follower();
            self.leader_id = NODE_NONE;
        }

        if self.should_grant_vote(vr) {
            // a leader or prevoted candidate has already voted for itself
            assert!(!self.is_leader() && (vr.prevote || !self.is_prevoted_candidate()));
            r.vote_granted = VOTE_GRANTED;
            if !vr.prevote {
                if self.vote_for_nodeid(cb, vr.candidate_id).is_err() {
                    r.vote_granted = VOTE_NOT_GRANTED;
                }
                self.leader_id = NODE_NONE;
                self.timeout_elapsed = 0;
            }
        } else if node.is_none() {
            // the candidate may have been removed and not know it yet
            r.vote_granted = VOTE_UNKNOWN_NODE;
        } else {
            r.vote_granted = VOTE_NOT_GRANTED;
        }

        debug!(
            "raft: vote{} requested by {}: {}",
            if vr.prevote { " (prevote)" } else { "" },
            vr.candidate_id,
            r.vote_granted
        );

        r.term = self.current_term;
        r.prevote = vr.prevote;
        e
    }

    pub fn votes_is_majority(num_nodes: usize, nvotes: usize) -> bool {
        if num_nodes < nvotes {
            return false;
        }
        num_nodes / 2 + 1 <= nvotes
    }

    pub fn nvotes_for_me(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| self.node_is_active(n.id) && self.node_is_voting(n.id) && n.has_vote_for_me())
            .count()
    }

    pub fn recv_requestvote_response(
        &mut self,
        cb: &mut dyn Callbacks,
        from: NodeId,
        r: &RequestVoteResponse,
    ) -> RaftResult<()> {
        if !self.is_candidate() || self.prevote != r.prevote {
            return Ok(());
        }
        if self.current_term < r.term {
            self.set_current_term(cb, r.term)?;
            self.become_follower();
            self.leader_id = NODE_NONE;
            return Ok(());
        }
        // the grantor's term never advances on a prevote, so both rounds
        // answer with our own current term; anything else is stale
        if self.current_term != r.term {
            return Ok(());
        }

        match r.vote_granted {
            VOTE_GRANTED => {
                if let Some(n) = self.node_mut(from) {
                    n.vote_for_me(true);
                }
                let votes = self.nvotes_for_me();
                if Server::votes_is_majority(self.num_voting_nodes(), votes) {
                    if r.prevote {
                        self.become_prevoted_candidate(cb)?;
                    } else {
                        self.become_leader(cb);
                    }
                }
            }
            VOTE_NOT_GRANTED => {}
            VOTE_UNKNOWN_NODE => {
                if self.node_is_voting(self.node_id) && self.connected == ConnectStatus::Disconnecting
                {
                    return Err(RaftError::Shutdown);
                }
            }
            _ => unreachable!("invalid vote response"),
        }
        Ok(())
    }

    /* ---- append entries ---- */

    pub fn send_appendentries(&mut self, cb: &mut dyn Callbacks, to: NodeId) -> RaftResult<()> {
        assert!(to != self.node_id);
        let next_idx = self.node(to).map(|n| n.next_idx).unwrap_or(1);

        if next_idx <= self.log.base() {
            return self.send_installsnapshot(cb, to);
        }

        let prev_log_idx = next_idx - 1;
        let prev_log_term = self.entry_term(prev_log_idx).expect("next_idx above base");
        let ae = AppendEntries {
            term: self.current_term,
            leader_commit: self.commit_idx,
            prev_log_idx,
            prev_log_term,
            entries: self.log.get_from(next_idx).to_vec(),
        };
        cb.send_appendentries(to, &ae)
    }

    pub fn send_appendentries_all(&mut self, cb: &mut dyn Callbacks) -> RaftResult<()> {
        self.timeout_elapsed = 0;
        for id in self.node_ids() {
            if id != self.node_id && self.node_is_active(id) {
                self.send_appendentries(cb, id)?;
            }
        }
        Ok(())
    }

    pub fn recv_appendentries(
        &mut self,
        cb: &mut dyn Callbacks,
        from: NodeId,
        ae: &AppendEntries,
        r: &mut AppendEntriesResponse,
    ) -> RaftResult<()> {
        let mut e: RaftResult<()> = Ok(());
        r.success = false;

        'process: {
            if self.is_candidate() && self.current_term == ae.term {
                self.become_follower();
            } else if self.current_term < ae.term {
                e = self.set_current_term(cb, ae.term);
                if e.is_err() {
                    break 'process;
                }
                self.become_follower();
            } else if ae.term < self.current_term {
                debug!("raft: AE term {} below current {}", ae.term, self.current_term);
                break 'process;
            }

            self.leader_id = from;
            self.timeout_elapsed = 0;

            // the log starts at 1
            if 0 < ae.prev_log_idx {
                match self.entry_term(ae.prev_log_idx) {
                    None => {
                        if self.current_idx() < ae.prev_log_idx {
                            debug!("raft: AE no entry at prev_idx {}", ae.prev_log_idx);
                            break 'process;
                        }
                    }
                    Some(term) if term != ae.prev_log_term => {
                        debug!(
                            "raft: AE prev term mismatch ({} vs {}) pli:{}",
                            term, ae.prev_log_term, ae.prev_log_idx
                        );
                        if ae.prev_log_idx <= self.commit_idx {
                            // can never be asked to roll back what we committed
                            e = Err(RaftError::Shutdown);
                            break 'process;
                        }
                        e = self.delete_entry_from_idx(cb, ae.prev_log_idx);
                        break 'process;
                    }
                    Some(_) => {}
                }
            }

            r.success = true;
            r.current_idx = ae.prev_log_idx;

            // skip entries we already have; a conflicting suffix is truncated
            let mut i = 0usize;
            while i < ae.entries.len() {
                let ety_index = ae.prev_log_idx + 1 + i as LogIndex;
                match self.entry_term(ety_index) {
                    Some(term) if term != ae.entries[i].term => {
                        if ety_index <= self.commit_idx {
                            e = Err(RaftError::Shutdown);
                            break 'process;
                        }
                        e = self.delete_entry_from_idx(cb, ety_index);
                        if e.is_err() {
                            break 'process;
                        }
                        break;
                    }
                    None if self.current_idx() < ety_index => break,
                    _ => {
                        r.current_idx = ety_index;
                        i += 1;
                        continue;
                    }
                }
            }

            let mut k = ae.entries.len() - i;
            let res = self.append_entries(cb, &ae.entries[i..], &mut k);
            i += k;
            r.current_idx = ae.prev_log_idx + i as LogIndex;
            if let Err(err) = res {
                e = Err(err);
                break 'process;
            }

            if self.commit_idx < ae.leader_commit {
                let new_commit = ae.leader_commit.min(r.current_idx);
                if self.commit_idx < new_commit {
                    self.set_commit_idx(new_commit);
                }
            }
        }

        r.term = self.current_term;
        if !r.success {
            r.current_idx = self.current_idx();
        }
        r.first_idx = ae.prev_log_idx + 1;
        e
    }

    pub fn recv_appendentries_response(
        &mut self,
        cb: &mut dyn Callbacks,
        from: NodeId,
        r: &AppendEntriesResponse,
    ) -> RaftResult<()> {
        if self.node(from).is_none() {
            return Err(RaftError::Shutdown);
        }
        if !self.is_leader() {
            return Err(RaftError::NotLeader);
        }

        if self.current_term < r.term {
            self.set_current_term(cb, r.term)?;
            self.become_follower();
            self.leader_id = NODE_NONE;
            return Ok(());
        } else if self.current_term != r.term {
            return Ok(());
        }

        let match_idx = self.node(from).map(|n| n.match_idx).unwrap_or(0);

        if !r.success {
            // walk next_idx back and retry
            let next_idx = self.node(from).map(|n| n.next_idx).unwrap_or(1);
            assert!(0 < next_idx);
            if match_idx == next_idx - 1 {
                return Ok(()); // stale
            }
            let new_next = if r.current_idx < next_idx - 1 {
                (r.current_idx + 1).min(self.current_idx())
            } else {
                next_idx - 1
            };
            if let Some(n) = self.node_mut(from) {
                n.set_next_idx(new_next);
            }
            self.send_appendentries(cb, from)?;
            return Ok(());
        }

        // a caught-up non-voting node can be promoted
        if !self.node_is_voting(from)
            && self.voting_cfg_change_log_idx == -1
            && self.current_idx() <= r.current_idx + 1
            && !self.node_is_voting_committed(from)
            && !self.node(from).map(|n| n.has_sufficient_logs()).unwrap_or(true)
        {
            if cb.node_has_sufficient_logs(from).is_ok() {
                if let Some(n) = self.node_mut(from) {
                    n.set_has_sufficient_logs();
                }
            }
        }

        if r.current_idx <= match_idx {
            return Ok(());
        }
        assert!(r.current_idx <= self.current_idx());

        if let Some(n) = self.node_mut(from) {
            n.set_next_idx(r.current_idx + 1);
            n.match_idx = r.current_idx;
        }

        // advance commit: majority match on an own-term entry
        let point = r.current_idx;
        if point != 0 && self.commit_idx < point {
            if self.entry_term(point) == Some(self.current_term) {
                let mut votes = 1;
                for n in self.nodes.iter() {
                    if n.id != self.node_id
                        && self.node_is_active(n.id)
                        && self.node_is_voting(n.id)
                        && point <= n.match_idx
                    {
                        votes += 1;
                    }
                }
                if self.num_voting_nodes() / 2 < votes {
                    self.set_commit_idx(point);
                }
            }
        }

        // keep streaming to peers that are still behind
        if self.node(from).map(|n| n.next_idx).unwrap_or(0) <= self.current_idx() {
            self.send_appendentries(cb, from)?;
        }

        Ok(())
    }

    /* ---- apply ---- */

    pub fn apply_all(&mut self, cb: &mut dyn Callbacks) -> RaftResult<()> {
        if self.snapshot_in_progress {
            return Ok(());
        }
        while self.last_applied_idx < self.commit_idx {
            self.apply_entry(cb)?;
        }
        Ok(())
    }

    pub fn apply_entry(&mut self, cb: &mut dyn Callbacks) -> RaftResult<()> {
        if self.snapshot_in_progress || self.last_applied_idx == self.commit_idx {
            return Err(RaftError::Shutdown);
        }
        let log_idx = self.last_applied_idx + 1;
        let (is_cfg, etype, entry_clone) = match self.log.get_at(log_idx) {
            None => return Err(RaftError::Shutdown),
            Some(e) => (e.is_cfg_change(), e.etype, e.clone()),
        };

        debug!("raft: applying log {} id {}", log_idx, entry_clone.id);

        self.last_applied_idx += 1;
        if let Err(e) = cb.applylog(&entry_clone, self.last_applied_idx) {
            if e == RaftError::Shutdown {
                return Err(RaftError::Shutdown);
            }
        }

        if log_idx == self.voting_cfg_change_log_idx {
            self.voting_cfg_change_log_idx = -1;
        }

        if !is_cfg {
            return Ok(());
        }

        let node_id = cb.log_get_node_id(&entry_clone, log_idx);
        let mut node_exists = self.node(node_id).is_some();
        assert!(node_exists || etype == LOGTYPE_REMOVE_NODE);

        match etype {
            LOGTYPE_ADD_NODE => {
                if let Some(n) = self.node_mut(node_id) {
                    n.set_has_sufficient_logs();
                }
                if node_id == self.node_id {
                    self.connected = ConnectStatus::Connected;
                }
            }
            LOGTYPE_DEMOTE_NODE => {
                if node_id == self.node_id {
                    self.connected = ConnectStatus::Disconnecting;
                }
            }
            LOGTYPE_REMOVE_NODE => {
                // keep the node while later pending entries still refer to it
                if node_exists && self.node(node_id).map(|n| n.offered_idx) == Some(log_idx) {
                    self.remove_node(cb, node_id);
                    node_exists = false;
                }
            }
            _ => {}
        }
        if node_exists {
            if let Some(n) = self.node_mut(node_id) {
                n.applied_idx = log_idx;
                if n.offered_idx == log_idx {
                    n.offered_idx = -1;
                }
            }
        }
        Ok(())
    }

    /* ---- snapshots ---- */

    pub fn send_installsnapshot(&mut self, cb: &mut dyn Callbacks, to: NodeId) -> RaftResult<()> {
        let is = InstallSnapshot {
            term: self.current_term,
            last_idx: self.log.base(),
            last_term: self.log.base_term(),
        };
        debug!("raft: sending installsnapshot li:{} lt:{}", is.last_idx, is.last_term);
        cb.send_installsnapshot(to, &is)
    }

    pub fn recv_installsnapshot(
        &mut self,
        cb: &mut dyn Callbacks,
        from: NodeId,
        is: &InstallSnapshot,
        r: &mut InstallSnapshotResponse,
    ) -> RaftResult<()> {
        r.term = self.current_term;
        r.last_idx = is.last_idx;
        r.complete = false;

        if is.term < self.current_term {
            return Ok(());
        }
        if self.current_term < is.term {
            self.set_current_term(cb, is.term)?;
            r.term = self.current_term;
        }
        if !self.is_follower() {
            self.become_follower();
        }
        self.leader_id = from;
        self.timeout_elapsed = 0;

        if is.last_idx <= self.commit_idx {
            // committed entries must match the snapshot
            r.complete = true;
            return Ok(());
        }
        if self.entry_term(is.last_idx) == Some(is.last_term) {
            self.set_commit_idx(is.last_idx);
            r.complete = true;
            return Ok(());
        }

        if cb.recv_installsnapshot(from, is, r)? {
            r.complete = true;
        }
        Ok(())
    }

    pub fn recv_installsnapshot_response(
        &mut self,
        cb: &mut dyn Callbacks,
        from: NodeId,
        r: &InstallSnapshotResponse,
    ) -> RaftResult<()> {
        if self.node(from).is_none() {
            return Err(RaftError::Shutdown);
        }
        if !self.is_leader() {
            return Err(RaftError::NotLeader);
        }
        if self.current_term < r.term {
            self.set_current_term(cb, r.term)?;
            self.become_follower();
            self.leader_id = NODE_NONE;
            return Ok(());
        } else if self.current_term != r.term {
            return Ok(());
        }

        cb.recv_installsnapshot_response(from, r)?;

        if !r.complete {
            return Ok(());
        }
        if let Some(n) = self.node_mut(from) {
            if n.match_idx < r.last_idx {
                n.match_idx = r.last_idx;
                n.set_next_idx(r.last_idx + 1);
            }
        }
        if self.node(from).map(|n| n.next_idx).unwrap_or(0) <= self.current_idx() {
            self.send_appendentries(cb, from)?;
        }
        Ok(())
    }

    /// Phase one of local compaction: freeze applies and elections.
    pub fn begin_snapshot(&mut self, cb: &mut dyn Callbacks, idx: LogIndex) -> RaftResult<()> {
        if self.commit_idx < idx {
            return Err(RaftError::NeedsSnapshot);
        }
        let term = match self.log.get_at(idx) {
            Some(e) => e.term,
            None => return Err(RaftError::NeedsSnapshot),
        };
        self.apply_all(cb)?;
        assert_eq!(self.commit_idx, self.last_applied_idx);
        self.set_snapshot_metadata(term, idx);
        self.snapshot_in_progress = true;
        debug!(
            "raft: begin snapshot sli:{} slt:{} slogs:{}",
            self.snapshot_last_idx,
            self.snapshot_last_term,
            self.num_snapshottable_logs()
        );
        Ok(())
    }

    /// Phase two: poll the compacted prefix out of the log.
    pub fn end_snapshot(&mut self, cb: &mut dyn Callbacks) -> RaftResult<()> {
        if !self.snapshot_in_progress || self.snapshot_last_idx == 0 {
            return Err(RaftError::NeedsSnapshot);
        }
        // a catch-up peer with uncommitted membership must re-learn its state
        // from the snapshot
        let sli = self.snapshot_last_idx;
        let reset: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| n.applied_idx <= sli)
            .map(|n| n.id)
            .filter(|&id| !self.node_is_voting_committed(id))
            .collect();
        for id in reset {
            if let Some(n) = self.node_mut(id) {
                n.applied_idx = -1;
            }
        }
        self.log.poll(cb, sli)?;
        self.snapshot_in_progress = false;
        debug!(
            "raft: end snapshot base:{} commit:{} current:{}",
            self.log.base(),
            self.commit_idx,
            self.current_idx()
        );
        Ok(())
    }

    pub fn begin_load_snapshot(
        &mut self,
        last_included_term: Term,
        last_included_index: LogIndex,
    ) -> RaftResult<()> {
        if last_included_index == -1 {
            return Err(RaftError::NeedsSnapshot);
        }
        if last_included_term == self.snapshot_last_term && last_included_index == self.snapshot_last_idx
        {
            return Err(RaftError::SnapshotAlreadyLoaded);
        }
        if last_included_index <= self.commit_idx {
            return Err(RaftError::NeedsSnapshot);
        }
        self.log.load_from_snapshot(last_included_index, last_included_term);
        self.commit_idx = last_included_index;
        self.last_applied_idx = last_included_index;
        self.set_snapshot_metadata(last_included_term, last_included_index);
        Ok(())
    }

    pub fn end_load_snapshot(&mut self) {
        let sli = self.snapshot_last_idx;
        let voting: Vec<NodeId> = self.node_ids();
        for id in voting {
            if let Some(n) = self.node_mut(id) {
                n.offered_idx = sli;
                n.applied_idx = sli;
            }
            if self.node_is_voting(id) {
                if let Some(n) = self.node_mut(id) {
                    n.set_has_sufficient_logs();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LOGTYPE_ADD_NONVOTING_NODE;
    use crate::LOGTYPE_NORMAL;

    #[derive(Default)]
    struct Mock {
        sent_rv: Vec<(NodeId, RequestVote)>,
        sent_ae: Vec<(NodeId, AppendEntries)>,
        sent_is: Vec<(NodeId, InstallSnapshot)>,
        applied: Vec<(u32, LogIndex)>,
        persisted_terms: Vec<(Term, NodeId)>,
        persisted_votes: Vec<NodeId>,
        sufficient: Vec<NodeId>,
        refuse_sufficient: bool,
    }

    impl Callbacks for Mock {
        fn send_requestvote(&mut self, to: NodeId, msg: &RequestVote) -> RaftResult<()> {
            self.sent_rv.push((to, msg.clone()));
            Ok(())
        }
        fn send_appendentries(&mut self, to: NodeId, msg: &AppendEntries) -> RaftResult<()> {
            self.sent_ae.push((to, msg.clone()));
            Ok(())
        }
        fn send_installsnapshot(&mut self, to: NodeId, msg: &InstallSnapshot) -> RaftResult<()> {
            self.sent_is.push((to, *msg));
            Ok(())
        }
        fn applylog(&mut self, entry: &Entry, idx: LogIndex) -> RaftResult<()> {
            self.applied.push((entry.id, idx));
            Ok(())
        }
        fn persist_vote(&mut self, vote: NodeId) -> RaftResult<()> {
            self.persisted_votes.push(vote);
            Ok(())
        }
        fn persist_term(&mut self, term: Term, vote: NodeId) -> RaftResult<()> {
            self.persisted_terms.push((term, vote));
            Ok(())
        }
        fn log_get_node_id(&mut self, entry: &Entry, _idx: LogIndex) -> NodeId {
            let mut b = [0u8; 4];
            b.copy_from_slice(&entry.data[..4]);
            NodeId::from_le_bytes(b)
        }
        fn node_has_sufficient_logs(&mut self, node: NodeId) -> RaftResult<()> {
            if self.refuse_sufficient {
                return Err(RaftError::NotLeader);
            }
            self.sufficient.push(node);
            Ok(())
        }
    }

    fn ety(id: u32, term: Term) -> Entry {
        Entry { term, id, etype: LOGTYPE_NORMAL, data: vec![] }
    }

    fn cfg_ety(id: u32, term: Term, etype: i32, node: NodeId) -> Entry {
        Entry { term, id, etype, data: node.to_le_bytes().to_vec() }
    }

    fn cluster3(cb: &mut Mock) -> Server {
        let mut s = Server::new();
        let _ = s.add_node(cb, 1, true);
        let _ = s.add_node(cb, 2, false);
        let _ = s.add_node(cb, 3, false);
        s
    }

    fn append_raw(s: &mut Server, cb: &mut Mock, e: Entry) {
        let mut n = 1;
        s.append_entries(cb, &[e], &mut n).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn single_voting_node_becomes_leader() {
        let mut cb = Mock::default();
        let mut s = Server::new();
        let _ = s.add_node(&mut cb, 1, true);
        assert!(!s.is_leader());
        s.periodic(&mut cb, 1).unwrap();
        assert!(s.is_leader());
        assert_eq!(s.current_leader(), 1);
    }

    #[test]
    fn election_timeout_starts_prevote_round() {
        let mut cb = Mock::default();
        let mut s = cluster3(&mut cb);
        s.periodic(&mut cb, 2 * s.election_timeout() + 1).unwrap();
        assert!(s.is_candidate());
        assert!(!s.is_prevoted_candidate());
        // term is untouched during the prevote round
        assert_eq!(s.current_term(), 0);
        assert!(cb.persisted_terms.is_empty());
        assert_eq!(cb.sent_rv.len(), 2);
        for (_, rv) in &cb.sent_rv {
            assert!(rv.prevote);
            assert_eq!(rv.term, 1);
        }
    }

    #[test]
    fn prevote_majority_then_vote_majority_wins() {
        let mut cb = Mock::default();
        let mut s = cluster3(&mut cb);
        s.periodic(&mut cb, 2 * s.election_timeout() + 1).unwrap();
        let r = RequestVoteResponse { term: 0, vote_granted: VOTE_GRANTED, prevote: true };
        s.recv_requestvote_response(&mut cb, 2, &r).unwrap();
        // prevote won: the real election bumps and persists the term
        assert!(s.is_prevoted_candidate());
        assert_eq!(s.current_term(), 1);
        assert_eq!(cb.persisted_terms, vec![(1, NODE_NONE)]);
        assert_eq!(cb.persisted_votes, vec![1]);
        let r = RequestVoteResponse { term: 1, vote_granted: VOTE_GRANTED, prevote: false };
        s.recv_requestvote_response(&mut cb, 2, &r).unwrap();
        assert!(s.is_leader());
    }

    #[test]
    fn leader_stickiness_rejects_votes() {
        let mut cb = Mock::default();
        let mut s = cluster3(&mut cb);
        // node 2 is a live leader from our point of view
        let ae = AppendEntries { term: 0, ..Default::default() };
        let mut aer = AppendEntriesResponse::default();
        s.recv_appendentries(&mut cb, 2, &ae, &mut aer).unwrap();
        assert_eq!(s.current_leader(), 2);

        let rv = RequestVote { term: 5, candidate_id: 3, last_log_idx: 0, last_log_term: 0, prevote: true };
        let mut r = RequestVoteResponse::default();
        s.recv_requestvote(&mut cb, 3, &rv, &mut r).unwrap();
        assert_eq!(r.vote_granted, VOTE_NOT_GRANTED);
        // and the term was not disturbed either
        assert_eq!(s.current_term(), 0);
    }

    #[test]
    fn vote_requires_up_to_date_log() {
        let mut cb = Mock::default();
        let mut s = cluster3(&mut cb);
        let mut e = ety(1, 2);
        e.term = 2;
        append_raw(&mut s, &mut cb, e);
        s.set_current_term(&mut cb, 2).unwrap();

        // stale last_log_term loses
        let rv = RequestVote { term: 3, candidate_id: 2, last_log_idx: 4, last_log_term: 1, prevote: false };
        let mut r = RequestVoteResponse::default();
        s.recv_requestvote(&mut cb, 2, &rv, &mut r).unwrap();
        assert_eq!(r.vote_granted, VOTE_NOT_GRANTED);

        // equal term, longer log wins
        let rv = RequestVote { term: 3, candidate_id: 2, last_log_idx: 1, last_log_term: 2, prevote: false };
        let mut r = RequestVoteResponse::default();
        s.recv_requestvote(&mut cb, 2, &rv, &mut r).unwrap();
        assert_eq!(r.vote_granted, VOTE_GRANTED);
        assert_eq!(cb.persisted_votes, vec![2]);
    }

    #[test]
    fn voted_for_is_not_reset_within_term() {
        let mut cb = Mock::default();
        let mut s = cluster3(&mut cb);
        let rv = RequestVote { term: 1, candidate_id: 2, last_log_idx: 0, last_log_term: 0, prevote: false };
        let mut r = RequestVoteResponse::default();
        s.recv_requestvote(&mut cb, 2, &rv, &mut r).unwrap();
        assert_eq!(r.vote_granted, VOTE_GRANTED);
        let rv = RequestVote { term: 1, candidate_id: 3, last_log_idx: 9, last_log_term: 1, prevote: false };
        let mut r = RequestVoteResponse::default();
        s.recv_requestvote(&mut cb, 3, &rv, &mut r).unwrap();
        assert_eq!(r.vote_granted, VOTE_NOT_GRANTED);
        assert_eq!(s.voted_for(), 2);
    }

    #[test]
    fn appendentries_rejects_old_term() {
        let mut cb = Mock::default();
        let mut s = cluster3(&mut cb);
        s.set_current_term(&mut cb, 2).unwrap();
        let ae = AppendEntries { term: 1, ..Default::default() };
        let mut r = AppendEntriesResponse::default();
        s.recv_appendentries(&mut cb, 2, &ae, &mut r).unwrap();
        assert!(!r.success);
        assert_eq!(r.term, 2);
    }

    #[test]
    fn appendentries_appends_and_commits() {
        let mut cb = Mock::default();
        let mut s = cluster3(&mut cb);
        let ae = AppendEntries {
            term: 1,
            prev_log_idx: 0,
            prev_log_term: 0,
            leader_commit: 1,
            entries: vec![ety(10, 1), ety(11, 1)],
        };
        let mut r = AppendEntriesResponse::default();
        s.recv_appendentries(&mut cb, 2, &ae, &mut r).unwrap();
        assert!(r.success);
        assert_eq!(r.current_idx, 2);
        assert_eq!(s.commit_idx(), 1);
        s.periodic(&mut cb, 1).unwrap();
        assert_eq!(cb.applied, vec![(10, 1)]);
    }

    #[test]
    fn appendentries_truncates_conflicting_suffix() {
        let mut cb = Mock::default();
        let mut s = cluster3(&mut cb);
        append_raw(&mut s, &mut cb, ety(1, 1));
        append_raw(&mut s, &mut cb, ety(2, 1));
        append_raw(&mut s, &mut cb, ety(3, 1));
        // a new leader at term 2 replaces entries 2..3
        let ae = AppendEntries {
            term: 2,
            prev_log_idx: 1,
            prev_log_term: 1,
            leader_commit: 0,
            entries: vec![ety(9, 2)],
        };
        let mut r = AppendEntriesResponse::default();
        s.recv_appendentries(&mut cb, 2, &ae, &mut r).unwrap();
        assert!(r.success);
        assert_eq!(s.current_idx(), 2);
        assert_eq!(s.entry(2).unwrap().id, 9);
        assert_eq!(s.entry(1).unwrap().id, 1);
    }

    #[test]
    fn appendentries_never_truncates_committed() {
        let mut cb = Mock::default();
        let mut s = cluster3(&mut cb);
        let ae = AppendEntries {
            term: 1,
            prev_log_idx: 0,
            prev_log_term: 0,
            leader_commit: 2,
            entries: vec![ety(1, 1), ety(2, 1)],
        };
        let mut r = AppendEntriesResponse::default();
        s.recv_appendentries(&mut cb, 2, &ae, &mut r).unwrap();
        assert_eq!(s.commit_idx(), 2);
        // conflicting prev below commit is a fatal invariant violation
        let ae = AppendEntries {
            term: 2,
            prev_log_idx: 2,
            prev_log_term: 9,
            leader_commit: 2,
            entries: vec![],
        };
        let mut r = AppendEntriesResponse::default();
        let e = s.recv_appendentries(&mut cb, 2, &ae, &mut r);
        assert_eq!(e, Err(RaftError::Shutdown));
    }

    #[test]
    fn commit_requires_majority_on_own_term_entry() {
        let mut cb = Mock::default();
        let mut s = cluster3(&mut cb);
        append_raw(&mut s, &mut cb, ety(1, 1));
        s.set_current_term(&mut cb, 2).unwrap();
        s.become_leader(&mut cb);

        // entry 1 is from term 1: majority match does not commit it
        let r = AppendEntriesResponse { term: 2, success: true, current_idx: 1, first_idx: 1 };
        s.recv_appendentries_response(&mut cb, 2, &r).unwrap();
        assert_eq!(s.commit_idx(), 0);

        // an own-term entry drags the older one in with it
        let mut n = 1;
        s.append_entries(&mut cb, &[ety(2, 2)], &mut n).unwrap();
        let r = AppendEntriesResponse { term: 2, success: true, current_idx: 2, first_idx: 2 };
        s.recv_appendentries_response(&mut cb, 2, &r).unwrap();
        assert_eq!(s.commit_idx(), 2);
    }

    #[test]
    fn failed_response_walks_next_idx_back() {
        let mut cb = Mock::default();
        let mut s = cluster3(&mut cb);
        for i in 1..=4 {
            append_raw(&mut s, &mut cb, ety(i, 1));
        }
        s.set_current_term(&mut cb, 1).unwrap();
        s.become_leader(&mut cb);
        assert_eq!(s.node(2).unwrap().next_idx, 5);
        cb.sent_ae.clear();
        let r = AppendEntriesResponse { term: 1, success: false, current_idx: 1, first_idx: 5 };
        s.recv_appendentries_response(&mut cb, 2, &r).unwrap();
        assert_eq!(s.node(2).unwrap().next_idx, 2);
        // and it retried immediately
        assert_eq!(cb.sent_ae.len(), 1);
        assert_eq!(cb.sent_ae[0].1.prev_log_idx, 1);
    }

    #[test]
    fn stale_term_response_makes_follower() {
        let mut cb = Mock::default();
        let mut s = cluster3(&mut cb);
        s.set_current_term(&mut cb, 1).unwrap();
        s.become_leader(&mut cb);
        let r = AppendEntriesResponse { term: 3, success: false, current_idx: 0, first_idx: 1 };
        s.recv_appendentries_response(&mut cb, 2, &r).unwrap();
        assert!(s.is_follower());
        assert_eq!(s.current_term(), 3);
    }

    #[test]
    fn only_one_voting_change_in_flight() {
        let mut cb = Mock::default();
        let mut s = cluster3(&mut cb);
        s.set_current_term(&mut cb, 1).unwrap();
        s.become_leader(&mut cb);
        let _ = s.add_non_voting_node(&mut cb, 4, false);
        s.recv_entry(&mut cb, &cfg_ety(50, 0, LOGTYPE_ADD_NODE, 4)).unwrap();
        let e = s.recv_entry(&mut cb, &cfg_ety(51, 0, LOGTYPE_ADD_NODE, 4));
        assert_eq!(e.unwrap_err(), RaftError::OneVotingChangeOnly);
    }

    #[test]
    fn nonvoting_node_catchup_triggers_promotion_callback() {
        let mut cb = Mock::default();
        let mut s = cluster3(&mut cb);
        s.set_current_term(&mut cb, 1).unwrap();
        s.become_leader(&mut cb);
        let _ = s.add_non_voting_node(&mut cb, 4, false);
        for i in 1..=3 {
            append_raw(&mut s, &mut cb, ety(i, 1));
        }
        let r = AppendEntriesResponse { term: 1, success: true, current_idx: s.current_idx(), first_idx: 1 };
        s.recv_appendentries_response(&mut cb, 4, &r).unwrap();
        assert_eq!(cb.sufficient, vec![4]);
        assert!(s.node(4).unwrap().has_sufficient_logs());
        // reported once only
        let r = AppendEntriesResponse { term: 1, success: true, current_idx: s.current_idx(), first_idx: 1 };
        s.recv_appendentries_response(&mut cb, 4, &r).unwrap();
        assert_eq!(cb.sufficient.len(), 1);
    }

    #[test]
    fn remove_node_entry_detaches_on_apply() {
        let mut cb = Mock::default();
        let mut s = cluster3(&mut cb);
        s.set_current_term(&mut cb, 1).unwrap();
        s.become_leader(&mut cb);
        append_raw(&mut s, &mut cb, cfg_ety(60, 1, LOGTYPE_REMOVE_NODE, 3));
        assert!(!s.node_is_active(3));
        s.set_commit_idx(s.current_idx());
        s.apply_all(&mut cb).unwrap();
        assert!(s.node(3).is_none());
        assert_eq!(s.num_nodes(), 2);
    }

    #[test]
    fn snapshot_two_phase_compacts_log() {
        let mut cb = Mock::default();
        let mut s = cluster3(&mut cb);
        for i in 1..=4 {
            append_raw(&mut s, &mut cb, ety(i, 1));
        }
        s.set_commit_idx(3);
        s.begin_snapshot(&mut cb, 3).unwrap();
        assert!(s.snapshot_in_progress());
        // no applies and no elections while snapshotting
        s.periodic(&mut cb, 10 * s.election_timeout()).unwrap();
        assert!(!s.is_candidate());
        s.end_snapshot(&mut cb).unwrap();
        assert!(!s.snapshot_in_progress());
        assert_eq!(s.first_entry_idx(), 4);
        assert_eq!(s.log_count(), 1);
        assert_eq!(s.snapshot_last_idx(), 3);
    }

    #[test]
    fn peer_behind_snapshot_gets_installsnapshot() {
        let mut cb = Mock::default();
        let mut s = cluster3(&mut cb);
        for i in 1..=4 {
            append_raw(&mut s, &mut cb, ety(i, 1));
        }
        s.set_current_term(&mut cb, 1).unwrap();
        s.set_commit_idx(4);
        s.begin_snapshot(&mut cb, 4).unwrap();
        s.end_snapshot(&mut cb).unwrap();
        s.become_leader(&mut cb);
        cb.sent_is.clear();
        s.node_mut(2).unwrap().set_next_idx(2);
        s.send_appendentries(&mut cb, 2).unwrap();
        assert_eq!(cb.sent_is.len(), 1);
        assert_eq!(cb.sent_is[0].1.last_idx, 4);
        assert_eq!(cb.sent_is[0].1.last_term, 1);
    }

    #[test]
    fn installsnapshot_follower_side_fast_path() {
        let mut cb = Mock::default();
        let mut s = cluster3(&mut cb);
        append_raw(&mut s, &mut cb, ety(1, 1));
        // snapshot covering what we already have: complete, commit moves
        let is = InstallSnapshot { term: 1, last_idx: 1, last_term: 1 };
        let mut r = InstallSnapshotResponse::default();
        s.recv_installsnapshot(&mut cb, 2, &is, &mut r).unwrap();
        assert!(r.complete);
        assert_eq!(s.commit_idx(), 1);
    }

    #[test]
    fn isolated_leader_rejoins_as_follower_and_truncates() {
        // cluster {1,2,3}: we are node 1, leader at term 5 with an
        // uncommitted tail; the partition heals and the new term-6 leader
        // overwrites it
        let mut cb = Mock::default();
        let mut s = cluster3(&mut cb);
        s.set_current_term(&mut cb, 5).unwrap();
        s.become_leader(&mut cb);
        append_raw(&mut s, &mut cb, ety(1, 5));
        append_raw(&mut s, &mut cb, ety(2, 5));
        assert_eq!(s.commit_idx(), 0);

        let ae = AppendEntries {
            term: 6,
            prev_log_idx: 0,
            prev_log_term: 0,
            leader_commit: 1,
            entries: vec![ety(7, 6)],
        };
        let mut r = AppendEntriesResponse::default();
        s.recv_appendentries(&mut cb, 2, &ae, &mut r).unwrap();
        assert!(s.is_follower());
        assert_eq!(s.current_term(), 6);
        assert_eq!(s.current_leader(), 2);
        assert!(r.success);
        assert_eq!(s.current_idx(), 1);
        assert_eq!(s.entry(1).unwrap().id, 7);
        assert_eq!(s.commit_idx(), 1);
    }

    #[test]
    fn entry_response_commit_tracking() {
        let mut cb = Mock::default();
        let mut s = Server::new();
        let _ = s.add_node(&mut cb, 1, true);
        s.set_current_term(&mut cb, 2).unwrap();
        s.periodic(&mut cb, 1).unwrap();
        let resp = s.recv_entry(&mut cb, &ety(42, 0)).unwrap();
        assert_eq!(resp.term, 2);
        assert_eq!(s.entry_response_committed(&resp), 1);
        // an overwritten slot reports -1
        let stale = EntryResponse { id: 42, term: 1, idx: resp.idx };
        assert_eq!(s.entry_response_committed(&stale), -1);
    }

    #[test]
    fn recv_entry_rejected_when_not_leader() {
        let mut cb = Mock::default();
        let mut s = cluster3(&mut cb);
        let e = s.recv_entry(&mut cb, &ety(1, 0));
        assert_eq!(e.unwrap_err(), RaftError::NotLeader);
    }

    #[test]
    fn nonvoting_add_is_not_a_voting_change() {
        let mut cb = Mock::default();
        let mut s = cluster3(&mut cb);
        s.set_current_term(&mut cb, 1).unwrap();
        s.become_leader(&mut cb);
        let _ = s.add_non_voting_node(&mut cb, 4, false);
        s.recv_entry(&mut cb, &cfg_ety(50, 0, LOGTYPE_ADD_NONVOTING_NODE, 4)).unwrap();
        // still free to start a voting change afterwards
        s.recv_entry(&mut cb, &cfg_ety(51, 0, LOGTYPE_ADD_NODE, 4)).unwrap();
    }
}
