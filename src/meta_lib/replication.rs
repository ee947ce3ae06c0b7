//! Bridges the command dispatcher to the consensus core: every changelog
//! line the leader produces becomes a replicated log entry, and committed
//! entries come back out as `(version, line)` pairs ready for the replay
//! sink on follower masters.

use anyhow::{anyhow, Result};
use raft::{
    AppendEntries, Callbacks, Entry, InstallSnapshot, LogIndex, NodeId, RaftResult, RequestVote,
    Term, LOGTYPE_USER, NODE_NONE,
};

use super::dispatcher::Replicator;
use super::utils::{put64, Unpack};
use super::wire::{self, Message};

/// Entry payload: the meta version followed by the changelog line bytes.
pub fn encode_entry_data(version: u64, data: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + data.len());
    put64(&mut buf, version);
    buf.extend_from_slice(data.as_bytes());
    buf
}

pub fn decode_entry_data(data: &[u8]) -> Result<(u64, String)> {
    let mut u = Unpack::new(data);
    let version = u.get64()?;
    let line = String::from_utf8(u.bytes(u.remaining())?.to_vec())?;
    Ok((version, line))
}

/// Callback sink for the consensus core: outgoing messages are queued as
/// wire frames for the transport to drain, committed entries surface as
/// parsed changelog lines, and term/vote land in memory (a deployment
/// persists them next to the changelog).
#[derive(Default)]
pub struct ReplState {
    pub outbox: Vec<(NodeId, Vec<u8>)>,
    pub committed: Vec<(u64, String)>,
    pub current_term: Term,
    pub voted_for: NodeId,
}

impl Callbacks for ReplState {
    fn send_requestvote(&mut self, to: NodeId, msg: &RequestVote) -> RaftResult<()> {
        self.outbox.push((to, wire::encode(&Message::RequestVote(msg.clone()))));
        Ok(())
    }

    fn send_appendentries(&mut self, to: NodeId, msg: &AppendEntries) -> RaftResult<()> {
        self.outbox.push((to, wire::encode(&Message::AppendEntries(msg.clone()))));
        Ok(())
    }

    fn send_installsnapshot(&mut self, to: NodeId, msg: &InstallSnapshot) -> RaftResult<()> {
        self.outbox.push((to, wire::encode(&Message::InstallSnapshot(*msg))));
        Ok(())
    }

    fn applylog(&mut self, entry: &Entry, _idx: LogIndex) -> RaftResult<()> {
        if entry.etype == LOGTYPE_USER {
            if let Ok(parsed) = decode_entry_data(&entry.data) {
                self.committed.push(parsed);
            }
        }
        Ok(())
    }

    fn persist_vote(&mut self, vote: NodeId) -> RaftResult<()> {
        self.voted_for = vote;
        Ok(())
    }

    fn persist_term(&mut self, term: Term, vote: NodeId) -> RaftResult<()> {
        self.current_term = term;
        self.voted_for = vote;
        Ok(())
    }

    fn log_get_node_id(&mut self, entry: &Entry, _idx: LogIndex) -> NodeId {
        // membership entries carry the node id in their payload
        if entry.data.len() >= 4 {
            NodeId::from_le_bytes(entry.data[..4].try_into().unwrap())
        } else {
            NODE_NONE
        }
    }
}

/// The leader-side replicator plugged into the dispatcher.
pub struct RaftReplicator {
    pub server: raft::Server,
    pub state: ReplState,
    next_entry_id: u32,
}

impl RaftReplicator {
    /// A lone voting member; it promotes itself on the first tick.
    pub fn single_node(id: NodeId) -> Self {
        let mut state = ReplState::default();
        let mut server = raft::Server::new();
        let _ = server.add_node(&mut state, id, true);
        RaftReplicator { server, state, next_entry_id: 1 }
    }

    pub fn periodic(&mut self, msec: i32) -> RaftResult<()> {
        self.server.periodic(&mut self.state, msec)
    }

    /// Committed lines accumulated since the last drain.
    pub fn take_committed(&mut self) -> Vec<(u64, String)> {
        std::mem::take(&mut self.state.committed)
    }
}

/// Shared-handle form so a reactor can keep driving the timers while the
/// dispatcher owns a replicator handle.
impl Replicator for std::rc::Rc<std::cell::RefCell<RaftReplicator>> {
    fn replicate(&mut self, version: u64, data: &str) -> Result<()> {
        self.borrow_mut().replicate(version, data)
    }
}

impl Replicator for RaftReplicator {
    fn replicate(&mut self, version: u64, data: &str) -> Result<()> {
        if !self.server.is_leader() {
            return Err(anyhow!("not the leader"));
        }
        let id = self.next_entry_id;
        self.next_entry_id = self.next_entry_id.wrapping_add(1);
        let e = Entry::new(id, LOGTYPE_USER, encode_entry_data(version, data));
        self.server
            .recv_entry(&mut self.state, &e)
            .map_err(|e| anyhow!("consensus rejected entry: {:?}", e))?;
        // committed entries apply on the next tick; a lone node can settle
        // immediately
        self.server
            .apply_all(&mut self.state)
            .map_err(|e| anyhow!("apply failed: {:?}", e))?;
        Ok(())
    }
}
