//! Replicated-log consensus core.
//!
//! Transport and storage are injected through [`Callbacks`]; the server only
//! manipulates its in-memory state and the entry log, so the whole state
//! machine can be driven from unit tests with recording mocks.

use num_enum::{IntoPrimitive, TryFromPrimitive};

pub mod log;
pub mod node;
pub mod server;

pub use crate::log::Log;
pub use crate::node::Node;
pub use crate::server::Server;

pub type Term = i64;
pub type LogIndex = i64;
pub type NodeId = i32;

/// "no node" sentinel, used for `voted_for` and `leader_id`.
pub const NODE_NONE: NodeId = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum RaftError {
    NotLeader = -2,
    OneVotingChangeOnly = -3,
    Shutdown = -4,
    NoMem = -5,
    NeedsSnapshot = -6,
    SnapshotInProgress = -7,
    SnapshotAlreadyLoaded = -8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum State {
    None = 0,
    Follower = 1,
    Candidate = 2,
    Leader = 3,
}

/* entry types; values above USER are application extensions */
pub const LOGTYPE_NORMAL: i32 = 0;
pub const LOGTYPE_ADD_NONVOTING_NODE: i32 = 1;
pub const LOGTYPE_ADD_NODE: i32 = 2;
pub const LOGTYPE_DEMOTE_NODE: i32 = 3;
pub const LOGTYPE_REMOVE_NODE: i32 = 4;
pub const LOGTYPE_USER: i32 = 100;

/// Entry stored in the replicated log. The index is positional (assigned at
/// append time); `id` is an application-chosen tag used to confirm commits.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    pub term: Term,
    pub id: u32,
    pub etype: i32,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn new(id: u32, etype: i32, data: Vec<u8>) -> Self {
        Entry { term: 0, id, etype, data }
    }

    pub fn is_voting_cfg_change(&self) -> bool {
        self.etype == LOGTYPE_ADD_NODE || self.etype == LOGTYPE_DEMOTE_NODE
    }

    pub fn is_cfg_change(&self) -> bool {
        matches!(
            self.etype,
            LOGTYPE_ADD_NONVOTING_NODE | LOGTYPE_ADD_NODE | LOGTYPE_DEMOTE_NODE | LOGTYPE_REMOVE_NODE
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_idx: LogIndex,
    pub last_log_term: Term,
    pub prevote: bool,
}

pub const VOTE_GRANTED: i32 = 1;
pub const VOTE_NOT_GRANTED: i32 = 0;
pub const VOTE_UNKNOWN_NODE: i32 = -1;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestVoteResponse {
    pub term: Term,
    /// `VOTE_GRANTED`, `VOTE_NOT_GRANTED` or `VOTE_UNKNOWN_NODE`
    pub vote_granted: i32,
    pub prevote: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppendEntries {
    pub term: Term,
    pub prev_log_idx: LogIndex,
    pub prev_log_term: Term,
    pub leader_commit: LogIndex,
    pub entries: Vec<Entry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// on success the highest index appended, otherwise our current index
    pub current_idx: LogIndex,
    /// first index carried by the request this answers
    pub first_idx: LogIndex,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InstallSnapshot {
    pub term: Term,
    pub last_idx: LogIndex,
    pub last_term: Term,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub last_idx: LogIndex,
    pub complete: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipEvent {
    Add,
    Remove,
}

/// Tracking of entry submissions, so a client can later ask whether the
/// entry it submitted made it in (`Server::entry_response_committed`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EntryResponse {
    pub id: u32,
    pub term: Term,
    pub idx: LogIndex,
}

pub type RaftResult<T> = Result<T, RaftError>;

/// Injected transport, persistence and state-machine hooks.
///
/// The log callbacks (`log_offer`, `log_poll`, `log_pop`) receive the number
/// of affected entries through `n` and may shrink it to report partial
/// success; the in-memory log is adjusted to exactly what was accepted and
/// the error is handed back to the caller.
pub trait Callbacks {
    fn send_requestvote(&mut self, to: NodeId, msg: &RequestVote) -> RaftResult<()>;
    fn send_appendentries(&mut self, to: NodeId, msg: &AppendEntries) -> RaftResult<()>;
    fn send_installsnapshot(&mut self, _to: NodeId, _msg: &InstallSnapshot) -> RaftResult<()> {
        Ok(())
    }

    /// Returns Ok(true) once the whole snapshot has been received.
    fn recv_installsnapshot(
        &mut self,
        _from: NodeId,
        _msg: &InstallSnapshot,
        _resp: &mut InstallSnapshotResponse,
    ) -> RaftResult<bool> {
        Ok(false)
    }

    fn recv_installsnapshot_response(
        &mut self,
        _from: NodeId,
        _resp: &InstallSnapshotResponse,
    ) -> RaftResult<()> {
        Ok(())
    }

    /// Apply a committed entry to the state machine.
    fn applylog(&mut self, entry: &Entry, idx: LogIndex) -> RaftResult<()>;

    /// MUST be flushed to stable storage before returning.
    fn persist_vote(&mut self, vote: NodeId) -> RaftResult<()>;

    /// MUST atomically persist the term together with the cleared vote.
    fn persist_term(&mut self, term: Term, vote: NodeId) -> RaftResult<()>;

    fn log_offer(&mut self, entries: &[Entry], first_idx: LogIndex, n: &mut usize) -> RaftResult<()> {
        let _ = (entries, first_idx);
        let _ = n;
        Ok(())
    }

    fn log_poll(&mut self, entries: &[Entry], first_idx: LogIndex, n: &mut usize) -> RaftResult<()> {
        let _ = (entries, first_idx);
        let _ = n;
        Ok(())
    }

    fn log_pop(&mut self, entries: &[Entry], first_idx: LogIndex, n: &mut usize) -> RaftResult<()> {
        let _ = (entries, first_idx);
        let _ = n;
        Ok(())
    }

    /// For configuration entries only: which node does this entry affect?
    fn log_get_node_id(&mut self, entry: &Entry, idx: LogIndex) -> NodeId;

    /// A non-voting node caught up; Ok(()) acknowledges the notification
    /// (the node is then marked and not reported again).
    fn node_has_sufficient_logs(&mut self, _node: NodeId) -> RaftResult<()> {
        Err(RaftError::NotLeader)
    }

    fn notify_membership_event(&mut self, _node: NodeId, _event: MembershipEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_cfg_change_classification() {
        let mut e = Entry::new(1, LOGTYPE_NORMAL, vec![]);
        assert!(!e.is_cfg_change());
        assert!(!e.is_voting_cfg_change());
        e.etype = LOGTYPE_ADD_NODE;
        assert!(e.is_cfg_change());
        assert!(e.is_voting_cfg_change());
        e.etype = LOGTYPE_ADD_NONVOTING_NODE;
        assert!(e.is_cfg_change());
        assert!(!e.is_voting_cfg_change());
        e.etype = LOGTYPE_USER + 7;
        assert!(!e.is_cfg_change());
    }

    #[test]
    fn error_codes_roundtrip() {
        assert_eq!(i32::from(RaftError::Shutdown), -4);
        assert_eq!(RaftError::try_from(-2).unwrap(), RaftError::NotLeader);
    }
}
