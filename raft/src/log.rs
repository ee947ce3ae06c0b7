//! Entry log: a ring buffer over `[base+1, base+count]` with the compacted
//! prefix summarized by `base`/`base_term`.

use std::collections::VecDeque;

use crate::{Callbacks, Entry, LogIndex, RaftResult, Term};

#[derive(Default)]
pub struct Log {
    entries: VecDeque<Entry>,
    /// index of the last compacted entry (first live index minus one)
    base: LogIndex,
    base_term: Term,
}

impl Log {
    pub fn new() -> Self {
        Log::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.base = 0;
        self.base_term = 0;
    }

    /// Drops everything and restarts the log after an installed snapshot.
    pub fn load_from_snapshot(&mut self, idx: LogIndex, term: Term) {
        self.clear();
        self.base = idx;
        self.base_term = term;
    }

    pub fn count(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    pub fn base(&self) -> LogIndex {
        self.base
    }

    pub fn base_term(&self) -> Term {
        self.base_term
    }

    pub fn current_idx(&self) -> LogIndex {
        self.base + self.count()
    }

    fn has_idx(&self, idx: LogIndex) -> bool {
        self.base < idx && idx <= self.current_idx()
    }

    pub fn get_at(&self, idx: LogIndex) -> Option<&Entry> {
        if !self.has_idx(idx) {
            return None;
        }
        self.entries.get((idx - self.base - 1) as usize)
    }

    /// Maximal contiguous run starting at `idx` (ring buffers may split a
    /// range in two; callers retry from where the run ended).
    pub fn get_from(&self, idx: LogIndex) -> &[Entry] {
        if !self.has_idx(idx) {
            return &[];
        }
        let off = (idx - self.base - 1) as usize;
        let (a, b) = self.entries.as_slices();
        if off < a.len() {
            &a[off..]
        } else {
            &b[off - a.len()..]
        }
    }

    pub fn peektail(&self) -> Option<&Entry> {
        self.entries.back()
    }

    /// Appends up to `*n` entries. `log_offer` may shrink the count; only the
    /// accepted prefix enters the log, and the callback's error (if any) is
    /// handed back with `*n` reporting what was kept.
    pub fn append(&mut self, cb: &mut dyn Callbacks, entries: &[Entry], n: &mut usize) -> RaftResult<()> {
        let want = (*n).min(entries.len());
        let idx = self.current_idx() + 1;
        let batch = &entries[..want];
        let mut k = want;
        let res = cb.log_offer(batch, idx, &mut k);
        for e in &batch[..k] {
            self.entries.push_back(e.clone());
        }
        *n = k;
        res
    }

    /// Removes entries from the tail down to and including `idx`. `log_pop`
    /// sees the doomed suffix; partial acceptance pops only that many from
    /// the tail.
    pub fn delete(&mut self, cb: &mut dyn Callbacks, idx: LogIndex) -> RaftResult<()> {
        if !self.has_idx(idx) {
            return Err(crate::RaftError::Shutdown);
        }
        let count = (self.current_idx() - idx + 1) as usize;
        let start = (idx - self.base - 1) as usize;
        let batch: Vec<Entry> = self.entries.iter().skip(start).cloned().collect();
        let mut k = count;
        let res = cb.log_pop(&batch, idx, &mut k);
        for _ in 0..k {
            self.entries.pop_back();
        }
        res
    }

    /// Compacts entries from the head up to and including `idx`.
    pub fn poll(&mut self, cb: &mut dyn Callbacks, idx: LogIndex) -> RaftResult<()> {
        if !self.has_idx(idx) {
            return Err(crate::RaftError::Shutdown);
        }
        let count = (idx - self.base) as usize;
        let batch: Vec<Entry> = self.entries.iter().take(count).cloned().collect();
        let mut k = count;
        let res = cb.log_poll(&batch, self.base + 1, &mut k);
        if k > 0 {
            self.base_term = self.entries[k - 1].term;
            self.base += k as LogIndex;
            for _ in 0..k {
                self.entries.pop_front();
            }
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeId, RaftError, RequestVote};

    struct NullCb {
        refuse_after: Option<usize>,
    }

    impl Callbacks for NullCb {
        fn send_requestvote(&mut self, _: NodeId, _: &RequestVote) -> RaftResult<()> {
            Ok(())
        }
        fn send_appendentries(&mut self, _: NodeId, _: &crate::AppendEntries) -> RaftResult<()> {
            Ok(())
        }
        fn applylog(&mut self, _: &Entry, _: LogIndex) -> RaftResult<()> {
            Ok(())
        }
        fn persist_vote(&mut self, _: NodeId) -> RaftResult<()> {
            Ok(())
        }
        fn persist_term(&mut self, _: Term, _: NodeId) -> RaftResult<()> {
            Ok(())
        }
        fn log_offer(&mut self, _: &[Entry], _: LogIndex, n: &mut usize) -> RaftResult<()> {
            if let Some(lim) = self.refuse_after {
                if *n > lim {
                    *n = lim;
                    return Err(RaftError::Shutdown);
                }
            }
            Ok(())
        }
        fn log_get_node_id(&mut self, _: &Entry, _: LogIndex) -> NodeId {
            -1
        }
    }

    fn ety(id: u32) -> Entry {
        Entry { term: 1, id, etype: crate::LOGTYPE_NORMAL, data: vec![] }
    }

    #[test]
    fn append_assigns_sequential_indices() {
        let mut cb = NullCb { refuse_after: None };
        let mut l = Log::new();
        let mut n = 3;
        l.append(&mut cb, &[ety(1), ety(2), ety(3)], &mut n).unwrap();
        assert_eq!(n, 3);
        assert_eq!(l.current_idx(), 3);
        assert_eq!(l.get_at(2).unwrap().id, 2);
        assert!(l.get_at(4).is_none());
        assert!(l.get_at(0).is_none());
    }

    #[test]
    fn append_partial_acceptance_trims_tail() {
        let mut cb = NullCb { refuse_after: Some(2) };
        let mut l = Log::new();
        let mut n = 4;
        let e = l.append(&mut cb, &[ety(1), ety(2), ety(3), ety(4)], &mut n);
        assert_eq!(e, Err(RaftError::Shutdown));
        assert_eq!(n, 2);
        assert_eq!(l.current_idx(), 2);
        assert!(l.get_at(3).is_none());
    }

    #[test]
    fn poll_advances_base_and_base_term() {
        let mut cb = NullCb { refuse_after: None };
        let mut l = Log::new();
        let mut n = 3;
        let mut e1 = ety(1);
        e1.term = 1;
        let mut e2 = ety(2);
        e2.term = 2;
        let mut e3 = ety(3);
        e3.term = 2;
        l.append(&mut cb, &[e1, e2, e3], &mut n).unwrap();
        l.poll(&mut cb, 2).unwrap();
        assert_eq!(l.base(), 2);
        assert_eq!(l.base_term(), 2);
        assert_eq!(l.count(), 1);
        assert!(l.get_at(2).is_none());
        assert_eq!(l.get_at(3).unwrap().id, 3);
        assert_eq!(l.current_idx(), 3);
    }

    #[test]
    fn delete_removes_tail() {
        let mut cb = NullCb { refuse_after: None };
        let mut l = Log::new();
        let mut n = 3;
        l.append(&mut cb, &[ety(1), ety(2), ety(3)], &mut n).unwrap();
        l.delete(&mut cb, 2).unwrap();
        assert_eq!(l.current_idx(), 1);
        assert!(l.get_at(2).is_none());
        assert_eq!(l.get_at(1).unwrap().id, 1);
    }

    #[test]
    fn snapshot_restart() {
        let mut l = Log::new();
        l.load_from_snapshot(10, 4);
        assert_eq!(l.base(), 10);
        assert_eq!(l.base_term(), 4);
        assert_eq!(l.current_idx(), 10);
        assert_eq!(l.count(), 0);
    }
}
