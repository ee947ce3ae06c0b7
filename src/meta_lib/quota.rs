//! Per-directory quota nodes and the lazy violation checks that guard every
//! operation adding to a subtree.

use super::buckets::NIL;
use super::fs::FsState;
use super::node::{NodeData, StatsRecord};

pub const QUOTA_FLAG_SINODES: u8 = 0x01;
pub const QUOTA_FLAG_SLENGTH: u8 = 0x02;
pub const QUOTA_FLAG_SSIZE: u8 = 0x04;
pub const QUOTA_FLAG_SREALSIZE: u8 = 0x08;
pub const QUOTA_FLAG_HINODES: u8 = 0x10;
pub const QUOTA_FLAG_HLENGTH: u8 = 0x20;
pub const QUOTA_FLAG_HSIZE: u8 = 0x40;
pub const QUOTA_FLAG_HREALSIZE: u8 = 0x80;

pub const QUOTA_FLAG_SALL: u8 = 0x0F;
pub const QUOTA_FLAG_HALL: u8 = 0xF0;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuotaNode {
    pub graceperiod: u32,
    /// hard quota exceeded or soft quota past its grace window
    pub exceeded: bool,
    pub flags: u8,
    /// when the soft limit was first exceeded, 0 when not
    pub stimestamp: u32,
    pub sinodes: u32,
    pub hinodes: u32,
    pub slength: u64,
    pub hlength: u64,
    pub ssize: u64,
    pub hsize: u64,
    pub srealsize: u64,
    pub hrealsize: u64,
}

/// State transition of one quota node, replicated through the changelog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuotaEvent {
    pub inode: u32,
    pub qn: QuotaNode,
}

impl FsState {
    pub fn quota_attach(&mut self, node_h: u32, qn: QuotaNode) {
        let d = self.nodes.get_mut(node_h).dir_mut();
        if d.quota.is_none() {
            self.quota_dirs.push(node_h);
        }
        d.quota = Some(Box::new(qn));
    }

    pub fn quota_detach(&mut self, node_h: u32) {
        let d = self.nodes.get_mut(node_h).dir_mut();
        if d.quota.take().is_some() {
            self.quota_dirs.retain(|&h| h != node_h);
        }
    }

    /// Would adding the given amounts to this directory alone break a hard
    /// limit (or a soft limit whose grace expired)?
    pub fn quota_test_noparents(
        &self,
        node_h: u32,
        inodes: u32,
        length: u64,
        size: u64,
        realsize: u64,
    ) -> bool {
        if node_h == NIL {
            return false;
        }
        let n = self.nodes.get(node_h);
        let d = match &n.data {
            NodeData::Dir(d) => d,
            _ => return false,
        };
        let qn = match &d.quota {
            Some(q) => q,
            None => return false,
        };
        let psr = &d.stats;
        if inodes > 0 && qn.flags & QUOTA_FLAG_HINODES != 0 && psr.inodes + inodes > qn.hinodes {
            return true;
        }
        if length > 0 && qn.flags & QUOTA_FLAG_HLENGTH != 0 && psr.length + length > qn.hlength {
            return true;
        }
        if size > 0 && qn.flags & QUOTA_FLAG_HSIZE != 0 && psr.size + size > qn.hsize {
            return true;
        }
        if realsize > 0 && qn.flags & QUOTA_FLAG_HREALSIZE != 0 && psr.realsize + realsize > qn.hrealsize
        {
            return true;
        }
        if qn.exceeded {
            // soft limits behave like hard ones once the grace period is gone
            if inodes > 0 && qn.flags & QUOTA_FLAG_SINODES != 0 && psr.inodes + inodes > qn.sinodes {
                return true;
            }
            if length > 0 && qn.flags & QUOTA_FLAG_SLENGTH != 0 && psr.length + length > qn.slength {
                return true;
            }
            if size > 0 && qn.flags & QUOTA_FLAG_SSIZE != 0 && psr.size + size > qn.ssize {
                return true;
            }
            if realsize > 0
                && qn.flags & QUOTA_FLAG_SREALSIZE != 0
                && psr.realsize + realsize > qn.srealsize
            {
                return true;
            }
        }
        false
    }

    /// Walks every ancestor chain (hardlinked files have several).
    pub fn quota_test(
        &self,
        node_h: u32,
        inodes: u32,
        length: u64,
        size: u64,
        realsize: u64,
    ) -> bool {
        let mut stack = vec![node_h];
        while let Some(h) = stack.pop() {
            if h == NIL {
                continue;
            }
            if self.quota_test_noparents(h, inodes, length, size, realsize) {
                return true;
            }
            if h != self.root {
                let mut e = self.nodes.get(h).parents;
                while e != NIL {
                    let edge = self.edges.get(e);
                    stack.push(edge.parent);
                    e = edge.nextparent;
                }
            }
        }
        false
    }

    /// Quota-bearing ancestors of a directory, root first.
    fn quota_chain(&self, mut h: u32) -> Vec<u32> {
        let mut chain = Vec::new();
        while h != NIL {
            let n = self.nodes.get(h);
            if let NodeData::Dir(d) = &n.data {
                if d.quota.is_some() {
                    chain.push(h);
                }
            }
            let e = n.parents;
            if e == NIL {
                break;
            }
            // directories have a single parent
            h = self.edges.get(e).parent;
        }
        chain.reverse();
        chain
    }

    /// For moves and snapshots across subtrees: peel the common ancestor
    /// prefix and test only the destination-side remainder, so moves within
    /// one subtree bypass the check entirely.
    pub fn quota_test_for_uncommon_nodes(
        &self,
        dst_h: u32,
        src_h: u32,
        inodes: u32,
        length: u64,
        size: u64,
        realsize: u64,
    ) -> bool {
        if dst_h == src_h {
            return false;
        }
        let dchain = self.quota_chain(dst_h);
        let schain = self.quota_chain(src_h);
        let mut common = 0;
        while common < dchain.len() && common < schain.len() && dchain[common] == schain[common] {
            common += 1;
        }
        for &h in &dchain[common..] {
            if self.quota_test(h, inodes, length, size, realsize) {
                return true;
            }
        }
        false
    }

    /// Periodic pass over all quota nodes; updates soft-exceed state and
    /// returns the transitions to record.
    pub fn quota_check_all(&mut self, ts: u32) -> Vec<QuotaEvent> {
        let mut events = Vec::new();
        let dirs: Vec<u32> = self.quota_dirs.clone();
        for h in dirs {
            let d = self.nodes.get_mut(h).dir_mut();
            let psr = d.stats;
            let qn = match &mut d.quota {
                Some(q) => q,
                None => continue,
            };
            let mut sq = false;
            if qn.flags & QUOTA_FLAG_SINODES != 0 && psr.inodes > qn.sinodes {
                sq = true;
            }
            if qn.flags & QUOTA_FLAG_SLENGTH != 0 && psr.length > qn.slength {
                sq = true;
            }
            if qn.flags & QUOTA_FLAG_SSIZE != 0 && psr.size > qn.ssize {
                sq = true;
            }
            if qn.flags & QUOTA_FLAG_SREALSIZE != 0 && psr.realsize > qn.srealsize {
                sq = true;
            }
            let mut chg = false;
            if !sq && qn.stimestamp > 0 {
                qn.stimestamp = 0;
                chg = true;
            } else if sq && qn.stimestamp == 0 {
                qn.stimestamp = ts;
                chg = true;
            }
            let exceeded = qn.stimestamp != 0 && qn.stimestamp + qn.graceperiod < ts;
            if qn.exceeded != exceeded {
                qn.exceeded = exceeded;
                chg = true;
            }
            if chg {
                let inode = self.nodes.get(h).inode;
                let qn = self.nodes.get(h).dir().quota.as_ref().unwrap().as_ref().clone();
                events.push(QuotaEvent { inode, qn });
            }
        }
        events
    }

    /// Space reported to clients shrinks to whatever the tightest quota on
    /// the ancestor chain still allows.
    pub fn quota_fixspace(&self, node_h: u32, totalspace: &mut u64, availspace: &mut u64) {
        let mut stack = vec![node_h];
        while let Some(h) = stack.pop() {
            if h == NIL {
                continue;
            }
            let n = self.nodes.get(h);
            if let NodeData::Dir(d) = &n.data {
                if let Some(qn) = &d.quota {
                    let sr: StatsRecord = d.stats;
                    let mut clamp = |cur: u64, sflag: u8, hflag: u8, slim: u64, hlim: u64| {
                        if qn.flags & (sflag | hflag) == 0 {
                            return;
                        }
                        let mut quotasize = u64::MAX;
                        if qn.flags & hflag != 0 {
                            quotasize = quotasize.min(hlim);
                        }
                        if qn.flags & sflag != 0 {
                            quotasize = quotasize.min(slim);
                        }
                        if cur >= quotasize {
                            *availspace = 0;
                        } else if *availspace > quotasize - cur {
                            *availspace = quotasize - cur;
                        }
                        if *totalspace > quotasize {
                            *totalspace = quotasize;
                        }
                        if cur + *availspace < *totalspace {
                            *totalspace = cur + *availspace;
                        }
                    };
                    clamp(sr.realsize, QUOTA_FLAG_SREALSIZE, QUOTA_FLAG_HREALSIZE, qn.srealsize, qn.hrealsize);
                    clamp(sr.size, QUOTA_FLAG_SSIZE, QUOTA_FLAG_HSIZE, qn.ssize, qn.hsize);
                    clamp(sr.length, QUOTA_FLAG_SLENGTH, QUOTA_FLAG_HLENGTH, qn.slength, qn.hlength);
                }
            }
            if h != self.root {
                let mut e = n.parents;
                while e != NIL {
                    let edge = self.edges.get(e);
                    stack.push(edge.parent);
                    e = edge.nextparent;
                }
            }
        }
    }
}
