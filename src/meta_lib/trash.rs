//! Trash and sustained buckets: unlinked-but-retained inodes, their sweeps,
//! undelete and purge.

use super::buckets::NIL;
use super::errors::{FsResult, MfsError};
use super::fs::FsState;
use super::node::*;

impl FsState {
    /// Purges a detached node. A trash node still held open degrades to
    /// sustained instead of dying. Returns true when the node is gone,
    /// false when it moved to sustained.
    pub fn purge_detached(&mut self, ts: u32, node_h: u32) -> FsResult<bool> {
        let e_h = self.nodes.get(node_h).parents;
        let (ntype, length, inode) = {
            let n = self.nodes.get(node_h);
            (n.ntype, n.file().length, n.inode)
        };
        match ntype {
            NodeType::Trash => {
                self.trashspace -= length;
                self.trashnodes -= 1;
                if self.hooks.open_files.is_open(inode) {
                    // resplice the same edge into the sustained bucket
                    self.nodes.get_mut(node_h).ntype = NodeType::Sustained;
                    self.sustainedspace += length;
                    self.sustainednodes += 1;
                    self.bucket_unsplice_detached(e_h, NodeType::Trash, inode);
                    let bid = inode as usize % SUSTAINED_BUCKETS;
                    let head = self.sustained[bid];
                    self.edges.get_mut(e_h).nextchild = head;
                    self.edges.get_mut(e_h).prevchild = NIL;
                    if head != NIL {
                        self.edges.get_mut(head).prevchild = e_h;
                    }
                    self.sustained[bid] = e_h;
                    Ok(false)
                } else {
                    self.remove_edge(ts, e_h);
                    self.remove_node(ts, node_h);
                    Ok(true)
                }
            }
            NodeType::Sustained => {
                self.sustainedspace -= length;
                self.sustainednodes -= 1;
                self.remove_edge(ts, e_h);
                self.remove_node(ts, node_h);
                Ok(true)
            }
            _ => Err(MfsError::EPerm),
        }
    }

    /// Takes a detached edge out of its bucket list only (the edge object
    /// survives, to be respliced elsewhere).
    fn bucket_unsplice_detached(&mut self, e_h: u32, from: NodeType, inode: u32) {
        let (prevchild, nextchild) = {
            let e = self.edges.get(e_h);
            (e.prevchild, e.nextchild)
        };
        if prevchild != NIL {
            self.edges.get_mut(prevchild).nextchild = nextchild;
        } else {
            match from {
                NodeType::Trash => {
                    self.trash[inode as usize % TRASH_BUCKETS] = nextchild;
                }
                _ => {
                    self.sustained[inode as usize % SUSTAINED_BUCKETS] = nextchild;
                }
            }
        }
        if nextchild != NIL {
            self.edges.get_mut(nextchild).prevchild = prevchild;
        }
    }

    /// One bucket of the trash sweep: purge entries whose atime, mtime and
    /// ctime have all aged past `trashtime` hours. Returns
    /// `(freed, sustained, xor-of-inodes)`.
    pub fn empty_trash_part(&mut self, ts: u32, bid: u32) -> (u32, u32, u32) {
        let mut fi = 0;
        let mut si = 0;
        let mut ics = 0;
        let mut e = self.trash[bid as usize];
        while e != NIL {
            let next = self.edges.get(e).nextchild;
            let p = self.edges.get(e).child;
            let (atime, mtime, ctime, trashtime, inode) = {
                let n = self.nodes.get(p);
                (n.atime as u64, n.mtime as u64, n.ctime as u64, n.trashtime as u64, n.inode)
            };
            let tsec = trashtime * 3600;
            if atime + tsec < ts as u64 && mtime + tsec < ts as u64 && ctime + tsec < ts as u64 {
                ics ^= inode;
                if self.purge_detached(ts, p).unwrap_or(false) {
                    fi += 1;
                } else {
                    si += 1;
                }
            }
            e = next;
        }
        (fi, si, ics)
    }

    /// One bucket of the sustained sweep: entries whose file handle closed.
    pub fn empty_sustained_part(&mut self, ts: u32, bid: u32) -> (u32, u32) {
        let mut fi = 0;
        let mut ics = 0;
        let mut e = self.sustained[bid as usize];
        while e != NIL {
            let next = self.edges.get(e).nextchild;
            let p = self.edges.get(e).child;
            let inode = self.nodes.get(p).inode;
            if !self.hooks.open_files.is_open(inode) {
                ics ^= inode;
                let _ = self.purge_detached(ts, p);
                fi += 1;
            }
            e = next;
        }
        (fi, ics)
    }

    /// Validates the stored trash path: non-empty, no `//`, no NUL, no `.`
    /// or `..` components, each component at most `MAX_NAME_LEN` bytes.
    /// Total length is not re-validated (it was clamped when stored).
    pub fn trashpath_check(path: &[u8]) -> bool {
        let mut p = path;
        while !p.is_empty() && p[0] == b'/' {
            p = &p[1..];
        }
        if p.is_empty() {
            return false;
        }
        let mut partleng = 0usize;
        let mut dots = 0usize;
        for &c in p {
            match c {
                0 => return false,
                b'/' => {
                    if partleng == 0 {
                        return false;
                    }
                    if partleng == dots && partleng <= 2 {
                        return false;
                    }
                    partleng = 0;
                    dots = 0;
                }
                _ => {
                    if c == b'.' {
                        dots += 1;
                    }
                    partleng += 1;
                    if partleng > MAX_NAME_LEN {
                        return false;
                    }
                }
            }
        }
        if partleng == 0 {
            return false;
        }
        if partleng == dots && partleng <= 2 {
            return false;
        }
        true
    }

    /// Restores a trash node to its recorded path, creating any missing
    /// intermediate directories (0755, root-owned).
    pub fn undel(&mut self, ts: u32, node_h: u32) -> FsResult<()> {
        let e_h = self.nodes.get(node_h).parents;
        if self.nodes.get(node_h).ntype != NodeType::Trash {
            return Err(MfsError::EPerm);
        }
        let full = self.edge_name(e_h);
        if !Self::trashpath_check(&full) {
            return Err(MfsError::CantCreatePath);
        }
        let mut path: &[u8] = &full;
        while !path.is_empty() && path[0] == b'/' {
            path = &path[1..];
        }
        let mut p = self.root;
        let mut fresh = false;
        loop {
            if let Some(q) = &self.nodes.get(p).dir().quota {
                if q.exceeded {
                    return Err(MfsError::Quota);
                }
            }
            let partleng = path.iter().position(|&c| c == b'/').unwrap_or(path.len());
            let part = &path[..partleng].to_vec();
            if partleng == path.len() {
                // final component: the name of the undeleted file
                if self.nameisused(p, part) {
                    return Err(MfsError::EExist);
                }
                let length = self.nodes.get(node_h).file().length;
                // drop the bucket edge while the node still reads as trash
                self.remove_edge(ts, e_h);
                self.nodes.get_mut(node_h).ntype = NodeType::File;
                self.nodes.get_mut(node_h).ctime = ts;
                self.link_edge(ts, p, node_h, part);
                self.trashspace -= length;
                self.trashnodes -= 1;
                return Ok(());
            }
            if !fresh {
                match self.lookup_edge(p, part) {
                    None => fresh = true,
                    Some(pe) => {
                        let n = self.edges.get(pe).child;
                        if self.nodes.get(n).ntype != NodeType::Directory {
                            return Err(MfsError::CantCreatePath);
                        }
                        p = n;
                    }
                }
            }
            if fresh {
                p = self.create_node(ts, p, part, NodeType::Directory, 0o755, 0, 0, 0, false);
            }
            path = &path[partleng + 1..];
        }
    }

    /// Serializes one detached bucket for listing: names with `/` replaced
    /// by `|`, long names elided from the left.
    pub fn getdetached(&self, head: u32) -> Vec<(Vec<u8>, u32)> {
        let mut out = Vec::new();
        let mut e = head;
        while e != NIL {
            let edge = self.edges.get(e);
            let name = self.names.get(edge.name, edge.nleng as usize);
            let mut shown: Vec<u8>;
            if name.len() > 240 {
                shown = b"(...)".to_vec();
                shown.extend_from_slice(&name[name.len() - 235..]);
            } else {
                shown = name.to_vec();
            }
            for c in shown.iter_mut() {
                if *c == b'/' {
                    *c = b'|';
                }
            }
            out.push((shown, self.nodes.get(edge.child).inode));
            e = edge.nextchild;
        }
        out
    }

    /// Replaces the stored path of a detached trash node.
    pub fn settrashpath(&mut self, node_h: u32, path: &[u8]) -> FsResult<()> {
        if self.nodes.get(node_h).ntype != NodeType::Trash {
            return Err(MfsError::EPerm);
        }
        if path.is_empty() || !Self::trashpath_check(path) {
            return Err(MfsError::EInval);
        }
        let e_h = self.nodes.get(node_h).parents;
        let (oldname, oldleng) = {
            let e = self.edges.get(e_h);
            (e.name, e.nleng)
        };
        self.names.free(oldname, oldleng as usize);
        let nref = self.names.alloc(&path[..path.len().min(MAX_PATH_LEN)]);
        let e = self.edges.get_mut(e_h);
        e.name = nref;
        e.nleng = path.len().min(MAX_PATH_LEN) as u16;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta_lib::hooks::OpenFileSet;
    use crate::meta_lib::test_support::new_fs;

    fn trashed_file(fs: &mut FsState, ts: u32) -> (u32, u32) {
        let root = fs.root;
        let d = fs.create_node(ts, root, b"dir", NodeType::Directory, 0o755, 0, 0, 0, false);
        let f = fs.create_node(ts, d, b"f", NodeType::File, 0o644, 0, 0, 0, false);
        fs.nodes.get_mut(f).file_mut().length = 100;
        let inode = fs.nodes.get(f).inode;
        let e = fs.lookup_edge(d, b"f").unwrap();
        fs.unlink_edge(ts, e);
        (f, inode)
    }

    #[test]
    fn trash_expires_by_ttl() {
        let mut fs = new_fs();
        let ts = 1000;
        let (f, inode) = trashed_file(&mut fs, ts);
        assert_eq!(fs.nodes.get(f).ntype, NodeType::Trash);
        let bid = (inode as usize % TRASH_BUCKETS) as u32;
        // trashtime is 24h: one second before expiry nothing happens
        let (fi, si, _) = fs.empty_trash_part(ts + 24 * 3600, bid);
        assert_eq!((fi, si), (0, 0));
        let (fi, si, ics) = fs.empty_trash_part(ts + 24 * 3600 + 1, bid);
        assert_eq!((fi, si), (1, 0));
        assert_eq!(ics, inode);
        assert_eq!(fs.trashnodes, 0);
        assert_eq!(fs.trashspace, 0);
        assert!(fs.node_find(inode).is_none());
    }

    #[test]
    fn open_trash_degrades_to_sustained() {
        let mut fs = new_fs();
        let ts = 1000;
        let (f, inode) = trashed_file(&mut fs, ts);
        let mut of = OpenFileSet::new();
        of.acquire(inode);
        fs.hooks.open_files = Box::new(of);
        let bid = (inode as usize % TRASH_BUCKETS) as u32;
        let (fi, si, _) = fs.empty_trash_part(ts + 24 * 3600 + 1, bid);
        assert_eq!((fi, si), (0, 1));
        assert_eq!(fs.nodes.get(f).ntype, NodeType::Sustained);
        assert_eq!(fs.sustainednodes, 1);
        assert_eq!(fs.sustainedspace, 100);
        assert_eq!(fs.trashnodes, 0);
        // closes, then the sustained sweep collects it
        fs.hooks.open_files = Box::new(OpenFileSet::new());
        let sbid = (inode as usize % SUSTAINED_BUCKETS) as u32;
        let (fi, ics) = fs.empty_sustained_part(ts + 30 * 3600, sbid);
        assert_eq!(fi, 1);
        assert_eq!(ics, inode);
        assert_eq!(fs.sustainednodes, 0);
    }

    #[test]
    fn undel_restores_original_path() {
        let mut fs = new_fs();
        let ts = 1000;
        let (f, inode) = trashed_file(&mut fs, ts);
        // remove the original directory so undel has to recreate it
        let root = fs.root;
        let d = fs.lookup_edge(root, b"dir").map(|e| fs.edges.get(e).child).unwrap();
        assert_eq!(fs.nodes.get(d).dir().elements, 0);
        let de = fs.lookup_edge(root, b"dir").unwrap();
        fs.unlink_edge(ts, de);
        fs.undel(ts + 5, f).unwrap();
        assert_eq!(fs.nodes.get(f).ntype, NodeType::File);
        assert_eq!(fs.trashnodes, 0);
        let d2 = fs.lookup_edge(root, b"dir").map(|e| fs.edges.get(e).child).unwrap();
        // recreated intermediates are root-owned 0755
        assert_eq!(fs.nodes.get(d2).mode, 0o755);
        assert_eq!(fs.nodes.get(d2).uid, 0);
        let fe = fs.lookup_edge(d2, b"f").unwrap();
        assert_eq!(fs.nodes.get(fs.edges.get(fe).child).inode, inode);
    }

    #[test]
    fn undel_refuses_taken_name() {
        let mut fs = new_fs();
        let ts = 1000;
        let (f, _) = trashed_file(&mut fs, ts);
        // occupy dir/f with a new file
        let root = fs.root;
        let d = fs.lookup_edge(root, b"dir").map(|e| fs.edges.get(e).child).unwrap();
        fs.create_node(ts, d, b"f", NodeType::File, 0o644, 0, 0, 0, false);
        assert_eq!(fs.undel(ts + 5, f), Err(MfsError::EExist));
        assert_eq!(fs.trashnodes, 1);
    }

    #[test]
    fn trashpath_validation() {
        assert!(FsState::trashpath_check(b"a/b/c"));
        assert!(FsState::trashpath_check(b"/a"));
        assert!(FsState::trashpath_check(b"..."));
        assert!(!FsState::trashpath_check(b""));
        assert!(!FsState::trashpath_check(b"//"));
        assert!(!FsState::trashpath_check(b"a//b"));
        assert!(!FsState::trashpath_check(b"a/./b"));
        assert!(!FsState::trashpath_check(b"a/../b"));
        assert!(!FsState::trashpath_check(b"a/b/"));
        let long = vec![b'x'; 256];
        let mut p = b"a/".to_vec();
        p.extend_from_slice(&long);
        assert!(!FsState::trashpath_check(&p));
    }

    #[test]
    fn purge_removes_immediately() {
        let mut fs = new_fs();
        let (f, inode) = trashed_file(&mut fs, 1000);
        assert!(fs.purge_detached(1001, f).unwrap());
        assert!(fs.node_find(inode).is_none());
        assert_eq!(fs.trashnodes, 0);
    }

    #[test]
    fn detached_listing_mangles_separators() {
        let mut fs = new_fs();
        let (f, inode) = trashed_file(&mut fs, 1000);
        let _ = f;
        let head = fs.trash[inode as usize % TRASH_BUCKETS];
        let listing = fs.getdetached(head);
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].0, b"dir|f");
        assert_eq!(listing[0].1, inode);
    }

    #[test]
    fn settrashpath_replaces_name() {
        let mut fs = new_fs();
        let (f, _) = trashed_file(&mut fs, 1000);
        fs.settrashpath(f, b"new/place/f").unwrap();
        let e = fs.nodes.get(f).parents;
        assert_eq!(fs.edge_name(e), b"new/place/f");
        assert_eq!(fs.settrashpath(f, b"a//b"), Err(MfsError::EInval));
    }
}
