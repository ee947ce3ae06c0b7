//! Recursive copy-on-reference tree clone with hardlink preservation and
//! overwrite/merge semantics.

use std::collections::HashMap;

use super::attr::{MODE_MASK_R, MODE_MASK_W, MODE_MASK_X};
use super::buckets::NIL;
use super::errors::{FsResult, MfsError};
use super::fs::FsState;
use super::hooks::{POSIX_ACL_ACCESS, POSIX_ACL_DEFAULT};
use super::node::*;

pub const SNAPSHOT_MODE_CAN_OVERWRITE: u8 = 0x01;
pub const SNAPSHOT_MODE_DELETE: u8 = 0x02;
pub const SNAPSHOT_MODE_CPLIKE_ATTR: u8 = 0x04;
pub const SNAPSHOT_MODE_PRESERVE_HARDLINKS: u8 = 0x08;

/// Walk context plus the result counters recorded in the changelog.
pub struct SnapshotParams {
    pub ts: u32,
    pub smode: u8,
    pub sesflags: u8,
    pub cumask: u16,
    pub uid: u32,
    pub gids: Vec<u32>,
    pub inode_chksum: u32,
    pub removed_object: u32,
    pub same_file: u32,
    pub existing_object: u32,
    pub new_hardlink: u32,
    pub new_object: u32,
    /// source inode -> destination handle, for hardlink preservation
    inodehash: HashMap<u32, u32>,
}

impl SnapshotParams {
    pub fn new(ts: u32, smode: u8, sesflags: u8, cumask: u16, uid: u32, gids: Vec<u32>) -> Self {
        SnapshotParams {
            ts,
            smode,
            sesflags,
            cumask,
            uid,
            gids,
            inode_chksum: 0,
            removed_object: 0,
            same_file: 0,
            existing_object: 0,
            new_hardlink: 0,
            new_object: 0,
            inodehash: HashMap::new(),
        }
    }
}

impl FsState {
    pub(crate) fn child_edges(&self, dir_h: u32) -> Vec<u32> {
        let mut v = Vec::new();
        let mut e = self.nodes.get(dir_h).dir().children;
        while e != NIL {
            v.push(e);
            e = self.edges.get(e).nextchild;
        }
        v
    }

    /// Type compatibility and overwrite pre-test, recursing into matching
    /// directories.
    pub fn snapshot_test(
        &mut self,
        origsrc_h: u32,
        src_h: u32,
        parent_h: u32,
        name: &[u8],
        canoverwrite: bool,
    ) -> FsResult<()> {
        self.keep_alive_check();
        let e = match self.lookup_edge(parent_h, name) {
            Some(e) => e,
            None => return Ok(()),
        };
        let dst_h = self.edges.get(e).child;
        if dst_h == origsrc_h {
            return Err(MfsError::EInval);
        }
        let (stype, dtype) = (self.nodes.get(src_h).ntype, self.nodes.get(dst_h).ntype);
        if dtype != stype {
            return Err(MfsError::EPerm);
        }
        if stype == NodeType::Trash || stype == NodeType::Sustained {
            return Err(MfsError::EPerm);
        }
        if stype == NodeType::Directory {
            for ce in self.child_edges(src_h) {
                let child = self.edges.get(ce).child;
                let cname = self.edge_name(ce);
                self.snapshot_test(origsrc_h, child, dst_h, &cname, canoverwrite)?;
            }
        } else if !canoverwrite {
            return Err(MfsError::EExist);
        }
        Ok(())
    }

    /// Sums what the clone would add under every destination directory and
    /// tests the involved quotas. Returns true when some quota would break.
    #[allow(clippy::too_many_arguments)]
    pub fn snapshot_recursive_test_quota(
        &mut self,
        src_h: u32,
        parent_h: u32,
        name: &[u8],
        inodes: &mut u32,
        length: &mut u64,
        size: &mut u64,
        realsize: &mut u64,
    ) -> bool {
        self.keep_alive_check();
        let e = match self.lookup_edge(parent_h, name) {
            Some(e) => e,
            None => return false,
        };
        let dst_h = self.edges.get(e).child;
        *inodes += 1;
        match self.nodes.get(dst_h).ntype {
            NodeType::File => {
                *length += self.nodes.get(dst_h).file().length;
                let (fsize, _) = self.file_size_and_chunks(dst_h);
                *size += fsize;
                let sclassid = self.nodes.get(dst_h).sclassid;
                *realsize += fsize * self.hooks.sclass.keepmax_goal(sclassid) as u64;
            }
            NodeType::Symlink => {
                *length += self.nodes.get(dst_h).symlink().pleng as u64;
            }
            NodeType::Directory => {
                let mut ssr = self.get_stats(src_h, 2);
                let mut ci = 0u32;
                let mut cl = 0u64;
                let mut cs = 0u64;
                let mut cr = 0u64;
                for ce in self.child_edges(src_h) {
                    let child = self.edges.get(ce).child;
                    let cname = self.edge_name(ce);
                    if self.snapshot_recursive_test_quota(child, dst_h, &cname, &mut ci, &mut cl, &mut cs, &mut cr) {
                        return true;
                    }
                }
                ssr.inodes = ssr.inodes.saturating_sub(ci);
                ssr.length = ssr.length.saturating_sub(cl);
                ssr.size = ssr.size.saturating_sub(cs);
                ssr.realsize = ssr.realsize.saturating_sub(cr);
                if self.quota_test_noparents(dst_h, ssr.inodes, ssr.length, ssr.size, ssr.realsize) {
                    return true;
                }
                *inodes += ci;
                *length += cl;
                *size += cs;
                *realsize += cr;
            }
            _ => {}
        }
        false
    }

    /// Clones the chunk table of `src` into `dst`, bumping per-chunk refs.
    fn snapshot_copy_chunks(&mut self, src_h: u32, dst_h: u32) {
        let (src_tab, src_chunks, src_inode, src_len) = {
            let n = self.nodes.get(src_h);
            let f = n.file();
            (f.chunktab, f.chunks, n.inode, f.length)
        };
        if src_chunks > 0 {
            let tab = self.chunktabs.alloc(src_chunks);
            let ids: Vec<u64> = self.chunktabs.get(src_tab, src_chunks).to_vec();
            let sclassid = self.nodes.get(dst_h).sclassid;
            self.chunktabs.get_mut(tab, src_chunks).copy_from_slice(&ids);
            for (i, cid) in ids.into_iter().enumerate() {
                if cid > 0 && !self.hooks.chunks.add_file(cid, sclassid) {
                    log::error!(
                        "structure error - chunk {:016X} not found (inode: {} ; index: {})",
                        cid,
                        src_inode,
                        i
                    );
                }
            }
            let f = self.nodes.get_mut(dst_h).file_mut();
            f.chunktab = tab;
            f.chunks = src_chunks;
        }
        self.nodes.get_mut(dst_h).file_mut().length = src_len;
    }

    fn snapshot_apply_attr(&mut self, src_h: u32, dst_h: u32, args: &SnapshotParams) {
        let (smode, suid, sgid, satime, smtime) = {
            let s = self.nodes.get(src_h);
            (s.mode, s.uid, s.gid, s.atime, s.mtime)
        };
        let d = self.nodes.get_mut(dst_h);
        if args.smode & SNAPSHOT_MODE_CPLIKE_ATTR != 0 {
            d.uid = args.uid;
            d.gid = args.gids[0];
            d.mode = smode & !args.cumask;
            d.ctime = args.ts;
        } else if args.uid == 0 || args.uid == suid {
            d.mode = smode;
            d.uid = suid;
            d.gid = sgid;
            d.atime = satime;
            d.mtime = smtime;
            d.ctime = args.ts;
        } else {
            d.mode = smode & 0o1777; // strip suid/sgid for strangers
            d.uid = args.uid;
            d.gid = args.gids[0];
            d.atime = satime;
            d.mtime = smtime;
            d.ctime = args.ts;
        }
    }

    /// The clone walk. `newflag` is set when the destination is known not
    /// to exist (fresh subtree), skipping the lookup.
    pub fn snapshot_do(
        &mut self,
        src_h: u32,
        parent_h: u32,
        name: &[u8],
        newflag: bool,
        args: &mut SnapshotParams,
    ) {
        self.keep_alive_check();
        let stype = self.nodes.get(src_h).ntype;
        let (rec, accessstatus) = match stype {
            NodeType::Directory => (
                self.access_ext(src_h, args.uid, &args.gids, MODE_MASK_R | MODE_MASK_X, args.sesflags),
                true,
            ),
            NodeType::File => {
                (false, self.access_ext(src_h, args.uid, &args.gids, MODE_MASK_R, args.sesflags))
            }
            _ => (false, true),
        };
        if !accessstatus {
            return;
        }
        let existing = if newflag { None } else { self.lookup_edge(parent_h, name) };
        if let Some(e) = existing {
            let mut dst_h = self.edges.get(e).child;
            match stype {
                NodeType::Directory => {
                    args.existing_object += 1;
                    if rec {
                        for ce in self.child_edges(src_h) {
                            let child = self.edges.get(ce).child;
                            let cname = self.edge_name(ce);
                            self.snapshot_do(child, dst_h, &cname, false, args);
                        }
                    }
                }
                NodeType::File => {
                    let same = {
                        let sf = self.nodes.get(src_h).file();
                        let df = self.nodes.get(dst_h).file();
                        sf.length == df.length
                            && sf.chunks == df.chunks
                            && self.chunktabs.get(sf.chunktab, sf.chunks)
                                == self.chunktabs.get(df.chunktab, df.chunks)
                    };
                    if same {
                        args.same_file += 1;
                    } else {
                        args.inode_chksum ^= self.nodes.get(dst_h).inode;
                        self.unlink_edge(args.ts, e);
                        let (smode, suid, sgid) = {
                            let s = self.nodes.get(src_h);
                            (s.mode, s.uid, s.gid)
                        };
                        dst_h = if args.smode & SNAPSHOT_MODE_CPLIKE_ATTR != 0 {
                            self.create_node(
                                args.ts, parent_h, name, NodeType::File, smode, args.cumask,
                                args.uid, args.gids[0], false,
                            )
                        } else if args.uid == 0 || args.uid == suid {
                            self.create_node(
                                args.ts, parent_h, name, NodeType::File, smode & 0o7777, 0, suid,
                                sgid, false,
                            )
                        } else {
                            self.create_node(
                                args.ts, parent_h, name, NodeType::File, smode & 0o1777, 0,
                                args.uid, args.gids[0], false,
                            )
                        };
                        args.existing_object += 1;
                        args.inode_chksum ^= self.nodes.get(dst_h).inode;
                        let psr = self.get_stats(dst_h, 0);
                        let (ssclass, strash) = {
                            let s = self.nodes.get(src_h);
                            (s.sclassid, s.trashtime)
                        };
                        let (dsclass, dtype) = {
                            let d = self.nodes.get(dst_h);
                            (d.sclassid, d.ntype)
                        };
                        self.hooks.sclass.decref(dsclass, dtype);
                        self.nodes.get_mut(dst_h).sclassid = ssclass;
                        self.hooks.sclass.incref(ssclass, dtype);
                        self.nodes.get_mut(dst_h).trashtime = strash;
                        self.snapshot_copy_chunks(src_h, dst_h);
                        let nsr = self.get_stats(dst_h, 1);
                        self.add_sub_stats(parent_h, &nsr, &psr);
                    }
                }
                NodeType::Symlink => {
                    args.existing_object += 1;
                    let (spath, spleng) = {
                        let s = self.nodes.get(src_h).symlink();
                        (self.symlinks.get(s.path, s.pleng as usize).to_vec(), s.pleng)
                    };
                    let (dpath, dpleng) = {
                        let d = self.nodes.get(dst_h).symlink();
                        (d.path, d.pleng)
                    };
                    if dpleng != spleng {
                        let mut sr = StatsRecord::default();
                        sr.length = (spleng as u64).wrapping_sub(dpleng as u64);
                        self.add_stats(parent_h, &sr);
                    }
                    self.symlinks.free(dpath, dpleng as usize);
                    let nref = self.symlinks.alloc(&spath);
                    let d = self.nodes.get_mut(dst_h).symlink_mut();
                    d.path = nref;
                    d.pleng = spleng;
                }
                NodeType::BlockDev | NodeType::CharDev => {
                    args.existing_object += 1;
                    let rdev = match &self.nodes.get(src_h).data {
                        NodeData::Dev(d) => d.rdev,
                        _ => 0,
                    };
                    if let NodeData::Dev(d) = &mut self.nodes.get_mut(dst_h).data {
                        d.rdev = rdev;
                    }
                }
                _ => {
                    args.existing_object += 1;
                }
            }
            self.snapshot_apply_attr(src_h, dst_h, args);
            self.nodes.get_mut(dst_h).eattr |= EATTR_SNAPSHOT;
            return;
        }

        /* new element */
        let multi_parent = {
            let first = self.nodes.get(src_h).parents;
            first != NIL && self.edges.get(first).nextparent != NIL
        };
        if args.smode & SNAPSHOT_MODE_PRESERVE_HARDLINKS != 0
            && stype != NodeType::Directory
            && multi_parent
        {
            let src_inode = self.nodes.get(src_h).inode;
            if let Some(&dst_h) = args.inodehash.get(&src_inode) {
                args.new_hardlink += 1;
                self.link_edge(args.ts, parent_h, dst_h, name);
                return;
            }
        }
        let (smode, suid, sgid) = {
            let s = self.nodes.get(src_h);
            (s.mode, s.uid, s.gid)
        };
        let dst_h = if args.smode & SNAPSHOT_MODE_CPLIKE_ATTR != 0 {
            self.create_node(args.ts, parent_h, name, stype, smode, args.cumask, args.uid, args.gids[0], false)
        } else if args.uid == 0 || args.uid == suid {
            self.create_node(args.ts, parent_h, name, stype, smode, 0, suid, sgid, false)
        } else {
            self.create_node(args.ts, parent_h, name, stype, smode & 0o1777, 0, args.uid, args.gids[0], false)
        };
        args.inode_chksum ^= self.nodes.get(dst_h).inode;
        args.new_object += 1;
        if args.smode & SNAPSHOT_MODE_PRESERVE_HARDLINKS != 0
            && stype != NodeType::Directory
            && multi_parent
        {
            let src_inode = self.nodes.get(src_h).inode;
            args.inodehash.insert(src_inode, dst_h);
        }
        let psr = self.get_stats(dst_h, 0);
        if args.smode & SNAPSHOT_MODE_CPLIKE_ATTR == 0 {
            let (ssclass, strash, seattr, swin, sxattr, saclperm, sacldef, src_inode) = {
                let s = self.nodes.get(src_h);
                (s.sclassid, s.trashtime, s.eattr, s.winattr, s.xattrflag, s.aclpermflag, s.acldefflag, s.inode)
            };
            let (dsclass, dtype, dst_inode) = {
                let d = self.nodes.get(dst_h);
                (d.sclassid, d.ntype, d.inode)
            };
            self.hooks.sclass.decref(dsclass, dtype);
            self.hooks.sclass.incref(ssclass, dtype);
            {
                let d = self.nodes.get_mut(dst_h);
                d.sclassid = ssclass;
                d.trashtime = strash;
                d.eattr = seattr;
                d.winattr = swin;
                d.mode = smode;
            }
            if args.uid != 0 && args.uid != suid {
                self.nodes.get_mut(dst_h).mode &= 0o1777; // clear suid+sgid
            }
            let (satime, smtime) = {
                let s = self.nodes.get(src_h);
                (s.atime, s.mtime)
            };
            {
                let d = self.nodes.get_mut(dst_h);
                d.atime = satime;
                d.mtime = smtime;
            }
            if sxattr {
                let copied = self.hooks.xattr.copy(src_inode, dst_inode);
                self.nodes.get_mut(dst_h).xattrflag = copied;
            }
            if saclperm {
                let copied = self.hooks.acl.copy(src_inode, dst_inode, POSIX_ACL_ACCESS);
                self.nodes.get_mut(dst_h).aclpermflag = copied;
            }
            if sacldef {
                let copied = self.hooks.acl.copy(src_inode, dst_inode, POSIX_ACL_DEFAULT);
                self.nodes.get_mut(dst_h).acldefflag = copied;
            }
        }
        match stype {
            NodeType::Directory => {
                if rec {
                    for ce in self.child_edges(src_h) {
                        let child = self.edges.get(ce).child;
                        let cname = self.edge_name(ce);
                        self.snapshot_do(child, dst_h, &cname, true, args);
                    }
                }
            }
            NodeType::File => {
                self.snapshot_copy_chunks(src_h, dst_h);
                let nsr = self.get_stats(dst_h, 1);
                self.add_sub_stats(parent_h, &nsr, &psr);
            }
            NodeType::Symlink => {
                let (spath, spleng) = {
                    let s = self.nodes.get(src_h).symlink();
                    (self.symlinks.get(s.path, s.pleng as usize).to_vec(), s.pleng)
                };
                if spleng > 0 {
                    let nref = self.symlinks.alloc(&spath);
                    let d = self.nodes.get_mut(dst_h).symlink_mut();
                    d.path = nref;
                    d.pleng = spleng;
                }
                let nsr = self.get_stats(dst_h, 1);
                self.add_sub_stats(parent_h, &nsr, &psr);
            }
            NodeType::BlockDev | NodeType::CharDev => {
                let rdev = match &self.nodes.get(src_h).data {
                    NodeData::Dev(d) => d.rdev,
                    _ => 0,
                };
                if let NodeData::Dev(d) = &mut self.nodes.get_mut(dst_h).data {
                    d.rdev = rdev;
                }
            }
            _ => {}
        }
        self.nodes.get_mut(dst_h).eattr |= EATTR_SNAPSHOT;
    }

    /// Pre-test for snapshot deletion: write access everywhere and nothing
    /// without the SNAPSHOT mark.
    pub fn remove_snapshot_test(&mut self, e_h: u32, args: &SnapshotParams) -> FsResult<()> {
        let n = self.edges.get(e_h).child;
        self.keep_alive_check();
        if self.nodes.get(n).ntype == NodeType::Directory {
            if self.access_ext(n, args.uid, &args.gids, MODE_MASK_W | MODE_MASK_X, args.sesflags) {
                for ce in self.child_edges(n) {
                    self.remove_snapshot_test(ce, args)?;
                }
            } else {
                return Err(MfsError::EAcces);
            }
        }
        if self.nodes.get(n).eattr & EATTR_SNAPSHOT == 0 {
            return Err(MfsError::EPerm);
        }
        Ok(())
    }

    /// Removes a cloned subtree, touching only nodes bearing the SNAPSHOT
    /// mark (and directories emptied by the walk).
    pub fn remove_snapshot(&mut self, e_h: u32, args: &mut SnapshotParams) {
        let n = self.edges.get(e_h).child;
        self.keep_alive_check();
        if self.nodes.get(n).ntype == NodeType::Directory {
            let eattr_back = self.nodes.get(n).eattr;
            if self.access_ext(n, args.uid, &args.gids, MODE_MASK_W | MODE_MASK_X, args.sesflags) {
                for ce in self.child_edges(n) {
                    self.remove_snapshot(ce, args);
                }
            }
            if self.nodes.get(n).dir().children != NIL {
                return;
            }
            self.nodes.get_mut(n).eattr = eattr_back;
        }
        if self.nodes.get(n).eattr & EATTR_SNAPSHOT != 0 {
            self.nodes.get_mut(n).trashtime = 0;
            args.inode_chksum ^= self.nodes.get(n).inode;
            args.removed_object += 1;
            self.unlink_edge(args.ts, e_h);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta_lib::test_support::new_fs;

    fn params(ts: u32, smode: u8) -> SnapshotParams {
        SnapshotParams::new(ts, smode, 0, 0o022, 0, vec![0])
    }

    /// 1/a/{f,g hardlinked}, 1/a/dir/h.
    fn build_tree(fs: &mut FsState) -> (u32, u32, u32) {
        let root = fs.root;
        let a = fs.create_node(1, root, b"a", NodeType::Directory, 0o755, 0, 0, 0, false);
        let f = fs.create_node(1, a, b"f", NodeType::File, 0o644, 0, 0, 0, false);
        fs.link_edge(1, a, f, b"g");
        let dir = fs.create_node(1, a, b"dir", NodeType::Directory, 0o755, 0, 0, 0, false);
        fs.create_node(1, dir, b"h", NodeType::File, 0o644, 0, 0, 0, false);
        (a, f, dir)
    }

    #[test]
    fn snapshot_preserves_hardlinks() {
        let mut fs = new_fs();
        let root = fs.root;
        let (a, _f, _dir) = build_tree(&mut fs);
        let mut args = params(50, SNAPSHOT_MODE_PRESERVE_HARDLINKS);
        fs.snapshot_do(a, root, b"a-snap", false, &mut args);
        assert_eq!(args.new_object, 4); // a', f'(=g'), dir', h'
        assert_eq!(args.new_hardlink, 1);
        let snap = fs.lookup_edge(root, b"a-snap").map(|e| fs.edges.get(e).child).unwrap();
        let fe = fs.lookup_edge(snap, b"f").unwrap();
        let ge = fs.lookup_edge(snap, b"g").unwrap();
        let fh = fs.edges.get(fe).child;
        assert_eq!(fh, fs.edges.get(ge).child);
        assert_eq!(fs.nodes.get(fh).nlink(), 2);
        assert!(fs.nodes.get(fh).eattr & EATTR_SNAPSHOT != 0);
        assert!(fs.nodes.get(snap).eattr & EATTR_SNAPSHOT != 0);
        // source is untouched
        assert!(fs.nodes.get(a).eattr & EATTR_SNAPSHOT == 0);
    }

    #[test]
    fn snapshot_without_preserve_duplicates_hardlinks() {
        let mut fs = new_fs();
        let root = fs.root;
        let (a, ..) = build_tree(&mut fs);
        let mut args = params(50, 0);
        fs.snapshot_do(a, root, b"s", false, &mut args);
        assert_eq!(args.new_hardlink, 0);
        assert_eq!(args.new_object, 5);
        let snap = fs.lookup_edge(root, b"s").map(|e| fs.edges.get(e).child).unwrap();
        let f_edge = fs.lookup_edge(snap, b"f").unwrap();
        let fh = fs.edges.get(f_edge).child;
        let g_edge = fs.lookup_edge(snap, b"g").unwrap();
        let gh = fs.edges.get(g_edge).child;
        assert_ne!(fh, gh);
        assert_eq!(fs.nodes.get(fh).nlink(), 1);
    }

    #[test]
    fn snapshot_shares_chunks_with_refcount() {
        let mut fs = new_fs();
        let root = fs.root;
        let a = fs.create_node(1, root, b"a", NodeType::Directory, 0o755, 0, 0, 0, false);
        let f = fs.create_node(1, a, b"f", NodeType::File, 0o644, 0, 0, 0, false);
        let (_, c0, _) = fs.writechunk(f, 0, 2).unwrap();
        fs.writeend(f, 77, c0, 3).unwrap();
        let mut args = params(50, 0);
        fs.snapshot_do(a, root, b"s", false, &mut args);
        let snap = fs.lookup_edge(root, b"s").map(|e| fs.edges.get(e).child).unwrap();
        let f_edge = fs.lookup_edge(snap, b"f").unwrap();
        let fh = fs.edges.get(f_edge).child;
        assert_eq!(fs.chunk_at(fh, 0), c0);
        assert_eq!(fs.nodes.get(fh).file().length, 77);
        // both files reference the chunk now: removing one keeps it alive
        let e = fs.lookup_edge(a, b"f").unwrap();
        fs.nodes.get_mut(f).trashtime = 0;
        fs.unlink_edge(60, e);
        assert_eq!(fs.hooks.chunks.valid_copies(c0), 1);
    }

    #[test]
    fn snapshot_merge_same_file_counts() {
        let mut fs = new_fs();
        let root = fs.root;
        let (a, ..) = build_tree(&mut fs);
        let mut args = params(50, 0);
        fs.snapshot_do(a, root, b"s", false, &mut args);
        // snapshot again over the same destination: everything matches
        let mut args2 = params(51, 0);
        fs.snapshot_do(a, root, b"s", false, &mut args2);
        assert_eq!(args2.new_object, 0);
        assert_eq!(args2.same_file, 3); // f, g and h resolve to identical content
        assert!(args2.existing_object > 0);
    }

    #[test]
    fn snapshot_test_rejects_type_clash() {
        let mut fs = new_fs();
        let root = fs.root;
        let (a, ..) = build_tree(&mut fs);
        // destination "x" is a file, source is a directory
        fs.create_node(1, root, b"x", NodeType::File, 0o644, 0, 0, 0, false);
        assert_eq!(fs.snapshot_test(a, a, root, b"x", true), Err(MfsError::EPerm));
        // snapshotting onto itself
        let ae = fs.lookup_edge(root, b"a").unwrap();
        let _ = ae;
        assert_eq!(fs.snapshot_test(a, a, root, b"a", true), Err(MfsError::EInval));
        // free name passes
        assert!(fs.snapshot_test(a, a, root, b"fresh", true).is_ok());
    }

    #[test]
    fn remove_snapshot_only_touches_marked_nodes() {
        let mut fs = new_fs();
        let root = fs.root;
        let (a, ..) = build_tree(&mut fs);
        let mut args = params(50, 0);
        fs.snapshot_do(a, root, b"s", false, &mut args);
        let se = fs.lookup_edge(root, b"s").unwrap();
        let snap = fs.edges.get(se).child;
        // plant an unmarked file inside the snapshot
        let keep = fs.create_node(60, snap, b"keep", NodeType::File, 0o644, 0, 0, 0, false);
        fs.nodes.get_mut(keep).eattr &= !EATTR_SNAPSHOT;
        let mut dargs = params(70, 0);
        assert!(fs.remove_snapshot_test(se, &dargs).is_err());
        fs.remove_snapshot(se, &mut dargs);
        // the marked children are gone but the subtree root survived because
        // it was not emptied
        assert!(fs.lookup_edge(root, b"s").is_some());
        assert!(fs.lookup_edge(snap, b"keep").is_some());
        assert!(fs.lookup_edge(snap, b"f").is_none());
        assert!(fs.lookup_edge(snap, b"dir").is_none());
        assert!(dargs.removed_object >= 4);
    }

    /// Expensive: a snapshot touching a million edges must keep invoking the
    /// cooperative keep-alive hook (run with `cargo test -- --ignored`).
    #[test]
    #[ignore]
    fn million_edge_snapshot_keeps_yielding() {
        let mut fs = new_fs();
        let root = fs.root;
        let src = fs.create_node(1, root, b"big", NodeType::Directory, 0o755, 0, 0, 0, false);
        let mut dirs = vec![src];
        // 1000 directories of 1000 files each
        for i in 0..1000u32 {
            let d = fs.create_node(1, src, format!("d{}", i).as_bytes(), NodeType::Directory, 0o755, 0, 0, 0, false);
            dirs.push(d);
            for j in 0..1000u32 {
                fs.create_node(1, d, format!("f{}", j).as_bytes(), NodeType::File, 0o644, 0, 0, 0, false);
            }
        }
        assert!(fs.nodes_count > 1_000_000);
        fs.keep_alive_begin();
        let mut args = params(50, 0);
        fs.snapshot_do(src, root, b"big-snap", false, &mut args);
        assert_eq!(args.new_object as u64, 1_001_001);
        // the walk crossed the 10000-node threshold many times; as long as it
        // ran over 100ms the reactor got its share of yields
        assert!(fs.keep_alive_yields() > 0);
    }

    #[test]
    fn snapshot_quota_pretest_blocks() {
        use crate::meta_lib::quota::*;
        let mut fs = new_fs();
        let root = fs.root;
        let (a, ..) = build_tree(&mut fs);
        let qd = fs.create_node(1, root, b"limited", NodeType::Directory, 0o755, 0, 0, 0, false);
        fs.quota_attach(
            qd,
            QuotaNode { flags: QUOTA_FLAG_HINODES, hinodes: 2, ..Default::default() },
        );
        // 5 inodes would land under "limited"
        let sr = fs.get_stats(a, 0);
        assert!(fs.quota_test(qd, sr.inodes, sr.length, sr.size, sr.realsize));
        let mut i = 0;
        let mut l = 0;
        let mut s = 0;
        let mut r = 0;
        // no existing destination: recursive test sums nothing, the plain
        // quota test on the target directory decides
        assert!(!fs.snapshot_recursive_test_quota(a, qd, b"copy", &mut i, &mut l, &mut s, &mut r));
    }
}
