//! The namespace store: inode and edge graph, hash tables, statistics
//! aggregation, link/unlink and node lifecycle.

use log::{debug, error, warn};

use super::buckets::{BlobBuckets, ChunkTabBuckets, Slab, NIL};
use super::config::FsConfig;
use super::hashtab::SegHash;
use super::hooks::{Hooks, POSIX_ACL_ACCESS, POSIX_ACL_DEFAULT};
use super::idalloc::IdAlloc;
use super::node::*;
use super::utils::KeepAlive;

/* client operation counters, reported and reset as one block */
pub const OP_STATFS: usize = 0;
pub const OP_GETATTR: usize = 1;
pub const OP_SETATTR: usize = 2;
pub const OP_LOOKUP: usize = 3;
pub const OP_MKDIR: usize = 4;
pub const OP_RMDIR: usize = 5;
pub const OP_SYMLINK: usize = 6;
pub const OP_READLINK: usize = 7;
pub const OP_MKNOD: usize = 8;
pub const OP_UNLINK: usize = 9;
pub const OP_RENAME: usize = 10;
pub const OP_LINK: usize = 11;
pub const OP_READDIR: usize = 12;
pub const OP_OPEN: usize = 13;
pub const OP_READ: usize = 14;
pub const OP_WRITE: usize = 15;

#[derive(Default)]
pub struct OpStats {
    counts: [u32; 16],
}

impl OpStats {
    pub fn inc(&mut self, op: usize) {
        self.counts[op] += 1;
    }

    pub fn take(&mut self) -> [u32; 16] {
        std::mem::take(&mut self.counts)
    }
}

/// The whole mutable namespace. Every field that was process-global in older
/// master implementations lives here, owned by the reactor.
pub struct FsState {
    pub nodes: Slab<FsNode>,
    pub edges: Slab<FsEdge>,
    pub names: BlobBuckets,
    pub symlinks: BlobBuckets,
    pub chunktabs: ChunkTabBuckets,
    pub node_hash: SegHash,
    pub edge_hash: SegHash,
    pub idalloc: IdAlloc,

    pub root: u32,
    pub trash: Vec<u32>,
    pub sustained: Vec<u32>,
    pub trash_bid: u32,
    pub sustained_bid: u32,

    pub nextedgeid: u64,
    pub edges_need_renumeration: bool,
    edgeid_id_hash: Vec<u64>,
    edgeid_ptr_hash: Vec<u32>,

    pub trashspace: u64,
    pub sustainedspace: u64,
    pub trashnodes: u32,
    pub sustainednodes: u32,
    pub nodes_count: u32,
    pub dirnodes: u32,
    pub filenodes: u32,
    /// expected element count hint for sizing the hash tables at load time
    pub hashelements: u32,

    pub quota_dirs: Vec<u32>,
    pub opstats: OpStats,
    pub cfg: FsConfig,
    pub hooks: Hooks,
    keepalive: KeepAlive,
}

impl FsState {
    pub fn new(cfg: FsConfig, hooks: Hooks) -> Self {
        FsState {
            nodes: Slab::new(),
            edges: Slab::new(),
            names: BlobBuckets::new(MAX_PATH_LEN),
            symlinks: BlobBuckets::new(MAX_SYMLINK_LEN),
            chunktabs: ChunkTabBuckets::new(),
            node_hash: SegHash::new(),
            edge_hash: SegHash::new(),
            idalloc: IdAlloc::new(),
            root: NIL,
            trash: vec![NIL; TRASH_BUCKETS],
            sustained: vec![NIL; SUSTAINED_BUCKETS],
            trash_bid: 0,
            sustained_bid: 0,
            nextedgeid: EDGEID_MAX - 1,
            edges_need_renumeration: false,
            edgeid_id_hash: vec![0; EDGEID_HASHSIZE],
            edgeid_ptr_hash: vec![NIL; EDGEID_HASHSIZE],
            trashspace: 0,
            sustainedspace: 0,
            trashnodes: 0,
            sustainednodes: 0,
            nodes_count: 0,
            dirnodes: 0,
            filenodes: 0,
            hashelements: 0,
            quota_dirs: Vec::new(),
            opstats: OpStats::default(),
            cfg,
            hooks,
            keepalive: KeepAlive::begin(),
        }
    }

    /// Fresh filesystem: a root directory and nothing else.
    pub fn fs_new(&mut self, ts: u32) {
        let root = FsNode {
            inode: ROOT_INODE,
            ntype: NodeType::Directory,
            ctime: ts,
            mtime: ts,
            atime: ts,
            uid: 0,
            gid: 0,
            mode: 0o777,
            eattr: 0,
            winattr: 0,
            sclassid: DEFAULT_SCLASS,
            trashtime: DEFAULT_TRASHTIME,
            xattrflag: false,
            aclpermflag: false,
            acldefflag: false,
            parents: NIL,
            data: NodeData::Dir(DirData::default()),
            ..Default::default()
        };
        let h = self.nodes.alloc(root);
        self.root = h;
        self.nodes_count = 1;
        self.dirnodes = 1;
        self.hashelements = 1;
        self.idalloc.mark_used(ROOT_INODE);
        self.hooks.sclass.incref(DEFAULT_SCLASS, NodeType::Directory);
        self.node_hash_add(h);
    }

    pub fn keep_alive_begin(&mut self) {
        self.keepalive = KeepAlive::begin();
    }

    pub fn keep_alive_check(&mut self) {
        let hook = &mut self.hooks.keep_alive;
        self.keepalive.check(hook.as_mut());
    }

    pub fn keep_alive_yields(&self) -> u64 {
        self.keepalive.yields
    }

    /* ---- hash table plumbing ---- */

    pub fn node_hash_add(&mut self, h: u32) {
        let hint = self.hashelements;
        self.node_hash.add(&mut self.nodes, h, hint);
    }

    pub fn node_find(&mut self, inode: u32) -> Option<u32> {
        let hv = super::utils::hash32(inode);
        self.node_hash.find(&mut self.nodes, hv, |n| n.inode == inode)
    }

    pub fn edge_hash_add(&mut self, e_h: u32) {
        let hint = self.hashelements;
        self.edge_hash.add(&mut self.edges, e_h, hint);
    }

    /// `(parent, name)` lookup; only meaningful for directories.
    pub fn edge_find(&mut self, parent_h: u32, name: &[u8]) -> Option<u32> {
        let parent_inode = self.nodes.get(parent_h).inode;
        let hv = edge_hash(parent_inode, name);
        let names = &self.names;
        self.edge_hash.find(&mut self.edges, hv, |e| {
            e.parent == parent_h
                && e.nleng as usize == name.len()
                && names.get(e.name, e.nleng as usize) == name
        })
    }

    pub fn lookup_edge(&mut self, parent_h: u32, name: &[u8]) -> Option<u32> {
        if self.nodes.get(parent_h).ntype != NodeType::Directory {
            return None;
        }
        self.edge_find(parent_h, name)
    }

    pub fn nameisused(&mut self, parent_h: u32, name: &[u8]) -> bool {
        self.edge_find(parent_h, name).is_some()
    }

    pub fn edge_name(&self, e_h: u32) -> Vec<u8> {
        let e = self.edges.get(e_h);
        self.names.get(e.name, e.nleng as usize).to_vec()
    }

    /* ---- edgeid continuation cookies ---- */

    pub fn edgeid_insert(&mut self, e_h: u32) {
        let id = self.edges.get(e_h).edgeid;
        let pos = (id % EDGEID_HASHSIZE as u64) as usize;
        self.edgeid_id_hash[pos] = id;
        self.edgeid_ptr_hash[pos] = e_h;
    }

    pub fn edgeid_find(&self, edgeid: u64) -> Option<u32> {
        let pos = (edgeid % EDGEID_HASHSIZE as u64) as usize;
        if self.edgeid_id_hash[pos] == edgeid && self.edgeid_ptr_hash[pos] != NIL {
            Some(self.edgeid_ptr_hash[pos])
        } else {
            None
        }
    }

    pub fn edgeid_remove(&mut self, e_h: u32) {
        let id = self.edges.get(e_h).edgeid;
        let pos = (id % EDGEID_HASHSIZE as u64) as usize;
        if self.edgeid_id_hash[pos] == id {
            self.edgeid_ptr_hash[pos] = NIL;
        }
    }

    fn next_edgeid(&mut self) -> u64 {
        if self.nextedgeid < EDGEID_MAX {
            let id = self.nextedgeid;
            self.nextedgeid -= 1;
            id
        } else {
            0
        }
    }

    /* ---- stats aggregation (multi-parent aware) ---- */

    /// Node's own contribution; `fix_ratio` 1 refreshes the cached
    /// storage-class goal, 2 additionally repairs ancestor realsize sums.
    pub fn get_stats(&mut self, node_h: u32, fix_ratio: u8) -> StatsRecord {
        let mut sr = StatsRecord::default();
        let ntype = self.nodes.get(node_h).ntype;
        match ntype {
            NodeType::Directory => {
                sr = self.nodes.get(node_h).dir().stats;
                sr.inodes += 1;
                sr.dirs += 1;
            }
            t if t.is_file_kind() => {
                sr.inodes = 1;
                sr.files = 1;
                sr.length = self.nodes.get(node_h).file().length;
                let (size, chunks) = self.file_size_and_chunks(node_h);
                sr.size = size;
                sr.chunks = chunks;
                if fix_ratio == 2 {
                    self.check_realsize(node_h);
                } else if fix_ratio == 1 {
                    let sclassid = self.nodes.get(node_h).sclassid;
                    let goal = self.hooks.sclass.keepmax_goal(sclassid);
                    self.nodes.get_mut(node_h).file_mut().realsize_ratio = goal;
                }
                sr.realsize = sr.size * self.nodes.get(node_h).file().realsize_ratio as u64;
            }
            NodeType::Symlink => {
                sr.inodes = 1;
                sr.length = self.nodes.get(node_h).symlink().pleng as u64;
            }
            _ => {
                sr.inodes = 1;
            }
        }
        sr
    }

    /// Occupied bytes and non-hole chunk count of a file.
    pub fn file_size_and_chunks(&self, node_h: u32) -> (u64, u32) {
        let n = self.nodes.get(node_h);
        let f = n.file();
        let (lastchunk, lastchunksize) = if f.length > 0 {
            (
                ((f.length - 1) >> CHUNK_BITS) as u32,
                ((((f.length - 1) & CHUNK_MASK) + BLOCK_SIZE) & !(BLOCK_SIZE - 1)) + CHUNK_HDR_SIZE,
            )
        } else {
            (0, CHUNK_HDR_SIZE)
        };
        let mut size = 0u64;
        let mut chunks = 0u32;
        for (i, &cid) in self.chunktabs.get(f.chunktab, f.chunks).iter().enumerate() {
            if cid > 0 {
                let i = i as u32;
                if i < lastchunk {
                    size += CHUNK_SIZE + CHUNK_HDR_SIZE;
                } else if i == lastchunk {
                    size += lastchunksize;
                }
                chunks += 1;
            }
        }
        (size, chunks)
    }

    pub fn parents_of(&self, node_h: u32) -> Vec<u32> {
        let mut v = Vec::new();
        let mut e = self.nodes.get(node_h).parents;
        while e != NIL {
            let edge = self.edges.get(e);
            if edge.parent != NIL {
                v.push(edge.parent);
            }
            e = edge.nextparent;
        }
        v
    }

    pub fn add_stats(&mut self, parent_h: u32, sr: &StatsRecord) {
        let mut stack = vec![parent_h];
        while let Some(h) = stack.pop() {
            if h == NIL {
                continue;
            }
            self.nodes.get_mut(h).dir_mut().stats.add(sr);
            if h != self.root {
                stack.extend(self.parents_of(h));
            }
        }
    }

    pub fn sub_stats(&mut self, parent_h: u32, sr: &StatsRecord) {
        let mut stack = vec![parent_h];
        while let Some(h) = stack.pop() {
            if h == NIL {
                continue;
            }
            self.nodes.get_mut(h).dir_mut().stats.sub(sr);
            if h != self.root {
                stack.extend(self.parents_of(h));
            }
        }
    }

    pub fn add_sub_stats(&mut self, parent_h: u32, new_sr: &StatsRecord, prev_sr: &StatsRecord) {
        let d = StatsRecord::diff(new_sr, prev_sr);
        self.add_stats(parent_h, &d);
    }

    fn fix_realsize(&mut self, parent_h: u32, diff: u64) {
        let mut stack = vec![parent_h];
        while let Some(h) = stack.pop() {
            if h == NIL {
                continue;
            }
            let d = self.nodes.get_mut(h).dir_mut();
            d.stats.realsize = d.stats.realsize.wrapping_add(diff);
            if h != self.root {
                stack.extend(self.parents_of(h));
            }
        }
    }

    /// Refreshes the cached keep-max goal of a file, propagating the
    /// realsize delta to every ancestor.
    pub fn check_realsize(&mut self, node_h: u32) {
        let n = self.nodes.get(node_h);
        if !n.ntype.is_file_kind() {
            return;
        }
        let goal = self.hooks.sclass.keepmax_goal(n.sclassid);
        let old = n.file().realsize_ratio;
        if goal == old {
            return;
        }
        let (size, _) = self.file_size_and_chunks(node_h);
        let diff = (size * goal as u64).wrapping_sub(size * old as u64);
        for p in self.parents_of(node_h) {
            self.fix_realsize(p, diff);
        }
        self.nodes.get_mut(node_h).file_mut().realsize_ratio = goal;
    }

    /* ---- linked-list surgery ---- */

    /// Unsplices an edge from its parent's child list (or from the detached
    /// bucket it hangs off) and from the child's parent list.
    fn edge_unsplice(&mut self, e_h: u32) {
        let (parent, child, nextchild, prevchild, nextparent, prevparent) = {
            let e = self.edges.get(e_h);
            (e.parent, e.child, e.nextchild, e.prevchild, e.nextparent, e.prevparent)
        };
        if prevchild != NIL {
            self.edges.get_mut(prevchild).nextchild = nextchild;
        } else if parent != NIL {
            self.nodes.get_mut(parent).dir_mut().children = nextchild;
        } else {
            // detached edge: the list head is a trash or sustained bucket
            let c = self.nodes.get(child);
            match c.ntype {
                NodeType::Trash => {
                    let bid = c.inode as usize % TRASH_BUCKETS;
                    self.trash[bid] = nextchild;
                }
                NodeType::Sustained => {
                    let bid = c.inode as usize % SUSTAINED_BUCKETS;
                    self.sustained[bid] = nextchild;
                }
                _ => error!("structure error - detached edge with live child type"),
            }
        }
        if nextchild != NIL {
            self.edges.get_mut(nextchild).prevchild = prevchild;
        }
        if prevparent != NIL {
            self.edges.get_mut(prevparent).nextparent = nextparent;
        } else {
            self.nodes.get_mut(child).parents = nextparent;
        }
        if nextparent != NIL {
            self.edges.get_mut(nextparent).prevparent = prevparent;
        }
    }

    /* ---- edge removal / creation ---- */

    /// Tears an edge out of the graph, maintaining stats, counters and
    /// timestamps (`ts == 0` skips timestamp updates, used by load paths).
    pub fn remove_edge(&mut self, ts: u32, e_h: u32) {
        let (parent, child, nleng, name) = {
            let e = self.edges.get(e_h);
            (e.parent, e.child, e.nleng, e.name)
        };
        if parent != NIL {
            self.edgeid_remove(e_h);
            let sr = self.get_stats(child, 0);
            self.sub_stats(parent, &sr);
            if ts > 0 {
                let p = self.nodes.get_mut(parent);
                p.mtime = ts;
                p.ctime = ts;
            }
            let child_type = self.nodes.get(child).ntype;
            self.nodes.get_mut(parent).dir_mut().elements -= 1;
            if child_type == NodeType::Directory {
                // directory link counts track subdirectories of the parent
                self.nodes.get_mut(parent).dir_mut().nlink -= 1;
            } else {
                self.nodes.get_mut(child).nlink_adjust(false);
            }
            let p = self.nodes.get_mut(parent);
            p.eattr &= !EATTR_SNAPSHOT;
        }
        if ts > 0 && child != NIL {
            self.nodes.get_mut(child).ctime = ts;
        }
        self.edge_unsplice(e_h);
        if parent != NIL {
            self.edge_hash.remove(&mut self.edges, e_h);
            self.hashelements = self.hashelements.saturating_sub(1);
        }
        self.names.free(name, nleng as usize);
        self.edges.free(e_h);
    }

    /// Creates the named edge `parent/name -> child` with full bookkeeping.
    pub fn link_edge(&mut self, ts: u32, parent_h: u32, child_h: u32, name: &[u8]) -> u32 {
        let name_ref = self.names.alloc(name);
        let parent_inode = self.nodes.get(parent_h).inode;
        let edgeid = self.next_edgeid();
        let e_h = self.edges.alloc(FsEdge {
            parent: parent_h,
            child: child_h,
            edgeid,
            hashval: edge_hash(parent_inode, name),
            name: name_ref,
            nleng: name.len() as u16,
            ..Default::default()
        });
        // splice at the head of both lists
        let first_child = self.nodes.get(parent_h).dir().children;
        self.edges.get_mut(e_h).nextchild = first_child;
        if first_child != NIL {
            self.edges.get_mut(first_child).prevchild = e_h;
        }
        self.nodes.get_mut(parent_h).dir_mut().children = e_h;
        let first_parent = self.nodes.get(child_h).parents;
        self.edges.get_mut(e_h).nextparent = first_parent;
        if first_parent != NIL {
            self.edges.get_mut(first_parent).prevparent = e_h;
        }
        self.nodes.get_mut(child_h).parents = e_h;
        self.hashelements += 1;
        self.edge_hash_add(e_h);

        self.nodes.get_mut(parent_h).dir_mut().elements += 1;
        let child_type = self.nodes.get(child_h).ntype;
        if child_type == NodeType::Directory {
            self.nodes.get_mut(parent_h).dir_mut().nlink += 1;
        } else {
            self.nodes.get_mut(child_h).nlink_adjust(true);
        }
        self.nodes.get_mut(parent_h).eattr &= !EATTR_SNAPSHOT;
        let sr = self.get_stats(child_h, 1);
        self.add_stats(parent_h, &sr);
        if ts > 0 {
            let p = self.nodes.get_mut(parent_h);
            p.mtime = ts;
            p.ctime = ts;
            self.nodes.get_mut(child_h).ctime = ts;
        }
        e_h
    }

    /// Allocates and links a fresh node under `parent/name`.
    #[allow(clippy::too_many_arguments)]
    pub fn create_node(
        &mut self,
        ts: u32,
        parent_h: u32,
        name: &[u8],
        ntype: NodeType,
        mode: u16,
        cumask: u16,
        uid: u32,
        gid: u32,
        copysgid: bool,
    ) -> u32 {
        self.nodes_count += 1;
        self.hashelements += 1;
        if ntype == NodeType::Directory {
            self.dirnodes += 1;
        }
        if ntype == NodeType::File {
            self.filenodes += 1;
        }
        let inode = self.idalloc.next_id();
        let (psclass, ptrash, peattr, pmode, pgid, pacldef, pinode) = {
            let p = self.nodes.get(parent_h);
            (p.sclassid, p.trashtime, p.eattr, p.mode, p.gid, p.acldefflag, p.inode)
        };
        let (sclassid, trashtime) = if ntype == NodeType::Directory || ntype == NodeType::File {
            (psclass, ptrash)
        } else {
            (0, DEFAULT_TRASHTIME)
        };
        self.hooks.sclass.incref(sclassid, ntype);
        let eattr = if ntype == NodeType::Directory {
            peattr & !EATTR_SNAPSHOT
        } else {
            peattr & !(EATTR_NOECACHE | EATTR_SNAPSHOT)
        };
        let mut newmode = mode;
        let aclcopied = if pacldef {
            self.hooks.acl.copydefaults(pinode, inode, ntype == NodeType::Directory, &mut newmode)
        } else {
            newmode = mode & !cumask;
            0
        };
        let setgid_dir = pmode & 0o2000 == 0o2000;
        let ngid = if setgid_dir { pgid } else { gid };
        if setgid_dir && copysgid && ntype == NodeType::Directory {
            newmode |= 0o2000;
        }
        let node = FsNode {
            inode,
            ntype,
            ctime: ts,
            mtime: ts,
            atime: ts,
            uid,
            gid: ngid,
            mode: newmode,
            eattr,
            winattr: 0,
            sclassid,
            trashtime,
            xattrflag: false,
            aclpermflag: aclcopied & 1 != 0,
            acldefflag: aclcopied & 2 != 0,
            parents: NIL,
            data: NodeData::for_type(ntype),
            ..Default::default()
        };
        let h = self.nodes.alloc(node);
        self.node_hash_add(h);
        self.link_edge(ts, parent_h, h, name);
        h
    }

    /* ---- node removal ---- */

    /// Frees an orphaned node: chunk references, blobs, xattr/ACL payloads,
    /// the inode number and finally the record itself.
    pub fn remove_node(&mut self, ts: u32, node_h: u32) {
        if self.nodes.get(node_h).parents != NIL {
            return;
        }
        self.node_hash.remove(&mut self.nodes, node_h);
        self.hashelements = self.hashelements.saturating_sub(1);
        self.nodes_count -= 1;
        let (inode, ntype, sclassid, xattrflag, aclpermflag, acldefflag) = {
            let n = self.nodes.get(node_h);
            (n.inode, n.ntype, n.sclassid, n.xattrflag, n.aclpermflag, n.acldefflag)
        };
        if ntype == NodeType::Directory {
            self.dirnodes -= 1;
            self.quota_detach(node_h);
        }
        if ntype.is_file_kind() {
            // trash and sustained nodes were created as files
            self.filenodes -= 1;
            let (chunktab, chunks) = {
                let f = self.nodes.get(node_h).file();
                (f.chunktab, f.chunks)
            };
            let ids: Vec<u64> = self.chunktabs.get(chunktab, chunks).to_vec();
            for (i, cid) in ids.into_iter().enumerate() {
                if cid > 0 && !self.hooks.chunks.delete_file(cid, sclassid) {
                    error!(
                        "structure error - chunk {:016X} not found (inode: {} ; index: {})",
                        cid, inode, i
                    );
                }
            }
            self.chunktabs.free(chunktab, chunks);
        }
        if ntype == NodeType::Symlink {
            let (path, pleng) = {
                let s = self.nodes.get(node_h).symlink();
                (s.path, s.pleng)
            };
            self.symlinks.free(path, pleng as usize);
        }
        self.hooks.sclass.decref(sclassid, ntype);
        self.idalloc.free_id(inode, ts);
        if xattrflag {
            self.hooks.xattr.remove(inode);
        }
        if aclpermflag {
            self.hooks.acl.remove(inode, POSIX_ACL_ACCESS);
        }
        if acldefflag {
            self.hooks.acl.remove(inode, POSIX_ACL_DEFAULT);
        }
        self.nodes.free(node_h);
    }

    /// Removes a live edge; when the child loses its last link it goes to
    /// trash (trashtime set), to sustained (still open) or away entirely.
    pub fn unlink_edge(&mut self, ts: u32, e_h: u32) {
        let child = self.edges.get(e_h).child;
        let inode = self.nodes.get(child).inode;
        let is_open = self.hooks.open_files.is_open(inode);
        let last_link = {
            let first = self.nodes.get(child).parents;
            first != NIL && self.edges.get(first).nextparent == NIL
        };
        let keep_path = last_link
            && self.nodes.get(child).ntype == NodeType::File
            && (self.nodes.get(child).trashtime > 0 || is_open);
        let path = if keep_path { self.getpath(e_h) } else { Vec::new() };
        self.remove_edge(ts, e_h);
        if self.nodes.get(child).parents != NIL {
            return;
        }
        let (ntype, trashtime, length) = {
            let n = self.nodes.get(child);
            let len = if n.ntype.is_file_kind() { n.file().length } else { 0 };
            (n.ntype, n.trashtime, len)
        };
        if ntype == NodeType::File && trashtime > 0 {
            self.detach_to_bucket(ts, child, &path, NodeType::Trash);
            self.trashspace += length;
            self.trashnodes += 1;
            self.nodes.get_mut(child).ctime = ts;
        } else if ntype == NodeType::File && is_open {
            self.detach_to_bucket(ts, child, &path, NodeType::Sustained);
            self.sustainedspace += length;
            self.sustainednodes += 1;
        } else {
            self.remove_node(ts, child);
        }
    }

    /// Builds the detached pseudo-edge holding the last known path and hangs
    /// it into the right bucket.
    fn detach_to_bucket(&mut self, _ts: u32, child: u32, path: &[u8], kind: NodeType) {
        self.nodes.get_mut(child).ntype = kind;
        let inode = self.nodes.get(child).inode;
        let name_ref = self.names.alloc(path);
        let edgeid = self.next_edgeid();
        let e_h = self.edges.alloc(FsEdge {
            parent: NIL,
            child,
            edgeid,
            hashval: 0,
            name: name_ref,
            nleng: path.len() as u16,
            ..Default::default()
        });
        let head = match kind {
            NodeType::Trash => {
                let bid = inode as usize % TRASH_BUCKETS;
                let head = self.trash[bid];
                self.trash[bid] = e_h;
                head
            }
            _ => {
                let bid = inode as usize % SUSTAINED_BUCKETS;
                let head = self.sustained[bid];
                self.sustained[bid] = e_h;
                head
            }
        };
        self.edges.get_mut(e_h).nextchild = head;
        if head != NIL {
            self.edges.get_mut(head).prevchild = e_h;
        }
        self.nodes.get_mut(child).parents = e_h;
    }

    /* ---- path and ancestry ---- */

    /// True when `f` is an ancestor of `p` along any parent chain.
    pub fn isancestor(&self, f_h: u32, p_h: u32) -> bool {
        let mut e = self.nodes.get(p_h).parents;
        while e != NIL {
            let edge = self.edges.get(e);
            let mut a = edge.parent;
            while a != NIL {
                if a == f_h {
                    return true;
                }
                let pe = self.nodes.get(a).parents;
                if pe == NIL {
                    break;
                }
                // directories have at most one parent
                a = self.edges.get(pe).parent;
            }
            e = edge.nextparent;
        }
        false
    }

    /// Full path of an edge along the first-parent chain, deepest components
    /// kept when the result would exceed `MAX_PATH_LEN`.
    pub fn getpath(&self, e_h: u32) -> Vec<u8> {
        let e = self.edges.get(e_h);
        let mut size = e.nleng as usize;
        let mut p = e.parent;
        while p != NIL && p != self.root {
            let pe = self.nodes.get(p).parents;
            if pe == NIL {
                break;
            }
            size += self.edges.get(pe).nleng as usize + 1;
            p = self.edges.get(pe).parent;
        }
        if size > MAX_PATH_LEN {
            warn!("path too long - truncating");
            size = MAX_PATH_LEN;
        }
        let mut path = vec![0u8; size];
        let mut pos = size;
        let mut copy_part = |path: &mut Vec<u8>, pos: &mut usize, part: &[u8]| {
            if *pos >= part.len() {
                *pos -= part.len();
                path[*pos..*pos + part.len()].copy_from_slice(part);
            } else if *pos > 0 {
                let cut = part.len() - *pos;
                path[..*pos].copy_from_slice(&part[cut..]);
                *pos = 0;
            }
        };
        copy_part(&mut path, &mut pos, self.names.get(e.name, e.nleng as usize));
        if pos > 0 {
            pos -= 1;
            path[pos] = b'/';
        }
        let mut p = e.parent;
        while p != NIL && p != self.root {
            let pe = self.nodes.get(p).parents;
            if pe == NIL {
                break;
            }
            let pedge = self.edges.get(pe);
            let part = self.names.get(pedge.name, pedge.nleng as usize).to_vec();
            copy_part(&mut path, &mut pos, &part);
            if pos > 0 {
                pos -= 1;
                path[pos] = b'/';
            }
            p = pedge.parent;
        }
        path
    }

    /// Resolves an export path (`/a/b`) to the subtree root inode.
    pub fn resolve_root(&mut self, path: &[u8]) -> Option<u32> {
        let mut h = self.root;
        for comp in path.split(|&c| c == b'/') {
            if comp.is_empty() {
                continue;
            }
            let e = self.lookup_edge(h, comp)?;
            let child = self.edges.get(e).child;
            if self.nodes.get(child).ntype != NodeType::Directory {
                return None;
            }
            h = child;
        }
        Some(self.nodes.get(h).inode)
    }

    /// Session-aware inode resolution: maps `ROOT_INODE` into the export
    /// subtree, hides nodes outside it, and restricts rootinode==0 sessions
    /// to detached (trash/sustained) nodes.
    pub fn node_find_ext(
        &mut self,
        rootinode: u32,
        metarestore: bool,
        inode: u32,
        skipancestor: bool,
    ) -> Option<(u32, u32)> {
        if metarestore || rootinode == ROOT_INODE {
            let p = self.node_find(inode)?;
            return Some((self.root, p));
        }
        if rootinode == 0 {
            let p = self.node_find(inode)?;
            let t = self.nodes.get(p).ntype;
            if t != NodeType::Trash && t != NodeType::Sustained {
                return None;
            }
            return Some((NIL, p));
        }
        let rn = self.node_find(rootinode)?;
        if self.nodes.get(rn).ntype != NodeType::Directory {
            return None;
        }
        if inode == ROOT_INODE {
            return Some((rn, rn));
        }
        let p = self.node_find(inode)?;
        if !skipancestor && !self.isancestor(rn, p) {
            return None;
        }
        Some((rn, p))
    }

    /* ---- directory iteration ---- */

    /// One readdir batch. `nedgeid` 0 starts at `.`, 1 at `..`, any other
    /// value continues from that edge cookie. Returns entries and the next
    /// cookie (`EDGEID_MAX` when exhausted).
    pub fn readdir(
        &mut self,
        parent_h: u32,
        maxentries: u32,
        nedgeid: u64,
    ) -> (Vec<(Vec<u8>, u32, NodeType)>, u64) {
        let mut out = Vec::new();
        let mut left = maxentries;
        let mut cookie = nedgeid;
        let mut e_h = if cookie > 1 && cookie < EDGEID_MAX {
            match self.edgeid_find(cookie) {
                Some(h) => h,
                None => {
                    // cookie expired: rescan the child list for the edge
                    let mut h = self.nodes.get(parent_h).dir().children;
                    while h != NIL && self.edges.get(h).edgeid != cookie {
                        h = self.edges.get(h).nextchild;
                    }
                    h
                }
            }
        } else {
            NIL
        };
        while left > 0 && cookie < EDGEID_MAX {
            if cookie == 0 {
                let p = self.nodes.get(parent_h);
                out.push((b".".to_vec(), p.inode, NodeType::Directory));
                cookie = 1;
            } else {
                if cookie == 1 {
                    let p = self.nodes.get(parent_h);
                    let parent_inode = if parent_h == self.root {
                        ROOT_INODE
                    } else {
                        let pe = p.parents;
                        if pe != NIL {
                            let pp = self.edges.get(pe).parent;
                            if pp != NIL {
                                self.nodes.get(pp).inode
                            } else {
                                ROOT_INODE
                            }
                        } else {
                            ROOT_INODE
                        }
                    };
                    out.push((b"..".to_vec(), parent_inode, NodeType::Directory));
                    e_h = self.nodes.get(parent_h).dir().children;
                } else if e_h != NIL {
                    let (name, child, next) = {
                        let e = self.edges.get(e_h);
                        (self.names.get(e.name, e.nleng as usize).to_vec(), e.child, e.nextchild)
                    };
                    let c = self.nodes.get(child);
                    out.push((name, c.inode, c.ntype));
                    e_h = next;
                }
                cookie = if e_h != NIL { self.edges.get(e_h).edgeid } else { EDGEID_MAX };
            }
            left -= 1;
        }
        if e_h != NIL {
            self.edgeid_insert(e_h);
        }
        (out, cookie)
    }

    /* ---- edge renumeration ---- */

    fn renumerate_subtree(&mut self, p_h: u32) {
        let children: Vec<u32> = {
            let mut v = Vec::new();
            let mut e = self.nodes.get(p_h).dir().children;
            while e != NIL {
                v.push(e);
                e = self.edges.get(e).nextchild;
            }
            v
        };
        let mut fedgeid = self.nextedgeid - children.len() as u64;
        self.nextedgeid = fedgeid;
        for &e in &children {
            self.edges.get_mut(e).edgeid = fedgeid;
            fedgeid += 1;
        }
        for &e in &children {
            self.keep_alive_check();
            let child = self.edges.get(e).child;
            if self.nodes.get(child).ntype == NodeType::Directory {
                self.renumerate_subtree(child);
            }
        }
    }

    /// Reassigns all edge ids densely from the top of the id space. Returns
    /// the resulting `nextedgeid` for the changelog record.
    pub fn renumerate_edges(&mut self) -> u64 {
        self.nextedgeid = EDGEID_MAX - 1;
        self.keep_alive_begin();
        let root = self.root;
        self.renumerate_subtree(root);
        self.edges_need_renumeration = false;
        self.nextedgeid
    }

    /* ---- teardown ---- */

    pub fn cleanup(&mut self) {
        debug!("cleaning objects, names and deletion timestamps");
        self.nodes.cleanup();
        self.edges.cleanup();
        self.names.cleanup();
        self.symlinks.cleanup();
        self.chunktabs.cleanup();
        self.node_hash.cleanup();
        self.edge_hash.cleanup();
        self.idalloc.cleanup();
        self.root = NIL;
        for b in self.trash.iter_mut() {
            *b = NIL;
        }
        for b in self.sustained.iter_mut() {
            *b = NIL;
        }
        self.edgeid_id_hash = vec![0; EDGEID_HASHSIZE];
        self.edgeid_ptr_hash = vec![NIL; EDGEID_HASHSIZE];
        self.nextedgeid = EDGEID_MAX - 1;
        self.trashspace = 0;
        self.sustainedspace = 0;
        self.trashnodes = 0;
        self.sustainednodes = 0;
        self.nodes_count = 0;
        self.dirnodes = 0;
        self.filenodes = 0;
        self.hashelements = 0;
        self.quota_dirs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta_lib::test_support::new_fs;

    #[test]
    fn fresh_fs_has_root() {
        let mut fs = new_fs();
        let root = fs.node_find(ROOT_INODE).expect("root exists");
        assert_eq!(root, fs.root);
        let n = fs.nodes.get(root);
        assert_eq!(n.ntype, NodeType::Directory);
        assert_eq!(n.mode, 0o777);
        assert_eq!(n.dir().nlink, 2);
        assert_eq!(fs.nodes_count, 1);
    }

    #[test]
    fn create_link_lookup_roundtrip() {
        let mut fs = new_fs();
        let root = fs.root;
        let d = fs.create_node(10, root, b"a", NodeType::Directory, 0o755, 0, 1000, 1000, false);
        assert_eq!(fs.nodes.get(d).inode, 2);
        let e = fs.lookup_edge(root, b"a").expect("edge");
        assert_eq!(fs.edges.get(e).child, d);
        assert_eq!(fs.nodes.get(root).dir().nlink, 3);
        assert_eq!(fs.nodes.get(root).dir().elements, 1);
        // stats propagated
        assert_eq!(fs.nodes.get(root).dir().stats.inodes, 1);
        assert_eq!(fs.nodes.get(root).dir().stats.dirs, 1);
        assert!(fs.lookup_edge(root, b"b").is_none());
    }

    #[test]
    fn hardlink_counts_parents() {
        let mut fs = new_fs();
        let root = fs.root;
        let d = fs.create_node(10, root, b"d", NodeType::Directory, 0o755, 0, 0, 0, false);
        let f = fs.create_node(11, d, b"f", NodeType::File, 0o644, 0, 0, 0, false);
        assert_eq!(fs.nodes.get(f).nlink(), 1);
        fs.link_edge(12, d, f, b"g");
        assert_eq!(fs.nodes.get(f).nlink(), 2);
        // two parent edges on the child
        let mut cnt = 0;
        let mut e = fs.nodes.get(f).parents;
        while e != crate::meta_lib::buckets::NIL {
            cnt += 1;
            e = fs.edges.get(e).nextparent;
        }
        assert_eq!(cnt, 2);
        // d's stats count the file once per link (as the C accounting does)
        assert_eq!(fs.nodes.get(d).dir().stats.files, 2);
    }

    #[test]
    fn unlink_last_link_removes_node() {
        let mut fs = new_fs();
        let root = fs.root;
        let f = fs.create_node(10, root, b"f", NodeType::File, 0o644, 0, 0, 0, false);
        fs.nodes.get_mut(f).trashtime = 0;
        let inode = fs.nodes.get(f).inode;
        let e = fs.lookup_edge(root, b"f").unwrap();
        fs.unlink_edge(11, e);
        assert!(fs.node_find(inode).is_none());
        assert_eq!(fs.nodes_count, 1);
        assert_eq!(fs.trashnodes, 0);
        // freed id is quarantined, not immediately reusable
        assert!(fs.idalloc.is_used(inode));
    }

    #[test]
    fn unlink_with_trashtime_moves_to_trash() {
        let mut fs = new_fs();
        let root = fs.root;
        let d = fs.create_node(10, root, b"dir", NodeType::Directory, 0o755, 0, 0, 0, false);
        let f = fs.create_node(10, d, b"file", NodeType::File, 0o644, 0, 0, 0, false);
        fs.nodes.get_mut(f).file_mut().length = 100;
        let inode = fs.nodes.get(f).inode;
        let e = fs.lookup_edge(d, b"file").unwrap();
        fs.unlink_edge(11, e);
        assert_eq!(fs.nodes.get(f).ntype, NodeType::Trash);
        assert_eq!(fs.trashnodes, 1);
        assert_eq!(fs.trashspace, 100);
        // stored trash name is the full path
        let te = fs.nodes.get(f).parents;
        assert_eq!(fs.edge_name(te), b"dir/file");
        assert!(fs.node_find(inode).is_some());
        // the bucket is derived from the inode
        assert_eq!(fs.trash[inode as usize % TRASH_BUCKETS], te);
    }

    #[test]
    fn isancestor_walks_up() {
        let mut fs = new_fs();
        let root = fs.root;
        let a = fs.create_node(1, root, b"a", NodeType::Directory, 0o755, 0, 0, 0, false);
        let b = fs.create_node(1, a, b"b", NodeType::Directory, 0o755, 0, 0, 0, false);
        let f = fs.create_node(1, b, b"f", NodeType::File, 0o644, 0, 0, 0, false);
        assert!(fs.isancestor(root, f));
        assert!(fs.isancestor(a, f));
        assert!(fs.isancestor(b, f));
        assert!(!fs.isancestor(b, a));
        assert!(!fs.isancestor(f, f));
    }

    #[test]
    fn getpath_builds_full_path() {
        let mut fs = new_fs();
        let root = fs.root;
        let a = fs.create_node(1, root, b"usr", NodeType::Directory, 0o755, 0, 0, 0, false);
        let b = fs.create_node(1, a, b"share", NodeType::Directory, 0o755, 0, 0, 0, false);
        fs.create_node(1, b, b"dict", NodeType::File, 0o644, 0, 0, 0, false);
        let e = fs.lookup_edge(b, b"dict").unwrap();
        assert_eq!(fs.getpath(e), b"usr/share/dict");
    }

    #[test]
    fn resolve_root_by_path() {
        let mut fs = new_fs();
        let root = fs.root;
        let a = fs.create_node(1, root, b"exports", NodeType::Directory, 0o755, 0, 0, 0, false);
        let b = fs.create_node(1, a, b"data", NodeType::Directory, 0o755, 0, 0, 0, false);
        assert_eq!(fs.resolve_root(b"/"), Some(ROOT_INODE));
        assert_eq!(fs.resolve_root(b"/exports/data"), Some(fs.nodes.get(b).inode));
        assert_eq!(fs.resolve_root(b"/exports/nope"), None);
    }

    #[test]
    fn readdir_cookie_walk() {
        let mut fs = new_fs();
        let root = fs.root;
        for name in [b"x".as_ref(), b"y".as_ref(), b"z".as_ref()] {
            fs.create_node(1, root, name, NodeType::File, 0o644, 0, 0, 0, false);
        }
        let (first, cookie) = fs.readdir(root, 3, 0);
        assert_eq!(first.len(), 3);
        assert_eq!(first[0].0, b".");
        assert_eq!(first[1].0, b"..");
        assert!(cookie < EDGEID_MAX);
        let (rest, cookie2) = fs.readdir(root, 10, cookie);
        assert_eq!(rest.len(), 2);
        assert_eq!(cookie2, EDGEID_MAX);
        let mut all: Vec<Vec<u8>> = first.iter().chain(rest.iter()).map(|e| e.0.clone()).collect();
        all.sort();
        assert!(all.contains(&b"x".to_vec()));
        assert!(all.contains(&b"z".to_vec()));
    }

    #[test]
    fn renumerate_assigns_creation_order() {
        let mut fs = new_fs();
        let root = fs.root;
        let d = fs.create_node(1, root, b"d", NodeType::Directory, 0o755, 0, 0, 0, false);
        fs.create_node(1, d, b"f1", NodeType::File, 0o644, 0, 0, 0, false);
        fs.create_node(1, d, b"f2", NodeType::File, 0o644, 0, 0, 0, false);
        let next = fs.renumerate_edges();
        assert!(next < EDGEID_MAX);
        // sibling edgeids are consecutive in list order
        let e1 = fs.nodes.get(d).dir().children;
        let e2 = fs.edges.get(e1).nextchild;
        assert_eq!(fs.edges.get(e1).edgeid + 1, fs.edges.get(e2).edgeid);
        assert!(!fs.edges_need_renumeration);
    }

    #[test]
    fn quota_hard_limit_blocks() {
        use crate::meta_lib::quota::*;
        let mut fs = new_fs();
        let root = fs.root;
        let d = fs.create_node(1, root, b"q", NodeType::Directory, 0o755, 0, 0, 0, false);
        fs.quota_attach(
            d,
            QuotaNode { flags: QUOTA_FLAG_HINODES, hinodes: 2, ..Default::default() },
        );
        fs.create_node(1, d, b"f1", NodeType::File, 0o644, 0, 0, 0, false);
        assert!(!fs.quota_test(d, 1, 0, 0, 0));
        fs.create_node(1, d, b"f2", NodeType::File, 0o644, 0, 0, 0, false);
        assert!(fs.quota_test(d, 1, 0, 0, 0));
        // nested path checks the whole chain
        let sub = fs.create_node(1, d, b"sub", NodeType::Directory, 0o755, 0, 0, 0, false);
        assert!(fs.quota_test(sub, 1, 0, 0, 0));
        // outside of the quota subtree nothing blocks
        assert!(!fs.quota_test(root, 1, 0, 0, 0));
    }
}
