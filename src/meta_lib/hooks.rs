//! Narrow contracts to the collaborators living outside the metadata engine:
//! the chunk store, open-file tracking, storage classes, xattr and ACL
//! storage. In-memory defaults back the unit tests and single-process runs.

use std::collections::{HashMap, HashSet};

use super::node::NodeType;

/// Per-file chunk reference tracking in the external chunk store.
pub trait ChunkStore {
    /// Returns false when the chunk is unknown (a structure error the caller
    /// logs but survives).
    fn add_file(&mut self, chunkid: u64, sclassid: u8) -> bool;
    fn delete_file(&mut self, chunkid: u64, sclassid: u8) -> bool;
    fn change_file(&mut self, chunkid: u64, old_sclassid: u8, new_sclassid: u8);
    /// Allocates a fresh chunk for a write; returns its id.
    fn create(&mut self, sclassid: u8) -> u64;
    fn valid_copies(&self, chunkid: u64) -> u8;
    /// Store/load of the CHNK image section.
    fn store(&self, buf: &mut Vec<u8>);
    fn load(&mut self, data: &[u8]) -> anyhow::Result<()>;
}

/// Reference-counting store used by tests and single-master setups.
#[derive(Default)]
pub struct SimpleChunkStore {
    refs: HashMap<u64, u32>,
    nextchunkid: u64,
}

impl SimpleChunkStore {
    pub fn new() -> Self {
        SimpleChunkStore { refs: HashMap::new(), nextchunkid: 1 }
    }

    pub fn refcount(&self, chunkid: u64) -> u32 {
        self.refs.get(&chunkid).copied().unwrap_or(0)
    }

    pub fn chunk_count(&self) -> usize {
        self.refs.len()
    }
}

impl ChunkStore for SimpleChunkStore {
    fn add_file(&mut self, chunkid: u64, _sclassid: u8) -> bool {
        match self.refs.get_mut(&chunkid) {
            Some(r) => {
                *r += 1;
                true
            }
            None => false,
        }
    }

    fn delete_file(&mut self, chunkid: u64, _sclassid: u8) -> bool {
        match self.refs.get_mut(&chunkid) {
            Some(r) => {
                *r -= 1;
                if *r == 0 {
                    self.refs.remove(&chunkid);
                }
                true
            }
            None => false,
        }
    }

    fn change_file(&mut self, _chunkid: u64, _old_sclassid: u8, _new_sclassid: u8) {}

    fn create(&mut self, _sclassid: u8) -> u64 {
        let id = self.nextchunkid;
        self.nextchunkid += 1;
        self.refs.insert(id, 1);
        id
    }

    fn valid_copies(&self, chunkid: u64) -> u8 {
        if self.refs.contains_key(&chunkid) {
            1
        } else {
            0
        }
    }

    fn store(&self, buf: &mut Vec<u8>) {
        super::utils::put64(buf, self.nextchunkid);
        super::utils::put32(buf, self.refs.len() as u32);
        let mut ids: Vec<(u64, u32)> = self.refs.iter().map(|(&k, &v)| (k, v)).collect();
        ids.sort_unstable();
        for (id, r) in ids {
            super::utils::put64(buf, id);
            super::utils::put32(buf, r);
        }
    }

    fn load(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let mut u = super::utils::Unpack::new(data);
        self.nextchunkid = u.get64()?;
        let n = u.get32()?;
        self.refs.clear();
        for _ in 0..n {
            let id = u.get64()?;
            let r = u.get32()?;
            self.refs.insert(id, r);
        }
        Ok(())
    }
}

/// Open-file handles held by client sessions.
pub trait OpenFiles {
    fn is_open(&self, inode: u32) -> bool;
}

#[derive(Default)]
pub struct OpenFileSet {
    open: HashSet<u32>,
}

impl OpenFileSet {
    pub fn new() -> Self {
        OpenFileSet::default()
    }

    pub fn acquire(&mut self, inode: u32) {
        self.open.insert(inode);
    }

    pub fn release(&mut self, inode: u32) {
        self.open.remove(&inode);
    }
}

impl OpenFiles for OpenFileSet {
    fn is_open(&self, inode: u32) -> bool {
        self.open.contains(&inode)
    }
}

/// Replication/erasure policy registry; the engine only needs the cached
/// "keep max" goal (the realsize multiplier) and refcounts.
pub trait StorageClasses {
    fn keepmax_goal(&self, sclassid: u8) -> u8;
    fn incref(&mut self, sclassid: u8, ntype: NodeType);
    fn decref(&mut self, sclassid: u8, ntype: NodeType);
}

pub struct SimpleStorageClasses {
    goals: [u8; 256],
    refs: [u32; 256],
}

impl Default for SimpleStorageClasses {
    fn default() -> Self {
        SimpleStorageClasses { goals: [1; 256], refs: [0; 256] }
    }
}

impl SimpleStorageClasses {
    pub fn set_goal(&mut self, sclassid: u8, goal: u8) {
        self.goals[sclassid as usize] = goal;
    }

    pub fn refcount(&self, sclassid: u8) -> u32 {
        self.refs[sclassid as usize]
    }
}

impl StorageClasses for SimpleStorageClasses {
    fn keepmax_goal(&self, sclassid: u8) -> u8 {
        self.goals[sclassid as usize]
    }

    fn incref(&mut self, sclassid: u8, _ntype: NodeType) {
        self.refs[sclassid as usize] += 1;
    }

    fn decref(&mut self, sclassid: u8, _ntype: NodeType) {
        self.refs[sclassid as usize] = self.refs[sclassid as usize].saturating_sub(1);
    }
}

/// Extended attribute blobs live outside the engine; only the copy/remove
/// lifecycle hooks cross the boundary.
pub trait XattrHooks {
    fn copy(&mut self, src_inode: u32, dst_inode: u32) -> bool;
    fn remove(&mut self, inode: u32);
}

#[derive(Default)]
pub struct NoXattr;

impl XattrHooks for NoXattr {
    fn copy(&mut self, _src: u32, _dst: u32) -> bool {
        false
    }
    fn remove(&mut self, _inode: u32) {}
}

pub const POSIX_ACL_ACCESS: u8 = 1;
pub const POSIX_ACL_DEFAULT: u8 = 2;

/// POSIX ACL evaluation and lifecycle, delegated blob-side.
pub trait AclHooks {
    /// rwx access bits for a node carrying an access ACL.
    fn accmode(&self, inode: u32, uid: u32, gids: &[u32], fuid: u32, fgid: u32) -> u8;
    fn getmode(&self, inode: u32) -> u16;
    /// Applies default-ACL inheritance on create; returns bit 1 when an
    /// access ACL was produced, bit 2 for a default ACL.
    fn copydefaults(&mut self, parent_inode: u32, inode: u32, is_dir: bool, mode: &mut u16) -> u8;
    fn copy(&mut self, src_inode: u32, dst_inode: u32, acltype: u8) -> bool;
    fn remove(&mut self, inode: u32, acltype: u8);
}

#[derive(Default)]
pub struct NoAcl;

impl AclHooks for NoAcl {
    fn accmode(&self, _inode: u32, _uid: u32, _gids: &[u32], _fuid: u32, _fgid: u32) -> u8 {
        0
    }
    fn getmode(&self, _inode: u32) -> u16 {
        0
    }
    fn copydefaults(&mut self, _parent: u32, _inode: u32, _is_dir: bool, _mode: &mut u16) -> u8 {
        0
    }
    fn copy(&mut self, _src: u32, _dst: u32, _acltype: u8) -> bool {
        false
    }
    fn remove(&mut self, _inode: u32, _acltype: u8) {}
}

/// The collaborator bundle owned by the filesystem state.
pub struct Hooks {
    pub chunks: Box<dyn ChunkStore>,
    pub open_files: Box<dyn OpenFiles>,
    pub sclass: Box<dyn StorageClasses>,
    pub xattr: Box<dyn XattrHooks>,
    pub acl: Box<dyn AclHooks>,
    /// cooperative yield back to the reactor during long walks
    pub keep_alive: Box<dyn FnMut()>,
}

impl Default for Hooks {
    fn default() -> Self {
        Hooks {
            chunks: Box::new(SimpleChunkStore::new()),
            open_files: Box::new(OpenFileSet::new()),
            sclass: Box::new(SimpleStorageClasses::default()),
            xattr: Box::new(NoXattr),
            acl: Box::new(NoAcl),
            keep_alive: Box::new(|| {}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_chunk_store_refcounts() {
        let mut cs = SimpleChunkStore::new();
        let id = cs.create(2);
        assert_eq!(cs.refcount(id), 1);
        assert!(cs.add_file(id, 2));
        assert_eq!(cs.refcount(id), 2);
        assert!(cs.delete_file(id, 2));
        assert!(cs.delete_file(id, 2));
        assert_eq!(cs.refcount(id), 0);
        // gone now
        assert!(!cs.delete_file(id, 2));
        assert!(!cs.add_file(id, 2));
    }

    #[test]
    fn chunk_store_section_roundtrip() -> anyhow::Result<()> {
        let mut cs = SimpleChunkStore::new();
        let a = cs.create(1);
        let b = cs.create(1);
        cs.add_file(b, 1);
        let mut buf = vec![];
        cs.store(&mut buf);
        let mut cs2 = SimpleChunkStore::new();
        cs2.load(&buf)?;
        assert_eq!(cs2.refcount(a), 1);
        assert_eq!(cs2.refcount(b), 2);
        let c = cs2.create(1);
        assert!(c > b);
        Ok(())
    }

    #[test]
    fn open_file_set() {
        let mut of = OpenFileSet::new();
        assert!(!of.is_open(3));
        of.acquire(3);
        assert!(of.is_open(3));
        of.release(3);
        assert!(!of.is_open(3));
    }
}
