//! In-memory metadata records: inodes and the named edges linking them.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::buckets::{BlobRef, BLOB_NIL, NIL};
use super::hashtab::Chained;
use super::quota::QuotaNode;
use super::utils::hash32;

/*
 * Special inode numbers
 */
pub const ROOT_INODE: u32 = 1; /* 0 is reserved */

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_PATH_LEN: usize = 1024;
pub const MAX_SYMLINK_LEN: usize = 4096;

pub const DEFAULT_SCLASS: u8 = 2;
pub const DEFAULT_TRASHTIME: u16 = 24; /* hours */

pub const MAX_INDEX: u32 = 0x7FFFFFFF;

pub const EDGEID_MAX: u64 = 0x7FFF_FFFF_FFFF_FFFF;
pub const EDGEID_HASHSIZE: usize = 65536;

pub const TRASH_BUCKETS: usize = 4096;
pub const SUSTAINED_BUCKETS: usize = 256;

/*
 * Chunk geometry (sizes are protocol constants shared with chunkservers)
 */
pub const CHUNK_BITS: u32 = 26;
pub const CHUNK_SIZE: u64 = 1 << CHUNK_BITS; /* 64 MiB */
pub const CHUNK_MASK: u64 = CHUNK_SIZE - 1;
pub const BLOCK_SIZE: u64 = 0x10000; /* 64 KiB */
pub const CHUNK_HDR_SIZE: u64 = 0x1400; /* index + crc block */

/*
 * Extended attribute bits
 */
pub const EATTR_NOOWNER: u8 = 0x01;
pub const EATTR_NOACACHE: u8 = 0x02;
pub const EATTR_NOECACHE: u8 = 0x04;
pub const EATTR_NODATACACHE: u8 = 0x08;
pub const EATTR_SNAPSHOT: u8 = 0x10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum NodeType {
    File = 1,
    Directory = 2,
    Symlink = 3,
    Fifo = 4,
    BlockDev = 5,
    CharDev = 6,
    Socket = 7,
    Trash = 8,
    Sustained = 9,
}

impl Default for NodeType {
    fn default() -> Self {
        NodeType::File
    }
}

impl NodeType {
    /// File, trash and sustained nodes share the file payload.
    pub fn is_file_kind(self) -> bool {
        matches!(self, NodeType::File | NodeType::Trash | NodeType::Sustained)
    }

    pub fn display_char(self) -> u8 {
        match self {
            NodeType::File => b'f',
            NodeType::Directory => b'd',
            NodeType::Symlink => b'l',
            NodeType::Fifo => b'q',
            NodeType::BlockDev => b'b',
            NodeType::CharDev => b'c',
            NodeType::Socket => b's',
            NodeType::Trash => b't',
            NodeType::Sustained => b'r',
        }
    }
}

/// Aggregated per-directory usage, maintained bottom-up over every parent
/// chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsRecord {
    pub inodes: u32,
    pub dirs: u32,
    pub files: u32,
    pub chunks: u32,
    pub length: u64,
    pub size: u64,
    pub realsize: u64,
}

impl StatsRecord {
    pub fn add(&mut self, sr: &StatsRecord) {
        self.inodes = self.inodes.wrapping_add(sr.inodes);
        self.dirs = self.dirs.wrapping_add(sr.dirs);
        self.files = self.files.wrapping_add(sr.files);
        self.chunks = self.chunks.wrapping_add(sr.chunks);
        self.length = self.length.wrapping_add(sr.length);
        self.size = self.size.wrapping_add(sr.size);
        self.realsize = self.realsize.wrapping_add(sr.realsize);
    }

    pub fn sub(&mut self, sr: &StatsRecord) {
        self.inodes = self.inodes.wrapping_sub(sr.inodes);
        self.dirs = self.dirs.wrapping_sub(sr.dirs);
        self.files = self.files.wrapping_sub(sr.files);
        self.chunks = self.chunks.wrapping_sub(sr.chunks);
        self.length = self.length.wrapping_sub(sr.length);
        self.size = self.size.wrapping_sub(sr.size);
        self.realsize = self.realsize.wrapping_sub(sr.realsize);
    }

    pub fn diff(new: &StatsRecord, prev: &StatsRecord) -> StatsRecord {
        let mut d = *new;
        d.sub(prev);
        d
    }
}

#[derive(Debug)]
pub struct DirData {
    pub children: u32, /* edge handle */
    pub nlink: u32,    /* 2 + number of subdirectories */
    pub elements: u32,
    pub stats: StatsRecord,
    pub quota: Option<Box<QuotaNode>>,
}

impl Default for DirData {
    fn default() -> Self {
        DirData { children: NIL, nlink: 2, elements: 0, stats: StatsRecord::default(), quota: None }
    }
}

#[derive(Debug)]
pub struct FileData {
    pub length: u64,
    pub chunks: u32,
    pub chunktab: u32, /* chunk-table handle, NIL when empty */
    pub nlink: u16,    /* 0 for trash and sustained */
    pub realsize_ratio: u8, /* cached storage-class keep-max goal */
}

impl Default for FileData {
    fn default() -> Self {
        FileData { length: 0, chunks: 0, chunktab: NIL, nlink: 0, realsize_ratio: 0 }
    }
}

#[derive(Debug)]
pub struct SymlinkData {
    pub path: BlobRef,
    pub pleng: u16,
    pub nlink: u16,
}

impl Default for SymlinkData {
    fn default() -> Self {
        SymlinkData { path: BLOB_NIL, pleng: 0, nlink: 0 }
    }
}

#[derive(Debug, Default)]
pub struct DevData {
    pub rdev: u32,
    pub nlink: u16,
}

#[derive(Debug, Default)]
pub struct OtherData {
    pub nlink: u16,
}

#[derive(Debug)]
pub enum NodeData {
    Dir(DirData),
    File(FileData),
    Symlink(SymlinkData),
    Dev(DevData),
    Other(OtherData),
}

impl NodeData {
    pub fn for_type(t: NodeType) -> NodeData {
        match t {
            NodeType::Directory => NodeData::Dir(DirData::default()),
            NodeType::File | NodeType::Trash | NodeType::Sustained => {
                NodeData::File(FileData::default())
            }
            NodeType::Symlink => NodeData::Symlink(SymlinkData::default()),
            NodeType::BlockDev | NodeType::CharDev => NodeData::Dev(DevData::default()),
            NodeType::Fifo | NodeType::Socket => NodeData::Other(OtherData::default()),
        }
    }
}

#[derive(Debug)]
pub struct FsNode {
    pub inode: u32,
    pub ntype: NodeType,
    pub ctime: u32,
    pub mtime: u32,
    pub atime: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u16, /* low 12 bits */
    pub eattr: u8,
    pub winattr: u8,
    pub sclassid: u8,
    pub trashtime: u16, /* hours */
    pub xattrflag: bool,
    pub aclpermflag: bool,
    pub acldefflag: bool,
    pub parents: u32, /* head of the parent-edge list */
    pub(crate) hnext: u32,
    pub data: NodeData,
}

impl Default for FsNode {
    fn default() -> Self {
        FsNode {
            inode: 0,
            ntype: NodeType::File,
            ctime: 0,
            mtime: 0,
            atime: 0,
            uid: 0,
            gid: 0,
            mode: 0,
            eattr: 0,
            winattr: 0,
            sclassid: 0,
            trashtime: 0,
            xattrflag: false,
            aclpermflag: false,
            acldefflag: false,
            parents: NIL,
            hnext: NIL,
            data: NodeData::File(FileData::default()),
        }
    }
}

impl Chained for FsNode {
    fn hashval(&self) -> u32 {
        hash32(self.inode)
    }
    fn hnext(&self) -> u32 {
        self.hnext
    }
    fn set_hnext(&mut self, h: u32) {
        self.hnext = h;
    }
}

impl FsNode {
    pub fn dir(&self) -> &DirData {
        match &self.data {
            NodeData::Dir(d) => d,
            _ => panic!("structure error - node {} is not a directory", self.inode),
        }
    }

    pub fn dir_mut(&mut self) -> &mut DirData {
        match &mut self.data {
            NodeData::Dir(d) => d,
            _ => panic!("structure error - node {} is not a directory", self.inode),
        }
    }

    pub fn file(&self) -> &FileData {
        match &self.data {
            NodeData::File(f) => f,
            _ => panic!("structure error - node {} is not a file", self.inode),
        }
    }

    pub fn file_mut(&mut self) -> &mut FileData {
        match &mut self.data {
            NodeData::File(f) => f,
            _ => panic!("structure error - node {} is not a file", self.inode),
        }
    }

    pub fn symlink(&self) -> &SymlinkData {
        match &self.data {
            NodeData::Symlink(s) => s,
            _ => panic!("structure error - node {} is not a symlink", self.inode),
        }
    }

    pub fn symlink_mut(&mut self) -> &mut SymlinkData {
        match &mut self.data {
            NodeData::Symlink(s) => s,
            _ => panic!("structure error - node {} is not a symlink", self.inode),
        }
    }

    pub fn nlink(&self) -> u32 {
        match &self.data {
            NodeData::Dir(d) => d.nlink,
            NodeData::File(f) => f.nlink as u32,
            NodeData::Symlink(s) => s.nlink as u32,
            NodeData::Dev(d) => d.nlink as u32,
            NodeData::Other(o) => o.nlink as u32,
        }
    }

    /// On link/unlink of a non-directory child, the child's own counter
    /// changes; for directories the parent's `nlink` tracks subdirectories.
    pub fn nlink_adjust(&mut self, up: bool) {
        let d: i32 = if up { 1 } else { -1 };
        match &mut self.data {
            NodeData::Dir(x) => x.nlink = (x.nlink as i64 + d as i64) as u32,
            NodeData::File(x) => x.nlink = (x.nlink as i32 + d) as u16,
            NodeData::Symlink(x) => x.nlink = (x.nlink as i32 + d) as u16,
            NodeData::Dev(x) => x.nlink = (x.nlink as i32 + d) as u16,
            NodeData::Other(x) => x.nlink = (x.nlink as i32 + d) as u16,
        }
    }
}

#[derive(Debug)]
pub struct FsEdge {
    pub parent: u32, /* node handle; NIL for trash/sustained entries */
    pub child: u32,  /* node handle */
    pub nextchild: u32,
    pub prevchild: u32,
    pub nextparent: u32,
    pub prevparent: u32,
    pub edgeid: u64,
    pub hashval: u32,
    pub(crate) hnext: u32,
    pub name: BlobRef,
    pub nleng: u16,
}

impl Default for FsEdge {
    fn default() -> Self {
        FsEdge {
            parent: NIL,
            child: NIL,
            nextchild: NIL,
            prevchild: NIL,
            nextparent: NIL,
            prevparent: NIL,
            edgeid: 0,
            hashval: 0,
            hnext: NIL,
            name: BLOB_NIL,
            nleng: 0,
        }
    }
}

impl Chained for FsEdge {
    fn hashval(&self) -> u32 {
        self.hashval
    }
    fn hnext(&self) -> u32 {
        self.hnext
    }
    fn set_hnext(&mut self, h: u32) {
        self.hnext = h;
    }
}

/// Edge-name hash: parent id mixed with the name bytes.
pub fn edge_hash(parent_inode: u32, name: &[u8]) -> u32 {
    let mut hash = parent_inode.wrapping_mul(0x5F2318BD).wrapping_add(name.len() as u32);
    for &c in name {
        hash = hash.wrapping_mul(33).wrapping_add(c as u32);
    }
    hash
}

/// Rejects empty names, overlong names, `/` and NUL bytes, `.` and `..`.
pub fn namecheck(name: &[u8]) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    if name[0] == b'.' && (name.len() == 1 || (name.len() == 2 && name[1] == b'.')) {
        return false;
    }
    !name.iter().any(|&c| c == 0 || c == b'/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namecheck_policy() {
        assert!(namecheck(b"a"));
        assert!(namecheck(b"..."));
        assert!(namecheck(b".hidden"));
        assert!(!namecheck(b""));
        assert!(!namecheck(b"."));
        assert!(!namecheck(b".."));
        assert!(!namecheck(b"a/b"));
        assert!(!namecheck(b"a\0b"));
        assert!(!namecheck(&[b'x'; 256]));
        assert!(namecheck(&[b'x'; 255]));
    }

    #[test]
    fn edge_hash_depends_on_parent_and_name() {
        assert_ne!(edge_hash(1, b"foo"), edge_hash(2, b"foo"));
        assert_ne!(edge_hash(1, b"foo"), edge_hash(1, b"fop"));
        assert_ne!(edge_hash(1, b"ab"), edge_hash(1, b"ba"));
    }

    #[test]
    fn stats_add_sub_roundtrip() {
        let mut a = StatsRecord { inodes: 5, dirs: 1, files: 3, chunks: 7, length: 100, size: 200, realsize: 400 };
        let b = StatsRecord { inodes: 2, dirs: 0, files: 2, chunks: 3, length: 40, size: 80, realsize: 160 };
        let orig = a;
        a.add(&b);
        a.sub(&b);
        assert_eq!(a, orig);
        let d = StatsRecord::diff(&b, &b);
        assert_eq!(d, StatsRecord::default());
    }

    #[test]
    fn node_type_wire_values() {
        assert_eq!(u8::from(NodeType::File), 1);
        assert_eq!(u8::from(NodeType::Sustained), 9);
        assert_eq!(NodeType::try_from(2u8).unwrap(), NodeType::Directory);
        assert!(NodeType::Trash.is_file_kind());
        assert!(!NodeType::Directory.is_file_kind());
    }
}
