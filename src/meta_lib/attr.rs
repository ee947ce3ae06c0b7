//! Access control and the wire attribute record.

use super::buckets::NIL;
use super::config::AtimeMode;
use super::fs::FsState;
use super::node::*;
use super::utils::{put16, put32, put64, put8};

/* session flag bits - wire ABI */
pub const SESFLAG_READONLY: u8 = 0x01;
pub const SESFLAG_DYNAMICIP: u8 = 0x02; /* reserved */
pub const SESFLAG_IGNOREGID: u8 = 0x04;
pub const SESFLAG_ADMIN: u8 = 0x08;
pub const SESFLAG_MAPALL: u8 = 0x10;
pub const SESFLAG_ATTRBIT: u8 = 0x40;
pub const SESFLAG_METARESTORE: u8 = 0x80;

/* attribute-record flag bits */
pub const MATTR_NOACACHE: u8 = 0x01;
pub const MATTR_NOECACHE: u8 = 0x02;
pub const MATTR_ALLOWDATACACHE: u8 = 0x04;
pub const MATTR_NOXATTR: u8 = 0x08;
pub const MATTR_DIRECTMODE: u8 = 0x10;

pub const MODE_MASK_X: u8 = 1;
pub const MODE_MASK_W: u8 = 2;
pub const MODE_MASK_R: u8 = 4;

pub const ATTR_RECORD_SIZE: usize = 36; /* 35 + windows-attribute byte */

/// For each rwx triplet, the set of mode-mask subsets it satisfies; access
/// checks test a single bit of this mask.
const MODE_TO_ACCMODE: [u8; 8] = [0x01, 0x03, 0x05, 0x0F, 0x11, 0x33, 0x55, 0xFF];

impl FsState {
    /// Allowed-access bitmask for a node (see `MODE_TO_ACCMODE`).
    pub fn accessmode(&self, node_h: u32, uid: u32, gids: &[u32], sesflags: u8) -> u8 {
        let n = self.nodes.get(node_h);
        if uid == 0 {
            return MODE_TO_ACCMODE[7];
        }
        if n.aclpermflag {
            return self.hooks.acl.accmode(n.inode, uid, gids, n.uid, n.gid);
        }
        if uid == n.uid || n.eattr & EATTR_NOOWNER != 0 {
            MODE_TO_ACCMODE[((n.mode >> 6) & 7) as usize]
        } else if sesflags & SESFLAG_IGNOREGID != 0 {
            MODE_TO_ACCMODE[(((n.mode >> 3) | n.mode) & 7) as usize]
        } else if gids.iter().any(|&g| g == n.gid) {
            MODE_TO_ACCMODE[((n.mode >> 3) & 7) as usize]
        } else {
            MODE_TO_ACCMODE[(n.mode & 7) as usize]
        }
    }

    pub fn access_ext(&self, node_h: u32, uid: u32, gids: &[u32], modemask: u8, sesflags: u8) -> bool {
        self.accessmode(node_h, uid, gids, sesflags) & (1 << (modemask & 0x7)) != 0
    }

    /// Deletion from a sticky directory requires ownership of the directory
    /// or of the victim.
    pub fn sticky_access(&self, parent_h: u32, node_h: u32, uid: u32) -> bool {
        if uid == 0 {
            return true;
        }
        let p = self.nodes.get(parent_h);
        if p.mode & 0o1000 == 0 {
            return true;
        }
        let n = self.nodes.get(node_h);
        uid == p.uid || p.eattr & EATTR_NOOWNER != 0 || uid == n.uid || n.eattr & EATTR_NOOWNER != 0
    }

    /// Number of links visible from a given export root.
    pub fn nlink_from_root(&self, rootinode: u32, node_h: u32) -> u32 {
        let n = self.nodes.get(node_h);
        if n.inode == rootinode {
            return 0;
        }
        if rootinode == ROOT_INODE {
            let mut cnt = 0;
            let mut e = n.parents;
            while e != NIL {
                cnt += 1;
                e = self.edges.get(e).nextparent;
            }
            return cnt;
        }
        let mut cnt = 0;
        let mut e = n.parents;
        while e != NIL {
            let edge = self.edges.get(e);
            let mut p = edge.parent;
            while p != NIL {
                if self.nodes.get(p).inode == rootinode {
                    cnt += 1;
                    break;
                }
                let pe = self.nodes.get(p).parents;
                if pe == NIL {
                    break;
                }
                p = self.edges.get(pe).parent;
            }
            e = edge.nextparent;
        }
        cnt
    }

    /// Serializes the wire attribute record (35 bytes, or 36 with the
    /// windows-attribute byte appended).
    #[allow(clippy::too_many_arguments)]
    pub fn fill_attr(
        &self,
        node_h: u32,
        parent_h: u32,
        mut uid: u32,
        mut gid: u32,
        auid: u32,
        agid: u32,
        sesflags: u8,
        addwinattr: bool,
    ) -> Vec<u8> {
        let n = self.nodes.get(node_h);
        let mut attr = Vec::with_capacity(ATTR_RECORD_SIZE);
        let wire_type = match n.ntype {
            NodeType::Trash | NodeType::Sustained => NodeType::File,
            t => t,
        };
        let mut flags = 0u8;
        if parent_h != NIL && self.nodes.get(parent_h).eattr & EATTR_NOECACHE != 0 {
            flags |= MATTR_NOECACHE;
        }
        if n.eattr & (EATTR_NOOWNER | EATTR_NOACACHE) != 0 || sesflags & SESFLAG_MAPALL != 0 {
            flags |= MATTR_NOACACHE;
        }
        if n.eattr & EATTR_NODATACACHE == 0 {
            flags |= MATTR_ALLOWDATACACHE;
        } else {
            flags |= MATTR_DIRECTMODE;
        }
        if !n.xattrflag && !n.aclpermflag && !n.acldefflag {
            flags |= MATTR_NOXATTR;
        }
        let mut mode = if n.aclpermflag {
            (self.hooks.acl.getmode(n.inode) & 0o777) | (n.mode & 0o7000)
        } else {
            n.mode & 0o7777
        };
        if n.eattr & EATTR_NOOWNER != 0 && uid != 0 {
            // everybody is an owner: mirror the owner triplet
            mode &= 0o7700;
            mode |= (mode & 0o700) >> 3;
            mode |= (mode & 0o700) >> 6;
            if sesflags & SESFLAG_MAPALL != 0 {
                uid = auid;
                gid = agid;
            }
        } else if sesflags & SESFLAG_MAPALL != 0 && auid != 0 {
            if n.uid == uid {
                uid = auid;
            } else {
                uid = 0;
            }
            if n.gid == gid {
                gid = agid;
            } else {
                gid = 0;
            }
        } else {
            uid = n.uid;
            gid = n.gid;
        }
        if sesflags & SESFLAG_ATTRBIT != 0 {
            put8(&mut attr, flags);
            put16(&mut attr, mode | ((u8::from(wire_type) as u16) << 12));
        } else {
            put8(&mut attr, wire_type.display_char());
            put16(&mut attr, mode | ((flags as u16) << 12));
        }
        put32(&mut attr, uid);
        put32(&mut attr, gid);
        put32(&mut attr, n.atime);
        put32(&mut attr, n.mtime);
        put32(&mut attr, n.ctime);
        match &n.data {
            NodeData::File(f) => {
                put32(&mut attr, f.nlink as u32);
                put64(&mut attr, f.length);
            }
            NodeData::Dir(d) => {
                put32(&mut attr, d.nlink);
                put64(&mut attr, dir_length_encode(d.stats.length));
            }
            NodeData::Symlink(s) => {
                put32(&mut attr, s.nlink as u32);
                put32(&mut attr, 0);
                put32(&mut attr, s.pleng as u32);
            }
            NodeData::Dev(d) => {
                put32(&mut attr, d.nlink as u32);
                put32(&mut attr, d.rdev);
                put32(&mut attr, 0);
            }
            NodeData::Other(o) => {
                put32(&mut attr, o.nlink as u32);
                put64(&mut attr, 0);
            }
        }
        if addwinattr {
            put8(&mut attr, n.winattr);
        }
        attr
    }

    /// Whether a lookup/readdir touch should refresh atime under the
    /// configured policy.
    pub fn atime_update_general(&self, node_h: u32, ts: u32) -> bool {
        let n = self.nodes.get(node_h);
        match self.cfg.atime_mode {
            AtimeMode::Always => true,
            AtimeMode::RelativeOnly => atime_relative_due(n.atime, n.ctime, n.mtime, ts),
            _ => false,
        }
    }

    /// File-content reads are allowed to refresh atime in two more modes.
    pub fn atime_update_file(&self, node_h: u32, ts: u32) -> bool {
        let n = self.nodes.get(node_h);
        match self.cfg.atime_mode {
            AtimeMode::Always | AtimeMode::FilesOnly => true,
            AtimeMode::RelativeOnly | AtimeMode::FilesAndRelativeOnly => {
                atime_relative_due(n.atime, n.ctime, n.mtime, ts)
            }
            AtimeMode::Never => false,
        }
    }
}

/// relatime rule: refresh when atime trails ctime or mtime, or once a day.
fn atime_relative_due(atime: u32, ctime: u32, mtime: u32, ts: u32) -> bool {
    (atime <= ctime && ts >= ctime) || (atime <= mtime && ts >= mtime) || atime + 86400 < ts
}

/// 'Floating point' directory sizes: 32-bit clients render `e(M-1)+DD.DD`
/// as a human-readable size. Examples: 1200 = 12.00 B, 1023443 = 234.43 kB,
/// 2052312 = 523.12 MB. Above 16 EB the pre-shift silently drops 10 bits of
/// precision; the encoding is kept bit-exact for wire compatibility.
pub fn dir_length_encode(mut dleng: u64) -> u64 {
    if dleng == 0 {
        // never report size 0 for directories
        1
    } else if dleng < 0x400 {
        dleng * 100
    } else if dleng < 0x100000 {
        (dleng * 100 >> 10) + 1000000
    } else if dleng < 0x40000000 {
        (dleng * 100 >> 20) + 2000000
    } else if dleng < 0x10000000000 {
        (dleng * 100 >> 30) + 3000000
    } else if dleng < 0x4000000000000 {
        (dleng * 100 >> 40) + 4000000
    } else if dleng < 0x1000000000000000 {
        dleng >>= 10; // overflow guard
        (dleng * 100 >> 40) + 5000000
    } else {
        dleng >>= 10;
        (dleng * 100 >> 50) + 6000000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta_lib::test_support::new_fs;

    #[test]
    fn accessmode_owner_group_other() {
        let mut fs = new_fs();
        let root = fs.root;
        let f = fs.create_node(1, root, b"f", NodeType::File, 0o640, 0, 1000, 100, false);
        // owner: rw-
        assert!(fs.access_ext(f, 1000, &[5], MODE_MASK_R | MODE_MASK_W, 0));
        assert!(!fs.access_ext(f, 1000, &[5], MODE_MASK_X, 0));
        // group: r--
        assert!(fs.access_ext(f, 2000, &[100], MODE_MASK_R, 0));
        assert!(!fs.access_ext(f, 2000, &[100], MODE_MASK_W, 0));
        // other: ---
        assert!(!fs.access_ext(f, 2000, &[5], MODE_MASK_R, 0));
        // root bypasses everything
        assert!(fs.access_ext(f, 0, &[5], MODE_MASK_R | MODE_MASK_W | MODE_MASK_X, 0));
        // IGNOREGID unions group and other triplets
        assert!(fs.access_ext(f, 2000, &[5], MODE_MASK_R, SESFLAG_IGNOREGID));
    }

    #[test]
    fn noowner_grants_owner_triplet() {
        let mut fs = new_fs();
        let root = fs.root;
        let f = fs.create_node(1, root, b"f", NodeType::File, 0o600, 0, 1000, 100, false);
        assert!(!fs.access_ext(f, 2000, &[5], MODE_MASK_R, 0));
        fs.nodes.get_mut(f).eattr |= EATTR_NOOWNER;
        assert!(fs.access_ext(f, 2000, &[5], MODE_MASK_R | MODE_MASK_W, 0));
    }

    #[test]
    fn sticky_bit_restricts_deletion() {
        let mut fs = new_fs();
        let root = fs.root;
        let d = fs.create_node(1, root, b"tmp", NodeType::Directory, 0o1777, 0, 0, 0, false);
        let f = fs.create_node(1, d, b"f", NodeType::File, 0o644, 0, 1000, 1000, false);
        assert!(fs.sticky_access(d, f, 0));
        assert!(fs.sticky_access(d, f, 1000)); // file owner
        assert!(!fs.sticky_access(d, f, 2000));
        fs.nodes.get_mut(d).mode = 0o777; // sticky cleared
        assert!(fs.sticky_access(d, f, 2000));
    }

    #[test]
    fn attr_record_layout() {
        let mut fs = new_fs();
        let root = fs.root;
        let f = fs.create_node(7, root, b"f", NodeType::File, 0o644, 0, 42, 43, false);
        fs.nodes.get_mut(f).file_mut().length = 1234;
        let a = fs.fill_attr(f, root, 42, 43, 42, 43, 0, false);
        assert_eq!(a.len(), 35);
        assert_eq!(a[0], b'f');
        // mode in low 12 bits of the 16-bit field
        assert_eq!(u16::from_be_bytes([a[1], a[2]]) & 0o7777, 0o644);
        assert_eq!(u32::from_be_bytes([a[3], a[4], a[5], a[6]]), 42);
        assert_eq!(u32::from_be_bytes([a[7], a[8], a[9], a[10]]), 43);
        // nlink then length
        assert_eq!(u32::from_be_bytes([a[23], a[24], a[25], a[26]]), 1);
        assert_eq!(
            u64::from_be_bytes([a[27], a[28], a[29], a[30], a[31], a[32], a[33], a[34]]),
            1234
        );
        let a = fs.fill_attr(f, root, 42, 43, 42, 43, 0, true);
        assert_eq!(a.len(), ATTR_RECORD_SIZE);
        // ATTRBIT sessions get the numeric type in the mode word
        let a = fs.fill_attr(f, root, 42, 43, 42, 43, SESFLAG_ATTRBIT, false);
        assert_eq!(u16::from_be_bytes([a[1], a[2]]) >> 12, u8::from(NodeType::File) as u16);
    }

    #[test]
    fn dir_length_encoding_examples() {
        assert_eq!(dir_length_encode(0), 1);
        assert_eq!(dir_length_encode(12), 1200);
        // 234.43 kB
        let v = dir_length_encode(240057);
        assert_eq!(v / 1000000, 1);
        assert_eq!((v % 1000000) / 100, 234);
        // 523.12 MB
        let v = dir_length_encode(548533567);
        assert_eq!(v / 1000000, 2);
        assert_eq!((v % 1000000) / 100, 523);
        // monotonic across the exabyte pre-shift boundary
        assert!(dir_length_encode(1 << 61) >= dir_length_encode((1 << 60) - 1));
    }

    #[test]
    fn atime_policy_modes() {
        use crate::meta_lib::config::AtimeMode;
        let mut fs = new_fs();
        let root = fs.root;
        let f = fs.create_node(100, root, b"f", NodeType::File, 0o644, 0, 0, 0, false);
        {
            let n = fs.nodes.get_mut(f);
            n.atime = 1000;
            n.mtime = 500;
            n.ctime = 500;
        }
        fs.cfg.atime_mode = AtimeMode::Always;
        assert!(fs.atime_update_general(f, 1001));
        fs.cfg.atime_mode = AtimeMode::Never;
        assert!(!fs.atime_update_file(f, 1001));
        fs.cfg.atime_mode = AtimeMode::FilesOnly;
        assert!(fs.atime_update_file(f, 1001));
        assert!(!fs.atime_update_general(f, 1001));
        fs.cfg.atime_mode = AtimeMode::RelativeOnly;
        // atime is already fresher than c/mtime and younger than a day
        assert!(!fs.atime_update_general(f, 1001));
        // but a day later it is due
        assert!(fs.atime_update_general(f, 1000 + 86401));
        // and after a content change it is due again
        fs.nodes.get_mut(f).mtime = 2000;
        assert!(fs.atime_update_general(f, 2001));
    }
}
