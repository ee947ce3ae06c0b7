//! Metadata image writer: the section-tagged binary dump, its CRC sidecar,
//! backup rotation, the fork-to-dump child and the emergency save ladder.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use fork::{fork, Fork};
use log::{error, info, warn};

use super::buckets::NIL;
use super::dispatcher::Master;
use super::fs::FsState;
use super::node::*;
use super::utils::{crc32, put16, put32, put64, put8};

pub const IMAGE_MAGIC: &[u8; 8] = b"MFSM 2.0";
pub const EOF_MARKER: &[u8; 16] = b"[MFS EOF MARKER]";
pub const NEW_MAGIC: &[u8; 8] = b"MFSM NEW";

/// Section tags in dump order. The set and order are ABI.
pub const SECTION_ORDER: [&[u8; 4]; 14] = [
    b"SESS", b"SCLA", b"PATT", b"NODE", b"EDGE", b"FREE", b"QUOT", b"XATR", b"PACL", b"OPEN",
    b"FLCK", b"PLCK", b"CSDB", b"CHNK",
];

/// Version byte each section is written with (`M.m` in the header).
pub const SECTION_VERSION: u8 = 0x10;

const NODE_FLAG_XATTR: u8 = 0x01;
const NODE_FLAG_ACLPERM: u8 = 0x02;
const NODE_FLAG_ACLDEF: u8 = 0x04;

impl FsState {
    /// NODE payload: one record per inode, sorted by inode number so a
    /// dump-load-dump cycle is byte identical.
    pub fn store_nodes(&self) -> Vec<u8> {
        let mut handles = self.node_hash.handles(&self.nodes);
        handles.sort_unstable_by_key(|&h| self.nodes.get(h).inode);
        let mut buf = Vec::new();
        for h in handles {
            let n = self.nodes.get(h);
            put8(&mut buf, n.ntype.into());
            put32(&mut buf, n.inode);
            let mut flags = 0u8;
            if n.xattrflag {
                flags |= NODE_FLAG_XATTR;
            }
            if n.aclpermflag {
                flags |= NODE_FLAG_ACLPERM;
            }
            if n.acldefflag {
                flags |= NODE_FLAG_ACLDEF;
            }
            put8(&mut buf, flags);
            put16(&mut buf, n.mode);
            put32(&mut buf, n.uid);
            put32(&mut buf, n.gid);
            put32(&mut buf, n.atime);
            put32(&mut buf, n.mtime);
            put32(&mut buf, n.ctime);
            put16(&mut buf, n.trashtime);
            put8(&mut buf, n.sclassid);
            put8(&mut buf, n.eattr);
            put8(&mut buf, n.winattr);
            match &n.data {
                NodeData::File(f) => {
                    put64(&mut buf, f.length);
                    put32(&mut buf, f.chunks);
                    for &cid in self.chunktabs.get(f.chunktab, f.chunks) {
                        put64(&mut buf, cid);
                    }
                }
                NodeData::Symlink(s) => {
                    put16(&mut buf, s.pleng);
                    buf.extend_from_slice(self.symlinks.get(s.path, s.pleng as usize));
                }
                NodeData::Dev(d) => {
                    put32(&mut buf, d.rdev);
                }
                NodeData::Dir(_) | NodeData::Other(_) => {}
            }
        }
        put8(&mut buf, 0); // terminator
        buf
    }

    fn store_edge(&self, buf: &mut Vec<u8>, e_h: u32) {
        let e = self.edges.get(e_h);
        if e.parent == NIL {
            put32(buf, 0);
        } else {
            put32(buf, self.nodes.get(e.parent).inode);
        }
        put32(buf, self.nodes.get(e.child).inode);
        put64(buf, e.edgeid);
        put16(buf, e.nleng);
        buf.extend_from_slice(self.names.get(e.name, e.nleng as usize));
    }

    fn store_edges_rec(&self, buf: &mut Vec<u8>, dir_h: u32) {
        let mut e = self.nodes.get(dir_h).dir().children;
        while e != NIL {
            self.store_edge(buf, e);
            e = self.edges.get(e).nextchild;
        }
        let mut e = self.nodes.get(dir_h).dir().children;
        while e != NIL {
            let child = self.edges.get(e).child;
            if self.nodes.get(child).ntype == NodeType::Directory {
                self.store_edges_rec(buf, child);
            }
            e = self.edges.get(e).nextchild;
        }
    }

    /// EDGE payload: preorder walk from root (a directory's children stay
    /// adjacent), then the trash and sustained buckets; zero terminator.
    pub fn store_edges(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if self.root != NIL {
            self.store_edges_rec(&mut buf, self.root);
        }
        for &head in self.trash.iter() {
            let mut e = head;
            while e != NIL {
                self.store_edge(&mut buf, e);
                e = self.edges.get(e).nextchild;
            }
        }
        for &head in self.sustained.iter() {
            let mut e = head;
            while e != NIL {
                self.store_edge(&mut buf, e);
                e = self.edges.get(e).nextchild;
            }
        }
        // terminator: parent and child both zero
        put32(&mut buf, 0);
        put32(&mut buf, 0);
        put64(&mut buf, 0);
        put16(&mut buf, 0);
        buf
    }

    pub fn store_free(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put32(&mut buf, self.idalloc.queue_len() as u32);
        for f in self.idalloc.queued() {
            put32(&mut buf, f.inode);
            put32(&mut buf, f.ftime);
        }
        buf
    }

    pub fn store_quota(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put32(&mut buf, self.quota_dirs.len() as u32);
        for &h in &self.quota_dirs {
            let n = self.nodes.get(h);
            let q = n.dir().quota.as_ref().expect("registered quota node");
            put32(&mut buf, n.inode);
            put8(&mut buf, u8::from(q.exceeded));
            put8(&mut buf, q.flags);
            put32(&mut buf, q.stimestamp);
            put32(&mut buf, q.sinodes);
            put32(&mut buf, q.hinodes);
            put64(&mut buf, q.slength);
            put64(&mut buf, q.hlength);
            put64(&mut buf, q.ssize);
            put64(&mut buf, q.hsize);
            put64(&mut buf, q.srealsize);
            put64(&mut buf, q.hrealsize);
            put32(&mut buf, q.graceperiod);
        }
        buf
    }
}

impl Master {
    fn section_payload(&mut self, tag: &[u8; 4]) -> Vec<u8> {
        match tag {
            b"NODE" => self.fs.store_nodes(),
            b"EDGE" => self.fs.store_edges(),
            b"FREE" => self.fs.store_free(),
            b"QUOT" => self.fs.store_quota(),
            b"CHNK" => {
                let mut buf = Vec::new();
                self.fs.hooks.chunks.store(&mut buf);
                buf
            }
            // collaborator sections keep their slots in the image even when
            // the collaborators have nothing to say
            _ => Vec::new(),
        }
    }

    /// Writes the complete image. When `crc_out` is given it receives the
    /// `metadata.crc` sidecar contents (header + per-section CRC-32).
    pub fn store_image<W: Write>(&mut self, w: &mut W, mut crc_out: Option<&mut Vec<u8>>) -> Result<()> {
        w.write_all(IMAGE_MAGIC)?;
        let mut hdr = Vec::with_capacity(16);
        put64(&mut hdr, self.metaversion);
        put64(&mut hdr, self.metaid);
        w.write_all(&hdr)?;
        if let Some(crc) = crc_out.as_mut() {
            crc.extend_from_slice(&hdr);
            crc.extend_from_slice(b"HEAD");
            put32(crc, crc32(0, &hdr));
        }
        for tag in SECTION_ORDER.iter() {
            let payload = self.section_payload(tag);
            let mut shdr = Vec::with_capacity(16);
            shdr.extend_from_slice(*tag);
            shdr.push(b' ');
            shdr.push(b'0' + (SECTION_VERSION >> 4));
            shdr.push(b'.');
            shdr.push(b'0' + (SECTION_VERSION & 0xF));
            put64(&mut shdr, payload.len() as u64);
            w.write_all(&shdr)?;
            w.write_all(&payload)?;
            if let Some(crc) = crc_out.as_mut() {
                crc.extend_from_slice(*tag);
                put32(crc, crc32(crc32(0, &shdr), &payload));
            }
        }
        w.write_all(EOF_MARKER)?;
        if let Some(crc) = crc_out.as_mut() {
            crc.extend_from_slice(b"TAIL");
            put32(crc, crc32(0, EOF_MARKER));
        }
        Ok(())
    }

    /// Plain single-file store (emergency path: no crc sidecar).
    pub fn store_image_file(&mut self, path: &Path, crc_path: Option<&Path>) -> Result<()> {
        let f = File::create(path).with_context(|| format!("creating {:?}", path))?;
        let mut w = BufWriter::new(f);
        let mut crc = crc_path.map(|_| Vec::new());
        self.store_image(&mut w, crc.as_mut())?;
        w.flush()?;
        w.get_ref().sync_all()?;
        if let (Some(cp), Some(c)) = (crc_path, crc) {
            std::fs::write(cp, c).with_context(|| format!("writing {:?}", cp))?;
        }
        Ok(())
    }

    /// Candidate locations for a metadata image when the data directory is
    /// unwritable: cwd, $HOME, then the usual system spots.
    pub fn emergency_locations() -> Vec<PathBuf> {
        let mut v = vec![PathBuf::from("metadata.mfs.emergency")];
        if let Ok(home) = std::env::var("HOME") {
            v.push(Path::new(&home).join("metadata.mfs.emergency"));
        }
        for d in ["/tmp", "/var", "/usr", "/usr/share", "/usr/local", "/usr/local/var"] {
            v.push(Path::new(d).join("metadata.mfs.emergency"));
        }
        v
    }

    /// Walks the fallback ladder; returns where the image landed.
    pub fn emergency_saves(&mut self) -> Result<PathBuf> {
        for loc in Master::emergency_locations() {
            if self.store_image_file(&loc, None).is_ok() {
                warn!("metadata file stored in emergency mode, file name: {:?}", loc);
                return Ok(loc);
            }
        }
        Err(anyhow!("no emergency location accepted the metadata image"))
    }
}

/// Shifts `metadata.mfs.back` into the numbered backup rotation.
pub fn rotate_backups(dir: &Path, keep: u32) {
    if keep == 0 {
        return;
    }
    for n in (1..keep).rev() {
        let from = dir.join(format!("metadata.mfs.back.{}", n));
        if from.exists() {
            let _ = std::fs::rename(&from, dir.join(format!("metadata.mfs.back.{}", n + 1)));
        }
    }
    let back = dir.join("metadata.mfs.back");
    if back.exists() {
        let _ = std::fs::rename(&back, dir.join("metadata.mfs.back.1"));
    }
}

/// Dump-child exit codes (see the master's reaction in `dump_child_exited`).
pub const DUMP_OK: i32 = 0;
pub const DUMP_EMERGENCY: i32 = 1;
pub const DUMP_NOTHING: i32 = 2;
pub const DUMP_SIGNALED: i32 = 3;

/// Runs the full dump sequence in-process (the child side of the fork, or
/// the foreground fallback). Returns the would-be exit code.
pub fn dump_sequence(master: &mut Master, dir: &Path, keep_backups: u32) -> i32 {
    let tmp = dir.join("metadata.mfs.back.tmp");
    let crc = dir.join("metadata.crc");
    match master.store_image_file(&tmp, Some(&crc)) {
        Ok(()) => {
            rotate_backups(dir, keep_backups);
            if std::fs::rename(&tmp, dir.join("metadata.mfs.back")).is_err() {
                error!("can't rename metadata.mfs.back.tmp");
                return DUMP_NOTHING;
            }
            let _ = std::fs::remove_file(dir.join("metadata.mfs"));
            DUMP_OK
        }
        Err(e) => {
            error!("can't write metadata: {:#}", e);
            let _ = std::fs::remove_file(&tmp);
            let _ = std::fs::remove_file(&crc);
            match master.emergency_saves() {
                Ok(_) => DUMP_EMERGENCY,
                Err(_) => DUMP_NOTHING,
            }
        }
    }
}

/// Forks the copy-on-write dump child. The parent keeps serving; the child
/// writes the image and leaves through `_exit` so no destructor ever touches
/// the shared slabs. Returns the child pid, or None when the fork failed and
/// the dump ran in the foreground.
pub fn storeall_bg(master: &mut Master, dir: &Path, keep_backups: u32) -> Result<Option<i32>> {
    if master.metaversion == 0 {
        return Err(anyhow!("no metadata to store"));
    }
    match fork() {
        Ok(Fork::Child) => {
            let code = dump_sequence(master, dir, keep_backups);
            unsafe { libc::_exit(code) }
        }
        Ok(Fork::Parent(pid)) => {
            info!("metadata save process forked, pid: {}", pid);
            Ok(Some(pid))
        }
        Err(_) => {
            warn!("fork error (store data in foreground - it will block the master for a while)");
            let code = dump_sequence(master, dir, keep_backups);
            if code != DUMP_OK {
                return Err(anyhow!("foreground store failed (status {})", code));
            }
            Ok(None)
        }
    }
}

/// Master policy on a finished dump child: anything but success is fatal,
/// the metadata must be considered unsafe.
pub fn dump_child_exited(status: i32) -> Result<()> {
    match status {
        DUMP_OK => Ok(()),
        DUMP_EMERGENCY => Err(anyhow!(
            "metadata stored in emergency mode (in non-standard location) - exiting"
        )),
        DUMP_NOTHING => Err(anyhow!("metadata not stored !!! (child exited) - exiting")),
        _ => Err(anyhow!("metadata not stored !!! (child was signaled) - exiting")),
    }
}

/// Dump scheduling: once every `save_freq` minutes, aligned to the
/// configured offset (optionally in local time).
pub fn store_due(now: u32, save_freq_min: u32, offset_min: u32, offset_local: bool) -> bool {
    use chrono::{Local, Offset, TimeZone};
    let offset = if offset_local {
        let local_off = Local
            .timestamp_opt(now as i64, 0)
            .single()
            .map(|t| t.offset().fix().local_minus_utc() / 60)
            .unwrap_or(0);
        if local_off >= 0 {
            (offset_min + 24 * 60 - local_off as u32) % (24 * 60)
        } else {
            (offset_min + (-local_off) as u32) % (24 * 60)
        }
    } else {
        offset_min
    };
    let htime = (now / 60).wrapping_sub(offset);
    save_freq_min > 0 && htime % save_freq_min == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta_lib::test_support::new_master;

    #[test]
    fn image_frame_is_wellformed() -> Result<()> {
        let mut m = new_master();
        m.metaversion = 42;
        m.metaid = 0xDEADBEEF;
        let mut img = Vec::new();
        let mut crc = Vec::new();
        m.store_image(&mut img, Some(&mut crc))?;
        assert_eq!(&img[..8], IMAGE_MAGIC);
        assert_eq!(&img[img.len() - 16..], EOF_MARKER);
        // header carries version and id
        assert_eq!(u64::from_be_bytes(img[8..16].try_into().unwrap()), 42);
        assert_eq!(u64::from_be_bytes(img[16..24].try_into().unwrap()), 0xDEADBEEF);
        // first section tag
        assert_eq!(&img[24..28], b"SESS");
        assert_eq!(&img[28..32], b" 1.0");
        // crc sidecar: 16B header + 8B per entry, HEAD + 14 sections + TAIL
        assert_eq!(crc.len(), 16 + 8 * (1 + SECTION_ORDER.len() + 1));
        assert_eq!(&crc[16..20], b"HEAD");
        Ok(())
    }

    #[test]
    fn backup_rotation_shifts() {
        let dir = std::env::temp_dir().join(format!("mfsmeta-rot-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("metadata.mfs.back"), b"new").unwrap();
        std::fs::write(dir.join("metadata.mfs.back.1"), b"old").unwrap();
        rotate_backups(&dir, 2);
        assert!(!dir.join("metadata.mfs.back").exists());
        assert_eq!(std::fs::read(dir.join("metadata.mfs.back.1")).unwrap(), b"new");
        assert_eq!(std::fs::read(dir.join("metadata.mfs.back.2")).unwrap(), b"old");
    }

    #[test]
    fn store_schedule_alignment() {
        // every 60 minutes at offset 30: due at hh:30 utc
        assert!(store_due(30 * 60, 60, 30, false));
        assert!(!store_due(0, 60, 30, false));
        assert!(store_due(90 * 60, 60, 30, false));
    }
}
