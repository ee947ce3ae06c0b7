//! Crash recovery: metadata file selection, image loading, consistency
//! reconstruction and changelog replay.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};

use super::buckets::NIL;
use super::changelog::{self, unescape_name};
use super::dispatcher::Master;
use super::errors::MfsError;
use super::fs::FsState;
use super::node::*;
use super::quota::QuotaNode;
use super::store::{EOF_MARKER, IMAGE_MAGIC, NEW_MAGIC, SECTION_VERSION};
use super::utils::Unpack;

/// Largest tolerated gap between consecutive changelog versions.
pub const MAXIDHOLE: u64 = 10000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaCheck {
    Ok,
    NoFile,
    IoError,
    BadHeader,
    BadEnding,
}

/// Header/trailer sanity check of a metadata file; returns its version and
/// cluster id without loading it.
pub fn check_metadata_file(path: &Path) -> (MetaCheck, u64, u64) {
    let mut f = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return (MetaCheck::NoFile, 0, 0),
        Err(_) => return (MetaCheck::IoError, 0, 0),
    };
    let mut magic = [0u8; 8];
    if f.read_exact(&mut magic).is_err() {
        return (MetaCheck::IoError, 0, 0);
    }
    if &magic == NEW_MAGIC {
        return (MetaCheck::Ok, 1, 0);
    }
    if &magic != IMAGE_MAGIC {
        return (MetaCheck::BadHeader, 0, 0);
    }
    let mut hdr = [0u8; 16];
    if f.read_exact(&mut hdr).is_err() {
        return (MetaCheck::IoError, 0, 0);
    }
    let ver = u64::from_be_bytes(hdr[..8].try_into().unwrap());
    let id = u64::from_be_bytes(hdr[8..].try_into().unwrap());
    let mut tail = [0u8; 16];
    if f.seek(SeekFrom::End(-16)).is_err() || f.read_exact(&mut tail).is_err() {
        return (MetaCheck::IoError, ver, id);
    }
    if &tail != EOF_MARKER {
        return (MetaCheck::BadEnding, ver, id);
    }
    (MetaCheck::Ok, ver, id)
}

/* edge loading keeps list order by remembering the last splice point */
#[derive(Default)]
struct EdgeLoadState {
    last_parent: u32,
    last_edge: u32,
    last_bucket: HashMap<(u8, usize), u32>,
    valid: bool,
}

impl FsState {
    fn load_nodes(&mut self, data: &[u8], _ignore: bool) -> Result<()> {
        let mut u = Unpack::new(data);
        loop {
            let tbyte = u.get8()?;
            if tbyte == 0 {
                break;
            }
            let ntype = NodeType::try_from(tbyte)
                .map_err(|_| anyhow!("loading node: unknown node type {}", tbyte))?;
            let inode = u.get32()?;
            let flags = u.get8()?;
            let mode = u.get16()?;
            let uid = u.get32()?;
            let gid = u.get32()?;
            let atime = u.get32()?;
            let mtime = u.get32()?;
            let ctime = u.get32()?;
            let trashtime = u.get16()?;
            let sclassid = u.get8()?;
            let eattr = u.get8()?;
            let winattr = u.get8()?;
            let mut node = FsNode {
                inode,
                ntype,
                ctime,
                mtime,
                atime,
                uid,
                gid,
                mode,
                eattr,
                winattr,
                sclassid,
                trashtime,
                xattrflag: flags & 0x01 != 0,
                aclpermflag: flags & 0x02 != 0,
                acldefflag: flags & 0x04 != 0,
                parents: NIL,
                data: NodeData::for_type(ntype),
                ..Default::default()
            };
            match &mut node.data {
                NodeData::File(fd) => {
                    fd.length = u.get64()?;
                    let chunks = u.get32()?;
                    let tab = self.chunktabs.alloc(chunks);
                    fd.chunks = chunks;
                    fd.chunktab = tab;
                    for i in 0..chunks {
                        let cid = u.get64()?;
                        if chunks > 0 {
                            self.chunktabs.get_mut(tab, chunks)[i as usize] = cid;
                        }
                    }
                    fd.realsize_ratio = self.hooks.sclass.keepmax_goal(sclassid);
                }
                NodeData::Symlink(sd) => {
                    let pleng = u.get16()?;
                    let path = u.bytes(pleng as usize)?;
                    sd.path = self.symlinks.alloc(path);
                    sd.pleng = pleng;
                }
                NodeData::Dev(dd) => {
                    dd.rdev = u.get32()?;
                }
                _ => {}
            }
            self.hooks.sclass.incref(sclassid, ntype);
            self.idalloc.mark_used(inode);
            self.nodes_count += 1;
            self.hashelements += 1;
            match ntype {
                NodeType::Directory => self.dirnodes += 1,
                t if t.is_file_kind() => self.filenodes += 1,
                _ => {}
            }
            let h = self.nodes.alloc(node);
            if inode == ROOT_INODE {
                self.root = h;
            }
            self.node_hash_add(h);
        }
        if u.remaining() > 0 {
            bail!("loading node: trailing bytes in section");
        }
        if self.root == NIL {
            bail!("loading node: root inode not found");
        }
        Ok(())
    }

    /// Rebuilds one edge: splices lists (preserving dump order), restores
    /// link counts and folds the child's stats into every ancestor.
    fn load_edge(
        &mut self,
        parent_inode: u32,
        child_inode: u32,
        edgeid: u64,
        name: &[u8],
        st: &mut EdgeLoadState,
    ) -> Result<()> {
        let child = self
            .node_find(child_inode)
            .ok_or_else(|| anyhow!("loading edge: child {} not found", child_inode))?;
        if edgeid == 0 {
            self.edges_need_renumeration = true;
        } else if edgeid <= self.nextedgeid {
            self.nextedgeid = edgeid - 1;
        }
        if parent_inode == 0 {
            // detached edge: hangs off a trash or sustained bucket
            let (ntype, length, inode) = {
                let n = self.nodes.get(child);
                let len = if n.ntype.is_file_kind() { n.file().length } else { 0 };
                (n.ntype, len, n.inode)
            };
            let name_ref = self.names.alloc(&name[..name.len().min(MAX_PATH_LEN)]);
            let e_h = self.edges.alloc(FsEdge {
                parent: NIL,
                child,
                edgeid,
                name: name_ref,
                nleng: name.len().min(MAX_PATH_LEN) as u16,
                ..Default::default()
            });
            let (kind, bid) = match ntype {
                NodeType::Trash => {
                    self.trashspace += length;
                    self.trashnodes += 1;
                    (8u8, inode as usize % TRASH_BUCKETS)
                }
                NodeType::Sustained => {
                    self.sustainedspace += length;
                    self.sustainednodes += 1;
                    (9u8, inode as usize % SUSTAINED_BUCKETS)
                }
                _ => bail!("loading edge: detached edge to live node {}", child_inode),
            };
            // tail-splice keeps the stored bucket order
            match st.last_bucket.get(&(kind, bid)) {
                Some(&tail) => {
                    self.edges.get_mut(tail).nextchild = e_h;
                    self.edges.get_mut(e_h).prevchild = tail;
                }
                None => {
                    let head = if kind == 8 { &mut self.trash[bid] } else { &mut self.sustained[bid] };
                    let old = *head;
                    *head = e_h;
                    self.edges.get_mut(e_h).nextchild = old;
                    if old != NIL {
                        self.edges.get_mut(old).prevchild = e_h;
                    }
                }
            }
            st.last_bucket.insert((kind, bid), e_h);
            self.nodes.get_mut(child).parents = e_h;
            return Ok(());
        }

        let parent = self
            .node_find(parent_inode)
            .ok_or_else(|| anyhow!("loading edge: parent {} not found", parent_inode))?;
        let name_ref = self.names.alloc(name);
        let e_h = self.edges.alloc(FsEdge {
            parent,
            child,
            edgeid,
            hashval: edge_hash(parent_inode, name),
            name: name_ref,
            nleng: name.len() as u16,
            ..Default::default()
        });
        // children of one directory arrive adjacent: splice at the cached
        // tail, falling back to a head insert on a parent switch
        if st.valid && st.last_parent == parent {
            let tail = st.last_edge;
            self.edges.get_mut(tail).nextchild = e_h;
            self.edges.get_mut(e_h).prevchild = tail;
        } else {
            let head = self.nodes.get(parent).dir().children;
            self.edges.get_mut(e_h).nextchild = head;
            if head != NIL {
                self.edges.get_mut(head).prevchild = e_h;
            }
            self.nodes.get_mut(parent).dir_mut().children = e_h;
        }
        st.valid = true;
        st.last_parent = parent;
        st.last_edge = e_h;
        let first_parent = self.nodes.get(child).parents;
        self.edges.get_mut(e_h).nextparent = first_parent;
        if first_parent != NIL {
            self.edges.get_mut(first_parent).prevparent = e_h;
        }
        self.nodes.get_mut(child).parents = e_h;
        self.hashelements += 1;
        self.edge_hash_add(e_h);
        self.nodes.get_mut(parent).dir_mut().elements += 1;
        if self.nodes.get(child).ntype == NodeType::Directory {
            self.nodes.get_mut(parent).dir_mut().nlink += 1;
        } else {
            self.nodes.get_mut(child).nlink_adjust(true);
        }
        let sr = self.get_stats(child, 0);
        self.add_stats(parent, &sr);
        Ok(())
    }

    fn load_edges(&mut self, data: &[u8], _ignore: bool) -> Result<()> {
        let mut u = Unpack::new(data);
        let mut st = EdgeLoadState::default();
        loop {
            let parent_inode = u.get32()?;
            let child_inode = u.get32()?;
            let edgeid = u.get64()?;
            let nleng = u.get16()?;
            if parent_inode == 0 && child_inode == 0 {
                break;
            }
            if nleng == 0 {
                bail!("loading edge: {}->{} error: empty name", parent_inode, child_inode);
            }
            let name = u.bytes(nleng as usize)?.to_vec();
            self.load_edge(parent_inode, child_inode, edgeid, &name, &mut st)?;
        }
        Ok(())
    }

    fn load_free(&mut self, data: &[u8]) -> Result<()> {
        let mut u = Unpack::new(data);
        let n = u.get32()?;
        for _ in 0..n {
            let inode = u.get32()?;
            let ftime = u.get32()?;
            self.idalloc.mark_used(inode);
            self.idalloc.load_free(inode, ftime);
        }
        Ok(())
    }

    fn load_quota(&mut self, data: &[u8], ignore: bool) -> Result<()> {
        let mut u = Unpack::new(data);
        let n = u.get32()?;
        for _ in 0..n {
            let inode = u.get32()?;
            let qn = QuotaNode {
                exceeded: u.get8()? != 0,
                flags: u.get8()?,
                stimestamp: u.get32()?,
                sinodes: u.get32()?,
                hinodes: u.get32()?,
                slength: u.get64()?,
                hlength: u.get64()?,
                ssize: u.get64()?,
                hsize: u.get64()?,
                srealsize: u.get64()?,
                hrealsize: u.get64()?,
                graceperiod: u.get32()?,
            };
            match self.node_find(inode) {
                Some(h) if self.nodes.get(h).ntype == NodeType::Directory => {
                    self.quota_attach(h, qn);
                }
                _ if ignore => warn!("loading quota: inode {} is not a directory - ignoring", inode),
                _ => bail!("loading quota: inode {} is not a directory", inode),
            }
        }
        Ok(())
    }

    /// Post-load invariant check: every node is root, linked, or detached
    /// into trash/sustained.
    pub fn check_consistency(&mut self, ignore: bool) -> Result<()> {
        let handles = self.node_hash.handles(&self.nodes);
        for h in handles {
            let n = self.nodes.get(h);
            if h != self.root && n.parents == NIL {
                if ignore {
                    warn!("found lost inode: {}", n.inode);
                } else {
                    bail!("found lost inode: {} - fix the filesystem or use ignore mode", n.inode);
                }
            }
        }
        Ok(())
    }
}

impl Master {
    /// Loads one metadata file; `MFSM NEW` starts an empty filesystem.
    pub fn load_image_file(&mut self, path: &Path, ignore: bool) -> Result<()> {
        let mut f = File::open(path).with_context(|| format!("opening {:?}", path))?;
        let mut magic = [0u8; 8];
        f.read_exact(&mut magic).context("error loading metadata header")?;
        if &magic == NEW_MAGIC {
            self.fs.fs_new(0);
            self.metaversion = 1;
            self.metaid = 0;
            return Ok(());
        }
        if &magic != IMAGE_MAGIC {
            bail!("wrong metadata header");
        }
        let mut hdr = [0u8; 16];
        f.read_exact(&mut hdr).context("error loading metadata header")?;
        self.metaversion = u64::from_be_bytes(hdr[..8].try_into().unwrap());
        self.metaid = u64::from_be_bytes(hdr[8..].try_into().unwrap());
        loop {
            let mut shdr = [0u8; 16];
            f.read_exact(&mut shdr).context("error loading metadata section header")?;
            if &shdr == EOF_MARKER {
                break;
            }
            let tag = &shdr[..4];
            let mver = ((shdr[5] - b'0') << 4) + (shdr[7] - b'0');
            let sleng = u64::from_be_bytes(shdr[8..16].try_into().unwrap());
            let mut payload = vec![0u8; sleng as usize];
            f.read_exact(&mut payload)
                .with_context(|| format!("error reading section {:?}", String::from_utf8_lossy(tag)))?;
            let known = super::store::SECTION_ORDER.iter().any(|t| &t[..] == tag);
            if known && mver > SECTION_VERSION {
                bail!(
                    "section {:?} was stored by a newer version",
                    String::from_utf8_lossy(tag)
                );
            }
            match tag {
                b"NODE" => self.fs.load_nodes(&payload, ignore)?,
                b"EDGE" => self.fs.load_edges(&payload, ignore)?,
                b"FREE" => self.fs.load_free(&payload)?,
                b"QUOT" => self.fs.load_quota(&payload, ignore)?,
                b"CHNK" => self.fs.hooks.chunks.load(&payload)?,
                _ if known => {} // collaborator sections without local state
                _ => {
                    if ignore {
                        warn!(
                            "unknown section found (leng:{},name:{}) - all data from this section will be lost !!!",
                            sleng,
                            String::from_utf8_lossy(tag)
                        );
                    } else {
                        bail!(
                            "error: unknown section found (leng:{},name:{})",
                            sleng,
                            String::from_utf8_lossy(tag)
                        );
                    }
                }
            }
        }
        self.fs.check_consistency(ignore)
    }

    /// `auto_restore` startup: find the best image (matching cluster ids),
    /// load it, replay newer changelog lines, rename the source out of the
    /// way. Non-auto mode insists on an exact `metadata.mfs`.
    pub fn loadall(&mut self, dir: &Path, auto_restore: bool, ignore: bool) -> Result<()> {
        if !auto_restore {
            let mfs = dir.join("metadata.mfs");
            let (st, ver, id) = check_metadata_file(&mfs);
            match st {
                MetaCheck::NoFile => bail!("can't find metadata.mfs - try using option '-a'"),
                MetaCheck::IoError => bail!("error reading metadata.mfs - try using option '-a'"),
                MetaCheck::BadHeader => bail!("metadata.mfs has wrong header - try using option '-a'"),
                MetaCheck::BadEnding => bail!("metadata.mfs has wrong ending - try using option '-a'"),
                MetaCheck::Ok => {}
            }
            let (bst, bver, bid) = check_metadata_file(&dir.join("metadata.mfs.back"));
            if bst == MetaCheck::Ok
                && ((ver == 1 && id == 0) || (bver > ver && bid == id) || (bid != 0 && id != 0 && bid != id))
            {
                bail!("backup file is newer or inconsistent - please check it manually - try using option '-a'");
            }
            self.load_image_file(&mfs, ignore)?;
            std::fs::rename(&mfs, dir.join("metadata.mfs.back"))
                .context("can't rename metadata.mfs -> metadata.mfs.back")?;
            return Ok(());
        }

        let mut bestver = 0u64;
        let mut bestid = 0u64;
        let mut bestfname: Option<PathBuf> = None;
        for entry in std::fs::read_dir(dir).context("can't access data directory")? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("metadata") {
                continue;
            }
            let path = entry.path();
            let (st, ver, id) = check_metadata_file(&path);
            if st != MetaCheck::Ok {
                if st != MetaCheck::NoFile {
                    warn!("found invalid metadata file: {:?}", path);
                }
                continue;
            }
            info!("found valid metadata file: {:?} (version: {} ; id: {:X})", path, ver, id);
            if bestid != 0 && id != 0 && bestid != id {
                if ignore {
                    warn!("found metadata file with different id number - ignoring");
                } else {
                    bail!("found metadata file with different id number - cleanup your working directory or use ignore mode (might be dangerous without cleaning)");
                }
            }
            if ver > bestver {
                bestver = ver;
                bestfname = Some(path);
                if id != 0 {
                    bestid = id;
                }
            }
        }
        if bestid != 0 {
            // emergency locations only count once a cluster id is known
            for loc in Master::emergency_locations() {
                let (st, ver, id) = check_metadata_file(&loc);
                if st == MetaCheck::Ok && ver > bestver && id == bestid {
                    bestver = ver;
                    bestfname = Some(loc);
                }
            }
        }
        let bestfname = bestfname.ok_or_else(|| anyhow!("can't find valid metadata file"))?;
        info!("chosen most recent metadata file: {:?} (version: {})", bestfname, bestver);
        self.load_image_file(&bestfname, ignore)?;

        self.replay_changelogs(dir, ignore)?;

        let mfs = dir.join("metadata.mfs");
        if mfs.exists() {
            if std::fs::metadata(&mfs).map(|m| m.len()).unwrap_or(0) == 0 {
                let _ = std::fs::remove_file(&mfs);
            } else if !dir.join("metadata.mfs.back").exists() {
                std::fs::rename(&mfs, dir.join("metadata.mfs.back"))
                    .context("can't rename metadata.mfs -> metadata.mfs.back")?;
            }
        }
        let _ = std::fs::remove_file(dir.join("metadata.mfs.back.tmp"));
        Ok(())
    }

    /// Merges every changelog overlapping `(loaded_version, inf)` and applies
    /// the lines in strict version order.
    pub fn replay_changelogs(&mut self, dir: &Path, ignore: bool) -> Result<()> {
        let mut merged: BTreeMap<u64, String> = BTreeMap::new();
        for entry in std::fs::read_dir(dir).context("can't access data directory")? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !changelog::is_changelog_name(&name) {
                continue;
            }
            let path = entry.path();
            let first = changelog::find_first_version(&path);
            let last = changelog::find_last_version(&path);
            if last < self.metaversion || first == 0 {
                info!("skipping changelog file: {:?} (changes: {} - {})", path, first, last);
                continue;
            }
            info!("using changelog file: {:?} (changes: {} - {})", path, first, last);
            for (v, data) in changelog::read_lines(&path)? {
                if v >= self.metaversion {
                    merged.insert(v, data);
                }
            }
        }
        for (v, data) in merged {
            if v < self.metaversion {
                continue;
            }
            if v > self.metaversion {
                let hole = v - self.metaversion;
                if hole > MAXIDHOLE {
                    if ignore {
                        warn!(
                            "hole in change files (entries from {} to {} are missing) - ignoring",
                            self.metaversion, v
                        );
                        self.metaversion = v;
                    } else {
                        bail!(
                            "hole in change files (entries from {} to {} are missing) - add more files or use ignore mode",
                            self.metaversion,
                            v - 1
                        );
                    }
                } else {
                    self.metaversion = v;
                }
            }
            if let Err(e) = self.restore_line(&data) {
                if ignore {
                    warn!("error applying changelogs - ignoring (using best possible metadata version): {:#}", e);
                    return Ok(());
                }
                return Err(e.context(format!("applying changelog line {}: {}", v, data)));
            }
        }
        Ok(())
    }

    /// Applies one changelog record: `ts|OP(args):results`.
    pub fn restore_line(&mut self, data: &str) -> Result<()> {
        let (ts_s, rest) = data.split_once('|').ok_or_else(|| anyhow!("malformed record"))?;
        let ts: u32 = ts_s.parse().context("bad timestamp")?;
        let open = rest.find('(').ok_or_else(|| anyhow!("malformed record"))?;
        let close = rest.rfind(')').ok_or_else(|| anyhow!("malformed record"))?;
        let op = &rest[..open];
        let argstr = &rest[open + 1..close];
        let result = rest[close + 1..].strip_prefix(':');
        let args: Vec<&str> = if argstr.is_empty() { Vec::new() } else { argstr.split(',').collect() };
        let res: Vec<&str> = result.map(|r| r.split(',').collect()).unwrap_or_default();

        fn n<T: std::str::FromStr>(args: &[&str], i: usize) -> Result<T> {
            args.get(i)
                .ok_or_else(|| anyhow!("missing argument {}", i))?
                .parse::<T>()
                .map_err(|_| anyhow!("bad argument {}", i))
        }

        let status: Result<(), MfsError> = match op {
            "CREATE" => self.fs_mr_create(
                ts,
                n(&args, 0)?,
                &unescape_name(args.get(1).copied().unwrap_or("")),
                n(&args, 2)?,
                n(&args, 3)?,
                n(&args, 4)?,
                n(&args, 5)?,
                n(&args, 6)?,
                n(&args, 7)?,
                n(&res, 0)?,
            ),
            "SYMLINK" => self
                .fs_mr_symlink(
                    ts,
                    n(&args, 0)?,
                    &unescape_name(args.get(1).copied().unwrap_or("")),
                    &unescape_name(args.get(2).copied().unwrap_or("")),
                    n(&args, 3)?,
                    n(&args, 4)?,
                    n(&res, 0)?,
                ),
            "UNLINK" => self.fs_mr_unlink(
                ts,
                n(&args, 0)?,
                &unescape_name(args.get(1).copied().unwrap_or("")),
                n(&res, 0)?,
            ),
            "MOVE" => self.fs_mr_move(
                ts,
                n(&args, 0)?,
                &unescape_name(args.get(1).copied().unwrap_or("")),
                n(&args, 2)?,
                &unescape_name(args.get(3).copied().unwrap_or("")),
                n(&res, 0)?,
            ),
            "LINK" => self.fs_mr_link(
                ts,
                n(&args, 0)?,
                n(&args, 1)?,
                &unescape_name(args.get(2).copied().unwrap_or("")),
            ),
            "SNAPSHOT" => self.fs_mr_snapshot(
                ts,
                n(&args, 0)?,
                n(&args, 1)?,
                &unescape_name(args.get(2).copied().unwrap_or("")),
                n(&args, 3)?,
                n(&args, 4)?,
                n(&args, 5)?,
                n(&args, 6)?,
                (n(&res, 0)?, n(&res, 1)?, n(&res, 2)?, n(&res, 3)?, n(&res, 4)?, n(&res, 5)?),
            ),
            "APPEND" => self.fs_mr_append(ts, n(&args, 0)?, n(&args, 1)?, n(&args, 2)?, n(&args, 3)?),
            "UNDEL" => self.fs_mr_undel(ts, n(&args, 0)?),
            "PURGE" => self.fs_mr_purge(ts, n(&args, 0)?),
            "SETPATH" => self.fs_mr_setpath(
                n(&args, 0)?,
                &unescape_name(args.get(1).copied().unwrap_or("")),
            ),
            "EMPTYTRASH" => {
                self.fs_mr_emptytrash(ts, n(&args, 0)?, n(&res, 0)?, n(&res, 1)?, n(&res, 2)?)
            }
            "EMPTYSUSTAINED" => self.fs_mr_emptysustained(ts, n(&args, 0)?, n(&res, 0)?, n(&res, 1)?),
            "FREEINODES" => self.fs_mr_freeinodes(ts, n(&res, 0)?, n(&res, 1)?, n(&res, 2)?),
            "ATTR" => self.fs_mr_attr(
                ts,
                n(&args, 0)?,
                n(&args, 1)?,
                n(&args, 2)?,
                n(&args, 3)?,
                n(&args, 4)?,
                n(&args, 5)?,
                n(&args, 6)?,
                n(&args, 7)?,
            ),
            "AMTIME" => self.fs_mr_amtime(n(&args, 0)?, n(&args, 1)?, n(&args, 2)?, n(&args, 3)?),
            "ACCESS" => self.fs_mr_access(ts, n(&args, 0)?),
            "WRITE" => self.fs_mr_write(
                ts,
                n(&args, 0)?,
                n(&args, 1)?,
                n(&args, 2)?,
                n(&args, 3)?,
                n(&res, 0)?,
            ),
            "LENGTH" => self.fs_mr_length(ts, n(&args, 0)?, n(&args, 1)?, n(&args, 2)?),
            "SETTRASHTIME" => self.fs_mr_settrashtime(
                ts,
                n(&args, 0)?,
                n(&args, 1)?,
                n(&args, 2)?,
                n(&args, 3)?,
                (n(&res, 0)?, n(&res, 1)?, n(&res, 2)?),
            ),
            "SETEATTR" => self.fs_mr_seteattr(
                ts,
                n(&args, 0)?,
                n(&args, 1)?,
                n(&args, 2)?,
                n(&args, 3)?,
                (n(&res, 0)?, n(&res, 1)?, n(&res, 2)?),
            ),
            "SETSCLASS" => self.fs_mr_setsclass(
                ts,
                n(&args, 0)?,
                n(&args, 1)?,
                n(&args, 2)?,
                n(&args, 3)?,
                n(&args, 4)?,
                (n(&res, 0)?, n(&res, 1)?, n(&res, 2)?),
            ),
            "QUOTA" => self.fs_mr_quota(
                ts,
                n(&args, 0)?,
                QuotaNode {
                    exceeded: n::<u8>(&args, 1)? != 0,
                    flags: n(&args, 2)?,
                    stimestamp: n(&args, 3)?,
                    sinodes: n(&args, 4)?,
                    hinodes: n(&args, 5)?,
                    slength: n(&args, 6)?,
                    hlength: n(&args, 7)?,
                    ssize: n(&args, 8)?,
                    hsize: n(&args, 9)?,
                    srealsize: n(&args, 10)?,
                    hrealsize: n(&args, 11)?,
                    graceperiod: n(&args, 12)?,
                },
            ),
            "RENUMERATEEDGES" => self.fs_mr_renumerate_edges(n(&res, 0)?),
            _ => return Err(anyhow!("unknown operation: {}", op)),
        };
        status.map_err(|e| anyhow!("{}: status {:?}", op, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta_lib::test_support::new_master;

    fn scratch(name: &str) -> PathBuf {
        let d = std::env::temp_dir().join(format!("mfsmeta-restore-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&d);
        std::fs::create_dir_all(&d).unwrap();
        d
    }

    #[test]
    fn check_metadata_file_statuses() -> Result<()> {
        let dir = scratch("check");
        let missing = dir.join("metadata.mfs");
        assert_eq!(check_metadata_file(&missing).0, MetaCheck::NoFile);
        std::fs::write(&missing, b"garbage!")?;
        assert_eq!(check_metadata_file(&missing).0, MetaCheck::BadHeader);
        // a real image verifies, a truncated one does not
        let mut m = new_master();
        m.metaversion = 7;
        m.metaid = 99;
        m.store_image_file(&missing, None)?;
        let (st, ver, id) = check_metadata_file(&missing);
        assert_eq!(st, MetaCheck::Ok);
        assert_eq!(ver, 7);
        assert_eq!(id, 99);
        let img = std::fs::read(&missing)?;
        std::fs::write(&missing, &img[..img.len() - 4])?;
        assert_eq!(check_metadata_file(&missing).0, MetaCheck::BadEnding);
        Ok(())
    }
}
