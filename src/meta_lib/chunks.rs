//! Per-file chunk-id arrays and their coupling to the external chunk store.

use log::error;

use super::buckets::NIL;
use super::errors::{FsResult, MfsError};
use super::fs::FsState;
use super::node::*;

impl FsState {
    fn log_missing_chunk(chunkid: u64, inode: u32, indx: u32) {
        error!(
            "structure error - chunk {:016X} not found (inode: {} ; index: {})",
            chunkid, inode, indx
        );
    }

    /// Grows the chunk table so `indx` is addressable, zero-filling new
    /// slots.
    pub fn chunktab_ensure(&mut self, node_h: u32, indx: u32) {
        let (tab, chunks) = {
            let f = self.nodes.get(node_h).file();
            (f.chunktab, f.chunks)
        };
        if indx < chunks {
            return;
        }
        let newchunks = indx + 1;
        let newtab = if tab == NIL {
            self.chunktabs.alloc(newchunks)
        } else {
            self.chunktabs.realloc(tab, chunks, newchunks)
        };
        let f = self.nodes.get_mut(node_h).file_mut();
        f.chunktab = newtab;
        f.chunks = newchunks;
    }

    pub fn chunk_at(&self, node_h: u32, indx: u32) -> u64 {
        let f = self.nodes.get(node_h).file();
        if indx < f.chunks {
            self.chunktabs.get(f.chunktab, f.chunks)[indx as usize]
        } else {
            0
        }
    }

    /// Truncates or extends a file, releasing chunk references beyond the
    /// new end and propagating stats and trash/sustained space.
    pub fn setlength(&mut self, node_h: u32, length: u64) {
        let psr = self.get_stats(node_h, 0);
        let (ntype, oldlength, sclassid) = {
            let n = self.nodes.get(node_h);
            (n.ntype, n.file().length, n.sclassid)
        };
        match ntype {
            NodeType::Trash => {
                self.trashspace -= oldlength;
                self.trashspace += length;
            }
            NodeType::Sustained => {
                self.sustainedspace -= oldlength;
                self.sustainedspace += length;
            }
            _ => {}
        }
        let chunks = if length > 0 { (((length - 1) >> CHUNK_BITS) + 1) as u32 } else { 0 };
        let (tab, oldchunks, inode) = {
            let n = self.nodes.get_mut(node_h);
            n.file_mut().length = length;
            let f = n.file();
            (f.chunktab, f.chunks, n.inode)
        };
        for i in chunks..oldchunks {
            let cid = self.chunktabs.get(tab, oldchunks)[i as usize];
            if cid > 0 {
                if !self.hooks.chunks.delete_file(cid, sclassid) {
                    Self::log_missing_chunk(cid, inode, i);
                }
                self.chunktabs.get_mut(tab, oldchunks)[i as usize] = 0;
            }
        }
        if chunks > 0 {
            if chunks < oldchunks && tab != NIL {
                let newtab = self.chunktabs.realloc(tab, oldchunks, chunks);
                let f = self.nodes.get_mut(node_h).file_mut();
                f.chunktab = newtab;
                f.chunks = chunks;
            }
        } else if oldchunks > 0 && tab != NIL {
            self.chunktabs.free(tab, oldchunks);
            let f = self.nodes.get_mut(node_h).file_mut();
            f.chunktab = NIL;
            f.chunks = 0;
        }
        let nsr = self.get_stats(node_h, 1);
        for p in self.parents_of(node_h) {
            self.add_sub_stats(p, &nsr, &psr);
        }
        self.nodes.get_mut(node_h).eattr &= !EATTR_SNAPSHOT;
    }

    /// Concatenates the closed chunk slice `[from,to]` of `src` to the tail
    /// of `dst`, sharing chunk ids (each shared chunk gains a reference).
    pub fn append_slice(
        &mut self,
        ts: u32,
        dst_h: u32,
        src_h: u32,
        mut slice_from: u32,
        mut slice_to: u32,
    ) -> FsResult<()> {
        let (srclength, srcchunks_total, src_tab) = {
            let f = self.nodes.get(src_h).file();
            (f.length, f.chunks, f.chunktab)
        };
        let lastsrcchunk =
            if srclength > 0 { ((srclength - 1) >> CHUNK_BITS) as u32 } else { 0 };
        if slice_from == 0xFFFFFFFF && slice_to == 0 {
            // legacy whole-file append
            slice_from = 0;
            slice_to = lastsrcchunk;
        }
        if slice_to > lastsrcchunk || slice_from > lastsrcchunk || slice_from > slice_to {
            return Err(MfsError::EInval);
        }
        let srcchunks = slice_to - slice_from + 1;
        let (dstlength, dst_oldchunks) = {
            let f = self.nodes.get(dst_h).file();
            (f.length, f.chunks)
        };
        let dstchunks = if dstlength > 0 { (((dstlength - 1) >> CHUNK_BITS) + 1) as u32 } else { 0 };
        let newchunks = match srcchunks.checked_add(dstchunks) {
            Some(n) if n - 1 <= MAX_INDEX => n,
            _ => return Err(MfsError::IndexTooBig),
        };

        let psr = self.get_stats(dst_h, 0);
        if newchunks > dst_oldchunks {
            self.chunktab_ensure(dst_h, newchunks - 1);
        }
        let (dst_tab, dst_nchunks, dst_inode, dst_sclass, dst_ntype) = {
            let n = self.nodes.get(dst_h);
            let f = n.file();
            (f.chunktab, f.chunks, n.inode, n.sclassid, n.ntype)
        };
        // slots past the logical end should be holes already; clear them
        for i in dstchunks..dst_nchunks {
            let cid = self.chunktabs.get(dst_tab, dst_nchunks)[i as usize];
            if cid > 0 {
                if !self.hooks.chunks.delete_file(cid, dst_sclass) {
                    Self::log_missing_chunk(cid, dst_inode, i);
                }
            }
            self.chunktabs.get_mut(dst_tab, dst_nchunks)[i as usize] = 0;
        }
        let src_inode = self.nodes.get(src_h).inode;
        for i in 0..srcchunks {
            let cid = self.chunktabs.get(src_tab, srcchunks_total)[(slice_from + i) as usize];
            self.chunktabs.get_mut(dst_tab, dst_nchunks)[(i + dstchunks) as usize] = cid;
            if cid > 0 && !self.hooks.chunks.add_file(cid, dst_sclass) {
                Self::log_missing_chunk(cid, src_inode, i + slice_from);
            }
        }
        let length = if slice_to >= lastsrcchunk {
            ((dstchunks as u64) << CHUNK_BITS) + srclength - ((slice_from as u64) << CHUNK_BITS)
        } else {
            (newchunks as u64) << CHUNK_BITS
        };
        match dst_ntype {
            NodeType::Trash => {
                self.trashspace -= dstlength;
                self.trashspace += length;
            }
            NodeType::Sustained => {
                self.sustainedspace -= dstlength;
                self.sustainedspace += length;
            }
            _ => {}
        }
        self.nodes.get_mut(dst_h).file_mut().length = length;
        let nsr = self.get_stats(dst_h, 1);
        for p in self.parents_of(dst_h) {
            self.add_sub_stats(p, &nsr, &psr);
        }
        let d = self.nodes.get_mut(dst_h);
        d.mtime = ts;
        d.atime = ts;
        let s = self.nodes.get_mut(src_h);
        if s.atime != ts {
            s.atime = ts;
        }
        Ok(())
    }

    /// Moves all chunk references of a file to another storage class.
    pub fn change_file_sclass(&mut self, node_h: u32, sclassid: u8) {
        let psr = self.get_stats(node_h, 0);
        let (tab, chunks, oldsclass, ntype) = {
            let n = self.nodes.get(node_h);
            let f = n.file();
            (f.chunktab, f.chunks, n.sclassid, n.ntype)
        };
        let ids: Vec<u64> = self.chunktabs.get(tab, chunks).to_vec();
        for cid in ids {
            if cid > 0 {
                self.hooks.chunks.change_file(cid, oldsclass, sclassid);
            }
        }
        self.hooks.sclass.decref(oldsclass, ntype);
        self.nodes.get_mut(node_h).sclassid = sclassid;
        self.hooks.sclass.incref(sclassid, ntype);
        let nsr = self.get_stats(node_h, 1);
        for p in self.parents_of(node_h) {
            self.add_sub_stats(p, &nsr, &psr);
        }
    }

    /// Prepares chunk `indx` for writing: allocates the slot (and a fresh
    /// chunk when it was a hole). Returns `(prevchunkid, chunkid, opflag)`.
    pub fn writechunk(&mut self, node_h: u32, indx: u32, ts: u32) -> FsResult<(u64, u64, u8)> {
        if indx > MAX_INDEX {
            return Err(MfsError::IndexTooBig);
        }
        let psr = self.get_stats(node_h, 0);
        self.chunktab_ensure(node_h, indx);
        let prev = self.chunk_at(node_h, indx);
        let sclassid = self.nodes.get(node_h).sclassid;
        let (chunkid, opflag) = if prev == 0 {
            (self.hooks.chunks.create(sclassid), 1)
        } else {
            (prev, 0)
        };
        let (tab, chunks) = {
            let f = self.nodes.get(node_h).file();
            (f.chunktab, f.chunks)
        };
        self.chunktabs.get_mut(tab, chunks)[indx as usize] = chunkid;
        let nsr = self.get_stats(node_h, 1);
        for p in self.parents_of(node_h) {
            self.add_sub_stats(p, &nsr, &psr);
        }
        let n = self.nodes.get_mut(node_h);
        n.mtime = ts;
        n.ctime = ts;
        n.eattr &= !EATTR_SNAPSHOT;
        Ok((prev, chunkid, opflag))
    }

    /// Settles the file length after the client finished writing a chunk.
    /// Returns true when the length changed.
    pub fn writeend(&mut self, node_h: u32, length: u64, chunkid: u64, ts: u32) -> FsResult<bool> {
        let mut changed = false;
        if length > 0 {
            let f_len = self.nodes.get(node_h).file().length;
            if length != f_len {
                self.setlength(node_h, length);
                changed = true;
            }
        }
        let _ = chunkid;
        let n = self.nodes.get_mut(node_h);
        n.mtime = ts;
        n.ctime = ts;
        Ok(changed)
    }

    /// Chunk id and file length for a read; atime policy applies.
    pub fn readchunk(&mut self, node_h: u32, indx: u32, ts: u32) -> FsResult<(u64, u64)> {
        if indx > MAX_INDEX {
            return Err(MfsError::IndexTooBig);
        }
        let chunkid = self.chunk_at(node_h, indx);
        let length = self.nodes.get(node_h).file().length;
        if self.atime_update_file(node_h, ts) {
            self.nodes.get_mut(node_h).atime = ts;
        }
        Ok((chunkid, length))
    }

    /// Per-file chunk health histogram: slots 0..10 by valid copy count
    /// (saturated at 10), slot 11 counts holes.
    pub fn checkfile(&self, node_h: u32) -> [u32; 12] {
        let mut counts = [0u32; 12];
        let f = self.nodes.get(node_h).file();
        for &cid in self.chunktabs.get(f.chunktab, f.chunks) {
            if cid > 0 {
                let c = self.hooks.chunks.valid_copies(cid).min(10);
                counts[c as usize] += 1;
            } else {
                counts[11] += 1;
            }
        }
        counts
    }
}
