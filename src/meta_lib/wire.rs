//! Wire codec for the replication messages exchanged between masters. Field
//! order and widths are ABI; integers travel big-endian.

use anyhow::{anyhow, bail, Result};
use zerocopy::byteorder::{BigEndian, I32, I64, U32};
use zerocopy::{AsBytes, FromBytes};

use raft::{
    AppendEntries, AppendEntriesResponse, Entry, InstallSnapshot, InstallSnapshotResponse,
    RequestVote, RequestVoteResponse,
};

type Be64 = I64<BigEndian>;
type Be32 = I32<BigEndian>;
type Ube32 = U32<BigEndian>;

pub const MSG_REQUESTVOTE: u8 = 1;
pub const MSG_REQUESTVOTE_RESPONSE: u8 = 2;
pub const MSG_APPENDENTRIES: u8 = 3;
pub const MSG_APPENDENTRIES_RESPONSE: u8 = 4;
pub const MSG_INSTALLSNAPSHOT: u8 = 5;
pub const MSG_INSTALLSNAPSHOT_RESPONSE: u8 = 6;

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    RequestVote(RequestVote),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntries),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshot),
    InstallSnapshotResponse(InstallSnapshotResponse),
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new(msgtype: u8) -> Self {
        Writer { buf: vec![msgtype] }
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(Be64::new(v).as_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(Be32::new(v).as_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(Ube32::new(v).as_bytes());
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }
}

struct Reader<'a> {
    d: &'a [u8],
    p: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.d.len() - self.p < n {
            bail!("short message");
        }
        let s = &self.d[self.p..self.p + n];
        self.p += n;
        Ok(s)
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(Be64::read_from(self.take(8)?).ok_or_else(|| anyhow!("short message"))?.get())
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(Be32::read_from(self.take(4)?).ok_or_else(|| anyhow!("short message"))?.get())
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(Ube32::read_from(self.take(4)?).ok_or_else(|| anyhow!("short message"))?.get())
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
}

pub fn encode(msg: &Message) -> Vec<u8> {
    match msg {
        Message::RequestVote(m) => {
            let mut w = Writer::new(MSG_REQUESTVOTE);
            w.i64(m.term);
            w.i32(m.candidate_id);
            w.i64(m.last_log_idx);
            w.i64(m.last_log_term);
            w.u8(m.prevote as u8);
            w.buf
        }
        Message::RequestVoteResponse(m) => {
            let mut w = Writer::new(MSG_REQUESTVOTE_RESPONSE);
            w.i64(m.term);
            w.i32(m.vote_granted);
            w.u8(m.prevote as u8);
            w.buf
        }
        Message::AppendEntries(m) => {
            let mut w = Writer::new(MSG_APPENDENTRIES);
            w.i64(m.term);
            w.i64(m.prev_log_idx);
            w.i64(m.prev_log_term);
            w.i64(m.leader_commit);
            w.u32(m.entries.len() as u32);
            for e in &m.entries {
                w.i64(e.term);
                w.u32(e.id);
                w.i32(e.etype);
                w.u32(e.data.len() as u32);
                w.bytes(&e.data);
            }
            w.buf
        }
        Message::AppendEntriesResponse(m) => {
            let mut w = Writer::new(MSG_APPENDENTRIES_RESPONSE);
            w.i64(m.term);
            w.u8(m.success as u8);
            w.i64(m.current_idx);
            w.i64(m.first_idx);
            w.buf
        }
        Message::InstallSnapshot(m) => {
            let mut w = Writer::new(MSG_INSTALLSNAPSHOT);
            w.i64(m.term);
            w.i64(m.last_idx);
            w.i64(m.last_term);
            w.buf
        }
        Message::InstallSnapshotResponse(m) => {
            let mut w = Writer::new(MSG_INSTALLSNAPSHOT_RESPONSE);
            w.i64(m.term);
            w.i64(m.last_idx);
            w.u8(m.complete as u8);
            w.buf
        }
    }
}

pub fn decode(data: &[u8]) -> Result<Message> {
    if data.is_empty() {
        bail!("empty message");
    }
    let mut r = Reader { d: data, p: 1 };
    let msg = match data[0] {
        MSG_REQUESTVOTE => Message::RequestVote(RequestVote {
            term: r.i64()?,
            candidate_id: r.i32()?,
            last_log_idx: r.i64()?,
            last_log_term: r.i64()?,
            prevote: r.u8()? != 0,
        }),
        MSG_REQUESTVOTE_RESPONSE => Message::RequestVoteResponse(RequestVoteResponse {
            term: r.i64()?,
            vote_granted: r.i32()?,
            prevote: r.u8()? != 0,
        }),
        MSG_APPENDENTRIES => {
            let term = r.i64()?;
            let prev_log_idx = r.i64()?;
            let prev_log_term = r.i64()?;
            let leader_commit = r.i64()?;
            let n = r.u32()?;
            let mut entries = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let term = r.i64()?;
                let id = r.u32()?;
                let etype = r.i32()?;
                let dlen = r.u32()?;
                let data = r.take(dlen as usize)?.to_vec();
                entries.push(Entry { term, id, etype, data });
            }
            Message::AppendEntries(AppendEntries {
                term,
                prev_log_idx,
                prev_log_term,
                leader_commit,
                entries,
            })
        }
        MSG_APPENDENTRIES_RESPONSE => Message::AppendEntriesResponse(AppendEntriesResponse {
            term: r.i64()?,
            success: r.u8()? != 0,
            current_idx: r.i64()?,
            first_idx: r.i64()?,
        }),
        MSG_INSTALLSNAPSHOT => Message::InstallSnapshot(InstallSnapshot {
            term: r.i64()?,
            last_idx: r.i64()?,
            last_term: r.i64()?,
        }),
        MSG_INSTALLSNAPSHOT_RESPONSE => Message::InstallSnapshotResponse(InstallSnapshotResponse {
            term: r.i64()?,
            last_idx: r.i64()?,
            complete: r.u8()? != 0,
        }),
        t => bail!("unknown message type {}", t),
    };
    if r.p != data.len() {
        bail!("trailing bytes in message");
    }
    Ok(msg)
}
