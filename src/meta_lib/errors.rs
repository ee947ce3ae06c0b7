//! Flat numeric status space shared with clients and the changelog replayer.
//! The values are wire ABI and must not be renumbered.

use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const STATUS_OK: u8 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MfsError {
    EPerm = 1,
    ENotDir = 2,
    ENoEnt = 3,
    EAcces = 4,
    EExist = 5,
    EInval = 6,
    ENotEmpty = 7,
    ChunkLost = 8,
    OutOfMemory = 9,
    IndexTooBig = 10,
    Locked = 11,
    NoChunkServers = 12,
    NoChunk = 13,
    ChunkBusy = 14,
    Register = 15,
    NotDone = 16,
    GroupNotRegistered = 17,
    NotStarted = 18,
    WrongVersion = 19,
    ChunkExist = 20,
    NoSpace = 21,
    Io = 22,
    BNumTooBig = 23,
    WrongSize = 24,
    WrongOffset = 25,
    CantConnect = 26,
    WrongChunkId = 27,
    Disconnected = 28,
    Crc = 29,
    Delayed = 30,
    CantCreatePath = 31,
    Mismatch = 32,
    ERofs = 33,
    Quota = 34,
    BadSessionId = 35,
    NoPassword = 36,
    BadPassword = 37,
    ENoAttr = 38,
    ENotSup = 39,
    ERange = 40,
}

impl std::fmt::Display for MfsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for MfsError {}

pub type FsResult<T> = Result<T, MfsError>;

/// Wire status byte of a result.
pub fn status_of<T>(r: &FsResult<T>) -> u8 {
    match r {
        Ok(_) => STATUS_OK,
        Err(e) => (*e).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_values_are_stable() {
        assert_eq!(u8::from(MfsError::ENoEnt), 3);
        assert_eq!(u8::from(MfsError::IndexTooBig), 10);
        assert_eq!(u8::from(MfsError::CantCreatePath), 31);
        assert_eq!(u8::from(MfsError::Mismatch), 32);
        assert_eq!(u8::from(MfsError::Quota), 34);
        assert_eq!(MfsError::try_from(34u8).unwrap(), MfsError::Quota);
    }

    #[test]
    fn status_byte() {
        assert_eq!(status_of(&Ok(5u32)), STATUS_OK);
        assert_eq!(status_of::<u32>(&Err(MfsError::EExist)), 5);
    }
}
