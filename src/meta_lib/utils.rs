//! Byte packing, CRC-32 and small process-wide helpers.

use std::time::Instant;

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;

pub fn init_logs() {
    let _ = env_logger::builder().format_timestamp_millis().try_init();
}

/* big-endian packing, the byte order of the metadata image */

pub fn put8(b: &mut Vec<u8>, v: u8) {
    b.push(v);
}

pub fn put16(b: &mut Vec<u8>, v: u16) {
    b.extend_from_slice(&v.to_be_bytes());
}

pub fn put32(b: &mut Vec<u8>, v: u32) {
    b.extend_from_slice(&v.to_be_bytes());
}

pub fn put64(b: &mut Vec<u8>, v: u64) {
    b.extend_from_slice(&v.to_be_bytes());
}

/// Cursor over a loaded section payload.
pub struct Unpack<'a> {
    d: &'a [u8],
    p: usize,
}

impl<'a> Unpack<'a> {
    pub fn new(d: &'a [u8]) -> Self {
        Unpack { d, p: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.d.len() - self.p
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(anyhow!("section truncated: need {} bytes, have {}", n, self.remaining()));
        }
        let s = &self.d[self.p..self.p + n];
        self.p += n;
        Ok(s)
    }

    pub fn get8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn get16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    pub fn get32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    pub fn get64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.bytes(8)?.try_into().unwrap()))
    }
}

lazy_static! {
    static ref CRC_TAB: [u32; 256] = {
        let mut tab = [0u32; 256];
        for (i, t) in tab.iter_mut().enumerate() {
            let mut c = i as u32;
            for _ in 0..8 {
                c = if c & 1 != 0 { 0xEDB88320 ^ (c >> 1) } else { c >> 1 };
            }
            *t = c;
        }
        tab
    };
}

pub fn crc32(crc: u32, data: &[u8]) -> u32 {
    let mut c = !crc;
    for &b in data {
        c = CRC_TAB[((c ^ b as u32) & 0xFF) as usize] ^ (c >> 8);
    }
    !c
}

/// Jenkins-style 32-bit integer mixer used by the inode hash table.
pub fn hash32(mut h: u32) -> u32 {
    h = h.wrapping_add(0x7ed55d16).wrapping_add(h << 12);
    h = (h ^ 0xc761c23c) ^ (h >> 19);
    h = h.wrapping_add(0x165667b1).wrapping_add(h << 5);
    h = h.wrapping_add(0xd3a2646c) ^ (h << 9);
    h = h.wrapping_add(0xfd7046c5).wrapping_add(h << 3);
    h = (h ^ 0xb55a4f09) ^ (h >> 16);
    h
}

/// Cooperative yield counter for walks over millions of nodes. The hook runs
/// after ~10000 touched nodes when at least 100ms have passed since the last
/// yield, giving the reactor a chance to drain its queues.
pub struct KeepAlive {
    last: Instant,
    cnt: u32,
    pub yields: u64,
}

impl KeepAlive {
    pub fn begin() -> Self {
        KeepAlive { last: Instant::now(), cnt: 0, yields: 0 }
    }

    pub fn check(&mut self, hook: &mut dyn FnMut()) {
        self.cnt += 1;
        if self.cnt >= 10000 {
            if self.last.elapsed().as_micros() >= 100000 {
                hook();
                self.yields += 1;
                self.last = Instant::now();
            }
            self.cnt = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_roundtrip() -> Result<()> {
        let mut b = vec![];
        put8(&mut b, 0xAB);
        put16(&mut b, 0x1234);
        put32(&mut b, 0xDEADBEEF);
        put64(&mut b, 0x0102030405060708);
        let mut u = Unpack::new(&b);
        assert_eq!(u.get8()?, 0xAB);
        assert_eq!(u.get16()?, 0x1234);
        assert_eq!(u.get32()?, 0xDEADBEEF);
        assert_eq!(u.get64()?, 0x0102030405060708);
        assert_eq!(u.remaining(), 0);
        assert!(u.get8().is_err());
        Ok(())
    }

    #[test]
    fn crc32_known_value() {
        // standard zlib vector
        assert_eq!(crc32(0, b"123456789"), 0xCBF43926);
        // streaming in two parts matches one shot
        let a = crc32(0, b"1234");
        assert_eq!(crc32(a, b"56789"), 0xCBF43926);
    }

    #[test]
    fn keepalive_yields_after_count_and_elapsed() {
        let mut ka = KeepAlive::begin();
        let fired = std::cell::Cell::new(0u32);
        let mut hook = || fired.set(fired.get() + 1);
        // plenty of touches, but not enough wall time
        for _ in 0..20000 {
            ka.check(&mut hook);
        }
        assert_eq!(fired.get(), 0);
        std::thread::sleep(std::time::Duration::from_millis(110));
        for _ in 0..9999 {
            ka.check(&mut hook);
        }
        // counter resets at 10000: still below it after the sleep
        assert_eq!(fired.get(), 0);
        ka.check(&mut hook);
        assert_eq!(fired.get(), 1);
        assert_eq!(ka.yields, 1);
    }

    #[test]
    fn hash32_spreads_consecutive_ints() {
        let a = hash32(1);
        let b = hash32(2);
        assert_ne!(a, b);
        assert_ne!(a & 0xFFFF, b & 0xFFFF);
    }
}
