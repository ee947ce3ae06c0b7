//! Tunables of the metadata engine and of the dump scheduler, with the
//! validation the option file promises.

use anyhow::{anyhow, Result};
use log::warn;
use num_enum::TryFromPrimitive;

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum AtimeMode {
    Always = 0,
    RelativeOnly = 1,
    FilesOnly = 2,
    FilesAndRelativeOnly = 3,
    Never = 4,
}

impl Default for AtimeMode {
    fn default() -> Self {
        AtimeMode::Always
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FsConfig {
    pub atime_mode: AtimeMode,
    pub max_allowed_hard_links: u16, /* [8..65000] */
    pub quota_default_grace_period: u32,
}

impl Default for FsConfig {
    fn default() -> Self {
        FsConfig {
            atime_mode: AtimeMode::Always,
            max_allowed_hard_links: 32767,
            quota_default_grace_period: 7 * 86400,
        }
    }
}

impl FsConfig {
    pub fn sanitize(mut self) -> Self {
        if self.max_allowed_hard_links < 8 || self.max_allowed_hard_links > 65000 {
            warn!(
                "MAX_ALLOWED_HARD_LINKS {} out of range [8..65000] - using defaults",
                self.max_allowed_hard_links
            );
            self.max_allowed_hard_links = 32767;
        }
        self
    }

    pub fn set_atime_mode(&mut self, raw: u8) {
        match AtimeMode::try_from(raw) {
            Ok(m) => self.atime_mode = m,
            Err(_) => {
                warn!("unrecognized value for ATIME_MODE - using defaults");
                self.atime_mode = AtimeMode::Always;
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct MetaConfig {
    /// minutes between periodic dumps
    pub save_freq: u32,
    /// minutes after midnight the dump schedule is aligned to
    pub save_offset: u32,
    /// interpret the offset in local time
    pub save_offset_local: bool,
    /// how many metadata.mfs.back.N rotations to keep, [0..99]
    pub back_meta_keep_previous: u32,
    /// changelog files kept; the dump frequency may not exceed half of it
    pub back_logs: u32,
}

impl Default for MetaConfig {
    fn default() -> Self {
        MetaConfig {
            save_freq: 60,
            save_offset: 0,
            save_offset_local: false,
            back_meta_keep_previous: 1,
            back_logs: 50,
        }
    }
}

impl MetaConfig {
    pub fn sanitize(mut self) -> Self {
        if self.back_meta_keep_previous > 99 {
            warn!("BACK_META_KEEP_PREVIOUS over limit - decreasing to 99");
            self.back_meta_keep_previous = 99;
        }
        let lim = (self.back_logs / 2).max(1);
        if self.save_freq > lim {
            warn!("METADATA_SAVE_FREQ over BACK_LOGS/2 - decreasing to {}", lim);
            self.save_freq = lim;
        }
        self
    }

    /// Parses `"HH:MM"` with an optional trailing `L` selecting local time.
    pub fn parse_save_offset(&mut self, s: &str) -> Result<()> {
        let (body, local) = match s.strip_suffix(['L', 'l']) {
            Some(b) => (b, true),
            None => (s, false),
        };
        let (h, m) = body
            .split_once(':')
            .ok_or_else(|| anyhow!("METADATA_SAVE_OFFSET: expected HH:MM[L], got {:?}", s))?;
        let h: u32 = h.trim().parse()?;
        let m: u32 = m.trim().parse()?;
        if h >= 24 || m >= 60 {
            return Err(anyhow!("METADATA_SAVE_OFFSET: {:02}:{:02} out of range", h, m));
        }
        self.save_offset = h * 60 + m;
        self.save_offset_local = local;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_offset_parsing() -> Result<()> {
        let mut c = MetaConfig::default();
        c.parse_save_offset("02:30")?;
        assert_eq!(c.save_offset, 150);
        assert!(!c.save_offset_local);
        c.parse_save_offset("23:59L")?;
        assert_eq!(c.save_offset, 23 * 60 + 59);
        assert!(c.save_offset_local);
        assert!(c.parse_save_offset("24:00").is_err());
        assert!(c.parse_save_offset("1230").is_err());
        Ok(())
    }

    #[test]
    fn hard_link_limit_is_clamped() {
        let cfg = FsConfig { max_allowed_hard_links: 4, ..Default::default() }.sanitize();
        assert_eq!(cfg.max_allowed_hard_links, 32767);
        let cfg = FsConfig { max_allowed_hard_links: 65000, ..Default::default() }.sanitize();
        assert_eq!(cfg.max_allowed_hard_links, 65000);
    }

    #[test]
    fn atime_mode_fallback() {
        let mut cfg = FsConfig::default();
        cfg.set_atime_mode(3);
        assert_eq!(cfg.atime_mode, AtimeMode::FilesAndRelativeOnly);
        cfg.set_atime_mode(9);
        assert_eq!(cfg.atime_mode, AtimeMode::Always);
    }
}
