//! Append-only operation log: one human-readable line per mutation, keyed by
//! the global meta version. The format is stable - the loader parses the
//! exact lines the writer produces.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Escapes a name for a changelog line: printable bytes except the
/// separators pass through, everything else becomes `%XX`.
pub fn escape_name(name: &[u8]) -> String {
    let mut out = String::with_capacity(name.len());
    for &c in name {
        if (32..=126).contains(&c) && c != b',' && c != b'%' && c != b'(' && c != b')' {
            out.push(c as char);
        } else {
            out.push_str(&format!("%{:02X}", c));
        }
    }
    out
}

pub fn unescape_name(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    let b = s.as_bytes();
    let mut i = 0;
    while i < b.len() {
        if b[i] == b'%' && i + 2 < b.len() {
            let hex = &s[i + 1..i + 3];
            if let Ok(v) = u8::from_str_radix(hex, 16) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(b[i]);
        i += 1;
    }
    out
}

/// `<version>: <ts>|OP(args):results`
pub fn parse_line(line: &str) -> Option<(u64, &str)> {
    let (v, rest) = line.split_once(": ")?;
    let version = v.trim().parse().ok()?;
    Some((version, rest))
}

pub fn is_changelog_name(name: &str) -> bool {
    name.starts_with("changelog") && name.ends_with(".mfs")
}

/// Where mutation records go. The file-backed writer is the real one;
/// tests collect lines in memory.
pub trait ChangelogSink {
    fn append(&mut self, version: u64, data: &str);
    fn flush(&mut self) {}
}

/// Replay and read-only modes record nothing.
#[derive(Default)]
pub struct NullChangelog;

impl ChangelogSink for NullChangelog {
    fn append(&mut self, _version: u64, _data: &str) {}
}

#[derive(Default)]
pub struct MemChangelog {
    pub lines: Vec<(u64, String)>,
}

impl ChangelogSink for MemChangelog {
    fn append(&mut self, version: u64, data: &str) {
        self.lines.push((version, data.to_string()));
    }
}

pub struct FileChangelog {
    dir: PathBuf,
    file: Option<BufWriter<File>>,
}

impl FileChangelog {
    pub fn new(dir: &Path) -> Self {
        FileChangelog { dir: dir.to_path_buf(), file: None }
    }

    fn path(&self, n: u32) -> PathBuf {
        self.dir.join(format!("changelog.{}.mfs", n))
    }

    fn open(&mut self) -> Result<()> {
        if self.file.is_none() {
            let f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path(0))
                .with_context(|| format!("opening {:?}", self.path(0)))?;
            self.file = Some(BufWriter::new(f));
        }
        Ok(())
    }

    /// Hourly rotation: `changelog.N.mfs` moves to `changelog.N+1.mfs`,
    /// files past `back_logs` are dropped.
    pub fn rotate(&mut self, back_logs: u32) -> Result<()> {
        if let Some(mut f) = self.file.take() {
            f.flush().ok();
        }
        let _ = std::fs::remove_file(self.path(back_logs));
        for n in (0..back_logs).rev() {
            let from = self.path(n);
            if from.exists() {
                let _ = std::fs::rename(&from, self.path(n + 1));
            }
        }
        Ok(())
    }
}

impl ChangelogSink for FileChangelog {
    fn append(&mut self, version: u64, data: &str) {
        if self.open().is_err() {
            log::error!("can't open changelog file");
            return;
        }
        if let Some(f) = &mut self.file {
            if writeln!(f, "{}: {}", version, data).is_err() {
                log::error!("changelog write error");
            }
        }
    }

    fn flush(&mut self) {
        if let Some(f) = &mut self.file {
            let _ = f.flush();
            let _ = f.get_ref().sync_data();
        }
    }
}

/// First version recorded in a changelog file, 0 when unreadable.
pub fn find_first_version(path: &Path) -> u64 {
    let f = match File::open(path) {
        Ok(f) => f,
        Err(_) => return 0,
    };
    let mut r = BufReader::new(f);
    let mut line = String::new();
    if r.read_line(&mut line).is_err() {
        return 0;
    }
    parse_line(line.trim_end()).map(|(v, _)| v).unwrap_or(0)
}

/// Last version recorded in a changelog file, 0 when unreadable.
pub fn find_last_version(path: &Path) -> u64 {
    let f = match File::open(path) {
        Ok(f) => f,
        Err(_) => return 0,
    };
    let mut last = 0;
    for line in BufReader::new(f).lines().map_while(|l| l.ok()) {
        if let Some((v, _)) = parse_line(line.trim_end()) {
            last = v;
        }
    }
    last
}

/// All parsed `(version, data)` records of a changelog file.
pub fn read_lines(path: &Path) -> Result<Vec<(u64, String)>> {
    let f = File::open(path).with_context(|| format!("opening {:?}", path))?;
    let mut out = Vec::new();
    for line in BufReader::new(f).lines() {
        let line = line?;
        if let Some((v, data)) = parse_line(line.trim_end()) {
            out.push((v, data.to_string()));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let d = std::env::temp_dir().join(format!("mfsmeta-cl-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&d);
        std::fs::create_dir_all(&d).unwrap();
        d
    }

    #[test]
    fn escape_roundtrip() {
        let name = b"plain";
        assert_eq!(escape_name(name), "plain");
        let odd = b"a,b%c(d)e\nf";
        let esc = escape_name(odd);
        assert!(!esc.contains(','));
        assert!(!esc.contains('('));
        assert_eq!(unescape_name(&esc), odd.to_vec());
    }

    #[test]
    fn line_parse() {
        let (v, data) = parse_line("1234: 99|CREATE(1,f):5").unwrap();
        assert_eq!(v, 1234);
        assert_eq!(data, "99|CREATE(1,f):5");
        assert!(parse_line("garbage").is_none());
    }

    #[test]
    fn file_writer_and_version_scan() -> Result<()> {
        let dir = scratch("scan");
        let mut w = FileChangelog::new(&dir);
        for v in 100..110u64 {
            w.append(v, &format!("{}|ACCESS({})", v, v));
        }
        w.flush();
        let p = dir.join("changelog.0.mfs");
        assert_eq!(find_first_version(&p), 100);
        assert_eq!(find_last_version(&p), 109);
        let lines = read_lines(&p)?;
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[3].0, 103);
        Ok(())
    }

    #[test]
    fn rotation_shifts_files() -> Result<()> {
        let dir = scratch("rot");
        let mut w = FileChangelog::new(&dir);
        w.append(1, "1|ACCESS(1)");
        w.flush();
        w.rotate(3)?;
        w.append(2, "2|ACCESS(2)");
        w.flush();
        assert_eq!(find_first_version(&dir.join("changelog.1.mfs")), 1);
        assert_eq!(find_first_version(&dir.join("changelog.0.mfs")), 2);
        Ok(())
    }
}
