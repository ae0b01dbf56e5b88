//! Fixed-size chunk part management for the large-file path
//!
//! A large file lives on disk as numbered siblings `<name>.part1` ..
//! `<name>.partN` until assembly concatenates them into the final
//! `<name>`. Parts and the finished file are mutually exclusive visible
//! states: assembly writes into `<name>.tmp` and atomically renames, so a
//! reader sees either the old state or the complete file, never a prefix.
//! Any failure while writing or assembling sweeps every part for that
//! name before the error reaches the caller.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::checksum::{self, Digester};
use crate::error::{Result, StoreError};

/// Substring that marks a chunk part artifact.
pub const PART_MARKER: &str = ".part";

/// Suffix for in-flight transactional writes.
pub const TMP_SUFFIX: &str = ".tmp";

/// Path of part `index` (1-based) for `name` inside `dir`.
pub fn part_path(dir: &Path, name: &str, index: u32) -> PathBuf {
    dir.join(format!("{name}{PART_MARKER}{index}"))
}

pub(crate) fn tmp_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}{TMP_SUFFIX}"))
}

/// Validated chunk coordinates: 1-based `index`, `1 <= index <= total`.
/// Construction is the only place the invariant is checked, so holders
/// can trust it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkSpec {
    index: u32,
    total: u32,
}

impl ChunkSpec {
    pub fn new(index: u32, total: u32) -> Option<Self> {
        (index >= 1 && index <= total).then_some(Self { index, total })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// True when this chunk's arrival triggers assembly.
    pub fn is_last(&self) -> bool {
        self.index == self.total
    }
}

/// One `<name>.part*` artifact. `index` is None for a malformed suffix;
/// those order after every numeric part.
#[derive(Debug)]
pub struct PartFile {
    pub path: PathBuf,
    pub index: Option<u32>,
}

/// Parses a directory entry name against `base`. `None` means the entry
/// is not a part of `base`; `Some(None)` is a part with a malformed
/// (non-numeric) suffix.
fn parse_part(entry: &str, base: &str) -> Option<Option<u32>> {
    let rest = entry.strip_prefix(base)?;
    let digits = rest.strip_prefix(PART_MARKER)?;
    Some(digits.parse::<u32>().ok())
}

/// All parts of `name`, ordered ascending by numeric index with malformed
/// suffixes last (by entry name). Malformed suffixes are a warning, not
/// an error.
pub fn list_parts(dir: &Path, name: &str) -> Result<Vec<PartFile>> {
    let mut parts = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(entry_name) = file_name.to_str() else {
            continue;
        };
        if let Some(index) = parse_part(entry_name, name) {
            if index.is_none() {
                eprintln!("stash: malformed chunk suffix on {entry_name}, ordering it last");
            }
            parts.push(PartFile {
                path: entry.path(),
                index,
            });
        }
    }
    parts.sort_by(|a, b| {
        let ka = a.index.unwrap_or(u32::MAX);
        let kb = b.index.unwrap_or(u32::MAX);
        ka.cmp(&kb).then_with(|| a.path.cmp(&b.path))
    });
    Ok(parts)
}

/// Consumes `reader` in `chunk_size` windows, writing window N to
/// `<name>.partN` starting at 1. Returns how many parts were written.
/// On failure every part already written is swept before returning.
pub fn write_parts<R: Read>(
    dir: &Path,
    name: &str,
    reader: &mut R,
    chunk_size: u64,
) -> Result<u32> {
    let mut index: u32 = 0;
    let mut buf = Vec::new();
    let result = (|| -> Result<u32> {
        loop {
            buf.clear();
            let n = reader.by_ref().take(chunk_size).read_to_end(&mut buf)?;
            if n == 0 {
                break;
            }
            index += 1;
            let mut part = File::create(part_path(dir, name, index))?;
            part.write_all(&buf)?;
            if (n as u64) < chunk_size {
                break;
            }
        }
        Ok(index)
    })();
    if result.is_err() {
        let _ = sweep(dir, name);
    }
    result
}

/// Concatenates parts 1..=total into `<name>` through a temp file and an
/// atomic rename. Verifies `expected` (case-insensitive hex) against the
/// assembled content when given. Parts are deleted on success; on any
/// failure the temp file, the parts, and nothing else are removed.
pub fn assemble(dir: &Path, name: &str, total: u32, expected: Option<&str>) -> Result<String> {
    let tmp = tmp_path(dir, name);
    let digest = match assemble_into(dir, name, total, &tmp) {
        Ok(d) => d,
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            let _ = sweep(dir, name);
            return Err(e);
        }
    };

    if let Some(expected) = expected {
        if !checksum::digests_match(expected, &digest) {
            let _ = fs::remove_file(&tmp);
            let _ = sweep(dir, name);
            return Err(StoreError::ChecksumMismatch {
                expected: expected.to_ascii_lowercase(),
                actual: digest,
            });
        }
    }

    if let Err(e) = fs::rename(&tmp, dir.join(name)) {
        let _ = fs::remove_file(&tmp);
        let _ = sweep(dir, name);
        return Err(e.into());
    }
    sweep(dir, name)?;
    Ok(digest)
}

fn assemble_into(dir: &Path, name: &str, total: u32, tmp: &Path) -> Result<String> {
    let mut out = File::create(tmp)?;
    let mut digester = Digester::new();
    let mut buf = vec![0u8; 64 * 1024];
    for index in 1..=total {
        let path = part_path(dir, name, index);
        let mut part = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("missing chunk {index} of {total} for {name}"),
                ))
            } else {
                StoreError::Io(e)
            }
        })?;
        loop {
            let n = part.read(&mut buf)?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
            out.write_all(&buf[..n])?;
        }
    }
    out.flush()?;
    out.sync_all()?;
    Ok(digester.finish())
}

/// Read-side reassembly: ordered concatenation of whatever parts exist.
/// `None` when there are no parts at all.
pub fn read_concat(dir: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let parts = list_parts(dir, name)?;
    if parts.is_empty() {
        return Ok(None);
    }
    let mut out = Vec::new();
    for part in &parts {
        let mut f = File::open(&part.path)?;
        f.read_to_end(&mut out)?;
    }
    Ok(Some(out))
}

/// Deletes every `<name>.part*` artifact. Returns how many were removed.
/// Concurrent removals are tolerated.
pub fn sweep(dir: &Path, name: &str) -> Result<usize> {
    let mut removed = 0;
    for part in list_parts(dir, name)? {
        match fs::remove_file(&part.path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(removed)
}
