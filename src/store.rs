//! Durable file storage engine
//!
//! Owns one flat directory. Saves are transactional: content streams to
//! `<name>.tmp` while being digested, is checked against a declared
//! checksum, then atomically renamed over any existing file, so a
//! concurrent reader observes the old content or the new content and
//! never a partial write. Saves whose size hint exceeds the configured
//! chunk threshold go through the chunk manager instead. Every public
//! operation first reduces the supplied name to its basename, which
//! keeps all reads and writes inside the storage root.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::checksum::{self, Digester};
use crate::chunk::{self, ChunkSpec};
use crate::error::{Result, StoreError};

/// Tuning knobs, injected at construction so tests can shrink them.
#[derive(Clone, Copy, Debug)]
pub struct StoreOptions {
    /// Window size for the chunked write path.
    pub chunk_size: u64,
    /// Size hint above which a save is chunked.
    pub chunk_threshold: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            chunk_size: 10 * 1024 * 1024,
            chunk_threshold: 100 * 1024 * 1024,
        }
    }
}

/// Metadata snapshot for one stored file, as exchanged by sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Epoch milliseconds.
    pub last_modified: i64,
    /// Epoch milliseconds, creation side only. Not every filesystem
    /// reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<i64>,
}

impl FileMeta {
    pub fn new(name: impl Into<String>, checksum: Option<&str>, last_modified: i64) -> Self {
        Self {
            name: name.into(),
            size: 0,
            checksum: checksum.map(str::to_string),
            last_modified,
            upload_date: None,
        }
    }
}

/// What a wire-driven chunk save produced.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Part persisted, more chunks expected.
    Stored { index: u32, total: u32 },
    /// Final chunk arrived; the file was assembled and verified.
    Assembled { checksum: String },
}

#[derive(Clone, Debug)]
pub struct Store {
    root: PathBuf,
    opts: StoreOptions,
}

impl Store {
    /// Opens (creating if needed) the storage root. A root that cannot be
    /// created is the storage-unavailable health condition.
    pub fn open(root: impl Into<PathBuf>, opts: StoreOptions) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            StoreError::unavailable(format!("cannot create storage root {}: {e}", root.display()))
        })?;
        Ok(Self { root, opts })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> StoreOptions {
        self.opts
    }

    /// Reduces a caller-supplied name to a safe basename. Directory
    /// components are stripped, not rejected, so `a/b.txt` stores as
    /// `b.txt`. Names that collide with internal artifact suffixes are
    /// refused so remote callers cannot forge partial state.
    pub fn sanitize(&self, raw: &str) -> Result<String> {
        let cleaned = raw.replace('\\', "/");
        let base = Path::new(&cleaned)
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| StoreError::invalid_name(raw))?;
        if base.contains(chunk::PART_MARKER) || base.ends_with(chunk::TMP_SUFFIX) {
            return Err(StoreError::invalid_name(raw));
        }
        Ok(base)
    }

    /// Saves an in-memory payload. See [`Store::save_stream`].
    pub fn save_bytes(&self, name: &str, data: &[u8], expected: Option<&str>) -> Result<String> {
        self.save_stream(name, data.len() as u64, data, expected)
    }

    /// Streams `reader` into storage under `name` and returns the digest
    /// of what was stored. A size hint above the chunk threshold selects
    /// the chunked path; otherwise the whole stream spools to a temp file
    /// that is verified and atomically renamed into place. When
    /// `expected` is given and does not match, nothing of the new content
    /// remains on disk and the previous content (if any) is untouched.
    pub fn save_stream<R: Read>(
        &self,
        name: &str,
        size_hint: u64,
        mut reader: R,
        expected: Option<&str>,
    ) -> Result<String> {
        let name = self.sanitize(name)?;
        if size_hint > self.opts.chunk_threshold {
            let total = chunk::write_parts(&self.root, &name, &mut reader, self.opts.chunk_size)?;
            return chunk::assemble(&self.root, &name, total, expected);
        }

        let tmp = chunk::tmp_path(&self.root, &name);
        let digest = match spool(&tmp, &mut reader) {
            Ok(d) => d,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
        };
        if let Some(expected) = expected {
            if !checksum::digests_match(expected, &digest) {
                let _ = fs::remove_file(&tmp);
                return Err(StoreError::ChecksumMismatch {
                    expected: expected.to_ascii_lowercase(),
                    actual: digest,
                });
            }
        }
        if let Err(e) = fs::rename(&tmp, self.root.join(&name)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(digest)
    }

    /// Persists one chunk of a client-driven chunked upload. The last
    /// chunk triggers assembly. A per-chunk digest mismatch, like any
    /// other failure here, sweeps every part for the name first.
    pub fn save_chunk(
        &self,
        name: &str,
        spec: ChunkSpec,
        data: &[u8],
        chunk_checksum: Option<&str>,
        file_checksum: Option<&str>,
    ) -> Result<ChunkOutcome> {
        let name = self.sanitize(name)?;
        if let Some(expected) = chunk_checksum {
            let actual = checksum::hex_digest(data);
            if !checksum::digests_match(expected, &actual) {
                let _ = chunk::sweep(&self.root, &name);
                return Err(StoreError::ChecksumMismatch {
                    expected: expected.to_ascii_lowercase(),
                    actual,
                });
            }
        }
        if let Err(e) = fs::write(chunk::part_path(&self.root, &name, spec.index()), data) {
            let _ = chunk::sweep(&self.root, &name);
            return Err(e.into());
        }
        if spec.is_last() {
            let checksum = chunk::assemble(&self.root, &name, spec.total(), file_checksum)?;
            Ok(ChunkOutcome::Assembled { checksum })
        } else {
            Ok(ChunkOutcome::Stored {
                index: spec.index(),
                total: spec.total(),
            })
        }
    }

    /// Whole file if present, else ordered part concatenation, else
    /// NotFound.
    pub fn get(&self, name: &str) -> Result<Vec<u8>> {
        let name = self.sanitize(name)?;
        match fs::read(self.root.join(&name)) {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match chunk::read_concat(&self.root, &name)? {
            Some(bytes) => Ok(bytes),
            None => Err(StoreError::not_found(name)),
        }
    }

    /// Removes the finished file if present and unconditionally sweeps
    /// part and temp artifacts. Returns whether anything was removed.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let name = self.sanitize(name)?;
        let existed = match fs::remove_file(self.root.join(&name)) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        let swept = chunk::sweep(&self.root, &name)?;
        let _ = fs::remove_file(chunk::tmp_path(&self.root, &name));
        Ok(existed || swept > 0)
    }

    /// Sorted names of finished files. Part and temp artifacts are never
    /// visible here.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.contains(chunk::PART_MARKER) || name.ends_with(chunk::TMP_SUFFIX) {
                continue;
            }
            names.push(name.to_string());
        }
        names.sort();
        Ok(names)
    }

    /// Digest of the finished (non-partial) artifact, None if absent.
    pub fn checksum_of(&self, name: &str) -> Result<Option<String>> {
        let name = self.sanitize(name)?;
        match checksum::hex_digest_file(&self.root.join(&name)) {
            Ok(d) => Ok(Some(d)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Full metadata for one finished file, None if absent.
    pub fn stat(&self, name: &str) -> Result<Option<FileMeta>> {
        let name = self.sanitize(name)?;
        let path = self.root.join(&name);
        let meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !meta.is_file() {
            return Ok(None);
        }
        let digest = checksum::hex_digest_file(&path)?;
        Ok(Some(FileMeta {
            name,
            size: meta.len(),
            checksum: Some(digest),
            last_modified: meta.modified().map(epoch_millis).unwrap_or(0),
            upload_date: meta.created().ok().map(epoch_millis),
        }))
    }

    /// Metadata snapshot of every finished file, sorted by name.
    pub fn scan(&self) -> Result<Vec<FileMeta>> {
        let mut metas = Vec::new();
        for name in self.list()? {
            // A file racing deletion just drops out of the snapshot.
            if let Some(meta) = self.stat(&name)? {
                metas.push(meta);
            }
        }
        Ok(metas)
    }

    /// Health probe: the root must exist and accept writes.
    pub fn health(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(StoreError::unavailable(format!(
                "storage root {} is not a directory",
                self.root.display()
            )));
        }
        let probe = self.root.join(format!(
            ".health.{}{}",
            uuid::Uuid::new_v4(),
            chunk::TMP_SUFFIX
        ));
        let write = fs::write(&probe, b"ok");
        let _ = fs::remove_file(&probe);
        write.map_err(|e| StoreError::unavailable(format!("storage root not writable: {e}")))
    }

    /// Removes partial artifacts (temp file, chunk parts) for `name`.
    /// The retry wrapper runs this as its recovery step; the finished
    /// file, if one exists, is left alone.
    pub fn remove_partial(&self, name: &str) {
        let Ok(name) = self.sanitize(name) else {
            return;
        };
        let _ = fs::remove_file(chunk::tmp_path(&self.root, &name));
        let _ = chunk::sweep(&self.root, &name);
    }

    /// Tar archive of every finished file, in list order.
    pub fn archive(&self) -> Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        for name in self.list()? {
            let mut f = match File::open(self.root.join(&name)) {
                Ok(f) => f,
                // deleted between list and open
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            builder.append_file(&name, &mut f)?;
        }
        Ok(builder.into_inner()?)
    }
}

fn spool<R: Read>(tmp: &Path, reader: &mut R) -> Result<String> {
    let mut out = File::create(tmp)?;
    let mut digester = Digester::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digester.update(&buf[..n]);
        out.write_all(&buf[..n])?;
    }
    out.flush()?;
    out.sync_all()?;
    Ok(digester.finish())
}

fn epoch_millis(t: std::time::SystemTime) -> i64 {
    match t.duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::hex_digest;

    fn small_store(dir: &Path) -> Store {
        Store::open(
            dir,
            StoreOptions {
                chunk_size: 10 * 1024,
                chunk_threshold: 20 * 1024,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_round_trip_below_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());
        let payload = b"small payload".to_vec();

        let digest = store.save_bytes("one.txt", &payload, None).unwrap();
        assert_eq!(digest, hex_digest(&payload));
        assert_eq!(store.get("one.txt").unwrap(), payload);
        assert!(!chunk::tmp_path(dir.path(), "one.txt").exists());
    }

    #[test]
    fn test_round_trip_above_threshold_leaves_no_parts() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());
        let payload: Vec<u8> = (0..25 * 1024u32).map(|i| (i % 256) as u8).collect();

        let digest = store
            .save_bytes("big.bin", &payload, Some(&hex_digest(&payload)))
            .unwrap();
        assert_eq!(digest, hex_digest(&payload));
        assert_eq!(store.get("big.bin").unwrap(), payload);
        assert!(chunk::list_parts(dir.path(), "big.bin").unwrap().is_empty());
        assert_eq!(
            fs::metadata(dir.path().join("big.bin")).unwrap().len(),
            25 * 1024
        );
    }

    #[test]
    fn test_checksum_gate_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());

        let err = store
            .save_bytes("gated.txt", b"content", Some("deadbeef"))
            .unwrap_err();
        assert!(matches!(err, StoreError::ChecksumMismatch { .. }));
        assert!(!dir.path().join("gated.txt").exists());
        assert!(!chunk::tmp_path(dir.path(), "gated.txt").exists());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_checksum_gate_keeps_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());
        store.save_bytes("keep.txt", b"old", None).unwrap();

        let err = store
            .save_bytes("keep.txt", b"new", Some("deadbeef"))
            .unwrap_err();
        assert!(matches!(err, StoreError::ChecksumMismatch { .. }));
        assert_eq!(store.get("keep.txt").unwrap(), b"old");
    }

    #[test]
    fn test_same_name_save_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());
        store.save_bytes("r.txt", b"v1", None).unwrap();
        store.save_bytes("r.txt", b"version two", None).unwrap();
        assert_eq!(store.get("r.txt").unwrap(), b"version two");
    }

    #[test]
    fn test_get_reassembles_manual_parts() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());
        fs::write(dir.path().join("f.bin.part2"), b" world").unwrap();
        fs::write(dir.path().join("f.bin.part1"), b"hello").unwrap();

        assert_eq!(store.get("f.bin").unwrap(), b"hello world");
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());
        let err = store.get("nope.txt").unwrap_err();
        assert!(matches!(err, StoreError::NotFound { ref name } if name == "nope.txt"));
    }

    #[test]
    fn test_delete_sweeps_parts() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());
        fs::write(dir.path().join("d.txt"), b"whole").unwrap();
        fs::write(dir.path().join("d.txt.part1"), b"p1").unwrap();
        fs::write(dir.path().join("d.txt.part2"), b"p2").unwrap();

        assert!(store.delete("d.txt").unwrap());
        assert!(!dir.path().join("d.txt").exists());
        assert!(!dir.path().join("d.txt.part1").exists());
        assert!(!dir.path().join("d.txt.part2").exists());
    }

    #[test]
    fn test_delete_parts_only_counts_as_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());
        fs::write(dir.path().join("p.txt.part1"), b"p1").unwrap();

        assert!(store.delete("p.txt").unwrap());
        assert!(!store.delete("p.txt").unwrap());
    }

    #[test]
    fn test_list_purity() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());
        fs::write(dir.path().join("b.txt"), b"b").unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::write(dir.path().join("big.bin.part1"), b"p").unwrap();
        fs::write(dir.path().join("stale.txt.tmp"), b"t").unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();

        let names = store.list().unwrap();
        assert_eq!(names, vec!["a.txt".to_string(), "b.txt".to_string()]);
        assert_eq!(store.list().unwrap(), names);
    }

    #[test]
    fn test_sanitize_strips_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());

        store.save_bytes("../escape.txt", b"x", None).unwrap();
        assert!(dir.path().join("escape.txt").exists());

        store.save_bytes("a/b/nested.txt", b"y", None).unwrap();
        assert!(dir.path().join("nested.txt").exists());

        store.save_bytes("..\\win.txt", b"z", None).unwrap();
        assert!(dir.path().join("win.txt").exists());
    }

    #[test]
    fn test_sanitize_rejects_unusable_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());

        for bad in ["", "..", "dir/..", "forged.part1", "sneaky.tmp"] {
            let err = store.save_bytes(bad, b"x", None).unwrap_err();
            assert!(
                matches!(err, StoreError::InvalidName { .. }),
                "expected InvalidName for {bad:?}"
            );
        }
    }

    #[test]
    fn test_checksum_of() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());
        store.save_bytes("c.txt", b"digest me", None).unwrap();

        assert_eq!(
            store.checksum_of("c.txt").unwrap().unwrap(),
            hex_digest(b"digest me")
        );
        assert!(store.checksum_of("absent.txt").unwrap().is_none());
    }

    #[test]
    fn test_stat_and_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());
        store.save_bytes("m.txt", b"meta", None).unwrap();
        fs::write(dir.path().join("m.txt.part1"), b"p").unwrap();

        let meta = store.stat("m.txt").unwrap().unwrap();
        assert_eq!(meta.name, "m.txt");
        assert_eq!(meta.size, 4);
        assert_eq!(meta.checksum.as_deref(), Some(hex_digest(b"meta").as_str()));
        assert!(meta.last_modified > 0);

        let scanned = store.scan().unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].name, "m.txt");
        assert!(store.stat("missing.txt").unwrap().is_none());
    }

    #[test]
    fn test_chunked_upload_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());
        let payload: Vec<u8> = (0..25 * 1024u32).map(|i| (i % 251) as u8).collect();
        let final_digest = hex_digest(&payload);
        let chunks: Vec<&[u8]> = payload.chunks(10 * 1024).collect();
        assert_eq!(chunks.len(), 3);

        for (i, data) in chunks.iter().enumerate() {
            let spec = ChunkSpec::new(i as u32 + 1, 3).unwrap();
            let outcome = store
                .save_chunk(
                    "blob.bin",
                    spec,
                    data,
                    Some(&hex_digest(data)),
                    spec.is_last().then_some(final_digest.as_str()),
                )
                .unwrap();
            if spec.is_last() {
                assert_eq!(
                    outcome,
                    ChunkOutcome::Assembled {
                        checksum: final_digest.clone()
                    }
                );
            } else {
                assert_eq!(
                    outcome,
                    ChunkOutcome::Stored {
                        index: spec.index(),
                        total: 3
                    }
                );
                assert!(dir
                    .path()
                    .join(format!("blob.bin.part{}", spec.index()))
                    .exists());
                assert!(!dir.path().join("blob.bin").exists());
            }
        }

        assert_eq!(store.get("blob.bin").unwrap(), payload);
        assert!(chunk::list_parts(dir.path(), "blob.bin").unwrap().is_empty());
        assert_eq!(
            fs::metadata(dir.path().join("blob.bin")).unwrap().len(),
            25 * 1024
        );
    }

    #[test]
    fn test_chunk_digest_mismatch_sweeps() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());
        let spec1 = ChunkSpec::new(1, 2).unwrap();
        store
            .save_chunk("cm.bin", spec1, b"first", None, None)
            .unwrap();

        let spec2 = ChunkSpec::new(2, 2).unwrap();
        let err = store
            .save_chunk("cm.bin", spec2, b"second", Some("deadbeef"), None)
            .unwrap_err();
        assert!(matches!(err, StoreError::ChecksumMismatch { .. }));
        assert!(chunk::list_parts(dir.path(), "cm.bin").unwrap().is_empty());
        assert!(!dir.path().join("cm.bin").exists());
    }

    #[test]
    fn test_health_probe() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());
        store.health().unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_health_read_only_root() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o500)).unwrap();

        let err = store.health().unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }));

        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).unwrap();
        store.health().unwrap();
    }

    #[test]
    fn test_remove_partial_keeps_finished_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());
        store.save_bytes("fin.txt", b"done", None).unwrap();
        fs::write(dir.path().join("fin.txt.part1"), b"p").unwrap();
        fs::write(dir.path().join("fin.txt.tmp"), b"t").unwrap();

        store.remove_partial("fin.txt");
        assert!(dir.path().join("fin.txt").exists());
        assert!(!dir.path().join("fin.txt.part1").exists());
        assert!(!dir.path().join("fin.txt.tmp").exists());
    }

    #[test]
    fn test_archive_bundles_finished_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = small_store(dir.path());
        store.save_bytes("a.txt", b"alpha", None).unwrap();
        store.save_bytes("b.txt", b"bravo", None).unwrap();
        fs::write(dir.path().join("c.txt.part1"), b"p").unwrap();

        let bytes = store.archive().unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut content = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut content).unwrap();
            seen.push((path, content));
        }
        assert_eq!(
            seen,
            vec![
                ("a.txt".to_string(), b"alpha".to_vec()),
                ("b.txt".to_string(), b"bravo".to_vec()),
            ]
        );
    }
}
