//! Content digest utilities
//!
//! File content is identified everywhere by a lowercase MD5 hex digest.
//! Digests are computed over complete content, never a partial chunk,
//! except where an operation explicitly digests one chunk's bytes.

use std::io::{self, Read};
use std::path::Path;

/// Digest a byte slice.
pub fn hex_digest(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Digest everything a reader yields.
pub fn hex_digest_reader<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

/// Digest a file's full content.
pub fn hex_digest_file(path: &Path) -> io::Result<String> {
    let mut f = std::fs::File::open(path)?;
    hex_digest_reader(&mut f)
}

/// Compares two hex digests. Remote peers may send uppercase hex.
pub fn digests_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Incremental digest for code that interleaves hashing with writing.
pub struct Digester {
    ctx: md5::Context,
}

impl Digester {
    pub fn new() -> Self {
        Self {
            ctx: md5::Context::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.ctx.consume(data);
    }

    pub fn finish(self) -> String {
        format!("{:x}", self.ctx.compute())
    }
}

impl Default for Digester {
    fn default() -> Self {
        Self::new()
    }
}
