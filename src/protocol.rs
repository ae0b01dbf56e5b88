//! Shared request/response model for both wire dialects
//!
//! The textual and line codecs both decode into [`Command`] and render
//! [`Outcome`], so dispatch is written once. Constants here bound what a
//! peer can make the server buffer.

use std::fmt;
use std::io;
use std::str::FromStr;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::StoreError;
use crate::store::FileMeta;
use crate::sync::SyncReport;

// Maximum request body held in memory (64MB) - prevents DoS via memory
// exhaustion. Larger files go through chunked-mode uploads.
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

// Maximum length of a start line or header line
pub const MAX_LINE_LEN: usize = 8 * 1024;

// Maximum header count per request
pub const MAX_HEADERS: usize = 64;

// Header names used by the textual dialect
pub mod header {
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const CONTENT_DISPOSITION: &str = "Content-Disposition";
    pub const CHECKSUM: &str = "Checksum";
    pub const CHUNK_INDEX: &str = "Chunk-Index";
    pub const CHUNK_TOTAL: &str = "Chunk-Total";
    pub const FILE_CHECKSUM: &str = "File-Checksum";
    pub const SYNC_JOB: &str = "Sync-Job";
    pub const MESSAGE: &str = "Message";
    pub const CONTENT_TYPE: &str = "Content-Type";
}

// Response status codes (textual dialect)
pub mod status {
    pub const OK: u16 = 200;
    pub const ACCEPTED: u16 = 202;
    pub const BAD_REQUEST: u16 = 400;
    pub const NOT_FOUND: u16 = 404;
    pub const CONFLICT: u16 = 409;
    pub const INTERNAL: u16 = 500;
    pub const UNAVAILABLE: u16 = 503;

    pub fn reason(code: u16) -> &'static str {
        match code {
            OK => "OK",
            ACCEPTED => "Accepted",
            BAD_REQUEST => "Bad Request",
            NOT_FOUND => "Not Found",
            CONFLICT => "Conflict",
            INTERNAL => "Internal Server Error",
            UNAVAILABLE => "Service Unavailable",
            _ => "Error",
        }
    }
}

// Connection establishment timeout for the client (ms)
pub const CONNECT_MS: u64 = 5_000;

/// Wire framing selected at server start. One codec seam, two framings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// HTTP-like start line + headers + body
    Http,
    /// Compact line commands, sequential on one connection
    Line,
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Dialect::Http),
            "line" => Ok(Dialect::Line),
            other => Err(format!("unknown dialect '{other}' (expected http or line)")),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Http => write!(f, "http"),
            Dialect::Line => write!(f, "line"),
        }
    }
}

/// Chunked-mode coordinates carried alongside an upload body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    /// 1-based
    pub index: u32,
    pub total: u32,
    /// digest of the complete file, required on the final chunk
    pub file_checksum: Option<String>,
}

/// One decoded request, dialect-independent.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Upload {
        name: String,
        body: Vec<u8>,
        checksum: Option<String>,
        chunk: Option<ChunkInfo>,
    },
    Download {
        name: String,
    },
    Delete {
        name: String,
    },
    List,
    /// `manifest: Some` reconciles the peer's snapshot against the store;
    /// `None` runs the configured mirror sync inline.
    Sync {
        manifest: Option<Vec<FileMeta>>,
    },
    TriggerSync,
    Health,
    Archive,
}

/// One dispatch result, rendered by either codec.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Saved {
        name: String,
        checksum: String,
    },
    ChunkStored {
        index: u32,
        total: u32,
    },
    File {
        name: String,
        body: Vec<u8>,
        checksum: String,
    },
    Deleted {
        name: String,
    },
    Listing {
        names: Vec<String>,
    },
    Report {
        report: SyncReport,
    },
    JobStarted {
        job: String,
    },
    Healthy,
    Archive {
        body: Vec<u8>,
    },
    Failure {
        status: u16,
        message: String,
    },
}

impl Outcome {
    /// Maps a storage error onto a wire failure.
    pub fn from_error(err: &StoreError) -> Outcome {
        let status = match err {
            StoreError::ChecksumMismatch { .. } => status::CONFLICT,
            StoreError::NotFound { .. } => status::NOT_FOUND,
            StoreError::InvalidName { .. } => status::BAD_REQUEST,
            StoreError::Unavailable { .. } => status::UNAVAILABLE,
            StoreError::Io(_) | StoreError::Exhausted { .. } => status::INTERNAL,
        };
        Outcome::Failure {
            status,
            message: err.to_string(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Outcome {
        Outcome::Failure {
            status: status::BAD_REQUEST,
            message: message.into(),
        }
    }
}

/// Framing-level failures. Distinct from [`StoreError`]: these never reach
/// the storage engine and always render as 400 (or drop the connection when
/// the stream is beyond saving).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("unsupported target: {method} {target}")]
    UnknownTarget { method: String, target: String },
    #[error("{what} exceeds limit ({limit})")]
    TooLarge { what: &'static str, limit: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        ProtocolError::Malformed(reason.into())
    }
}

/// Extracts the filename from a `Content-Disposition` value such as
/// `attachment; filename="report.pdf"`. Quotes are optional.
pub fn disposition_filename(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(rest) = strip_key(part, "filename") {
            let name = rest.trim().trim_matches('"');
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}

fn strip_key<'a>(part: &'a str, key: &str) -> Option<&'a str> {
    let (head, rest) = part.split_once('=')?;
    head.trim().eq_ignore_ascii_case(key).then_some(rest)
}

/// Looks up one query parameter in a request target, percent-decoded.
pub fn query_param(target: &str, key: &str) -> Option<String> {
    let (_, query) = target.split_once('?')?;
    for pair in query.split('&') {
        let (k, v) = match pair.split_once('=') {
            Some(kv) => kv,
            None => (pair, ""),
        };
        if k == key {
            return Some(percent_decode(v));
        }
    }
    None
}

/// Path portion of a request target, query stripped.
pub fn target_path(target: &str) -> &str {
    match target.split_once('?') {
        Some((path, _)) => path,
        None => target,
    }
}

pub fn percent_decode(s: &str) -> String {
    fn hex_val(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    }

    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Reads one line, stripping the `\n` or `\r\n` terminator. `Ok(None)`
/// means EOF before any byte arrived; EOF mid-line is an error. Both
/// dialects read lines through this bound.
pub(crate) async fn read_line_bounded<R>(
    reader: &mut R,
    what: &'static str,
) -> Result<Option<String>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line: Vec<u8> = Vec::new();
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            return Err(ProtocolError::malformed(format!(
                "connection closed inside {what}"
            )));
        }
        let (consumed, done) = match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                line.extend_from_slice(&buf[..pos]);
                (pos + 1, true)
            }
            None => {
                line.extend_from_slice(buf);
                (buf.len(), false)
            }
        };
        reader.consume(consumed);
        if line.len() > MAX_LINE_LEN {
            return Err(ProtocolError::TooLarge {
                what,
                limit: MAX_LINE_LEN,
            });
        }
        if done {
            break;
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| ProtocolError::malformed(format!("{what} is not UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_parse() {
        assert_eq!("http".parse::<Dialect>().unwrap(), Dialect::Http);
        assert_eq!("LINE".parse::<Dialect>().unwrap(), Dialect::Line);
        assert!("grpc".parse::<Dialect>().is_err());
    }

    #[test]
    fn test_disposition_filename_forms() {
        assert_eq!(
            disposition_filename("attachment; filename=\"report.pdf\""),
            Some("report.pdf".to_string())
        );
        assert_eq!(
            disposition_filename("attachment; filename=plain.txt"),
            Some("plain.txt".to_string())
        );
        assert_eq!(
            disposition_filename("attachment; FILENAME=\"caps.bin\"; size=9"),
            Some("caps.bin".to_string())
        );
        assert_eq!(disposition_filename("attachment"), None);
        assert_eq!(disposition_filename("attachment; filename=\"\""), None);
    }

    #[test]
    fn test_query_param_decoding() {
        assert_eq!(
            query_param("/download?file=a.txt", "file"),
            Some("a.txt".to_string())
        );
        assert_eq!(
            query_param("/download?file=my%20notes.txt", "file"),
            Some("my notes.txt".to_string())
        );
        assert_eq!(
            query_param("/download?file=a+b", "file"),
            Some("a b".to_string())
        );
        assert_eq!(query_param("/download?other=x", "file"), None);
        assert_eq!(query_param("/download", "file"), None);
    }

    #[test]
    fn test_target_path_strips_query() {
        assert_eq!(target_path("/download?file=x"), "/download");
        assert_eq!(target_path("/health"), "/health");
    }

    #[test]
    fn test_percent_round_trip() {
        let name = "weird name (v2)+final.txt";
        assert_eq!(percent_decode(&percent_encode(name)), name);
        // '+' must be encoded on the way out or it would decode to a space
        assert!(percent_encode(name).contains("%2B"));
    }

    #[test]
    fn test_percent_decode_truncated_escape() {
        assert_eq!(percent_decode("abc%2"), "abc%2");
        assert_eq!(percent_decode("abc%"), "abc%");
        assert_eq!(percent_decode("%zz"), "%zz");
        assert_eq!(percent_decode("caf%C3%A9"), "caf\u{e9}");
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (
                StoreError::ChecksumMismatch {
                    expected: "a".into(),
                    actual: "b".into(),
                },
                status::CONFLICT,
            ),
            (
                StoreError::NotFound { name: "x".into() },
                status::NOT_FOUND,
            ),
            (
                StoreError::InvalidName { name: "..".into() },
                status::BAD_REQUEST,
            ),
            (
                StoreError::Unavailable {
                    reason: "probe".into(),
                },
                status::UNAVAILABLE,
            ),
        ];
        for (err, want) in cases {
            match Outcome::from_error(&err) {
                Outcome::Failure { status, .. } => assert_eq!(status, want),
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
    }
}
