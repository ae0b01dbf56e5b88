//! HTTP-like textual framing
//!
//! Start line, header block, optional `Content-Length` body; one request
//! per connection. CRLF is written on the wire and bare LF is tolerated
//! on read. Both directions live here: the server reads [`Request`] and
//! writes [`Outcome`], the client writes requests and reads [`Response`].

use std::io;

use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{
    self, header, read_line_bounded, status, ChunkInfo, Command, Outcome, ProtocolError,
    MAX_BODY_SIZE, MAX_HEADERS,
};

#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        lookup(&self.headers, name)
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        lookup(&self.headers, name)
    }

    /// `Message` header when present, else the body, else the reason phrase.
    pub fn message(&self) -> String {
        if let Some(m) = self.header(header::MESSAGE) {
            return m.to_string();
        }
        let body = String::from_utf8_lossy(&self.body).trim().to_string();
        if body.is_empty() {
            status::reason(self.status).to_string()
        } else {
            body
        }
    }
}

fn lookup<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

async fn read_header_block<R>(reader: &mut R) -> Result<Vec<(String, String)>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Vec::new();
    loop {
        let line = read_line_bounded(reader, "header line")
            .await?
            .ok_or_else(|| ProtocolError::malformed("connection closed inside headers"))?;
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADERS {
            return Err(ProtocolError::TooLarge {
                what: "header block",
                limit: MAX_HEADERS,
            });
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::malformed(format!("header line '{line}' has no colon")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
}

async fn read_declared_body<R>(
    reader: &mut R,
    headers: &[(String, String)],
) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let len = match lookup(headers, header::CONTENT_LENGTH) {
        Some(v) => v.parse::<usize>().map_err(|_| {
            ProtocolError::malformed(format!("bad {} '{v}'", header::CONTENT_LENGTH))
        })?,
        None => 0,
    };
    if len > MAX_BODY_SIZE {
        return Err(ProtocolError::TooLarge {
            what: "body",
            limit: MAX_BODY_SIZE,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Reads one request. `Ok(None)` is a clean close before the start line —
/// port probes and dropped connections land here, not in the error path.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let start = match read_line_bounded(reader, "start line").await? {
        Some(line) => line,
        None => return Ok(None),
    };
    let mut parts = start.split_whitespace();
    let method = match parts.next() {
        Some(m) => m.to_string(),
        None => return Err(ProtocolError::malformed("empty start line")),
    };
    let target = parts
        .next()
        .ok_or_else(|| ProtocolError::malformed(format!("start line '{start}' has no target")))?
        .to_string();
    // trailing version token ("HTTP/1.1") is accepted and ignored

    let headers = read_header_block(reader).await?;
    let body = read_declared_body(reader, &headers).await?;
    Ok(Some(Request {
        method,
        target,
        headers,
        body,
    }))
}

/// Maps a parsed request onto the dialect-independent command set.
pub fn decode(req: Request) -> Result<Command, ProtocolError> {
    let Request {
        method,
        target,
        headers,
        body,
    } = req;
    let get = |name: &str| lookup(&headers, name);

    match (method.as_str(), protocol::target_path(&target)) {
        ("POST", "/upload") => {
            let name = get(header::CONTENT_DISPOSITION)
                .and_then(protocol::disposition_filename)
                .ok_or_else(|| {
                    ProtocolError::malformed("upload without Content-Disposition filename")
                })?;
            let checksum = get(header::CHECKSUM).map(str::to_string);
            let chunk = match (get(header::CHUNK_INDEX), get(header::CHUNK_TOTAL)) {
                (None, None) => None,
                (Some(i), Some(t)) => {
                    let index = i.parse::<u32>().map_err(|_| {
                        ProtocolError::malformed(format!("bad {} '{i}'", header::CHUNK_INDEX))
                    })?;
                    let total = t.parse::<u32>().map_err(|_| {
                        ProtocolError::malformed(format!("bad {} '{t}'", header::CHUNK_TOTAL))
                    })?;
                    Some(ChunkInfo {
                        index,
                        total,
                        file_checksum: get(header::FILE_CHECKSUM).map(str::to_string),
                    })
                }
                _ => {
                    return Err(ProtocolError::malformed(
                        "chunked upload needs both Chunk-Index and Chunk-Total",
                    ))
                }
            };
            Ok(Command::Upload {
                name,
                body,
                checksum,
                chunk,
            })
        }
        ("GET", "/download") => Ok(Command::Download {
            name: required_file_param(&target)?,
        }),
        ("DELETE", "/delete") => Ok(Command::Delete {
            name: required_file_param(&target)?,
        }),
        ("POST", "/listFiles") => Ok(Command::List),
        ("POST", "/sync") => {
            if body.is_empty() {
                Ok(Command::Sync { manifest: None })
            } else {
                let manifest = serde_json::from_slice(&body).map_err(|e| {
                    ProtocolError::malformed(format!("sync manifest does not parse: {e}"))
                })?;
                Ok(Command::Sync {
                    manifest: Some(manifest),
                })
            }
        }
        ("POST", "/triggerSync") => Ok(Command::TriggerSync),
        ("GET", "/health") => Ok(Command::Health),
        ("GET", "/archive") => Ok(Command::Archive),
        _ => Err(ProtocolError::UnknownTarget {
            method: method.clone(),
            target: target.clone(),
        }),
    }
}

fn required_file_param(target: &str) -> Result<String, ProtocolError> {
    protocol::query_param(target, "file")
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ProtocolError::malformed("missing file parameter"))
}

/// Renders one outcome as status + headers + body.
fn render(outcome: &Outcome) -> io::Result<(u16, Vec<(&'static str, String)>, Vec<u8>)> {
    Ok(match outcome {
        Outcome::Saved { name, checksum } => (
            status::OK,
            vec![(header::CHECKSUM, checksum.clone())],
            format!("saved {name}\n").into_bytes(),
        ),
        Outcome::ChunkStored { index, total } => (
            status::ACCEPTED,
            Vec::new(),
            format!("chunk {index}/{total} stored\n").into_bytes(),
        ),
        Outcome::File {
            name,
            body,
            checksum,
        } => (
            status::OK,
            vec![
                (header::CHECKSUM, checksum.clone()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{name}\""),
                ),
            ],
            body.clone(),
        ),
        Outcome::Deleted { name } => (
            status::OK,
            Vec::new(),
            format!("deleted {name}\n").into_bytes(),
        ),
        Outcome::Listing { names } => {
            let mut body = names.join("\n");
            if !body.is_empty() {
                body.push('\n');
            }
            (status::OK, Vec::new(), body.into_bytes())
        }
        Outcome::Report { report } => {
            let code = if report.is_conflict_free() {
                status::OK
            } else {
                status::CONFLICT
            };
            let body = serde_json::to_vec(report)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            (
                code,
                vec![(header::CONTENT_TYPE, "application/json".to_string())],
                body,
            )
        }
        Outcome::JobStarted { job } => (
            status::ACCEPTED,
            vec![(header::SYNC_JOB, job.clone())],
            b"sync started\n".to_vec(),
        ),
        Outcome::Healthy => (status::OK, Vec::new(), b"storage: ok\n".to_vec()),
        Outcome::Archive { body } => (
            status::OK,
            vec![
                (header::CONTENT_TYPE, "application/x-tar".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"archive.tar\"".to_string(),
                ),
            ],
            body.clone(),
        ),
        Outcome::Failure { status, message } => (
            *status,
            vec![(header::MESSAGE, message.clone())],
            format!("{message}\n").into_bytes(),
        ),
    })
}

pub async fn write_outcome<W>(writer: &mut W, outcome: &Outcome) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (code, headers, body) = render(outcome)?;
    let mut head = format!("HTTP/1.1 {code} {}\r\n", status::reason(code));
    for (name, value) in &headers {
        head.push_str(&format!("{name}: {}\r\n", clean(value)));
    }
    head.push_str(&format!("{}: {}\r\n\r\n", header::CONTENT_LENGTH, body.len()));
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Client side: one request out.
pub async fn write_request<W>(
    writer: &mut W,
    method: &str,
    target: &str,
    headers: &[(&str, String)],
    body: &[u8],
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!("{method} {target} HTTP/1.1\r\n");
    for (name, value) in headers {
        head.push_str(&format!("{name}: {}\r\n", clean(value)));
    }
    head.push_str(&format!("{}: {}\r\n\r\n", header::CONTENT_LENGTH, body.len()));
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Client side: one response in.
pub async fn read_response<R>(reader: &mut R) -> Result<Response, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let start = read_line_bounded(reader, "status line")
        .await?
        .ok_or_else(|| ProtocolError::malformed("connection closed before status line"))?;
    let mut parts = start.split_whitespace();
    let _version = parts
        .next()
        .ok_or_else(|| ProtocolError::malformed("empty status line"))?;
    let code = parts
        .next()
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| ProtocolError::malformed(format!("status line '{start}' has no code")))?;

    let headers = read_header_block(reader).await?;
    let body = read_declared_body(reader, &headers).await?;
    Ok(Response {
        status: code,
        headers,
        body,
    })
}

// Header values travel on one line; CR/LF would break the framing.
fn clean(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}
