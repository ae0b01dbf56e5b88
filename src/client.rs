//! Client side of both wire dialects
//!
//! Connects once per operation, plain TCP or TLS with fingerprint
//! pinning. Uploads are digest-verified end to end and bounded-retried;
//! payloads above the chunk size go up as sequential chunked-mode
//! requests. The line dialect covers the five core operations; the
//! richer targets (trigger, health, archive) need the textual dialect.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::checksum;
use crate::error::StoreError;
use crate::protocol::{
    self, header, read_line_bounded, status, Dialect, ProtocolError, CONNECT_MS,
};
use crate::store::{FileMeta, StoreOptions};
use crate::sync::SyncReport;
use crate::tls;
use crate::wire_http::{self, Response};

const UPLOAD_RETRY_DELAY: Duration = Duration::from_millis(500);

/// A response the server answered with a failure status.
#[derive(Debug, Error)]
#[error("server returned {status}: {message}")]
pub struct ServerFailure {
    pub status: u16,
    pub message: String,
}

trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}

type Conn = BufReader<Box<dyn AsyncIo>>;

#[derive(Debug, Clone)]
pub struct Client {
    host: String,
    port: u16,
    dialect: Dialect,
    tls: bool,
    known_hosts: PathBuf,
    chunk_size: u64,
    upload_attempts: u32,
}

impl Client {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            dialect: Dialect::Http,
            tls: false,
            known_hosts: tls::known_hosts_path(),
            chunk_size: StoreOptions::default().chunk_size,
            upload_attempts: 3,
        }
    }

    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.tls = enabled;
        self
    }

    pub fn known_hosts(mut self, path: PathBuf) -> Self {
        self.known_hosts = path;
        self
    }

    pub fn chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    pub fn upload_attempts(mut self, attempts: u32) -> Self {
        self.upload_attempts = attempts.max(1);
        self
    }

    async fn connect(&self) -> Result<Conn> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = match tokio::time::timeout(
            Duration::from_millis(CONNECT_MS),
            TcpStream::connect(&addr),
        )
        .await
        {
            Ok(r) => r.with_context(|| format!("connect to {addr}"))?,
            Err(_) => bail!("connect to {addr} timed out"),
        };
        stream.set_nodelay(true).ok();
        let io: Box<dyn AsyncIo> = if self.tls {
            let cfg = tls::client_config_tofu(&self.host, self.port, self.known_hosts.clone());
            let connector = TlsConnector::from(Arc::new(cfg));
            let name = tls::server_name_for(&self.host);
            Box::new(
                connector
                    .connect(name, stream)
                    .await
                    .context("tls handshake")?,
            )
        } else {
            Box::new(stream)
        };
        Ok(BufReader::new(io))
    }

    async fn http_round_trip(
        &self,
        method: &str,
        target: &str,
        headers: &[(&str, String)],
        body: &[u8],
    ) -> Result<Response> {
        let mut conn = self.connect().await?;
        wire_http::write_request(&mut conn, method, target, headers, body)
            .await
            .context("send request")?;
        let resp = wire_http::read_response(&mut conn)
            .await
            .context("read response")?;
        Ok(resp)
    }

    /// Stores `data` under `name` and returns the digest the server
    /// confirmed. Payloads above the chunk size go up in chunked mode
    /// (textual dialect only).
    pub async fn upload(&self, name: &str, data: &[u8]) -> Result<String> {
        self.upload_with(name, data, |_, _| {}).await
    }

    /// Like [`upload`](Self::upload), reporting (sent, total) bytes after
    /// every request for progress display.
    pub async fn upload_with(
        &self,
        name: &str,
        data: &[u8],
        mut progress: impl FnMut(u64, u64),
    ) -> Result<String> {
        if self.dialect == Dialect::Http && data.len() as u64 > self.chunk_size {
            return self.upload_chunked(name, data, &mut progress).await;
        }
        let local = checksum::hex_digest(data);
        let mut attempt = 1;
        loop {
            let result = match self.dialect {
                Dialect::Http => self.upload_whole_http(name, data, &local).await,
                Dialect::Line => self.upload_line(name, data).await.map(|()| local.clone()),
            };
            match result {
                Ok(remote) => {
                    if !checksum::digests_match(&local, &remote) {
                        bail!("server stored digest {remote}, expected {local}");
                    }
                    progress(data.len() as u64, data.len() as u64);
                    return Ok(remote);
                }
                Err(e) => {
                    if attempt >= self.upload_attempts || !is_retryable(&e) {
                        return Err(e);
                    }
                    eprintln!(
                        "stash: upload attempt {attempt}/{} failed: {e:#}; retrying",
                        self.upload_attempts
                    );
                    tokio::time::sleep(UPLOAD_RETRY_DELAY).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn upload_whole_http(&self, name: &str, data: &[u8], digest: &str) -> Result<String> {
        let resp = self
            .http_round_trip(
                "POST",
                "/upload",
                &[
                    (header::CONTENT_DISPOSITION, disposition(name)),
                    (header::CHECKSUM, digest.to_string()),
                ],
                data,
            )
            .await?;
        expect_status(&resp, status::OK)?;
        resp.header(header::CHECKSUM)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("server response has no {} header", header::CHECKSUM))
    }

    async fn upload_chunked(
        &self,
        name: &str,
        data: &[u8],
        progress: &mut impl FnMut(u64, u64),
    ) -> Result<String> {
        let chunk_size = self.chunk_size as usize;
        let total = data.len().div_ceil(chunk_size).max(1) as u32;
        let file_digest = checksum::hex_digest(data);
        let total_bytes = data.len() as u64;

        let mut sent = 0u64;
        let mut stored_digest = None;
        for (i, part) in data.chunks(chunk_size).enumerate() {
            let index = i as u32 + 1;
            let mut attempt = 1;
            let confirmed = loop {
                match self
                    .upload_chunk_http(name, part, index, total, &file_digest)
                    .await
                {
                    Ok(d) => break d,
                    Err(e) => {
                        if attempt >= self.upload_attempts || !is_retryable(&e) {
                            return Err(e.context(format!("chunk {index}/{total} of {name}")));
                        }
                        eprintln!(
                            "stash: chunk {index}/{total} attempt {attempt}/{} failed: {e:#}; retrying",
                            self.upload_attempts
                        );
                        tokio::time::sleep(UPLOAD_RETRY_DELAY).await;
                        attempt += 1;
                    }
                }
            };
            sent += part.len() as u64;
            progress(sent, total_bytes);
            if index == total {
                stored_digest = confirmed;
            }
        }

        let remote =
            stored_digest.ok_or_else(|| anyhow!("server never confirmed the final chunk"))?;
        if !checksum::digests_match(&file_digest, &remote) {
            bail!("server assembled digest {remote}, expected {file_digest}");
        }
        Ok(remote)
    }

    /// One chunk request. Only the final chunk's 200 carries the stored
    /// digest; intermediate chunks answer 202.
    async fn upload_chunk_http(
        &self,
        name: &str,
        part: &[u8],
        index: u32,
        total: u32,
        file_digest: &str,
    ) -> Result<Option<String>> {
        let mut headers = vec![
            (header::CONTENT_DISPOSITION, disposition(name)),
            (header::CHECKSUM, checksum::hex_digest(part)),
            (header::CHUNK_INDEX, index.to_string()),
            (header::CHUNK_TOTAL, total.to_string()),
        ];
        if index == total {
            headers.push((header::FILE_CHECKSUM, file_digest.to_string()));
        }
        let resp = self.http_round_trip("POST", "/upload", &headers, part).await?;
        match resp.status {
            s if s == status::OK => Ok(resp.header(header::CHECKSUM).map(str::to_string)),
            s if s == status::ACCEPTED => Ok(None),
            _ => Err(failure(&resp).into()),
        }
    }

    async fn upload_line(&self, name: &str, data: &[u8]) -> Result<()> {
        let name = line_token(name)?;
        let mut conn = self.connect().await?;
        conn.write_all(format!("UPLOAD {name} {}\n", data.len()).as_bytes())
            .await?;
        conn.write_all(data).await?;
        conn.flush().await?;
        expect_ok_line(&mut conn).await
    }

    /// Fetches and digest-verifies `name`.
    pub async fn download(&self, name: &str) -> Result<Vec<u8>> {
        match self.dialect {
            Dialect::Http => {
                let target = format!("/download?file={}", protocol::percent_encode(name));
                let resp = self.http_round_trip("GET", &target, &[], &[]).await?;
                expect_status(&resp, status::OK)?;
                if let Some(expected) = resp.header(header::CHECKSUM) {
                    let actual = checksum::hex_digest(&resp.body);
                    if !checksum::digests_match(expected, &actual) {
                        return Err(StoreError::ChecksumMismatch {
                            expected: expected.to_ascii_lowercase(),
                            actual,
                        }
                        .into());
                    }
                }
                Ok(resp.body)
            }
            Dialect::Line => {
                let name = line_token(name)?;
                let mut conn = self.connect().await?;
                conn.write_all(format!("DOWNLOAD {name}\n").as_bytes())
                    .await?;
                conn.flush().await?;
                let line = reply_line(&mut conn).await?;
                if line == "ERR" {
                    bail!("server answered ERR for {name}");
                }
                let len: usize = line
                    .parse()
                    .map_err(|_| anyhow!("bad length line {line:?}"))?;
                let mut body = vec![0u8; len];
                conn.read_exact(&mut body).await.context("read body")?;
                Ok(body)
            }
        }
    }

    /// Returns whether the file existed.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        match self.dialect {
            Dialect::Http => {
                let target = format!("/delete?file={}", protocol::percent_encode(name));
                let resp = self.http_round_trip("DELETE", &target, &[], &[]).await?;
                match resp.status {
                    s if s == status::OK => Ok(true),
                    s if s == status::NOT_FOUND => Ok(false),
                    _ => Err(failure(&resp).into()),
                }
            }
            Dialect::Line => {
                let name = line_token(name)?;
                let mut conn = self.connect().await?;
                conn.write_all(format!("DELETE {name}\n").as_bytes()).await?;
                conn.flush().await?;
                Ok(reply_line(&mut conn).await? == "OK")
            }
        }
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        match self.dialect {
            Dialect::Http => {
                let resp = self.http_round_trip("POST", "/listFiles", &[], &[]).await?;
                expect_status(&resp, status::OK)?;
                let text = String::from_utf8_lossy(&resp.body);
                Ok(text.lines().map(str::to_string).collect())
            }
            Dialect::Line => {
                let mut conn = self.connect().await?;
                conn.write_all(b"LIST\n").await?;
                conn.flush().await?;
                let mut names = Vec::new();
                loop {
                    let line = reply_line(&mut conn).await?;
                    if line == "END" {
                        return Ok(names);
                    }
                    names.push(line);
                }
            }
        }
    }

    /// Reconciles a local snapshot against the server. A report with
    /// conflicts is still a report, not an error.
    pub async fn sync(&self, manifest: &[FileMeta]) -> Result<SyncReport> {
        match self.dialect {
            Dialect::Http => {
                let body = serde_json::to_vec(manifest).context("encode manifest")?;
                let resp = self
                    .http_round_trip(
                        "POST",
                        "/sync",
                        &[(header::CONTENT_TYPE, "application/json".to_string())],
                        &body,
                    )
                    .await?;
                if resp.status != status::OK && resp.status != status::CONFLICT {
                    return Err(failure(&resp).into());
                }
                serde_json::from_slice(&resp.body).context("parse sync report")
            }
            Dialect::Line => self.sync_line().await,
        }
    }

    /// Asks the server to run its mirror sync and waits for the report.
    pub async fn mirror_sync(&self) -> Result<SyncReport> {
        match self.dialect {
            Dialect::Http => {
                let resp = self.http_round_trip("POST", "/sync", &[], &[]).await?;
                if resp.status != status::OK && resp.status != status::CONFLICT {
                    return Err(failure(&resp).into());
                }
                serde_json::from_slice(&resp.body).context("parse sync report")
            }
            Dialect::Line => self.sync_line().await,
        }
    }

    async fn sync_line(&self) -> Result<SyncReport> {
        let mut conn = self.connect().await?;
        conn.write_all(b"SYNC\n").await?;
        conn.flush().await?;
        let mut report = SyncReport::default();
        loop {
            let line = reply_line(&mut conn).await?;
            if line == "END" {
                return Ok(report);
            }
            if line == "ERR" {
                bail!("server answered ERR for SYNC");
            }
            let (kind, names) = line
                .split_once(':')
                .ok_or_else(|| anyhow!("bad sync line {line:?}"))?;
            let names: Vec<String> = names
                .split(',')
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect();
            match kind {
                "UPLOAD" => report.files_to_upload = names,
                "DOWNLOAD" => report.files_to_download = names,
                "CONFLICT" => report.conflict_files = names,
                _ => bail!("bad sync line {line:?}"),
            }
        }
    }

    /// Starts a background mirror sync; returns the job id.
    pub async fn trigger_sync(&self) -> Result<String> {
        self.require_http("triggerSync")?;
        let resp = self.http_round_trip("POST", "/triggerSync", &[], &[]).await?;
        expect_status(&resp, status::ACCEPTED)?;
        resp.header(header::SYNC_JOB)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("server response has no {} header", header::SYNC_JOB))
    }

    pub async fn health(&self) -> Result<()> {
        self.require_http("health")?;
        let resp = self.http_round_trip("GET", "/health", &[], &[]).await?;
        expect_status(&resp, status::OK)
    }

    /// Tar archive of everything the server stores.
    pub async fn archive(&self) -> Result<Vec<u8>> {
        self.require_http("archive")?;
        let resp = self.http_round_trip("GET", "/archive", &[], &[]).await?;
        expect_status(&resp, status::OK)?;
        Ok(resp.body)
    }

    fn require_http(&self, what: &str) -> Result<()> {
        if self.dialect != Dialect::Http {
            bail!("{what} requires the http dialect");
        }
        Ok(())
    }
}

fn disposition(name: &str) -> String {
    format!("attachment; filename=\"{name}\"")
}

fn line_token(name: &str) -> Result<&str> {
    if name.is_empty() || name.contains(char::is_whitespace) {
        bail!("line dialect cannot carry name {name:?}");
    }
    Ok(name)
}

fn failure(resp: &Response) -> ServerFailure {
    ServerFailure {
        status: resp.status,
        message: resp.message(),
    }
}

fn expect_status(resp: &Response, want: u16) -> Result<()> {
    if resp.status == want {
        Ok(())
    } else {
        Err(failure(resp).into())
    }
}

async fn reply_line(conn: &mut Conn) -> Result<String> {
    read_line_bounded(conn, "server reply")
        .await?
        .ok_or_else(|| anyhow!("connection closed before reply"))
}

async fn expect_ok_line(conn: &mut Conn) -> Result<()> {
    let line = reply_line(conn).await?;
    if line == "OK" {
        Ok(())
    } else {
        bail!("server answered {line:?}")
    }
}

/// Transport faults and 5xx answers are worth another attempt; everything
/// else is definitive.
fn is_retryable(e: &anyhow::Error) -> bool {
    if let Some(f) = e.downcast_ref::<ServerFailure>() {
        return f.status >= 500;
    }
    if e.downcast_ref::<std::io::Error>().is_some() {
        return true;
    }
    matches!(e.downcast_ref::<ProtocolError>(), Some(ProtocolError::Io(_)))
}
