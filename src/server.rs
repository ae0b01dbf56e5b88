//! Connection server: accept, decode, dispatch, encode
//!
//! One task per accepted connection. Handlers share the storage engine,
//! the read-path breaker, and the operation logger through [`ServerCtx`];
//! there is no other cross-connection state. Disk work runs on the
//! blocking pool so retry sleeps never stall unrelated connections.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinError;
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

use crate::checksum;
use crate::chunk::ChunkSpec;
use crate::error::{Result as StoreResult, StoreError};
use crate::logger::Logger;
use crate::protocol::{status, Command, Dialect, Outcome, ProtocolError};
use crate::retry::{CircuitBreaker, RetryPolicy};
use crate::store::{ChunkOutcome, Store};
use crate::sync::{reconcile, MirrorSync, SyncReport};
use crate::{wire_http, wire_line};

pub struct ServerCtx {
    store: Store,
    mirror: Option<MirrorSync>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    logger: Arc<dyn Logger>,
}

impl ServerCtx {
    pub fn new(
        store: Store,
        mirror: Option<MirrorSync>,
        retry: RetryPolicy,
        breaker: CircuitBreaker,
        logger: Arc<dyn Logger>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            mirror,
            retry,
            breaker,
            logger,
        })
    }

    /// Runs one command against the storage engine and reconciler.
    pub async fn execute(self: &Arc<Self>, cmd: Command) -> Outcome {
        match cmd {
            Command::Upload {
                name,
                body,
                checksum,
                chunk: None,
            } => self.save_whole(name, body, checksum).await,
            Command::Upload {
                name,
                body,
                checksum,
                chunk: Some(info),
            } => {
                let Some(spec) = ChunkSpec::new(info.index, info.total) else {
                    return Outcome::bad_request(format!(
                        "chunk index {}/{} out of range",
                        info.index, info.total
                    ));
                };
                self.save_chunk(name, body, checksum, spec, info.file_checksum)
                    .await
            }
            Command::Download { name } => self.download(name).await,
            Command::Delete { name } => self.delete(name).await,
            Command::List => {
                let store = self.store.clone();
                match tokio::task::spawn_blocking(move || store.list()).await {
                    Ok(Ok(names)) => Outcome::Listing { names },
                    Ok(Err(e)) => Outcome::from_error(&e),
                    Err(e) => join_failure(e),
                }
            }
            Command::Sync {
                manifest: Some(manifest),
            } => {
                let store = self.store.clone();
                let result = tokio::task::spawn_blocking(move || -> StoreResult<SyncReport> {
                    let server = store.scan()?;
                    Ok(reconcile(&manifest, &server))
                })
                .await;
                match result {
                    Ok(Ok(report)) => Outcome::Report { report },
                    Ok(Err(e)) => Outcome::from_error(&e),
                    Err(e) => join_failure(e),
                }
            }
            Command::Sync { manifest: None } => self.mirror_sync_inline().await,
            Command::TriggerSync => self.mirror_sync_background(),
            Command::Health => {
                let store = self.store.clone();
                match tokio::task::spawn_blocking(move || store.health()).await {
                    Ok(Ok(())) => Outcome::Healthy,
                    Ok(Err(e)) => {
                        self.logger.error("health", "-", &e.to_string());
                        Outcome::from_error(&e)
                    }
                    Err(e) => join_failure(e),
                }
            }
            Command::Archive => {
                let store = self.store.clone();
                match tokio::task::spawn_blocking(move || store.archive()).await {
                    Ok(Ok(body)) => Outcome::Archive { body },
                    Ok(Err(e)) => Outcome::from_error(&e),
                    Err(e) => join_failure(e),
                }
            }
        }
    }

    async fn save_whole(&self, name: String, body: Vec<u8>, checksum: Option<String>) -> Outcome {
        let store = self.store.clone();
        let retry = self.retry;
        let n = name.clone();
        let size = body.len() as u64;
        let result = tokio::task::spawn_blocking(move || {
            retry.run(
                || store.save_bytes(&n, &body, checksum.as_deref()),
                || store.remove_partial(&n),
            )
        })
        .await;
        match result {
            Ok(Ok(digest)) => {
                self.logger.saved(&name, size, &digest);
                Outcome::Saved {
                    name,
                    checksum: digest,
                }
            }
            Ok(Err(e)) => {
                self.logger.error("save", &name, &e.to_string());
                Outcome::from_error(&e)
            }
            Err(e) => join_failure(e),
        }
    }

    // Chunked-mode requests are not retried: the peer re-sends a failed
    // chunk on a fresh connection, and the store has already swept.
    async fn save_chunk(
        &self,
        name: String,
        body: Vec<u8>,
        checksum: Option<String>,
        spec: ChunkSpec,
        file_checksum: Option<String>,
    ) -> Outcome {
        let store = self.store.clone();
        let n = name.clone();
        let result = tokio::task::spawn_blocking(move || -> StoreResult<(ChunkOutcome, u64)> {
            let outcome = store.save_chunk(
                &n,
                spec,
                &body,
                checksum.as_deref(),
                file_checksum.as_deref(),
            )?;
            let size = if matches!(outcome, ChunkOutcome::Assembled { .. }) {
                store.stat(&n)?.map(|m| m.size).unwrap_or(0)
            } else {
                0
            };
            Ok((outcome, size))
        })
        .await;
        match result {
            Ok(Ok((ChunkOutcome::Assembled { checksum }, size))) => {
                self.logger.saved(&name, size, &checksum);
                Outcome::Saved {
                    name,
                    checksum,
                }
            }
            Ok(Ok((ChunkOutcome::Stored { index, total }, _))) => {
                Outcome::ChunkStored { index, total }
            }
            Ok(Err(e)) => {
                self.logger.error("save-chunk", &name, &e.to_string());
                Outcome::from_error(&e)
            }
            Err(e) => join_failure(e),
        }
    }

    async fn download(self: &Arc<Self>, name: String) -> Outcome {
        let ctx = self.clone();
        let n = name.clone();
        let result =
            tokio::task::spawn_blocking(move || ctx.breaker.guard(Vec::new, || ctx.store.get(&n)))
                .await;
        match result {
            Ok(Ok(body)) => {
                let digest = checksum::hex_digest(&body);
                self.logger.fetched(&name, body.len() as u64);
                Outcome::File {
                    name,
                    body,
                    checksum: digest,
                }
            }
            Ok(Err(e)) => Outcome::from_error(&e),
            Err(e) => join_failure(e),
        }
    }

    async fn delete(&self, name: String) -> Outcome {
        let store = self.store.clone();
        let n = name.clone();
        match tokio::task::spawn_blocking(move || store.delete(&n)).await {
            Ok(Ok(true)) => {
                self.logger.deleted(&name);
                Outcome::Deleted { name }
            }
            Ok(Ok(false)) => Outcome::from_error(&StoreError::not_found(name)),
            Ok(Err(e)) => Outcome::from_error(&e),
            Err(e) => join_failure(e),
        }
    }

    async fn mirror_sync_inline(&self) -> Outcome {
        let Some(mirror) = self.mirror.clone() else {
            return Outcome::bad_request("no mirror directory configured");
        };
        let job = Uuid::new_v4().to_string();
        self.logger.sync_started(&job);
        match mirror.spawn(self.logger.clone()).await {
            Ok(Ok(report)) => {
                self.log_sync_done(&job, &report);
                Outcome::Report { report }
            }
            Ok(Err(e)) => {
                self.logger.error("sync", &job, &e.to_string());
                Outcome::from_error(&e)
            }
            Err(e) => join_failure(e),
        }
    }

    fn mirror_sync_background(&self) -> Outcome {
        let Some(mirror) = self.mirror.clone() else {
            return Outcome::bad_request("no mirror directory configured");
        };
        let job = Uuid::new_v4().to_string();
        self.logger.sync_started(&job);
        let handle = mirror.spawn(self.logger.clone());
        let logger = self.logger.clone();
        let job_bg = job.clone();
        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(report)) => logger.sync_done(
                    &job_bg,
                    report.files_to_upload.len(),
                    report.files_to_download.len(),
                    report.conflict_files.len(),
                ),
                Ok(Err(e)) => logger.error("sync", &job_bg, &e.to_string()),
                Err(e) => logger.error("sync", &job_bg, &e.to_string()),
            }
        });
        Outcome::JobStarted { job }
    }

    fn log_sync_done(&self, job: &str, report: &SyncReport) {
        self.logger.sync_done(
            job,
            report.files_to_upload.len(),
            report.files_to_download.len(),
            report.conflict_files.len(),
        );
    }
}

fn join_failure(e: JoinError) -> Outcome {
    Outcome::Failure {
        status: status::INTERNAL,
        message: format!("storage task failed: {e}"),
    }
}

/// Plain-TCP accept loop. Never returns except on listener failure.
pub async fn serve(listener: TcpListener, ctx: Arc<ServerCtx>, dialect: Dialect) -> Result<()> {
    eprintln!(
        "stashd: listening on {} ({dialect} dialect)",
        listener.local_addr().context("listener address")?
    );
    loop {
        let (stream, peer) = listener.accept().await.context("accept")?;
        stream.set_nodelay(true).ok();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(ctx, dialect, stream).await {
                eprintln!("stashd: connection {peer}: {e:#}");
            }
        });
    }
}

/// TLS accept loop. Handshake failures are logged per connection.
pub async fn serve_tls(
    listener: TcpListener,
    ctx: Arc<ServerCtx>,
    dialect: Dialect,
    tls: Arc<rustls::ServerConfig>,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(tls);
    eprintln!(
        "stashd: listening on {} ({dialect} dialect, TLS)",
        listener.local_addr().context("listener address")?
    );
    loop {
        let (stream, peer) = listener.accept().await.context("accept")?;
        stream.set_nodelay(true).ok();
        let acceptor = acceptor.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    if let Err(e) = handle_stream(ctx, dialect, tls_stream).await {
                        eprintln!("stashd: connection {peer}: {e:#}");
                    }
                }
                Err(e) => eprintln!("stashd: tls handshake with {peer}: {e}"),
            }
        });
    }
}

async fn handle_stream<S>(ctx: Arc<ServerCtx>, dialect: Dialect, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    match dialect {
        Dialect::Http => handle_textual(ctx, &mut stream).await,
        Dialect::Line => handle_line_session(ctx, &mut stream).await,
    }
}

async fn handle_textual<S>(ctx: Arc<ServerCtx>, stream: &mut BufReader<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req = match wire_http::read_request(stream).await {
        Ok(Some(req)) => req,
        // clean close before the start line: a probe, not a request
        Ok(None) => return Ok(()),
        Err(ProtocolError::Io(e)) => return Err(e.into()),
        Err(e) => {
            wire_http::write_outcome(stream, &Outcome::bad_request(e.to_string())).await?;
            return Ok(());
        }
    };
    let outcome = match wire_http::decode(req) {
        Ok(cmd) => ctx.execute(cmd).await,
        Err(e) => Outcome::bad_request(e.to_string()),
    };
    wire_http::write_outcome(stream, &outcome).await?;
    Ok(())
}

async fn handle_line_session<S>(ctx: Arc<ServerCtx>, stream: &mut BufReader<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let cmd = match wire_line::read_command(stream).await {
            Ok(Some(cmd)) => cmd,
            Ok(None) => return Ok(()),
            Err(ProtocolError::Io(e)) => return Err(e.into()),
            // framing may be out of step after a bad command; answer and drop
            Err(e) => {
                let _ = wire_line::write_outcome(stream, &Outcome::bad_request(e.to_string()))
                    .await;
                return Ok(());
            }
        };
        let outcome = ctx.execute(cmd).await;
        wire_line::write_outcome(stream, &outcome).await?;
    }
}
