use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use stash::cli::DaemonOpts;
use stash::config::Settings;
use stash::logger::{Logger, NoopLogger, TextLogger};
use stash::retry::CircuitBreaker;
use stash::server::{self, ServerCtx};
use stash::store::Store;
use stash::sync::MirrorSync;
use stash::tls;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    let settings = Settings::load(opts.config.as_deref())?;

    // Flags override the settings file field by field
    let root = opts
        .root
        .clone()
        .unwrap_or_else(|| settings.storage.root.clone());
    let bind = opts
        .bind
        .clone()
        .unwrap_or_else(|| settings.server.bind.clone());
    let dialect = match opts.dialect {
        Some(d) => d,
        None => settings.dialect()?,
    };
    let mirror_root = opts.mirror.clone().or_else(|| settings.sync.mirror.clone());

    let store = Store::open(&root, settings.store_options())
        .with_context(|| format!("open storage root {}", root.display()))?;
    let canonical_root = std::fs::canonicalize(&root)
        .with_context(|| format!("canonicalize storage root {}", root.display()))?;

    let mirror = match &mirror_root {
        Some(dir) => Some(
            MirrorSync::open(&store, dir)
                .with_context(|| format!("open mirror directory {}", dir.display()))?,
        ),
        None => None,
    };

    let logger: Arc<dyn Logger> = match opts.log_file.as_ref() {
        Some(p) => match TextLogger::new(p) {
            Ok(l) => Arc::new(l),
            Err(e) => {
                eprintln!(
                    "stashd: cannot open log file {}: {e}; operation logging disabled",
                    p.display()
                );
                Arc::new(NoopLogger)
            }
        },
        None => Arc::new(NoopLogger),
    };

    println!("Starting stash daemon:");
    println!("  Root: {}", canonical_root.display());
    println!("  Bind: {bind}");
    println!("  Dialect: {dialect}");
    match &mirror_root {
        Some(dir) => println!("  Mirror: {}", dir.display()),
        None => println!("  Mirror: (none)"),
    }
    if opts.tls_enabled() {
        match &opts.tls_cert {
            Some(cert) => println!("  TLS: enabled, certificate {}", cert.display()),
            None => println!(
                "  TLS: enabled, self-signed certificate under {}",
                tls::config_dir().display()
            ),
        }
    } else {
        println!("  TLS: disabled");
    }

    let breaker = CircuitBreaker::new(
        settings.breaker.failure_threshold,
        settings.breaker_reset_after(),
    );
    let ctx = ServerCtx::new(store, mirror, settings.retry_policy(), breaker, logger);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    rt.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("bind {bind}"))?;
        if opts.tls_enabled() {
            let tls_config = tls::server_config(opts.tls_cert.clone(), opts.tls_key.clone())
                .context("set up TLS configuration")?;
            server::serve_tls(listener, ctx, dialect, Arc::new(tls_config)).await
        } else {
            server::serve(listener, ctx, dialect).await
        }
    })
}
