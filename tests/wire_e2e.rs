use anyhow::Result;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use stash::client::{Client, ServerFailure};
use stash::logger::NoopLogger;
use stash::protocol::Dialect;
use stash::retry::{CircuitBreaker, RetryPolicy};
use stash::server::{self, ServerCtx};
use stash::store::{Store, StoreOptions};
use stash::sync::MirrorSync;
use stash::tls;

fn patterned(size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    let mut val: u8 = 0;
    for b in buf.iter_mut() {
        *b = val;
        val = val.wrapping_add(7);
    }
    buf
}

fn test_ctx(root: &Path, mirror: Option<&Path>) -> Result<Arc<ServerCtx>> {
    let store = Store::open(root, StoreOptions::default())?;
    let mirror = match mirror {
        Some(dir) => Some(MirrorSync::open(&store, dir)?),
        None => None,
    };
    Ok(ServerCtx::new(
        store,
        mirror,
        RetryPolicy::default(),
        CircuitBreaker::new(5, Duration::from_secs(30)),
        Arc::new(NoopLogger),
    ))
}

/// Binds an ephemeral port before spawning, so connections made right
/// after this returns land in the accept backlog.
async fn start(
    dialect: Dialect,
    root: &Path,
    mirror: Option<&Path>,
) -> Result<(u16, tokio::task::JoinHandle<()>)> {
    let ctx = test_ctx(root, mirror)?;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let task = tokio::spawn(async move {
        let _ = server::serve(listener, ctx, dialect).await;
    });
    Ok((port, task))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_upload_download_delete_cycle() -> Result<()> {
    let root = tempfile::tempdir()?;
    let (port, server_task) = start(Dialect::Http, root.path(), None).await?;
    let client = Client::new("127.0.0.1", port);

    let digest = client.upload("notes.txt", b"remember the milk").await?;
    assert_eq!(digest.len(), 32);
    assert_eq!(client.list().await?, vec!["notes.txt".to_string()]);

    let body = client.download("notes.txt").await?;
    assert_eq!(body, b"remember the milk");

    assert!(client.delete("notes.txt").await?);
    assert!(!client.delete("notes.txt").await?);

    let missing = client.download("notes.txt").await.unwrap_err();
    let failure = missing
        .downcast_ref::<ServerFailure>()
        .expect("missing download should carry the server status");
    assert_eq!(failure.status, 404);

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_chunked_upload_over_the_wire() -> Result<()> {
    let root = tempfile::tempdir()?;
    let (port, server_task) = start(Dialect::Http, root.path(), None).await?;
    let client = Client::new("127.0.0.1", port).chunk_size(64 * 1024);

    // 300,000 bytes over 64 KiB chunks: four full parts and a remainder
    let data = patterned(300_000);
    let mut progress = Vec::new();
    let digest = client
        .upload_with("big.bin", &data, |sent, total| progress.push((sent, total)))
        .await?;
    assert_eq!(digest, format!("{:x}", md5::compute(&data)));
    assert_eq!(progress.len(), 5);
    assert_eq!(progress.last().copied(), Some((300_000, 300_000)));

    // Assembled on disk, with no stray part or temp files
    assert!(root.path().join("big.bin").exists());
    for entry in std::fs::read_dir(root.path())? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        assert!(
            !name.contains(".part") && !name.ends_with(".tmp"),
            "leftover {name}"
        );
    }

    let body = client.download("big.bin").await?;
    assert_eq!(body, data);

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_sync_manifest_reports_plan() -> Result<()> {
    let root = tempfile::tempdir()?;
    let local = tempfile::tempdir()?;
    let (port, server_task) = start(Dialect::Http, root.path(), None).await?;
    let client = Client::new("127.0.0.1", port);

    // Server side: shared file, a server-only file, and a conflicting file
    client.upload("shared.txt", b"same bytes").await?;
    client.upload("server-only.txt", b"pull me").await?;
    client.upload("clash.txt", b"server version").await?;

    // Local side: the shared file, a local-only file, and the conflict
    std::fs::write(local.path().join("shared.txt"), b"same bytes")?;
    std::fs::write(local.path().join("local-only.txt"), b"push me")?;
    std::fs::write(local.path().join("clash.txt"), b"local version")?;

    // Pin both sides of the clash to the same mtime so neither looks newer
    let pinned = filetime::FileTime::from_unix_time(1_700_000_000, 0);
    filetime::set_file_mtime(local.path().join("clash.txt"), pinned)?;
    filetime::set_file_mtime(root.path().join("clash.txt"), pinned)?;

    let manifest = {
        let snapshot = Store::open(local.path(), StoreOptions::default())?;
        tokio::task::spawn_blocking(move || snapshot.scan()).await??
    };
    let report = client.sync(&manifest).await?;

    assert_eq!(report.files_to_upload, vec!["local-only.txt".to_string()]);
    assert_eq!(report.files_to_download, vec!["server-only.txt".to_string()]);
    assert_eq!(report.conflict_files, vec!["clash.txt".to_string()]);
    assert!(!report.is_conflict_free());

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_trigger_sync_converges_mirror() -> Result<()> {
    let root = tempfile::tempdir()?;
    let mirror = tempfile::tempdir()?;
    let (port, server_task) = start(Dialect::Http, root.path(), Some(mirror.path())).await?;
    let client = Client::new("127.0.0.1", port);

    client.upload("carry.txt", b"over to the mirror").await?;
    client.health().await?;

    let job = client.trigger_sync().await?;
    assert!(!job.is_empty());

    // Background job; poll the mirror for the copy
    for _ in 0..50u32 {
        if mirror.path().join("carry.txt").exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        std::fs::read(mirror.path().join("carry.txt"))?,
        b"over to the mirror"
    );

    // Already converged, so a second, inline sync has nothing to move
    let report = client.mirror_sync().await?;
    assert!(report.files_to_upload.is_empty());
    assert!(report.files_to_download.is_empty());
    assert!(report.is_conflict_free());

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_archive_bundles_stored_files() -> Result<()> {
    let root = tempfile::tempdir()?;
    let (port, server_task) = start(Dialect::Http, root.path(), None).await?;
    let client = Client::new("127.0.0.1", port);

    client.upload("a.txt", b"alpha").await?;
    client.upload("b.txt", b"bravo").await?;

    let body = client.archive().await?;
    let mut archive = tar::Archive::new(&body[..]);
    let mut seen = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut content = String::new();
        entry.read_to_string(&mut content)?;
        seen.push((name, content));
    }
    seen.sort();
    assert_eq!(
        seen,
        vec![
            ("a.txt".to_string(), "alpha".to_string()),
            ("b.txt".to_string(), "bravo".to_string()),
        ]
    );

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn line_dialect_full_session() -> Result<()> {
    let root = tempfile::tempdir()?;
    let mirror = tempfile::tempdir()?;
    let (port, server_task) = start(Dialect::Line, root.path(), Some(mirror.path())).await?;
    let client = Client::new("127.0.0.1", port).dialect(Dialect::Line);

    client.upload("keep.txt", b"stays on master").await?;
    client.upload("gone.txt", b"short lived").await?;
    assert_eq!(
        client.list().await?,
        vec!["gone.txt".to_string(), "keep.txt".to_string()]
    );

    assert_eq!(client.download("keep.txt").await?, b"stays on master");
    assert!(client.delete("gone.txt").await?);
    assert!(!client.delete("gone.txt").await?);
    assert!(client.download("gone.txt").await.is_err());

    // Mirror holds a file of its own; SYNC moves both directions. The
    // mirror is the "client" side of the report, so its lone file is the
    // upload and the master's is the download.
    std::fs::write(mirror.path().join("mirror-only.txt"), b"bring me back")?;
    let report = client.mirror_sync().await?;
    assert_eq!(report.files_to_upload, vec!["mirror-only.txt".to_string()]);
    assert_eq!(report.files_to_download, vec!["keep.txt".to_string()]);
    assert!(mirror.path().join("keep.txt").exists());
    assert!(root.path().join("mirror-only.txt").exists());

    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tls_round_trip_pins_fingerprint() -> Result<()> {
    let root = tempfile::tempdir()?;
    let config = tempfile::tempdir()?;
    let cert = config.path().join("cert.pem");
    let key = config.path().join("key.pem");
    let known_hosts = config.path().join("known_hosts");

    let ctx = test_ctx(root.path(), None)?;
    let tls_config = tls::server_config(Some(cert), Some(key))?;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let server_task = tokio::spawn(async move {
        let _ = server::serve_tls(listener, ctx, Dialect::Http, Arc::new(tls_config)).await;
    });

    let client = Client::new("127.0.0.1", port)
        .with_tls(true)
        .known_hosts(known_hosts.clone());
    client.upload("secret.txt", b"over tls").await?;
    assert_eq!(client.download("secret.txt").await?, b"over tls");

    // First connection pinned the fingerprint
    let pins = std::fs::read_to_string(&known_hosts)?;
    assert!(pins.contains(&format!("127.0.0.1:{port}=")));

    // A fresh client against the same pin still connects
    let again = Client::new("127.0.0.1", port)
        .with_tls(true)
        .known_hosts(known_hosts);
    assert_eq!(again.list().await?, vec!["secret.txt".to_string()]);

    server_task.abort();
    Ok(())
}
