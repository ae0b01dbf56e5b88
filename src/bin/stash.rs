use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use stash::cli::ClientOpts;
use stash::store::{Store, StoreOptions};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "stash - durable file storage over a minimal socket protocol"
)]
struct Args {
    #[command(flatten)]
    conn: ClientOpts,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Upload a local file
    Upload {
        /// Local path to read
        path: PathBuf,

        /// Name to store under (defaults to the file name)
        #[arg(long)]
        name: Option<String>,

        /// Chunked-mode threshold in bytes
        #[arg(long)]
        chunk_size: Option<u64>,
    },
    /// Download a file
    Download {
        name: String,

        /// Local path to write (defaults to the name in the current directory)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Delete a file
    Delete { name: String },
    /// List stored files
    List,
    /// Reconcile a local directory against the server and print the plan
    Sync {
        /// Local directory to compare
        dir: PathBuf,
    },
    /// Start a server-side mirror sync and print the job id
    TriggerSync,
    /// Check server health
    Health,
    /// Fetch a tar archive of everything stored
    Archive {
        /// Local path to write
        #[arg(short, long, default_value = "archive.tar")]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let mut client = args.conn.client();
    match args.command {
        Cmd::Upload {
            path,
            name,
            chunk_size,
        } => {
            if let Some(bytes) = chunk_size {
                client = client.chunk_size(bytes);
            }
            let data =
                std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
            let name = match name {
                Some(n) => n,
                None => path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("cannot derive a name from {}", path.display()))?,
            };
            let bar = transfer_bar(data.len() as u64);
            let digest = client
                .upload_with(&name, &data, |sent, _| bar.set_position(sent))
                .await?;
            bar.finish_and_clear();
            println!("uploaded {name} ({} bytes, md5 {digest})", data.len());
        }
        Cmd::Download { name, out } => {
            let body = client.download(&name).await?;
            let out = out.unwrap_or_else(|| PathBuf::from(&name));
            std::fs::write(&out, &body)
                .with_context(|| format!("write {}", out.display()))?;
            println!("downloaded {name} ({} bytes) to {}", body.len(), out.display());
        }
        Cmd::Delete { name } => {
            if client.delete(&name).await? {
                println!("deleted {name}");
            } else {
                bail!("not found: {name}");
            }
        }
        Cmd::List => {
            for name in client.list().await? {
                println!("{name}");
            }
        }
        Cmd::Sync { dir } => {
            let manifest = {
                let local = Store::open(&dir, StoreOptions::default())
                    .with_context(|| format!("open {}", dir.display()))?;
                tokio::task::spawn_blocking(move || local.scan())
                    .await
                    .context("scan task")??
            };
            let report = client.sync(&manifest).await?;
            print_section("upload", &report.files_to_upload);
            print_section("download", &report.files_to_download);
            print_section("conflict", &report.conflict_files);
            println!("{}", report.summary());
            if !report.is_conflict_free() {
                eprintln!("stash: conflicts need manual resolution");
            }
        }
        Cmd::TriggerSync => {
            let job = client.trigger_sync().await?;
            println!("sync job {job} started");
        }
        Cmd::Health => {
            client.health().await?;
            println!("ok");
        }
        Cmd::Archive { out } => {
            let body = client.archive().await?;
            std::fs::write(&out, &body)
                .with_context(|| format!("write {}", out.display()))?;
            println!("archive ({} bytes) written to {}", body.len(), out.display());
        }
    }
    Ok(())
}

fn transfer_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("  {bar:30.green} {bytes}/{total_bytes} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}

fn print_section(label: &str, names: &[String]) {
    for name in names {
        println!("{label}: {name}");
    }
}
