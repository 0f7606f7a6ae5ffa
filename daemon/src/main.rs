use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::UnixListener;
use tracing::{info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use farview_cache::{remote, FileService};
use farview_daemon::listener;

/// Serves a read-only, block-cached view of a remote tree over a
/// local Unix socket.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The remote to mirror: an object-store URL (s3://…, gs://…,
    /// az://…, file://…) or a local directory path.
    #[clap(value_name = "REMOTE")]
    remote: String,

    /// Path of the Unix socket to listen on.
    #[arg(long, short = 'l')]
    listen: PathBuf,

    /// Directory for the block cache. Treated as scratch; defaults to
    /// a fresh temporary directory.
    #[arg(long, env = "FARVIEW_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Cache block size in bytes.
    #[arg(long, default_value_t = 4 << 20)]
    block_size: u64,

    /// A global log level to use when printing logs.
    /// It's also possible to set `RUST_LOG` according to
    /// `tracing_subscriber::filter::EnvFilter`, which will always
    /// have priority.
    #[arg(long)]
    log_level: Option<Level>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = cli.log_level.unwrap_or(Level::INFO);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::Layer::new().compact().with_filter(
                EnvFilter::builder()
                    .with_default_directive(level.into())
                    .from_env()
                    .expect("invalid RUST_LOG"),
            ),
        )
        .init();

    anyhow::ensure!(cli.block_size > 0, "--block-size must be positive");

    let remote = remote::from_addr(&cli.remote)
        .with_context(|| format!("constructing a remote for {:?}", cli.remote))?;

    // Keep an owned TempDir around so a generated work dir is cleaned
    // up on exit; an explicit one is left alone.
    let mut work_dir_guard = None;
    let work_dir = match &cli.work_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating work dir {}", dir.display()))?;
            dir.clone()
        }
        None => {
            let dir = tempfile::tempdir().context("creating a temporary work dir")?;
            let path = dir.path().to_path_buf();
            work_dir_guard = Some(dir);
            path
        }
    };

    let service = FileService::new(remote, &work_dir, cli.block_size)
        .context("initializing the file service")?;

    let listener = UnixListener::bind(&cli.listen)
        .with_context(|| format!("binding {}", cli.listen.display()))?;
    info!(socket = %cli.listen.display(), remote = %cli.remote, "listening");

    tokio::select! {
        _ = listener::serve(listener, service) => {}
        _ = shutdown_signal() => {
            info!("shutting down");
        }
    }

    let _ = std::fs::remove_file(&cli.listen);
    drop(work_dir_guard);
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("installing the SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
