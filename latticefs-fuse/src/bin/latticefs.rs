//! Mount CLI, generalized from `tvix-store`'s `Commands::Mount` arm: load
//! config, connect the engine, mount, and unmount cleanly on Ctrl-C —
//! flushing dirty blocks first, since unlike tvix's read-only store this
//! mount can hold writes the backend hasn't seen yet.

use std::path::PathBuf;

use clap::Parser;
use latticefs_core::{Config, Engine};
use latticefs_fuse::{FuseDaemon, LatticeFs};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How many FUSE worker threads to use by default. `available_parallelism`
/// mirrors every other multi-threaded server in this workspace; there's no
/// macOS/MacFUSE special case here since FUSE for macOS isn't a supported
/// target of this mount.
fn default_threads() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[derive(Parser, Debug)]
#[command(name = "latticefs", version, about = "Mount a content-addressed remote object store over FUSE")]
struct Cli {
    /// `RUST_LOG`-style filter; falls back to `info` if unset and `RUST_LOG`
    /// isn't either.
    #[arg(long, env = "LATTICEFS_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Mount the store at `dest`, reading connection settings from a JSON
    /// config file (spec §6's `Config`).
    Mount {
        /// Path to the JSON config file (see `latticefs_core::Config`).
        #[arg(long)]
        config: PathBuf,

        /// Mountpoint.
        dest: PathBuf,

        /// Number of FUSE worker threads.
        #[arg(long, default_value_t = default_threads())]
        threads: usize,

        /// Whether to allow other users to access the mount (`allow_other`).
        #[arg(long, default_value_t = false)]
        allow_other: bool,
    },
}

fn init_tracing(log_level: Option<String>) {
    let filter = match log_level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.clone());

    match cli.command {
        Commands::Mount { config, dest, threads, allow_other } => {
            let config = Config::from_json_file(&config)?;
            let engine = Engine::connect(config).await?;
            let engine_for_mount = engine.clone();

            let tokio_handle = tokio::runtime::Handle::current();
            let mut fuse_daemon = tokio::task::spawn_blocking(move || {
                let fs = LatticeFs::new(engine_for_mount, tokio_handle);
                info!(mount_path = ?dest, "mounting");
                FuseDaemon::new(fs, &dest, threads, allow_other)
            })
            .await??;

            tokio::signal::ctrl_c().await?;
            info!("interrupt received, flushing dirty blocks before unmount");
            if let Err(e) = engine.drain_dirty().await {
                warn!(error = %e, "drain on unmount failed; some writes may not have reached the backend");
            }
            tokio::task::spawn_blocking(move || fuse_daemon.unmount()).await??;
            info!("unmount complete, terminating");
        }
    }

    Ok(())
}
