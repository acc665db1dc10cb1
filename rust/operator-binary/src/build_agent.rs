//! The privileged build-agent sidecar: consumes build and apply signals
//! from the shared `/builds` volume, builds images with the daemonless
//! builder and applies environment resources through the pod's service
//! account.

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use kindling_operator::agent::{
    executor::{KanikoExecutor, DEFAULT_BUILDER_PATH, DEFAULT_CACHE_REPO},
    protocol::BUILDS_DIR,
    server::{self, AgentConfig},
};
use stackable_operator::logging::TracingTarget;
use tracing::info;

#[derive(Parser)]
#[clap(about, author)]
struct Opts {
    /// The shared volume both containers mount.
    #[clap(long, default_value = BUILDS_DIR)]
    builds_dir: PathBuf,
    /// Path to the daemonless builder binary.
    #[clap(long, default_value = DEFAULT_BUILDER_PATH)]
    builder_path: PathBuf,
    /// Seconds between work-queue scans.
    #[clap(long, default_value_t = 2)]
    poll_interval: u64,
    /// Claims older than this many seconds on startup are reclaimed.
    #[clap(long, default_value_t = 600)]
    stale_grace: u64,
    /// Layer-cache repository within the in-cluster registry.
    #[clap(long, default_value = DEFAULT_CACHE_REPO)]
    cache_repo: String,
    /// Disable the layer cache entirely.
    #[clap(long)]
    no_cache: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    stackable_operator::logging::initialize_logging(
        "KINDLING_BUILD_AGENT_LOG",
        "kindling-build-agent",
        TracingTarget::None,
    );

    let config = AgentConfig {
        builds_dir: opts.builds_dir,
        poll_interval: Duration::from_secs(opts.poll_interval),
        stale_grace: Duration::from_secs(opts.stale_grace),
    };
    let executor = KanikoExecutor {
        builder_path: opts.builder_path,
        cache_repo: (!opts.no_cache).then_some(opts.cache_repo),
    };

    info!(builds_dir = %config.builds_dir.display(), "build agent starting");
    tokio::select! {
        _ = server::run(config, &executor) => {}
        _ = shutdown_signal() => {
            info!("received termination signal, shutting down");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            // no signal handler, fall back to ctrl-c only
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}
