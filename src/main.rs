// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use jobsupd::config::{self, Overrides};
use jobsupd::logging;
use jobsupd::ssh::RusshShellFactory;
use jobsupd::ssh::pool::ConnectionPool;
use jobsupd::staging::StagingEngine;
use jobsupd::state::kv::{KvStore, MemoryKv, RedisKv};
use jobsupd::state::store::SupervisorStore;
use jobsupd::supervisor::Supervisor;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Opts {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite database path (overrides the config file).
    #[arg(long)]
    database_path: Option<PathBuf>,

    /// Redis URL for queues and credentials (overrides the config file).
    #[arg(long)]
    redis_url: Option<String>,

    /// Admission tick period in seconds (overrides the config file).
    #[arg(long)]
    queue_tick_secs: Option<u64>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    logging::init(opts.verbose);

    let config = config::load(
        opts.config,
        Overrides {
            database_path: opts.database_path,
            redis_url: opts.redis_url,
            queue_tick_secs: opts.queue_tick_secs,
        },
    )?;
    if config.clusters.is_empty() {
        anyhow::bail!("no clusters configured; nothing to supervise");
    }

    config::ensure_database_dir(&config.database_path)?;
    let store = SupervisorStore::open(&config.database_path)
        .await
        .with_context(|| {
            format!(
                "failed to open database at {}",
                config.database_path.display()
            )
        })?;

    let kv: Arc<dyn KvStore> = match &config.redis_url {
        Some(url) => {
            tracing::info!(%url, "using redis keyed store");
            Arc::new(RedisKv::connect(url).context("failed to set up redis pool")?)
        }
        None => {
            tracing::warn!("no redis_url configured; queues will not survive a restart");
            Arc::new(MemoryKv::new())
        }
    };

    let pool = Arc::new(ConnectionPool::new(Arc::new(RusshShellFactory)));
    let staging = Arc::new(StagingEngine::new(
        store.clone(),
        kv.clone(),
        None, // bulk-transfer client is wired by deployments that have one
        config.git_mirror_root.clone(),
        config.scratch_dir.clone(),
    ));

    let grace = Duration::from_secs(config.shutdown_grace_secs);
    let supervisor = Arc::new(Supervisor::new(&config, store, kv, pool, staging));
    supervisor.clone().start();
    tracing::info!(
        clusters = config.clusters.len(),
        tick_secs = config.queue_tick_secs,
        "supervisor started"
    );

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown requested; draining workers");
    supervisor.shutdown(grace).await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(%err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
