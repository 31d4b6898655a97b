use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use danmu_collector::{run_session, FetchPolicy, PaginatedFetcher, SessionConfig, UpstreamClient};
use danmu_common::SqliteStore;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "danmu-collector", about = "Collects comments for one post into the shared store")]
struct Cli {
    /// Canonical (numeric) post id to collect
    #[arg(short, long)]
    target: String,

    /// SQLite database shared with the server
    #[arg(short, long, default_value = "./weibo/weibodata.db")]
    database: String,

    /// Maximum items read per fetch cycle
    #[arg(short, long, default_value = "10")]
    lookback: usize,

    /// Seconds between fetch cycles
    #[arg(long, default_value = "3")]
    poll_interval_secs: u64,

    #[arg(long, default_value = "https://weibo.com")]
    upstream_base: String,

    /// Upstream credential; kept out of argv
    #[arg(long, env = "DANMU_COOKIE", hide_env_values = true, default_value = "")]
    cookie: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.cookie.is_empty() {
        tracing::warn!("no upstream cookie configured; requests will likely be rejected");
    }

    let store = SqliteStore::open(&cli.database)
        .with_context(|| format!("opening comment store {}", cli.database))?;
    let client = UpstreamClient::new(&cli.upstream_base, &cli.cookie).context("building upstream client")?;
    let fetcher = PaginatedFetcher::new(client, FetchPolicy::default());

    let cancel = CancellationToken::new();
    tokio::spawn(stop_on_signal(cancel.clone()));

    let summary = run_session(
        fetcher,
        Arc::new(store),
        SessionConfig {
            target: cli.target,
            lookback: cli.lookback,
            poll_interval: Duration::from_secs(cli.poll_interval_secs),
        },
        cancel,
    )
    .await;

    tracing::debug!(?summary, "exiting");
    Ok(())
}

async fn stop_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("termination requested");
    cancel.cancel();
}
