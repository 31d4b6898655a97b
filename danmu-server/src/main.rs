use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use danmu_common::{CommentStore, SqliteStore};
use danmu_server::{collector, orchestrator, AppState, Config, ConfiguredResolver, SharedConfig, DEFAULT_CONFIG_FILE};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "danmu-server", about = "Relays live post comments to overlay viewers")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[arg(short, long, env = "PORT", default_value = "8080")]
    port: u16,

    #[arg(long, default_value = "0.0.0.0")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let store: Arc<dyn CommentStore> = Arc::new(
        SqliteStore::open(&config.server.database)
            .with_context(|| format!("opening comment store {}", config.server.database.display()))?,
    );
    let collector = collector::from_config(&config, store.clone());
    tracing::info!(mode = ?config.collection.mode, "collector selected");

    let shared = Arc::new(SharedConfig::new(config));
    let resolver = Arc::new(ConfiguredResolver::new(shared.clone()));
    let state = AppState::new(cli.config.clone(), shared.clone(), store, collector, resolver);

    let configured = orchestrator::resolve_configured(state.resolver.as_ref(), &shared.current()).await;
    tracing::info!(targets = configured.len(), "configured targets resolved");
    state.targets.set_configured(configured);

    tokio::spawn(cancel_on_signal(state.shutdown.clone()));

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("danmu server listening on http://{addr}");

    danmu_server::serve(listener, state).await
}

async fn cancel_on_signal(shutdown: CancellationToken) {
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
    tracing::info!("shutdown requested, stopping workers");
    shutdown.cancel();
}
