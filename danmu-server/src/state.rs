use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use danmu_collector::{TargetError, TargetResolver, UpstreamClient, UpstreamResolver};
use danmu_common::{CommentStore, LifecycleEvent};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::broadcast::Broadcaster;
use crate::collector::Collector;
use crate::config::SharedConfig;
use crate::targets::Targets;
use crate::viewers::Viewers;
use crate::workers::WorkerManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SharedConfig>,
    pub config_path: Arc<PathBuf>,
    pub broadcaster: Arc<Broadcaster>,
    pub workers: WorkerManager,
    pub targets: Arc<Targets>,
    pub resolver: Arc<dyn TargetResolver>,
    /// Lifecycle feed for `/api/events`
    pub events: broadcast::Sender<LifecycleEvent>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config_path: PathBuf,
        config: Arc<SharedConfig>,
        store: Arc<dyn CommentStore>,
        collector: Arc<dyn Collector>,
        resolver: Arc<dyn TargetResolver>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let viewers = Arc::new(Viewers::new());
        Self {
            config,
            config_path: Arc::new(config_path),
            broadcaster: Arc::new(Broadcaster::new(viewers, store)),
            workers: WorkerManager::new(collector, events.clone()),
            targets: Arc::new(Targets::default()),
            resolver,
            events,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn viewers(&self) -> &Arc<Viewers> {
        self.broadcaster.viewers()
    }

    pub fn emit(&self, event: LifecycleEvent) {
        let _ = self.events.send(event);
    }
}

/// Resolves against the upstream named by the active configuration, so a
/// reload that changes the cookie or base URL takes effect immediately.
pub struct ConfiguredResolver {
    config: Arc<SharedConfig>,
}

impl ConfiguredResolver {
    pub fn new(config: Arc<SharedConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TargetResolver for ConfiguredResolver {
    async fn resolve(&self, input: &str) -> Result<String, TargetError> {
        let config = self.config.current();
        let client = UpstreamClient::new(&config.collection.upstream_base, &config.collection.cookie)
            .map_err(|e| TargetError::Unresolvable {
                input: input.to_string(),
                reason: e.to_string(),
            })?;
        UpstreamResolver::new(client).resolve(input).await
    }
}
