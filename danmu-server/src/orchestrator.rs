//! Control loops and operations tying viewers, workers and configuration
//! together.

use std::collections::BTreeSet;

use danmu_collector::{TargetError, TargetResolver};
use danmu_common::{LifecycleEvent, MonitorResponse, MonitorStatus, ReloadResponse, StopReason};
use thiserror::Error;

use crate::collector::CollectorError;
use crate::config::{Config, ConfigError};
use crate::state::AppState;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Collector(#[from] CollectorError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Every `update_interval_ms`, diff the latest snapshot and push on change.
/// The interval is re-read each tick so a reload retunes the cadence.
pub async fn run_poll_loop(state: AppState) {
    tracing::debug!("poll loop started");
    loop {
        let config = state.config.current();
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = tokio::time::sleep(config.display.update_interval()) => {}
        }
        if let Some(report) = state.broadcaster.poll_once(config.display.max_comments).await {
            tracing::debug!(
                delivered = report.delivered,
                dropped = report.dropped.len(),
                "snapshot pushed"
            );
        }
    }
    tracing::debug!("poll loop stopped");
}

/// Reacts to live-count transitions: the last viewer leaving stops every
/// worker, the first viewer arriving starts the desired set.
pub async fn run_presence_loop(state: AppState) {
    let mut counts = state.viewers().watch_count();
    let mut last = *counts.borrow_and_update();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            changed = counts.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let now = *counts.borrow_and_update();
        if now == last {
            continue;
        }
        tracing::info!(viewers = now, "viewer count changed");
        state.emit(LifecycleEvent::viewer_count(now));

        let config = state.config.current();
        if last == 0 {
            let desired = state.targets.desired();
            tracing::info!(targets = desired.len(), "first viewer connected, starting workers");
            state.workers.reconcile(&desired, &config).await;
        } else if now == 0 {
            let n = state
                .workers
                .stop_all(StopReason::Idle, config.collection.stop_grace())
                .await;
            tracing::info!(stopped = n, "no viewers left, workers stopped");
        }
        last = now;
    }
}

/// Resolve each configured identifier; failures are logged and skipped.
pub async fn resolve_configured(resolver: &dyn TargetResolver, config: &Config) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    for input in &config.collection.targets {
        match resolver.resolve(input).await {
            Ok(key) => {
                keys.insert(key);
            }
            Err(e) => tracing::warn!(target_input = %input, error = %e, "skipping configured target"),
        }
    }
    keys
}

pub async fn start_monitoring(state: &AppState, input: &str) -> Result<MonitorResponse, ControlError> {
    let key = state.resolver.resolve(input).await?;
    state.targets.add(&key);

    if state.viewers().is_empty() {
        tracing::info!(key = %key, "target queued until a viewer connects");
        return Ok(MonitorResponse {
            key,
            status: MonitorStatus::Queued,
        });
    }

    let config = state.config.current();
    let status = state.workers.ensure(&key, &config).await?;

    // The last viewer may have left while the worker was spawning.
    if state.viewers().is_empty() {
        state
            .workers
            .stop(&key, StopReason::Idle, config.collection.stop_grace())
            .await;
        return Ok(MonitorResponse {
            key,
            status: MonitorStatus::Queued,
        });
    }

    Ok(MonitorResponse { key, status })
}

pub async fn stop_monitoring(state: &AppState, input: &str) -> Result<MonitorResponse, ControlError> {
    let key = state.resolver.resolve(input).await?;
    state.targets.remove(&key);

    let grace = state.config.current().collection.stop_grace();
    let status = if state.workers.stop(&key, StopReason::Requested, grace).await {
        MonitorStatus::Stopped
    } else {
        MonitorStatus::NotRunning
    };
    Ok(MonitorResponse { key, status })
}

/// Re-read the config file, push the new style, and restart every worker
/// under the new settings before returning. A malformed file leaves the
/// running configuration untouched.
pub async fn reload_config(state: &AppState) -> Result<ReloadResponse, ControlError> {
    let mut next = Config::load(&state.config_path)?;
    for field in next.retain_startup_fields(&state.config.current()) {
        tracing::warn!(field, "setting cannot change while running, restart the server to apply it");
    }
    let config = state.config.replace(next);
    tracing::info!(path = %state.config_path.display(), "configuration reloaded");

    let report = state.broadcaster.push_style(config.display.style());
    tracing::debug!(delivered = report.delivered, "style pushed");

    let configured = resolve_configured(state.resolver.as_ref(), &config).await;
    state.targets.set_configured(configured);
    let desired = state.targets.desired();

    let mut restarted = Vec::new();
    if state.viewers().is_empty() {
        state
            .workers
            .stop_all(StopReason::Idle, config.collection.stop_grace())
            .await;
    } else {
        for key in state.workers.active_keys() {
            if !desired.contains(&key) {
                state
                    .workers
                    .stop(&key, StopReason::Requested, config.collection.stop_grace())
                    .await;
            }
        }
        state.workers.restart_all(&desired, &config).await;
        restarted = state.workers.active_keys();

        if state.viewers().is_empty() {
            state
                .workers
                .stop_all(StopReason::Idle, config.collection.stop_grace())
                .await;
        }
    }

    state.emit(LifecycleEvent::config_reloaded());
    Ok(ReloadResponse {
        targets: desired.into_iter().collect(),
        restarted,
    })
}

/// Stop everything before the process exits.
pub async fn shutdown(state: &AppState) {
    state.shutdown.cancel();
    let grace = state.config.current().collection.stop_grace();
    let n = state.workers.stop_all(StopReason::Shutdown, grace).await;
    state.viewers().close_all();
    tracing::info!(stopped = n, "all workers stopped");
}
