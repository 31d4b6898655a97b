use std::sync::Arc;
use std::time::Duration;

use danmu_common::CommentStore;
use tokio_util::sync::CancellationToken;

use crate::fetcher::{pause, PaginatedFetcher, Termination};
use crate::upstream::PageSource;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub target: String,
    /// Upper bound on items read per fetch cycle
    pub lookback: usize,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub cycles: u64,
    pub stored: u64,
    pub failed_cycles: u64,
}

/// Fetch → upsert → sleep until cancelled. A failed cycle is logged and the
/// next one starts after the usual interval.
pub async fn run_session<S: PageSource>(
    mut fetcher: PaginatedFetcher<S>,
    store: Arc<dyn CommentStore>,
    config: SessionConfig,
    cancel: CancellationToken,
) -> SessionSummary {
    let mut summary = SessionSummary::default();
    tracing::info!(key = %config.target, lookback = config.lookback, "collection session started");

    while !cancel.is_cancelled() {
        let outcome = fetcher
            .fetch_new(&config.target, config.lookback, &cancel)
            .await;
        summary.cycles += 1;

        if !outcome.comments.is_empty() {
            let batch = outcome.comments.clone();
            let store = store.clone();
            match tokio::task::spawn_blocking(move || store.upsert_all(&batch)).await {
                Ok(Ok(n)) => {
                    summary.stored += n as u64;
                    tracing::info!(key = %config.target, count = n, "saved new comments");
                }
                Ok(Err(e)) => {
                    tracing::error!(key = %config.target, error = %e, "failed to save comments");
                    fetcher.forget(outcome.comments.iter().map(|c| c.id.as_str()));
                }
                Err(e) => {
                    tracing::error!(key = %config.target, error = %e, "store task panicked");
                    fetcher.forget(outcome.comments.iter().map(|c| c.id.as_str()));
                }
            }
        }

        match outcome.termination {
            Termination::Cancelled => break,
            Termination::Failed(e) => {
                summary.failed_cycles += 1;
                tracing::warn!(key = %config.target, error = %e, "collection cycle failed");
            }
            Termination::Done => {}
        }

        if !pause(&cancel, config.poll_interval).await {
            break;
        }
    }

    tracing::info!(
        key = %config.target,
        cycles = summary.cycles,
        stored = summary.stored,
        "collection session stopped"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FetchPolicy;
    use crate::upstream::RawPage;
    use crate::FetchError;
    use async_trait::async_trait;
    use danmu_common::SqliteStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Every call returns the same id plus one fresh id.
    struct Growing {
        calls: AtomicU64,
    }

    #[async_trait]
    impl PageSource for Growing {
        async fn fetch_page(&self, _target: &str, _page: u32) -> Result<RawPage, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 100;
            Ok(RawPage {
                data: vec![
                    json!({"id": n, "text": "new", "user": {"screen_name": "a"}}),
                    json!({"id": 1, "text": "old", "user": {"screen_name": "b"}}),
                ],
                max_id: json!(0),
                total_number: 2,
            })
        }
    }

    #[tokio::test]
    async fn session_stores_only_unseen_items_until_cancelled() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let fetcher = PaginatedFetcher::new(
            Growing {
                calls: AtomicU64::new(0),
            },
            FetchPolicy::default(),
        );
        let cancel = CancellationToken::new();
        let config = SessionConfig {
            target: "4990".into(),
            lookback: 10,
            poll_interval: Duration::from_millis(5),
        };

        let handle = tokio::spawn(run_session(fetcher, store.clone(), config, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        let summary = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(summary.cycles >= 2);
        // First cycle stores two, each later cycle only the fresh id.
        assert_eq!(summary.stored, summary.cycles + 1);
        let latest = store.fetch_latest(100).unwrap();
        assert_eq!(latest.len() as u64, summary.stored);
        assert!(latest.iter().all(|c| c.target_id == "4990"));
    }
}
