//! Paginated comment fetching with bounded per-page retry.
//!
//! Pagination is an explicit state machine: `Fetching(page)` moves to
//! `Fetching(page + 1)`, `Done` or `Failed`. Every wait (retry backoff, the
//! randomized gap between pages, the request itself) observes the session's
//! cancellation token.

use std::collections::HashSet;
use std::time::Duration;

use danmu_common::Comment;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::parse::parse_comment;
use crate::upstream::{PageSource, RawPage};
use crate::FetchError;

#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Attempts per page, including the first.
    pub attempts: u32,
    /// Delay after the n-th failed attempt; the last entry repeats.
    pub backoff: Vec<Duration>,
    /// Randomized gap between successful pages.
    pub page_gap: (Duration, Duration),
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(10),
            ],
            page_gap: (Duration::from_secs(1), Duration::from_secs(2)),
        }
    }
}

impl FetchPolicy {
    fn backoff_after(&self, failed_attempt: u32) -> Duration {
        let idx = failed_attempt.saturating_sub(1) as usize;
        self.backoff
            .get(idx)
            .or(self.backoff.last())
            .copied()
            .unwrap_or_default()
    }

    fn page_gap(&self) -> Duration {
        let (lo, hi) = self.page_gap;
        if hi <= lo {
            return lo;
        }
        rand::thread_rng().gen_range(lo..=hi)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PageState {
    Fetching(u32),
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub enum Termination {
    Done,
    Failed(FetchError),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Items not seen before in this session, in upstream order.
    pub comments: Vec<Comment>,
    pub pages: u32,
    pub termination: Termination,
}

impl FetchOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.termination, Termination::Failed(_))
    }
}

/// Fetcher for one target; remembers every id it has returned.
pub struct PaginatedFetcher<S> {
    source: S,
    policy: FetchPolicy,
    seen: HashSet<String>,
}

impl<S: PageSource> PaginatedFetcher<S> {
    pub fn new(source: S, policy: FetchPolicy) -> Self {
        Self {
            source,
            policy,
            seen: HashSet::new(),
        }
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Let ids be returned again, e.g. after they failed to persist.
    pub fn forget<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) {
        for id in ids {
            self.seen.remove(id);
        }
    }

    /// Walk pages until `max` items were read, the upstream runs out, or a
    /// page exhausts its retries. Items from earlier pages survive a failure.
    pub async fn fetch_new(
        &mut self,
        target: &str,
        max: usize,
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        let mut state = PageState::Fetching(1);
        let mut fetched = Vec::new();
        let mut read = 0usize;
        let mut pages = 0u32;
        let mut termination = Termination::Done;

        while let PageState::Fetching(page) = state {
            let raw = match self.fetch_page_with_retry(target, page, cancel).await {
                Ok(raw) => raw,
                Err(FetchError::Cancelled) => {
                    termination = Termination::Cancelled;
                    break;
                }
                Err(e) => {
                    tracing::error!(key = target, page, error = %e, "page retries exhausted");
                    termination = Termination::Failed(e);
                    state = PageState::Failed;
                    continue;
                }
            };
            pages += 1;

            if raw.data.is_empty() {
                state = PageState::Done;
                continue;
            }
            read += raw.data.len();
            fetched.extend(raw.data.iter().filter_map(|r| parse_comment(r, target)));

            if read >= max || !raw.has_more(page) {
                state = PageState::Done;
                continue;
            }
            if !pause(cancel, self.policy.page_gap()).await {
                termination = Termination::Cancelled;
                break;
            }
            state = PageState::Fetching(page + 1);
        }

        let comments = fetched
            .into_iter()
            .filter(|c| self.seen.insert(c.id.clone()))
            .collect::<Vec<_>>();
        tracing::debug!(key = target, pages, new = comments.len(), "fetch finished");

        FetchOutcome {
            comments,
            pages,
            termination,
        }
    }

    async fn fetch_page_with_retry(
        &self,
        target: &str,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<RawPage, FetchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                r = self.source.fetch_page(target, page) => r,
            };
            let err = match result {
                Ok(raw) => return Ok(raw),
                Err(e) if !e.is_retryable() || attempt >= self.policy.attempts => return Err(e),
                Err(e) => e,
            };

            let delay = self.policy.backoff_after(attempt);
            tracing::warn!(
                key = target,
                page,
                attempt,
                error = %err,
                "page fetch failed, retrying in {:?}",
                delay
            );
            if !pause(cancel, delay).await {
                return Err(FetchError::Cancelled);
            }
        }
    }
}

/// Sleep unless cancelled first. Returns false on cancellation.
pub(crate) async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
