use std::sync::Arc;

use danmu_common::{Comment, CommentStore, StoreError, StylePayload, ViewerFrame};
use tokio::sync::Mutex;

use crate::detector::ChangeDetector;
use crate::viewers::{BroadcastReport, Outbound, ViewerHandle, ViewerId, Viewers};

/// Connects the comment store to the live viewer set.
///
/// Poll cycles and viewer attachment take the same lock, so a new viewer
/// either sees a cycle's push or fetches its own snapshot after it. The
/// first viewer of an empty set seeds the detector with what it was sent.
pub struct Broadcaster {
    viewers: Arc<Viewers>,
    store: Arc<dyn CommentStore>,
    detector: Mutex<ChangeDetector>,
}

impl Broadcaster {
    pub fn new(viewers: Arc<Viewers>, store: Arc<dyn CommentStore>) -> Self {
        Self {
            viewers,
            store,
            detector: Mutex::new(ChangeDetector::new()),
        }
    }

    pub fn viewers(&self) -> &Arc<Viewers> {
        &self.viewers
    }

    pub async fn latest(&self, n: usize) -> Result<Vec<Comment>, StoreError> {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.fetch_latest(n)).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "snapshot task failed");
                Ok(Vec::new())
            }
        }
    }

    /// Queue `style` and the current snapshot for a new viewer, then add it
    /// to the live set. Returns the live count after registration.
    pub async fn attach(
        &self,
        id: ViewerId,
        handle: ViewerHandle,
        style: StylePayload,
        max_comments: usize,
    ) -> usize {
        let mut detector = self.detector.lock().await;

        if handle
            .tx
            .try_send(Outbound::frames(&[ViewerFrame::style(style)]))
            .is_err()
        {
            tracing::warn!(viewer = %id, "viewer gone before style was sent");
            return self.viewers.len();
        }

        match self.latest(max_comments).await {
            Ok(snapshot) if !snapshot.is_empty() => {
                if let Err(e) = handle
                    .tx
                    .try_send(Outbound::frames(&ViewerFrame::snapshot(&snapshot)))
                {
                    tracing::warn!(viewer = %id, error = %e, "initial snapshot not delivered, dropping viewer");
                    handle.closed.cancel();
                    return self.viewers.len();
                }
                if self.viewers.is_empty() {
                    detector.observe(&snapshot);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "failed to load initial snapshot"),
        }

        self.viewers.register(id, handle)
    }

    /// One orchestrator tick: if anyone is watching, diff the latest snapshot
    /// and push `clear` + `danmu*` on change.
    pub async fn poll_once(&self, max_comments: usize) -> Option<BroadcastReport> {
        if self.viewers.is_empty() {
            return None;
        }
        let mut detector = self.detector.lock().await;

        let snapshot = match self.latest(max_comments).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to load latest comments");
                return None;
            }
        };
        if !detector.observe(&snapshot) {
            return None;
        }

        tracing::info!(count = snapshot.len(), "new comments detected, pushing");
        Some(self.viewers.broadcast(&ViewerFrame::snapshot(&snapshot)))
    }

    /// Push display parameters to every live viewer, e.g. after a reload.
    pub fn push_style(&self, style: StylePayload) -> BroadcastReport {
        self.viewers.broadcast(&[ViewerFrame::style(style)])
    }
}
