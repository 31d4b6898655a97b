//! The live viewer set.
//!
//! Each viewer owns a bounded outbound queue drained by its socket writer.
//! Fan-out never awaits a viewer: a closed or full queue removes that viewer
//! and the broadcast carries on with the rest.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use danmu_common::ViewerFrame;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type ViewerId = Uuid;

/// Per-viewer queue depth; a viewer this far behind is treated as dead.
pub const VIEWER_QUEUE: usize = 256;

/// Work item for a viewer's socket writer.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Encoded frames, written in order without interleaving
    Frames(Arc<Vec<String>>),
    Ping,
}

impl Outbound {
    pub fn frames(frames: &[ViewerFrame]) -> Self {
        Self::Frames(Arc::new(encode(frames)))
    }
}

fn encode(frames: &[ViewerFrame]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| match serde_json::to_string(f) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::error!(error = %e, kind = f.kind(), "cannot encode frame");
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct ViewerHandle {
    pub tx: mpsc::Sender<Outbound>,
    /// Cancelled when the viewer leaves the live set; tears the socket down
    pub closed: CancellationToken,
}

impl ViewerHandle {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            tx,
            closed: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: Vec<ViewerId>,
}

pub struct Viewers {
    live: RwLock<HashMap<ViewerId, ViewerHandle>>,
    count: watch::Sender<usize>,
}

impl Default for Viewers {
    fn default() -> Self {
        Self::new()
    }
}

impl Viewers {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            live: RwLock::new(HashMap::new()),
            count,
        }
    }

    /// Adds a viewer and returns the new live count.
    pub fn register(&self, id: ViewerId, handle: ViewerHandle) -> usize {
        let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
        live.insert(id, handle);
        let n = live.len();
        self.count.send_replace(n);
        n
    }

    /// Removes a viewer and closes its connection. Returns false if it was
    /// already gone.
    pub fn remove(&self, id: &ViewerId) -> bool {
        let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = live.remove(id) else {
            return false;
        };
        let n = live.len();
        drop(live);

        handle.closed.cancel();
        self.count.send_replace(n);
        true
    }

    pub fn len(&self) -> usize {
        self.live.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live-count feed; changes on every register and remove.
    pub fn watch_count(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }

    /// Queue `frames` for every live viewer.
    pub fn broadcast(&self, frames: &[ViewerFrame]) -> BroadcastReport {
        let message = Outbound::frames(frames);
        let targets: Vec<(ViewerId, mpsc::Sender<Outbound>)> = self
            .live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, h)| (*id, h.tx.clone()))
            .collect();

        let mut report = BroadcastReport::default();
        for (id, tx) in targets {
            match tx.try_send(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(viewer = %id, error = %e, "viewer send failed, dropping");
                    report.dropped.push(id);
                }
            }
        }
        for id in &report.dropped {
            self.remove(id);
        }
        report
    }

    /// Close every connection, e.g. on shutdown.
    pub fn close_all(&self) {
        let ids: Vec<ViewerId> = self
            .live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        for id in ids {
            self.remove(&id);
        }
    }
}
