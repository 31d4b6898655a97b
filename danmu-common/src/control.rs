use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorRequest {
    /// Raw link, short-code or numeric id
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    Started,
    AlreadyRunning,
    /// Registered, but nobody is watching; starts on the next viewer connect.
    Queued,
    Stopped,
    NotRunning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorResponse {
    pub key: String,
    pub status: MonitorStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub key: String,
    pub handle: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub alive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub viewers: usize,
    pub targets: Vec<String>,
    pub workers: Vec<WorkerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub targets: Vec<String>,
    pub restarted: Vec<String>,
}

/// Control-plane notifications published on the server's event feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    ViewerCount {
        viewers: usize,
        timestamp: DateTime<Utc>,
    },
    WorkerStarted {
        key: String,
        handle: String,
        expires_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    WorkerStopped {
        key: String,
        reason: StopReason,
        timestamp: DateTime<Utc>,
    },
    WorkerFailed {
        key: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    ConfigReloaded {
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Requested,
    Idle,
    Expired,
    Replaced,
    Shutdown,
}

impl LifecycleEvent {
    pub fn viewer_count(viewers: usize) -> Self {
        Self::ViewerCount {
            viewers,
            timestamp: Utc::now(),
        }
    }

    pub fn worker_started(
        key: impl Into<String>,
        handle: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self::WorkerStarted {
            key: key.into(),
            handle: handle.into(),
            expires_at,
            timestamp: Utc::now(),
        }
    }

    pub fn worker_stopped(key: impl Into<String>, reason: StopReason) -> Self {
        Self::WorkerStopped {
            key: key.into(),
            reason,
            timestamp: Utc::now(),
        }
    }

    pub fn worker_failed(key: impl Into<String>, error: impl Into<String>) -> Self {
        Self::WorkerFailed {
            key: key.into(),
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn config_reloaded() -> Self {
        Self::ConfigReloaded {
            timestamp: Utc::now(),
        }
    }
}
