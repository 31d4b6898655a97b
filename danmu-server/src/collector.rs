//! The capability to run one collection worker per target key.
//!
//! `ProcessCollector` spawns a `danmu-collector` child process; `TaskCollector`
//! runs the same session loop as a task inside the server.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use danmu_collector::{run_session, FetchPolicy, PaginatedFetcher, SessionConfig, UpstreamClient};
use danmu_common::CommentStore;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, CollectorMode};

const COLLECTOR_BIN: &str = "danmu-collector";

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("cannot spawn collector for {key}: {source}")]
    Spawn {
        key: String,
        source: std::io::Error,
    },

    #[error("cannot build upstream client for {key}: {source}")]
    Client {
        key: String,
        source: reqwest::Error,
    },
}

#[async_trait]
pub trait Collector: Send + Sync {
    async fn start(&self, key: &str, config: &Config)
        -> Result<Box<dyn WorkerHandle>, CollectorError>;
}

#[async_trait]
pub trait WorkerHandle: Send {
    /// Short label for logs and status, e.g. `pid 4242`.
    fn describe(&self) -> String;

    fn is_alive(&mut self) -> bool;

    /// Ask the worker to finish; force it after `grace`.
    async fn stop(&mut self, grace: Duration);
}

/// Pick the implementation named by the configuration. The choice, the
/// binary and the database path are fixed for the life of the server.
pub fn from_config(config: &Config, store: Arc<dyn CommentStore>) -> Arc<dyn Collector> {
    match config.collection.mode {
        CollectorMode::Process => Arc::new(ProcessCollector::new(
            config
                .collection
                .collector_bin
                .clone()
                .unwrap_or_else(ProcessCollector::locate),
            config.server.database.clone(),
        )),
        CollectorMode::Task => Arc::new(TaskCollector::new(store, FetchPolicy::default())),
    }
}

pub struct ProcessCollector {
    program: PathBuf,
    /// The store the server reads from; children always write here.
    database: PathBuf,
}

impl ProcessCollector {
    pub fn new(program: impl Into<PathBuf>, database: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            database: database.into(),
        }
    }

    /// The collector binary next to the server executable, else from `PATH`.
    pub fn locate() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(COLLECTOR_BIN)))
            .filter(|p| p.exists())
            .unwrap_or_else(|| PathBuf::from(COLLECTOR_BIN))
    }
}

#[async_trait]
impl Collector for ProcessCollector {
    async fn start(
        &self,
        key: &str,
        config: &Config,
    ) -> Result<Box<dyn WorkerHandle>, CollectorError> {
        let c = &config.collection;
        let mut cmd = Command::new(&self.program);
        cmd.arg("--target")
            .arg(key)
            .arg("--database")
            .arg(&self.database)
            .arg("--lookback")
            .arg(c.lookback.to_string())
            .arg("--poll-interval-secs")
            .arg(c.poll_interval_secs.to_string())
            .arg("--upstream-base")
            .arg(&c.upstream_base)
            .env("DANMU_COOKIE", &c.cookie)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| CollectorError::Spawn {
            key: key.to_string(),
            source,
        })?;
        let pid = child.id();
        tracing::info!(key, pid, "collector process spawned");

        Ok(Box::new(ProcessHandle { child, pid }))
    }
}

struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    fn describe(&self) -> String {
        match self.pid {
            Some(pid) => format!("pid {pid}"),
            None => "exited process".to_string(),
        }
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn stop(&mut self, grace: Duration) {
        if !self.is_alive() {
            return;
        }

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            }
        }
        #[cfg(not(unix))]
        let grace = Duration::ZERO;

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(pid = self.pid, %status, "collector exited"),
            Ok(Err(e)) => tracing::warn!(pid = self.pid, error = %e, "waiting for collector failed"),
            Err(_) => {
                tracing::warn!(pid = self.pid, "collector did not exit in time, killing");
                if let Err(e) = self.child.kill().await {
                    tracing::error!(pid = self.pid, error = %e, "failed to kill collector");
                }
            }
        }
    }
}

pub struct TaskCollector {
    store: Arc<dyn CommentStore>,
    policy: FetchPolicy,
}

impl TaskCollector {
    pub fn new(store: Arc<dyn CommentStore>, policy: FetchPolicy) -> Self {
        Self { store, policy }
    }
}

#[async_trait]
impl Collector for TaskCollector {
    async fn start(
        &self,
        key: &str,
        config: &Config,
    ) -> Result<Box<dyn WorkerHandle>, CollectorError> {
        let c = &config.collection;
        let client = UpstreamClient::new(&c.upstream_base, &c.cookie).map_err(|source| {
            CollectorError::Client {
                key: key.to_string(),
                source,
            }
        })?;
        let fetcher = PaginatedFetcher::new(client, self.policy.clone());
        let session = SessionConfig {
            target: key.to_string(),
            lookback: c.lookback,
            poll_interval: c.poll_interval(),
        };

        let cancel = CancellationToken::new();
        let join = tokio::spawn(run_session(
            fetcher,
            self.store.clone(),
            session,
            cancel.clone(),
        ));

        Ok(Box::new(TaskHandle {
            key: key.to_string(),
            cancel,
            join,
        }))
    }
}

struct TaskHandle {
    key: String,
    cancel: CancellationToken,
    join: JoinHandle<danmu_collector::session::SessionSummary>,
}

#[async_trait]
impl WorkerHandle for TaskHandle {
    fn describe(&self) -> String {
        format!("task {}", self.key)
    }

    fn is_alive(&mut self) -> bool {
        !self.join.is_finished()
    }

    async fn stop(&mut self, grace: Duration) {
        self.cancel.cancel();
        if tokio::time::timeout(grace, &mut self.join).await.is_err() {
            tracing::warn!(key = %self.key, "collection task did not stop in time, aborting");
            self.join.abort();
        }
    }
}
