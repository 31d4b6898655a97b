use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use danmu_common::StylePayload;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "danmu.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub display: DisplayConfig,
    pub collection: CollectionConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Size of the latest-N snapshot and number of overlay lines
    pub max_comments: usize,
    pub update_interval_ms: u64,
    pub container_width: u32,
    pub font_size: u32,
    pub text_color: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            max_comments: 5,
            update_interval_ms: 500,
            container_width: 400,
            font_size: 16,
            text_color: "#FFFFFF".to_string(),
        }
    }
}

impl DisplayConfig {
    pub fn style(&self) -> StylePayload {
        StylePayload {
            container_width: self.container_width,
            font_size: self.font_size,
            text_color: self.text_color.clone(),
            lines: self.max_comments,
        }
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms.max(10))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorMode {
    /// One `danmu-collector` child process per target
    #[default]
    Process,
    /// Collection sessions as tasks inside the server
    Task,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub cookie: String,
    /// Raw links, short-codes or numeric ids
    pub targets: Vec<String>,
    pub lookback: usize,
    pub poll_interval_secs: u64,
    pub max_runtime_secs: u64,
    pub stop_grace_ms: u64,
    pub mode: CollectorMode,
    pub upstream_base: String,
    pub collector_bin: Option<PathBuf>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            cookie: String::new(),
            targets: Vec::new(),
            lookback: 10,
            poll_interval_secs: 3,
            max_runtime_secs: 8 * 60 * 60,
            stop_grace_ms: 3000,
            mode: CollectorMode::default(),
            upstream_base: "https://weibo.com".to_string(),
            collector_bin: None,
        }
    }
}

impl CollectionConfig {
    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub heartbeat_secs: u64,
    pub database: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 30,
            database: PathBuf::from("./weibo/weibodata.db"),
        }
    }
}

impl ServerConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

impl Config {
    /// Read `path`; a missing file yields defaults, a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Keep the settings a running server cannot switch (the store it reads,
    /// the collector mode and binary) at their `running` values. Returns the
    /// names of the fields that differed.
    pub fn retain_startup_fields(&mut self, running: &Config) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.server.database != running.server.database {
            changed.push("server.database");
            self.server.database = running.server.database.clone();
        }
        if self.collection.mode != running.collection.mode {
            changed.push("collection.mode");
            self.collection.mode = running.collection.mode;
        }
        if self.collection.collector_bin != running.collection.collector_bin {
            changed.push("collection.collector_bin");
            self.collection.collector_bin = running.collection.collector_bin.clone();
        }
        changed
    }
}

/// The active configuration. Readers take an `Arc` snapshot and keep using it
/// for the whole operation; a reload swaps the pointer.
pub struct SharedConfig {
    current: RwLock<Arc<Config>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn current(&self) -> Arc<Config> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, config: Config) -> Arc<Config> {
        let next = Arc::new(config);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("danmu.json");
        std::fs::write(
            &path,
            r#"{"display": {"max_comments": 3}, "collection": {"cookie": "SUB=x", "mode": "task"}}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.display.max_comments, 3);
        assert_eq!(config.display.font_size, 16);
        assert_eq!(config.collection.cookie, "SUB=x");
        assert_eq!(config.collection.mode, CollectorMode::Task);
        assert_eq!(config.collection.max_runtime(), Duration::from_secs(28_800));
        assert_eq!(config.server.heartbeat_secs, 30);
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("danmu.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn snapshots_survive_replacement() {
        let shared = SharedConfig::new(Config::default());
        let before = shared.current();

        let mut next = Config::default();
        next.display.font_size = 24;
        shared.replace(next);

        assert_eq!(before.display.font_size, 16);
        assert_eq!(shared.current().display.font_size, 24);
    }

    #[test]
    fn startup_fields_survive_reload() {
        let running = Config::default();
        let mut next = Config::default();
        next.server.database = PathBuf::from("elsewhere.db");
        next.collection.mode = CollectorMode::Task;
        next.display.font_size = 30;

        let changed = next.retain_startup_fields(&running);
        assert_eq!(changed, ["server.database", "collection.mode"]);
        assert_eq!(next.server.database, running.server.database);
        assert_eq!(next.collection.mode, running.collection.mode);
        assert_eq!(next.display.font_size, 30);

        assert!(next.clone().retain_startup_fields(&running).is_empty());
    }

    #[test]
    fn style_payload_reflects_display() {
        let style = DisplayConfig::default().style();
        assert_eq!(style.lines, 5);
        assert_eq!(style.container_width, 400);
        assert_eq!(style.text_color, "#FFFFFF");
    }
}
