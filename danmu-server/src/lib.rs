pub mod api;
pub mod broadcast;
pub mod collector;
pub mod config;
pub mod detector;
pub mod orchestrator;
pub mod server;
pub mod state;
pub mod targets;
pub mod viewers;
pub mod workers;
pub mod ws;

pub use collector::{Collector, CollectorError, ProcessCollector, TaskCollector, WorkerHandle};
pub use config::{Config, ConfigError, SharedConfig, DEFAULT_CONFIG_FILE};
pub use server::{router, serve};
pub use state::{AppState, ConfiguredResolver};
