use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use ingest_worker::WorkerConfig;
use live_server::WsTiming;

#[derive(Parser)]
#[command(name = "fleet-server", about = "Vehicle position ingestion and live fan-out")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the server
    Serve(ServeArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Path to the TOML config file
    #[arg(long, default_value = "config.toml", env = "CONFIG_PATH")]
    pub config: String,
}

// ---- TOML Config ----

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Consumer group shared by all worker instances.
    #[serde(default = "default_group")]
    pub group: String,
    /// Concurrent worker instances in this process.
    #[serde(default = "default_worker_instances")]
    pub worker_instances: usize,
    /// Max entries claimed per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long one poll blocks waiting for new entries.
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    /// Backoff after a transient stream failure.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Capacity of the log before fully-acked entries are trimmed.
    #[serde(default = "default_stream_max_entries")]
    pub stream_max_entries: usize,
    /// Worker → broker notification channel capacity.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Per-subscriber outbound buffer capacity.
    #[serde(default = "default_ws_buffer")]
    pub ws_buffer: usize,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

fn default_api_port() -> u16 {
    8080
}
fn default_group() -> String {
    "workers".to_string()
}
fn default_worker_instances() -> usize {
    1
}
fn default_batch_size() -> usize {
    200
}
fn default_block_ms() -> u64 {
    5000
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_stream_max_entries() -> usize {
    100_000
}
fn default_event_buffer() -> usize {
    1024
}
fn default_ws_buffer() -> usize {
    256
}
fn default_keepalive_secs() -> u64 {
    54
}
fn default_write_timeout_secs() -> u64 {
    10
}
fn default_read_timeout_secs() -> u64 {
    60
}

impl ServerConfig {
    pub fn load(path: &str) -> Result<Self, crate::error::ServerError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::ServerError::Config {
                context: "read",
                detail: format!("'{path}': {e}"),
            }
        })?;
        toml::from_str(&content).map_err(|e| crate::error::ServerError::Config {
            context: "parse",
            detail: format!("'{path}': {e}"),
        })
    }

    pub fn worker_config(&self, instance: usize) -> WorkerConfig {
        WorkerConfig {
            group: self.group.clone(),
            consumer: format!("worker-{instance}"),
            batch_size: self.batch_size,
            block: Duration::from_millis(self.block_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn ws_timing(&self) -> WsTiming {
        WsTiming {
            keepalive_period: Duration::from_secs(self.keepalive_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.api_port, 8080);
        assert_eq!(cfg.group, "workers");
        assert_eq!(cfg.worker_instances, 1);
        assert_eq!(cfg.batch_size, 200);
        assert_eq!(cfg.block_ms, 5000);
        assert_eq!(cfg.ws_buffer, 256);
        assert_eq!(cfg.keepalive_secs, 54);
    }

    #[test]
    fn worker_config_names_each_instance() {
        let cfg: ServerConfig = toml::from_str("batch_size = 50").unwrap();
        let wc = cfg.worker_config(3);
        assert_eq!(wc.consumer, "worker-3");
        assert_eq!(wc.batch_size, 50);
        assert_eq!(wc.group, "workers");
    }
}
