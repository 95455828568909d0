//! Agent configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "RELAY_CONFIG_FILE";

/// Agent configuration
///
/// Every field can be set from the environment with the `RELAY_` prefix,
/// e.g. `RELAY_BACKEND_ENDPOINT`. Environment values override the file.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Identity reported to the backend; defaults to the pod name
    #[serde(default = "default_agent_id")]
    pub agent_id: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Relay backend endpoint
    #[serde(default = "default_backend_endpoint")]
    pub backend_endpoint: String,

    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,

    /// Liveness side file; progress is only kept in memory when unset
    #[serde(default)]
    pub progress_file: Option<PathBuf>,

    /// `/healthz` fails once progress is older than this
    #[serde(default = "default_progress_stale_secs")]
    pub progress_stale_secs: u64,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,

    #[serde(default = "default_unacked_capacity")]
    pub unacked_capacity: usize,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Namespace for the workflow and event watchers; all when unset
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default = "default_tracker_ttl_secs")]
    pub tracker_ttl_secs: u64,

    #[serde(default = "default_event_ttl_secs")]
    pub event_ttl_secs: u64,

    #[serde(default)]
    pub node_label_selector: Option<String>,

    #[serde(default = "default_node_resync_secs")]
    pub node_resync_secs: u64,

    /// Namespaces excluded from the non-managed usage subtotal
    #[serde(default)]
    pub managed_namespaces: Vec<String>,

    #[serde(default)]
    pub include_pending: bool,

    #[serde(default = "default_usage_flush_secs")]
    pub usage_flush_secs: u64,
}

fn default_agent_id() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "cluster-relay".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_backend_endpoint() -> String {
    "http://relay-backend:8080".to_string()
}

fn default_progress_stale_secs() -> u64 {
    120
}

fn default_heartbeat_secs() -> u64 {
    15
}

fn default_send_queue_capacity() -> usize {
    1000
}

fn default_unacked_capacity() -> usize {
    10_000
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_tracker_ttl_secs() -> u64 {
    300
}

fn default_event_ttl_secs() -> u64 {
    600
}

fn default_node_resync_secs() -> u64 {
    300
}

fn default_usage_flush_secs() -> u64 {
    10
}

impl AgentConfig {
    /// Load configuration from `RELAY_CONFIG_FILE` (if set) and the environment
    pub fn load() -> Result<Self> {
        let file = std::env::var_os(CONFIG_FILE_ENV).map(PathBuf::from);
        Self::load_from(file.as_deref())
    }

    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("managed_namespaces"),
            )
            .build()
            .context("Failed to read configuration")?;

        config
            .try_deserialize()
            .context("Invalid configuration")
    }

    pub fn progress_stale_bound(&self) -> Duration {
        Duration::from_secs(self.progress_stale_secs)
    }
}
