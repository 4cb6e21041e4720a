//! Runtime configuration schema (server, manifest location, local queue consumer).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchyardConfig {
    pub server: ServerConfig,
    pub manifest: ManifestConfig,
    pub local_queue: LocalQueueConfig,
}

/// HTTP + WebSocket listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Path that upgrades to a WebSocket and feeds the socket dispatcher.
    pub socket_path: String,
    /// Largest request body accepted by the HTTP adapter.
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 3000,
            socket_path: "/_ws".into(),
            body_limit_bytes: 6 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Where the build-time manifest artifact lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestConfig {
    pub path: PathBuf,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".switchyard").join("manifest.json"),
        }
    }
}

/// Polling consumer used when queues are served from the in-process transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalQueueConfig {
    /// Maximum messages handed to the queue dispatcher per poll.
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    /// Deliveries after which a failing message is dropped instead of retried.
    pub max_receive_count: u32,
}

impl Default for LocalQueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval_ms: 250,
            max_receive_count: 5,
        }
    }
}
