//! Manifest entries as they appear in the build artifact, and their validated forms.

use std::time::Duration;

use {
    http::Method,
    serde::{Deserialize, Serialize},
};

use crate::{pattern::RoutePattern, recurrence::Recurrence};

/// Timeout applied when a route, queue or socket route does not configure one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Hard ceiling for every timeout in the manifest.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Suffix that marks a queue as FIFO.
pub const FIFO_SUFFIX: &str = ".fifo";

/// Path of the single socket route when none is given.
pub const DEFAULT_SOCKET_PATH: &str = "$default";

pub const DEFAULT_MEMORY_MB: u32 = 1024;

// ── Raw artifact ─────────────────────────────────────────────────────────────

/// The manifest document exactly as the build pipeline writes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestFile {
    pub routes: Vec<RouteEntry>,
    pub queues: Vec<QueueEntry>,
    pub schedules: Vec<ScheduleEntry>,
    pub sockets: Vec<SocketEntry>,
    pub memory_mb: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    pub path: String,
    #[serde(default = "default_content_types")]
    pub content_types: Vec<String>,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    #[serde(default)]
    pub cors: bool,
    pub handler: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub name: String,
    #[serde(default)]
    pub fifo: bool,
    pub handler: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub name: String,
    #[serde(alias = "schedule")]
    pub cron: String,
    pub handler: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketEntry {
    #[serde(default = "default_socket_path")]
    pub path: String,
    pub handler: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_content_types() -> Vec<String> {
    vec!["application/json".into()]
}

fn default_methods() -> Vec<String> {
    vec!["GET".into()]
}

fn default_socket_path() -> String {
    DEFAULT_SOCKET_PATH.into()
}

// ── Validated model ──────────────────────────────────────────────────────────

/// An HTTP route.
#[derive(Debug, Clone)]
pub struct Route {
    pub pattern: RoutePattern,
    /// Lower-cased MIME essences. Empty accepts anything.
    pub content_types: Vec<String>,
    pub methods: Vec<Method>,
    pub cors: bool,
    pub handler: String,
    pub timeout: Duration,
}

impl Route {
    pub fn allows_method(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }

    /// Whether a request `Content-Type` header value is acceptable.
    ///
    /// Supports `*/*` and `type/*` entries; parameters such as `charset`
    /// are ignored.
    pub fn accepts_content_type(&self, header: &str) -> bool {
        if self.content_types.is_empty() {
            return true;
        }
        let essence = mime_essence(header);
        self.content_types.iter().any(|accepted| {
            accepted == "*/*"
                || *accepted == essence
                || accepted
                    .strip_suffix("/*")
                    .is_some_and(|ty| essence.split('/').next() == Some(ty))
        })
    }
}

/// `text/html; charset=utf-8` → `text/html`.
pub fn mime_essence(header: &str) -> String {
    header
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// A queue and the handler consuming it.
#[derive(Debug, Clone)]
pub struct QueueDefinition {
    pub name: String,
    pub fifo: bool,
    pub handler: String,
    pub timeout: Duration,
}

/// A cron-triggered job.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub name: String,
    pub expression: String,
    pub recurrence: Recurrence,
    pub handler: String,
    /// Effective timeout, never longer than `interval`.
    pub timeout: Duration,
    /// Smallest spacing between two consecutive firings.
    pub interval: Duration,
}

/// The WebSocket message route.
#[derive(Debug, Clone)]
pub struct SocketRoute {
    pub path: String,
    pub handler: String,
    pub timeout: Duration,
}

/// Global ceiling derived from every target in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub max_timeout: Duration,
    pub memory_mb: u32,
}
