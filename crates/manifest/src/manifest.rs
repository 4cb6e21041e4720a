use std::{collections::HashMap, path::Path, str::FromStr, time::Duration};

use {
    chrono::{DateTime, Utc},
    http::Method,
    tracing::debug,
};

use crate::{
    error::ManifestError,
    model::{
        DEFAULT_MEMORY_MB, DEFAULT_TIMEOUT, FIFO_SUFFIX, MAX_TIMEOUT, ManifestFile, QueueDefinition,
        ResourceLimits, Route, ScheduledJob, SocketRoute, mime_essence,
    },
    pattern::{PathParams, RoutePattern},
    recurrence::Recurrence,
};

/// Serialization format of a manifest artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Json,
    Toml,
    Yaml,
}

impl ManifestFormat {
    pub fn from_path(path: &Path) -> Result<Self, ManifestError> {
        match path.extension().and_then(|e| e.to_str()).unwrap_or("json") {
            "json" => Ok(Self::Json),
            "toml" => Ok(Self::Toml),
            "yaml" | "yml" => Ok(Self::Yaml),
            other => Err(ManifestError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// No target matched the inbound event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no {kind} matches {target}")]
pub struct NotFound {
    pub kind: &'static str,
    pub target: String,
}

impl NotFound {
    fn new(kind: &'static str, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
        }
    }
}

/// The route selected for a request path.
#[derive(Debug, Clone)]
pub struct RouteMatch<'a> {
    pub route: &'a Route,
    pub params: PathParams,
    /// Whether the request method is listed on the route. Selection itself
    /// is by path only; a disallowed method is answered with 405.
    pub method_allowed: bool,
}

/// The validated, in-memory manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    routes: Vec<Route>,
    queues: Vec<QueueDefinition>,
    schedules: Vec<ScheduledJob>,
    sockets: Vec<SocketRoute>,
    limits: ResourceLimits,
}

impl Manifest {
    /// Read, parse and validate a manifest file (`.json`, `.toml`, `.yaml`).
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest = Self::from_str_with_format(&raw, ManifestFormat::from_path(path)?)?;
        debug!(
            path = %path.display(),
            routes = manifest.routes.len(),
            queues = manifest.queues.len(),
            schedules = manifest.schedules.len(),
            sockets = manifest.sockets.len(),
            "manifest loaded"
        );
        Ok(manifest)
    }

    pub fn from_str_with_format(raw: &str, format: ManifestFormat) -> Result<Self, ManifestError> {
        let file: ManifestFile = match format {
            ManifestFormat::Json => serde_json::from_str(raw).map_err(|e| ManifestError::Parse {
                format: "json",
                message: e.to_string(),
            })?,
            ManifestFormat::Toml => toml::from_str(raw).map_err(|e| ManifestError::Parse {
                format: "toml",
                message: e.to_string(),
            })?,
            ManifestFormat::Yaml => serde_yaml::from_str(raw).map_err(|e| ManifestError::Parse {
                format: "yaml",
                message: e.to_string(),
            })?,
        };
        Self::from_file(file)
    }

    /// Validate a parsed artifact. Schedule spacing is measured from now.
    pub fn from_file(file: ManifestFile) -> Result<Self, ManifestError> {
        Self::from_file_at(file, Utc::now())
    }

    /// Validate a parsed artifact, measuring schedule spacing from `now`.
    pub fn from_file_at(file: ManifestFile, now: DateTime<Utc>) -> Result<Self, ManifestError> {
        let routes = build_routes(&file)?;
        let queues = build_queues(&file)?;
        let schedules = build_schedules(&file, now)?;
        let sockets = build_sockets(&file)?;

        let max_timeout = routes
            .iter()
            .map(|r| r.timeout)
            .chain(queues.iter().map(|q| q.timeout))
            .chain(schedules.iter().map(|s| s.timeout))
            .chain(sockets.iter().map(|s| s.timeout))
            .max()
            .unwrap_or(DEFAULT_TIMEOUT);

        Ok(Self {
            routes,
            queues,
            schedules,
            sockets,
            limits: ResourceLimits {
                max_timeout,
                memory_mb: file.memory_mb.unwrap_or(DEFAULT_MEMORY_MB),
            },
        })
    }

    /// Select the most specific route whose pattern matches `path`.
    ///
    /// Fewer captured parameters wins; ties go to the longer literal
    /// (parameter-stripped) path, then to declaration order.
    pub fn resolve_route(&self, path: &str, method: &Method) -> Result<RouteMatch<'_>, NotFound> {
        self.routes
            .iter()
            .filter_map(|route| route.pattern.matches(path).map(|params| (route, params)))
            .min_by_key(|(route, params)| {
                (
                    params.len(),
                    std::cmp::Reverse(route.pattern.literal_len()),
                )
            })
            .map(|(route, params)| RouteMatch {
                route,
                params,
                method_allowed: route.allows_method(method),
            })
            .ok_or_else(|| NotFound::new("route", path))
    }

    pub fn resolve_queue(&self, name: &str) -> Result<&QueueDefinition, NotFound> {
        self.queues
            .iter()
            .find(|q| q.name == name)
            .ok_or_else(|| NotFound::new("queue", name))
    }

    pub fn resolve_schedule(&self, name: &str) -> Result<&ScheduledJob, NotFound> {
        self.schedules
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| NotFound::new("schedule", name))
    }

    /// The socket route. Only a single default path is currently produced.
    pub fn resolve_socket(&self) -> Result<&SocketRoute, NotFound> {
        self.sockets
            .first()
            .ok_or_else(|| NotFound::new("socket route", "default"))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Routes ordered the way resolution prefers them.
    pub fn routes_by_priority(&self) -> Vec<&Route> {
        let mut routes: Vec<&Route> = self.routes.iter().collect();
        routes.sort_by_key(|r| r.pattern.rank());
        routes
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn schedules(&self) -> &[ScheduledJob] {
        &self.schedules
    }

    pub fn sockets(&self) -> &[SocketRoute] {
        &self.sockets
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    /// Every handler identifier referenced by the manifest, with the kind of
    /// target that references it.
    pub fn handler_refs(&self) -> Vec<(&'static str, &str)> {
        self.routes
            .iter()
            .map(|r| ("route", r.handler.as_str()))
            .chain(self.queues.iter().map(|q| ("queue", q.handler.as_str())))
            .chain(self.schedules.iter().map(|s| ("schedule", s.handler.as_str())))
            .chain(self.sockets.iter().map(|s| ("socket", s.handler.as_str())))
            .collect()
    }
}

impl FromStr for Manifest {
    type Err = ManifestError;

    /// Parse a JSON manifest.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::from_str_with_format(raw, ManifestFormat::Json)
    }
}

// ── Validation ───────────────────────────────────────────────────────────────

fn checked_timeout(
    kind: &'static str,
    name: &str,
    timeout_ms: Option<u64>,
) -> Result<Option<Duration>, ManifestError> {
    let Some(ms) = timeout_ms else {
        return Ok(None);
    };
    let timeout = Duration::from_millis(ms);
    if timeout.is_zero() {
        return Err(ManifestError::ZeroTimeout {
            kind,
            name: name.to_string(),
        });
    }
    if timeout > MAX_TIMEOUT {
        return Err(ManifestError::TimeoutTooLong {
            kind,
            name: name.to_string(),
            timeout,
            max: MAX_TIMEOUT,
        });
    }
    Ok(Some(timeout))
}

fn require_handler(kind: &'static str, name: &str, handler: &str) -> Result<(), ManifestError> {
    if handler.trim().is_empty() {
        return Err(ManifestError::EmptyHandler {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

fn build_routes(file: &ManifestFile) -> Result<Vec<Route>, ManifestError> {
    let mut seen: HashMap<String, String> = HashMap::new();
    let mut routes = Vec::with_capacity(file.routes.len());

    for entry in &file.routes {
        let pattern = RoutePattern::parse(&entry.path)?;
        if let Some(existing) = seen.insert(pattern.signature(), entry.path.clone()) {
            return Err(ManifestError::DuplicateRoute {
                path: entry.path.clone(),
                existing,
            });
        }
        require_handler("route", &entry.path, &entry.handler)?;

        let methods = entry
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()).map_err(|_| {
                    ManifestError::InvalidMethod {
                        path: entry.path.clone(),
                        method: m.clone(),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        routes.push(Route {
            pattern,
            content_types: entry.content_types.iter().map(|c| mime_essence(c)).collect(),
            methods,
            cors: entry.cors,
            handler: entry.handler.clone(),
            timeout: checked_timeout("route", &entry.path, entry.timeout_ms)?
                .unwrap_or(DEFAULT_TIMEOUT),
        });
    }

    Ok(routes)
}

fn build_queues(file: &ManifestFile) -> Result<Vec<QueueDefinition>, ManifestError> {
    let mut queues: Vec<QueueDefinition> = Vec::with_capacity(file.queues.len());

    for entry in &file.queues {
        if queues.iter().any(|q| q.name == entry.name) {
            return Err(ManifestError::DuplicateName {
                kind: "queue",
                name: entry.name.clone(),
            });
        }
        if entry.fifo != entry.name.ends_with(FIFO_SUFFIX) {
            return Err(ManifestError::FifoSuffix {
                name: entry.name.clone(),
            });
        }
        require_handler("queue", &entry.name, &entry.handler)?;

        queues.push(QueueDefinition {
            name: entry.name.clone(),
            fifo: entry.fifo,
            handler: entry.handler.clone(),
            timeout: checked_timeout("queue", &entry.name, entry.timeout_ms)?
                .unwrap_or(DEFAULT_TIMEOUT),
        });
    }

    Ok(queues)
}

fn build_schedules(
    file: &ManifestFile,
    now: DateTime<Utc>,
) -> Result<Vec<ScheduledJob>, ManifestError> {
    let mut schedules: Vec<ScheduledJob> = Vec::with_capacity(file.schedules.len());

    for entry in &file.schedules {
        if schedules.iter().any(|s| s.name == entry.name) {
            return Err(ManifestError::DuplicateName {
                kind: "schedule",
                name: entry.name.clone(),
            });
        }
        require_handler("schedule", &entry.name, &entry.handler)?;

        let invalid = |source| ManifestError::InvalidSchedule {
            name: entry.name.clone(),
            source,
        };
        let recurrence = Recurrence::parse(&entry.cron).map_err(invalid)?;
        let interval = recurrence.spacing(now).map_err(invalid)?;

        let timeout = match checked_timeout("schedule", &entry.name, entry.timeout_ms)? {
            Some(timeout) if timeout > interval => {
                return Err(ManifestError::TimeoutExceedsInterval {
                    name: entry.name.clone(),
                    timeout,
                    interval,
                });
            },
            Some(timeout) => timeout,
            None => MAX_TIMEOUT.min(interval),
        };

        schedules.push(ScheduledJob {
            name: entry.name.clone(),
            expression: entry.cron.clone(),
            recurrence,
            handler: entry.handler.clone(),
            timeout,
            interval,
        });
    }

    Ok(schedules)
}

fn build_sockets(file: &ManifestFile) -> Result<Vec<SocketRoute>, ManifestError> {
    let mut sockets: Vec<SocketRoute> = Vec::with_capacity(file.sockets.len());

    for entry in &file.sockets {
        if sockets.iter().any(|s| s.path == entry.path) {
            return Err(ManifestError::DuplicateName {
                kind: "socket route",
                name: entry.path.clone(),
            });
        }
        require_handler("socket route", &entry.path, &entry.handler)?;
        sockets.push(SocketRoute {
            path: entry.path.clone(),
            handler: entry.handler.clone(),
            timeout: checked_timeout("socket route", &entry.path, entry.timeout_ms)?
                .unwrap_or(DEFAULT_TIMEOUT),
        });
    }

    Ok(sockets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(json: serde_json::Value) -> Result<Manifest, ManifestError> {
        let file: ManifestFile = serde_json::from_value(json).unwrap();
        let now = DateTime::parse_from_rfc3339("2030-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        Manifest::from_file_at(file, now)
    }

    fn routes(paths: &[&str]) -> Manifest {
        let routes: Vec<_> = paths
            .iter()
            .map(|p| serde_json::json!({ "path": p, "handler": format!("api{p}") }))
            .collect();
        manifest(serde_json::json!({ "routes": routes })).unwrap()
    }

    #[test]
    fn zero_param_route_beats_catch_all() {
        let m = routes(&["/files/:path*", "/files/readme"]);
        let hit = m.resolve_route("/files/readme", &Method::GET).unwrap();
        assert_eq!(hit.route.pattern.as_str(), "/files/readme");
        assert!(hit.params.is_empty());

        let hit = m.resolve_route("/files/docs/intro.md", &Method::GET).unwrap();
        assert_eq!(hit.route.pattern.as_str(), "/files/:path*");
        assert_eq!(hit.params.get("path"), Some("docs/intro.md"));
    }

    #[test]
    fn fewer_params_then_longer_literal() {
        let m = routes(&[
            "/:section/:id",
            "/:section/archive",
            "/projects/:id",
            "/projects/:id/settings",
        ]);
        let hit = m.resolve_route("/projects/archive", &Method::GET).unwrap();
        // Both capture one param; `/projects` is longer than `/archive`.
        assert_eq!(hit.route.pattern.as_str(), "/projects/:id");
        assert_eq!(hit.params.get("id"), Some("archive"));

        let hit = m.resolve_route("/teams/7", &Method::GET).unwrap();
        assert_eq!(hit.route.pattern.as_str(), "/:section/:id");
        assert_eq!(hit.params.get("section"), Some("teams"));
    }

    #[test]
    fn not_found_and_method_flag() {
        let m = routes(&["/users/:id"]);
        let err = m.resolve_route("/nope", &Method::GET).unwrap_err();
        assert_eq!(err.kind, "route");

        let hit = m.resolve_route("/users/1", &Method::POST).unwrap();
        assert!(!hit.method_allowed);
    }

    #[test]
    fn duplicate_routes_rejected_at_load() {
        let err = manifest(serde_json::json!({
            "routes": [
                { "path": "/users/:id", "handler": "a" },
                { "path": "/users/:name/", "handler": "b" },
            ]
        }))
        .unwrap_err();
        assert!(matches!(err, ManifestError::DuplicateRoute { .. }));
    }

    #[test]
    fn route_defaults_and_content_types() {
        let m = manifest(serde_json::json!({
            "routes": [
                { "path": "/upload", "handler": "upload", "methods": ["post", "PUT"],
                  "content_types": ["Image/*", "application/json; charset=utf-8"], "cors": true },
                { "path": "/", "handler": "index" },
            ]
        }))
        .unwrap();
        let upload = &m.routes()[0];
        assert_eq!(upload.methods, vec![Method::POST, Method::PUT]);
        assert!(upload.accepts_content_type("image/png"));
        assert!(upload.accepts_content_type("application/json;charset=UTF-8"));
        assert!(!upload.accepts_content_type("text/plain"));
        assert!(upload.cors);

        let index = &m.routes()[1];
        assert_eq!(index.methods, vec![Method::GET]);
        assert_eq!(index.timeout, DEFAULT_TIMEOUT);
        assert_eq!(index.content_types, vec!["application/json".to_string()]);
    }

    #[test]
    fn queue_validation() {
        let ok = manifest(serde_json::json!({
            "queues": [
                { "name": "orders.fifo", "fifo": true, "handler": "jobs/orders" },
                { "name": "emails", "handler": "jobs/emails", "timeout_ms": 60000 },
            ]
        }))
        .unwrap();
        assert!(ok.resolve_queue("orders.fifo").unwrap().fifo);
        assert_eq!(
            ok.resolve_queue("emails").unwrap().timeout,
            Duration::from_secs(60)
        );
        assert!(ok.resolve_queue("missing").is_err());

        let err = manifest(serde_json::json!({
            "queues": [{ "name": "orders", "fifo": true, "handler": "jobs/orders" }]
        }))
        .unwrap_err();
        assert!(matches!(err, ManifestError::FifoSuffix { .. }));

        let err = manifest(serde_json::json!({
            "queues": [{ "name": "slow", "handler": "jobs/slow", "timeout_ms": 3_600_000 }]
        }))
        .unwrap_err();
        assert!(matches!(err, ManifestError::TimeoutTooLong { .. }));
    }

    #[test]
    fn schedule_timeout_derivation() {
        let m = manifest(serde_json::json!({
            "schedules": [
                { "name": "tick", "cron": "*/5 * * * *", "handler": "cron/tick" },
                { "name": "nightly", "cron": "0 3 * * *", "handler": "cron/nightly" },
                { "name": "report", "cron": "rate(1 hour)", "handler": "cron/report", "timeout_ms": 120000 },
            ]
        }))
        .unwrap();

        let tick = m.resolve_schedule("tick").unwrap();
        assert_eq!(tick.interval, Duration::from_secs(300));
        assert_eq!(tick.timeout, Duration::from_secs(300));

        let nightly = m.resolve_schedule("nightly").unwrap();
        assert_eq!(nightly.timeout, MAX_TIMEOUT);

        let report = m.resolve_schedule("report").unwrap();
        assert_eq!(report.timeout, Duration::from_secs(120));

        assert_eq!(m.limits().max_timeout, MAX_TIMEOUT);
    }

    #[test]
    fn schedule_timeout_longer_than_interval_rejected() {
        let err = manifest(serde_json::json!({
            "schedules": [
                { "name": "tick", "cron": "* * * * *", "handler": "cron/tick", "timeout_ms": 90000 }
            ]
        }))
        .unwrap_err();
        assert!(matches!(err, ManifestError::TimeoutExceedsInterval { .. }));
    }

    #[test]
    fn socket_route_resolution() {
        let empty = manifest(serde_json::json!({})).unwrap();
        assert!(empty.resolve_socket().is_err());
        assert_eq!(empty.limits().memory_mb, DEFAULT_MEMORY_MB);

        let m = manifest(serde_json::json!({
            "sockets": [{ "handler": "socket/index", "timeout_ms": 5000 }],
            "memory_mb": 512
        }))
        .unwrap();
        let socket = m.resolve_socket().unwrap();
        assert_eq!(socket.path, "$default");
        assert_eq!(socket.timeout, Duration::from_secs(5));
        assert_eq!(m.limits().memory_mb, 512);
        assert_eq!(m.limits().max_timeout, Duration::from_secs(5));
    }

    #[test]
    fn loads_from_disk_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.toml");
        std::fs::write(
            &path,
            "[[routes]]\npath = \"/health\"\nhandler = \"api/health\"\n\n[[queues]]\nname = \"jobs\"\nhandler = \"jobs/index\"\n",
        )
        .unwrap();
        let m = Manifest::load(&path).unwrap();
        assert_eq!(m.routes().len(), 1);
        assert_eq!(m.queues().len(), 1);

        let bad = dir.path().join("manifest.txt");
        std::fs::write(&bad, "").unwrap();
        assert!(matches!(
            Manifest::load(&bad),
            Err(ManifestError::UnsupportedFormat(_))
        ));
    }
}
