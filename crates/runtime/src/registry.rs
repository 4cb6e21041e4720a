//! Handler modules and the directory middleware around them.
//!
//! Handlers are registered under the identifiers the manifest uses
//! (`api/users/[id]/index`). Middleware can be exported by the handler
//! module itself or by any ancestor directory. When a handler is loaded the
//! bundles are merged nearest-first: the module's own hooks, then the
//! deepest directory, up to the top-level directory, then the runtime
//! defaults. The merged directory chain is cached per identifier.

use std::{collections::HashMap, future::Future, sync::Arc};

use {
    dashmap::DashMap,
    serde_json::Value,
    tracing::{debug, warn},
};

use switchyard_manifest::Manifest;

use crate::{
    context::Context,
    error::{HandlerError, HandlerKind, LoadError},
    http::{HttpResponse, Request},
    middleware::{HookFuture, Middleware},
    queue::JobMetadata,
    schedule::ScheduleMetadata,
    socket::SocketMessage,
};

pub type HttpHandler = Arc<dyn Fn(Context, Arc<Request>) -> HookFuture<HttpResponse> + Send + Sync>;
pub type JobHandler = Arc<dyn Fn(Context, Value, JobMetadata) -> HookFuture<()> + Send + Sync>;
pub type ScheduleHandler = Arc<dyn Fn(Context, ScheduleMetadata) -> HookFuture<()> + Send + Sync>;
/// Returns the reply to send back on the connection, if any.
pub type SocketHandler =
    Arc<dyn Fn(Context, Arc<SocketMessage>) -> HookFuture<Option<Value>> + Send + Sync>;

#[derive(Clone)]
pub enum Handler {
    Http(HttpHandler),
    Job(JobHandler),
    Schedule(ScheduleHandler),
    Socket(SocketHandler),
}

impl Handler {
    pub fn kind(&self) -> HandlerKind {
        match self {
            Self::Http(_) => HandlerKind::Http,
            Self::Job(_) => HandlerKind::Job,
            Self::Schedule(_) => HandlerKind::Schedule,
            Self::Socket(_) => HandlerKind::Socket,
        }
    }
}

/// A handler together with its fully merged middleware.
#[derive(Clone)]
pub struct Loaded<H> {
    pub handler: H,
    pub middleware: Middleware,
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
    module_middleware: HashMap<String, Middleware>,
    directory_middleware: HashMap<String, Middleware>,
    merged: DashMap<String, Arc<Middleware>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Registration ───────────────────────────────────────────────────────

    pub fn register(&mut self, id: &str, handler: Handler) -> &mut Self {
        self.handlers.insert(normalize(id).to_string(), handler);
        self.merged.clear();
        self
    }

    pub fn http<F, Fut>(&mut self, id: &str, handler: F) -> &mut Self
    where
        F: Fn(Context, Arc<Request>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse, HandlerError>> + Send + 'static,
    {
        self.register(id, Handler::Http(Arc::new(move |ctx, req| Box::pin(handler(ctx, req)))))
    }

    pub fn job<F, Fut>(&mut self, id: &str, handler: F) -> &mut Self
    where
        F: Fn(Context, Value, JobMetadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(
            id,
            Handler::Job(Arc::new(move |ctx, payload, meta| Box::pin(handler(ctx, payload, meta)))),
        )
    }

    pub fn schedule<F, Fut>(&mut self, id: &str, handler: F) -> &mut Self
    where
        F: Fn(Context, ScheduleMetadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(
            id,
            Handler::Schedule(Arc::new(move |ctx, meta| Box::pin(handler(ctx, meta)))),
        )
    }

    pub fn socket<F, Fut>(&mut self, id: &str, handler: F) -> &mut Self
    where
        F: Fn(Context, Arc<SocketMessage>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, HandlerError>> + Send + 'static,
    {
        self.register(
            id,
            Handler::Socket(Arc::new(move |ctx, msg| Box::pin(handler(ctx, msg)))),
        )
    }

    /// Middleware exported by the handler module `id` itself.
    pub fn module_middleware(&mut self, id: &str, middleware: Middleware) -> &mut Self {
        self.module_middleware
            .insert(normalize(id).to_string(), middleware);
        self.merged.clear();
        self
    }

    /// Middleware for every handler under `dir`. Accepts `api/users` or
    /// `api/users/_middleware`. The root directory is not a level, so
    /// middleware registered there is dropped with a warning; use
    /// [`crate::RuntimeBuilder::default_middleware`] instead.
    pub fn middleware(&mut self, dir: &str, middleware: Middleware) -> &mut Self {
        let dir = normalize(dir);
        let dir = if dir == "_middleware" {
            ""
        } else {
            dir.strip_suffix("/_middleware").unwrap_or(dir)
        };
        if dir.is_empty() {
            warn!(
                hooks = ?middleware.defined(),
                "root middleware is never applied; register it as default middleware"
            );
            return self;
        }
        self.directory_middleware.insert(dir.to_string(), middleware);
        self.merged.clear();
        self
    }

    // ── Lookup ─────────────────────────────────────────────────────────────

    pub fn contains(&self, id: &str) -> bool {
        self.handlers.contains_key(normalize(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Load a handler of any kind with its middleware layered over `defaults`.
    pub fn load(&self, id: &str, defaults: &Middleware) -> Result<Loaded<Handler>, LoadError> {
        let id = normalize(id);
        let handler = self
            .handlers
            .get(id)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(id.to_string()))?;
        Ok(Loaded {
            handler,
            middleware: self.merged_chain(id).or(defaults),
        })
    }

    pub fn load_http(&self, id: &str, defaults: &Middleware) -> Result<Loaded<HttpHandler>, LoadError> {
        self.load_as(id, defaults, HandlerKind::Http, |h| match h {
            Handler::Http(f) => Some(f),
            _ => None,
        })
    }

    pub fn load_job(&self, id: &str, defaults: &Middleware) -> Result<Loaded<JobHandler>, LoadError> {
        self.load_as(id, defaults, HandlerKind::Job, |h| match h {
            Handler::Job(f) => Some(f),
            _ => None,
        })
    }

    pub fn load_schedule(
        &self,
        id: &str,
        defaults: &Middleware,
    ) -> Result<Loaded<ScheduleHandler>, LoadError> {
        self.load_as(id, defaults, HandlerKind::Schedule, |h| match h {
            Handler::Schedule(f) => Some(f),
            _ => None,
        })
    }

    pub fn load_socket(
        &self,
        id: &str,
        defaults: &Middleware,
    ) -> Result<Loaded<SocketHandler>, LoadError> {
        self.load_as(id, defaults, HandlerKind::Socket, |h| match h {
            Handler::Socket(f) => Some(f),
            _ => None,
        })
    }

    fn load_as<H>(
        &self,
        id: &str,
        defaults: &Middleware,
        expected: HandlerKind,
        pick: impl FnOnce(Handler) -> Option<H>,
    ) -> Result<Loaded<H>, LoadError> {
        let Loaded {
            handler,
            middleware,
        } = self.load(id, defaults)?;
        let found = handler.kind();
        let handler = pick(handler).ok_or_else(|| LoadError::WrongKind {
            id: normalize(id).to_string(),
            expected,
            found,
        })?;
        Ok(Loaded {
            handler,
            middleware,
        })
    }

    /// Check that every handler the manifest references is registered with
    /// the kind its target needs.
    pub fn check(&self, manifest: &Manifest) -> Result<(), Vec<LoadError>> {
        let errors: Vec<LoadError> = manifest
            .handler_refs()
            .into_iter()
            .filter_map(|(target, id)| {
                let expected = match target {
                    "route" => HandlerKind::Http,
                    "queue" => HandlerKind::Job,
                    "schedule" => HandlerKind::Schedule,
                    _ => HandlerKind::Socket,
                };
                let id = normalize(id);
                match self.handlers.get(id) {
                    None => Some(LoadError::NotFound(id.to_string())),
                    Some(handler) if handler.kind() != expected => Some(LoadError::WrongKind {
                        id: id.to_string(),
                        expected,
                        found: handler.kind(),
                    }),
                    Some(_) => None,
                }
            })
            .collect();
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Module middleware merged with every ancestor directory's, excluding
    /// the runtime defaults.
    fn merged_chain(&self, id: &str) -> Arc<Middleware> {
        if let Some(hit) = self.merged.get(id) {
            return Arc::clone(hit.value());
        }
        let mut merged = self.module_middleware.get(id).cloned().unwrap_or_default();
        for dir in ancestors(id) {
            if let Some(level) = self.directory_middleware.get(dir) {
                merged = merged.or(level);
            }
        }
        debug!(handler = id, hooks = ?merged.defined(), "middleware chain resolved");
        let merged = Arc::new(merged);
        self.merged.insert(id.to_string(), Arc::clone(&merged));
        merged
    }
}

fn normalize(id: &str) -> &str {
    id.trim_matches('/')
}

/// `a/b/c` → `a/b`, `a`.
fn ancestors(id: &str) -> impl Iterator<Item = &str> {
    id.char_indices()
        .filter(|(_, c)| *c == '/')
        .map(|(i, _)| &id[..i])
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
}
