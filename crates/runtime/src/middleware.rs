//! Lifecycle hooks wrapped around handlers.
//!
//! A [`Middleware`] is a bundle of optional hooks. Bundles are layered with
//! [`Middleware::or`]: the more specific bundle keeps its hooks and the
//! fallback fills whatever it leaves unset.

use std::{fmt, future::Future, panic::AssertUnwindSafe, pin::Pin, sync::Arc};

use {
    futures::FutureExt,
    serde::Serialize,
    serde_json::Value,
    tracing::{error, warn},
};

use crate::{
    context::{Context, Identity},
    error::{DispatchError, HandlerError},
    http::{HttpResponse, Request},
    socket::SocketMessage,
};

pub type HookFuture<T> = Pin<Box<dyn Future<Output = Result<T, HandlerError>> + Send>>;

/// The inbound event an `authenticate` hook inspects.
#[derive(Debug, Clone)]
pub enum Inbound {
    Http(Arc<Request>),
    Socket(Arc<SocketMessage>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Queue,
    Schedule,
}

/// What job hooks are told about the job being run.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub kind: JobKind,
    /// Queue or schedule name.
    pub name: String,
    pub job_id: String,
}

pub type AuthenticateHook =
    Arc<dyn Fn(Context, Inbound) -> HookFuture<Option<Identity>> + Send + Sync>;
pub type RequestHook = Arc<dyn Fn(Context, Arc<Request>) -> HookFuture<()> + Send + Sync>;
pub type ResponseHook = Arc<dyn Fn(Context, HttpResponse) -> HookFuture<HttpResponse> + Send + Sync>;
pub type MessageHook = Arc<dyn Fn(Context, Arc<SocketMessage>) -> HookFuture<()> + Send + Sync>;
pub type MessageSentHook = Arc<dyn Fn(Context, Value) -> HookFuture<Value> + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(Context, Arc<DispatchError>) -> HookFuture<()> + Send + Sync>;
pub type JobHook = Arc<dyn Fn(Context, JobInfo) -> HookFuture<()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Middleware {
    pub authenticate: Option<AuthenticateHook>,
    pub on_request: Option<RequestHook>,
    pub on_response: Option<ResponseHook>,
    pub on_message_received: Option<MessageHook>,
    pub on_message_sent: Option<MessageSentHook>,
    pub on_error: Option<ErrorHook>,
    pub on_job_started: Option<JobHook>,
    pub on_job_finished: Option<JobHook>,
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware")
            .field("hooks", &self.defined())
            .finish()
    }
}

impl Middleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default bundle: log every failure that reaches `on_error`.
    pub fn logging() -> Self {
        Self::new().on_error(|ctx, err| async move {
            error!(
                context = %ctx.id(),
                source = ?ctx.source(),
                timed_out = ctx.timed_out(),
                error = %err,
                "invocation failed"
            );
            Ok(())
        })
    }

    /// Layer `self` over `fallback`, hook by hook.
    pub fn or(&self, fallback: &Middleware) -> Middleware {
        Middleware {
            authenticate: self.authenticate.clone().or_else(|| fallback.authenticate.clone()),
            on_request: self.on_request.clone().or_else(|| fallback.on_request.clone()),
            on_response: self.on_response.clone().or_else(|| fallback.on_response.clone()),
            on_message_received: self
                .on_message_received
                .clone()
                .or_else(|| fallback.on_message_received.clone()),
            on_message_sent: self
                .on_message_sent
                .clone()
                .or_else(|| fallback.on_message_sent.clone()),
            on_error: self.on_error.clone().or_else(|| fallback.on_error.clone()),
            on_job_started: self
                .on_job_started
                .clone()
                .or_else(|| fallback.on_job_started.clone()),
            on_job_finished: self
                .on_job_finished
                .clone()
                .or_else(|| fallback.on_job_finished.clone()),
        }
    }

    /// Names of the hooks this bundle defines.
    pub fn defined(&self) -> Vec<&'static str> {
        [
            ("authenticate", self.authenticate.is_some()),
            ("on_request", self.on_request.is_some()),
            ("on_response", self.on_response.is_some()),
            ("on_message_received", self.on_message_received.is_some()),
            ("on_message_sent", self.on_message_sent.is_some()),
            ("on_error", self.on_error.is_some()),
            ("on_job_started", self.on_job_started.is_some()),
            ("on_job_finished", self.on_job_finished.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.defined().is_empty()
    }

    // ── Builders ───────────────────────────────────────────────────────────

    pub fn authenticate<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Context, Inbound) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Identity>, HandlerError>> + Send + 'static,
    {
        self.authenticate = Some(Arc::new(move |ctx, inbound| Box::pin(hook(ctx, inbound))));
        self
    }

    pub fn on_request<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Context, Arc<Request>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.on_request = Some(Arc::new(move |ctx, req| Box::pin(hook(ctx, req))));
        self
    }

    pub fn on_response<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Context, HttpResponse) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse, HandlerError>> + Send + 'static,
    {
        self.on_response = Some(Arc::new(move |ctx, resp| Box::pin(hook(ctx, resp))));
        self
    }

    pub fn on_message_received<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Context, Arc<SocketMessage>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.on_message_received = Some(Arc::new(move |ctx, msg| Box::pin(hook(ctx, msg))));
        self
    }

    /// The hook may rewrite the reply before it is sent.
    pub fn on_message_sent<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.on_message_sent = Some(Arc::new(move |ctx, reply| Box::pin(hook(ctx, reply))));
        self
    }

    pub fn on_error<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Context, Arc<DispatchError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.on_error = Some(Arc::new(move |ctx, err| Box::pin(hook(ctx, err))));
        self
    }

    pub fn on_job_started<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Context, JobInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.on_job_started = Some(Arc::new(move |ctx, job| Box::pin(hook(ctx, job))));
        self
    }

    pub fn on_job_finished<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Context, JobInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.on_job_finished = Some(Arc::new(move |ctx, job| Box::pin(hook(ctx, job))));
        self
    }

    // ── Invocation ─────────────────────────────────────────────────────────

    /// Hand a failure to `on_error`. A hook that fails, panics or outlives
    /// the context's timeout is logged and otherwise ignored.
    pub(crate) async fn report(&self, ctx: &Context, err: Arc<DispatchError>) {
        let Some(hook) = &self.on_error else {
            error!(context = %ctx.id(), error = %err, "invocation failed");
            return;
        };
        let guarded = AssertUnwindSafe(hook(ctx.clone(), Arc::clone(&err))).catch_unwind();
        match tokio::time::timeout(ctx.timeout(), guarded).await {
            Err(_elapsed) => {
                warn!(
                    context = %ctx.id(),
                    error = %err,
                    timeout_ms = u64::try_from(ctx.timeout().as_millis()).unwrap_or(u64::MAX),
                    "on_error hook timed out"
                );
            },
            Ok(Ok(Ok(()))) => {},
            Ok(Ok(Err(hook_err))) => {
                warn!(context = %ctx.id(), error = %err, hook_error = %hook_err, "on_error hook failed");
            },
            Ok(Err(_)) => {
                warn!(context = %ctx.id(), error = %err, "on_error hook panicked");
            },
        }
    }

    pub(crate) async fn job_started(&self, ctx: &Context, job: &JobInfo) -> Result<(), HandlerError> {
        match &self.on_job_started {
            Some(hook) => hook(ctx.clone(), job.clone()).await,
            None => Ok(()),
        }
    }

    pub(crate) async fn job_finished(&self, ctx: &Context, job: &JobInfo) -> Result<(), HandlerError> {
        match &self.on_job_finished {
            Some(hook) => hook(ctx.clone(), job.clone()).await,
            None => Ok(()),
        }
    }
}
