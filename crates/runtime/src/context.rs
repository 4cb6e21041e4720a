//! Per-invocation execution context.
//!
//! Every inbound event runs inside exactly one [`Context`]. The context owns
//! the deadline, a cancellation token, the caller identity and the handles
//! needed to enqueue jobs or reach socket connections. Handler code running
//! on the context's task can reach it ambiently through [`Context::current`].

use std::{
    fmt,
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};

use {
    bytes::Bytes,
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
    tokio::{task::JoinHandle, time::Instant},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use switchyard_manifest::DEFAULT_TIMEOUT;

use crate::{
    capabilities::Capabilities,
    error::DispatchError,
    queue::{EnqueueOptions, JobId},
};

tokio::task_local! {
    static CURRENT: Context;
}

const FRESH: u8 = 0;
const RUNNING: u8 = 1;
const FINISHED: u8 = 2;

/// Which dispatcher created a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Http,
    Queue,
    Schedule,
    Socket,
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub claims: Map<String, Value>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            claims: Map::new(),
        }
    }

    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.claims.insert(key.into(), value.into());
        self
    }
}

/// Authentication state of a context.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum IdentitySlot {
    /// No authentication has been attempted.
    #[default]
    Unset,
    /// Authentication ran and found no caller.
    Anonymous,
    Known(Identity),
}

impl IdentitySlot {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Self::Known(identity) => Some(identity),
            Self::Unset | Self::Anonymous => None,
        }
    }

    pub fn is_set(&self) -> bool {
        !matches!(self, Self::Unset)
    }
}

struct Inner {
    id: String,
    source: Source,
    connection_id: Option<String>,
    identity: Mutex<IdentitySlot>,
    timeout: Duration,
    deadline: Instant,
    token: CancellationToken,
    state: AtomicU8,
    timed_out: AtomicBool,
    capabilities: Arc<Capabilities>,
}

/// Handle to one invocation's execution context. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("connection_id", &self.inner.connection_id)
            .field("timeout", &self.inner.timeout)
            .finish_non_exhaustive()
    }
}

pub struct ContextBuilder {
    source: Source,
    capabilities: Arc<Capabilities>,
    timeout: Duration,
    connection_id: Option<String>,
    identity: IdentitySlot,
}

impl ContextBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn identity(mut self, identity: IdentitySlot) -> Self {
        self.identity = identity;
        self
    }

    /// The deadline is fixed here, not when the context starts running.
    pub fn build(self) -> Context {
        Context {
            inner: Arc::new(Inner {
                id: uuid::Uuid::new_v4().to_string(),
                source: self.source,
                connection_id: self.connection_id,
                identity: Mutex::new(self.identity),
                timeout: self.timeout,
                deadline: Instant::now() + self.timeout,
                token: CancellationToken::new(),
                state: AtomicU8::new(FRESH),
                timed_out: AtomicBool::new(false),
                capabilities: self.capabilities,
            }),
        }
    }
}

/// Cancels the token and marks the context finished however `run` exits.
struct Finalize<'a>(&'a Inner);

impl Drop for Finalize<'_> {
    fn drop(&mut self) {
        self.0.state.store(FINISHED, Ordering::Release);
        self.0.token.cancel();
    }
}

impl Context {
    pub fn builder(source: Source, capabilities: Arc<Capabilities>) -> ContextBuilder {
        ContextBuilder {
            source,
            capabilities,
            timeout: DEFAULT_TIMEOUT,
            connection_id: None,
            identity: IdentitySlot::Unset,
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    /// Run `task` as this context's unit of work.
    ///
    /// The task is spawned with this context installed as the ambient one.
    /// If the deadline passes first, `Timeout` is returned, the token is
    /// cancelled and the task is left to finish on its own; its eventual
    /// result is discarded. A context runs at most once, and never while
    /// another context is active on the calling task.
    pub async fn run<F, T>(&self, task: F) -> Result<T, DispatchError>
    where
        F: Future<Output = Result<T, DispatchError>> + Send + 'static,
        T: Send + 'static,
    {
        if let Ok(active) = CURRENT.try_with(|ctx| ctx.id().to_string()) {
            warn!(context = %self.inner.id, active = %active, "refusing to start a nested context");
            return Err(DispatchError::NestedContext);
        }
        if self
            .inner
            .state
            .compare_exchange(FRESH, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DispatchError::ContextReused);
        }
        let _finalize = Finalize(&self.inner);

        let mut handle = tokio::spawn(CURRENT.scope(self.clone(), task));
        tokio::select! {
            joined = &mut handle => match joined {
                Ok(result) => result,
                Err(err) if err.is_panic() => {
                    Err(DispatchError::Panicked(panic_message(err.into_panic())))
                },
                Err(err) => Err(DispatchError::Unhandled(anyhow::anyhow!(
                    "handler task did not complete: {err}"
                ))),
            },
            () = tokio::time::sleep_until(self.inner.deadline) => {
                self.inner.timed_out.store(true, Ordering::Release);
                warn!(
                    context = %self.inner.id,
                    source = ?self.inner.source,
                    timeout_ms = self.inner.timeout.as_millis() as u64,
                    "deadline exceeded, abandoning handler"
                );
                Err(DispatchError::Timeout(self.inner.timeout))
            },
        }
    }

    /// The context active on the calling task, if any.
    pub fn current() -> Option<Context> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// Run `task` outside of any context, so it may start a fresh one.
    pub fn exit<F>(task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(task)
    }

    // ── Accessors ──────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn source(&self) -> Source {
        self.inner.source
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.inner.connection_id.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Time left before the deadline, floored at zero.
    pub fn remaining_time(&self) -> Duration {
        self.inner
            .deadline
            .saturating_duration_since(Instant::now())
    }

    pub fn remaining_ms(&self) -> u64 {
        u64::try_from(self.remaining_time().as_millis()).unwrap_or(u64::MAX)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the context times out or finishes.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn timed_out(&self) -> bool {
        self.inner.timed_out.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == FINISHED
    }

    pub fn identity(&self) -> IdentitySlot {
        self.lock_identity().clone()
    }

    pub fn capabilities(&self) -> &Arc<Capabilities> {
        &self.inner.capabilities
    }

    fn lock_identity(&self) -> std::sync::MutexGuard<'_, IdentitySlot> {
        self.inner
            .identity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Capabilities ───────────────────────────────────────────────────────

    /// Record the outcome of authentication. On a socket context a known
    /// identity is also bound to the connection in the presence registry.
    pub async fn authenticate(&self, identity: Option<Identity>) {
        let slot = match &identity {
            Some(identity) => IdentitySlot::Known(identity.clone()),
            None => IdentitySlot::Anonymous,
        };
        *self.lock_identity() = slot;

        if let (Some(identity), Some(connection_id)) = (identity, self.connection_id()) {
            debug!(context = %self.inner.id, connection_id, identity = %identity.id, "binding identity");
            self.inner
                .capabilities
                .bind_identity(connection_id, identity)
                .await;
        }
    }

    /// Submit a job to a queue declared in the manifest.
    pub async fn enqueue<T: Serialize>(
        &self,
        queue: &str,
        payload: &T,
        options: EnqueueOptions,
    ) -> Result<JobId, DispatchError> {
        self.inner
            .capabilities
            .enqueue(queue, payload, options)
            .await
    }

    /// Deliver `payload` to every connection bound to `identity_id`.
    /// Returns the number of connections reached.
    pub async fn send_to_identity(&self, identity_id: &str, payload: impl Into<Bytes>) -> usize {
        self.inner
            .capabilities
            .send_to_identity(identity_id, payload.into())
            .await
    }

    pub async fn send_to_connections(
        &self,
        connection_ids: &[String],
        payload: impl Into<Bytes>,
    ) -> usize {
        self.inner
            .capabilities
            .send_to_connections(connection_ids, payload.into())
            .await
    }

    pub async fn close_connections(&self, connection_ids: &[String]) {
        self.inner
            .capabilities
            .close_connections(connection_ids)
            .await;
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".into()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::atomic::AtomicUsize,
        switchyard_manifest::{Manifest, ManifestFile},
    };

    fn capabilities() -> Arc<Capabilities> {
        let manifest = Manifest::from_file(ManifestFile::default()).unwrap();
        Capabilities::in_memory(Arc::new(manifest))
    }

    fn context(timeout: Duration) -> Context {
        Context::builder(Source::Http, capabilities())
            .timeout(timeout)
            .build()
    }

    #[tokio::test]
    async fn run_returns_task_result_and_finishes() {
        let ctx = context(Duration::from_secs(5));
        let value = ctx.run(async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
        assert!(ctx.is_finished());
        assert!(ctx.is_cancelled());
        assert!(!ctx.timed_out());
    }

    #[tokio::test]
    async fn current_is_visible_inside_the_task_only() {
        assert!(Context::current().is_none());
        let ctx = context(Duration::from_secs(5));
        let expected = ctx.id().to_string();
        let seen = ctx
            .run(async { Ok(Context::current().map(|c| c.id().to_string())) })
            .await
            .unwrap();
        assert_eq!(seen.as_deref(), Some(expected.as_str()));
        assert!(Context::current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_enforced() {
        let ctx = context(Duration::from_millis(50));
        let started = Instant::now();
        let err = ctx
            .run(std::future::pending::<Result<(), DispatchError>>())
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Timeout(t) if t == Duration::from_millis(50)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(60));
        assert!(ctx.timed_out());
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.remaining_time(), Duration::ZERO);
        assert_eq!(ctx.remaining_ms(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_task_keeps_running_and_sees_cancellation() {
        let ctx = context(Duration::from_millis(10));
        let observed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&observed);
        let err = ctx
            .run(async move {
                let ctx = Context::current().ok_or(DispatchError::NestedContext)?;
                ctx.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn remaining_time_counts_down() {
        let ctx = context(Duration::from_secs(30));
        let remaining = ctx.remaining_time();
        assert!(remaining <= Duration::from_secs(30));
        assert!(remaining > Duration::from_secs(29));
    }

    #[tokio::test]
    async fn nested_context_is_rejected_without_running() {
        let outer = context(Duration::from_secs(5));
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let caps = Arc::clone(outer.capabilities());

        let inner_result = outer
            .run(async move {
                let inner = Context::builder(Source::Queue, caps).build();
                let result = inner
                    .run(async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await;
                Ok(result)
            })
            .await
            .unwrap();

        assert!(matches!(inner_result, Err(DispatchError::NestedContext)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exit_allows_a_fresh_context() {
        let outer = context(Duration::from_secs(5));
        let caps = Arc::clone(outer.capabilities());

        let (outside, inner) = outer
            .run(async move {
                let escaped = Context::exit(async move {
                    let outside = Context::current().is_none();
                    let inner = Context::builder(Source::Schedule, caps)
                        .build()
                        .run(async { Ok("inner") })
                        .await;
                    (outside, inner)
                });
                escaped
                    .await
                    .map_err(|e| DispatchError::Unhandled(e.into()))
            })
            .await
            .unwrap();

        assert!(outside);
        assert_eq!(inner.unwrap(), "inner");
    }

    #[tokio::test]
    async fn context_runs_once() {
        let ctx = context(Duration::from_secs(5));
        ctx.run(async { Ok(()) }).await.unwrap();
        let err = ctx.run(async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, DispatchError::ContextReused));
    }

    #[tokio::test]
    async fn panics_are_reported() {
        let ctx = context(Duration::from_secs(5));
        let err = ctx
            .run(async {
                if ctx_is_present() {
                    panic!("handler exploded");
                }
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Panicked(ref m) if m == "handler exploded"));
    }

    fn ctx_is_present() -> bool {
        Context::current().is_some()
    }

    #[tokio::test]
    async fn authenticate_sets_identity_slot() {
        let ctx = context(Duration::from_secs(5));
        assert_eq!(ctx.identity(), IdentitySlot::Unset);
        ctx.authenticate(None).await;
        assert_eq!(ctx.identity(), IdentitySlot::Anonymous);
        ctx.authenticate(Some(Identity::new("u-1").with_claim("role", "admin")))
            .await;
        let slot = ctx.identity();
        let identity = slot.identity().unwrap();
        assert_eq!(identity.id, "u-1");
        assert_eq!(identity.claims["role"], "admin");
    }
}
