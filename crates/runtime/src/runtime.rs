use std::sync::Arc;

use tracing::info;

use switchyard_manifest::Manifest;

use crate::{
    capabilities::Capabilities,
    error::LoadError,
    http::HttpDispatcher,
    middleware::Middleware,
    presence::PresenceHooks,
    queue::QueueDispatcher,
    registry::HandlerRegistry,
    schedule::ScheduleDispatcher,
    socket::SocketDispatcher,
    transport::{ChannelSink, ConnectionSink, MemoryQueue, QueueTransport},
};

/// State every dispatcher reads.
pub(crate) struct Shared {
    pub(crate) manifest: Arc<Manifest>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) capabilities: Arc<Capabilities>,
    /// Lowest-priority middleware, under every directory level.
    pub(crate) defaults: Middleware,
}

#[derive(Debug, thiserror::Error)]
#[error("{} handler reference(s) failed to resolve: {}", .0.len(), summarize(.0))]
pub struct BuildError(pub Vec<LoadError>);

fn summarize(errors: &[LoadError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct RuntimeBuilder {
    manifest: Arc<Manifest>,
    registry: HandlerRegistry,
    queue: Option<Arc<dyn QueueTransport>>,
    sink: Option<Arc<dyn ConnectionSink>>,
    presence_hooks: PresenceHooks,
    defaults: Middleware,
}

impl RuntimeBuilder {
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Queue transport for `enqueue` and acknowledgements. Defaults to an
    /// in-memory queue served by the local consumer.
    pub fn queue_transport(mut self, transport: Arc<dyn QueueTransport>) -> Self {
        self.queue = Some(transport);
        self
    }

    /// Where socket payloads go. Defaults to a [`ChannelSink`] drained by
    /// the WebSocket adapter.
    pub fn connection_sink(mut self, sink: Arc<dyn ConnectionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn presence_hooks(mut self, hooks: PresenceHooks) -> Self {
        self.presence_hooks = hooks;
        self
    }

    /// Middleware applied under every handler. Hooks left unset fall back
    /// to the logging defaults.
    pub fn default_middleware(mut self, middleware: Middleware) -> Self {
        self.defaults = middleware.or(&Middleware::logging());
        self
    }

    /// Check every manifest handler reference against the registry and
    /// assemble the dispatchers.
    pub fn build(self) -> Result<Runtime, BuildError> {
        self.registry.check(&self.manifest).map_err(BuildError)?;

        let (queue, local_queue): (Arc<dyn QueueTransport>, _) = match self.queue {
            Some(queue) => (queue, None),
            None => {
                let local = Arc::new(MemoryQueue::new());
                (Arc::clone(&local) as Arc<dyn QueueTransport>, Some(local))
            },
        };
        let (sink, channel_sink): (Arc<dyn ConnectionSink>, _) = match self.sink {
            Some(sink) => (sink, None),
            None => {
                let local = Arc::new(ChannelSink::new());
                (Arc::clone(&local) as Arc<dyn ConnectionSink>, Some(local))
            },
        };

        let capabilities = Capabilities::new(
            Arc::clone(&self.manifest),
            queue,
            sink,
            self.presence_hooks,
        );
        let shared = Arc::new(Shared {
            manifest: self.manifest,
            registry: Arc::new(self.registry),
            capabilities,
            defaults: self.defaults,
        });

        info!(
            routes = shared.manifest.routes().len(),
            queues = shared.manifest.queues().len(),
            schedules = shared.manifest.schedules().len(),
            sockets = shared.manifest.sockets().len(),
            "runtime assembled"
        );

        Ok(Runtime {
            http: HttpDispatcher::new(Arc::clone(&shared)),
            queues: QueueDispatcher::new(Arc::clone(&shared)),
            schedules: ScheduleDispatcher::new(Arc::clone(&shared)),
            sockets: SocketDispatcher::new(Arc::clone(&shared)),
            local_queue,
            channel_sink,
            shared,
        })
    }
}

/// A manifest bound to its handlers, with one dispatcher per event source.
pub struct Runtime {
    shared: Arc<Shared>,
    http: HttpDispatcher,
    queues: QueueDispatcher,
    schedules: ScheduleDispatcher,
    sockets: SocketDispatcher,
    local_queue: Option<Arc<MemoryQueue>>,
    channel_sink: Option<Arc<ChannelSink>>,
}

impl Runtime {
    pub fn builder(manifest: Manifest) -> RuntimeBuilder {
        RuntimeBuilder {
            manifest: Arc::new(manifest),
            registry: HandlerRegistry::new(),
            queue: None,
            sink: None,
            presence_hooks: PresenceHooks::default(),
            defaults: Middleware::logging(),
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.shared.manifest
    }

    pub fn capabilities(&self) -> &Arc<Capabilities> {
        &self.shared.capabilities
    }

    pub fn http(&self) -> &HttpDispatcher {
        &self.http
    }

    pub fn queues(&self) -> &QueueDispatcher {
        &self.queues
    }

    pub fn schedules(&self) -> &ScheduleDispatcher {
        &self.schedules
    }

    pub fn sockets(&self) -> &SocketDispatcher {
        &self.sockets
    }

    /// The in-memory queue, when no external transport was configured.
    pub fn local_queue(&self) -> Option<&Arc<MemoryQueue>> {
        self.local_queue.as_ref()
    }

    /// The channel sink, when no external sink was configured.
    pub fn channel_sink(&self) -> Option<&Arc<ChannelSink>> {
        self.channel_sink.as_ref()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("routes", &self.shared.manifest.routes().len())
            .field("local_queue", &self.local_queue.is_some())
            .field("channel_sink", &self.channel_sink.is_some())
            .finish_non_exhaustive()
    }
}
