//! Shared services a context can reach: the manifest, the queue transport,
//! the connection sink and the presence registry.

use std::sync::Arc;

use {
    bytes::Bytes,
    futures::future::join_all,
    serde::Serialize,
    tracing::{Instrument, debug, error, info_span, warn},
};

use switchyard_manifest::{DEFAULT_TIMEOUT, Manifest};

use crate::{
    context::{Context, Identity, IdentitySlot, Source},
    error::DispatchError,
    presence::{PresenceHooks, PresenceRegistry, Transition},
    queue::{EnqueueOptions, JobId},
    transport::{ChannelSink, ConnectionSink, MemoryQueue, OutboundJob, QueueTransport, SinkError},
};

pub struct Capabilities {
    manifest: Arc<Manifest>,
    queue: Arc<dyn QueueTransport>,
    sink: Arc<dyn ConnectionSink>,
    presence: PresenceRegistry,
    hooks: PresenceHooks,
}

impl Capabilities {
    pub fn new(
        manifest: Arc<Manifest>,
        queue: Arc<dyn QueueTransport>,
        sink: Arc<dyn ConnectionSink>,
        hooks: PresenceHooks,
    ) -> Arc<Self> {
        Arc::new(Self {
            manifest,
            queue,
            sink,
            presence: PresenceRegistry::new(),
            hooks,
        })
    }

    /// Capabilities over fresh in-memory transports and no presence hooks.
    pub fn in_memory(manifest: Arc<Manifest>) -> Arc<Self> {
        Self::new(
            manifest,
            Arc::new(MemoryQueue::new()),
            Arc::new(ChannelSink::new()),
            PresenceHooks::default(),
        )
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn queue_transport(&self) -> &Arc<dyn QueueTransport> {
        &self.queue
    }

    pub fn connection_sink(&self) -> &Arc<dyn ConnectionSink> {
        &self.sink
    }

    // ── Queues ─────────────────────────────────────────────────────────────

    pub(crate) async fn enqueue<T: Serialize>(
        &self,
        queue: &str,
        payload: &T,
        options: EnqueueOptions,
    ) -> Result<JobId, DispatchError> {
        let definition = self.manifest.resolve_queue(queue)?;
        if definition.fifo && options.group_id.is_none() {
            return Err(DispatchError::Validation(format!(
                "FIFO queue {queue} requires a group id"
            )));
        }
        let body = serde_json::to_vec(payload).map_err(|e| {
            DispatchError::Validation(format!("job payload is not serializable: {e}"))
        })?;

        let job_id = uuid::Uuid::new_v4().to_string();
        let deduplication_id = definition
            .fifo
            .then(|| options.deduplication_id.unwrap_or_else(|| job_id.clone()));
        let job = OutboundJob {
            job_id: job_id.clone(),
            body: body.into(),
            content_type: "application/json".into(),
            group_id: options.group_id,
            deduplication_id,
            delay: options.delay,
        };

        self.queue
            .send(definition, job)
            .await
            .map_err(DispatchError::Unhandled)?;
        debug!(queue, job_id = %job_id, "job enqueued");
        Ok(job_id)
    }

    // ── Connections ────────────────────────────────────────────────────────

    pub(crate) async fn bind_identity(self: &Arc<Self>, connection_id: &str, identity: Identity) {
        let transitions = self.presence.authenticate(connection_id, identity).await;
        self.fire(transitions).await;
    }

    /// Forget a connection, firing `on_offline` if it was the identity's last.
    pub(crate) async fn drop_connection(self: &Arc<Self>, connection_id: &str) {
        if let Some(transition) = self.presence.disconnect(connection_id).await {
            self.fire(vec![transition]).await;
        }
    }

    pub(crate) async fn send_to_identity(self: &Arc<Self>, identity_id: &str, payload: Bytes) -> usize {
        let connections = self.presence.connections_for(identity_id).await;
        self.send_to_connections(&connections, payload).await
    }

    /// Fan out to `connection_ids`. Connections the sink reports as gone
    /// are dropped from presence.
    pub(crate) async fn send_to_connections(
        self: &Arc<Self>,
        connection_ids: &[String],
        payload: Bytes,
    ) -> usize {
        let results = join_all(connection_ids.iter().map(|connection_id| {
            let payload = payload.clone();
            async move { (connection_id, self.sink.send(connection_id, payload).await) }
        }))
        .await;

        let mut delivered = 0;
        for (connection_id, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(SinkError::Gone(_)) => {
                    debug!(connection_id = %connection_id, "dropping stale connection");
                    self.drop_connection(connection_id).await;
                },
                Err(SinkError::Other(err)) => {
                    warn!(connection_id = %connection_id, error = %err, "failed to deliver message");
                },
            }
        }
        delivered
    }

    pub(crate) async fn close_connections(self: &Arc<Self>, connection_ids: &[String]) {
        for connection_id in connection_ids {
            match self.sink.close(connection_id).await {
                Ok(()) | Err(SinkError::Gone(_)) => {},
                Err(SinkError::Other(err)) => {
                    warn!(connection_id = %connection_id, error = %err, "failed to close connection");
                },
            }
            self.drop_connection(connection_id).await;
        }
    }

    // ── Presence hooks ─────────────────────────────────────────────────────

    fn hook_timeout(&self) -> std::time::Duration {
        self.manifest
            .resolve_socket()
            .map_or(DEFAULT_TIMEOUT, |route| route.timeout)
    }

    /// Run the hook for each transition on its own task with its own
    /// context, so it is never nested inside the triggering handler.
    async fn fire(self: &Arc<Self>, transitions: Vec<Transition>) {
        for transition in transitions {
            let Some(hook) = self.hooks.for_transition(&transition).cloned() else {
                continue;
            };
            let (label, identity) = match transition {
                Transition::Online(identity) => ("online", identity),
                Transition::Offline(identity) => ("offline", identity),
            };
            let ctx = Context::builder(Source::Socket, Arc::clone(self))
                .timeout(self.hook_timeout())
                .identity(IdentitySlot::Known(identity.clone()))
                .build();
            let span = info_span!("presence", transition = label, identity = %identity.id);
            let task = tokio::spawn(
                async move {
                    let future = hook(ctx.clone(), identity);
                    ctx.run(async move { future.await.map_err(DispatchError::from) })
                        .await
                }
                .instrument(span),
            );
            match task.await {
                Ok(Ok(())) => {},
                Ok(Err(err)) => error!(transition = label, error = %err, "presence hook failed"),
                Err(err) => error!(transition = label, error = %err, "presence hook task failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::atomic::{AtomicUsize, Ordering},
        switchyard_manifest::ManifestFile,
    };

    fn manifest() -> Arc<Manifest> {
        let file: ManifestFile = serde_json::from_value(serde_json::json!({
            "queues": [
                { "name": "emails", "handler": "jobs/email" },
                { "name": "orders.fifo", "fifo": true, "handler": "jobs/order" }
            ]
        }))
        .unwrap();
        Arc::new(Manifest::from_file(file).unwrap())
    }

    #[tokio::test]
    async fn enqueue_validates_queue_and_group() {
        let queue = Arc::new(MemoryQueue::new());
        let caps = Capabilities::new(
            manifest(),
            Arc::clone(&queue) as Arc<dyn QueueTransport>,
            Arc::new(ChannelSink::new()),
            PresenceHooks::default(),
        );

        let missing = caps
            .enqueue("nope", &1, EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(missing, DispatchError::Resolution(_)));

        let no_group = caps
            .enqueue("orders.fifo", &1, EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(no_group, DispatchError::Validation(_)));

        let job_id = caps
            .enqueue("orders.fifo", &serde_json::json!({"n": 1}), EnqueueOptions {
                group_id: Some("customer-1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let delivered = queue.receive("orders.fifo", 1);
        assert_eq!(delivered[0].message_id, job_id);
        assert_eq!(delivered[0].deduplication_id.as_deref(), Some(job_id.as_str()));
        assert_eq!(delivered[0].body.as_ref(), br#"{"n":1}"#);

        caps.enqueue("emails", &"hello", EnqueueOptions::default())
            .await
            .unwrap();
        assert!(queue.receive("emails", 1)[0].deduplication_id.is_none());
    }

    #[tokio::test]
    async fn stale_connections_are_dropped_on_fan_out() {
        let offline = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&offline);
        let sink = Arc::new(ChannelSink::new());
        let caps = Capabilities::new(
            manifest(),
            Arc::new(MemoryQueue::new()),
            Arc::clone(&sink) as Arc<dyn ConnectionSink>,
            PresenceHooks::new().on_offline(move |_ctx, _identity| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let mut live = sink.open("live");
        let stale = sink.open("stale");
        drop(stale);
        caps.presence().connect("live").await;
        caps.presence().connect("stale").await;
        caps.bind_identity("live", Identity::new("alice")).await;
        caps.bind_identity("stale", Identity::new("alice")).await;

        let delivered = caps
            .send_to_identity("alice", Bytes::from_static(b"ping"))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(live.recv().await.unwrap(), Bytes::from_static(b"ping"));
        assert_eq!(caps.presence().connections_for("alice").await, vec!["live"]);
        assert_eq!(offline.load(Ordering::SeqCst), 0);

        caps.close_connections(&["live".to_string()]).await;
        assert_eq!(offline.load(Ordering::SeqCst), 1);
        assert!(live.recv().await.is_none());
    }
}
