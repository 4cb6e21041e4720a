//! Queue dispatch: batches of messages, each in its own context.
//!
//! Messages of a standard queue are processed concurrently. FIFO batches are
//! processed in order and stop at the first failure; the rest of the batch
//! is reported as skipped and left for redelivery. Only successfully handled
//! messages are acknowledged.

use std::{sync::Arc, time::Duration};

use {
    bytes::Bytes,
    chrono::{DateTime, Utc},
    futures::future::join_all,
    serde::Serialize,
    serde_json::Value,
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
    tracing::{Instrument, debug, info, info_span, warn},
};

use {
    switchyard_config::LocalQueueConfig,
    switchyard_manifest::{QueueDefinition, model::mime_essence},
};

use crate::{
    context::{Context, Source},
    error::{DispatchError, HandlerError},
    middleware::{JobInfo, JobKind},
    registry::{JobHandler, Loaded},
    runtime::Shared,
    transport::{MemoryQueue, QueueTransport},
};

pub type JobId = String;

/// A message as delivered by the queue transport.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub message_id: String,
    /// Handle used to acknowledge this delivery.
    pub receipt: String,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub receive_count: u32,
    pub sent_at: Option<DateTime<Utc>>,
    pub group_id: Option<String>,
    pub sequence_number: Option<String>,
    pub deduplication_id: Option<String>,
}

/// Delivery details handed to a job handler next to the payload.
#[derive(Debug, Clone, Serialize)]
pub struct JobMetadata {
    pub queue: String,
    pub job_id: String,
    pub receive_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Required for FIFO queues.
    pub group_id: Option<String>,
    /// FIFO only. Defaults to the job id.
    pub deduplication_id: Option<String>,
    pub delay: Option<Duration>,
}

/// Per-message outcome of a batch, by message id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub acknowledged: Vec<String>,
    pub failed: Vec<String>,
    /// FIFO only: messages after a failure that were not attempted.
    pub skipped: Vec<String>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

#[derive(Clone)]
pub struct QueueDispatcher {
    shared: Arc<Shared>,
}

impl QueueDispatcher {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Process a batch received from `queue`.
    ///
    /// Fails as a whole only when the queue or its handler cannot be
    /// resolved, in which case nothing is acknowledged.
    pub async fn dispatch_batch(
        &self,
        queue: &str,
        messages: Vec<QueueMessage>,
    ) -> Result<BatchReport, DispatchError> {
        let span = info_span!("queue", queue, batch = messages.len());
        self.dispatch_batch_inner(queue, messages)
            .instrument(span)
            .await
    }

    async fn dispatch_batch_inner(
        &self,
        queue: &str,
        messages: Vec<QueueMessage>,
    ) -> Result<BatchReport, DispatchError> {
        let definition = self.shared.manifest.resolve_queue(queue)?;
        let loaded = self
            .shared
            .registry
            .load_job(&definition.handler, &self.shared.defaults)
            .inspect_err(|err| {
                warn!(handler = %definition.handler, error = %err, "failed to load job handler");
            })?;

        let mut report = BatchReport::default();
        if definition.fifo {
            let mut pending = messages.into_iter();
            while let Some(message) = pending.next() {
                let id = message.message_id.clone();
                if self.process(definition, &loaded, message).await {
                    report.acknowledged.push(id);
                } else {
                    report.failed.push(id);
                    report.skipped.extend(pending.map(|m| m.message_id));
                    break;
                }
            }
        } else {
            let outcomes = join_all(messages.into_iter().map(|message| {
                let id = message.message_id.clone();
                let loaded = &loaded;
                async move { (id, self.process(definition, loaded, message).await) }
            }))
            .await;
            for (id, acknowledged) in outcomes {
                if acknowledged {
                    report.acknowledged.push(id);
                } else {
                    report.failed.push(id);
                }
            }
        }

        info!(
            acknowledged = report.acknowledged.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "batch processed"
        );
        Ok(report)
    }

    /// Run one message and acknowledge it on success.
    async fn process(
        &self,
        definition: &QueueDefinition,
        loaded: &Loaded<JobHandler>,
        message: QueueMessage,
    ) -> bool {
        let job = JobInfo {
            kind: JobKind::Queue,
            name: definition.name.clone(),
            job_id: message.message_id.clone(),
        };
        let metadata = JobMetadata {
            queue: definition.name.clone(),
            job_id: message.message_id.clone(),
            receive_count: message.receive_count,
            sent_at: message.sent_at,
            group_id: message.group_id.clone(),
            sequence_number: message.sequence_number.clone(),
        };
        let ctx = Context::builder(Source::Queue, Arc::clone(&self.shared.capabilities))
            .timeout(definition.timeout)
            .build();
        let middleware = loaded.middleware.clone();

        let task = {
            let ctx = ctx.clone();
            let middleware = middleware.clone();
            let handler = Arc::clone(&loaded.handler);
            let job = job.clone();
            let body = message.body.clone();
            let content_type = message.content_type.clone();
            async move {
                middleware.job_started(&ctx, &job).await?;
                let payload = decode_payload(&body, content_type.as_deref())?;
                handler(ctx.clone(), payload, metadata).await?;
                middleware.job_finished(&ctx, &job).await?;
                Ok::<_, DispatchError>(())
            }
        };

        match ctx.run(task).await {
            Ok(()) => self.acknowledge(&definition.name, &message).await,
            Err(err) => {
                debug!(job_id = %job.job_id, error = %err, "job failed");
                middleware.report(&ctx, Arc::new(err)).await;
                false
            },
        }
    }

    async fn acknowledge(&self, queue: &str, message: &QueueMessage) -> bool {
        match self
            .shared
            .capabilities
            .queue_transport()
            .acknowledge(queue, &message.receipt)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(job_id = %message.message_id, error = %err, "failed to acknowledge message");
                false
            },
        }
    }
}

/// JSON bodies are parsed; anything else is handed over as a string.
/// Without a declared type, JSON is attempted first.
fn decode_payload(body: &Bytes, content_type: Option<&str>) -> Result<Value, HandlerError> {
    let text = || Value::String(String::from_utf8_lossy(body).into_owned());
    match content_type.map(mime_essence) {
        Some(essence) if essence == "application/json" || essence.ends_with("+json") => {
            serde_json::from_slice(body)
                .map_err(|e| HandlerError::validation(format!("malformed JSON payload: {e}")))
        },
        Some(_) => Ok(text()),
        None => Ok(serde_json::from_slice(body).unwrap_or_else(|_| text())),
    }
}

// ── Local consumer ───────────────────────────────────────────────────────────

/// Poll an in-memory queue and feed it to the dispatcher until `shutdown`.
///
/// Unacknowledged messages go back to the queue after each batch, and are
/// dropped once they have been delivered `max_receive_count` times.
pub fn spawn_local_consumer(
    dispatcher: QueueDispatcher,
    queue: Arc<MemoryQueue>,
    name: String,
    config: LocalQueueConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(config.poll_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debug!(queue = %name, "local consumer started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {},
            }
            let batch = queue.receive(&name, config.batch_size.max(1));
            if batch.is_empty() {
                continue;
            }
            match dispatcher.dispatch_batch(&name, batch).await {
                Ok(report) if report.is_complete() => {},
                Ok(_) => {
                    queue.requeue(&name, config.max_receive_count);
                },
                Err(err) => {
                    warn!(queue = %name, error = %err, "batch dispatch failed");
                    queue.requeue(&name, config.max_receive_count);
                },
            }
        }
        debug!(queue = %name, "local consumer stopped");
    })
}
