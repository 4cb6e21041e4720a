//! In-process transports for local development and tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::Duration,
};

use {
    async_trait::async_trait,
    bytes::Bytes,
    chrono::Utc,
    dashmap::DashMap,
    tokio::{sync::mpsc, time::Instant},
    tracing::{debug, warn},
};

use switchyard_manifest::QueueDefinition;

use crate::{
    queue::QueueMessage,
    transport::{ConnectionSink, OutboundJob, QueueTransport, SinkError},
};

// ── Queue ────────────────────────────────────────────────────────────────────

/// How long a FIFO deduplication id suppresses repeats, as on SQS.
pub const DEDUPLICATION_WINDOW: Duration = Duration::from_secs(5 * 60);

struct Stored {
    order: u64,
    available_at: Instant,
    message: QueueMessage,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    in_flight: Vec<(String, Stored)>,
    next_order: u64,
    next_sequence: u64,
    /// Deduplication ids seen within [`DEDUPLICATION_WINDOW`], with the
    /// time each was first accepted.
    deduplication_ids: HashMap<String, Instant>,
}

impl QueueState {
    /// Record `id`, returning `false` if it is still inside its window.
    fn accept_deduplication_id(&mut self, id: &str, now: Instant) -> bool {
        self.deduplication_ids
            .retain(|_, seen| now.duration_since(*seen) < DEDUPLICATION_WINDOW);
        if self.deduplication_ids.contains_key(id) {
            return false;
        }
        self.deduplication_ids.insert(id.to_string(), now);
        true
    }
}

/// Queue transport backed by in-memory deques.
///
/// Received messages stay in flight until acknowledged or handed back with
/// [`MemoryQueue::requeue`]. FIFO queues deduplicate on the deduplication id
/// within [`DEDUPLICATION_WINDOW`] and never deliver a message while an earlier one of its group is in
/// flight.
#[derive(Default)]
pub struct MemoryQueue {
    queues: DashMap<String, QueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take up to `max` deliverable messages, marking them in flight.
    pub fn receive(&self, queue: &str, max: usize) -> Vec<QueueMessage> {
        let Some(mut state) = self.queues.get_mut(queue) else {
            return Vec::new();
        };
        let now = Instant::now();
        let mut blocked: HashSet<String> = state
            .in_flight
            .iter()
            .filter_map(|(_, stored)| stored.message.group_id.clone())
            .collect();

        let mut batch = Vec::new();
        let mut index = 0;
        while batch.len() < max && index < state.ready.len() {
            let candidate = &state.ready[index];
            let group = candidate.message.group_id.clone();
            if group.as_ref().is_some_and(|g| blocked.contains(g)) {
                index += 1;
                continue;
            }
            if candidate.available_at > now {
                blocked.extend(group);
                index += 1;
                continue;
            }
            let Some(mut stored) = state.ready.remove(index) else {
                break;
            };
            let receipt = uuid::Uuid::new_v4().to_string();
            stored.message.receive_count += 1;
            stored.message.receipt = receipt.clone();
            batch.push(stored.message.clone());
            state.in_flight.push((receipt, stored));
        }
        batch
    }

    /// Return every in-flight message of `queue` to the ready list in its
    /// original order. Messages already delivered `max_receive_count` times
    /// are dropped instead. Returns how many were dropped.
    pub fn requeue(&self, queue: &str, max_receive_count: u32) -> usize {
        let Some(mut state) = self.queues.get_mut(queue) else {
            return 0;
        };
        let in_flight = std::mem::take(&mut state.in_flight);
        if in_flight.is_empty() {
            return 0;
        }

        let mut dropped = 0;
        let mut ready: Vec<Stored> = state.ready.drain(..).collect();
        for (_, stored) in in_flight {
            if stored.message.receive_count >= max_receive_count {
                warn!(
                    queue,
                    job_id = %stored.message.message_id,
                    receive_count = stored.message.receive_count,
                    "dropping message after repeated failures"
                );
                dropped += 1;
            } else {
                ready.push(stored);
            }
        }
        ready.sort_by_key(|stored| stored.order);
        state.ready = ready.into();
        dropped
    }

    pub fn pending(&self, queue: &str) -> usize {
        self.queues.get(queue).map_or(0, |state| state.ready.len())
    }

    pub fn in_flight(&self, queue: &str) -> usize {
        self.queues
            .get(queue)
            .map_or(0, |state| state.in_flight.len())
    }
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn send(&self, queue: &QueueDefinition, job: OutboundJob) -> anyhow::Result<()> {
        let now = Instant::now();
        let mut state = self.queues.entry(queue.name.clone()).or_default();
        if let Some(dedup) = job.deduplication_id.as_ref().filter(|_| queue.fifo)
            && !state.accept_deduplication_id(dedup, now)
        {
            debug!(queue = %queue.name, deduplication_id = %dedup, "duplicate job dropped");
            return Ok(());
        }

        state.next_order += 1;
        let order = state.next_order;
        let sequence_number = if queue.fifo {
            state.next_sequence += 1;
            Some(format!("{:020}", state.next_sequence))
        } else {
            None
        };

        state.ready.push_back(Stored {
            order,
            available_at: now + job.delay.unwrap_or_default(),
            message: QueueMessage {
                message_id: job.job_id,
                receipt: String::new(),
                body: job.body,
                content_type: Some(job.content_type),
                receive_count: 0,
                sent_at: Some(Utc::now()),
                group_id: job.group_id,
                sequence_number,
                deduplication_id: job.deduplication_id,
            },
        });
        Ok(())
    }

    async fn acknowledge(&self, queue: &str, receipt: &str) -> anyhow::Result<()> {
        let mut state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| anyhow::anyhow!("unknown queue {queue}"))?;
        let position = state
            .in_flight
            .iter()
            .position(|(r, _)| r == receipt)
            .ok_or_else(|| anyhow::anyhow!("receipt {receipt} is not in flight on {queue}"))?;
        state.in_flight.remove(position);
        Ok(())
    }
}

// ── Sockets ──────────────────────────────────────────────────────────────────

/// Connection sink that forwards payloads into per-connection channels.
///
/// The transport adapter opens a channel per connection and drains it into
/// the real socket.
#[derive(Default)]
pub struct ChannelSink {
    connections: DashMap<String, mpsc::UnboundedSender<Bytes>>,
}

impl ChannelSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, connection_id: &str) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(connection_id.to_string(), tx);
        rx
    }

    /// Drop the sender for a connection. Its receiver sees end-of-stream.
    pub fn forget(&self, connection_id: &str) -> bool {
        self.connections.remove(connection_id).is_some()
    }

    pub fn is_open(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }
}

#[async_trait]
impl ConnectionSink for ChannelSink {
    async fn send(&self, connection_id: &str, payload: Bytes) -> Result<(), SinkError> {
        let sender = self
            .connections
            .get(connection_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SinkError::Gone(connection_id.to_string()))?;
        if sender.send(payload).is_err() {
            self.connections.remove(connection_id);
            return Err(SinkError::Gone(connection_id.to_string()));
        }
        Ok(())
    }

    async fn close(&self, connection_id: &str) -> Result<(), SinkError> {
        if self.forget(connection_id) {
            Ok(())
        } else {
            Err(SinkError::Gone(connection_id.to_string()))
        }
    }
}
