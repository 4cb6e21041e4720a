//! Dispatch runtime: turns HTTP requests, queue batches, schedule firings and
//! socket frames into handler invocations, each inside its own execution
//! context.
//!
//! ```text
//! manifest ──► Runtime::builder(..).registry(..).build()
//!                 ├─ HttpDispatcher      (routes)
//!                 ├─ QueueDispatcher     (queues)
//!                 ├─ ScheduleDispatcher  (schedules)
//!                 └─ SocketDispatcher    (socket route + presence)
//! ```

pub mod capabilities;
pub mod context;
pub mod error;
pub mod http;
pub mod middleware;
pub mod presence;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod schedule;
pub mod server;
pub mod socket;
pub mod transport;

pub use {
    capabilities::Capabilities,
    context::{Context, Identity, IdentitySlot, Source},
    error::{DispatchError, HandlerError, HandlerKind, LoadError},
    http::{HttpDispatcher, HttpRequest, HttpResponse, Request},
    middleware::{Inbound, JobInfo, JobKind, Middleware},
    presence::{PresenceHooks, PresenceRegistry, Transition},
    queue::{BatchReport, EnqueueOptions, JobMetadata, QueueDispatcher, QueueMessage},
    registry::{Handler, HandlerRegistry},
    runtime::{BuildError, Runtime, RuntimeBuilder},
    schedule::{ScheduleDispatcher, ScheduleMetadata},
    server::{build_app, serve},
    socket::{SocketDispatcher, SocketMessage},
    transport::{ChannelSink, ConnectionSink, MemoryQueue, QueueTransport, SinkError},
};
