//! Manifest model: the build-time description of every HTTP route, queue,
//! scheduled job and socket route, validated at load and matched at dispatch.

pub mod error;
pub mod manifest;
pub mod model;
pub mod pattern;
pub mod recurrence;

pub use {
    error::ManifestError,
    manifest::{Manifest, ManifestFormat, NotFound, RouteMatch},
    model::{
        DEFAULT_TIMEOUT, FIFO_SUFFIX, MAX_TIMEOUT, ManifestFile, QueueDefinition, ResourceLimits,
        Route, ScheduledJob, SocketRoute,
    },
    pattern::{PathParams, RoutePattern},
    recurrence::Recurrence,
};
