//! Scheduled job dispatch and the in-process ticker.
//!
//! A firing runs once under the job's timeout. Failures, timeouts included,
//! are reported to `on_error` and never retried.

use std::sync::Arc;

use {
    chrono::{DateTime, Utc},
    serde::Serialize,
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
    tracing::{Instrument, debug, info, info_span, warn},
};

use switchyard_manifest::ScheduledJob;

use crate::{
    context::{Context, Source},
    error::DispatchError,
    middleware::{JobInfo, JobKind},
    runtime::Shared,
};

/// What a schedule handler is told about the firing.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleMetadata {
    pub name: String,
    pub trigger_id: String,
    pub expression: String,
    pub fired_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ScheduleDispatcher {
    shared: Arc<Shared>,
}

impl ScheduleDispatcher {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Run the scheduled job `name` once.
    pub async fn dispatch(&self, name: &str, trigger_id: &str) -> Result<(), DispatchError> {
        let span = info_span!("schedule", name, trigger_id);
        self.dispatch_inner(name, trigger_id)
            .instrument(span)
            .await
    }

    async fn dispatch_inner(&self, name: &str, trigger_id: &str) -> Result<(), DispatchError> {
        let job = self.shared.manifest.resolve_schedule(name)?;
        let loaded = self
            .shared
            .registry
            .load_schedule(&job.handler, &self.shared.defaults)
            .inspect_err(|err| {
                warn!(handler = %job.handler, error = %err, "failed to load schedule handler");
            })?;

        let info = JobInfo {
            kind: JobKind::Schedule,
            name: job.name.clone(),
            job_id: trigger_id.to_string(),
        };
        let metadata = ScheduleMetadata {
            name: job.name.clone(),
            trigger_id: trigger_id.to_string(),
            expression: job.expression.clone(),
            fired_at: Utc::now(),
        };
        let ctx = Context::builder(Source::Schedule, Arc::clone(&self.shared.capabilities))
            .timeout(job.timeout)
            .build();
        let middleware = loaded.middleware;

        let task = {
            let ctx = ctx.clone();
            let middleware = middleware.clone();
            let handler = loaded.handler;
            async move {
                middleware.job_started(&ctx, &info).await?;
                handler(ctx.clone(), metadata).await?;
                middleware.job_finished(&ctx, &info).await?;
                Ok::<_, DispatchError>(())
            }
        };

        match ctx.run(task).await {
            Ok(()) => {
                info!("scheduled job completed");
                Ok(())
            },
            Err(err) => {
                let err = Arc::new(err);
                middleware.report(&ctx, Arc::clone(&err)).await;
                Err(Arc::try_unwrap(err)
                    .unwrap_or_else(|shared| DispatchError::Unhandled(anyhow::anyhow!("{shared}"))))
            },
        }
    }

    /// Fire every scheduled job in the manifest on its recurrence until
    /// `shutdown`. Each firing runs on its own task, so a slow run never
    /// delays the next one.
    pub fn spawn_ticker(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        self.shared
            .manifest
            .schedules()
            .iter()
            .cloned()
            .map(|job| tokio::spawn(tick(self.clone(), job, shutdown.clone())))
            .collect()
    }
}

async fn tick(dispatcher: ScheduleDispatcher, job: ScheduledJob, shutdown: CancellationToken) {
    debug!(schedule = %job.name, expression = %job.expression, "ticker started");
    loop {
        let now = Utc::now();
        let Some(next) = job.recurrence.next_after(now) else {
            warn!(schedule = %job.name, "schedule has no further firings");
            break;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(wait) => {},
        }

        let dispatcher = dispatcher.clone();
        let name = job.name.clone();
        tokio::spawn(async move {
            let trigger_id = uuid::Uuid::new_v4().to_string();
            if let Err(err) = dispatcher.dispatch(&name, &trigger_id).await {
                debug!(schedule = %name, error = %err, "firing failed");
            }
        });
    }
    debug!(schedule = %job.name, "ticker stopped");
}
