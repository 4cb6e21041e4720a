use std::{fmt::Write as _, path::Path, time::Duration};

use {
    anyhow::{Context as _, Result},
    chrono::{DateTime, SecondsFormat, Utc},
    switchyard_manifest::Manifest,
};

pub fn load(path: &Path) -> Result<Manifest> {
    Manifest::load(path).with_context(|| format!("invalid manifest {}", path.display()))
}

pub fn check(manifest: &Manifest) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "manifest OK");
    let _ = writeln!(out, "  routes:    {}", manifest.routes().len());
    let _ = writeln!(out, "  queues:    {}", manifest.queues().len());
    let _ = writeln!(out, "  schedules: {}", manifest.schedules().len());
    let _ = writeln!(out, "  sockets:   {}", manifest.sockets().len());
    let _ = writeln!(
        out,
        "  max timeout: {}",
        human(manifest.limits().max_timeout)
    );
    let mut handlers: Vec<&str> = manifest.handler_refs().into_iter().map(|(_, id)| id).collect();
    handlers.sort_unstable();
    handlers.dedup();
    let _ = writeln!(out, "  handlers:  {}", handlers.len());
    out
}

pub fn routes(manifest: &Manifest, json: bool) -> Result<String> {
    let routes = manifest.routes_by_priority();
    if json {
        let rows: Vec<serde_json::Value> = routes
            .iter()
            .map(|route| {
                serde_json::json!({
                    "path": route.pattern.as_str(),
                    "methods": route.methods.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "content_types": route.content_types,
                    "cors": route.cors,
                    "handler": route.handler,
                    "timeout_ms": u64::try_from(route.timeout.as_millis()).unwrap_or(u64::MAX),
                })
            })
            .collect();
        return Ok(serde_json::to_string_pretty(&rows)? + "\n");
    }

    let width = routes
        .iter()
        .map(|r| r.pattern.as_str().len())
        .max()
        .unwrap_or(0);
    let mut out = String::new();
    for route in routes {
        let methods = route
            .methods
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let _ = writeln!(
            out,
            "{:<width$}  {:<16} {:<8} {}{}",
            route.pattern.as_str(),
            methods,
            human(route.timeout),
            route.handler,
            if route.cors { "  [cors]" } else { "" },
        );
    }
    Ok(out)
}

pub fn schedules(manifest: &Manifest, next: usize) -> String {
    schedules_from(manifest, next, Utc::now())
}

fn schedules_from(manifest: &Manifest, next: usize, now: DateTime<Utc>) -> String {
    let mut out = String::new();
    for job in manifest.schedules() {
        let _ = writeln!(
            out,
            "{}  {}  every >= {}  timeout {}  -> {}",
            job.name,
            job.expression,
            human(job.interval),
            human(job.timeout),
            job.handler,
        );
        let mut cursor = now;
        for _ in 0..next {
            let Some(at) = job.recurrence.next_after(cursor) else {
                break;
            };
            let _ = writeln!(out, "    {}", at.to_rfc3339_opts(SecondsFormat::Secs, true));
            cursor = at;
        }
    }
    out
}

/// `90s` → `1m30s`, `0.25s` → `250ms`.
fn human(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        return format!("{}ms", duration.as_millis());
    }
    let (h, m, s) = (secs / 3600, secs / 60 % 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        let _ = write!(out, "{h}h");
    }
    if m > 0 {
        let _ = write!(out, "{m}m");
    }
    if s > 0 || out.is_empty() {
        let _ = write!(out, "{s}s");
    }
    out
}
