//! Scheduled-task poller and next-run computation.
//!
//! The loop raises due tasks into the queue via a callback; execution and
//! run logging live in `dispatch`. Cron expressions are evaluated in the
//! configured IANA timezone.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay_core::task::{ScheduleKind, ScheduledTask, TaskStatus};
use relay_core::traits::Store;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// Invoked for every due task; expected to enqueue execution.
pub type DueTaskFn = Arc<dyn Fn(ScheduledTask) -> BoxFuture<()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub timezone: String,
}

/// Run the scheduler loop until shutdown.
pub async fn run_scheduler_loop(
    config: SchedulerConfig,
    store: Arc<dyn Store>,
    on_due: DueTaskFn,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        timezone = config.timezone.as_str(),
        "scheduler started"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("scheduler shutting down");
                    return;
                }
            }
        }

        let due = match store.get_due_tasks(&relay_core::now_iso()).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(err = %e, "failed to query due tasks");
                continue;
            }
        };
        if !due.is_empty() {
            info!(count = due.len(), "due tasks");
        }

        for task in due {
            // Status may have changed between the query and now (pause or
            // cancel from IPC); re-check before dispatching.
            match store.get_task(&task.id).await {
                Ok(Some(current)) if current.status == TaskStatus::Active => {
                    debug!(task_id = current.id.as_str(), group = current.group_folder.as_str(), "dispatching task");
                    on_due(current).await;
                }
                Ok(Some(_)) => debug!(task_id = task.id.as_str(), "task no longer active"),
                Ok(None) => debug!(task_id = task.id.as_str(), "task deleted"),
                Err(e) => error!(task_id = task.id.as_str(), err = %e, "task re-check failed"),
            }
        }
    }
}

/// Next fire time after a completed run, or `None` when the task is done.
pub fn calculate_next_run(
    kind: ScheduleKind,
    value: &str,
    timezone: &str,
) -> Option<String> {
    match kind {
        ScheduleKind::Cron => {
            let schedule = match cron::Schedule::from_str(&normalize_cron(value)) {
                Ok(s) => s,
                Err(e) => {
                    error!(cron = value, err = %e, "invalid cron expression");
                    return None;
                }
            };
            let tz: chrono_tz::Tz = match timezone.parse() {
                Ok(t) => t,
                Err(_) => {
                    warn!(timezone, "invalid timezone, falling back to UTC");
                    chrono_tz::Tz::UTC
                }
            };
            schedule
                .after(&Utc::now().with_timezone(&tz))
                .next()
                .map(|dt| {
                    dt.with_timezone(&Utc)
                        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
                })
        }
        ScheduleKind::Interval => {
            let ms: i64 = match value.parse() {
                Ok(v) => v,
                Err(e) => {
                    error!(value, err = %e, "invalid interval milliseconds");
                    return None;
                }
            };
            Some(
                (Utc::now() + chrono::Duration::milliseconds(ms))
                    .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            )
        }
        ScheduleKind::Once => None,
    }
}

/// First fire time for a freshly created task.
pub fn initial_next_run(
    kind: ScheduleKind,
    value: &str,
    timezone: &str,
) -> Option<String> {
    match kind {
        ScheduleKind::Once => chrono::DateTime::parse_from_rfc3339(value)
            .map(|dt| {
                dt.with_timezone(&Utc)
                    .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
            })
            .map_err(|e| error!(value, err = %e, "invalid once instant"))
            .ok(),
        other => calculate_next_run(other, value, timezone),
    }
}

/// The `cron` crate wants a seconds field; accept the common five-field form
/// by pinning seconds to zero.
fn normalize_cron(value: &str) -> String {
    let fields = value.split_whitespace().count();
    if fields == 5 {
        format!("0 {value}")
    } else {
        value.to_string()
    }
}

/// Truncated run summary persisted on the task row.
pub fn result_summary(result: Option<&str>, error: Option<&str>) -> String {
    if let Some(e) = error {
        return format!("Error: {e}");
    }
    match result {
        Some(r) if r.chars().count() > 200 => r.chars().take(200).collect(),
        Some(r) => r.to_string(),
        None => "Completed".to_string(),
    }
}
