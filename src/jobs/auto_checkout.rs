use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::db::store::{retry_once, AttendanceStore};
use crate::models::attendance::{AttendanceRecord, ExitType};
use crate::services::attendance::{AttendanceService, Result};
use crate::services::day_window::DayWindow;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoCheckoutStats {
    pub total_selected: usize,
    pub closed: usize,
    pub already_closed: usize,
    pub failures: usize,
}

enum CloseOutcome {
    Closed,
    AlreadyClosed,
}

/// Force-closes sessions left open past the end of their check-in day.
///
/// Selects open records checked in before the start of the current
/// facility-local day (at most `batch_size`, oldest first). Each is closed at
/// the end of its own check-in day with `exit_type = auto`. Records are
/// updated one at a time and only while still open, so a manual checkout
/// landing first wins and a crash mid-sweep leaves the rest for the next run.
pub async fn run_auto_checkout(
    store: &dyn AttendanceStore,
    now: DateTime<Utc>,
    offset: FixedOffset,
    batch_size: i64,
) -> Result<AutoCheckoutStats> {
    let today = DayWindow::containing(now, offset)?;
    let stale = store.list_open_before(today.start, batch_size).await?;

    let mut stats = AutoCheckoutStats {
        total_selected: stale.len(),
        ..Default::default()
    };

    if stale.is_empty() {
        tracing::debug!("No stale attendance sessions to close");
        return Ok(stats);
    }

    tracing::info!(total = stats.total_selected, "Starting auto-checkout sweep");

    for record in &stale {
        match close_stale_record(store, record, offset).await {
            Ok(CloseOutcome::Closed) => stats.closed += 1,
            Ok(CloseOutcome::AlreadyClosed) => stats.already_closed += 1,
            Err(e) => {
                tracing::error!(
                    record_id = %record.id,
                    subject_id = %record.subject_id,
                    error = %e,
                    "Auto-checkout failed for record, skipping"
                );
                stats.failures += 1;
            }
        }
    }

    tracing::info!(?stats, "Auto-checkout sweep completed");

    Ok(stats)
}

async fn close_stale_record(
    store: &dyn AttendanceStore,
    record: &AttendanceRecord,
    offset: FixedOffset,
) -> Result<CloseOutcome> {
    let cutoff = DayWindow::containing(record.check_in_time, offset)?.end;

    let closed = retry_once("auto_checkout", || {
        store.close_by_id(record.id, cutoff, ExitType::Auto)
    })
    .await?;

    match closed {
        Some(closed) => {
            tracing::debug!(
                record_id = %closed.id,
                subject_id = %closed.subject_id,
                check_out_time = ?closed.check_out_time,
                "Session auto-closed"
            );
            Ok(CloseOutcome::Closed)
        }
        None => Ok(CloseOutcome::AlreadyClosed),
    }
}

/// Starts the cron scheduler that runs the sweep on `schedule`
pub async fn start_scheduler(
    service: AttendanceService,
    schedule: &str,
) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create scheduler: {:?}", e))?;

    let job = Job::new_async(schedule, move |_id, _scheduler| {
        let service = service.clone();
        Box::pin(async move {
            if let Err(e) = service.run_auto_checkout().await {
                tracing::error!(error = %e, "Auto-checkout sweep failed");
            }
        })
    })
    .map_err(|e| anyhow::anyhow!("Invalid auto-checkout schedule {:?}: {:?}", schedule, e))?;

    scheduler
        .add(job)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to register auto-checkout job: {:?}", e))?;
    scheduler
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start scheduler: {:?}", e))?;

    tracing::info!(schedule, "Auto-checkout scheduler started");

    Ok(scheduler)
}
