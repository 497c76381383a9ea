//! Background maintenance: queue hygiene, counter reconciliation, and
//! the daily quota reset at local midnight.
//!
//! Each loop is a thin timer around a testable pass function.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::storage::schedules::{self, ScheduleStatus};
use crate::storage::{accounts, api_profiles, comments};

use super::{driver::ScheduleDriver, EngineContext};

/// Tracker compaction keeps this many entries per schedule.
const TRACKER_KEEP_TOP: usize = 32;

/// Periodic cleanup: dead jobs, orphaned job chains, tracker compaction.
pub async fn run_maintenance_loop(ctx: EngineContext, cancel: CancellationToken) {
    let interval = Duration::from_secs(ctx.config.maintenance.maintenance_interval_secs);
    tracing::info!(interval_secs = interval.as_secs(), "Maintenance loop started");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
        if let Err(e) = maintenance_pass(&ctx).await {
            tracing::warn!(error = %e, "Maintenance pass failed");
        }
    }
    tracing::info!("Maintenance loop stopped");
}

/// One maintenance sweep.
pub async fn maintenance_pass(ctx: &EngineContext) -> Result<(), EngineError> {
    let purged = ctx.queue.purge_dead().await?;
    if purged > 0 {
        tracing::info!(purged, "Purged dead jobs");
    }

    // Job chains whose schedule is gone or no longer active are orphans.
    let mut orphaned = 0u64;
    for schedule in schedules::list_schedules(&ctx.db).await? {
        if schedule.status == ScheduleStatus::Active {
            continue;
        }
        for prefix in [
            format!("immediate-{}", schedule.id),
            format!("once-{}", schedule.id),
            format!("interval-{}-", schedule.id),
            format!("cron-{}-", schedule.id),
        ] {
            orphaned += ctx.queue.remove_by_prefix(&prefix).await?;
        }
    }
    if orphaned > 0 {
        tracing::info!(orphaned, "Removed orphaned schedule jobs");
    }

    ctx.tracker.compact(TRACKER_KEEP_TOP);
    Ok(())
}

/// Periodic reconciliation of schedule counters against comment rows.
pub async fn run_reconcile_loop(ctx: EngineContext, cancel: CancellationToken) {
    let interval = Duration::from_secs(ctx.config.maintenance.reconcile_interval_secs);
    tracing::info!(interval_secs = interval.as_secs(), "Reconciliation loop started");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
        if let Err(e) = reconcile_pass(&ctx).await {
            tracing::warn!(error = %e, "Reconciliation pass failed");
        }
    }
    tracing::info!("Reconciliation loop stopped");
}

/// Overwrite drifted progress counters with the row truth.
pub async fn reconcile_pass(ctx: &EngineContext) -> Result<u32, EngineError> {
    let mut corrected = 0u32;
    for schedule in schedules::list_schedules(&ctx.db).await? {
        let counts = comments::status_counts(&ctx.db, schedule.id).await?;
        let drifted = schedule.total_comments != counts.total
            || schedule.posted_comments != counts.posted
            || schedule.failed_comments != counts.failed;
        if drifted {
            tracing::warn!(
                schedule_id = schedule.id,
                stored_total = schedule.total_comments,
                actual_total = counts.total,
                stored_posted = schedule.posted_comments,
                actual_posted = counts.posted,
                "Counter drift detected, reconciling"
            );
            schedules::set_counters(
                &ctx.db,
                schedule.id,
                counts.total,
                counts.posted,
                counts.failed,
            )
            .await?;
            corrected += 1;
        }
    }
    Ok(corrected)
}

/// Daily reset at local midnight in the configured timezone.
pub async fn run_daily_reset_loop(
    ctx: EngineContext,
    driver: Arc<ScheduleDriver>,
    cancel: CancellationToken,
) {
    let tz: chrono_tz::Tz = ctx
        .config
        .maintenance
        .quota_reset_timezone
        .parse()
        .unwrap_or(chrono_tz::UTC);
    tracing::info!(timezone = %tz, "Daily reset loop started");

    loop {
        let wait = until_next_midnight(tz);
        tracing::debug!(wait_secs = wait.as_secs(), "Sleeping until local midnight");
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(wait) => {}
        }
        if let Err(e) = daily_reset_pass(&ctx, &driver).await {
            tracing::warn!(error = %e, "Daily reset failed");
        }
    }
    tracing::info!("Daily reset loop stopped");
}

/// The midnight reset: quotas, account statuses, and parked schedules.
pub async fn daily_reset_pass(
    ctx: &EngineContext,
    driver: &ScheduleDriver,
) -> Result<(), EngineError> {
    let profiles = api_profiles::reset_all_quotas(&ctx.db).await?;
    let restored = accounts::daily_reset(&ctx.db).await?;
    let reactivated = schedules::daily_reactivate(&ctx.db).await?;

    tracing::info!(
        profiles,
        accounts = restored,
        schedules = reactivated.len(),
        "Daily reset applied"
    );

    // Reactivated schedules need their job chains re-materialized.
    for schedule_id in reactivated {
        if let Err(e) = driver.setup_schedule_job(schedule_id).await {
            tracing::warn!(schedule_id, error = %e, "Re-materialization after reset failed");
        }
    }
    Ok(())
}

/// Time until the next local midnight in `tz`.
fn until_next_midnight(tz: chrono_tz::Tz) -> Duration {
    let now_local = Utc::now().with_timezone(&tz);
    let tomorrow = now_local.date_naive() + chrono::Days::new(1);
    let midnight_naive = tomorrow.and_hms_opt(0, 0, 0).expect("midnight exists");

    // DST gaps can make 00:00 nonexistent; take the earliest valid
    // instant, or fall back an hour forward.
    let midnight = match tz.from_local_datetime(&midnight_naive).earliest() {
        Some(t) => t,
        None => tz
            .from_local_datetime(&(midnight_naive + chrono::Duration::hours(1)))
            .earliest()
            .unwrap_or_else(|| now_local + chrono::Duration::hours(24)),
    };

    (midnight.with_timezone(&Utc) - Utc::now())
        .to_std()
        .unwrap_or(Duration::from_secs(1))
}
