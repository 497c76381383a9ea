//! CRUD operations for comment schedules.
//!
//! Schedules persist the normalized timing form (type + interval columns),
//! JSON template/target pools, progress counters, the sleep-window fields,
//! and five account link tables (selected / principal / secondary and the
//! two rotated sets).

use super::{now_ts, DbPool};
use crate::error::StorageError;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    /// Dispatching.
    Active,
    /// Operator-paused; never touched by automatic resets.
    Paused,
    /// Finished (end date passed or operator action).
    Completed,
    /// Transient failure state.
    Error,
    /// Misconfigured or repeatedly failing; needs operator attention.
    RequiresReview,
}

impl ScheduleStatus {
    /// Wire/display form of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleStatus::Active => "active",
            ScheduleStatus::Paused => "paused",
            ScheduleStatus::Completed => "completed",
            ScheduleStatus::Error => "error",
            ScheduleStatus::RequiresReview => "requires_review",
        }
    }
}

/// How a schedule's firings are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// One batch, now.
    Immediate,
    /// One batch at `start_date`.
    Once,
    /// Cron-driven batches.
    Recurring,
    /// Wall-clock interval batches (recursive-delay loop).
    Interval,
}

/// Unit for interval values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    /// Minutes.
    Minutes,
    /// Hours.
    Hours,
    /// Days.
    Days,
}

impl IntervalUnit {
    /// Milliseconds per unit.
    pub fn millis(self) -> i64 {
        match self {
            IntervalUnit::Minutes => 60_000,
            IntervalUnit::Hours => 3_600_000,
            IntervalUnit::Days => 86_400_000,
        }
    }
}

/// Which accounts a batch draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AccountSelection {
    /// Exactly the selected set.
    Specific,
    /// Random draw from the selected set.
    Random,
    /// Rotate through the selected set.
    RoundRobin,
}

/// Which rotation pool is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActivePool {
    /// The principal pool is dispatching.
    Principal,
    /// The secondary pool is dispatching.
    Secondary,
}

/// The five account link tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountPool {
    /// Accounts eligible for the current batches.
    Selected,
    /// The principal rotation pool.
    Principal,
    /// The secondary rotation pool.
    Secondary,
    /// Principals swapped out in the previous rotation.
    RotatedPrincipal,
    /// Secondaries swapped in in the previous rotation.
    RotatedSecondary,
}

impl AccountPool {
    fn table(self) -> &'static str {
        match self {
            AccountPool::Selected => "schedule_selected_accounts",
            AccountPool::Principal => "schedule_principal_accounts",
            AccountPool::Secondary => "schedule_secondary_accounts",
            AccountPool::RotatedPrincipal => "schedule_rotated_principal",
            AccountPool::RotatedSecondary => "schedule_rotated_secondary",
        }
    }
}

/// A target video entry from the schedule's JSON pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetVideo {
    /// Upstream video ID.
    pub video_id: String,
    /// Optional cached title.
    #[serde(default)]
    pub title: Option<String>,
}

/// A user's declarative posting plan.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct Schedule {
    /// Internal auto-generated ID.
    pub id: i64,
    /// Owning user.
    pub user_id: i64,
    /// Operator-facing name.
    pub name: String,
    /// Lifecycle state.
    pub status: ScheduleStatus,
    /// Firing mode.
    pub schedule_type: ScheduleType,
    /// Earliest firing time (`once`, or deferred `interval` start).
    pub start_date: Option<String>,
    /// After this, the schedule completes on the next tick.
    pub end_date: Option<String>,
    /// Cron expression for `recurring` schedules.
    pub cron_expression: Option<String>,
    /// Interval length in `interval_unit`s.
    pub interval_value: i64,
    /// Interval unit.
    pub interval_unit: IntervalUnit,
    /// Whether each iteration redraws the interval from `[min, max]`.
    pub interval_is_random: bool,
    /// Random interval lower bound.
    pub interval_min: Option<i64>,
    /// Random interval upper bound.
    pub interval_max: Option<i64>,
    /// JSON array of comment templates.
    pub comment_templates: String,
    /// JSON array of [`TargetVideo`].
    pub target_videos: String,
    /// JSON array of target channel IDs.
    pub target_channels: String,
    /// Account draw mode.
    pub account_selection: AccountSelection,
    /// Whether sleep cycles swap principal/secondary pools.
    pub rotation_enabled: bool,
    /// Which rotation pool is live.
    pub currently_active: ActivePool,
    /// When the pools were last swapped.
    pub last_rotated_at: Option<String>,
    /// Synthesize comments with the LLM instead of templates.
    pub use_ai: bool,
    /// Append random emojis to each comment.
    pub include_emojis: bool,
    /// Sleep-window draw lower bound, minutes.
    pub min_delay_minutes: i64,
    /// Sleep-window draw upper bound, minutes.
    pub max_delay_minutes: i64,
    /// Stagger between post-comment jobs within a batch.
    pub between_accounts_ms: i64,
    /// Posts per sleep cycle (0 disables the sleep rule).
    pub limit_value: i64,
    /// Random limit lower bound.
    pub limit_min: Option<i64>,
    /// Random limit upper bound.
    pub limit_max: Option<i64>,
    /// Whether waking redraws `limit_value` from `[min, max]`.
    pub limit_is_random: bool,
    /// Minutes of the current sleep window (0 when not sleeping).
    pub sleep_delay_minutes: i64,
    /// When the current sleep window began. Non-null iff sleeping.
    pub sleep_delay_start_time: Option<String>,
    /// The `posted_comments` value that last triggered sleep (idempotency guard).
    pub last_sleep_trigger_count: i64,
    /// The account used by the most recent dispatch.
    pub last_used_account_id: Option<i64>,
    /// When the next interval batch is due.
    pub next_run_at: Option<String>,
    /// When a batch last ran.
    pub last_processed_at: Option<String>,
    /// Comment rows created.
    pub total_comments: i64,
    /// Comments posted upstream.
    pub posted_comments: i64,
    /// Comments that terminally failed.
    pub failed_comments: i64,
    /// Consecutive handler errors.
    pub error_count: i64,
    /// Operator-facing detail for `error`/`requires_review`.
    pub error_message: Option<String>,
    /// ISO-8601 UTC creation timestamp.
    pub created_at: String,
    /// ISO-8601 UTC last-modified timestamp.
    pub updated_at: String,
}

impl Schedule {
    /// Decode the comment template pool.
    pub fn templates(&self) -> Result<Vec<String>, StorageError> {
        serde_json::from_str(&self.comment_templates).map_err(|source| {
            StorageError::CorruptColumn {
                column: "comment_templates",
                source,
            }
        })
    }

    /// Decode the target video pool.
    pub fn videos(&self) -> Result<Vec<TargetVideo>, StorageError> {
        serde_json::from_str(&self.target_videos).map_err(|source| StorageError::CorruptColumn {
            column: "target_videos",
            source,
        })
    }

    /// Whether a sleep window is currently open.
    pub fn sleeping_at(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        if self.sleep_delay_minutes <= 0 {
            return false;
        }
        match self.sleep_delay_start_time.as_deref().and_then(super::parse_ts) {
            Some(start) => start + chrono::Duration::minutes(self.sleep_delay_minutes) > now,
            None => false,
        }
    }

    /// Whether `end_date` has passed.
    pub fn ended_at(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        match self.end_date.as_deref().and_then(super::parse_ts) {
            Some(end) => end <= now,
            None => false,
        }
    }
}

/// Parameters for creating a schedule.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    /// Owning user.
    pub user_id: i64,
    /// Operator-facing name.
    pub name: String,
    /// Firing mode.
    pub schedule_type: ScheduleType,
    /// Earliest firing time.
    pub start_date: Option<String>,
    /// Completion deadline.
    pub end_date: Option<String>,
    /// Cron expression for `recurring`.
    pub cron_expression: Option<String>,
    /// Interval length.
    pub interval_value: i64,
    /// Interval unit.
    pub interval_unit: IntervalUnit,
    /// Comment template pool.
    pub comment_templates: Vec<String>,
    /// Target video pool.
    pub target_videos: Vec<TargetVideo>,
    /// Account draw mode.
    pub account_selection: AccountSelection,
}

/// Insert a schedule with defaults for everything not in [`NewSchedule`].
/// Returns the auto-generated ID.
pub async fn insert_schedule(pool: &DbPool, new: &NewSchedule) -> Result<i64, StorageError> {
    let templates = serde_json::to_string(&new.comment_templates).map_err(|source| {
        StorageError::CorruptColumn {
            column: "comment_templates",
            source,
        }
    })?;
    let videos =
        serde_json::to_string(&new.target_videos).map_err(|source| StorageError::CorruptColumn {
            column: "target_videos",
            source,
        })?;

    let result = sqlx::query(
        "INSERT INTO schedules \
         (user_id, name, schedule_type, start_date, end_date, cron_expression, \
          interval_value, interval_unit, comment_templates, target_videos, account_selection) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(new.user_id)
    .bind(&new.name)
    .bind(new.schedule_type)
    .bind(&new.start_date)
    .bind(&new.end_date)
    .bind(&new.cron_expression)
    .bind(new.interval_value)
    .bind(new.interval_unit)
    .bind(templates)
    .bind(videos)
    .bind(new.account_selection)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    Ok(result.last_insert_rowid())
}

/// Fetch a schedule by id.
pub async fn get_schedule(pool: &DbPool, id: i64) -> Result<Option<Schedule>, StorageError> {
    sqlx::query_as::<_, Schedule>("SELECT * FROM schedules WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// Fetch a schedule or error with `NotFound`.
pub async fn require_schedule(pool: &DbPool, id: i64) -> Result<Schedule, StorageError> {
    get_schedule(pool, id).await?.ok_or(StorageError::NotFound {
        entity: "schedule",
        id,
    })
}

/// List all active schedules.
pub async fn list_active_schedules(pool: &DbPool) -> Result<Vec<Schedule>, StorageError> {
    sqlx::query_as::<_, Schedule>("SELECT * FROM schedules WHERE status = 'active' ORDER BY id")
        .fetch_all(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// List all schedules (for status display).
pub async fn list_schedules(pool: &DbPool) -> Result<Vec<Schedule>, StorageError> {
    sqlx::query_as::<_, Schedule>("SELECT * FROM schedules ORDER BY id")
        .fetch_all(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// Set schedule status, optionally recording an operator-facing message.
pub async fn set_status(
    pool: &DbPool,
    id: i64,
    status: ScheduleStatus,
    message: Option<&str>,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE schedules SET status = ?, error_message = COALESCE(?, error_message), \
         updated_at = ? WHERE id = ?",
    )
    .bind(status)
    .bind(message)
    .bind(now_ts())
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Persist the next interval firing time.
pub async fn set_next_run_at(
    pool: &DbPool,
    id: i64,
    next_run_at: Option<&str>,
) -> Result<(), StorageError> {
    sqlx::query("UPDATE schedules SET next_run_at = ?, updated_at = ? WHERE id = ?")
        .bind(next_run_at)
        .bind(now_ts())
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Stamp the batch-completed marker.
pub async fn set_last_processed_at(pool: &DbPool, id: i64) -> Result<(), StorageError> {
    sqlx::query("UPDATE schedules SET last_processed_at = ?, updated_at = ? WHERE id = ?")
        .bind(now_ts())
        .bind(now_ts())
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Add to the created-rows counter.
pub async fn add_total_comments(pool: &DbPool, id: i64, n: i64) -> Result<(), StorageError> {
    sqlx::query("UPDATE schedules SET total_comments = total_comments + ? WHERE id = ?")
        .bind(n)
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Increment the posted counter.
pub async fn increment_posted(pool: &DbPool, id: i64) -> Result<(), StorageError> {
    sqlx::query("UPDATE schedules SET posted_comments = posted_comments + 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Increment the failed counter.
pub async fn increment_failed(pool: &DbPool, id: i64) -> Result<(), StorageError> {
    sqlx::query("UPDATE schedules SET failed_comments = failed_comments + 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Increment the handler-error counter and return the new value.
pub async fn increment_error_count(pool: &DbPool, id: i64) -> Result<i64, StorageError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| StorageError::Connection { source: e })?;

    sqlx::query("UPDATE schedules SET error_count = error_count + 1 WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Query { source: e })?;

    let row: (i64,) = sqlx::query_as("SELECT error_count FROM schedules WHERE id = ?")
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StorageError::Query { source: e })?;

    tx.commit()
        .await
        .map_err(|e| StorageError::Connection { source: e })?;
    Ok(row.0)
}

/// Clear the handler-error counter after a clean batch.
pub async fn clear_error_count(pool: &DbPool, id: i64) -> Result<(), StorageError> {
    sqlx::query("UPDATE schedules SET error_count = 0 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Overwrite the progress counters (reconciliation).
pub async fn set_counters(
    pool: &DbPool,
    id: i64,
    total: i64,
    posted: i64,
    failed: i64,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE schedules SET total_comments = ?, posted_comments = ?, failed_comments = ? \
         WHERE id = ?",
    )
    .bind(total)
    .bind(posted)
    .bind(failed)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Enter a sleep window. Sets the idempotency guard, the drawn window
/// length, and the window start in one statement.
pub async fn enter_sleep(
    pool: &DbPool,
    id: i64,
    minutes: i64,
    trigger_count: i64,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE schedules SET sleep_delay_minutes = ?, sleep_delay_start_time = ?, \
         last_sleep_trigger_count = ?, updated_at = ? WHERE id = ?",
    )
    .bind(minutes)
    .bind(now_ts())
    .bind(trigger_count)
    .bind(now_ts())
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Clear the sleep window, optionally redrawing `limit_value`.
pub async fn clear_sleep(
    pool: &DbPool,
    id: i64,
    new_limit_value: Option<i64>,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE schedules SET sleep_delay_minutes = 0, sleep_delay_start_time = NULL, \
         limit_value = COALESCE(?, limit_value), updated_at = ? WHERE id = ?",
    )
    .bind(new_limit_value)
    .bind(now_ts())
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Persist a redrawn random interval value.
pub async fn set_interval_value(pool: &DbPool, id: i64, value: i64) -> Result<(), StorageError> {
    sqlx::query("UPDATE schedules SET interval_value = ? WHERE id = ?")
        .bind(value)
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Persist the most recently dispatched account.
pub async fn set_last_used_account(
    pool: &DbPool,
    id: i64,
    account_id: i64,
) -> Result<(), StorageError> {
    sqlx::query("UPDATE schedules SET last_used_account_id = ? WHERE id = ?")
        .bind(account_id)
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Overwrite the comment template pool.
pub async fn set_templates(
    pool: &DbPool,
    id: i64,
    templates: &[String],
) -> Result<(), StorageError> {
    let json =
        serde_json::to_string(templates).map_err(|source| StorageError::CorruptColumn {
            column: "comment_templates",
            source,
        })?;
    sqlx::query("UPDATE schedules SET comment_templates = ? WHERE id = ?")
        .bind(json)
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Daily reset: schedules parked in `error` or `requires_review` return to
/// `active` with a clean error slate. `paused` and `completed` are never
/// touched.
pub async fn daily_reactivate(pool: &DbPool) -> Result<Vec<i64>, StorageError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| StorageError::Connection { source: e })?;

    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT id FROM schedules WHERE status IN ('error', 'requires_review') ORDER BY id",
    )
    .fetch_all(&mut *tx)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    sqlx::query(
        "UPDATE schedules SET status = 'active', error_count = 0, error_message = NULL, \
         updated_at = ? WHERE status IN ('error', 'requires_review')",
    )
    .bind(now_ts())
    .execute(&mut *tx)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    tx.commit()
        .await
        .map_err(|e| StorageError::Connection { source: e })?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

// ---------------------------------------------------------------------------
// Account pools
// ---------------------------------------------------------------------------

/// Account ids in one of the schedule's pools, ascending.
pub async fn get_pool(
    pool: &DbPool,
    schedule_id: i64,
    which: AccountPool,
) -> Result<Vec<i64>, StorageError> {
    let sql = format!(
        "SELECT account_id FROM {} WHERE schedule_id = ? ORDER BY account_id",
        which.table()
    );
    let rows: Vec<(i64,)> = sqlx::query_as(&sql)
        .bind(schedule_id)
        .fetch_all(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

/// Replace one of the schedule's pools.
pub async fn replace_pool(
    pool: &DbPool,
    schedule_id: i64,
    which: AccountPool,
    account_ids: &[i64],
) -> Result<(), StorageError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| StorageError::Connection { source: e })?;
    replace_pool_tx(&mut tx, schedule_id, which, account_ids).await?;
    tx.commit()
        .await
        .map_err(|e| StorageError::Connection { source: e })?;
    Ok(())
}

async fn replace_pool_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    schedule_id: i64,
    which: AccountPool,
    account_ids: &[i64],
) -> Result<(), StorageError> {
    let delete = format!("DELETE FROM {} WHERE schedule_id = ?", which.table());
    sqlx::query(&delete)
        .bind(schedule_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| StorageError::Query { source: e })?;

    let insert = format!(
        "INSERT OR IGNORE INTO {} (schedule_id, account_id) VALUES (?, ?)",
        which.table()
    );
    for account_id in account_ids {
        sqlx::query(&insert)
            .bind(schedule_id)
            .bind(account_id)
            .execute(&mut **tx)
            .await
            .map_err(|e| StorageError::Query { source: e })?;
    }
    Ok(())
}

/// The result of one rotation decision, persisted atomically.
#[derive(Debug, Clone)]
pub struct RotationUpdate {
    /// The new live dispatch set.
    pub selected: Vec<i64>,
    /// Principals swapped out this cycle.
    pub rotated_principal: Vec<i64>,
    /// Secondaries swapped in this cycle.
    pub rotated_secondary: Vec<i64>,
    /// The pool now live.
    pub currently_active: ActivePool,
}

/// Apply a rotation: replace the selected set and both rotated sets, flip
/// `currently_active`, and stamp `last_rotated_at`, all in one transaction.
pub async fn apply_rotation(
    pool: &DbPool,
    schedule_id: i64,
    update: &RotationUpdate,
) -> Result<(), StorageError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| StorageError::Connection { source: e })?;

    replace_pool_tx(&mut tx, schedule_id, AccountPool::Selected, &update.selected).await?;
    replace_pool_tx(
        &mut tx,
        schedule_id,
        AccountPool::RotatedPrincipal,
        &update.rotated_principal,
    )
    .await?;
    replace_pool_tx(
        &mut tx,
        schedule_id,
        AccountPool::RotatedSecondary,
        &update.rotated_secondary,
    )
    .await?;

    sqlx::query(
        "UPDATE schedules SET currently_active = ?, last_rotated_at = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(update.currently_active)
    .bind(now_ts())
    .bind(now_ts())
    .bind(schedule_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    tx.commit()
        .await
        .map_err(|e| StorageError::Connection { source: e })?;
    Ok(())
}
