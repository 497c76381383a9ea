//! CRUD operations for view-simulation schedules.
//!
//! A much simpler plan than comment schedules: target videos, an interval,
//! a probability roll, and the watch-session parameters handed to the
//! viewer service.

use super::schedules::{IntervalUnit, TargetVideo};
use super::DbPool;
use crate::error::StorageError;

/// Lifecycle state of a view schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ViewScheduleStatus {
    /// Dispatching.
    Active,
    /// Operator-paused.
    Paused,
    /// Finished.
    Completed,
}

/// A plan for simulated watch sessions.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct ViewSchedule {
    /// Internal auto-generated ID.
    pub id: i64,
    /// Owning user.
    pub user_id: i64,
    /// Operator-facing name.
    pub name: String,
    /// Lifecycle state.
    pub status: ViewScheduleStatus,
    /// JSON array of [`TargetVideo`].
    pub target_videos: String,
    /// Interval length in `interval_unit`s.
    pub interval_value: i64,
    /// Interval unit.
    pub interval_unit: IntervalUnit,
    /// Percent chance each enqueued view actually runs.
    pub probability: i64,
    /// Minimum watch time handed to the viewer.
    pub min_watch_time_secs: i64,
    /// Maximum watch time handed to the viewer.
    pub max_watch_time_secs: i64,
    /// Also like the video via the API.
    pub auto_like: bool,
    /// When the next tick is due.
    pub next_run_at: Option<String>,
    /// ISO-8601 UTC creation timestamp.
    pub created_at: String,
}

impl ViewSchedule {
    /// Decode the target video pool.
    pub fn videos(&self) -> Result<Vec<TargetVideo>, StorageError> {
        serde_json::from_str(&self.target_videos).map_err(|source| StorageError::CorruptColumn {
            column: "target_videos",
            source,
        })
    }

    /// The full interval in milliseconds.
    pub fn interval_ms(&self) -> i64 {
        self.interval_value * self.interval_unit.millis()
    }
}

/// Parameters for creating a view schedule.
#[derive(Debug, Clone)]
pub struct NewViewSchedule {
    /// Owning user.
    pub user_id: i64,
    /// Operator-facing name.
    pub name: String,
    /// Target video pool.
    pub target_videos: Vec<TargetVideo>,
    /// Interval length.
    pub interval_value: i64,
    /// Interval unit.
    pub interval_unit: IntervalUnit,
    /// Percent chance each view runs.
    pub probability: i64,
    /// Minimum watch time.
    pub min_watch_time_secs: i64,
    /// Maximum watch time.
    pub max_watch_time_secs: i64,
    /// Also like the video.
    pub auto_like: bool,
}

/// Insert a view schedule. Returns the auto-generated ID.
pub async fn insert_view_schedule(
    pool: &DbPool,
    new: &NewViewSchedule,
) -> Result<i64, StorageError> {
    let videos =
        serde_json::to_string(&new.target_videos).map_err(|source| StorageError::CorruptColumn {
            column: "target_videos",
            source,
        })?;

    let result = sqlx::query(
        "INSERT INTO view_schedules \
         (user_id, name, target_videos, interval_value, interval_unit, probability, \
          min_watch_time_secs, max_watch_time_secs, auto_like) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(new.user_id)
    .bind(&new.name)
    .bind(videos)
    .bind(new.interval_value)
    .bind(new.interval_unit)
    .bind(new.probability)
    .bind(new.min_watch_time_secs)
    .bind(new.max_watch_time_secs)
    .bind(new.auto_like)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    Ok(result.last_insert_rowid())
}

/// Fetch a view schedule by id.
pub async fn get_view_schedule(
    pool: &DbPool,
    id: i64,
) -> Result<Option<ViewSchedule>, StorageError> {
    sqlx::query_as::<_, ViewSchedule>("SELECT * FROM view_schedules WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// List all active view schedules.
pub async fn list_active_view_schedules(pool: &DbPool) -> Result<Vec<ViewSchedule>, StorageError> {
    sqlx::query_as::<_, ViewSchedule>(
        "SELECT * FROM view_schedules WHERE status = 'active' ORDER BY id",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

/// Persist the next tick time.
pub async fn set_next_run_at(
    pool: &DbPool,
    id: i64,
    next_run_at: Option<&str>,
) -> Result<(), StorageError> {
    sqlx::query("UPDATE view_schedules SET next_run_at = ? WHERE id = ?")
        .bind(next_run_at)
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{init_test_db, users};

    #[tokio::test]
    async fn insert_list_and_interval_math() {
        let pool = init_test_db().await.expect("init");
        let uid = users::insert_user(&pool, "owner@example.com")
            .await
            .expect("user");

        let id = insert_view_schedule(
            &pool,
            &NewViewSchedule {
                user_id: uid,
                name: "views".to_string(),
                target_videos: vec![
                    TargetVideo {
                        video_id: "a".to_string(),
                        title: None,
                    },
                    TargetVideo {
                        video_id: "b".to_string(),
                        title: None,
                    },
                ],
                interval_value: 10,
                interval_unit: IntervalUnit::Minutes,
                probability: 75,
                min_watch_time_secs: 30,
                max_watch_time_secs: 90,
                auto_like: true,
            },
        )
        .await
        .expect("insert");

        let active = list_active_view_schedules(&pool).await.expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, id);
        assert_eq!(active[0].interval_ms(), 600_000);
        assert_eq!(active[0].videos().expect("videos").len(), 2);
        assert!(active[0].auto_like);
    }
}
