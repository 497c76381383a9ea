//! CRUD operations for comment attempt records.
//!
//! One row per post attempt. Status transitions are guarded so a posted
//! comment is never re-posted, and the reconciliation loop reads the
//! per-status counts from here.

use super::{now_ts, DbPool};
use crate::error::StorageError;

/// Lifecycle of a comment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CommentStatus {
    /// Created, awaiting its post-comment job.
    Pending,
    /// Claimed by a posting worker.
    Scheduled,
    /// Posted upstream; `external_id` and `posted_at` are set.
    Posted,
    /// Terminally failed.
    Failed,
}

/// One comment-post attempt.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct Comment {
    /// Internal auto-generated ID.
    pub id: i64,
    /// Owning user.
    pub user_id: i64,
    /// The schedule this attempt belongs to.
    pub schedule_id: i64,
    /// The account chosen for this attempt.
    pub account_id: i64,
    /// Target video.
    pub video_id: String,
    /// Upstream comment id to reply to, if this is a reply.
    pub parent_id: Option<String>,
    /// The comment text as dispatched.
    pub content: String,
    /// Attempt lifecycle.
    pub status: CommentStatus,
    /// When the post-comment job was scheduled to fire.
    pub scheduled_for: Option<String>,
    /// When the comment was posted upstream.
    pub posted_at: Option<String>,
    /// Upstream comment id on success.
    pub external_id: Option<String>,
    /// Failure detail.
    pub error_message: Option<String>,
    /// Attempts consumed.
    pub retry_count: i64,
    /// The account used immediately before this one on the same target.
    pub last_previous_account_id: Option<i64>,
    /// ISO-8601 UTC creation timestamp.
    pub created_at: String,
}

/// Parameters for creating a comment row.
#[derive(Debug, Clone)]
pub struct NewComment<'a> {
    /// Owning user.
    pub user_id: i64,
    /// The schedule dispatching this attempt.
    pub schedule_id: i64,
    /// The chosen account.
    pub account_id: i64,
    /// Target video.
    pub video_id: &'a str,
    /// Upstream comment id to reply to.
    pub parent_id: Option<&'a str>,
    /// The comment text.
    pub content: &'a str,
    /// When the post-comment job will fire.
    pub scheduled_for: Option<&'a str>,
    /// The previously used account on this target.
    pub last_previous_account_id: Option<i64>,
}

/// Insert a pending comment row. Returns the auto-generated ID.
pub async fn insert_comment(pool: &DbPool, new: &NewComment<'_>) -> Result<i64, StorageError> {
    let result = sqlx::query(
        "INSERT INTO comments \
         (user_id, schedule_id, account_id, video_id, parent_id, content, scheduled_for, \
          last_previous_account_id) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(new.user_id)
    .bind(new.schedule_id)
    .bind(new.account_id)
    .bind(new.video_id)
    .bind(new.parent_id)
    .bind(new.content)
    .bind(new.scheduled_for)
    .bind(new.last_previous_account_id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    Ok(result.last_insert_rowid())
}

/// Fetch a comment by id.
pub async fn get_comment(pool: &DbPool, id: i64) -> Result<Option<Comment>, StorageError> {
    sqlx::query_as::<_, Comment>("SELECT * FROM comments WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// Claim a pending comment for posting: `pending` → `scheduled`.
///
/// Returns `false` when the row was not pending, which serializes
/// duplicate deliveries of the same post-comment job.
pub async fn claim_for_posting(pool: &DbPool, id: i64) -> Result<bool, StorageError> {
    let result = sqlx::query(
        "UPDATE comments SET status = 'scheduled' WHERE id = ? AND status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(result.rows_affected() == 1)
}

/// Release a claimed comment back to pending (transient failure, will retry).
pub async fn release_to_pending(pool: &DbPool, id: i64) -> Result<(), StorageError> {
    sqlx::query("UPDATE comments SET status = 'pending' WHERE id = ? AND status = 'scheduled'")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Mark a comment posted with its upstream id.
pub async fn mark_posted(pool: &DbPool, id: i64, external_id: &str) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE comments SET status = 'posted', external_id = ?, posted_at = ? WHERE id = ?",
    )
    .bind(external_id)
    .bind(now_ts())
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Mark a comment failed, recording the error and bumping `retry_count`.
pub async fn mark_failed(pool: &DbPool, id: i64, error: &str) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE comments SET status = 'failed', error_message = ?, \
         retry_count = retry_count + 1 WHERE id = ?",
    )
    .bind(error)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Per-status counts for one schedule, from the actual rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    /// All rows.
    pub total: i64,
    /// Rows with `status = posted`.
    pub posted: i64,
    /// Rows with `status = failed`.
    pub failed: i64,
    /// Rows with `status = pending` or `scheduled`.
    pub in_flight: i64,
}

/// Count a schedule's comments grouped by status.
pub async fn status_counts(pool: &DbPool, schedule_id: i64) -> Result<StatusCounts, StorageError> {
    let rows: Vec<(CommentStatus, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM comments WHERE schedule_id = ? GROUP BY status",
    )
    .bind(schedule_id)
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    let mut counts = StatusCounts::default();
    for (status, n) in rows {
        counts.total += n;
        match status {
            CommentStatus::Posted => counts.posted += n,
            CommentStatus::Failed => counts.failed += n,
            CommentStatus::Pending | CommentStatus::Scheduled => counts.in_flight += n,
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{accounts, init_test_db, schedules, users};

    async fn seed(pool: &DbPool) -> (i64, i64, i64) {
        let uid = users::insert_user(pool, "owner@example.com")
            .await
            .expect("user");
        let aid = accounts::insert_account(
            pool,
            &accounts::NewAccount {
                user_id: uid,
                proxy_id: None,
                api_profile_id: None,
                refresh_token: "rt",
                channel_id: None,
                channel_title: None,
            },
        )
        .await
        .expect("account");
        let sid = schedules::insert_schedule(
            pool,
            &schedules::NewSchedule {
                user_id: uid,
                name: "s".to_string(),
                schedule_type: schedules::ScheduleType::Interval,
                start_date: None,
                end_date: None,
                cron_expression: None,
                interval_value: 2,
                interval_unit: schedules::IntervalUnit::Minutes,
                comment_templates: vec!["t".to_string()],
                target_videos: vec![schedules::TargetVideo {
                    video_id: "v".to_string(),
                    title: None,
                }],
                account_selection: schedules::AccountSelection::Random,
            },
        )
        .await
        .expect("schedule");
        (uid, aid, sid)
    }

    fn sample<'a>(uid: i64, sid: i64, aid: i64) -> NewComment<'a> {
        NewComment {
            user_id: uid,
            schedule_id: sid,
            account_id: aid,
            video_id: "v",
            parent_id: None,
            content: "hello there",
            scheduled_for: None,
            last_previous_account_id: None,
        }
    }

    #[tokio::test]
    async fn claim_is_single_winner() {
        let pool = init_test_db().await.expect("init");
        let (uid, aid, sid) = seed(&pool).await;
        let id = insert_comment(&pool, &sample(uid, sid, aid)).await.expect("insert");

        assert!(claim_for_posting(&pool, id).await.expect("first claim"));
        // A second delivery of the same job loses the claim.
        assert!(!claim_for_posting(&pool, id).await.expect("second claim"));
    }

    #[tokio::test]
    async fn posted_comment_carries_external_id() {
        let pool = init_test_db().await.expect("init");
        let (uid, aid, sid) = seed(&pool).await;
        let id = insert_comment(&pool, &sample(uid, sid, aid)).await.expect("insert");

        claim_for_posting(&pool, id).await.expect("claim");
        mark_posted(&pool, id, "ext-42").await.expect("post");

        let comment = get_comment(&pool, id).await.expect("get").expect("exists");
        assert_eq!(comment.status, CommentStatus::Posted);
        assert_eq!(comment.external_id.as_deref(), Some("ext-42"));
        assert!(comment.posted_at.is_some());
    }

    #[tokio::test]
    async fn failed_comment_bumps_retry_count() {
        let pool = init_test_db().await.expect("init");
        let (uid, aid, sid) = seed(&pool).await;
        let id = insert_comment(&pool, &sample(uid, sid, aid)).await.expect("insert");

        mark_failed(&pool, id, "proxy down").await.expect("fail");
        let comment = get_comment(&pool, id).await.expect("get").expect("exists");
        assert_eq!(comment.status, CommentStatus::Failed);
        assert_eq!(comment.retry_count, 1);
        assert_eq!(comment.error_message.as_deref(), Some("proxy down"));
    }

    #[tokio::test]
    async fn release_returns_to_pending() {
        let pool = init_test_db().await.expect("init");
        let (uid, aid, sid) = seed(&pool).await;
        let id = insert_comment(&pool, &sample(uid, sid, aid)).await.expect("insert");

        claim_for_posting(&pool, id).await.expect("claim");
        release_to_pending(&pool, id).await.expect("release");
        assert!(claim_for_posting(&pool, id).await.expect("re-claim"));
    }

    #[tokio::test]
    async fn status_counts_group_correctly() {
        let pool = init_test_db().await.expect("init");
        let (uid, aid, sid) = seed(&pool).await;

        let a = insert_comment(&pool, &sample(uid, sid, aid)).await.expect("a");
        let b = insert_comment(&pool, &sample(uid, sid, aid)).await.expect("b");
        let _pending = insert_comment(&pool, &sample(uid, sid, aid)).await.expect("c");

        claim_for_posting(&pool, a).await.expect("claim");
        mark_posted(&pool, a, "x").await.expect("post");
        mark_failed(&pool, b, "err").await.expect("fail");

        let counts = status_counts(&pool, sid).await.expect("counts");
        assert_eq!(counts.total, 3);
        assert_eq!(counts.posted, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.in_flight, 1);
    }
}
