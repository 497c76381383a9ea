//! Schedule driver: materializes active schedules into queue jobs.
//!
//! Each schedule type maps to a job shape (`immediate-<id>`, `once-<id>`,
//! `cron-<id>-<epoch>`, `interval-<id>-<epoch>`). Interval schedules run
//! on a recursive-delay loop: every batch enqueues exactly one follow-up
//! with the batch's own wall time subtracted from the interval, so the
//! cadence absorbs processing time and a restart resumes from the
//! persisted `next_run_at`.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{schedule_processing_key, TtlLock};
use crate::error::EngineError;
use crate::queue::{EnqueueOptions, JobError, JobHandler, JobQueue, JobRecord, SCHEDULE_QUEUE};
use crate::storage::schedules::{self, Schedule, ScheduleStatus, ScheduleType};
use crate::storage::format_ts;

use super::{dispatch, sleep, EngineContext, ProcessSchedulePayload};

/// Lock TTL bounds for the per-schedule processing lock.
const LOCK_TTL_MIN: Duration = Duration::from_secs(10);
const LOCK_TTL_MAX: Duration = Duration::from_secs(3600);

/// Floor for the recursive-delay follow-up.
const FOLLOW_UP_FLOOR_MS: i64 = 1_000;

/// Materializes schedules into jobs and owns the cron task registry.
pub struct ScheduleDriver {
    ctx: EngineContext,
    cancel: CancellationToken,
    cron_tasks: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl ScheduleDriver {
    /// Create a driver. Cron tasks spawned later are children of `cancel`.
    pub fn new(ctx: EngineContext, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            cancel,
            cron_tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Materialize jobs for every active schedule (startup / re-sync).
    pub async fn setup_all_active(&self) -> Result<(), EngineError> {
        let active = schedules::list_active_schedules(&self.ctx.db).await?;
        tracing::info!(count = active.len(), "Materializing active schedules");
        for schedule in active {
            if let Err(e) = self.setup_schedule_job(schedule.id).await {
                tracing::warn!(schedule_id = schedule.id, error = %e, "Failed to set up schedule");
            }
        }
        Ok(())
    }

    /// Ensure exactly one future job chain exists for a schedule.
    ///
    /// No-op when the schedule is not active or a sleep window is open
    /// (the follow-up job is already outstanding).
    pub async fn setup_schedule_job(&self, schedule_id: i64) -> Result<(), EngineError> {
        let Some(schedule) = schedules::get_schedule(&self.ctx.db, schedule_id).await? else {
            return Ok(());
        };
        if schedule.status != ScheduleStatus::Active {
            return Ok(());
        }
        if schedule.sleeping_at(Utc::now()) {
            tracing::debug!(schedule_id, "Schedule sleeping, follow-up already outstanding");
            return Ok(());
        }

        match schedule.schedule_type {
            ScheduleType::Immediate => {
                self.ctx
                    .queue
                    .enqueue(
                        SCHEDULE_QUEUE,
                        &format!("immediate-{schedule_id}"),
                        &ProcessSchedulePayload { schedule_id },
                        EnqueueOptions::default(),
                    )
                    .await?;
            }
            ScheduleType::Once => {
                let delay = schedule
                    .start_date
                    .as_deref()
                    .and_then(crate::storage::parse_ts)
                    .map(|start| (start - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                    .unwrap_or(Duration::ZERO);
                self.ctx
                    .queue
                    .enqueue(
                        SCHEDULE_QUEUE,
                        &format!("once-{schedule_id}"),
                        &ProcessSchedulePayload { schedule_id },
                        EnqueueOptions::delayed(delay),
                    )
                    .await?;
            }
            ScheduleType::Recurring => {
                self.register_cron(&schedule)?;
            }
            ScheduleType::Interval => {
                self.setup_interval_job(&schedule).await?;
            }
        }
        Ok(())
    }

    /// Interval setup: resume from `next_run_at`, honor a future start
    /// date, or give a fresh schedule one full interval of lead time.
    async fn setup_interval_job(&self, schedule: &Schedule) -> Result<(), EngineError> {
        // One outstanding job per chain; a second setup call is a no-op.
        let prefix = format!("interval-{}-", schedule.id);
        if self.ctx.queue.has_live_with_prefix(&prefix).await? {
            tracing::debug!(schedule_id = schedule.id, "Interval chain already live");
            return Ok(());
        }

        let now = Utc::now();
        let interval_ms = schedule.interval_value.max(1) * schedule.interval_unit.millis();

        let delay_ms = if let Some(next) = schedule
            .next_run_at
            .as_deref()
            .and_then(crate::storage::parse_ts)
            .filter(|next| *next > now)
        {
            (next - now).num_milliseconds()
        } else if let Some(start) = schedule
            .start_date
            .as_deref()
            .and_then(crate::storage::parse_ts)
            .filter(|start| *start > now)
        {
            (start - now).num_milliseconds()
        } else if schedule.posted_comments == 0 {
            // A fresh schedule waits out one full interval before its
            // first batch, and the resume point is persisted.
            schedules::set_next_run_at(
                &self.ctx.db,
                schedule.id,
                Some(&format_ts(now + chrono::Duration::milliseconds(interval_ms))),
            )
            .await?;
            interval_ms
        } else {
            0
        };

        let due_at = now + chrono::Duration::milliseconds(delay_ms);
        self.ctx
            .queue
            .enqueue(
                SCHEDULE_QUEUE,
                &format!("interval-{}-{}", schedule.id, due_at.timestamp_millis()),
                &ProcessSchedulePayload {
                    schedule_id: schedule.id,
                },
                EnqueueOptions::delayed(Duration::from_millis(
                    u64::try_from(delay_ms.max(0)).unwrap_or(0),
                )),
            )
            .await?;
        Ok(())
    }

    /// Register (or replace) the cron task for a recurring schedule.
    fn register_cron(&self, schedule: &Schedule) -> Result<(), EngineError> {
        let Some(expression) = schedule.cron_expression.clone() else {
            return Err(EngineError::InvalidCron {
                expression: String::new(),
                message: "recurring schedule without a cron expression".to_string(),
            });
        };

        let cron_schedule = parse_cron(&expression)?;
        let queue = self.ctx.queue.clone();
        let schedule_id = schedule.id;
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            run_cron_chain(queue, schedule_id, cron_schedule, cancel).await;
        });

        let mut tasks = self.cron_tasks.lock().expect("cron registry poisoned");
        if let Some(previous) = tasks.insert(schedule_id, handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Drop a schedule's outstanding jobs and cron task (pause / delete).
    pub async fn remove_schedule_jobs(&self, schedule_id: i64) -> Result<(), EngineError> {
        {
            let mut tasks = self.cron_tasks.lock().expect("cron registry poisoned");
            if let Some(handle) = tasks.remove(&schedule_id) {
                handle.abort();
            }
        }
        for prefix in [
            format!("immediate-{schedule_id}"),
            format!("once-{schedule_id}"),
            format!("interval-{schedule_id}-"),
            format!("cron-{schedule_id}-"),
        ] {
            self.ctx.queue.remove_by_prefix(&prefix).await?;
        }
        Ok(())
    }

    /// Abort every cron task (driver stop).
    pub fn stop(&self) {
        let mut tasks = self.cron_tasks.lock().expect("cron registry poisoned");
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }

    /// Number of live cron tasks (status display and tests).
    pub fn cron_task_count(&self) -> usize {
        self.cron_tasks.lock().expect("cron registry poisoned").len()
    }
}

/// Parse a cron expression, accepting both 5-field (minute-first) and
/// 6/7-field (second-first) forms.
fn parse_cron(expression: &str) -> Result<cron::Schedule, EngineError> {
    let attempt = cron::Schedule::from_str(expression);
    match attempt {
        Ok(parsed) => Ok(parsed),
        Err(first_err) => {
            let with_seconds = format!("0 {expression}");
            cron::Schedule::from_str(&with_seconds).map_err(|_| EngineError::InvalidCron {
                expression: expression.to_string(),
                message: first_err.to_string(),
            })
        }
    }
}

/// Cron chain task: enqueue one uniquely-identified processing job per
/// firing. Job ids derive from the firing time, so a restarted task
/// re-enqueueing the same firing dedups instead of double-firing.
async fn run_cron_chain(
    queue: JobQueue,
    schedule_id: i64,
    cron_schedule: cron::Schedule,
    cancel: CancellationToken,
) {
    loop {
        let Some(next) = cron_schedule.upcoming(Utc).next() else {
            tracing::warn!(schedule_id, "Cron expression has no future firings");
            return;
        };

        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(wait) => {}
        }

        let job_id = format!("cron-{schedule_id}-{}", next.timestamp());
        if let Err(e) = queue
            .enqueue(
                SCHEDULE_QUEUE,
                &job_id,
                &ProcessSchedulePayload { schedule_id },
                EnqueueOptions::default(),
            )
            .await
        {
            tracing::warn!(schedule_id, error = %e, "Cron firing enqueue failed");
        }
    }
}

/// Processing-lock TTL: `min(3600s, max(10s, 0.9 · interval))`.
///
/// The 0.9 factor expires the lock before the next recursive job fires,
/// so a crashed handler cannot deadlock the chain while a live one still
/// cannot overlap.
fn lock_ttl_for(schedule: &Schedule) -> Duration {
    if schedule.schedule_type == ScheduleType::Interval {
        let interval_secs =
            (schedule.interval_value.max(1) * schedule.interval_unit.millis()) / 1000;
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let ttl = Duration::from_secs((interval_secs as f64 * 0.9) as u64);
        ttl.clamp(LOCK_TTL_MIN, LOCK_TTL_MAX)
    } else {
        Duration::from_secs(60)
    }
}

/// Handler for `schedule-processing` jobs: one batch per delivery.
pub struct ScheduleJobHandler {
    ctx: EngineContext,
}

impl ScheduleJobHandler {
    /// Create the handler.
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Run one batch under the processing lock.
    async fn process(&self, schedule: &Schedule) -> Result<(), EngineError> {
        let now = Utc::now();
        if schedule.ended_at(now) {
            tracing::info!(schedule_id = schedule.id, "End date passed, completing schedule");
            schedules::set_status(&self.ctx.db, schedule.id, ScheduleStatus::Completed, None)
                .await?;
            return Ok(());
        }

        let batch_start = std::time::Instant::now();
        let plan = sleep::evaluate(&self.ctx.db, schedule).await?;

        match plan {
            sleep::BatchPlan::Sleep { delay_ms } => {
                if schedule.schedule_type == ScheduleType::Interval {
                    self.enqueue_follow_up(schedule.id, delay_ms).await?;
                }
                Ok(())
            }
            sleep::BatchPlan::Proceed { interval_ms } => {
                // Rotation or a limit redraw may have changed the pools.
                let schedule = schedules::require_schedule(&self.ctx.db, schedule.id).await?;

                dispatch::dispatch_batch(&self.ctx, &schedule).await?;
                schedules::set_last_processed_at(&self.ctx.db, schedule.id).await?;
                if schedule.error_count > 0 {
                    schedules::clear_error_count(&self.ctx.db, schedule.id).await?;
                }

                match schedule.schedule_type {
                    ScheduleType::Interval => {
                        let elapsed_ms =
                            i64::try_from(batch_start.elapsed().as_millis()).unwrap_or(i64::MAX);
                        let delay_ms = (interval_ms - elapsed_ms).max(FOLLOW_UP_FLOOR_MS);
                        self.enqueue_follow_up(schedule.id, delay_ms).await?;
                    }
                    ScheduleType::Immediate | ScheduleType::Once => {
                        schedules::set_status(
                            &self.ctx.db,
                            schedule.id,
                            ScheduleStatus::Completed,
                            None,
                        )
                        .await?;
                    }
                    ScheduleType::Recurring => {}
                }
                Ok(())
            }
        }
    }

    /// Enqueue exactly one follow-up job and persist `next_run_at`.
    async fn enqueue_follow_up(&self, schedule_id: i64, delay_ms: i64) -> Result<(), EngineError> {
        let due_at = Utc::now() + chrono::Duration::milliseconds(delay_ms);
        self.ctx
            .queue
            .enqueue(
                SCHEDULE_QUEUE,
                &format!("interval-{schedule_id}-{}", due_at.timestamp_millis()),
                &ProcessSchedulePayload { schedule_id },
                EnqueueOptions::delayed(Duration::from_millis(
                    u64::try_from(delay_ms.max(0)).unwrap_or(0),
                )),
            )
            .await?;
        schedules::set_next_run_at(&self.ctx.db, schedule_id, Some(&format_ts(due_at))).await?;
        Ok(())
    }

    /// Book a handler failure against the schedule. Transient failures
    /// keep the chain alive; the review threshold parks it.
    async fn record_failure(&self, schedule: &Schedule, error: &EngineError) {
        if let EngineError::RequiresReview { message, .. } = error {
            let _ = schedules::set_status(
                &self.ctx.db,
                schedule.id,
                ScheduleStatus::RequiresReview,
                Some(message),
            )
            .await;
            return;
        }

        let count = match schedules::increment_error_count(&self.ctx.db, schedule.id).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(schedule_id = schedule.id, error = %e, "Failed to record error");
                return;
            }
        };

        let threshold = i64::from(self.ctx.config.limits.max_schedule_errors);
        if count >= threshold {
            tracing::error!(
                schedule_id = schedule.id,
                error_count = count,
                "Error threshold reached, parking schedule for review"
            );
            let _ = schedules::set_status(
                &self.ctx.db,
                schedule.id,
                ScheduleStatus::RequiresReview,
                Some(&error.to_string()),
            )
            .await;
            return;
        }

        // Below the threshold the chain keeps firing so transient
        // infrastructure hiccups self-heal.
        if schedule.schedule_type == ScheduleType::Interval {
            let interval_ms = schedule.interval_value.max(1) * schedule.interval_unit.millis();
            if let Err(e) = self.enqueue_follow_up(schedule.id, interval_ms).await {
                tracing::warn!(schedule_id = schedule.id, error = %e, "Follow-up after failure failed");
            }
        }
    }
}

#[async_trait::async_trait]
impl JobHandler for ScheduleJobHandler {
    async fn handle(&self, job: &JobRecord) -> Result<(), JobError> {
        let payload: ProcessSchedulePayload = job
            .payload_as()
            .map_err(|e| JobError::Terminal(format!("bad payload: {e}")))?;
        let schedule_id = payload.schedule_id;

        let schedule = match schedules::get_schedule(&self.ctx.db, schedule_id).await {
            Ok(Some(schedule)) => schedule,
            Ok(None) => {
                tracing::debug!(schedule_id, "Schedule deleted, dropping job");
                return Ok(());
            }
            Err(e) => return Err(JobError::Retryable(format!("load failed: {e}"))),
        };

        if schedule.status != ScheduleStatus::Active {
            tracing::debug!(schedule_id, status = ?schedule.status, "Schedule not active, dropping job");
            return Ok(());
        }

        let Some(lock) = TtlLock::acquire(
            self.ctx.cache.as_ref(),
            schedule_processing_key(schedule_id),
            lock_ttl_for(&schedule),
        )
        .await
        else {
            tracing::warn!(schedule_id, "Processing lock held, skipping batch");
            return Ok(());
        };

        let result = self.process(&schedule).await;
        lock.release().await;

        if let Err(error) = result {
            tracing::warn!(schedule_id, error = %error, "Batch processing failed");
            self.record_failure(&schedule, &error).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{test_context, StubPlatform};
    use crate::storage::schedules::{
        AccountSelection, IntervalUnit, NewSchedule, TargetVideo,
    };
    use crate::storage::{accounts, users};

    async fn seed(
        ctx: &EngineContext,
        schedule_type: ScheduleType,
        accounts_n: usize,
    ) -> i64 {
        let uid = users::insert_user(&ctx.db, "owner@example.com")
            .await
            .expect("user");
        for _ in 0..accounts_n {
            accounts::insert_account(
                &ctx.db,
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
        }
        schedules::insert_schedule(
            &ctx.db,
            &NewSchedule {
                user_id: uid,
                name: "s".to_string(),
                schedule_type,
                start_date: None,
                end_date: None,
                cron_expression: None,
                interval_value: 2,
                interval_unit: IntervalUnit::Minutes,
                comment_templates: vec!["Nice!".to_string()],
                target_videos: vec![TargetVideo {
                    video_id: "vid".to_string(),
                    title: None,
                }],
                account_selection: AccountSelection::Random,
            },
        )
        .await
        .expect("schedule")
    }

    fn driver_for(ctx: &EngineContext) -> ScheduleDriver {
        ScheduleDriver::new(ctx.clone(), CancellationToken::new())
    }

    #[tokio::test]
    async fn immediate_schedule_enqueues_dedup_job() {
        let ctx = test_context(StubPlatform::succeeding()).await;
        let sid = seed(&ctx, ScheduleType::Immediate, 1).await;
        let driver = driver_for(&ctx);

        driver.setup_schedule_job(sid).await.expect("setup");
        driver.setup_schedule_job(sid).await.expect("setup again");

        let jobs = ctx.queue.live_job_ids(SCHEDULE_QUEUE).await.expect("jobs");
        assert_eq!(jobs, vec![format!("immediate-{sid}")]);
    }

    #[tokio::test]
    async fn fresh_interval_schedule_waits_one_interval() {
        let ctx = test_context(StubPlatform::succeeding()).await;
        let sid = seed(&ctx, ScheduleType::Interval, 1).await;
        let driver = driver_for(&ctx);

        driver.setup_schedule_job(sid).await.expect("setup");

        let jobs = ctx.queue.live_job_ids(SCHEDULE_QUEUE).await.expect("jobs");
        assert_eq!(jobs.len(), 1);
        let job = ctx.queue.get(&jobs[0]).await.expect("get").expect("exists");
        let run_at = crate::storage::parse_ts(&job.run_at).expect("parse");
        let lead = (run_at - Utc::now()).num_seconds();
        // One full 2-minute interval of lead time, persisted as next_run_at.
        assert!((110..=121).contains(&lead), "lead was {lead}s");

        let schedule = schedules::require_schedule(&ctx.db, sid).await.expect("get");
        assert!(schedule.next_run_at.is_some());
    }

    #[tokio::test]
    async fn interval_setup_is_idempotent_for_live_chain() {
        let ctx = test_context(StubPlatform::succeeding()).await;
        let sid = seed(&ctx, ScheduleType::Interval, 1).await;
        let driver = driver_for(&ctx);

        driver.setup_schedule_job(sid).await.expect("setup");
        driver.setup_schedule_job(sid).await.expect("setup again");

        let jobs = ctx.queue.live_job_ids(SCHEDULE_QUEUE).await.expect("jobs");
        assert_eq!(jobs.len(), 1, "second setup must not fork the chain");
    }

    #[tokio::test]
    async fn restart_resumes_from_next_run_at() {
        let ctx = test_context(StubPlatform::succeeding()).await;
        let sid = seed(&ctx, ScheduleType::Interval, 1).await;

        // Simulate prior progress: 45 seconds until the next firing.
        let next = Utc::now() + chrono::Duration::seconds(45);
        sqlx::query(
            "UPDATE schedules SET posted_comments = 3, next_run_at = ? WHERE id = ?",
        )
        .bind(format_ts(next))
        .bind(sid)
        .execute(&ctx.db)
        .await
        .expect("seed");

        let driver = driver_for(&ctx);
        driver.setup_schedule_job(sid).await.expect("setup");

        let jobs = ctx.queue.live_job_ids(SCHEDULE_QUEUE).await.expect("jobs");
        assert_eq!(jobs.len(), 1);
        let job = ctx.queue.get(&jobs[0]).await.expect("get").expect("exists");
        let run_at = crate::storage::parse_ts(&job.run_at).expect("parse");
        let lead = (run_at - Utc::now()).num_seconds();
        assert!((40..=46).contains(&lead), "resume lead was {lead}s, expected ~45s");
    }

    #[tokio::test]
    async fn paused_schedule_is_noop() {
        let ctx = test_context(StubPlatform::succeeding()).await;
        let sid = seed(&ctx, ScheduleType::Interval, 1).await;
        schedules::set_status(&ctx.db, sid, ScheduleStatus::Paused, None)
            .await
            .expect("pause");

        let driver = driver_for(&ctx);
        driver.setup_schedule_job(sid).await.expect("setup");
        let jobs = ctx.queue.live_job_ids(SCHEDULE_QUEUE).await.expect("jobs");
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn recurring_schedule_registers_cron_task() {
        let ctx = test_context(StubPlatform::succeeding()).await;
        let sid = seed(&ctx, ScheduleType::Recurring, 1).await;
        sqlx::query("UPDATE schedules SET cron_expression = '*/5 * * * *' WHERE id = ?")
            .bind(sid)
            .execute(&ctx.db)
            .await
            .expect("seed");

        let driver = driver_for(&ctx);
        driver.setup_schedule_job(sid).await.expect("setup");
        assert_eq!(driver.cron_task_count(), 1);

        driver.remove_schedule_jobs(sid).await.expect("remove");
        assert_eq!(driver.cron_task_count(), 0);
    }

    #[tokio::test]
    async fn invalid_cron_surfaces_error() {
        let ctx = test_context(StubPlatform::succeeding()).await;
        let sid = seed(&ctx, ScheduleType::Recurring, 1).await;
        sqlx::query("UPDATE schedules SET cron_expression = 'not a cron' WHERE id = ?")
            .bind(sid)
            .execute(&ctx.db)
            .await
            .expect("seed");

        let driver = driver_for(&ctx);
        let err = driver.setup_schedule_job(sid).await.expect_err("should fail");
        assert!(matches!(err, EngineError::InvalidCron { .. }));
    }

    #[tokio::test]
    async fn handler_dispatches_and_chains_follow_up() {
        let ctx = test_context(StubPlatform::succeeding()).await;
        let sid = seed(&ctx, ScheduleType::Interval, 2).await;
        let handler = ScheduleJobHandler::new(ctx.clone());

        ctx.queue
            .enqueue(
                SCHEDULE_QUEUE,
                &format!("interval-{sid}-1"),
                &ProcessSchedulePayload { schedule_id: sid },
                EnqueueOptions::default(),
            )
            .await
            .expect("enqueue");
        let job = ctx
            .queue
            .claim_due(SCHEDULE_QUEUE, Duration::from_secs(60))
            .await
            .expect("claim")
            .expect("due");

        handler.handle(&job).await.expect("handle");
        ctx.queue.complete(&job.id).await.expect("complete");

        // Two post-comment jobs and exactly one follow-up.
        let post_jobs = ctx
            .queue
            .live_job_ids(crate::queue::POST_COMMENT_QUEUE)
            .await
            .expect("jobs");
        assert_eq!(post_jobs.len(), 2);

        let schedule_jobs = ctx.queue.live_job_ids(SCHEDULE_QUEUE).await.expect("jobs");
        assert_eq!(schedule_jobs.len(), 1);
        assert!(schedule_jobs[0].starts_with(&format!("interval-{sid}-")));

        let schedule = schedules::require_schedule(&ctx.db, sid).await.expect("get");
        assert!(schedule.next_run_at.is_some());
        assert!(schedule.last_processed_at.is_some());
        // next_run_at lands roughly one interval out (batch time subtracted).
        let next = crate::storage::parse_ts(schedule.next_run_at.as_deref().expect("set"))
            .expect("parse");
        let lead = (next - Utc::now()).num_seconds();
        assert!((110..=121).contains(&lead), "follow-up lead was {lead}s");
    }

    #[tokio::test]
    async fn handler_completes_ended_schedule_without_follow_up() {
        let ctx = test_context(StubPlatform::succeeding()).await;
        let sid = seed(&ctx, ScheduleType::Interval, 1).await;
        sqlx::query("UPDATE schedules SET end_date = '2020-01-01T00:00:00Z' WHERE id = ?")
            .bind(sid)
            .execute(&ctx.db)
            .await
            .expect("seed");

        let handler = ScheduleJobHandler::new(ctx.clone());
        ctx.queue
            .enqueue(
                SCHEDULE_QUEUE,
                &format!("interval-{sid}-1"),
                &ProcessSchedulePayload { schedule_id: sid },
                EnqueueOptions::default(),
            )
            .await
            .expect("enqueue");
        let job = ctx
            .queue
            .claim_due(SCHEDULE_QUEUE, Duration::from_secs(60))
            .await
            .expect("claim")
            .expect("due");
        handler.handle(&job).await.expect("handle");
        ctx.queue.complete(&job.id).await.expect("complete");

        let schedule = schedules::require_schedule(&ctx.db, sid).await.expect("get");
        assert_eq!(schedule.status, ScheduleStatus::Completed);
        assert!(ctx
            .queue
            .live_job_ids(SCHEDULE_QUEUE)
            .await
            .expect("jobs")
            .is_empty());
    }

    #[tokio::test]
    async fn handler_parks_misconfigured_schedule() {
        let ctx = test_context(StubPlatform::succeeding()).await;
        let sid = seed(&ctx, ScheduleType::Interval, 1).await;
        sqlx::query("UPDATE schedules SET target_videos = '[]' WHERE id = ?")
            .bind(sid)
            .execute(&ctx.db)
            .await
            .expect("seed");

        let handler = ScheduleJobHandler::new(ctx.clone());
        ctx.queue
            .enqueue(
                SCHEDULE_QUEUE,
                &format!("interval-{sid}-1"),
                &ProcessSchedulePayload { schedule_id: sid },
                EnqueueOptions::default(),
            )
            .await
            .expect("enqueue");
        let job = ctx
            .queue
            .claim_due(SCHEDULE_QUEUE, Duration::from_secs(60))
            .await
            .expect("claim")
            .expect("due");
        handler.handle(&job).await.expect("handle");

        let schedule = schedules::require_schedule(&ctx.db, sid).await.expect("get");
        assert_eq!(schedule.status, ScheduleStatus::RequiresReview);
        assert!(schedule
            .error_message
            .as_deref()
            .expect("message")
            .contains("target videos"));
    }

    #[tokio::test]
    async fn handler_skips_when_lock_held() {
        let ctx = test_context(StubPlatform::succeeding()).await;
        let sid = seed(&ctx, ScheduleType::Interval, 1).await;

        // Another handler holds the lock.
        ctx.cache
            .set_nx(
                &schedule_processing_key(sid),
                "1",
                Duration::from_secs(60),
            )
            .await;

        let handler = ScheduleJobHandler::new(ctx.clone());
        ctx.queue
            .enqueue(
                SCHEDULE_QUEUE,
                &format!("interval-{sid}-1"),
                &ProcessSchedulePayload { schedule_id: sid },
                EnqueueOptions::default(),
            )
            .await
            .expect("enqueue");
        let job = ctx
            .queue
            .claim_due(SCHEDULE_QUEUE, Duration::from_secs(60))
            .await
            .expect("claim")
            .expect("due");
        handler.handle(&job).await.expect("handle");

        // Nothing dispatched, no follow-up chained by this delivery.
        assert!(ctx
            .queue
            .live_job_ids(crate::queue::POST_COMMENT_QUEUE)
            .await
            .expect("jobs")
            .is_empty());
    }

    #[test]
    fn lock_ttl_clamps() {
        let ctx_interval = |value: i64, unit: IntervalUnit| {
            let mut s = sample_schedule();
            s.interval_value = value;
            s.interval_unit = unit;
            s
        };

        // 2 minutes → 108s.
        assert_eq!(
            lock_ttl_for(&ctx_interval(2, IntervalUnit::Minutes)),
            Duration::from_secs(108)
        );
        assert_eq!(
            lock_ttl_for(&ctx_interval(1, IntervalUnit::Minutes)),
            Duration::from_secs(54)
        );
        // Huge interval clamps to an hour.
        assert_eq!(
            lock_ttl_for(&ctx_interval(2, IntervalUnit::Days)),
            Duration::from_secs(3600)
        );
    }

    fn sample_schedule() -> Schedule {
        Schedule {
            id: 1,
            user_id: 1,
            name: "s".to_string(),
            status: ScheduleStatus::Active,
            schedule_type: ScheduleType::Interval,
            start_date: None,
            end_date: None,
            cron_expression: None,
            interval_value: 2,
            interval_unit: IntervalUnit::Minutes,
            interval_is_random: false,
            interval_min: None,
            interval_max: None,
            comment_templates: "[]".to_string(),
            target_videos: "[]".to_string(),
            target_channels: "[]".to_string(),
            account_selection: AccountSelection::Random,
            rotation_enabled: false,
            currently_active: crate::storage::schedules::ActivePool::Principal,
            last_rotated_at: None,
            use_ai: false,
            include_emojis: false,
            min_delay_minutes: 5,
            max_delay_minutes: 30,
            between_accounts_ms: 1500,
            limit_value: 0,
            limit_min: None,
            limit_max: None,
            limit_is_random: false,
            sleep_delay_minutes: 0,
            sleep_delay_start_time: None,
            last_sleep_trigger_count: 0,
            last_used_account_id: None,
            next_run_at: None,
            last_processed_at: None,
            total_comments: 0,
            posted_comments: 0,
            failed_comments: 0,
            error_count: 0,
            error_message: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }
}
