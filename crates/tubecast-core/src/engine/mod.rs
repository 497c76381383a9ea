//! The scheduling and posting engine.
//!
//! Submodules:
//! - [`driver`]: schedule → job materialization, recursive-delay loop,
//!   cron registry, and the `schedule-processing` handler.
//! - [`dispatch`]: one-batch comment row creation and fan-out.
//! - [`sleep`]: sleep-cycle trigger and principal/secondary rotation.
//! - [`selector`]: weighted-LRU account selection.
//! - [`posting`]: the `post-comment` handler (C5).
//! - [`views`]: view-simulation scheduling and the `simulate-view` handler.
//! - [`maintenance`]: cleanup, counter reconciliation, daily quota reset.
//!
//! [`Engine`] owns the worker pools and background loops: `start` spawns
//! everything, `shutdown` cancels and drains within a bounded grace.

pub mod dispatch;
pub mod driver;
pub mod maintenance;
pub mod posting;
pub mod selector;
pub mod sleep;
pub mod views;

pub use driver::{ScheduleDriver, ScheduleJobHandler};
pub use posting::PostCommentHandler;
pub use selector::UsageTracker;
pub use sleep::BatchPlan;
pub use views::{SimulateViewHandler, ViewerService, WatchRequest};

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::config::Config;
use crate::content::CommentComposer;
use crate::error::EngineError;
use crate::queue::{JobQueue, JobWorker, WorkerOptions, POST_COMMENT_QUEUE, SCHEDULE_QUEUE, SIMULATE_VIEW_QUEUE};
use crate::storage::DbPool;
use crate::upstream::{TokenEndpoint, VideoPlatform};

/// Payload of a `schedule-processing` job.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProcessSchedulePayload {
    /// The schedule to run one batch for.
    pub schedule_id: i64,
}

/// Payload of a `post-comment` job.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PostCommentPayload {
    /// The comment row to post.
    pub comment_id: i64,
    /// The owning schedule (for counter updates).
    pub schedule_id: i64,
}

/// Payload of a `simulate-view` job.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SimulateViewPayload {
    /// The view schedule this view belongs to.
    pub view_schedule_id: i64,
    /// The video to watch.
    pub video_id: String,
}

/// Shared dependencies threaded through every handler. Cheap to clone.
#[derive(Clone)]
pub struct EngineContext {
    /// Database pool.
    pub db: DbPool,
    /// Coordination cache (locks, cooldowns, markers).
    pub cache: Arc<dyn Cache>,
    /// Durable job queue.
    pub queue: JobQueue,
    /// Upstream platform operations.
    pub platform: Arc<dyn VideoPlatform>,
    /// Comment text generation.
    pub composer: Arc<CommentComposer>,
    /// In-process account usage counters.
    pub tracker: Arc<UsageTracker>,
    /// OAuth token endpoint.
    pub token_endpoint: TokenEndpoint,
    /// Browser-automation viewer, when deployed.
    pub viewer: Option<Arc<dyn ViewerService>>,
    /// Engine configuration.
    pub config: Config,
}

/// The engine service: worker pools, background loops, and the schedule
/// driver, with explicit start/stop.
pub struct Engine {
    ctx: EngineContext,
    driver: Arc<ScheduleDriver>,
    cancel: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Engine {
    /// Assemble an engine from its dependencies. Nothing runs until
    /// [`start`](Engine::start).
    pub fn new(ctx: EngineContext) -> Self {
        let cancel = CancellationToken::new();
        let driver = Arc::new(ScheduleDriver::new(ctx.clone(), cancel.clone()));
        Self {
            ctx,
            driver,
            cancel,
            handles: Vec::new(),
        }
    }

    /// The schedule driver (for API-layer re-materialization calls).
    pub fn driver(&self) -> Arc<ScheduleDriver> {
        self.driver.clone()
    }

    /// A clone of the root cancellation token.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn the worker pools and background loops, then materialize
    /// jobs for every active schedule.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        let queue_cfg = self.ctx.config.queue.clone();
        let lease = Duration::from_secs(queue_cfg.lease_secs);
        let poll = Duration::from_millis(queue_cfg.poll_interval_ms);

        self.spawn(
            "schedule-worker",
            JobWorker::new(
                SCHEDULE_QUEUE,
                self.ctx.queue.clone(),
                Arc::new(ScheduleJobHandler::new(self.ctx.clone())),
                WorkerOptions {
                    concurrency: queue_cfg.schedule_concurrency,
                    lease,
                    poll_interval: poll,
                    rate_per_sec: None,
                },
            ),
        );

        self.spawn(
            "post-comment-worker",
            JobWorker::new(
                POST_COMMENT_QUEUE,
                self.ctx.queue.clone(),
                Arc::new(PostCommentHandler::new(self.ctx.clone())),
                WorkerOptions {
                    concurrency: queue_cfg.post_concurrency,
                    lease,
                    poll_interval: poll,
                    rate_per_sec: Some(queue_cfg.post_rate_per_sec),
                },
            ),
        );

        self.spawn(
            "view-worker",
            JobWorker::new(
                SIMULATE_VIEW_QUEUE,
                self.ctx.queue.clone(),
                Arc::new(SimulateViewHandler::new(self.ctx.clone())),
                WorkerOptions {
                    concurrency: queue_cfg.view_concurrency,
                    lease,
                    poll_interval: poll,
                    rate_per_sec: None,
                },
            ),
        );

        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        self.spawn_task("view-scheduler", views::run_view_scheduler(ctx, cancel));

        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        self.spawn_task("maintenance", maintenance::run_maintenance_loop(ctx, cancel));

        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        self.spawn_task("reconciliation", maintenance::run_reconcile_loop(ctx, cancel));

        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        let driver = self.driver.clone();
        self.spawn_task(
            "daily-reset",
            maintenance::run_daily_reset_loop(ctx, driver, cancel),
        );

        self.driver.setup_all_active().await?;
        tracing::info!(tasks = self.handles.len(), "Engine started");
        Ok(())
    }

    fn spawn(&mut self, name: &'static str, worker: JobWorker) {
        let cancel = self.cancel.clone();
        self.spawn_task(name, worker.run(cancel));
    }

    fn spawn_task<F>(&mut self, name: &'static str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tracing::info!(task = name, "Spawning engine task");
        self.handles.push((name.to_string(), tokio::spawn(future)));
    }

    /// Graceful shutdown: cancel, then await every task under a 30s bound.
    pub async fn shutdown(&mut self) {
        tracing::info!("Initiating graceful shutdown");
        self.cancel.cancel();
        self.driver.stop();

        let handles: Vec<_> = self.handles.drain(..).collect();
        let drain = async {
            for (name, handle) in handles {
                match handle.await {
                    Ok(()) => tracing::info!(task = %name, "Task completed cleanly"),
                    Err(e) => tracing::warn!(task = %name, error = %e, "Task panicked during shutdown"),
                }
            }
        };

        if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
            tracing::warn!("Shutdown grace exceeded (30s), some tasks may still be running");
        } else {
            tracing::info!("Graceful shutdown complete");
        }
    }

    /// Block until Ctrl+C / SIGTERM, then gracefully stop.
    pub async fn run_until_shutdown(mut self) {
        wait_for_shutdown_signal().await;
        self.shutdown().await;
    }
}

/// Wait for an OS shutdown signal (Ctrl+C or SIGTERM).
pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to register SIGTERM handler, using Ctrl+C only");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                } else {
                    tracing::info!("Received Ctrl+C");
                }
                return;
            }
        };

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Ctrl+C handler error");
                }
                tracing::info!("Received Ctrl+C");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        } else {
            tracing::info!("Received Ctrl+C");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{test_context, StubPlatform};
    use super::*;
    use crate::storage::accounts::{self, NewAccount};
    use crate::storage::comments::CommentStatus;
    use crate::storage::schedules::{
        self, AccountSelection, IntervalUnit, NewSchedule, ScheduleStatus, ScheduleType,
        TargetVideo,
    };
    use crate::storage::{comments, format_ts, users};

    #[tokio::test]
    async fn engine_posts_immediate_schedule_end_to_end() {
        let stub = StubPlatform::succeeding();
        let ctx = test_context(stub.clone()).await;

        let uid = users::insert_user(&ctx.db, "owner@example.com")
            .await
            .expect("user");
        let aid = accounts::insert_account(
            &ctx.db,
            &NewAccount {
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
        // Fresh token so the worker never round-trips to the token endpoint.
        accounts::update_tokens(
            &ctx.db,
            aid,
            "at",
            &format_ts(chrono::Utc::now() + chrono::Duration::hours(1)),
        )
        .await
        .expect("tokens");

        let sid = schedules::insert_schedule(
            &ctx.db,
            &NewSchedule {
                user_id: uid,
                name: "launch push".to_string(),
                schedule_type: ScheduleType::Immediate,
                start_date: None,
                end_date: None,
                cron_expression: None,
                interval_value: 2,
                interval_unit: IntervalUnit::Minutes,
                comment_templates: vec!["First!".to_string()],
                target_videos: vec![TargetVideo {
                    video_id: "vid".to_string(),
                    title: None,
                }],
                account_selection: AccountSelection::Random,
            },
        )
        .await
        .expect("schedule");

        let mut engine = Engine::new(ctx.clone());
        engine.start().await.expect("start");

        // Wait for the full chain: schedule job → comment row → post job → posted.
        let mut posted = false;
        for _ in 0..200 {
            let counts = comments::status_counts(&ctx.db, sid).await.expect("counts");
            if counts.posted == 1 {
                posted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        engine.shutdown().await;

        assert!(posted, "comment was not posted end-to-end");
        assert_eq!(stub.insert_calls(), 1);

        let schedule = schedules::require_schedule(&ctx.db, sid).await.expect("get");
        assert_eq!(schedule.status, ScheduleStatus::Completed);
        assert_eq!(schedule.posted_comments, 1);
        assert_eq!(schedule.total_comments, 1);

        let counts = comments::status_counts(&ctx.db, sid).await.expect("counts");
        assert_eq!(counts.posted, 1);

        // The posted row carries its upstream identity.
        let rows: Vec<(CommentStatus, Option<String>)> =
            sqlx::query_as("SELECT status, external_id FROM comments WHERE schedule_id = ?")
                .bind(sid)
                .fetch_all(&ctx.db)
                .await
                .expect("rows");
        assert!(rows
            .iter()
            .all(|(status, ext)| *status == CommentStatus::Posted && ext.is_some()));
    }
}
