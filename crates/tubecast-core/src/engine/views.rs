//! View simulation scheduling and execution.
//!
//! A thin mirror of the schedule driver: each tick of an active view
//! schedule staggers one `simulate-view` job per target video across the
//! configured interval. The handler rolls the probability, invokes the
//! external viewer service, and optionally issues a server-side like
//! through the same egress proxy as the watching account.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::queue::{EnqueueOptions, JobError, JobHandler, JobRecord, SIMULATE_VIEW_QUEUE};
use crate::storage::accounts;
use crate::storage::{format_ts, proxies, view_schedules};
use crate::upstream::transport;

use super::posting::ensure_access_token;
use super::{EngineContext, SimulateViewPayload};

/// Scan cadence for due view schedules.
const TICK_INTERVAL: Duration = Duration::from_secs(15);

/// Parameters handed to the external viewer service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRequest {
    /// Video to watch.
    pub video_id: String,
    /// Minimum watch seconds.
    pub min_watch_time_secs: i64,
    /// Maximum watch seconds.
    pub max_watch_time_secs: i64,
}

/// External browser-automation viewer boundary.
#[async_trait::async_trait]
pub trait ViewerService: Send + Sync {
    /// Run one watch session. An `Err` is treated as transient.
    async fn watch(&self, request: &WatchRequest) -> Result<(), String>;
}

/// Periodic loop materializing due view schedules into `simulate-view` jobs.
pub async fn run_view_scheduler(ctx: EngineContext, cancel: CancellationToken) {
    tracing::info!("View scheduler started");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(TICK_INTERVAL) => {}
        }

        if let Err(e) = tick(&ctx).await {
            tracing::warn!(error = %e, "View scheduler tick failed");
        }
    }
    tracing::info!("View scheduler stopped");
}

/// One scheduler tick: fan out every due view schedule.
pub async fn tick(ctx: &EngineContext) -> Result<(), crate::error::EngineError> {
    let now = Utc::now();
    for schedule in view_schedules::list_active_view_schedules(&ctx.db).await? {
        let due = match schedule.next_run_at.as_deref().and_then(crate::storage::parse_ts) {
            Some(next) => next <= now,
            None => true,
        };
        if !due {
            continue;
        }

        let videos = schedule.videos()?;
        if videos.is_empty() {
            continue;
        }

        // Spread the videos evenly across the interval.
        let interval_ms = schedule.interval_ms().max(1);
        let stagger_ms = interval_ms / i64::try_from(videos.len()).unwrap_or(1);
        let tick_epoch = now.timestamp();

        for (i, video) in videos.iter().enumerate() {
            let delay_ms = i64::try_from(i).unwrap_or(0) * stagger_ms;
            ctx.queue
                .enqueue(
                    SIMULATE_VIEW_QUEUE,
                    &format!("view-{}-{}-{tick_epoch}", schedule.id, video.video_id),
                    &SimulateViewPayload {
                        view_schedule_id: schedule.id,
                        video_id: video.video_id.clone(),
                    },
                    EnqueueOptions::delayed(Duration::from_millis(
                        u64::try_from(delay_ms.max(0)).unwrap_or(0),
                    )),
                )
                .await?;
        }

        view_schedules::set_next_run_at(
            &ctx.db,
            schedule.id,
            Some(&format_ts(now + chrono::Duration::milliseconds(interval_ms))),
        )
        .await?;

        tracing::debug!(
            view_schedule_id = schedule.id,
            videos = videos.len(),
            stagger_ms,
            "View batch enqueued"
        );
    }
    Ok(())
}

/// Handler for `simulate-view` jobs.
pub struct SimulateViewHandler {
    ctx: EngineContext,
}

impl SimulateViewHandler {
    /// Create the handler.
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Server-side like through the watching user's egress. Advisory:
    /// failures are logged and swallowed.
    async fn issue_like(&self, user_id: i64, video_id: &str) {
        let account = match accounts::random_active_account(&self.ctx.db, user_id).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                tracing::warn!(user_id, "No active account available for auto-like");
                return;
            }
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Account lookup for auto-like failed");
                return;
            }
        };

        let token = match ensure_access_token(&self.ctx, &account).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(account_id = account.id, error = %e, "Auto-like token refresh failed");
                return;
            }
        };

        let proxy = match account.proxy_id {
            Some(proxy_id) => proxies::get_proxy(&self.ctx.db, proxy_id).await.ok().flatten(),
            None => None,
        };
        let http = match transport::ensure_transport(&self.ctx.db, proxy.as_ref()).await {
            Ok(http) => http,
            Err(e) => {
                tracing::warn!(account_id = account.id, error = %e, "Auto-like transport failed");
                return;
            }
        };

        match self.ctx.platform.rate_like(&http, &token, video_id).await {
            Ok(()) => {
                let tz: chrono_tz::Tz = self
                    .ctx
                    .config
                    .maintenance
                    .quota_reset_timezone
                    .parse()
                    .unwrap_or(chrono_tz::UTC);
                let today = Utc::now().with_timezone(&tz).format("%Y-%m-%d").to_string();
                if let Err(e) = accounts::record_like(&self.ctx.db, account.id, &today).await {
                    tracing::warn!(account_id = account.id, error = %e, "Like bookkeeping failed");
                }
                tracing::info!(account_id = account.id, video_id, "Auto-like issued");
            }
            Err(e) => {
                tracing::warn!(account_id = account.id, video_id, error = %e, "Auto-like failed");
            }
        }
    }
}

#[async_trait::async_trait]
impl JobHandler for SimulateViewHandler {
    async fn handle(&self, job: &JobRecord) -> Result<(), JobError> {
        let payload: SimulateViewPayload = job
            .payload_as()
            .map_err(|e| JobError::Terminal(format!("bad payload: {e}")))?;

        let schedule = match view_schedules::get_view_schedule(&self.ctx.db, payload.view_schedule_id)
            .await
        {
            Ok(Some(schedule)) => schedule,
            Ok(None) => return Ok(()),
            Err(e) => return Err(JobError::Retryable(format!("load failed: {e}"))),
        };
        if schedule.status != view_schedules::ViewScheduleStatus::Active {
            return Ok(());
        }

        // Probability roll happens at handler time, not enqueue time.
        let roll = rand::thread_rng().gen_range(0..100);
        if roll >= schedule.probability {
            tracing::debug!(
                view_schedule_id = schedule.id,
                video_id = %payload.video_id,
                roll,
                "View skipped by probability roll"
            );
            return Ok(());
        }

        let Some(viewer) = &self.ctx.viewer else {
            tracing::warn!("No viewer service bound, dropping simulate-view job");
            return Ok(());
        };

        let request = WatchRequest {
            video_id: payload.video_id.clone(),
            min_watch_time_secs: schedule.min_watch_time_secs,
            max_watch_time_secs: schedule.max_watch_time_secs,
        };
        viewer
            .watch(&request)
            .await
            .map_err(JobError::Retryable)?;

        tracing::info!(
            view_schedule_id = schedule.id,
            video_id = %payload.video_id,
            "View session completed"
        );

        if schedule.auto_like {
            self.issue_like(schedule.user_id, &payload.video_id).await;
        }
        Ok(())
    }
}
