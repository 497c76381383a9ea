//! One-batch dispatch: comment row creation and post-comment fan-out.
//!
//! A batch dispatches up to one comment per eligible account on a strict
//! stagger anchored to the batch start, guarded by per-(account, video)
//! micro-cooldowns and a hard wall-clock ceiling on the creation loop.

use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;

use crate::cache::cooldown_key;
use crate::error::EngineError;
use crate::queue::{EnqueueOptions, POST_COMMENT_QUEUE};
use crate::storage::accounts::{self, AccountStatus};
use crate::storage::schedules::{self, AccountPool, Schedule, TargetVideo};
use crate::storage::{api_profiles, comments, format_ts};
use crate::upstream::transport;

use super::selector;
use super::{EngineContext, PostCommentPayload};

/// Dispatch one batch for an active schedule. Returns the number of
/// comment rows created and handed to the post-comment queue.
pub async fn dispatch_batch(
    ctx: &EngineContext,
    schedule: &Schedule,
) -> Result<usize, EngineError> {
    let videos = schedule.videos()?;
    let templates = schedule.templates()?;

    if videos.is_empty() {
        return Err(EngineError::RequiresReview {
            schedule_id: schedule.id,
            message: "no target videos configured".to_string(),
        });
    }
    if templates.is_empty() && !schedule.use_ai {
        return Err(EngineError::RequiresReview {
            schedule_id: schedule.id,
            message: "no comment templates configured and AI is disabled".to_string(),
        });
    }

    let candidates = eligible_accounts(ctx, schedule).await?;
    if candidates.is_empty() {
        tracing::warn!(
            schedule_id = schedule.id,
            "No active accounts eligible, dispatching nothing this batch"
        );
        return Ok(0);
    }

    let api_key = api_profiles::get_active_profile(&ctx.db, schedule.user_id)
        .await?
        .map(|profile| profile.api_key)
        .unwrap_or_default();
    let metadata_http = transport::build_direct_client()?;

    let stagger_ms = if schedule.between_accounts_ms > 0 {
        schedule.between_accounts_ms
    } else {
        i64::try_from(ctx.config.dispatch.between_accounts_ms).unwrap_or(1500)
    };
    let ceiling = Duration::from_secs(ctx.config.dispatch.dispatch_ceiling_secs);
    let batch_start_wall = Utc::now();
    let batch_start = std::time::Instant::now();

    let mut templates = templates;
    let mut remaining = candidates;
    let mut last_used = schedule.last_used_account_id;
    let mut dispatched: usize = 0;

    while !remaining.is_empty() {
        if batch_start.elapsed() >= ceiling {
            tracing::warn!(
                schedule_id = schedule.id,
                dispatched,
                pending_accounts = remaining.len(),
                "Dispatch ceiling reached, continuing with partial batch"
            );
            break;
        }

        let Some(video) = videos.choose(&mut rand::thread_rng()).cloned() else {
            break;
        };

        let Some(account_id) = selector::select_account(
            ctx.cache.as_ref(),
            ctx.tracker.as_ref(),
            schedule.id,
            &video.video_id,
            &remaining,
            last_used,
        )
        .await
        else {
            break;
        };
        remaining.retain(|id| *id != account_id);

        // Micro-cooldown on the (account, video) pair, TTL = stagger.
        // The cooldown is scoped per video, so an account blocked on the
        // drawn target can still post on another target this batch.
        let cooldown_ttl = Duration::from_millis(u64::try_from(stagger_ms).unwrap_or(1500));
        let Some(video) =
            claim_cooldown_free_video(ctx, account_id, video, &videos, cooldown_ttl).await
        else {
            tracing::debug!(
                schedule_id = schedule.id,
                account_id,
                "Account on cooldown for every target, skipping this batch"
            );
            continue;
        };

        let composed = ctx
            .composer
            .compose(
                ctx.platform.as_ref(),
                &metadata_http,
                &api_key,
                &video.video_id,
                video.title.as_deref(),
                &templates,
                schedule.use_ai,
            )
            .await;

        // A fresh AI comment grows the curated pool for later batches.
        if composed.from_ai && !templates.contains(&composed.text) {
            templates.push(composed.text.clone());
            schedules::set_templates(&ctx.db, schedule.id, &templates).await?;
        }

        let offset_ms = i64::try_from(dispatched).unwrap_or(0) * stagger_ms;
        let scheduled_for = batch_start_wall + chrono::Duration::milliseconds(offset_ms);
        let delay = (scheduled_for - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        let comment_id = comments::insert_comment(
            &ctx.db,
            &comments::NewComment {
                user_id: schedule.user_id,
                schedule_id: schedule.id,
                account_id,
                video_id: &video.video_id,
                parent_id: None,
                content: &composed.text,
                scheduled_for: Some(&format_ts(scheduled_for)),
                last_previous_account_id: last_used,
            },
        )
        .await?;

        ctx.queue
            .enqueue(
                POST_COMMENT_QUEUE,
                &format!("post-comment-{comment_id}"),
                &PostCommentPayload {
                    comment_id,
                    schedule_id: schedule.id,
                },
                EnqueueOptions::delayed(delay),
            )
            .await?;

        selector::record_dispatch(
            ctx.cache.as_ref(),
            ctx.tracker.as_ref(),
            schedule.id,
            &video.video_id,
            account_id,
        )
        .await;
        schedules::set_last_used_account(&ctx.db, schedule.id, account_id).await?;

        last_used = Some(account_id);
        dispatched += 1;
    }

    if dispatched > 0 {
        schedules::add_total_comments(&ctx.db, schedule.id, i64::try_from(dispatched).unwrap_or(0))
            .await?;
    }

    tracing::info!(
        schedule_id = schedule.id,
        dispatched,
        stagger_ms,
        "Batch dispatched"
    );
    Ok(dispatched)
}

/// Claim the (account, video) cooldown for the drawn target, falling
/// back to the remaining targets in random order. `None` when every
/// pair is still held.
async fn claim_cooldown_free_video(
    ctx: &EngineContext,
    account_id: i64,
    drawn: TargetVideo,
    videos: &[TargetVideo],
    ttl: Duration,
) -> Option<TargetVideo> {
    if ctx
        .cache
        .set_nx(&cooldown_key(account_id, &drawn.video_id), "1", ttl)
        .await
    {
        return Some(drawn);
    }

    let mut alternates: Vec<&TargetVideo> = videos
        .iter()
        .filter(|video| video.video_id != drawn.video_id)
        .collect();
    alternates.shuffle(&mut rand::thread_rng());

    for video in alternates {
        if ctx
            .cache
            .set_nx(&cooldown_key(account_id, &video.video_id), "1", ttl)
            .await
        {
            return Some(video.clone());
        }
    }
    None
}

/// Active account ids eligible for this schedule's batches: the selected
/// pool when present, otherwise every active account of the owner.
async fn eligible_accounts(
    ctx: &EngineContext,
    schedule: &Schedule,
) -> Result<Vec<i64>, EngineError> {
    let selected = schedules::get_pool(&ctx.db, schedule.id, AccountPool::Selected).await?;

    let accounts = if selected.is_empty() {
        accounts::list_active_accounts(&ctx.db, schedule.user_id).await?
    } else {
        accounts::get_accounts_by_ids(&ctx.db, &selected).await?
    };

    Ok(accounts
        .into_iter()
        .filter(|account| account.status == AccountStatus::Active)
        .map(|account| account.id)
        .collect())
}
