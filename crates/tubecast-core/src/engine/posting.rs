//! Post-comment job handler: one upstream comment attempt end-to-end.
//!
//! Claim the comment row, refresh the OAuth token if stale, build the
//! proxy-bound transport, sanitize, call the platform, classify the
//! outcome, and book the effects on the comment, account, profile, and
//! schedule counters.

use chrono::Utc;

use crate::content;
use crate::error::PlatformError;
use crate::queue::{JobError, JobHandler, JobRecord};
use crate::storage::accounts::{self, Account, AccountStatus};
use crate::storage::api_profiles::{self, ApiProfile};
use crate::storage::comments::{self, Comment};
use crate::storage::{format_ts, proxies, schedules};
use crate::upstream::{classify, transport, CommentRequest, FailureClass};

use super::{EngineContext, PostCommentPayload};

/// A valid access token for an account, refreshing through the account's
/// profile first and the user's other profiles in recency order as
/// fallback. Token material is persisted before returning; the account
/// object is never mutated.
pub(crate) async fn ensure_access_token(
    ctx: &EngineContext,
    account: &Account,
) -> Result<String, PlatformError> {
    if !account.token_needs_refresh() {
        if let Some(token) = &account.access_token {
            return Ok(token.clone());
        }
    }

    if account.refresh_token.is_empty() {
        return Err(PlatformError::RefreshFailed {
            message: "account has no refresh token".to_string(),
        });
    }

    let mut candidates: Vec<ApiProfile> = Vec::new();
    if let Some(profile_id) = account.api_profile_id {
        if let Some(profile) = api_profiles::get_profile(&ctx.db, profile_id)
            .await
            .map_err(|e| PlatformError::RefreshFailed {
                message: format!("profile load failed: {e}"),
            })?
        {
            candidates.push(profile);
        }
    }
    for profile in api_profiles::list_profiles_by_recency(&ctx.db, account.user_id)
        .await
        .map_err(|e| PlatformError::RefreshFailed {
            message: format!("profile list failed: {e}"),
        })?
    {
        if !candidates.iter().any(|c| c.id == profile.id) {
            candidates.push(profile);
        }
    }

    if candidates.is_empty() {
        return Err(PlatformError::RefreshFailed {
            message: "no API profile available for refresh".to_string(),
        });
    }

    let http = transport::build_direct_client()?;
    let mut last_error = String::new();
    for profile in candidates {
        match ctx
            .token_endpoint
            .refresh(
                &http,
                &profile.client_id,
                &profile.client_secret,
                &account.refresh_token,
            )
            .await
        {
            Ok(refreshed) => {
                accounts::update_tokens(
                    &ctx.db,
                    account.id,
                    &refreshed.access_token,
                    &format_ts(refreshed.expires_at),
                )
                .await
                .map_err(|e| PlatformError::RefreshFailed {
                    message: format!("failed to persist tokens: {e}"),
                })?;
                return Ok(refreshed.access_token);
            }
            Err(e) => {
                tracing::warn!(
                    account_id = account.id,
                    profile_id = profile.id,
                    error = %e,
                    "Token refresh attempt failed"
                );
                last_error = e.to_string();
            }
        }
    }

    Err(PlatformError::RefreshFailed {
        message: last_error,
    })
}

/// Handler for `post-comment` jobs.
pub struct PostCommentHandler {
    ctx: EngineContext,
}

impl PostCommentHandler {
    /// Create the handler.
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Today's date in the quota-reset timezone (daily usage bucketing).
    fn local_today(&self) -> String {
        let tz: chrono_tz::Tz = self
            .ctx
            .config
            .maintenance
            .quota_reset_timezone
            .parse()
            .unwrap_or(chrono_tz::UTC);
        Utc::now().with_timezone(&tz).format("%Y-%m-%d").to_string()
    }

    /// Terminal failure bookkeeping shared by every failure class.
    async fn fail_comment(&self, comment: &Comment, message: &str) {
        if let Err(e) = comments::mark_failed(&self.ctx.db, comment.id, message).await {
            tracing::warn!(comment_id = comment.id, error = %e, "Failed to mark comment failed");
        }
        if let Err(e) = schedules::increment_failed(&self.ctx.db, comment.schedule_id).await {
            tracing::warn!(schedule_id = comment.schedule_id, error = %e, "Failed counter update failed");
        }
        self.invalidate_schedule_cache(comment.schedule_id).await;
    }

    async fn invalidate_schedule_cache(&self, schedule_id: i64) {
        self.ctx
            .cache
            .delete(&format!("schedule:{schedule_id}"))
            .await;
    }

    /// Proxy-class failure: bump the error counter (deactivating at the
    /// threshold) and rotate the account onto another active proxy.
    async fn book_proxy_error(&self, account: &Account) {
        match accounts::increment_proxy_error(&self.ctx.db, account.id).await {
            Ok(count) => {
                tracing::warn!(
                    account_id = account.id,
                    proxy_error_count = count,
                    "Proxy error recorded"
                );
            }
            Err(e) => {
                tracing::warn!(account_id = account.id, error = %e, "Proxy error bookkeeping failed");
            }
        }

        match proxies::random_active_proxy(&self.ctx.db, account.user_id, account.proxy_id).await {
            Ok(Some(fresh)) => {
                tracing::info!(
                    account_id = account.id,
                    proxy_id = fresh.id,
                    "Rotating account to a fresh proxy"
                );
                if let Err(e) = accounts::assign_proxy(&self.ctx.db, account.id, Some(fresh.id)).await {
                    tracing::warn!(account_id = account.id, error = %e, "Proxy rotation failed");
                }
            }
            Ok(None) => {
                tracing::warn!(account_id = account.id, "No alternative active proxy to rotate to");
            }
            Err(e) => {
                tracing::warn!(account_id = account.id, error = %e, "Proxy lookup failed");
            }
        }
    }

    /// Book a classified failure. Returns the job outcome.
    async fn book_failure(
        &self,
        comment: &Comment,
        account: &Account,
        error: &PlatformError,
    ) -> Result<(), JobError> {
        let class = classify(error);
        let message = error.to_string();

        match class {
            FailureClass::Transient => {
                // Leave the row pending so the retried job can re-claim it.
                if let Err(e) = comments::release_to_pending(&self.ctx.db, comment.id).await {
                    tracing::warn!(comment_id = comment.id, error = %e, "Release failed");
                }
                return Err(JobError::Retryable(message));
            }
            FailureClass::Quota => {
                if let Some(profile_id) = account.api_profile_id {
                    if let Err(e) = api_profiles::mark_exceeded(&self.ctx.db, profile_id).await {
                        tracing::warn!(profile_id, error = %e, "Quota flag update failed");
                    }
                }
                let _ = accounts::set_status(
                    &self.ctx.db,
                    account.id,
                    AccountStatus::Limited,
                    Some(&message),
                )
                .await;
            }
            FailureClass::Proxy => {
                self.book_proxy_error(account).await;
            }
            FailureClass::Duplicate => {
                let _ = accounts::increment_duplication(&self.ctx.db, account.id).await;
            }
            FailureClass::TokenRefresh | FailureClass::Other => {
                let _ = accounts::set_status(
                    &self.ctx.db,
                    account.id,
                    AccountStatus::Inactive,
                    Some(&message),
                )
                .await;
            }
        }

        self.fail_comment(comment, &message).await;
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobHandler for PostCommentHandler {
    async fn handle(&self, job: &JobRecord) -> Result<(), JobError> {
        let payload: PostCommentPayload = job
            .payload_as()
            .map_err(|e| JobError::Terminal(format!("bad payload: {e}")))?;

        let comment = match comments::get_comment(&self.ctx.db, payload.comment_id).await {
            Ok(Some(comment)) => comment,
            Ok(None) => {
                tracing::debug!(comment_id = payload.comment_id, "Comment deleted, dropping job");
                return Ok(());
            }
            Err(e) => return Err(JobError::Retryable(format!("comment load failed: {e}"))),
        };

        // The pending → scheduled transition serializes duplicate
        // deliveries: a second delivery loses the claim and drops out.
        match comments::claim_for_posting(&self.ctx.db, comment.id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(
                    comment_id = comment.id,
                    status = ?comment.status,
                    "Comment not claimable, dropping duplicate delivery"
                );
                return Ok(());
            }
            Err(e) => return Err(JobError::Retryable(format!("claim failed: {e}"))),
        }

        let schedule = match schedules::get_schedule(&self.ctx.db, comment.schedule_id).await {
            Ok(Some(schedule)) => schedule,
            Ok(None) => {
                self.fail_comment(&comment, "schedule deleted").await;
                return Ok(());
            }
            Err(e) => return Err(JobError::Retryable(format!("schedule load failed: {e}"))),
        };

        let account = match accounts::get_account(&self.ctx.db, comment.account_id).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                self.fail_comment(&comment, "account deleted").await;
                return Ok(());
            }
            Err(e) => return Err(JobError::Retryable(format!("account load failed: {e}"))),
        };

        if account.status != AccountStatus::Active {
            self.fail_comment(&comment, "account not active").await;
            return Ok(());
        }

        let access_token = match ensure_access_token(&self.ctx, &account).await {
            Ok(token) => token,
            Err(error) => return self.book_failure(&comment, &account, &error).await,
        };

        let proxy = match account.proxy_id {
            Some(proxy_id) => proxies::get_proxy(&self.ctx.db, proxy_id)
                .await
                .map_err(|e| JobError::Retryable(format!("proxy load failed: {e}")))?,
            None => None,
        };
        let http = match transport::ensure_transport(&self.ctx.db, proxy.as_ref()).await {
            Ok(http) => http,
            Err(error) => return self.book_failure(&comment, &account, &error).await,
        };

        let text = content::sanitize(&comment.content, schedule.include_emojis);
        let request = CommentRequest {
            video_id: &comment.video_id,
            text: &text,
            parent_id: comment.parent_id.as_deref(),
        };

        match self
            .ctx
            .platform
            .insert_comment(&http, &access_token, &request)
            .await
        {
            Ok(external_id) => {
                comments::mark_posted(&self.ctx.db, comment.id, &external_id)
                    .await
                    .map_err(|e| JobError::Retryable(format!("post bookkeeping failed: {e}")))?;

                let today = self.local_today();
                if let Err(e) = accounts::record_post_success(&self.ctx.db, account.id, &today).await
                {
                    tracing::warn!(account_id = account.id, error = %e, "Account bookkeeping failed");
                }
                if let Some(profile_id) = account.api_profile_id {
                    if let Err(e) = api_profiles::add_quota_usage(
                        &self.ctx.db,
                        profile_id,
                        self.ctx.config.limits.comment_quota_cost,
                    )
                    .await
                    {
                        tracing::warn!(profile_id, error = %e, "Quota bookkeeping failed");
                    }
                }
                if let Err(e) = schedules::increment_posted(&self.ctx.db, comment.schedule_id).await
                {
                    tracing::warn!(schedule_id = comment.schedule_id, error = %e, "Posted counter failed");
                }
                self.invalidate_schedule_cache(comment.schedule_id).await;

                tracing::info!(
                    comment_id = comment.id,
                    account_id = account.id,
                    external_id = %external_id,
                    "Comment posted"
                );
                Ok(())
            }
            Err(error) => self.book_failure(&comment, &account, &error).await,
        }
    }
}
