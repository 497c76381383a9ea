//! CRUD operations for posting accounts.
//!
//! Accounts carry OAuth token material, proxy binding, per-day usage
//! counters, and the proxy-error bookkeeping that drives deactivation.

use super::{now_ts, DbPool};
use crate::error::StorageError;

/// Dispatch eligibility of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Eligible for dispatch.
    Active,
    /// Removed from dispatch until the daily reset or operator action.
    Inactive,
    /// Quota-limited; restored by the daily reset.
    Limited,
}

/// A posting identity linked to a user, a proxy, and an API profile.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct Account {
    /// Internal auto-generated ID.
    pub id: i64,
    /// Owning user.
    pub user_id: i64,
    /// Assigned egress proxy, if any.
    pub proxy_id: Option<i64>,
    /// Credential profile used for OAuth refresh.
    pub api_profile_id: Option<i64>,
    /// Current OAuth access token.
    pub access_token: Option<String>,
    /// OAuth refresh token. Non-empty for any active account.
    pub refresh_token: String,
    /// When the access token expires.
    pub token_expiry: Option<String>,
    /// Upstream channel ID.
    pub channel_id: Option<String>,
    /// Upstream channel title.
    pub channel_title: Option<String>,
    /// Dispatch eligibility.
    pub status: AccountStatus,
    /// When the account last posted.
    pub last_used: Option<String>,
    /// Operator-facing note from the last failure.
    pub last_message: Option<String>,
    /// Consecutive proxy-class errors.
    pub proxy_error_count: i64,
    /// Proxy errors tolerated before deactivation.
    pub proxy_error_threshold: i64,
    /// Times the platform refused our content as duplicate.
    pub duplication_count: i64,
    /// Comments posted on `daily_usage_date`.
    pub daily_comment_count: i64,
    /// Likes issued on `daily_usage_date`.
    pub daily_like_count: i64,
    /// Day (YYYY-MM-DD) the daily counters refer to.
    pub daily_usage_date: Option<String>,
    /// ISO-8601 UTC creation timestamp.
    pub created_at: String,
}

impl Account {
    /// Whether the stored access token is missing or past expiry.
    pub fn token_needs_refresh(&self) -> bool {
        if self.access_token.is_none() {
            return true;
        }
        match self.token_expiry.as_deref().and_then(super::parse_ts) {
            Some(expiry) => expiry <= chrono::Utc::now(),
            None => true,
        }
    }
}

/// Parameters for creating an account.
#[derive(Debug, Clone)]
pub struct NewAccount<'a> {
    /// Owning user.
    pub user_id: i64,
    /// Assigned egress proxy.
    pub proxy_id: Option<i64>,
    /// Credential profile.
    pub api_profile_id: Option<i64>,
    /// OAuth refresh token.
    pub refresh_token: &'a str,
    /// Upstream channel ID.
    pub channel_id: Option<&'a str>,
    /// Upstream channel title.
    pub channel_title: Option<&'a str>,
}

/// Insert an account. Returns the auto-generated ID.
pub async fn insert_account(pool: &DbPool, new: &NewAccount<'_>) -> Result<i64, StorageError> {
    let result = sqlx::query(
        "INSERT INTO accounts \
         (user_id, proxy_id, api_profile_id, refresh_token, channel_id, channel_title) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(new.user_id)
    .bind(new.proxy_id)
    .bind(new.api_profile_id)
    .bind(new.refresh_token)
    .bind(new.channel_id)
    .bind(new.channel_title)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    Ok(result.last_insert_rowid())
}

/// Fetch an account by id.
pub async fn get_account(pool: &DbPool, id: i64) -> Result<Option<Account>, StorageError> {
    sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// Fetch several accounts by id, preserving no particular order.
pub async fn get_accounts_by_ids(
    pool: &DbPool,
    ids: &[i64],
) -> Result<Vec<Account>, StorageError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!("SELECT * FROM accounts WHERE id IN ({placeholders})");
    let mut query = sqlx::query_as::<_, Account>(&sql);
    for id in ids {
        query = query.bind(id);
    }
    query
        .fetch_all(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// List a user's active accounts.
pub async fn list_active_accounts(pool: &DbPool, user_id: i64) -> Result<Vec<Account>, StorageError> {
    sqlx::query_as::<_, Account>(
        "SELECT * FROM accounts WHERE user_id = ? AND status = 'active' ORDER BY id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

/// Pick a random active account of the user (aligned-proxy like path).
pub async fn random_active_account(
    pool: &DbPool,
    user_id: i64,
) -> Result<Option<Account>, StorageError> {
    sqlx::query_as::<_, Account>(
        "SELECT * FROM accounts WHERE user_id = ? AND status = 'active' ORDER BY RANDOM() LIMIT 1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

/// Persist refreshed token material.
pub async fn update_tokens(
    pool: &DbPool,
    id: i64,
    access_token: &str,
    token_expiry: &str,
) -> Result<(), StorageError> {
    sqlx::query("UPDATE accounts SET access_token = ?, token_expiry = ? WHERE id = ?")
        .bind(access_token)
        .bind(token_expiry)
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Set account status with an operator-facing note.
pub async fn set_status(
    pool: &DbPool,
    id: i64,
    status: AccountStatus,
    message: Option<&str>,
) -> Result<(), StorageError> {
    sqlx::query("UPDATE accounts SET status = ?, last_message = COALESCE(?, last_message) WHERE id = ?")
        .bind(status)
        .bind(message)
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Record a successful post: clear proxy errors, reactivate, bump the
/// daily comment counter (resetting it when the day changed), stamp
/// `last_used`.
pub async fn record_post_success(pool: &DbPool, id: i64, today: &str) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE accounts SET \
           proxy_error_count = 0, \
           status = 'active', \
           last_used = ?, \
           daily_comment_count = CASE WHEN daily_usage_date = ? THEN daily_comment_count + 1 ELSE 1 END, \
           daily_like_count = CASE WHEN daily_usage_date = ? THEN daily_like_count ELSE 0 END, \
           daily_usage_date = ? \
         WHERE id = ?",
    )
    .bind(now_ts())
    .bind(today)
    .bind(today)
    .bind(today)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Bump the daily like counter (resetting it when the day changed).
pub async fn record_like(pool: &DbPool, id: i64, today: &str) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE accounts SET \
           daily_like_count = CASE WHEN daily_usage_date = ? THEN daily_like_count + 1 ELSE 1 END, \
           daily_comment_count = CASE WHEN daily_usage_date = ? THEN daily_comment_count ELSE 0 END, \
           daily_usage_date = ? \
         WHERE id = ?",
    )
    .bind(today)
    .bind(today)
    .bind(today)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Increment the consecutive proxy-error counter; once the account's
/// threshold is reached the account is deactivated in the same statement.
/// Returns the new counter value.
pub async fn increment_proxy_error(pool: &DbPool, id: i64) -> Result<i64, StorageError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| StorageError::Connection { source: e })?;

    sqlx::query(
        "UPDATE accounts SET \
           proxy_error_count = proxy_error_count + 1, \
           status = CASE WHEN proxy_error_count + 1 >= proxy_error_threshold \
                         THEN 'inactive' ELSE status END \
         WHERE id = ?",
    )
    .bind(id)
    .execute(&mut *tx)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    let row: (i64,) = sqlx::query_as("SELECT proxy_error_count FROM accounts WHERE id = ?")
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StorageError::Query { source: e })?;

    tx.commit()
        .await
        .map_err(|e| StorageError::Connection { source: e })?;
    Ok(row.0)
}

/// Increment the duplicate-refusal counter. The account stays active.
pub async fn increment_duplication(pool: &DbPool, id: i64) -> Result<(), StorageError> {
    sqlx::query("UPDATE accounts SET duplication_count = duplication_count + 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Re-point an account at a different proxy.
pub async fn assign_proxy(pool: &DbPool, id: i64, proxy_id: Option<i64>) -> Result<(), StorageError> {
    sqlx::query("UPDATE accounts SET proxy_id = ? WHERE id = ?")
        .bind(proxy_id)
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Daily reset: inactive and limited accounts return to active with a
/// clean proxy-error slate and zeroed daily counters.
pub async fn daily_reset(pool: &DbPool) -> Result<u64, StorageError> {
    let result = sqlx::query(
        "UPDATE accounts SET \
           status = 'active', \
           proxy_error_count = 0, \
           daily_comment_count = 0, \
           daily_like_count = 0 \
         WHERE status IN ('inactive', 'limited')",
    )
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(result.rows_affected())
}
