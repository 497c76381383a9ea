//! CRUD operations for upstream API credential profiles.
//!
//! At most one profile per user is active at a time; activation is
//! transactional. Quota accounting and the exceeded flag live here.

use super::{now_ts, DbPool};
use crate::error::StorageError;

/// Quota state of an API profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProfileStatus {
    /// Quota available.
    NotExceeded,
    /// Daily quota exhausted; cleared by the midnight reset.
    Exceeded,
}

/// A set of upstream API credentials with quota accounting.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct ApiProfile {
    /// Internal auto-generated ID.
    pub id: i64,
    /// Owning user.
    pub user_id: i64,
    /// Operator-facing label.
    pub label: String,
    /// OAuth client ID.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: String,
    /// OAuth redirect URI.
    pub redirect_uri: String,
    /// Data API key.
    pub api_key: String,
    /// Quota units consumed today.
    pub used_quota: i64,
    /// Operator-configured quota ceiling (display only).
    pub limit_quota: i64,
    /// Quota state.
    pub status: ProfileStatus,
    /// When the quota was observed exceeded.
    pub exceeded_at: Option<String>,
    /// Whether this is the user's active profile.
    pub is_active: bool,
    /// ISO-8601 UTC creation timestamp.
    pub created_at: String,
}

/// Parameters for creating a profile.
#[derive(Debug, Clone)]
pub struct NewApiProfile<'a> {
    /// Owning user.
    pub user_id: i64,
    /// Operator-facing label.
    pub label: &'a str,
    /// OAuth client ID.
    pub client_id: &'a str,
    /// OAuth client secret.
    pub client_secret: &'a str,
    /// OAuth redirect URI.
    pub redirect_uri: &'a str,
    /// Data API key.
    pub api_key: &'a str,
    /// Quota ceiling.
    pub limit_quota: i64,
}

/// Insert a profile. Returns the auto-generated ID.
pub async fn insert_profile(pool: &DbPool, new: &NewApiProfile<'_>) -> Result<i64, StorageError> {
    let result = sqlx::query(
        "INSERT INTO api_profiles \
         (user_id, label, client_id, client_secret, redirect_uri, api_key, limit_quota) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(new.user_id)
    .bind(new.label)
    .bind(new.client_id)
    .bind(new.client_secret)
    .bind(new.redirect_uri)
    .bind(new.api_key)
    .bind(new.limit_quota)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    Ok(result.last_insert_rowid())
}

/// Fetch a profile by id.
pub async fn get_profile(pool: &DbPool, id: i64) -> Result<Option<ApiProfile>, StorageError> {
    sqlx::query_as::<_, ApiProfile>("SELECT * FROM api_profiles WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// Fetch the user's active profile, if any.
pub async fn get_active_profile(
    pool: &DbPool,
    user_id: i64,
) -> Result<Option<ApiProfile>, StorageError> {
    sqlx::query_as::<_, ApiProfile>(
        "SELECT * FROM api_profiles WHERE user_id = ? AND is_active = 1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

/// List a user's profiles, most recently created first.
///
/// Used as the fallback order when the primary profile's refresh fails.
pub async fn list_profiles_by_recency(
    pool: &DbPool,
    user_id: i64,
) -> Result<Vec<ApiProfile>, StorageError> {
    sqlx::query_as::<_, ApiProfile>(
        "SELECT * FROM api_profiles WHERE user_id = ? ORDER BY created_at DESC, id DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}

/// Activate one profile, deactivating all others of the same user atomically.
pub async fn activate_profile(pool: &DbPool, user_id: i64, id: i64) -> Result<(), StorageError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| StorageError::Connection { source: e })?;

    sqlx::query("UPDATE api_profiles SET is_active = 0 WHERE user_id = ?")
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Query { source: e })?;

    let updated = sqlx::query("UPDATE api_profiles SET is_active = 1 WHERE id = ? AND user_id = ?")
        .bind(id)
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Query { source: e })?;

    if updated.rows_affected() == 0 {
        return Err(StorageError::NotFound {
            entity: "api_profile",
            id,
        });
    }

    tx.commit()
        .await
        .map_err(|e| StorageError::Connection { source: e })?;
    Ok(())
}

/// Charge quota units against a profile after a successful API call.
pub async fn add_quota_usage(pool: &DbPool, id: i64, cost: i64) -> Result<(), StorageError> {
    sqlx::query("UPDATE api_profiles SET used_quota = used_quota + ? WHERE id = ?")
        .bind(cost)
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Mark a profile's quota as exceeded.
pub async fn mark_exceeded(pool: &DbPool, id: i64) -> Result<(), StorageError> {
    sqlx::query("UPDATE api_profiles SET status = 'exceeded', exceeded_at = ? WHERE id = ?")
        .bind(now_ts())
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Daily reset: zero usage and clear the exceeded flag on every profile.
pub async fn reset_all_quotas(pool: &DbPool) -> Result<u64, StorageError> {
    let result = sqlx::query(
        "UPDATE api_profiles SET used_quota = 0, status = 'not_exceeded', exceeded_at = NULL",
    )
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{init_test_db, users};

    async fn seed_user(pool: &DbPool) -> i64 {
        users::insert_user(pool, "owner@example.com")
            .await
            .expect("user")
    }

    fn sample(user_id: i64, label: &str) -> NewApiProfile<'_> {
        NewApiProfile {
            user_id,
            label,
            client_id: "cid",
            client_secret: "secret",
            redirect_uri: "http://localhost/cb",
            api_key: "key",
            limit_quota: 10_000,
        }
    }

    #[tokio::test]
    async fn activate_is_exclusive() {
        let pool = init_test_db().await.expect("init");
        let uid = seed_user(&pool).await;
        let a = insert_profile(&pool, &sample(uid, "a")).await.expect("a");
        let b = insert_profile(&pool, &sample(uid, "b")).await.expect("b");

        activate_profile(&pool, uid, a).await.expect("activate a");
        activate_profile(&pool, uid, b).await.expect("activate b");

        let active = get_active_profile(&pool, uid)
            .await
            .expect("get")
            .expect("one active");
        assert_eq!(active.id, b);

        let first = get_profile(&pool, a).await.expect("get").expect("exists");
        assert!(!first.is_active);
    }

    #[tokio::test]
    async fn activate_unknown_profile_errors() {
        let pool = init_test_db().await.expect("init");
        let uid = seed_user(&pool).await;
        let err = activate_profile(&pool, uid, 999).await;
        assert!(matches!(err, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn quota_accounting_and_reset() {
        let pool = init_test_db().await.expect("init");
        let uid = seed_user(&pool).await;
        let id = insert_profile(&pool, &sample(uid, "p")).await.expect("p");

        add_quota_usage(&pool, id, 50).await.expect("charge");
        add_quota_usage(&pool, id, 50).await.expect("charge");
        mark_exceeded(&pool, id).await.expect("exceed");

        let profile = get_profile(&pool, id).await.expect("get").expect("exists");
        assert_eq!(profile.used_quota, 100);
        assert_eq!(profile.status, ProfileStatus::Exceeded);
        assert!(profile.exceeded_at.is_some());

        reset_all_quotas(&pool).await.expect("reset");
        let profile = get_profile(&pool, id).await.expect("get").expect("exists");
        assert_eq!(profile.used_quota, 0);
        assert_eq!(profile.status, ProfileStatus::NotExceeded);
        assert!(profile.exceeded_at.is_none());
    }

    #[tokio::test]
    async fn recency_order_newest_first() {
        let pool = init_test_db().await.expect("init");
        let uid = seed_user(&pool).await;
        insert_profile(&pool, &sample(uid, "old")).await.expect("old");
        let newest = insert_profile(&pool, &sample(uid, "new")).await.expect("new");

        let profiles = list_profiles_by_recency(&pool, uid).await.expect("list");
        assert_eq!(profiles.first().map(|p| p.id), Some(newest));
    }
}
