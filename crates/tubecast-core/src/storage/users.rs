//! Minimal user records.
//!
//! Users are created by the external authentication service; the engine
//! only needs them as the ownership root for accounts, proxies, and
//! schedules.

use super::DbPool;
use crate::error::StorageError;

/// An identity owner. All proxies, accounts, and schedules hang off a user.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct User {
    /// Internal auto-generated ID.
    pub id: i64,
    /// Unique email address.
    pub email: String,
    /// Optional display name.
    pub display_name: Option<String>,
    /// ISO-8601 UTC creation timestamp.
    pub created_at: String,
}

/// Insert a user. Returns the auto-generated ID.
pub async fn insert_user(pool: &DbPool, email: &str) -> Result<i64, StorageError> {
    let result = sqlx::query("INSERT INTO users (email) VALUES (?)")
        .bind(email)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;

    Ok(result.last_insert_rowid())
}

/// Fetch a user by id.
pub async fn get_user(pool: &DbPool, id: i64) -> Result<Option<User>, StorageError> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}
