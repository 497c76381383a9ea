//! CRUD operations for egress proxies.
//!
//! Proxy status transitions are driven by health probes and by observed
//! success or failure during real traffic; reactivation of a probed-alive
//! proxy is silent (self-healing).

use super::{now_ts, DbPool};
use crate::error::StorageError;

/// Availability of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProxyStatus {
    /// Usable for traffic.
    Active,
    /// Failed a probe or live traffic; retried by probe before use.
    Inactive,
}

/// Proxy wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProxyProtocol {
    /// Plain HTTP CONNECT proxy.
    Http,
    /// HTTPS proxy.
    Https,
    /// SOCKS5 proxy.
    Socks5,
}

impl ProxyProtocol {
    /// URL scheme for this protocol.
    pub fn scheme(self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks5 => "socks5",
        }
    }
}

/// A remote egress endpoint owned by a user.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct Proxy {
    /// Internal auto-generated ID.
    pub id: i64,
    /// Owning user.
    pub user_id: i64,
    /// Proxy host.
    pub host: String,
    /// Proxy port.
    pub port: i64,
    /// Optional username.
    pub username: Option<String>,
    /// Optional password.
    pub password: Option<String>,
    /// Wire protocol.
    pub protocol: ProxyProtocol,
    /// Availability.
    pub status: ProxyStatus,
    /// When the proxy was last probed.
    pub last_checked: Option<String>,
    /// Observed probe round-trip in milliseconds.
    pub connection_speed_ms: Option<i64>,
    /// ISO-8601 UTC creation timestamp.
    pub created_at: String,
}

impl Proxy {
    /// Build the proxy URL: `proto://[user:pass@]host:port`.
    pub fn url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}://{}:{}@{}:{}",
                self.protocol.scheme(),
                user,
                pass,
                self.host,
                self.port
            ),
            _ => format!("{}://{}:{}", self.protocol.scheme(), self.host, self.port),
        }
    }
}

/// Parameters for creating a proxy.
#[derive(Debug, Clone)]
pub struct NewProxy<'a> {
    /// Owning user.
    pub user_id: i64,
    /// Proxy host.
    pub host: &'a str,
    /// Proxy port.
    pub port: u16,
    /// Optional username.
    pub username: Option<&'a str>,
    /// Optional password.
    pub password: Option<&'a str>,
    /// Wire protocol.
    pub protocol: ProxyProtocol,
}

/// Insert a proxy. Returns the auto-generated ID.
pub async fn insert_proxy(pool: &DbPool, new: &NewProxy<'_>) -> Result<i64, StorageError> {
    let result = sqlx::query(
        "INSERT INTO proxies (user_id, host, port, username, password, protocol) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(new.user_id)
    .bind(new.host)
    .bind(i64::from(new.port))
    .bind(new.username)
    .bind(new.password)
    .bind(new.protocol)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    Ok(result.last_insert_rowid())
}

/// Fetch a proxy by id.
pub async fn get_proxy(pool: &DbPool, id: i64) -> Result<Option<Proxy>, StorageError> {
    sqlx::query_as::<_, Proxy>("SELECT * FROM proxies WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })
}

/// Record a probe result, updating status, latency, and the check timestamp.
pub async fn record_probe(
    pool: &DbPool,
    id: i64,
    status: ProxyStatus,
    speed_ms: Option<i64>,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE proxies SET status = ?, connection_speed_ms = ?, last_checked = ? WHERE id = ?",
    )
    .bind(status)
    .bind(speed_ms)
    .bind(now_ts())
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Pick a random active proxy of the same user, excluding one id.
///
/// Used to rotate an account off a failing proxy.
pub async fn random_active_proxy(
    pool: &DbPool,
    user_id: i64,
    exclude_id: Option<i64>,
) -> Result<Option<Proxy>, StorageError> {
    sqlx::query_as::<_, Proxy>(
        "SELECT * FROM proxies \
         WHERE user_id = ? AND status = 'active' AND id != COALESCE(?, -1) \
         ORDER BY RANDOM() LIMIT 1",
    )
    .bind(user_id)
    .bind(exclude_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })
}
