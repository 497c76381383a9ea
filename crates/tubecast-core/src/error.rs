//! Error types for the TubeCast core library.
//!
//! Each boundary has its own error enum to keep failure domains separate.
//! The library uses `thiserror` for structured, typed errors.

/// Errors raised while loading `config.toml` or validating the merged
/// result of file values and `TUBECAST_` environment overrides.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No config file exists at the resolved path.
    #[error("no config file at {path}; `tubecast init` writes one")]
    NotFound {
        /// The path that was checked.
        path: String,
    },

    /// The file is not valid TOML for the expected sections.
    #[error("config file is not valid TOML: {source}")]
    Toml {
        /// The underlying TOML parse error.
        #[source]
        source: toml::de::Error,
    },

    /// A merged value is outside what the engine accepts.
    #[error("config value {field} rejected: {reason}")]
    Invalid {
        /// Dotted path of the offending field (e.g. `queue.lease_secs`).
        field: String,
        /// Why the engine cannot run with it.
        reason: String,
    },
}

/// Errors from SQLite storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to connect to the SQLite database.
    #[error("database connection error: {source}")]
    Connection {
        /// The underlying SQLx error.
        #[source]
        source: sqlx::Error,
    },

    /// Database migration failed.
    #[error("database migration error: {source}")]
    Migration {
        /// The underlying migration error.
        #[source]
        source: sqlx::migrate::MigrateError,
    },

    /// A database query failed.
    #[error("database query error: {source}")]
    Query {
        /// The underlying SQLx error.
        #[source]
        source: sqlx::Error,
    },

    /// A row referenced by id does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind (e.g. "schedule", "account").
        entity: &'static str,
        /// The id that was looked up.
        id: i64,
    },

    /// A JSON column could not be decoded.
    #[error("corrupt {column} column: {source}")]
    CorruptColumn {
        /// The column that failed to decode.
        column: &'static str,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from the durable job queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The backing store rejected a queue operation.
    #[error("queue storage error: {source}")]
    Storage {
        /// The underlying SQLx error.
        #[source]
        source: sqlx::Error,
    },

    /// A job payload could not be serialized or deserialized.
    #[error("job payload error: {source}")]
    Payload {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from interacting with the upstream video platform API.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// Daily API quota for the active profile is exhausted.
    #[error("platform quota exceeded: {message}")]
    QuotaExceeded {
        /// The error message from the API.
        message: String,
    },

    /// The platform refused the comment as a duplicate.
    #[error("platform rejected duplicate content: {message}")]
    Duplicate {
        /// The error message from the API.
        message: String,
    },

    /// The request could not leave through the account's proxy.
    #[error("proxy transport failed: {message}")]
    Proxy {
        /// Details about the proxy failure.
        message: String,
    },

    /// OAuth token refresh failed; the account needs re-authorization.
    #[error("token refresh failed: {message}")]
    RefreshFailed {
        /// Details from the token endpoint.
        message: String,
    },

    /// Network-level failure communicating with the platform.
    #[error("platform network error: {source}")]
    Network {
        /// The underlying HTTP client error.
        #[source]
        source: reqwest::Error,
    },

    /// Any other platform error response.
    #[error("platform error (HTTP {status}): {message}")]
    Api {
        /// The HTTP status code.
        status: u16,
        /// The error message from the API.
        message: String,
    },
}

/// Errors from interacting with LLM providers.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// HTTP request to the LLM endpoint failed.
    #[error("LLM HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// LLM API returned an error response.
    #[error("LLM API error (status {status}): {message}")]
    Api {
        /// The HTTP status code.
        status: u16,
        /// The error message from the API.
        message: String,
    },

    /// LLM response could not be parsed.
    #[error("failed to parse LLM response: {0}")]
    Parse(String),

    /// No LLM provider configured.
    #[error("no LLM provider configured")]
    NotConfigured,
}

/// Errors surfaced by the scheduling engine's handlers.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Underlying queue failure.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Underlying platform failure.
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// The schedule is misconfigured and needs operator attention.
    #[error("schedule {schedule_id} requires review: {message}")]
    RequiresReview {
        /// The affected schedule.
        schedule_id: i64,
        /// What the operator needs to fix.
        message: String,
    },

    /// A cron expression failed to parse.
    #[error("invalid cron expression '{expression}': {message}")]
    InvalidCron {
        /// The offending expression.
        expression: String,
        /// Parser detail.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_not_found_points_at_init() {
        let err = ConfigError::NotFound {
            path: "/home/op/.tubecast/config.toml".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "no config file at /home/op/.tubecast/config.toml; `tubecast init` writes one"
        );
    }

    #[test]
    fn config_error_invalid_message() {
        let err = ConfigError::Invalid {
            field: "queue.post_concurrency".to_string(),
            reason: "must be greater than zero".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "config value queue.post_concurrency rejected: must be greater than zero"
        );
    }

    #[test]
    fn storage_error_not_found_message() {
        let err = StorageError::NotFound {
            entity: "schedule",
            id: 42,
        };
        assert_eq!(err.to_string(), "schedule 42 not found");
    }

    #[test]
    fn platform_error_quota_message() {
        let err = PlatformError::QuotaExceeded {
            message: "quotaExceeded".to_string(),
        };
        assert_eq!(err.to_string(), "platform quota exceeded: quotaExceeded");
    }

    #[test]
    fn platform_error_api_message() {
        let err = PlatformError::Api {
            status: 400,
            message: "Bad Request".to_string(),
        };
        assert_eq!(err.to_string(), "platform error (HTTP 400): Bad Request");
    }

    #[test]
    fn llm_error_not_configured_message() {
        let err = LlmError::NotConfigured;
        assert_eq!(err.to_string(), "no LLM provider configured");
    }

    #[test]
    fn engine_error_requires_review_message() {
        let err = EngineError::RequiresReview {
            schedule_id: 7,
            message: "no target videos configured".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "schedule 7 requires review: no target videos configured"
        );
    }

    #[test]
    fn engine_error_invalid_cron_message() {
        let err = EngineError::InvalidCron {
            expression: "bad".to_string(),
            message: "unparseable".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid cron expression 'bad': unparseable"
        );
    }
}
