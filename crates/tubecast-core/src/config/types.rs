//! Configuration section structs and their serde default functions.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Data storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file. `~` expands to the home directory.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.tubecast/tubecast.db".to_string()
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Worker pool sizes and queue lease settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Concurrent `schedule-processing` handlers.
    #[serde(default = "default_schedule_concurrency")]
    pub schedule_concurrency: u32,

    /// Concurrent `post-comment` handlers.
    #[serde(default = "default_post_concurrency")]
    pub post_concurrency: u32,

    /// Concurrent `simulate-view` handlers.
    #[serde(default = "default_view_concurrency")]
    pub view_concurrency: u32,

    /// Global claim rate for the post-comment pool (jobs per second).
    #[serde(default = "default_post_rate_per_sec")]
    pub post_rate_per_sec: u32,

    /// Job lease duration in seconds; renewed while a handler runs.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Idle poll interval for workers in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            schedule_concurrency: default_schedule_concurrency(),
            post_concurrency: default_post_concurrency(),
            view_concurrency: default_view_concurrency(),
            post_rate_per_sec: default_post_rate_per_sec(),
            lease_secs: default_lease_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_schedule_concurrency() -> u32 {
    5
}

fn default_post_concurrency() -> u32 {
    100
}

fn default_view_concurrency() -> u32 {
    5
}

fn default_post_rate_per_sec() -> u32 {
    100
}

fn default_lease_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    250
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Per-batch dispatch pacing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Default stagger between consecutive post-comment jobs in a batch,
    /// in milliseconds. A schedule may override it.
    #[serde(default = "default_between_accounts_ms")]
    pub between_accounts_ms: u64,

    /// Hard wall-clock ceiling for the row-creation loop of one batch.
    #[serde(default = "default_dispatch_ceiling_secs")]
    pub dispatch_ceiling_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            between_accounts_ms: default_between_accounts_ms(),
            dispatch_ceiling_secs: default_dispatch_ceiling_secs(),
        }
    }
}

fn default_between_accounts_ms() -> u64 {
    1500
}

fn default_dispatch_ceiling_secs() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Account and quota thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Consecutive proxy errors before an account is deactivated.
    #[serde(default = "default_proxy_error_threshold")]
    pub proxy_error_threshold: u32,

    /// Quota units charged per successful comment insert.
    #[serde(default = "default_comment_quota_cost")]
    pub comment_quota_cost: i64,

    /// Handler errors before a schedule is parked for review.
    #[serde(default = "default_max_schedule_errors")]
    pub max_schedule_errors: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            proxy_error_threshold: default_proxy_error_threshold(),
            comment_quota_cost: default_comment_quota_cost(),
            max_schedule_errors: default_max_schedule_errors(),
        }
    }
}

fn default_proxy_error_threshold() -> u32 {
    20
}

fn default_comment_quota_cost() -> i64 {
    50
}

fn default_max_schedule_errors() -> u32 {
    50
}

// ---------------------------------------------------------------------------
// LLM
// ---------------------------------------------------------------------------

/// LLM provider configuration for AI comment synthesis.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// Provider name: "openai" or any OpenAI-compatible endpoint.
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    /// Chat completions base URL.
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// API key. Usually supplied via `TUBECAST_LLM_API_KEY`.
    #[serde(default)]
    pub api_key: String,

    /// Model identifier.
    #[serde(default = "default_llm_model")]
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            base_url: default_llm_base_url(),
            api_key: String::new(),
            model: default_llm_model(),
        }
    }
}

fn default_llm_provider() -> String {
    "openai".to_string()
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

/// Maintenance loop intervals and the quota-reset timezone.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MaintenanceConfig {
    /// IANA timezone whose local midnight triggers the daily quota reset.
    #[serde(default = "default_quota_reset_timezone")]
    pub quota_reset_timezone: String,

    /// Seconds between maintenance sweeps (orphan jobs, cleanup).
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    /// Seconds between progress-counter reconciliation passes.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            quota_reset_timezone: default_quota_reset_timezone(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
        }
    }
}

fn default_quota_reset_timezone() -> String {
    "UTC".to_string()
}

fn default_maintenance_interval_secs() -> u64 {
    600
}

fn default_reconcile_interval_secs() -> u64 {
    1800
}
