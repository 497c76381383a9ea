//! Upstream video-platform integration.
//!
//! Submodules:
//! - [`client`]: reqwest implementation of the platform API
//!   (comment insert, rating, video metadata, channel verification).
//! - [`auth`]: OAuth access-token refresh.
//! - [`transport`]: proxy-bound HTTP client construction, liveness
//!   probing, and the user-agent pool.
//!
//! The [`VideoPlatform`] trait is the seam the engine posts through;
//! tests bind mock implementations.

pub mod auth;
pub mod client;
pub mod transport;

pub use auth::{RefreshedToken, TokenEndpoint};
pub use client::PlatformClient;

use crate::error::PlatformError;

/// A single comment-post request.
#[derive(Debug, Clone)]
pub struct CommentRequest<'a> {
    /// Target video.
    pub video_id: &'a str,
    /// Comment text as sanitized.
    pub text: &'a str,
    /// Upstream comment id to reply to, if this is a reply.
    pub parent_id: Option<&'a str>,
}

/// Channel identity returned by account verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Upstream channel ID.
    pub channel_id: String,
    /// Channel display title.
    pub title: String,
}

/// Platform operations the engine consumes.
///
/// Every call takes the per-account proxy-bound HTTP client so that all
/// traffic for an account leaves through its assigned egress.
#[async_trait::async_trait]
pub trait VideoPlatform: Send + Sync {
    /// Insert a comment (or reply). Returns the upstream comment id.
    async fn insert_comment(
        &self,
        http: &reqwest::Client,
        access_token: &str,
        request: &CommentRequest<'_>,
    ) -> Result<String, PlatformError>;

    /// Rate a video "like".
    async fn rate_like(
        &self,
        http: &reqwest::Client,
        access_token: &str,
        video_id: &str,
    ) -> Result<(), PlatformError>;

    /// Fetch a video's title, `None` when the video is gone.
    async fn video_title(
        &self,
        http: &reqwest::Client,
        api_key: &str,
        video_id: &str,
    ) -> Result<Option<String>, PlatformError>;

    /// Fetch the authenticated account's channel identity.
    async fn channel_info(
        &self,
        http: &reqwest::Client,
        access_token: &str,
    ) -> Result<ChannelInfo, PlatformError>;
}

/// Outcome class of a failed post attempt, driving account and profile
/// bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// API quota exhausted; profile flips to exceeded, account to limited.
    Quota,
    /// Egress failure; proxy-error counter and rotation.
    Proxy,
    /// Platform refused the content as duplicate; account stays active.
    Duplicate,
    /// OAuth refresh failed; account deactivates.
    TokenRefresh,
    /// Transient (network, 5xx, timeout); queue retries.
    Transient,
    /// Anything else; account deactivates, comment fails.
    Other,
}

/// Classify a platform failure for the posting worker.
pub fn classify(error: &PlatformError) -> FailureClass {
    match error {
        PlatformError::QuotaExceeded { .. } => FailureClass::Quota,
        PlatformError::Duplicate { .. } => FailureClass::Duplicate,
        PlatformError::Proxy { .. } => FailureClass::Proxy,
        PlatformError::RefreshFailed { .. } => FailureClass::TokenRefresh,
        PlatformError::Network { source } => {
            let text = source.to_string();
            if text_means_proxy(&text) {
                FailureClass::Proxy
            } else {
                FailureClass::Transient
            }
        }
        PlatformError::Api { status, message } => classify_api(*status, message),
    }
}

fn classify_api(status: u16, message: &str) -> FailureClass {
    if text_means_quota(message) {
        FailureClass::Quota
    } else if text_means_duplicate(message) {
        FailureClass::Duplicate
    } else if text_means_proxy(message) {
        FailureClass::Proxy
    } else if status >= 500 {
        FailureClass::Transient
    } else {
        FailureClass::Other
    }
}

/// Quota-exhaustion markers used by the upstream API.
pub(crate) fn text_means_quota(text: &str) -> bool {
    text.contains("quotaExceeded") || text.contains("dailyLimitExceeded")
}

/// Duplicate/spam refusal markers.
pub(crate) fn text_means_duplicate(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("duplicate") || lower.contains("spam")
}

/// Proxy-transport failure markers.
fn text_means_proxy(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("proxy")
}
