//! OAuth 2.0 access-token refresh.
//!
//! Refresh is a plain form POST against the token endpoint using the
//! account's profile credentials. The function returns the new token
//! material; callers persist it. Refresh never mutates live state.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::PlatformError;

/// Default OAuth token endpoint.
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Fallback token lifetime when the endpoint omits `expires_in`.
const DEFAULT_EXPIRY_SECS: i64 = 3600;

/// Fresh token material from a successful refresh.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    /// The new Bearer access token.
    pub access_token: String,
    /// When the token expires (UTC).
    pub expires_at: DateTime<Utc>,
}

/// The token endpoint to refresh against.
#[derive(Debug, Clone)]
pub struct TokenEndpoint {
    url: String,
}

impl Default for TokenEndpoint {
    fn default() -> Self {
        Self {
            url: TOKEN_URL.to_string(),
        }
    }
}

impl TokenEndpoint {
    /// Endpoint with a custom URL (for testing with wiremock).
    pub fn with_url(url: String) -> Self {
        Self { url }
    }

    /// Exchange a refresh token for a new access token.
    pub async fn refresh(
        &self,
        http: &reqwest::Client,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<RefreshedToken, PlatformError> {
        tracing::debug!("Refreshing upstream access token");

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ];

        let response = http
            .post(&self.url)
            .form(&params)
            .send()
            .await
            .map_err(|source| PlatformError::Network { source })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(PlatformError::RefreshFailed {
                message: format!("HTTP {status}: {body}"),
            });
        }

        let body: RefreshResponse = response.json().await.map_err(|e| {
            PlatformError::RefreshFailed {
                message: format!("malformed token response: {e}"),
            }
        })?;

        let expires_in = body.expires_in.unwrap_or(DEFAULT_EXPIRY_SECS);
        Ok(RefreshedToken {
            access_token: body.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in),
        })
    }
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}
