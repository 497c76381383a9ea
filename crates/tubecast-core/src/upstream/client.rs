//! Reqwest-based platform API client.
//!
//! Implements [`VideoPlatform`] against the v3 data API with typed error
//! mapping. The caller supplies the per-account HTTP client so traffic
//! stays bound to the account's proxy.

use serde::Deserialize;

use crate::error::PlatformError;

use super::{text_means_duplicate, text_means_quota, ChannelInfo, CommentRequest, VideoPlatform};

/// Default platform API base URL.
const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";

/// HTTP client for the platform data API.
pub struct PlatformClient {
    base_url: String,
}

impl PlatformClient {
    /// Create a client against the production base URL.
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Create a client with a custom base URL (for testing with wiremock).
    pub fn with_base_url(base_url: String) -> Self {
        Self { base_url }
    }

    /// Map an HTTP error response to a typed `PlatformError`.
    async fn map_error_response(response: reqwest::Response) -> PlatformError {
        let status = response.status().as_u16();
        let raw_body = response.text().await.unwrap_or_default();

        let message = match serde_json::from_str::<ApiErrorEnvelope>(&raw_body) {
            Ok(envelope) => {
                let reasons: Vec<String> = envelope
                    .error
                    .errors
                    .iter()
                    .filter_map(|e| e.reason.clone())
                    .collect();
                if reasons.is_empty() {
                    envelope.error.message
                } else {
                    format!("{} ({})", envelope.error.message, reasons.join(", "))
                }
            }
            Err(_) => raw_body,
        };

        if text_means_quota(&message) {
            PlatformError::QuotaExceeded { message }
        } else if text_means_duplicate(&message) {
            PlatformError::Duplicate { message }
        } else {
            PlatformError::Api { status, message }
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, PlatformError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::map_error_response(response).await)
        }
    }
}

impl Default for PlatformClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl VideoPlatform for PlatformClient {
    async fn insert_comment(
        &self,
        http: &reqwest::Client,
        access_token: &str,
        request: &CommentRequest<'_>,
    ) -> Result<String, PlatformError> {
        let response = if let Some(parent_id) = request.parent_id {
            // Replies go through the comments endpoint.
            let body = serde_json::json!({
                "snippet": {
                    "parentId": parent_id,
                    "textOriginal": request.text,
                }
            });
            http.post(format!("{}/comments", self.base_url))
                .query(&[("part", "snippet")])
                .bearer_auth(access_token)
                .json(&body)
                .send()
                .await
                .map_err(|source| PlatformError::Network { source })?
        } else {
            let body = serde_json::json!({
                "snippet": {
                    "videoId": request.video_id,
                    "topLevelComment": {
                        "snippet": { "textOriginal": request.text }
                    }
                }
            });
            http.post(format!("{}/commentThreads", self.base_url))
                .query(&[("part", "snippet")])
                .bearer_auth(access_token)
                .json(&body)
                .send()
                .await
                .map_err(|source| PlatformError::Network { source })?
        };

        let response = Self::check(response).await?;
        let body: InsertedComment = response.json().await.map_err(|e| PlatformError::Api {
            status: 200,
            message: format!("malformed insert response: {e}"),
        })?;

        tracing::debug!(video_id = request.video_id, external_id = %body.id, "Comment inserted");
        Ok(body.id)
    }

    async fn rate_like(
        &self,
        http: &reqwest::Client,
        access_token: &str,
        video_id: &str,
    ) -> Result<(), PlatformError> {
        let response = http
            .post(format!("{}/videos/rate", self.base_url))
            .query(&[("id", video_id), ("rating", "like")])
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|source| PlatformError::Network { source })?;

        Self::check(response).await?;
        tracing::debug!(video_id, "Video rated like");
        Ok(())
    }

    async fn video_title(
        &self,
        http: &reqwest::Client,
        api_key: &str,
        video_id: &str,
    ) -> Result<Option<String>, PlatformError> {
        let response = http
            .get(format!("{}/videos", self.base_url))
            .query(&[("part", "snippet"), ("id", video_id), ("key", api_key)])
            .send()
            .await
            .map_err(|source| PlatformError::Network { source })?;

        let response = Self::check(response).await?;
        let body: VideoList = response.json().await.map_err(|e| PlatformError::Api {
            status: 200,
            message: format!("malformed video list: {e}"),
        })?;

        Ok(body
            .items
            .into_iter()
            .next()
            .map(|item| item.snippet.title))
    }

    async fn channel_info(
        &self,
        http: &reqwest::Client,
        access_token: &str,
    ) -> Result<ChannelInfo, PlatformError> {
        let response = http
            .get(format!("{}/channels", self.base_url))
            .query(&[("part", "snippet"), ("mine", "true")])
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|source| PlatformError::Network { source })?;

        let response = Self::check(response).await?;
        let body: ChannelList = response.json().await.map_err(|e| PlatformError::Api {
            status: 200,
            message: format!("malformed channel list: {e}"),
        })?;

        body.items
            .into_iter()
            .next()
            .map(|item| ChannelInfo {
                channel_id: item.id,
                title: item.snippet.title,
            })
            .ok_or(PlatformError::Api {
                status: 200,
                message: "no channel for authenticated account".to_string(),
            })
    }
}

// --- Internal serde types ---

#[derive(Deserialize)]
struct InsertedComment {
    id: String,
}

#[derive(Deserialize)]
struct VideoList {
    #[serde(default)]
    items: Vec<SnippetItem>,
}

#[derive(Deserialize)]
struct ChannelList {
    #[serde(default)]
    items: Vec<ChannelItem>,
}

#[derive(Deserialize)]
struct SnippetItem {
    snippet: Snippet,
}

#[derive(Deserialize)]
struct ChannelItem {
    id: String,
    snippet: Snippet,
}

#[derive(Deserialize)]
struct Snippet {
    title: String,
}

#[derive(Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> PlatformClient {
        PlatformClient::with_base_url(server.uri())
    }

    #[tokio::test]
    async fn insert_top_level_comment_returns_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/commentThreads"))
            .and(query_param("part", "snippet"))
            .and(body_string_contains("vid123"))
            .and(body_string_contains("great video"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "id": "thread-1" })),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let http = reqwest::Client::new();
        let id = client
            .insert_comment(
                &http,
                "token",
                &CommentRequest {
                    video_id: "vid123",
                    text: "great video",
                    parent_id: None,
                },
            )
            .await
            .expect("insert");
        assert_eq!(id, "thread-1");
    }

    #[tokio::test]
    async fn insert_reply_uses_comments_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/comments"))
            .and(body_string_contains("parent-9"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "id": "reply-1" })),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let http = reqwest::Client::new();
        let id = client
            .insert_comment(
                &http,
                "token",
                &CommentRequest {
                    video_id: "vid123",
                    text: "me too",
                    parent_id: Some("parent-9"),
                },
            )
            .await
            .expect("insert");
        assert_eq!(id, "reply-1");
    }

    #[tokio::test]
    async fn quota_error_body_maps_to_quota_exceeded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/commentThreads"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "error": {
                    "code": 403,
                    "message": "The request cannot be completed because you have exceeded your quota.",
                    "errors": [{ "reason": "quotaExceeded" }]
                }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let http = reqwest::Client::new();
        let err = client
            .insert_comment(
                &http,
                "token",
                &CommentRequest {
                    video_id: "v",
                    text: "t",
                    parent_id: None,
                },
            )
            .await
            .expect_err("should fail");
        assert!(matches!(err, PlatformError::QuotaExceeded { .. }));
    }

    #[tokio::test]
    async fn duplicate_error_body_maps_to_duplicate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/commentThreads"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {
                    "code": 400,
                    "message": "Duplicate comment detected",
                    "errors": [{ "reason": "processingFailure" }]
                }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let http = reqwest::Client::new();
        let err = client
            .insert_comment(
                &http,
                "token",
                &CommentRequest {
                    video_id: "v",
                    text: "t",
                    parent_id: None,
                },
            )
            .await
            .expect_err("should fail");
        assert!(matches!(err, PlatformError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn rate_like_hits_rate_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/videos/rate"))
            .and(query_param("id", "vid123"))
            .and(query_param("rating", "like"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let http = reqwest::Client::new();
        client
            .rate_like(&http, "token", "vid123")
            .await
            .expect("rate");
    }

    #[tokio::test]
    async fn video_title_reads_first_item() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/videos"))
            .and(query_param("id", "vid123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{ "snippet": { "title": "How to Bake Bread" } }]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let http = reqwest::Client::new();
        let title = client
            .video_title(&http, "api-key", "vid123")
            .await
            .expect("fetch");
        assert_eq!(title.as_deref(), Some("How to Bake Bread"));
    }

    #[tokio::test]
    async fn missing_video_title_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/videos"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "items": [] })),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let http = reqwest::Client::new();
        let title = client
            .video_title(&http, "api-key", "gone")
            .await
            .expect("fetch");
        assert!(title.is_none());
    }

    #[tokio::test]
    async fn channel_info_reads_identity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channels"))
            .and(query_param("mine", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{ "id": "UC42", "snippet": { "title": "My Channel" } }]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let http = reqwest::Client::new();
        let info = client.channel_info(&http, "token").await.expect("fetch");
        assert_eq!(
            info,
            ChannelInfo {
                channel_id: "UC42".to_string(),
                title: "My Channel".to_string()
            }
        );
    }
}
