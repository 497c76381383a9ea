//! Comment text generation and sanitization.
//!
//! A comment is either a uniform random pick from the schedule's template
//! pool or a one-shot LLM synthesis from the target video's title.
//! Sanitization trims, optionally appends emojis, and rewrites share-link
//! `si` tokens so repeated posts never carry a literal duplicate URL.

use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::llm::{GenerationParams, LlmProvider};
use crate::upstream::VideoPlatform;

/// Emitted when both the LLM and the template pool come up empty.
pub const FALLBACK_COMMENT: &str = "Amazing video, keep it up!";

/// Emoji pool for the optional three-emoji suffix.
const EMOJIS: &[&str] = &["🔥", "👏", "💯", "😍", "🎉", "🙌", "✨", "❤️"];

/// Per-attempt timeout for the title lookup.
const TITLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Title lookup retry backoff, seconds.
const TITLE_BACKOFF_SECS: [u64; 3] = [1, 2, 4];

/// System prompt for comment synthesis.
const SYSTEM_PROMPT: &str =
    "You write short, natural-sounding comments for videos. Reply with the comment only.";

/// Random 16-character token for rewritten share links.
pub fn random_si_token() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| {
            let idx = rng.gen_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}

/// Rewrite every `si=` share-token query parameter to a fresh random
/// token, so embedded short-form URLs differ across posts.
pub fn rewrite_share_tokens(text: &str) -> String {
    static SHARE_TOKEN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = SHARE_TOKEN
        .get_or_init(|| regex::Regex::new(r"([?&]si=)[A-Za-z0-9_-]+").expect("static regex"));
    re.replace_all(text, |caps: &regex::Captures<'_>| {
        format!("{}{}", &caps[1], random_si_token())
    })
    .into_owned()
}

/// Append three random emojis from the fixed pool.
fn append_emojis(text: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..3)
        .filter_map(|_| EMOJIS.choose(&mut rng))
        .copied()
        .collect();
    format!("{text} {suffix}")
}

/// Sanitize a comment before posting: trim, optional emoji suffix,
/// share-token rewrite.
pub fn sanitize(text: &str, include_emojis: bool) -> String {
    let trimmed = text.trim();
    let with_emojis = if include_emojis {
        append_emojis(trimmed)
    } else {
        trimmed.to_string()
    };
    rewrite_share_tokens(&with_emojis)
}

/// The composed comment and where it came from.
#[derive(Debug, Clone)]
pub struct ComposedComment {
    /// The raw comment text (sanitize separately at dispatch).
    pub text: String,
    /// True when the LLM produced this text (candidate for the pool).
    pub from_ai: bool,
}

/// Produces comment text for a dispatch.
pub struct CommentComposer {
    llm: Option<std::sync::Arc<dyn LlmProvider>>,
}

impl CommentComposer {
    /// Create a composer; `llm` is `None` when no provider is configured.
    pub fn new(llm: Option<std::sync::Arc<dyn LlmProvider>>) -> Self {
        Self { llm }
    }

    /// Uniform random pick from a template pool.
    pub fn pick_template(templates: &[String]) -> Option<String> {
        templates.choose(&mut rand::thread_rng()).cloned()
    }

    /// Compose one comment.
    ///
    /// With `use_ai`, fetches the video title (3 attempts, 1/2/4s backoff,
    /// 10s per attempt) and prompts the LLM; any failure falls back to the
    /// template pool, then to the fixed default.
    pub async fn compose(
        &self,
        platform: &dyn VideoPlatform,
        http: &reqwest::Client,
        api_key: &str,
        video_id: &str,
        video_title: Option<&str>,
        templates: &[String],
        use_ai: bool,
    ) -> ComposedComment {
        if use_ai {
            if let Some(text) = self
                .synthesize(platform, http, api_key, video_id, video_title)
                .await
            {
                return ComposedComment {
                    text,
                    from_ai: true,
                };
            }
            tracing::debug!(video_id, "AI synthesis unavailable, falling back to templates");
        }

        let text = Self::pick_template(templates).unwrap_or_else(|| FALLBACK_COMMENT.to_string());
        ComposedComment {
            text,
            from_ai: false,
        }
    }

    /// AI path: title lookup with retries, then a single completion.
    /// `None` on any failure.
    async fn synthesize(
        &self,
        platform: &dyn VideoPlatform,
        http: &reqwest::Client,
        api_key: &str,
        video_id: &str,
        cached_title: Option<&str>,
    ) -> Option<String> {
        let llm = self.llm.as_ref()?;

        let title = match cached_title {
            Some(title) if !title.is_empty() => title.to_string(),
            _ => self.fetch_title(platform, http, api_key, video_id).await?,
        };

        let prompt = format!(
            "Write one short, enthusiastic comment for a video titled \"{title}\". \
             Keep it under 25 words."
        );

        match llm.complete(SYSTEM_PROMPT, &prompt, &GenerationParams::default()).await {
            Ok(text) => {
                let text = text.trim().trim_matches('"').to_string();
                if text.is_empty() {
                    None
                } else {
                    Some(text)
                }
            }
            Err(e) => {
                tracing::warn!(video_id, error = %e, "LLM synthesis failed");
                None
            }
        }
    }

    async fn fetch_title(
        &self,
        platform: &dyn VideoPlatform,
        http: &reqwest::Client,
        api_key: &str,
        video_id: &str,
    ) -> Option<String> {
        for (attempt, backoff) in TITLE_BACKOFF_SECS.iter().enumerate() {
            let lookup = platform.video_title(http, api_key, video_id);
            match tokio::time::timeout(TITLE_TIMEOUT, lookup).await {
                Ok(Ok(Some(title))) => return Some(title),
                Ok(Ok(None)) => {
                    tracing::warn!(video_id, "Video has no metadata, skipping AI synthesis");
                    return None;
                }
                Ok(Err(e)) => {
                    tracing::debug!(video_id, attempt, error = %e, "Title lookup failed");
                }
                Err(_) => {
                    tracing::debug!(video_id, attempt, "Title lookup timed out");
                }
            }
            if attempt + 1 < TITLE_BACKOFF_SECS.len() {
                tokio::time::sleep(Duration::from_secs(*backoff)).await;
            }
        }
        None
    }
}
