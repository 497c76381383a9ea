//! Proxy-bound HTTP transport construction and liveness probing.
//!
//! Every account posts through its assigned proxy. An inactive proxy gets
//! one probe before use; success silently reactivates it (self-healing),
//! failure surfaces as a proxy-class error so the posting worker books it
//! against the account.

use std::time::Duration;

use rand::seq::SliceRandom;

use crate::error::PlatformError;
use crate::storage::proxies::{self, Proxy, ProxyStatus};
use crate::storage::DbPool;

/// Probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Neutral URL for liveness probes; returns 204 with an empty body.
/// Plain HTTP so the probe exercises the proxy's forwarding path.
const PROBE_URL: &str = "http://www.gstatic.com/generate_204";

/// Fixed user-agent pool to blend in with browser traffic.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:127.0) Gecko/20100101 Firefox/127.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
];

/// Pick a user agent at random.
pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Build an HTTP client routed through the given proxy.
pub fn build_proxied_client(proxy: &Proxy) -> Result<reqwest::Client, PlatformError> {
    let url = proxy.url();
    let upstream_proxy = reqwest::Proxy::all(&url).map_err(|e| PlatformError::Proxy {
        message: format!("invalid proxy url {url}: {e}"),
    })?;

    reqwest::Client::builder()
        .proxy(upstream_proxy)
        .user_agent(random_user_agent())
        .timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| PlatformError::Proxy {
            message: format!("failed to build proxied client: {e}"),
        })
}

/// Build a direct (proxyless) client.
pub fn build_direct_client() -> Result<reqwest::Client, PlatformError> {
    reqwest::Client::builder()
        .user_agent(random_user_agent())
        .timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| PlatformError::Proxy {
            message: format!("failed to build client: {e}"),
        })
}

/// Probe a proxy against the neutral URL. Returns the round-trip in
/// milliseconds on success.
pub async fn probe_proxy(proxy: &Proxy) -> Result<i64, PlatformError> {
    let client = reqwest::Client::builder()
        .proxy(
            reqwest::Proxy::all(proxy.url()).map_err(|e| PlatformError::Proxy {
                message: format!("invalid proxy url: {e}"),
            })?,
        )
        .timeout(PROBE_TIMEOUT)
        .build()
        .map_err(|e| PlatformError::Proxy {
            message: format!("failed to build probe client: {e}"),
        })?;

    let start = std::time::Instant::now();
    let response = client
        .get(PROBE_URL)
        .send()
        .await
        .map_err(|e| PlatformError::Proxy {
            message: format!("probe failed: {e}"),
        })?;

    if response.status().is_success() || response.status().as_u16() == 204 {
        Ok(i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX))
    } else {
        Err(PlatformError::Proxy {
            message: format!("probe returned HTTP {}", response.status().as_u16()),
        })
    }
}

/// Produce the transport for an account's proxy, probing and silently
/// reactivating an inactive proxy that responds.
///
/// Returns a proxy-class error when the proxy stays unreachable; the
/// caller books that against the account. Accounts without a proxy get a
/// direct client.
pub async fn ensure_transport(
    pool: &DbPool,
    proxy: Option<&Proxy>,
) -> Result<reqwest::Client, PlatformError> {
    let Some(proxy) = proxy else {
        return build_direct_client();
    };

    if proxy.status == ProxyStatus::Inactive {
        match probe_proxy(proxy).await {
            Ok(speed_ms) => {
                tracing::info!(proxy_id = proxy.id, speed_ms, "Inactive proxy passed probe, reactivating");
                proxies::record_probe(pool, proxy.id, ProxyStatus::Active, Some(speed_ms))
                    .await
                    .map_err(|e| PlatformError::Proxy {
                        message: format!("failed to persist reactivation: {e}"),
                    })?;
            }
            Err(e) => {
                proxies::record_probe(pool, proxy.id, ProxyStatus::Inactive, None)
                    .await
                    .ok();
                return Err(e);
            }
        }
    }

    build_proxied_client(proxy)
}
