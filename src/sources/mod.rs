//! Shared HTTP plumbing for every external source this crate talks to:
//! registries, PubMed, the web-search API, and the LLM provider. Each
//! client owns one of these constructors and funnels requests/responses
//! through the helpers below so caching, retries, and body limits are
//! consistent across sources.

pub mod rate_limit;

pub mod clinicaltrials;
pub mod drks;
pub mod euctr;
pub mod llm;
pub mod pubmed;
pub mod websearch;

use std::borrow::Cow;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http_cache_reqwest::{CACacheManager, Cache, CacheMode, HttpCache, HttpCacheOptions};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::RetryTransientMiddleware;
use reqwest_retry::policies::ExponentialBackoff;

use crate::error::PublinkError;

const MAX_BODY_BYTES: usize = 20 * 1024 * 1024;
const BODY_EXCERPT_LEN: usize = 512;

static NO_CACHE: AtomicBool = AtomicBool::new(false);

/// Set once at startup from `--no-cache` / `PUBLINK_NO_CACHE`.
pub fn set_no_cache(disabled: bool) {
    NO_CACHE.store(disabled, Ordering::Relaxed);
}

fn no_cache() -> bool {
    NO_CACHE.load(Ordering::Relaxed)
}

/// A client with HTTP caching and retry middleware, suitable for JSON APIs
/// where repeated lookups of the same resource are common and a forgiving
/// cache window is acceptable (registries, PubMed, web search, LLM sync
/// completions). This is the default for every client in this crate.
pub fn shared_client() -> Result<ClientWithMiddleware, PublinkError> {
    let inner = reqwest::Client::builder()
        .user_agent(concat!("publink/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(PublinkError::from)?;

    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

    let cache_dir = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("publink")
        .join("http");

    Ok(ClientBuilder::new(inner)
        .with(Cache(HttpCache {
            mode: CacheMode::Default,
            manager: CACacheManager { path: cache_dir },
            options: HttpCacheOptions::default(),
        }))
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build())
}

/// A plain `reqwest::Client` with no caching middleware, used where
/// responses are streamed, gzip-decoded by hand, or paginated via an
/// opaque cursor URL that caching middleware should never intercept.
pub fn streaming_http_client() -> Result<reqwest::Client, PublinkError> {
    reqwest::Client::builder()
        .user_agent(concat!("publink/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(60))
        .build()
        .map_err(PublinkError::from)
}

/// Resolve a source's base URL: environment override, else the built-in
/// default. Mirrors every client's `*_BASE_ENV` override convention.
pub fn env_base(default: &'static str, env_var: &str) -> Cow<'static, str> {
    match std::env::var(env_var) {
        Ok(value) if !value.trim().is_empty() => Cow::Owned(value),
        _ => Cow::Borrowed(default),
    }
}

/// Force a bypass of the HTTP cache middleware for this one request when
/// `--no-cache` is set, without disabling caching globally for other
/// in-flight clients.
pub fn apply_cache_mode(
    req: reqwest_middleware::RequestBuilder,
) -> reqwest_middleware::RequestBuilder {
    if no_cache() {
        req.with_extension(CacheMode::NoStore)
    } else {
        req
    }
}

/// Read a response body up to a fixed cap, refusing to buffer an
/// unbounded payload from a misbehaving upstream.
pub async fn read_limited_body(
    resp: reqwest::Response,
    api: &str,
) -> Result<Bytes, PublinkError> {
    let mut stream = resp;
    let mut buf = Vec::new();
    while let Some(chunk) = stream.chunk().await.map_err(|source| PublinkError::Api {
        api: api.to_string(),
        message: format!("failed reading response body: {source}"),
    })? {
        if buf.len() + chunk.len() > MAX_BODY_BYTES {
            return Err(PublinkError::Api {
                api: api.to_string(),
                message: format!("response body exceeded {MAX_BODY_BYTES} bytes"),
            });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buf))
}

/// A short, UTF-8-lossy preview of a response body, safe to embed in an
/// error message without dumping megabytes of HTML into logs.
pub fn body_excerpt(bytes: &[u8]) -> String {
    let take = bytes.len().min(BODY_EXCERPT_LEN);
    let mut excerpt = String::from_utf8_lossy(&bytes[..take]).into_owned();
    if bytes.len() > take {
        excerpt.push_str("...");
    }
    excerpt
}

/// Send a request built by `build_request`, retrying transient failures
/// (connect errors, timeouts, 5xx, 429) up to `max_retries` times with
/// exponential backoff. Used for clients built on a plain (non-middleware)
/// client, where `RetryTransientMiddleware` does not apply.
pub async fn retry_send<F, Fut>(
    api: &str,
    max_retries: u32,
    build_request: F,
) -> Result<reqwest::Response, PublinkError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    let mut attempt = 0;
    loop {
        match build_request().await {
            Ok(resp) if resp.status().is_server_error() || resp.status().as_u16() == 429 => {
                if attempt >= max_retries {
                    return Ok(resp);
                }
                tokio::time::sleep(backoff_delay(attempt)).await;
                attempt += 1;
            }
            Ok(resp) => return Ok(resp),
            Err(source) if attempt < max_retries && is_transient(&source) => {
                tokio::time::sleep(backoff_delay(attempt)).await;
                attempt += 1;
            }
            Err(source) => {
                return Err(PublinkError::Api {
                    api: api.to_string(),
                    message: source.to_string(),
                });
            }
        }
    }
}

fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(200u64.saturating_mul(1u64 << attempt.min(5)))
}
