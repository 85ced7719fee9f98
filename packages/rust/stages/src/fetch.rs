//! Fetch handler: HTTP GET of the operation's URL, with optional
//! content-hash caching to suppress unchanged downstream work.

use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;

use trawler_shared::{Operation, Result, StageOutput, TrawlerError};

use crate::{StageContext, StageHandler};

/// User-Agent string for fetch requests.
const USER_AGENT: &str = concat!("trawler/", env!("CARGO_PKG_VERSION"));

/// Fetches `payload.url` and emits the response body to the `next` stage.
///
/// Params: `next` (optional stage id; nothing is emitted without it).
/// When the process-wide HTTP cache is enabled, an unchanged response body
/// (same content hash as the recorded `cache:` tag) short-circuits:
/// nothing is emitted downstream.
#[derive(Debug)]
pub struct FetchHandler {
    client: reqwest::Client,
}

impl FetchHandler {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for FetchHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute SHA-256 hash of content.
fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Tag key under which a URL's last-seen content hash is recorded.
fn cache_key(url: &str) -> String {
    format!("cache:{}", compute_hash(url))
}

#[async_trait]
impl StageHandler for FetchHandler {
    fn name(&self) -> &'static str {
        "fetch"
    }

    async fn handle(&self, ctx: &StageContext, op: &Operation) -> Result<StageOutput> {
        let raw_url = op
            .payload
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TrawlerError::stage(&ctx.stage, "payload has no 'url'"))?;
        let url = Url::parse(raw_url)
            .map_err(|e| TrawlerError::stage(&ctx.stage, format!("invalid url '{raw_url}': {e}")))?;

        debug!(crawler = %ctx.crawler, %url, "fetching");

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| TrawlerError::stage(&ctx.stage, format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TrawlerError::stage(
                &ctx.stage,
                format!("{url}: HTTP {status}"),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| TrawlerError::stage(&ctx.stage, format!("{url}: body read failed: {e}")))?;
        let content_hash = compute_hash(&body);

        let mut output = StageOutput::default();

        if ctx.http_cache {
            let key = cache_key(url.as_str());
            match ctx.tags.get(&key).await {
                Ok(Some(previous)) if previous == serde_json::json!(content_hash) => {
                    debug!(crawler = %ctx.crawler, %url, "content unchanged, skipping");
                    return Ok(output);
                }
                Ok(_) => {}
                Err(e) => warn!(crawler = %ctx.crawler, %url, error = %e, "cache lookup failed"),
            }
            output.tag(key, serde_json::json!(content_hash));
        }

        if let Some(next) = ctx.param_str("next") {
            output.emit(
                next,
                serde_json::json!({
                    "url": url.as_str(),
                    "status": status.as_u16(),
                    "body": body,
                    "hash": content_hash,
                }),
            );
        }

        Ok(output)
    }
}
