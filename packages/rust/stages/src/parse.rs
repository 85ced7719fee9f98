//! Parse handler: extracts in-scope links from fetched HTML and fans
//! them back out to the fetch stage; forwards content downstream.

use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use trawler_shared::{Operation, Result, StageOutput, TrawlerError};

use crate::{StageContext, StageHandler};

/// Extracts links from `payload.body`, filters them against the
/// crawler's scope, and emits them to the `fetch` stage given in params.
/// The page itself is forwarded to the optional `store` stage.
///
/// Params: `fetch` (stage id for discovered links), `store` (optional
/// stage id for the parsed page). Crawler config: `include_patterns`,
/// `exclude_patterns` (glob-style path patterns).
#[derive(Debug)]
pub struct ParseHandler;

#[async_trait]
impl StageHandler for ParseHandler {
    fn name(&self) -> &'static str {
        "parse"
    }

    async fn handle(&self, ctx: &StageContext, op: &Operation) -> Result<StageOutput> {
        let raw_url = op
            .payload
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TrawlerError::stage(&ctx.stage, "payload has no 'url'"))?;
        let base_url = Url::parse(raw_url)
            .map_err(|e| TrawlerError::stage(&ctx.stage, format!("invalid url '{raw_url}': {e}")))?;
        let body = op
            .payload
            .get("body")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TrawlerError::stage(&ctx.stage, "payload has no 'body'"))?;

        let scope = PageScope::new(&base_url, &ctx.crawler_config);
        let (links, title) = {
            // scraper::Html is not Send; parse in a scope that drops it
            // before the next await point.
            let doc = Html::parse_document(body);
            (extract_links(&doc, &base_url), extract_title(&doc))
        };

        let mut output = StageOutput::default();

        if let Some(fetch_stage) = ctx.param_str("fetch") {
            for link in links.iter().filter(|l| scope.in_scope(l)) {
                output.emit(fetch_stage, serde_json::json!({ "url": link.as_str() }));
            }
        }

        if let Some(store_stage) = ctx.param_str("store") {
            output.emit(
                store_stage,
                serde_json::json!({
                    "url": base_url.as_str(),
                    "title": title,
                    "body": body,
                }),
            );
        }

        debug!(
            crawler = %ctx.crawler,
            url = %base_url,
            links = links.len(),
            emitted = output.operations.len(),
            "parsed page"
        );
        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// Scope checking
// ---------------------------------------------------------------------------

/// Determines which discovered URLs stay in scope for a crawler.
struct PageScope {
    base_host: String,
    include_patterns: Vec<regex::Regex>,
    exclude_patterns: Vec<regex::Regex>,
}

impl PageScope {
    fn new(base_url: &Url, config: &serde_json::Value) -> Self {
        Self {
            base_host: base_url.host_str().unwrap_or("").to_string(),
            include_patterns: config_patterns(config, "include_patterns"),
            exclude_patterns: config_patterns(config, "exclude_patterns"),
        }
    }

    fn in_scope(&self, url: &Url) -> bool {
        if url.scheme() != "http" && url.scheme() != "https" {
            return false;
        }

        if url.host_str().unwrap_or("") != self.base_host {
            return false;
        }

        let path = url.path();

        for pattern in &self.exclude_patterns {
            if pattern.is_match(path) {
                return false;
            }
        }

        if !self.include_patterns.is_empty() {
            return self.include_patterns.iter().any(|p| p.is_match(path));
        }

        true
    }
}

fn config_patterns(config: &serde_json::Value, key: &str) -> Vec<regex::Regex> {
    config
        .get(key)
        .and_then(|v| v.as_array())
        .map(|patterns| {
            patterns
                .iter()
                .filter_map(|p| p.as_str())
                .filter_map(glob_to_regex)
                .collect()
        })
        .unwrap_or_default()
}

/// Convert a glob-like pattern to a regex.
fn glob_to_regex(pattern: &str) -> Option<regex::Regex> {
    let escaped = regex::escape(pattern)
        .replace(r"\*\*", ".*")
        .replace(r"\*", "[^/]*")
        .replace(r"\?", ".");
    regex::Regex::new(&format!("^{escaped}$")).ok()
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Extract all links from a document, resolved against the base URL.
fn extract_links(doc: &Html, base_url: &Url) -> Vec<Url> {
    let link_sel = Selector::parse("a[href]").expect("static selector");
    let mut links = Vec::new();

    for el in doc.select(&link_sel) {
        if let Some(href) = el.value().attr("href") {
            // Skip anchors, javascript:, mailto:
            if href.starts_with('#')
                || href.starts_with("javascript:")
                || href.starts_with("mailto:")
            {
                continue;
            }

            if let Ok(mut resolved) = base_url.join(href) {
                resolved.set_fragment(None);
                links.push(resolved);
            }
        }
    }

    links
}

/// Extract title from the first H1, if any.
fn extract_title(doc: &Html) -> Option<String> {
    let h1_sel = Selector::parse("h1").expect("static selector");
    doc.select(&h1_sel)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_context;

    fn page_op(url: &str, body: &str) -> Operation {
        Operation::new(
            "demo",
            "parse",
            serde_json::json!({ "url": url, "body": body }),
        )
    }

    const PAGE: &str = r##"<html><body>
        <h1>Guide</h1>
        <a href="/docs/intro">Intro</a>
        <a href="/blog/post-1">Blog</a>
        <a href="https://other.example.com/x">External</a>
        <a href="#section">Anchor</a>
        <a href="mailto:a@b.c">Mail</a>
    </body></html>"##;

    #[tokio::test]
    async fn emits_same_host_links_to_fetch_stage() {
        let ctx = test_context(serde_json::json!({ "fetch": "fetch" }));
        let output = ParseHandler
            .handle(&ctx, &page_op("https://docs.example.com/guide", PAGE))
            .await
            .unwrap();

        let urls: Vec<&str> = output
            .operations
            .iter()
            .map(|op| op.payload["url"].as_str().unwrap())
            .collect();
        assert!(urls.contains(&"https://docs.example.com/docs/intro"));
        assert!(urls.contains(&"https://docs.example.com/blog/post-1"));
        // Cross-host, anchor, and mailto links are dropped.
        assert!(!urls.iter().any(|u| u.contains("other.example.com")));
        assert!(!urls.iter().any(|u| u.contains('#')));
        assert_eq!(urls.len(), 2);
    }

    #[tokio::test]
    async fn exclude_patterns_drop_matching_paths() {
        let mut ctx = test_context(serde_json::json!({ "fetch": "fetch" }));
        ctx.crawler_config = serde_json::json!({ "exclude_patterns": ["/blog/**"] });

        let output = ParseHandler
            .handle(&ctx, &page_op("https://docs.example.com/guide", PAGE))
            .await
            .unwrap();

        let urls: Vec<&str> = output
            .operations
            .iter()
            .map(|op| op.payload["url"].as_str().unwrap())
            .collect();
        assert_eq!(urls, vec!["https://docs.example.com/docs/intro"]);
    }

    #[tokio::test]
    async fn store_stage_receives_page_with_title() {
        let ctx = test_context(serde_json::json!({ "store": "store" }));
        let output = ParseHandler
            .handle(&ctx, &page_op("https://docs.example.com/guide", PAGE))
            .await
            .unwrap();

        assert_eq!(output.operations.len(), 1);
        let stored = &output.operations[0];
        assert_eq!(stored.stage, "store");
        assert_eq!(stored.payload["title"], "Guide");
    }

    #[tokio::test]
    async fn missing_body_is_a_stage_error() {
        let ctx = test_context(serde_json::json!({ "fetch": "fetch" }));
        let op = Operation::new(
            "demo",
            "parse",
            serde_json::json!({ "url": "https://example.com" }),
        );
        let err = ParseHandler.handle(&ctx, &op).await.unwrap_err();
        assert!(err.to_string().contains("body"));
    }
}
