//! Store handler: records a document tag keyed by content hash.

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::debug;

use trawler_shared::{Operation, Result, StageOutput, TrawlerError};

use crate::{StageContext, StageHandler};

/// Terminal stage: writes one `doc:<hash>` tag per stored document.
/// Idempotent — restoring the same content overwrites the same tag.
#[derive(Debug)]
pub struct StoreHandler;

#[async_trait]
impl StageHandler for StoreHandler {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn handle(&self, ctx: &StageContext, op: &Operation) -> Result<StageOutput> {
        let url = op
            .payload
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TrawlerError::stage(&ctx.stage, "payload has no 'url'"))?;
        let body = op
            .payload
            .get("body")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TrawlerError::stage(&ctx.stage, "payload has no 'body'"))?;

        let mut hasher = Sha256::new();
        hasher.update(body.as_bytes());
        let hash = format!("{:x}", hasher.finalize());

        let mut output = StageOutput::default();
        output.tag(
            format!("doc:{hash}"),
            serde_json::json!({
                "url": url,
                "title": op.payload.get("title").cloned().unwrap_or_default(),
                "stored_at": Utc::now().to_rfc3339(),
            }),
        );

        debug!(crawler = %ctx.crawler, url, hash = %&hash[..12], "stored document");
        Ok(output)
    }
}
