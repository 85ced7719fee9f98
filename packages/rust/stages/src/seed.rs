//! Seed handler: fans the configured start URLs out to the next stage.

use async_trait::async_trait;
use tracing::debug;

use trawler_shared::{Operation, Result, StageOutput};

use crate::{StageContext, StageHandler};

/// Emits one derived operation per `urls` entry to the `next` stage.
///
/// Params: `next` (required stage id), `urls` (list of strings).
#[derive(Debug)]
pub struct SeedHandler;

#[async_trait]
impl StageHandler for SeedHandler {
    fn name(&self) -> &'static str {
        "seed"
    }

    async fn handle(&self, ctx: &StageContext, _op: &Operation) -> Result<StageOutput> {
        let next = ctx.require_param_str("next")?;

        let mut output = StageOutput::default();
        let urls = ctx
            .params
            .get("urls")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        for url in urls.iter().filter_map(|u| u.as_str()) {
            output.emit(next, serde_json::json!({ "url": url }));
        }

        debug!(
            crawler = %ctx.crawler,
            seeded = output.operations.len(),
            next,
            "seeded start urls"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_context;

    fn seed_op() -> Operation {
        Operation::new("demo", "init", serde_json::json!({}))
    }

    #[tokio::test]
    async fn emits_one_operation_per_url() {
        let ctx = test_context(serde_json::json!({
            "next": "fetch",
            "urls": ["https://example.com/a", "https://example.com/b"],
        }));

        let output = SeedHandler.handle(&ctx, &seed_op()).await.unwrap();
        assert_eq!(output.operations.len(), 2);
        assert!(output.operations.iter().all(|op| op.stage == "fetch"));
        assert_eq!(output.operations[0].payload["url"], "https://example.com/a");
        assert!(output.tags.is_empty());
    }

    #[tokio::test]
    async fn no_urls_emits_nothing() {
        let ctx = test_context(serde_json::json!({ "next": "fetch" }));
        let output = SeedHandler.handle(&ctx, &seed_op()).await.unwrap();
        assert!(output.operations.is_empty());
    }

    #[tokio::test]
    async fn missing_next_is_a_stage_error() {
        let ctx = test_context(serde_json::json!({ "urls": ["https://example.com"] }));
        let err = SeedHandler.handle(&ctx, &seed_op()).await.unwrap_err();
        assert!(err.to_string().contains("next"));
    }
}
