//! Pipeline-stage handler trait, handler registry, and built-in handlers.
//!
//! A crawler definition wires stage identifiers to handler identifiers;
//! the registry resolves those identifiers into [`StageHandler`]
//! capabilities at startup. Dispatch is a table lookup, never reflection.
//!
//! Handlers must be idempotent: delivery is at-least-once, and a worker
//! crash mid-operation can replay work on a later run.

mod fetch;
mod parse;
mod seed;
mod store;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use trawler_shared::{Operation, Result, StageOutput, TrawlerError};

pub use fetch::FetchHandler;
pub use parse::ParseHandler;
pub use seed::SeedHandler;
pub use store::StoreHandler;

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Read access to a crawler's tags, provided by the execution engine.
/// Tag writes travel back through [`StageOutput`] instead.
#[async_trait]
pub trait TagRead: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;
}

/// Everything a handler can see while processing one operation.
pub struct StageContext {
    /// Owning crawler name.
    pub crawler: String,
    /// Stage identifier being executed.
    pub stage: String,
    /// Stage `params` table from the crawler definition.
    pub params: serde_json::Value,
    /// Per-crawler `[config]` table from the definition.
    pub crawler_config: serde_json::Value,
    /// Process-wide HTTP cache setting (consumed here, not by the core).
    pub http_cache: bool,
    /// Tag reads for the owning crawler.
    pub tags: Arc<dyn TagRead>,
}

impl StageContext {
    /// A string param, from the stage params table.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    /// A required string param; missing means the definition wired this
    /// stage incompletely.
    pub fn require_param_str(&self, key: &str) -> Result<&str> {
        self.param_str(key).ok_or_else(|| {
            TrawlerError::stage(&self.stage, format!("missing required param '{key}'"))
        })
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A pipeline-stage capability: consume one operation, produce derived
/// operations and tag writes.
#[async_trait]
pub trait StageHandler: Send + Sync + std::fmt::Debug {
    /// Handler identifier used in crawler definitions.
    fn name(&self) -> &'static str;

    /// Process one operation. Failures surface as
    /// [`TrawlerError::Stage`]; handlers never panic on malformed input.
    async fn handle(&self, ctx: &StageContext, op: &Operation) -> Result<StageOutput>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Declarative handler-id → handler table, resolved once at startup.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StageHandler>>,
}

impl HandlerRegistry {
    /// Create a registry with all built-in handlers.
    pub fn new() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        registry.register(Arc::new(SeedHandler));
        registry.register(Arc::new(FetchHandler::new()));
        registry.register(Arc::new(ParseHandler));
        registry.register(Arc::new(StoreHandler));
        registry
    }

    /// Create an empty registry (custom handler sets, tests).
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under its own name, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn StageHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    /// Look up a handler by identifier.
    pub fn get(&self, id: &str) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(id).cloned()
    }

    /// Look up a handler, failing with a validation error naming the id.
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn StageHandler>> {
        self.get(id)
            .ok_or_else(|| TrawlerError::validation(format!("unknown stage handler '{id}'")))
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

/// Tag reader over a fixed map, for handler tests.
#[cfg(test)]
pub(crate) struct StaticTags(pub HashMap<String, serde_json::Value>);

#[cfg(test)]
#[async_trait]
impl TagRead for StaticTags {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.0.get(key).cloned())
    }
}

#[cfg(test)]
pub(crate) fn test_context(params: serde_json::Value) -> StageContext {
    StageContext {
        crawler: "demo".into(),
        stage: "test".into(),
        params,
        crawler_config: serde_json::json!({}),
        http_cache: false,
        tags: Arc::new(StaticTags(HashMap::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_builtins() {
        let registry = HandlerRegistry::new();
        for id in ["seed", "fetch", "parse", "store"] {
            assert!(registry.get(id).is_some(), "missing builtin {id}");
        }
    }

    #[test]
    fn registry_rejects_unknown_handler() {
        let registry = HandlerRegistry::new();
        let err = registry.resolve("mystery").unwrap_err();
        assert!(err.to_string().contains("mystery"));
    }

    #[test]
    fn registry_registration_replaces() {
        #[derive(Debug)]
        struct Dummy;

        #[async_trait]
        impl StageHandler for Dummy {
            fn name(&self) -> &'static str {
                "seed"
            }

            async fn handle(
                &self,
                _ctx: &StageContext,
                _op: &Operation,
            ) -> Result<StageOutput> {
                Ok(StageOutput::default())
            }
        }

        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Dummy));
        assert!(registry.get("seed").is_some());
    }
}
