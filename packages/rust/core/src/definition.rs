//! Crawler definitions: one TOML file per crawler, loaded once at
//! startup and never mutated afterwards.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use trawler_shared::{Result, Schedule, TrawlerError};
use trawler_stages::HandlerRegistry;

/// Params keys whose string values wire one stage to another.
const WIRING_KEYS: &[&str] = &["next", "fetch", "store"];

/// One pipeline stage inside a crawler definition.
#[derive(Debug, Clone, Deserialize)]
pub struct StageDef {
    /// Registered handler identifier this stage dispatches to.
    pub handler: String,
    /// Free-form handler params (start urls, stage wiring, ...).
    #[serde(default = "empty_object")]
    pub params: serde_json::Value,
}

/// Immutable definition of one crawler.
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlerDefinition {
    /// Unique key; defaults to the definition file's stem.
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// When the crawler becomes due, relative to its last run.
    #[serde(default = "default_schedule")]
    pub schedule: Schedule,

    /// Entry stage seeded by `run()`.
    #[serde(default = "default_init")]
    pub init: String,

    /// Pipeline stages by identifier.
    pub stages: BTreeMap<String, StageDef>,

    /// Per-crawler configuration consumed by stage handlers
    /// (include/exclude patterns etc.).
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
}

fn default_schedule() -> Schedule {
    Schedule::Disabled
}

fn default_init() -> String {
    "init".into()
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl CrawlerDefinition {
    /// Parse a definition from TOML source. `fallback_name` (the file
    /// stem) is used when the definition does not name itself.
    pub fn from_toml(source: &str, fallback_name: &str) -> Result<Self> {
        let mut def: Self = toml::from_str(source)
            .map_err(|e| TrawlerError::validation(format!("bad crawler definition: {e}")))?;
        if def.name.is_empty() {
            def.name = fallback_name.to_string();
        }
        Ok(def)
    }

    /// Load and validate a definition file.
    pub fn load(path: &Path, handlers: &HandlerRegistry) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| TrawlerError::io(path, e))?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        let def = Self::from_toml(&source, &stem).map_err(|e| {
            TrawlerError::validation(format!("{}: {e}", path.display()))
        })?;
        def.validate(handlers)
            .map_err(|e| TrawlerError::validation(format!("{}: {e}", path.display())))?;
        Ok(def)
    }

    /// Check that the entry stage exists, every handler id resolves, and
    /// every stage-to-stage wire points at a defined stage.
    pub fn validate(&self, handlers: &HandlerRegistry) -> Result<()> {
        if self.name.is_empty() {
            return Err(TrawlerError::validation("crawler has no name"));
        }
        if !self.stages.contains_key(&self.init) {
            return Err(TrawlerError::validation(format!(
                "entry stage '{}' is not defined",
                self.init
            )));
        }

        for (id, stage) in &self.stages {
            handlers.resolve(&stage.handler).map_err(|_| {
                TrawlerError::validation(format!(
                    "stage '{id}' uses unknown handler '{}'",
                    stage.handler
                ))
            })?;

            for key in WIRING_KEYS {
                if let Some(target) = stage.params.get(key).and_then(|v| v.as_str()) {
                    if !self.stages.contains_key(target) {
                        return Err(TrawlerError::validation(format!(
                            "stage '{id}' wires '{key}' to undefined stage '{target}'"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEMO: &str = r#"
description = "Example documentation crawler"
schedule = "daily"

[stages.init]
handler = "seed"
params = { next = "fetch", urls = ["https://docs.example.com/"] }

[stages.fetch]
handler = "fetch"
params = { next = "parse" }

[stages.parse]
handler = "parse"
params = { fetch = "fetch", store = "store" }

[stages.store]
handler = "store"

[config]
exclude_patterns = ["/blog/**"]
"#;

    #[test]
    fn parses_and_validates_a_full_definition() {
        let def = CrawlerDefinition::from_toml(DEMO, "demo_docs").expect("parse");
        assert_eq!(def.name, "demo_docs");
        assert_eq!(def.schedule, Schedule::Daily);
        assert_eq!(def.init, "init");
        assert_eq!(def.stages.len(), 4);

        def.validate(&HandlerRegistry::new()).expect("valid");
    }

    #[test]
    fn explicit_name_wins_over_file_stem() {
        let toml = r#"
name = "named"
[stages.init]
handler = "seed"
params = { next = "init" }
"#;
        let def = CrawlerDefinition::from_toml(toml, "stem").unwrap();
        assert_eq!(def.name, "named");
    }

    #[test]
    fn unknown_schedule_fails_parse() {
        let toml = r#"
schedule = "fortnightly"
[stages.init]
handler = "seed"
"#;
        let err = CrawlerDefinition::from_toml(toml, "demo").unwrap_err();
        assert!(err.to_string().contains("fortnightly"));
    }

    #[test]
    fn missing_entry_stage_fails_validation() {
        let toml = r#"
init = "start"
[stages.other]
handler = "seed"
"#;
        let def = CrawlerDefinition::from_toml(toml, "demo").unwrap();
        let err = def.validate(&HandlerRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("start"));
    }

    #[test]
    fn unknown_handler_fails_validation() {
        let toml = r#"
[stages.init]
handler = "teleport"
"#;
        let def = CrawlerDefinition::from_toml(toml, "demo").unwrap();
        let err = def.validate(&HandlerRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("teleport"));
    }

    #[test]
    fn dangling_wire_fails_validation() {
        let toml = r#"
[stages.init]
handler = "seed"
params = { next = "nowhere" }
"#;
        let def = CrawlerDefinition::from_toml(toml, "demo").unwrap();
        let err = def.validate(&HandlerRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }
}
