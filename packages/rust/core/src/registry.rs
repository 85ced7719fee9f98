//! Crawler registry: loads definitions at startup, indexes them by name,
//! and answers which crawlers are due.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use trawler_shared::{Result, TrawlerError};
use trawler_stages::HandlerRegistry;
use trawler_storage::Backend;

use crate::crawler::Crawler;
use crate::definition::CrawlerDefinition;

/// Startup-time index of all known crawlers, in definition-file order.
pub struct Registry {
    crawlers: Vec<Arc<Crawler>>,
    by_name: HashMap<String, usize>,
    handlers: Arc<HandlerRegistry>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("crawlers", &self.crawlers)
            .field("by_name", &self.by_name)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Load every `*.toml` definition in `dir` (sorted by file name),
    /// validate it against the handler table, and open its crawler.
    pub async fn load(
        dir: &Path,
        backend: Arc<dyn Backend>,
        handlers: Arc<HandlerRegistry>,
        incremental: bool,
    ) -> Result<Self> {
        if !dir.exists() {
            tracing::warn!(dir = %dir.display(), "crawler definitions directory not found");
            return Self::from_definitions(Vec::new(), backend, handlers, incremental).await;
        }

        let mut paths = Vec::new();
        let entries = std::fs::read_dir(dir).map_err(|e| TrawlerError::io(dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| TrawlerError::io(dir, e))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut definitions = Vec::with_capacity(paths.len());
        for path in &paths {
            debug!(path = %path.display(), "loading crawler definition");
            definitions.push(CrawlerDefinition::load(path, &handlers)?);
        }

        let registry = Self::from_definitions(definitions, backend, handlers, incremental).await?;
        info!(
            dir = %dir.display(),
            crawlers = registry.len(),
            "crawler registry loaded"
        );
        Ok(registry)
    }

    /// Build a registry from already-parsed definitions (insertion order
    /// preserved).
    pub async fn from_definitions(
        definitions: Vec<CrawlerDefinition>,
        backend: Arc<dyn Backend>,
        handlers: Arc<HandlerRegistry>,
        incremental: bool,
    ) -> Result<Self> {
        let mut crawlers = Vec::with_capacity(definitions.len());
        let mut by_name = HashMap::new();

        for definition in definitions {
            definition.validate(&handlers)?;
            let name = definition.name.clone();
            if by_name.contains_key(&name) {
                return Err(TrawlerError::validation(format!(
                    "duplicate crawler name '{name}'"
                )));
            }
            let crawler = Crawler::open(definition, backend.clone(), incremental).await?;
            by_name.insert(name, crawlers.len());
            crawlers.push(Arc::new(crawler));
        }

        Ok(Self {
            crawlers,
            by_name,
            handlers,
        })
    }

    /// Look up a crawler by name. Unknown names yield
    /// [`TrawlerError::NotFound`], never a partial object.
    pub fn get(&self, name: &str) -> Result<Arc<Crawler>> {
        self.by_name
            .get(name)
            .map(|&i| self.crawlers[i].clone())
            .ok_or_else(|| TrawlerError::NotFound(name.to_string()))
    }

    /// All crawlers, in definition order.
    pub fn all(&self) -> &[Arc<Crawler>] {
        &self.crawlers
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Crawler>> {
        self.crawlers.iter()
    }

    /// The subset of crawlers whose schedule says they should run now.
    /// Pure: computed from `last_run` and the schedule, no side effects.
    pub fn due(&self) -> Vec<Arc<Crawler>> {
        self.crawlers
            .iter()
            .filter(|c| c.is_due())
            .cloned()
            .collect()
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn len(&self) -> usize {
        self.crawlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crawlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use trawler_storage::MemoryBackend;

    fn definition(name: &str, schedule: &str) -> CrawlerDefinition {
        CrawlerDefinition::from_toml(
            &format!(
                r#"
schedule = "{schedule}"
[stages.init]
handler = "seed"
"#
            ),
            name,
        )
        .expect("definition")
    }

    async fn registry_with(
        backend: Arc<MemoryBackend>,
        defs: Vec<CrawlerDefinition>,
    ) -> Registry {
        Registry::from_definitions(defs, backend, Arc::new(HandlerRegistry::new()), true)
            .await
            .expect("registry")
    }

    #[tokio::test]
    async fn get_unknown_name_is_not_found() {
        let backend = Arc::new(MemoryBackend::new());
        let registry = registry_with(backend, vec![definition("a", "daily")]).await;

        assert!(registry.get("a").is_ok());
        let err = registry.get("missing").unwrap_err();
        assert!(matches!(err, TrawlerError::NotFound(_)));
    }

    #[tokio::test]
    async fn all_preserves_insertion_order() {
        let backend = Arc::new(MemoryBackend::new());
        let registry = registry_with(
            backend,
            vec![
                definition("b_second", "daily"),
                definition("a_first", "daily"),
            ],
        )
        .await;

        let names: Vec<&str> = registry.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["b_second", "a_first"]);
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let result = Registry::from_definitions(
            vec![definition("dup", "daily"), definition("dup", "daily")],
            backend,
            Arc::new(HandlerRegistry::new()),
            true,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn due_respects_schedule_and_last_run() {
        let backend = Arc::new(MemoryBackend::new());
        // A never-run disabled crawler is not due; a stale daily one is;
        // a freshly-run daily one is not.
        backend
            .last_run_set("stale", Utc::now() - Duration::days(2))
            .await
            .unwrap();
        backend.last_run_set("fresh", Utc::now()).await.unwrap();

        let registry = registry_with(
            backend,
            vec![
                definition("never", "disabled"),
                definition("stale", "daily"),
                definition("fresh", "daily"),
                definition("unrun", "daily"),
            ],
        )
        .await;

        let due = registry.due();
        let due: Vec<&str> = due.iter().map(|c| c.name()).collect();
        assert!(!due.contains(&"never"));
        assert!(due.contains(&"stale"));
        assert!(!due.contains(&"fresh"));
        assert!(due.contains(&"unrun"));
    }

    #[tokio::test]
    async fn load_reads_definition_files_in_name_order() {
        let dir = std::env::temp_dir().join(format!(
            "trawler-registry-test-{}",
            uuid::Uuid::now_v7()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("10_alpha.toml"),
            "[stages.init]\nhandler = \"seed\"\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("20_beta.toml"),
            "[stages.init]\nhandler = \"seed\"\n",
        )
        .unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let registry = Registry::load(
            &dir,
            Arc::new(MemoryBackend::new()),
            Arc::new(HandlerRegistry::new()),
            true,
        )
        .await
        .expect("load");

        let names: Vec<&str> = registry.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["10_alpha", "20_beta"]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn load_surfaces_bad_definitions_with_the_file_name() {
        let dir = std::env::temp_dir().join(format!(
            "trawler-registry-bad-{}",
            uuid::Uuid::now_v7()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("broken.toml"),
            "[stages.init]\nhandler = \"no_such_handler\"\n",
        )
        .unwrap();

        let err = Registry::load(
            &dir,
            Arc::new(MemoryBackend::new()),
            Arc::new(HandlerRegistry::new()),
            true,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("broken.toml"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
