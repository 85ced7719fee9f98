//! Periodic driver: asks the registry which crawlers are due and starts
//! their runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use trawler_shared::TrawlerError;

use crate::registry::Registry;

/// Starts due crawlers, either one-shot via [`Scheduler::tick`] or on an
/// interval via [`Scheduler::start`].
pub struct Scheduler {
    registry: Arc<Registry>,
}

impl Scheduler {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Run every due crawler once. A crawler that is already running is
    /// skipped quietly; other start failures are logged and skipped.
    /// Returns how many runs were started.
    pub async fn tick(&self) -> usize {
        let due = self.registry.due();
        let mut started = 0;

        for crawler in due {
            match crawler.run(false, false).await {
                Ok(()) => {
                    info!(crawler = crawler.name(), "scheduler started run");
                    started += 1;
                }
                Err(TrawlerError::InvalidTransition { .. }) => {
                    debug!(crawler = crawler.name(), "due but already active, skipping");
                }
                Err(e) => {
                    warn!(crawler = crawler.name(), error = %e, "scheduler failed to start run");
                }
            }
        }

        debug!(started, "scheduler pass complete");
        started
    }

    /// Spawn a background loop that ticks at `interval` until aborted.
    pub fn start(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            // The first tick fires immediately; that is the startup pass.
            loop {
                timer.tick().await;
                self.tick().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trawler_shared::CrawlerState;
    use trawler_stages::HandlerRegistry;
    use trawler_storage::MemoryBackend;

    use crate::definition::CrawlerDefinition;

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

    async fn registry(defs: Vec<CrawlerDefinition>) -> Arc<Registry> {
        Arc::new(
            Registry::from_definitions(
                defs,
                Arc::new(MemoryBackend::new()),
                Arc::new(HandlerRegistry::new()),
                true,
            )
            .await
            .expect("registry"),
        )
    }

    #[tokio::test]
    async fn tick_starts_only_due_crawlers() {
        let registry = registry(vec![
            definition("due_crawler", "daily"),
            definition("never", "disabled"),
        ])
        .await;

        let started = Scheduler::new(registry.clone()).tick().await;
        assert_eq!(started, 1);
        assert_eq!(
            registry.get("due_crawler").unwrap().state(),
            CrawlerState::Running
        );
        assert_eq!(registry.get("never").unwrap().state(), CrawlerState::Idle);
    }

    #[tokio::test]
    async fn tick_skips_already_running_crawlers() {
        let registry = registry(vec![definition("busy", "daily")]).await;
        registry.get("busy").unwrap().run(false, false).await.unwrap();

        let started = Scheduler::new(registry).tick().await;
        assert_eq!(started, 0);
    }
}
