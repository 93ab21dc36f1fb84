//! The assembled proxy: pipeline plus the shared components around it.
//!
//! This is also the seam the admin API consumes: the active resolver, cache
//! operations, the history ring and config swaps are all reachable from a
//! [`Proxy`] handle.

use std::sync::Arc;

use anyhow::Result;
use resolver::Resolve;
use resolver::cache::Cache;
use resolver::history::History;
use resolver::metrics::DEFAULT_DEADLINE;
use steer::Steering;

use crate::config::{ConfigFile, Store};

#[derive(Clone)]
pub struct Proxy {
    resolver: Arc<dyn Resolve>,
    pub cache: Arc<Cache>,
    pub history: Arc<History>,
    pub config: Arc<Store>,
    pub backend: Arc<dyn Steering>,
}

impl Proxy {
    pub fn new(config: Arc<Store>, backend: Arc<dyn Steering>) -> Self {
        let cache = Arc::new(Cache::new(config.current().cache_max_entries));
        let history = Arc::new(History::default());

        let resolver = resolver::pipeline(
            cache.clone(),
            backend.clone(),
            history.clone(),
            DEFAULT_DEADLINE,
        );

        Self {
            resolver,
            cache,
            history,
            config,
            backend,
        }
    }

    /// The outermost resolver of the active pipeline.
    pub fn active(&self) -> Arc<dyn Resolve> {
        self.resolver.clone()
    }

    /// Validates and atomically publishes a new configuration.
    ///
    /// In-flight queries finish on the snapshot they started with; the old
    /// config stays active if validation fails.
    pub fn swap_config(&self, file: &ConfigFile) -> Result<()> {
        let config = file.validate()?;

        self.cache.set_capacity(config.cache_max_entries);
        self.config.swap(config);

        tracing::info!("Configuration swapped");

        Ok(())
    }
}
