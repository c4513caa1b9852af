//! Periodic refresh driver.
//!
//! A [`CacheManager`] refreshes every registered cache on a fixed interval
//! until told to stop. [`CacheManagerBuilder`] assembles the standard set
//! of caches over one store.

use std::sync::Arc;
use std::time::Instant;

use mesh_core::model::{CircuitBreakerRule, FaultDetectRule, LaneGroup, RouterRule};
use mesh_core::{CacheError, CacheResult};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cache::Cache;
use crate::config::CacheConfig;
use crate::events::{EventHub, ServiceChangeListener};
use crate::instance::InstanceCache;
use crate::rules::{CircuitBreakerCache, FaultDetectCache, LaneCache, RouterCache};
use crate::store::{InstanceStore, RuleStore};

/// Refreshes a set of caches.
pub struct CacheManager {
    caches: Vec<Arc<dyn Cache>>,
    config: CacheConfig,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("caches", &self.names())
            .field("config", &self.config)
            .finish()
    }
}

impl CacheManager {
    /// Create a manager with no caches.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            caches: Vec::new(),
            config,
        }
    }

    /// Add a cache to the refresh set.
    pub fn register(&mut self, cache: Arc<dyn Cache>) {
        debug!(cache = cache.name(), "registered cache");
        self.caches.push(cache);
    }

    /// Names of registered caches, in refresh order.
    pub fn names(&self) -> Vec<&'static str> {
        self.caches.iter().map(|c| c.name()).collect()
    }

    /// Configuration the manager runs with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Refresh every cache once, in registration order.
    ///
    /// A failing cache does not stop the others; all errors are returned.
    pub fn update_all(&self) -> Vec<CacheError> {
        let start = Instant::now();
        let mut errors = Vec::new();
        for cache in &self.caches {
            if let Err(err) = cache.update() {
                warn!(cache = cache.name(), error = %err, "cache update failed");
                errors.push(err);
            }
        }
        debug!(
            caches = self.caches.len(),
            failed = errors.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "update round finished"
        );
        errors
    }

    /// Clear every cache.
    pub fn clear_all(&self) -> CacheResult<()> {
        for cache in &self.caches {
            cache.clear()?;
        }
        Ok(())
    }

    /// Refresh on the configured interval until `shutdown` turns true or
    /// its sender is dropped.
    ///
    /// Each round runs on the blocking pool since refreshes block on the
    /// store.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.refresh_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_ms = self.config.refresh_interval_ms,
            caches = self.caches.len(),
            "cache refresh loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let manager = Arc::clone(&self);
                    if let Err(err) = tokio::task::spawn_blocking(move || manager.update_all()).await {
                        error!(error = %err, "update round aborted");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("cache refresh loop stopped");
    }
}

/// The standard cache set over one store.
#[derive(Debug, Clone)]
pub struct MeshCaches {
    /// Driver refreshing all of the caches below.
    pub manager: Arc<CacheManager>,
    /// Circuit-breaker rules.
    pub circuit_breakers: Arc<CircuitBreakerCache>,
    /// Fault-detection rules.
    pub fault_detects: Arc<FaultDetectCache>,
    /// Lane groups.
    pub lanes: Arc<LaneCache>,
    /// Routing rules.
    pub routers: Arc<RouterCache>,
    /// Service instances.
    pub instances: Arc<InstanceCache>,
}

/// Builder for [`MeshCaches`].
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use mesh_cache::{CacheManagerBuilder, MemoryStore};
///
/// let store = Arc::new(MemoryStore::new());
/// let caches = CacheManagerBuilder::new().build(store).unwrap();
/// assert!(caches.manager.update_all().is_empty());
/// ```
#[derive(Default)]
pub struct CacheManagerBuilder {
    config: Option<CacheConfig>,
    hub: Option<Arc<EventHub>>,
    listener: Option<Arc<dyn ServiceChangeListener>>,
}

impl std::fmt::Debug for CacheManagerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManagerBuilder")
            .field("config", &self.config)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

impl CacheManagerBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config` instead of the defaults.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Publish instance events through `hub`.
    pub fn event_hub(mut self, hub: Arc<EventHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Notify `listener` of services whose instances changed.
    pub fn listener(mut self, listener: Arc<dyn ServiceChangeListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Build the caches over `store`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Configuration`] if the configuration is
    /// invalid.
    pub fn build<S>(self, store: Arc<S>) -> CacheResult<MeshCaches>
    where
        S: RuleStore<CircuitBreakerRule>
            + RuleStore<FaultDetectRule>
            + RuleStore<LaneGroup>
            + RuleStore<RouterRule>
            + InstanceStore
            + 'static,
    {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let diff = config.fetch_time_diff();

        let circuit_breakers = Arc::new(CircuitBreakerCache::circuit_breakers(Arc::clone(&store), diff));
        let fault_detects = Arc::new(FaultDetectCache::fault_detects(Arc::clone(&store), diff));
        let lanes = Arc::new(LaneCache::lanes(Arc::clone(&store), diff));
        let routers = Arc::new(RouterCache::routers(Arc::clone(&store), diff));

        let mut instances = InstanceCache::new(store, &config);
        if let Some(hub) = self.hub {
            instances = instances.with_event_hub(hub);
        }
        if let Some(listener) = self.listener {
            instances = instances.with_listener(listener);
        }
        let instances = Arc::new(instances);

        let mut manager = CacheManager::new(config);
        manager.register(circuit_breakers.clone());
        manager.register(fault_detects.clone());
        manager.register(lanes.clone());
        manager.register(routers.clone());
        manager.register(instances.clone());

        Ok(MeshCaches {
            manager: Arc::new(manager),
            circuit_breakers,
            fault_detects,
            lanes,
            routers,
            instances,
        })
    }
}
