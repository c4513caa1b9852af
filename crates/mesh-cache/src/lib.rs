//! # mesh-cache
//!
//! Incremental, read-optimized cache of service-mesh registry and
//! governance state.
//!
//! This crate provides the caching layer of a mesh control plane:
//!
//! - [`RefreshCoordinator`] - Watermarks and single-flight incremental refresh
//! - [`WildcardRuleIndex`] - Three-tier rule index with per-bucket revisions
//! - [`RuleCache`] - Per-kind rule cache over a wildcard index
//! - [`RouteRuleContainer`] - Inbound/outbound router indexes with legacy views
//! - [`InstanceCache`] - Instance partitions, events, and zero protection
//! - [`CacheManager`] - Periodic driver for all caches
//!
//! ## Key Design Decisions
//!
//! - Concurrent refreshes of one cache collapse into a single flight
//! - Watermarks advance only after a delta applies cleanly
//! - Rule buckets publish membership, revision, and projection together
//! - Full instance reloads build a new index and swap it in atomically
//! - Events are collected during a refresh and published after it commits
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use mesh_cache::{Cache, CacheManagerBuilder, MemoryStore};
//! use mesh_core::model::{CircuitBreakerRule, RuleMeta};
//! use mesh_core::ServiceKey;
//!
//! let store = Arc::new(MemoryStore::new());
//! store.put_rule(CircuitBreakerRule::new(
//!     RuleMeta::new("cb-1", "protect-payments"),
//!     ServiceKey::namespace_wildcard("prod"),
//! ));
//!
//! let caches = CacheManagerBuilder::new().build(store).unwrap();
//! caches.circuit_breakers.update().unwrap();
//!
//! let rules = caches.circuit_breakers.resolve(&ServiceKey::new("prod", "payments"));
//! assert_eq!(rules.len(), 1);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod config;
mod events;
mod flight;
mod instance;
mod manager;
mod memory;
mod protect;
mod query;
mod refresh;
mod route;
mod rules;
mod stats;
mod store;
mod wildcard;

pub use cache::Cache;
pub use config::{CacheConfig, InstanceCacheConfig};
pub use events::{
    EventHub, InstanceEvent, InstanceEventKind, ServiceChangeListener, Subscription,
    SubscriptionId,
};
pub use flight::SingleFlight;
pub use instance::{InstanceCache, ServicePort, INSTANCE_CACHE_NAME};
pub use manager::{CacheManager, CacheManagerBuilder, MeshCaches};
pub use memory::{MemoryStore, RuleTable, StoredRule};
pub use protect::{protected_view, select_protected, STALE_TTL_FACTOR};
pub use query::{OrderDirection, OrderField, Page, Predicate, RuleQuery, DEFAULT_LIMIT};
pub use refresh::{RefreshContext, RefreshCoordinator, RefreshOutput};
pub use route::{Direction, LegacyRoute, LegacyRouteProjection, LegacyRouting, LegacyRoutes, RouteRuleContainer};
pub use rules::{
    CircuitBreakerCache, FaultDetectCache, LaneCache, RouterCache, RuleCache, RuleIndexer,
};
pub use stats::RefreshStats;
pub use store::{InstanceStore, ReadTx, RuleStore, StoreClock};
pub use wildcard::{
    sort_rules, IndexMode, NoProjection, Projection, Published, ResolvedRules, RuleBucket,
    ScopeFn, WildcardRuleIndex,
};
