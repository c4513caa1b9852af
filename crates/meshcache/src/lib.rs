//! # meshcache
//!
//! In-memory mirror of service-mesh registry and governance state.
//!
//! This crate keeps a read-optimized, eventually consistent copy of
//! persisted rules and instances, refreshed incrementally from a backing
//! store. It supports:
//!
//! - Incremental refresh with clock-skew-tolerant watermarks
//! - Routing, circuit-breaker, fault-detection, and lane rules indexed by
//!   exact service, namespace wildcard, and global wildcard
//! - Per-scope revisions for cheap change detection
//! - Instance health partitions with zero protection
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use meshcache::prelude::*;
//!
//! let store = Arc::new(MemoryStore::new());
//! store.put_instance(Instance::new(
//!     "inst-1",
//!     "svc-1",
//!     ServiceKey::new("prod", "payments"),
//!     "10.0.0.7",
//!     8080,
//! ));
//!
//! let caches = CacheManagerBuilder::new().build(store)?;
//! caches.manager.update_all();
//!
//! let healthy = caches.instances.discover("svc-1", true, "quickstart");
//! assert_eq!(healthy.len(), 1);
//! # Ok::<(), CacheError>(())
//! ```
//!
//! ## Architecture
//!
//! This library is organized into several crates:
//!
//! - `mesh-core` - Service keys, revisions, models, and errors
//! - `mesh-cache` - Refresh engine, rule indexes, and instance cache
//!
//! This crate (`meshcache`) re-exports all public APIs for convenience.
//!
//! ## Design Principles
//!
//! 1. **No panics in library code** - All errors are returned as `Result`
//! 2. **Readers never wait on a refresh** - Per-bucket locks and atomic swaps
//! 3. **Idempotent deltas** - Replaying a record leaves the same state
//! 4. **Observable** - `tracing` spans and `metrics` counters throughout

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub use mesh_cache as cache;
pub use mesh_core as core;

/// Prelude module for convenient imports.
///
/// ```rust
/// use meshcache::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use mesh_core::model::{
        CircuitBreakerRule, FaultDetectRule, Instance, InstanceCount, LaneGroup, LaneRule,
        RouterRule, RoutingPolicy, Rule, RuleMeta,
    };
    pub use mesh_core::{
        compute_revision, CacheError, CacheResult, Record, Revision, ServiceKey, Timestamp,
    };

    // Cache types
    pub use mesh_cache::{
        Cache, CacheConfig, CacheManager, CacheManagerBuilder, CircuitBreakerCache, Direction,
        EventHub, FaultDetectCache, IndexMode, InstanceCache, InstanceEvent, InstanceEventKind,
        LaneCache, MemoryStore, MeshCaches, ResolvedRules, RouterCache, RuleCache, RuleQuery,
        ServiceChangeListener, WildcardRuleIndex,
    };
}

/// Version information for this crate.
pub mod version {
    /// Crate version.
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");

    /// Minimum supported Rust version.
    pub const MSRV: &str = "1.75";

    /// Get version info as a string.
    pub fn version_string() -> String {
        format!("meshcache {} (MSRV {})", VERSION, MSRV)
    }
}
