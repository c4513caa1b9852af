//! Generic rule cache.
//!
//! One [`RuleCache`] per rule kind holds every valid rule by id and keeps a
//! [`RuleIndexer`] in sync with it. Deltas are applied per record:
//!
//! 1. records failing validation are skipped and logged
//! 2. a rule whose scopes changed is unbound from its old scopes first
//! 3. soft-deleted rules are unbound and dropped
//! 4. everything else is stored and bound; disabled rules bind nowhere
//!
//! Touched index buckets are reloaded once at the end of the batch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mesh_core::model::{CircuitBreakerRule, FaultDetectRule, LaneGroup, Rule, RouterRule};
use mesh_core::{CacheResult, Record, ServiceKey};
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::query::{Page, Predicate, RuleQuery};
use crate::refresh::{RefreshContext, RefreshCoordinator, RefreshOutput};
use crate::route::RouteRuleContainer;
use crate::store::RuleStore;
use crate::wildcard::{IndexMode, ResolvedRules, WildcardRuleIndex};

/// Secondary index kept in sync with a [`RuleCache`].
pub trait RuleIndexer<R: Rule>: Send + Sync {
    /// Whether moving from `old` to `new` changes where the rule binds.
    fn is_scope_change(&self, old: &R, new: &R) -> bool;

    /// Bind a rule to its scopes, or remove it if disabled.
    fn bind(&self, rule: &Arc<R>);

    /// Remove a rule from every scope it named.
    fn unbind(&self, rule: &R);

    /// Publish pending changes. Returns the number of buckets reloaded.
    fn reload_dirty(&self) -> usize;

    /// Drop everything.
    fn clear(&self);
}

impl<R: Rule> RuleIndexer<R> for WildcardRuleIndex<R> {
    fn is_scope_change(&self, old: &R, new: &R) -> bool {
        WildcardRuleIndex::is_scope_change(self, old, new)
    }

    fn bind(&self, rule: &Arc<R>) {
        WildcardRuleIndex::bind(self, rule)
    }

    fn unbind(&self, rule: &R) {
        WildcardRuleIndex::unbind(self, rule)
    }

    fn reload_dirty(&self) -> usize {
        WildcardRuleIndex::reload_dirty(self)
    }

    fn clear(&self) {
        WildcardRuleIndex::clear(self)
    }
}

/// Cache for one rule kind.
pub struct RuleCache<R: Rule, I> {
    coordinator: RefreshCoordinator,
    store: Arc<dyn RuleStore<R>>,
    rules: DashMap<String, Arc<R>>,
    index: I,
}

impl<R: Rule, I> std::fmt::Debug for RuleCache<R, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleCache")
            .field("kind", &R::KIND)
            .field("rules", &self.rules.len())
            .finish()
    }
}

/// Circuit-breaker rules, materialized per scope.
pub type CircuitBreakerCache = RuleCache<CircuitBreakerRule, WildcardRuleIndex<CircuitBreakerRule>>;
/// Fault-detection rules, materialized per scope.
pub type FaultDetectCache = RuleCache<FaultDetectRule, WildcardRuleIndex<FaultDetectRule>>;
/// Lane groups, unioned at lookup.
pub type LaneCache = RuleCache<LaneGroup, WildcardRuleIndex<LaneGroup>>;
/// Routing rules, indexed in both directions.
pub type RouterCache = RuleCache<RouterRule, RouteRuleContainer>;

impl<R: Rule> RuleCache<R, WildcardRuleIndex<R>> {
    /// Create a cache backed by a single wildcard index over
    /// [`Rule::scopes`].
    pub fn with_index<S>(store: Arc<S>, mode: IndexMode, fetch_time_diff: Duration) -> Self
    where
        S: RuleStore<R> + 'static,
    {
        Self::new(store, WildcardRuleIndex::new(mode, R::scopes), fetch_time_diff)
    }

    /// Rules effective for `svc`.
    pub fn resolve(&self, svc: &ServiceKey) -> ResolvedRules<R> {
        self.index.resolve(svc)
    }
}

impl CircuitBreakerCache {
    /// Circuit-breaker cache over `store`.
    pub fn circuit_breakers<S>(store: Arc<S>, fetch_time_diff: Duration) -> Self
    where
        S: RuleStore<CircuitBreakerRule> + 'static,
    {
        Self::with_index(store, IndexMode::Materialized, fetch_time_diff)
    }
}

impl FaultDetectCache {
    /// Fault-detection cache over `store`.
    pub fn fault_detects<S>(store: Arc<S>, fetch_time_diff: Duration) -> Self
    where
        S: RuleStore<FaultDetectRule> + 'static,
    {
        Self::with_index(store, IndexMode::Materialized, fetch_time_diff)
    }
}

impl LaneCache {
    /// Lane cache over `store`.
    pub fn lanes<S>(store: Arc<S>, fetch_time_diff: Duration) -> Self
    where
        S: RuleStore<LaneGroup> + 'static,
    {
        Self::with_index(store, IndexMode::Union, fetch_time_diff)
    }
}

impl RouterCache {
    /// Router cache over `store`.
    pub fn routers<S>(store: Arc<S>, fetch_time_diff: Duration) -> Self
    where
        S: RuleStore<RouterRule> + 'static,
    {
        Self::new(store, RouteRuleContainer::new(), fetch_time_diff)
    }
}

impl<R: Rule, I: RuleIndexer<R>> RuleCache<R, I> {
    /// Create a cache with a custom indexer.
    pub fn new<S>(store: Arc<S>, index: I, fetch_time_diff: Duration) -> Self
    where
        S: RuleStore<R> + 'static,
    {
        let clock: Arc<dyn crate::store::StoreClock> = store.clone();
        Self {
            coordinator: RefreshCoordinator::new(R::KIND, clock, fetch_time_diff),
            store,
            rules: DashMap::new(),
            index,
        }
    }

    /// Refresh coordinator, for watermarks and statistics.
    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// The secondary index.
    pub fn index(&self) -> &I {
        &self.index
    }

    /// Rule by id.
    pub fn get_rule(&self, id: &str) -> Option<Arc<R>> {
        self.rules.get(id).map(|r| Arc::clone(r.value()))
    }

    /// Number of cached rules, enabled or not.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Visit every cached rule until `f` returns false.
    pub fn iterate_rules(&self, mut f: impl FnMut(&Arc<R>) -> bool) {
        for entry in self.rules.iter() {
            if !f(entry.value()) {
                break;
            }
        }
    }

    /// Paged search over cached rules.
    pub fn query(&self, query: &RuleQuery, predicates: &[Predicate<R>]) -> Page<R> {
        let snapshot: Vec<Arc<R>> = self.rules.iter().map(|e| Arc::clone(e.value())).collect();
        query.run(snapshot, predicates)
    }

    fn apply(&self, ctx: &RefreshContext) -> CacheResult<RefreshOutput> {
        let records = self.store.rules_for_cache(ctx.since, ctx.first_update)?;
        let mut output = RefreshOutput::default();
        let mut fetched = HashSet::with_capacity(records.len());

        for record in records {
            output.observe(R::KIND, record.modify_time());
            fetched.insert(record.id().to_string());

            if record.is_valid() {
                if let Err(err) = record.validate() {
                    warn!(kind = R::KIND, id = record.id(), error = %err, "skipping undecodable rule");
                    output.skipped += 1;
                    continue;
                }
            }
            self.apply_record(record);
            output.applied += 1;
        }

        if ctx.full_reload && !ctx.first_update {
            // Rows purged from the store leave no tombstone to replay.
            let stale: Vec<Arc<R>> = self
                .rules
                .iter()
                .filter(|e| !fetched.contains(e.key()))
                .map(|e| Arc::clone(e.value()))
                .collect();
            for rule in stale {
                debug!(kind = R::KIND, id = rule.id(), "dropping rule missing from full reload");
                self.index.unbind(&rule);
                self.rules.remove(rule.id());
                output.applied += 1;
            }
        }

        self.index.reload_dirty();
        Ok(output)
    }

    fn apply_record(&self, record: R) {
        let id = record.id().to_string();
        let old = self.rules.get(&id).map(|r| Arc::clone(r.value()));

        if let Some(old) = &old {
            if !record.is_valid() || self.index.is_scope_change(old, &record) {
                self.index.unbind(old);
            }
        }
        if !record.is_valid() {
            self.rules.remove(&id);
            return;
        }

        let rule = Arc::new(record);
        self.rules.insert(id, Arc::clone(&rule));
        self.index.bind(&rule);
    }
}

impl RouterCache {
    /// Routing rules for `svc` in `direction`.
    pub fn resolve_routes(
        &self,
        svc: &ServiceKey,
        direction: crate::route::Direction,
    ) -> ResolvedRules<RouterRule> {
        self.index.resolve(svc, direction)
    }
}

impl<R: Rule, I: RuleIndexer<R>> Cache for RuleCache<R, I> {
    fn name(&self) -> &'static str {
        R::KIND
    }

    fn update(&self) -> CacheResult<()> {
        self.coordinator.update(|ctx| self.apply(ctx))
    }

    fn clear(&self) -> CacheResult<()> {
        self.coordinator.clear_with(|| {
            self.rules.clear();
            self.index.clear();
        });
        Ok(())
    }
}
