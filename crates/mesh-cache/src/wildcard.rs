//! Three-tier wildcard rule index.
//!
//! Rules are bucketed by the scope they bind to:
//!
//! - `exact`: one bucket per concrete service, keyed by [`ServiceKey::domain`]
//! - `namespaces`: one bucket per `(namespace, *)` scope
//! - `all`: the `(*, *)` singleton
//!
//! The rules effective for a service are the union of its exact bucket,
//! its namespace's wildcard bucket, and the global bucket, ordered by
//! priority then rule id.
//!
//! Mutations are staged inside buckets and become visible when the bucket
//! is reloaded, which recomputes its ordered rule list, its revision, and
//! its projection together under the bucket's write lock. Readers therefore
//! never see a revision that disagrees with the membership it describes.
//!
//! In [`IndexMode::Materialized`] every bucket also carries copies of the
//! broader-scope rules that cover it. New buckets are seeded from the
//! broader tiers when created and wildcard changes fan out to existing
//! narrower buckets, so the most specific bucket alone answers a lookup and
//! its revision covers everything effective for that scope.

use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::DashMap;
use fnv::{FnvBuildHasher, FnvHashMap};
use mesh_core::model::Rule;
use mesh_core::{compute_revision, Record, Revision, ScopeTier, ServiceKey};
use parking_lot::{Mutex, RwLock};
use tracing::trace;

/// Hook run when a bucket is reloaded, deriving an extra view from the
/// bucket's ordered rules.
pub trait Projection<R>: Send + Sync + 'static {
    /// Derived view stored next to the bucket's revision.
    type View: Send + Sync + Default + fmt::Debug + 'static;

    /// Build the view from rules already in evaluation order.
    fn project(scope: &ServiceKey, rules: &[Arc<R>]) -> Self::View;
}

/// Projection that derives nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProjection;

impl<R> Projection<R> for NoProjection {
    type View = ();

    fn project(_scope: &ServiceKey, _rules: &[Arc<R>]) -> Self::View {}
}

/// How wildcard rules reach narrower scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    /// Buckets hold only their own rules; lookups union the three tiers.
    Union,
    /// Buckets hold their own rules plus copies of covering wildcard rules.
    Materialized,
}

/// Why a rule is present in a bucket. A rule may be present for several
/// reasons at once and leaves only when all of them are retracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Origins(u8);

impl Origins {
    const OWN: u8 = 0b001;
    const NAMESPACE: u8 = 0b010;
    const ALL: u8 = 0b100;

    fn with(self, bit: u8) -> Self {
        Self(self.0 | bit)
    }

    fn without(self, bit: u8) -> Self {
        Self(self.0 & !bit)
    }

    fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug)]
struct Entry<R> {
    rule: Arc<R>,
    origins: Origins,
}

/// What readers see of a bucket: ordered rules, revision, and projection,
/// always computed together.
#[derive(Debug)]
pub struct Published<R, V> {
    /// Rules in evaluation order.
    pub rules: Vec<Arc<R>>,
    /// Fingerprint of the member rules' revisions.
    pub revision: Revision,
    /// Projection derived from `rules`.
    pub view: V,
}

impl<R, V: Default> Default for Published<R, V> {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            revision: Revision::empty(),
            view: V::default(),
        }
    }
}

#[derive(Debug)]
struct BucketState<R, V> {
    staged: FnvHashMap<String, Entry<R>>,
    published: Arc<Published<R, V>>,
}

/// One scope's rules.
pub struct RuleBucket<R, P: Projection<R>> {
    scope: ServiceKey,
    state: RwLock<BucketState<R, P::View>>,
}

impl<R, P: Projection<R>> fmt::Debug for RuleBucket<R, P>
where
    R: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleBucket")
            .field("scope", &self.scope)
            .field("rules", &self.state.read().staged.len())
            .finish()
    }
}

impl<R: Rule, P: Projection<R>> RuleBucket<R, P> {
    fn new(scope: ServiceKey) -> Self {
        Self {
            scope,
            state: RwLock::new(BucketState {
                staged: FnvHashMap::default(),
                published: Arc::new(Published::default()),
            }),
        }
    }

    /// Scope this bucket serves.
    pub fn scope(&self) -> &ServiceKey {
        &self.scope
    }

    /// Current published state.
    pub fn published(&self) -> Arc<Published<R, P::View>> {
        Arc::clone(&self.state.read().published)
    }

    /// Published revision.
    pub fn revision(&self) -> Revision {
        self.state.read().published.revision.clone()
    }

    fn upsert(&self, rule: Arc<R>, origin: u8) {
        let mut state = self.state.write();
        let id = rule.id().to_string();
        match state.staged.get_mut(&id) {
            Some(entry) => {
                entry.rule = rule;
                entry.origins = entry.origins.with(origin);
            }
            None => {
                state.staged.insert(
                    id,
                    Entry {
                        rule,
                        origins: Origins::default().with(origin),
                    },
                );
            }
        }
    }

    /// Returns whether anything changed.
    fn retract(&self, id: &str, origin: u8) -> bool {
        let mut state = self.state.write();
        let Some(entry) = state.staged.get_mut(id) else {
            return false;
        };
        if !entry.origins.has(origin) {
            return false;
        }
        entry.origins = entry.origins.without(origin);
        if entry.origins.is_empty() {
            state.staged.remove(id);
        }
        true
    }

    /// Rules present because of `origin`.
    fn rules_from(&self, origin: u8) -> Vec<Arc<R>> {
        self.state
            .read()
            .staged
            .values()
            .filter(|e| e.origins.has(origin))
            .map(|e| Arc::clone(&e.rule))
            .collect()
    }

    fn own_count(&self) -> usize {
        self.state
            .read()
            .staged
            .values()
            .filter(|e| e.origins.has(Origins::OWN))
            .count()
    }

    fn reload(&self) {
        let mut state = self.state.write();
        let mut rules: Vec<Arc<R>> = state.staged.values().map(|e| Arc::clone(&e.rule)).collect();
        sort_rules(&mut rules);
        let revision = compute_revision(rules.iter().map(|r| r.revision()));
        let view = P::project(&self.scope, &rules);
        state.published = Arc::new(Published {
            rules,
            revision,
            view,
        });
    }
}

/// Evaluation order: priority ascending, then id ascending.
pub fn sort_rules<R: Rule>(rules: &mut [Arc<R>]) {
    rules.sort_by(|a, b| {
        a.priority()
            .cmp(&b.priority())
            .then_with(|| a.id().cmp(b.id()))
    });
}

/// Rules effective for a scope and their aggregate revision.
#[derive(Debug, Clone)]
pub struct ResolvedRules<R> {
    /// Rules in evaluation order, without duplicates.
    pub rules: Vec<Arc<R>>,
    /// Aggregate revision; empty when no rule applies.
    pub revision: Revision,
}

impl<R> ResolvedRules<R> {
    /// Whether no rule applies.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

/// Extracts the scopes a rule binds to in one index.
pub type ScopeFn<R> = fn(&R) -> Vec<ServiceKey>;

type BucketMap<R, P> = DashMap<String, Arc<RuleBucket<R, P>>, FnvBuildHasher>;

/// Three-tier associative rule index.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use mesh_cache::{IndexMode, WildcardRuleIndex};
/// use mesh_core::model::{CircuitBreakerRule, Rule, RuleMeta};
/// use mesh_core::ServiceKey;
///
/// let index: WildcardRuleIndex<CircuitBreakerRule> =
///     WildcardRuleIndex::new(IndexMode::Union, CircuitBreakerRule::scopes);
///
/// let rule = CircuitBreakerRule::new(RuleMeta::new("cb-1", "global"), ServiceKey::all());
/// index.bind(&Arc::new(rule));
/// index.reload_dirty();
///
/// let resolved = index.resolve(&ServiceKey::new("ns1", "svcA"));
/// assert_eq!(resolved.len(), 1);
/// ```
pub struct WildcardRuleIndex<R, P: Projection<R> = NoProjection> {
    mode: IndexMode,
    scope_fn: ScopeFn<R>,
    exact: BucketMap<R, P>,
    namespaces: BucketMap<R, P>,
    all: Arc<RuleBucket<R, P>>,
    dirty: Mutex<HashSet<ScopeTier>>,
    _projection: PhantomData<P>,
}

impl<R: Rule, P: Projection<R>> fmt::Debug for WildcardRuleIndex<R, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WildcardRuleIndex")
            .field("mode", &self.mode)
            .field("exact", &self.exact.len())
            .field("namespaces", &self.namespaces.len())
            .finish()
    }
}

impl<R: Rule, P: Projection<R>> WildcardRuleIndex<R, P> {
    /// Create an empty index.
    pub fn new(mode: IndexMode, scope_fn: ScopeFn<R>) -> Self {
        Self {
            mode,
            scope_fn,
            exact: DashMap::with_hasher(FnvBuildHasher::default()),
            namespaces: DashMap::with_hasher(FnvBuildHasher::default()),
            all: Arc::new(RuleBucket::new(ServiceKey::all())),
            dirty: Mutex::new(HashSet::new()),
            _projection: PhantomData,
        }
    }

    /// Propagation mode.
    #[inline]
    pub fn mode(&self) -> IndexMode {
        self.mode
    }

    /// Scopes `rule` binds to in this index.
    pub fn scopes_of(&self, rule: &R) -> Vec<ServiceKey> {
        (self.scope_fn)(rule)
    }

    /// Whether `old` and `new` bind to different scope sets.
    pub fn is_scope_change(&self, old: &R, new: &R) -> bool {
        let mut a = self.scopes_of(old);
        let mut b = self.scopes_of(new);
        a.sort();
        b.sort();
        a != b
    }

    /// Bind `rule` to every scope it names.
    pub fn bind(&self, rule: &Arc<R>) {
        for scope in self.scopes_of(rule) {
            self.add(&scope, Arc::clone(rule));
        }
    }

    /// Retract `rule` from every scope it names.
    pub fn unbind(&self, rule: &R) {
        for scope in self.scopes_of(rule) {
            self.remove(&scope, rule.id());
        }
    }

    /// Add or replace `rule` under `scope`.
    ///
    /// A disabled rule is removed instead, so it vanishes from lookups at
    /// the next reload rather than lingering as a non-matching entry.
    pub fn add(&self, scope: &ServiceKey, rule: Arc<R>) {
        if !rule.enabled() {
            self.remove(scope, rule.id());
            return;
        }
        trace!(kind = R::KIND, id = rule.id(), scope = %scope, "bind rule");

        match scope.tier() {
            ScopeTier::All => {
                self.all.upsert(Arc::clone(&rule), Origins::OWN);
                self.mark(ScopeTier::All);
                if self.mode == IndexMode::Materialized {
                    self.fan_out_all(|bucket| {
                        bucket.upsert(Arc::clone(&rule), Origins::ALL);
                        true
                    });
                }
            }
            ScopeTier::Namespace(ns) => {
                let bucket = self.namespace_bucket(&ns);
                bucket.upsert(Arc::clone(&rule), Origins::OWN);
                self.mark(ScopeTier::Namespace(ns.clone()));
                if self.mode == IndexMode::Materialized {
                    self.fan_out_namespace(&ns, |bucket| {
                        bucket.upsert(Arc::clone(&rule), Origins::NAMESPACE);
                        true
                    });
                }
            }
            ScopeTier::Exact(domain) => {
                let bucket = self.exact_bucket(scope, &domain);
                bucket.upsert(rule, Origins::OWN);
                self.mark(ScopeTier::Exact(domain));
            }
        }
    }

    /// Remove rule `id` from `scope`.
    pub fn remove(&self, scope: &ServiceKey, id: &str) {
        match scope.tier() {
            ScopeTier::All => {
                if self.all.retract(id, Origins::OWN) {
                    self.mark(ScopeTier::All);
                }
                if self.mode == IndexMode::Materialized {
                    self.fan_out_all(|bucket| bucket.retract(id, Origins::ALL));
                }
            }
            ScopeTier::Namespace(ns) => {
                let bucket = self.namespaces.get(&ns).map(|b| Arc::clone(b.value()));
                if let Some(bucket) = bucket {
                    if bucket.retract(id, Origins::OWN) {
                        self.mark(ScopeTier::Namespace(ns.clone()));
                    }
                }
                if self.mode == IndexMode::Materialized {
                    self.fan_out_namespace(&ns, |bucket| bucket.retract(id, Origins::NAMESPACE));
                }
            }
            ScopeTier::Exact(domain) => {
                let bucket = self.exact.get(&domain).map(|b| Arc::clone(b.value()));
                if let Some(bucket) = bucket {
                    if bucket.retract(id, Origins::OWN) {
                        self.mark(ScopeTier::Exact(domain));
                    }
                }
            }
        }
    }

    /// Republish one scope's bucket.
    pub fn reload(&self, scope: &ServiceKey) {
        self.reload_tier(&scope.tier());
    }

    /// Republish every bucket touched since the last reload and drop
    /// buckets that no longer own any rule. Returns the number of buckets
    /// reloaded.
    pub fn reload_dirty(&self) -> usize {
        let dirty: Vec<ScopeTier> = self.dirty.lock().drain().collect();
        for tier in &dirty {
            self.reload_tier(tier);
        }
        dirty.len()
    }

    /// Rules effective for `svc`.
    pub fn resolve(&self, svc: &ServiceKey) -> ResolvedRules<R> {
        match self.mode {
            IndexMode::Materialized => {
                let published = self.most_specific(svc).published();
                ResolvedRules {
                    rules: published.rules.clone(),
                    revision: published.revision.clone(),
                }
            }
            IndexMode::Union => {
                let layers = self.layers(svc);
                let mut seen = HashSet::new();
                let mut rules = Vec::new();
                let mut revisions = Vec::new();
                for layer in &layers {
                    if !layer.revision.is_empty() {
                        revisions.push(layer.revision.as_str().to_string());
                    }
                    for rule in &layer.rules {
                        if seen.insert(rule.id().to_string()) {
                            rules.push(Arc::clone(rule));
                        }
                    }
                }
                sort_rules(&mut rules);
                ResolvedRules {
                    rules,
                    revision: compute_revision(revisions),
                }
            }
        }
    }

    /// Published state of each tier covering `svc`, most specific first.
    /// Tiers without a bucket are omitted.
    pub fn layers(&self, svc: &ServiceKey) -> Vec<Arc<Published<R, P::View>>> {
        let mut layers = Vec::with_capacity(3);
        match svc.tier() {
            ScopeTier::Exact(domain) => {
                if let Some(b) = self.exact.get(&domain).map(|b| Arc::clone(b.value())) {
                    layers.push(b.published());
                }
                if let Some(b) = self.namespaces.get(&svc.namespace).map(|b| Arc::clone(b.value())) {
                    layers.push(b.published());
                }
            }
            ScopeTier::Namespace(ns) => {
                if let Some(b) = self.namespaces.get(&ns).map(|b| Arc::clone(b.value())) {
                    layers.push(b.published());
                }
            }
            ScopeTier::All => {}
        }
        layers.push(self.all.published());
        layers
    }

    /// Revision of the bucket bound exactly to `scope`, if it exists.
    pub fn bucket_revision(&self, scope: &ServiceKey) -> Option<Revision> {
        match scope.tier() {
            ScopeTier::All => Some(self.all.revision()),
            ScopeTier::Namespace(ns) => self.namespaces.get(&ns).map(|b| b.revision()),
            ScopeTier::Exact(domain) => self.exact.get(&domain).map(|b| b.revision()),
        }
    }

    /// Number of exact and namespace buckets.
    pub fn bucket_count(&self) -> usize {
        self.exact.len() + self.namespaces.len()
    }

    /// Drop every rule and bucket.
    pub fn clear(&self) {
        self.exact.clear();
        self.namespaces.clear();
        {
            let mut state = self.all.state.write();
            state.staged.clear();
            state.published = Arc::new(Published::default());
        }
        self.dirty.lock().clear();
    }

    fn mark(&self, tier: ScopeTier) {
        self.dirty.lock().insert(tier);
    }

    fn most_specific(&self, svc: &ServiceKey) -> Arc<RuleBucket<R, P>> {
        if let ScopeTier::Exact(domain) = svc.tier() {
            if let Some(b) = self.exact.get(&domain) {
                return Arc::clone(b.value());
            }
        }
        if !svc.is_all_wildcard() {
            if let Some(b) = self.namespaces.get(&svc.namespace) {
                return Arc::clone(b.value());
            }
        }
        Arc::clone(&self.all)
    }

    fn namespace_bucket(&self, ns: &str) -> Arc<RuleBucket<R, P>> {
        let mut created = false;
        let bucket = self
            .namespaces
            .entry(ns.to_string())
            .or_insert_with(|| {
                created = true;
                let bucket = RuleBucket::new(ServiceKey::namespace_wildcard(ns));
                if self.mode == IndexMode::Materialized {
                    for rule in self.all.rules_from(Origins::OWN) {
                        bucket.upsert(rule, Origins::ALL);
                    }
                }
                Arc::new(bucket)
            })
            .value()
            .clone();
        if created {
            trace!(kind = R::KIND, namespace = ns, "created namespace bucket");
        }
        bucket
    }

    fn exact_bucket(&self, scope: &ServiceKey, domain: &str) -> Arc<RuleBucket<R, P>> {
        self.exact
            .entry(domain.to_string())
            .or_insert_with(|| {
                let bucket = RuleBucket::new(scope.clone());
                if self.mode == IndexMode::Materialized {
                    for rule in self.all.rules_from(Origins::OWN) {
                        bucket.upsert(rule, Origins::ALL);
                    }
                    let ns_bucket = self
                        .namespaces
                        .get(&scope.namespace)
                        .map(|b| Arc::clone(b.value()));
                    if let Some(ns_bucket) = ns_bucket {
                        for rule in ns_bucket.rules_from(Origins::OWN) {
                            bucket.upsert(rule, Origins::NAMESPACE);
                        }
                    }
                }
                Arc::new(bucket)
            })
            .value()
            .clone()
    }

    /// Apply `f` to every namespace and exact bucket, marking changed ones.
    fn fan_out_all(&self, f: impl Fn(&RuleBucket<R, P>) -> bool) {
        let mut touched = Vec::new();
        for entry in self.namespaces.iter() {
            if f(entry.value()) {
                touched.push(ScopeTier::Namespace(entry.key().clone()));
            }
        }
        for entry in self.exact.iter() {
            if f(entry.value()) {
                touched.push(ScopeTier::Exact(entry.key().clone()));
            }
        }
        self.dirty.lock().extend(touched);
    }

    /// Apply `f` to every exact bucket in `ns`, marking changed ones.
    fn fan_out_namespace(&self, ns: &str, f: impl Fn(&RuleBucket<R, P>) -> bool) {
        let mut touched = Vec::new();
        for entry in self.exact.iter() {
            if entry.value().scope.namespace == ns && f(entry.value()) {
                touched.push(ScopeTier::Exact(entry.key().clone()));
            }
        }
        self.dirty.lock().extend(touched);
    }

    fn reload_tier(&self, tier: &ScopeTier) {
        match tier {
            ScopeTier::All => self.all.reload(),
            ScopeTier::Namespace(ns) => Self::reload_in(&self.namespaces, ns),
            ScopeTier::Exact(domain) => Self::reload_in(&self.exact, domain),
        }
    }

    fn reload_in(map: &BucketMap<R, P>, key: &str) {
        let bucket = map.get(key).map(|b| Arc::clone(b.value()));
        let Some(bucket) = bucket else {
            return;
        };
        if bucket.own_count() == 0 {
            // Nothing binds here any more; broader tiers answer for it.
            map.remove_if(key, |_, b| b.own_count() == 0);
            return;
        }
        bucket.reload();
    }
}
