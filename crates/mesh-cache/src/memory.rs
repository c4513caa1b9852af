//! In-memory store.
//!
//! A [`MemoryStore`] implements every store trait over plain maps. Writes
//! stamp a fresh revision and modify time the way a real store would, and
//! deletes are soft unless purged. Failures can be injected to exercise
//! the caches' error paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use mesh_core::model::{
    CircuitBreakerRule, FaultDetectRule, Instance, LaneGroup, Rule, RouterRule,
};
use mesh_core::{CacheError, CacheResult, Record, Timestamp};
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::store::{InstanceStore, ReadTx, RuleStore, StoreClock};

const STORE_NAME: &str = "memory";

fn unavailable(message: &str) -> CacheError {
    CacheError::StoreUnavailable {
        cache: STORE_NAME.to_string(),
        message: message.to_string(),
        source: None,
    }
}

/// Rows of one rule kind.
#[derive(Debug)]
pub struct RuleTable<R> {
    rows: RwLock<HashMap<String, R>>,
}

impl<R> Default for RuleTable<R> {
    fn default() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }
}

/// Rule kinds a [`MemoryStore`] keeps a table for.
pub trait StoredRule: Rule {
    /// The store's table for this kind.
    fn table(store: &MemoryStore) -> &RuleTable<Self>;

    /// Mutable metadata, used to stamp writes.
    fn meta_mut(&mut self) -> &mut mesh_core::model::RuleMeta;
}

macro_rules! stored_rule {
    ($ty:ty, $field:ident) => {
        impl StoredRule for $ty {
            fn table(store: &MemoryStore) -> &RuleTable<Self> {
                &store.$field
            }

            fn meta_mut(&mut self) -> &mut mesh_core::model::RuleMeta {
                &mut self.meta
            }
        }
    };
}

stored_rule!(CircuitBreakerRule, circuit_breakers);
stored_rule!(FaultDetectRule, fault_detects);
stored_rule!(LaneGroup, lanes);
stored_rule!(RouterRule, routers);

/// Store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    circuit_breakers: RuleTable<CircuitBreakerRule>,
    fault_detects: RuleTable<FaultDetectRule>,
    lanes: RuleTable<LaneGroup>,
    routers: RuleTable<RouterRule>,
    instances: RwLock<HashMap<String, Instance>>,
    sequence: AtomicU64,
    fetches: AtomicU64,
    unavailable: AtomicBool,
    clock_unavailable: AtomicBool,
    clock_offset_ms: AtomicI64,
    fetch_delay: Mutex<Duration>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store time, ignoring injected clock failures.
    pub fn current_time(&self) -> Timestamp {
        Utc::now() + chrono::Duration::milliseconds(self.clock_offset_ms.load(Ordering::SeqCst))
    }

    /// Move the store clock forward.
    pub fn advance_clock(&self, by: Duration) {
        let by = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.clock_offset_ms.fetch_add(by, Ordering::SeqCst);
    }

    /// Make every fetch fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make [`StoreClock::now`] fail until cleared.
    pub fn set_clock_unavailable(&self, unavailable: bool) {
        self.clock_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Sleep this long inside every fetch.
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = delay;
    }

    /// Number of fetches served, successful or not.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    fn stamp(&self, id: &str) -> (String, Timestamp) {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        (format!("{id}-{seq}"), self.current_time())
    }

    fn begin_fetch(&self) -> CacheResult<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("store unavailable"));
        }
        Ok(())
    }

    /// Insert or replace a rule, stamping revision and modify time.
    pub fn put_rule<R: StoredRule>(&self, mut rule: R) -> R {
        let (revision, now) = self.stamp(rule.id());
        let meta = rule.meta_mut();
        meta.revision = revision;
        meta.modify_time = now;
        meta.valid = true;
        trace!(kind = R::KIND, id = rule.id(), "put rule");
        R::table(self)
            .rows
            .write()
            .insert(rule.id().to_string(), rule.clone());
        rule
    }

    /// Soft-delete a rule. Returns whether it existed.
    pub fn delete_rule<R: StoredRule>(&self, id: &str) -> bool {
        let (revision, now) = self.stamp(id);
        let mut rows = R::table(self).rows.write();
        match rows.get_mut(id) {
            Some(rule) => {
                let meta = rule.meta_mut();
                meta.revision = revision;
                meta.modify_time = now;
                meta.valid = false;
                true
            }
            None => false,
        }
    }

    /// Physically remove a rule, leaving no tombstone.
    pub fn purge_rule<R: StoredRule>(&self, id: &str) -> bool {
        R::table(self).rows.write().remove(id).is_some()
    }

    /// Insert or replace an instance, stamping revision and modify time.
    pub fn put_instance(&self, mut instance: Instance) -> Instance {
        let (revision, now) = self.stamp(&instance.id);
        instance.revision = revision;
        instance.modify_time = now;
        instance.valid = true;
        self.instances
            .write()
            .insert(instance.id.clone(), instance.clone());
        instance
    }

    /// Soft-delete an instance. Returns whether it existed.
    pub fn delete_instance(&self, id: &str) -> bool {
        let (revision, now) = self.stamp(id);
        match self.instances.write().get_mut(id) {
            Some(instance) => {
                instance.revision = revision;
                instance.modify_time = now;
                instance.valid = false;
                true
            }
            None => false,
        }
    }

    /// Physically remove an instance, leaving no tombstone.
    pub fn purge_instance(&self, id: &str) -> bool {
        self.instances.write().remove(id).is_some()
    }
}

impl StoreClock for MemoryStore {
    fn now(&self) -> CacheResult<Timestamp> {
        if self.clock_unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("clock unavailable"));
        }
        Ok(self.current_time())
    }
}

impl<R: StoredRule> RuleStore<R> for MemoryStore {
    fn rules_for_cache(&self, since: Timestamp, first_update: bool) -> CacheResult<Vec<R>> {
        self.begin_fetch()?;
        let rows = R::table(self).rows.read();
        Ok(rows
            .values()
            .filter(|r| r.modify_time() >= since)
            .filter(|r| !first_update || r.is_valid())
            .cloned()
            .collect())
    }
}

impl InstanceStore for MemoryStore {
    fn start_read_tx(&self) -> CacheResult<Box<dyn ReadTx + '_>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("store unavailable"));
        }
        Ok(Box::new(MemoryReadTx {
            store: self,
            view: None,
        }))
    }

    fn instance_count(&self) -> CacheResult<u64> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("store unavailable"));
        }
        Ok(self.instances.read().values().filter(|i| i.valid).count() as u64)
    }
}

/// Read transaction over a cloned snapshot.
struct MemoryReadTx<'a> {
    store: &'a MemoryStore,
    view: Option<Vec<Instance>>,
}

impl ReadTx for MemoryReadTx<'_> {
    fn create_read_view(&mut self) -> CacheResult<()> {
        self.view = Some(self.store.instances.read().values().cloned().collect());
        Ok(())
    }

    fn instances_for_cache(
        &mut self,
        since: Timestamp,
        first_update: bool,
    ) -> CacheResult<Vec<Instance>> {
        self.store.begin_fetch()?;
        let keep = |i: &&Instance| i.modify_time >= since && (!first_update || i.valid);
        Ok(match &self.view {
            Some(view) => view.iter().filter(keep).cloned().collect(),
            None => self
                .store
                .instances
                .read()
                .values()
                .filter(keep)
                .cloned()
                .collect(),
        })
    }

    fn commit(self: Box<Self>) -> CacheResult<()> {
        Ok(())
    }

    fn rollback(self: Box<Self>) -> CacheResult<()> {
        Ok(())
    }
}
