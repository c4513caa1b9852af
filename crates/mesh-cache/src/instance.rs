//! Instance cache.
//!
//! Instances are indexed by id and by service id. Each service keeps four
//! partitions under its own lock: all instances, healthy, unhealthy, and
//! protected views. `healthy` and `unhealthy` split `all`; protected ids
//! are always a subset of `unhealthy`.
//!
//! The id and service maps live in one index behind an [`ArcSwap`]. Incremental refreshes patch the current index in place; a
//! full reload builds a new index off to the side and swaps it in, so
//! readers never see a half-built structure.
//!
//! Physically deleted rows are invisible to incremental fetches. A
//! periodic reconciliation compares the cached count with the store's and
//! forces a full reload on mismatch. The check runs inside the refresh
//! flight, so a refresh already running cannot overwrite its reset.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use mesh_core::model::{
    Instance, InstanceCount, METADATA_CAMPUS, METADATA_PROTOCOL, METADATA_REGION,
    METADATA_VERSION, METADATA_ZONE,
};
use mesh_core::{CacheResult, Record};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::cache::Cache;
use crate::config::{CacheConfig, InstanceCacheConfig};
use crate::events::{EventHub, InstanceEvent, InstanceEventKind, ServiceChangeListener, Subscription};
use crate::protect::{protected_view, select_protected};
use crate::refresh::{RefreshContext, RefreshCoordinator, RefreshOutput};
use crate::store::{InstanceStore, StoreClock};

/// Cache name and watermark label.
pub const INSTANCE_CACHE_NAME: &str = "instance";

/// A port exposed by some instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServicePort {
    /// Port number.
    pub port: u32,
    /// Protocol served on it, possibly empty.
    pub protocol: String,
}

/// Partitions of one service's instances.
#[derive(Debug, Default)]
struct ServiceInstances {
    all: HashMap<String, Arc<Instance>>,
    healthy: HashMap<String, Arc<Instance>>,
    unhealthy: HashMap<String, Arc<Instance>>,
    /// Protected views keyed by instance id.
    protected: HashMap<String, Arc<Instance>>,
}

impl ServiceInstances {
    fn upsert(&mut self, instance: Arc<Instance>) {
        let id = instance.id.clone();
        self.protected.remove(&id);
        if instance.healthy {
            self.unhealthy.remove(&id);
            self.healthy.insert(id.clone(), Arc::clone(&instance));
        } else {
            self.healthy.remove(&id);
            self.unhealthy.insert(id.clone(), Arc::clone(&instance));
        }
        self.all.insert(id, instance);
    }

    fn remove(&mut self, id: &str) {
        self.all.remove(id);
        self.healthy.remove(id);
        self.unhealthy.remove(id);
        self.protected.remove(id);
    }
}

/// Id and service maps, swapped as a unit on full reloads.
#[derive(Debug, Default)]
pub(crate) struct InstanceIndex {
    ids: DashMap<String, Arc<Instance>>,
    services: DashMap<String, Arc<RwLock<ServiceInstances>>>,
    counts: DashMap<String, InstanceCount>,
    ports: DashMap<String, BTreeSet<ServicePort>>,
}

impl InstanceIndex {
    fn attach(&self, instance: Arc<Instance>) {
        let service = Arc::clone(
            self.services
                .entry(instance.service_id.clone())
                .or_default()
                .value(),
        );
        self.ids.insert(instance.id.clone(), Arc::clone(&instance));
        service.write().upsert(instance);
    }

    fn detach(&self, instance: &Instance) {
        self.ids.remove(&instance.id);
        let service = self
            .services
            .get(&instance.service_id)
            .map(|s| Arc::clone(s.value()));
        if let Some(service) = service {
            service.write().remove(&instance.id);
        }
    }

    fn service(&self, service_id: &str) -> Option<Arc<RwLock<ServiceInstances>>> {
        self.services.get(service_id).map(|s| Arc::clone(s.value()))
    }
}

/// Derived metadata consumers expect on every instance.
fn enrich(mut instance: Instance) -> Instance {
    let derived = [
        (METADATA_VERSION, instance.version.clone()),
        (METADATA_PROTOCOL, instance.protocol.clone()),
        (METADATA_REGION, instance.location.region.clone()),
        (METADATA_ZONE, instance.location.zone.clone()),
        (METADATA_CAMPUS, instance.location.campus.clone()),
    ];
    for (key, value) in derived {
        if !value.is_empty() {
            instance.metadata.insert(key.to_string(), value);
        }
    }
    instance
}

/// Result of one delta application besides the refresh output.
#[derive(Debug, Default)]
struct Applied {
    events: Vec<InstanceEvent>,
    affected: BTreeSet<String>,
}

/// Instance cache with health partitions and zero protection.
pub struct InstanceCache {
    coordinator: RefreshCoordinator,
    store: Arc<dyn InstanceStore>,
    index: ArcSwap<InstanceIndex>,
    config: InstanceCacheConfig,
    hub: Arc<EventHub>,
    listener: Option<Arc<dyn ServiceChangeListener>>,
    last_reconcile: Mutex<Instant>,
}

impl std::fmt::Debug for InstanceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceCache")
            .field("instances", &self.index.load().ids.len())
            .field("config", &self.config)
            .finish()
    }
}

impl InstanceCache {
    /// Create an instance cache over `store`.
    pub fn new<S>(store: Arc<S>, config: &CacheConfig) -> Self
    where
        S: InstanceStore + 'static,
    {
        let clock: Arc<dyn StoreClock> = store.clone();
        Self {
            coordinator: RefreshCoordinator::new(
                INSTANCE_CACHE_NAME,
                clock,
                config.fetch_time_diff(),
            ),
            store,
            index: ArcSwap::from_pointee(InstanceIndex::default()),
            config: config.instance.clone(),
            hub: Arc::new(EventHub::new(config.event_buffer_size)),
            listener: None,
            last_reconcile: Mutex::new(Instant::now()),
        }
    }

    /// Publish events through a shared hub.
    pub fn with_event_hub(mut self, hub: Arc<EventHub>) -> Self {
        self.hub = hub;
        self
    }

    /// Notify `listener` of every affected service after each refresh.
    pub fn with_listener(mut self, listener: Arc<dyn ServiceChangeListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Refresh coordinator, for watermarks and statistics.
    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Event hub the cache publishes to.
    pub fn event_hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// Subscribe to instance events.
    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    /// Instance by id.
    pub fn get_instance(&self, id: &str) -> Option<Arc<Instance>> {
        self.index.load().ids.get(id).map(|i| Arc::clone(i.value()))
    }

    /// Every instance of a service, raw, sorted by id.
    pub fn instances_by_service_id(&self, service_id: &str) -> Vec<Arc<Instance>> {
        let Some(service) = self.index.load().service(service_id) else {
            return Vec::new();
        };
        let guard = service.read();
        sorted(guard.all.values().cloned())
    }

    /// Instances served to consumers, sorted by id.
    ///
    /// With `only_healthy`, healthy instances plus protected views.
    /// Otherwise every instance, with protected views in place of their raw
    /// entries.
    pub fn discover(&self, service_id: &str, only_healthy: bool, consumer: &str) -> Vec<Arc<Instance>> {
        let Some(service) = self.index.load().service(service_id) else {
            return Vec::new();
        };
        let guard = service.read();
        trace!(service_id, consumer, only_healthy, "discover instances");
        if only_healthy {
            sorted(guard.healthy.values().chain(guard.protected.values()).cloned())
        } else {
            sorted(
                guard
                    .all
                    .iter()
                    .map(|(id, raw)| guard.protected.get(id).unwrap_or(raw).clone()),
            )
        }
    }

    /// Protected views of a service, sorted by id.
    pub fn protected_instances(&self, service_id: &str) -> Vec<Arc<Instance>> {
        let Some(service) = self.index.load().service(service_id) else {
            return Vec::new();
        };
        let guard = service.read();
        sorted(guard.protected.values().cloned())
    }

    /// Number of cached instances.
    pub fn instance_count(&self) -> usize {
        self.index.load().ids.len()
    }

    /// Aggregate counts for a service, absent once it has no instances.
    pub fn instances_count(&self, service_id: &str) -> Option<InstanceCount> {
        self.index.load().counts.get(service_id).map(|c| c.clone())
    }

    /// Ports exposed by a service's instances.
    pub fn service_ports(&self, service_id: &str) -> Vec<ServicePort> {
        self.index
            .load()
            .ports
            .get(service_id)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Visit every instance until `f` returns false.
    pub fn iterate_instances(&self, mut f: impl FnMut(&Arc<Instance>) -> bool) {
        let index = self.index.load();
        for entry in index.ids.iter() {
            if !f(entry.value()) {
                break;
            }
        }
    }

    /// Compare the cached count with the store's and force a full reload
    /// on mismatch. Runs at most once per reconcile interval.
    fn reconcile(&self) {
        if self.coordinator.is_first_update() {
            return;
        }
        {
            let mut last = self.last_reconcile.lock();
            if last.elapsed() < self.config.reconcile_interval() {
                return;
            }
            *last = Instant::now();
        }

        let cached = self.instance_count() as u64;
        match self.store.instance_count() {
            Ok(stored) if stored != cached => {
                warn!(cached, stored, "instance count mismatch, forcing full reload");
                self.coordinator.reset_last_fetch_time();
                self.coordinator.reset_last_mtime(INSTANCE_CACHE_NAME);
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "cannot read instance count, skipping reconciliation");
            }
        }
    }

    fn apply(&self, ctx: &RefreshContext, applied: &mut Applied) -> CacheResult<RefreshOutput> {
        let records = {
            let mut tx = self.store.start_read_tx()?;
            let read = tx
                .create_read_view()
                .and_then(|()| tx.instances_for_cache(ctx.since, ctx.first_update));
            match read {
                Ok(records) => {
                    tx.commit()?;
                    records
                }
                Err(err) => {
                    if let Err(rollback) = tx.rollback() {
                        warn!(error = %rollback, "rollback failed");
                    }
                    return Err(err);
                }
            }
        };

        let previous = self.index.load_full();
        let target = if ctx.full_reload {
            Arc::new(InstanceIndex::default())
        } else {
            Arc::clone(&previous)
        };

        let mut output = RefreshOutput::default();
        let mut seen = HashSet::with_capacity(records.len());
        for record in records {
            output.observe(INSTANCE_CACHE_NAME, record.modify_time);
            seen.insert(record.id.clone());
            self.apply_record(&previous, &target, ctx.full_reload, record, applied);
            output.applied += 1;
        }

        if ctx.full_reload {
            for entry in previous.ids.iter() {
                if !seen.contains(entry.key()) {
                    applied.affected.insert(entry.value().service_id.clone());
                    applied.events.push(InstanceEvent::new(
                        InstanceEventKind::Deleted,
                        Arc::clone(entry.value()),
                    ));
                }
            }
            applied
                .affected
                .extend(target.services.iter().map(|s| s.key().clone()));
        }

        for service_id in &applied.affected {
            self.settle_service(&target, service_id);
        }

        if ctx.full_reload {
            self.index.store(target);
        }
        Ok(output)
    }

    fn apply_record(
        &self,
        previous: &InstanceIndex,
        target: &InstanceIndex,
        full_reload: bool,
        record: Instance,
        applied: &mut Applied,
    ) {
        let mut old = previous.ids.get(&record.id).map(|i| Arc::clone(i.value()));

        if let Some(prior) = old.clone() {
            if prior.service_id != record.service_id {
                debug!(id = %record.id, from = %prior.service_id, to = %record.service_id, "instance moved service");
                if !full_reload {
                    target.detach(&prior);
                }
                applied.affected.insert(prior.service_id.clone());
                applied
                    .events
                    .push(InstanceEvent::new(InstanceEventKind::Deleted, prior));
                old = None;
            }
        }

        if !record.is_valid() {
            if let Some(prior) = old {
                if !full_reload {
                    target.detach(&prior);
                }
                applied.affected.insert(prior.service_id.clone());
                applied
                    .events
                    .push(InstanceEvent::new(InstanceEventKind::Deleted, prior));
            }
            return;
        }

        let instance = Arc::new(enrich(record));
        target.attach(Arc::clone(&instance));
        let kind = match &old {
            None => InstanceEventKind::Created,
            Some(prior) if prior.revision != instance.revision => InstanceEventKind::Updated,
            // Replayed by the overlap window.
            Some(_) => return,
        };
        trace!(id = %instance.id, ?kind, "instance changed");
        applied.affected.insert(instance.service_id.clone());
        applied.events.push(InstanceEvent::new(kind, instance));
    }

    /// Recompute protection, counts, and ports for one service.
    fn settle_service(&self, index: &InstanceIndex, service_id: &str) {
        let Some(service) = index.service(service_id) else {
            index.counts.remove(service_id);
            index.ports.remove(service_id);
            return;
        };

        let mut guard = service.write();
        if guard.all.is_empty() {
            drop(guard);
            index
                .services
                .remove_if(service_id, |_, s| s.read().all.is_empty());
            index.counts.remove(service_id);
            index.ports.remove(service_id);
            return;
        }

        guard.protected.clear();
        if self.config.zero_protect {
            let ids = select_protected(guard.all.values(), self.config.protect_threshold);
            if !ids.is_empty() {
                debug!(service_id, protected = ids.len(), "zero protection engaged");
            }
            for id in ids {
                let view = guard.unhealthy.get(&id).map(|raw| Arc::new(protected_view(raw)));
                if let Some(view) = view {
                    guard.protected.insert(id, view);
                }
            }
        }

        index.counts.insert(
            service_id.to_string(),
            InstanceCount::from_instances(guard.all.values().map(|i| i.as_ref())),
        );
        index.ports.insert(
            service_id.to_string(),
            guard
                .all
                .values()
                .map(|i| ServicePort {
                    port: i.port,
                    protocol: i.protocol.clone(),
                })
                .collect(),
        );
    }
}

fn sorted(instances: impl Iterator<Item = Arc<Instance>>) -> Vec<Arc<Instance>> {
    let mut out: Vec<Arc<Instance>> = instances.collect();
    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
}

impl Cache for InstanceCache {
    fn name(&self) -> &'static str {
        INSTANCE_CACHE_NAME
    }

    fn update(&self) -> CacheResult<()> {
        let mut applied = Applied::default();
        self.coordinator
            .update_with(|| self.reconcile(), |ctx| self.apply(ctx, &mut applied))?;

        if !applied.events.is_empty() {
            trace!(events = applied.events.len(), "publishing instance events");
        }
        self.hub.publish(applied.events);
        if let Some(listener) = &self.listener {
            for service_id in &applied.affected {
                listener.service_changed(service_id);
            }
        }
        Ok(())
    }

    fn clear(&self) -> CacheResult<()> {
        self.coordinator.clear_with(|| {
            self.index.store(Arc::new(InstanceIndex::default()));
            *self.last_reconcile.lock() = Instant::now();
        });
        info!("instance cache cleared");
        Ok(())
    }
}
