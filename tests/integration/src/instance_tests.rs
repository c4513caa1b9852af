//! Instance cache behavior observed through the public API.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use mesh_cache::Subscription;
use mesh_core::model::{METADATA_LAST_HEARTBEAT, METADATA_PROTOCOL};
use meshcache::prelude::*;

#[derive(Default)]
struct RecordingListener {
    services: Mutex<Vec<String>>,
}

impl ServiceChangeListener for RecordingListener {
    fn service_changed(&self, service_id: &str) {
        self.services.lock().unwrap().push(service_id.to_string());
    }
}

fn drain(sub: &mut Subscription) -> Vec<(InstanceEventKind, String)> {
    let mut out = Vec::new();
    while let Ok(event) = sub.try_recv() {
        out.push((event.kind, event.instance.id.clone()));
    }
    out
}

fn inst(id: &str, service_id: &str, healthy: bool) -> Instance {
    let mut i = Instance::new(id, service_id, ServiceKey::new("ns", service_id), "10.0.0.1", 8080);
    i.healthy = healthy;
    i
}

fn assert_partitioned(cache: &InstanceCache, service_id: &str) {
    let all = cache.instances_by_service_id(service_id);
    let served = cache.discover(service_id, false, "test");
    let healthy = cache.discover(service_id, true, "test");
    assert_eq!(served.len(), all.len());
    let protected: HashSet<String> = cache
        .protected_instances(service_id)
        .iter()
        .map(|i| i.id.clone())
        .collect();

    let healthy_raw = all.iter().filter(|i| i.healthy).count();
    assert!(all
        .iter()
        .filter(|i| protected.contains(&i.id))
        .all(|i| !i.healthy));
    assert_eq!(healthy.len(), healthy_raw + protected.len());
    let count = cache.instances_count(service_id).unwrap_or_default();
    assert_eq!(count.total as usize, all.len());
    assert_eq!(count.healthy as usize, healthy_raw);
}

#[test]
fn events_follow_instance_lifecycle() {
    let store = Arc::new(MemoryStore::new());
    let listener = Arc::new(RecordingListener::default());
    let caches = CacheManagerBuilder::new()
        .listener(listener.clone())
        .build(Arc::clone(&store))
        .unwrap();
    let mut sub = caches.instances.subscribe();

    store.put_instance(inst("i1", "orders", true));
    store.put_instance(inst("i2", "orders", true));
    caches.instances.update().unwrap();
    let mut created = drain(&mut sub);
    created.sort_by(|a, b| a.1.cmp(&b.1));
    assert_eq!(
        created,
        vec![
            (InstanceEventKind::Created, "i1".to_string()),
            (InstanceEventKind::Created, "i2".to_string()),
        ]
    );

    store.put_instance(inst("i1", "orders", false));
    caches.instances.update().unwrap();
    assert_eq!(drain(&mut sub), vec![(InstanceEventKind::Updated, "i1".to_string())]);

    store.delete_instance("i2");
    caches.instances.update().unwrap();
    assert_eq!(drain(&mut sub), vec![(InstanceEventKind::Deleted, "i2".to_string())]);

    // Nothing changed: no events and no notification.
    let notified = listener.services.lock().unwrap().len();
    caches.instances.update().unwrap();
    assert!(drain(&mut sub).is_empty());
    assert_eq!(listener.services.lock().unwrap().len(), notified);
    assert!(listener.services.lock().unwrap().iter().all(|s| s == "orders"));
}

#[test]
fn moving_an_instance_between_services() {
    let store = Arc::new(MemoryStore::new());
    let caches = CacheManagerBuilder::new().build(Arc::clone(&store)).unwrap();
    let mut sub = caches.instances.subscribe();

    store.put_instance(inst("i1", "orders", true));
    store.put_instance(inst("i2", "orders", true));
    caches.instances.update().unwrap();
    drain(&mut sub);

    store.put_instance(inst("i1", "billing", true));
    caches.instances.update().unwrap();

    assert_eq!(
        drain(&mut sub),
        vec![
            (InstanceEventKind::Deleted, "i1".to_string()),
            (InstanceEventKind::Created, "i1".to_string()),
        ]
    );
    assert_eq!(caches.instances.instances_by_service_id("orders").len(), 1);
    assert_eq!(caches.instances.instances_by_service_id("billing").len(), 1);
    assert_eq!(caches.instances.instance_count(), 2);
    assert_partitioned(&caches.instances, "orders");
    assert_partitioned(&caches.instances, "billing");
}

#[test]
fn emptied_service_disappears() {
    let store = Arc::new(MemoryStore::new());
    let caches = CacheManagerBuilder::new().build(Arc::clone(&store)).unwrap();

    store.put_instance(inst("i1", "orders", true));
    caches.instances.update().unwrap();
    assert!(caches.instances.instances_count("orders").is_some());

    store.delete_instance("i1");
    caches.instances.update().unwrap();
    assert!(caches.instances.instances_count("orders").is_none());
    assert!(caches.instances.service_ports("orders").is_empty());
}

#[test]
fn ports_and_protocol_are_exposed() {
    let store = Arc::new(MemoryStore::new());
    let caches = CacheManagerBuilder::new().build(Arc::clone(&store)).unwrap();

    let mut a = inst("i1", "orders", true);
    a.protocol = "grpc".to_string();
    store.put_instance(a);
    caches.instances.update().unwrap();

    let ports = caches.instances.service_ports("orders");
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].port, 8080);
    assert_eq!(ports[0].protocol, "grpc");

    let cached = caches.instances.get_instance("i1").unwrap();
    assert_eq!(cached.metadata.get(METADATA_PROTOCOL).map(String::as_str), Some("grpc"));
}

#[test]
fn partitions_hold_with_zero_protection() {
    let store = Arc::new(MemoryStore::new());
    let mut config = CacheConfig::default();
    config.instance.zero_protect = true;
    let caches = CacheManagerBuilder::new()
        .config(config)
        .build(Arc::clone(&store))
        .unwrap();

    // Unhealthy heartbeats lag i1 by 10s per index step.
    for i in 0..10 {
        let mut instance = inst(&format!("i{i}"), "orders", i % 3 == 0);
        instance
            .metadata
            .insert(METADATA_LAST_HEARTBEAT.to_string(), (1_000 - 10 * i).to_string());
        store.put_instance(instance);
    }
    caches.instances.update().unwrap();
    let protected: Vec<String> = caches
        .instances
        .protected_instances("orders")
        .iter()
        .map(|i| i.id.clone())
        .collect();
    assert_eq!(protected, vec!["i4", "i5", "i7", "i8"]);
    assert_partitioned(&caches.instances, "orders");

    for i in 0..10 {
        store.put_instance(inst(&format!("i{i}"), "orders", i % 2 == 0));
    }
    caches.instances.update().unwrap();
    assert_partitioned(&caches.instances, "orders");
}

#[test]
fn store_outage_keeps_serving_and_recovers() {
    let store = Arc::new(MemoryStore::new());
    let caches = CacheManagerBuilder::new().build(Arc::clone(&store)).unwrap();

    store.put_instance(inst("i1", "orders", true));
    caches.instances.update().unwrap();

    store.set_unavailable(true);
    store.put_instance(inst("i2", "orders", true));
    assert!(caches.instances.update().is_err());
    assert_eq!(caches.instances.discover("orders", true, "test").len(), 1);
    assert_eq!(caches.instances.coordinator().stats().failures(), 1);

    store.set_unavailable(false);
    caches.instances.update().unwrap();
    assert_eq!(caches.instances.discover("orders", true, "test").len(), 2);
}
