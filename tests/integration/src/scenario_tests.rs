//! End-to-end scenarios across the refresh engine, rule indexes, and
//! instance cache.

use std::sync::Arc;
use std::time::Duration;

use mesh_core::model::METADATA_LAST_HEARTBEAT;
use meshcache::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("mesh_cache=debug")
        .with_test_writer()
        .try_init();
}

fn cb(id: &str, priority: u32, destination: ServiceKey) -> CircuitBreakerRule {
    let mut meta = RuleMeta::new(id, id);
    meta.priority = priority;
    CircuitBreakerRule::new(meta, destination)
}

fn ids<R: Rule>(resolved: &ResolvedRules<R>) -> Vec<String> {
    resolved.rules.iter().map(|r| r.id().to_string()).collect()
}

fn setup() -> (Arc<MemoryStore>, MeshCaches) {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let caches = CacheManagerBuilder::new()
        .build(Arc::clone(&store))
        .expect("default config is valid");
    (store, caches)
}

#[test]
fn global_rule_applies_to_every_service() {
    let (store, caches) = setup();
    store.put_rule(cb("R1", 0, ServiceKey::all()));
    caches.circuit_breakers.update().unwrap();

    let resolved = caches
        .circuit_breakers
        .resolve(&ServiceKey::new("ns1", "svcA"));
    assert_eq!(ids(&resolved), vec!["R1"]);
}

#[test]
fn namespace_and_exact_rules_union_in_priority_order() {
    let (store, caches) = setup();
    store.put_rule(cb("R1", 10, ServiceKey::namespace_wildcard("ns1")));
    store.put_rule(cb("R2", 1, ServiceKey::new("ns1", "svcA")));
    caches.circuit_breakers.update().unwrap();

    let a = caches.circuit_breakers.resolve(&ServiceKey::new("ns1", "svcA"));
    assert_eq!(ids(&a), vec!["R2", "R1"]);

    let b = caches.circuit_breakers.resolve(&ServiceKey::new("ns1", "svcB"));
    assert_eq!(ids(&b), vec!["R1"]);
}

#[test]
fn zero_protection_keeps_stale_instances_visible() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let mut config = CacheConfig::default();
    config.instance.zero_protect = true;
    config.instance.protect_threshold = 0.8;
    let caches = CacheManagerBuilder::new()
        .config(config)
        .build(Arc::clone(&store))
        .unwrap();

    let service = ServiceKey::new("ns", "X");
    let now = 1_700_000_000_i64;
    for i in 0..6 {
        store.put_instance(Instance::new(format!("healthy-{i}"), "X", service.clone(), "10.0.0.1", 80));
    }
    let mut fresh = Instance::new("unhealthy-fresh", "X", service.clone(), "10.0.1.1", 80);
    fresh.healthy = false;
    fresh
        .metadata
        .insert(METADATA_LAST_HEARTBEAT.to_string(), now.to_string());
    store.put_instance(fresh);
    for i in 0..5 {
        let mut stale = Instance::new(format!("unhealthy-stale-{i}"), "X", service.clone(), "10.0.2.1", 80);
        stale.healthy = false;
        // Default ttl is 5s; three ttls plus one second behind the freshest peer.
        stale
            .metadata
            .insert(METADATA_LAST_HEARTBEAT.to_string(), (now - 16).to_string());
        store.put_instance(stale);
    }

    caches.instances.update().unwrap();

    let protected = caches.instances.protected_instances("X");
    assert_eq!(protected.len(), 5);
    assert!(protected.iter().all(|i| i.id.starts_with("unhealthy-stale-")));
    assert!(protected.iter().all(|i| i.healthy && i.is_zero_protected()));

    let visible = caches.instances.discover("X", true, "scenario");
    assert_eq!(visible.len(), 11);
    assert!(visible.iter().all(|i| i.id != "unhealthy-fresh"));

    // The authoritative flag is untouched.
    let raw = caches.instances.get_instance("unhealthy-stale-0").unwrap();
    assert!(!raw.healthy);
    let count = caches.instances.instances_count("X").unwrap();
    assert_eq!((count.total, count.healthy), (12, 6));
}

#[test]
fn reconciliation_removes_physically_deleted_instance() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let mut config = CacheConfig::default();
    config.instance.reconcile_interval_secs = 0;
    let caches = CacheManagerBuilder::new()
        .config(config)
        .build(Arc::clone(&store))
        .unwrap();

    let service = ServiceKey::new("ns", "svc");
    for i in 0..3 {
        store.put_instance(Instance::new(format!("i{i}"), "svc-1", service.clone(), "10.0.0.1", 80));
    }
    caches.instances.update().unwrap();
    assert_eq!(caches.instances.instance_count(), 3);

    assert!(store.purge_instance("i1"));
    caches.instances.update().unwrap();

    assert!(caches.instances.get_instance("i1").is_none());
    assert_eq!(caches.instances.instance_count(), 2);
    assert_eq!(caches.instances.instances_by_service_id("svc-1").len(), 2);
    assert_eq!(caches.instances.instances_count("svc-1").unwrap().total, 2);
}

#[test]
fn reconciliation_runs_once_the_interval_passes() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let mut config = CacheConfig::default();
    config.instance.reconcile_interval_secs = 1;
    let caches = CacheManagerBuilder::new()
        .config(config)
        .build(Arc::clone(&store))
        .unwrap();
    let stats = caches.instances.coordinator().stats();

    let service = ServiceKey::new("ns", "svc");
    for i in 0..3 {
        store.put_instance(Instance::new(format!("i{i}"), "svc-1", service.clone(), "10.0.0.1", 80));
    }
    caches.instances.update().unwrap();
    assert!(store.purge_instance("i1"));

    // Inside the interval the purge goes unnoticed.
    caches.instances.update().unwrap();
    assert_eq!(stats.full_reloads(), 1);
    assert!(caches.instances.get_instance("i1").is_some());

    std::thread::sleep(Duration::from_millis(1100));
    caches.instances.update().unwrap();
    assert_eq!(stats.full_reloads(), 2);
    assert!(caches.instances.get_instance("i1").is_none());
    assert_eq!(caches.instances.instances_count("svc-1").unwrap().total, 2);
}

#[test]
fn destination_change_moves_circuit_breaker() {
    let (store, caches) = setup();
    let a = ServiceKey::new("ns", "svcA");
    let b = ServiceKey::new("ns", "svcB");

    store.put_rule(cb("cb-1", 0, a.clone()));
    caches.circuit_breakers.update().unwrap();
    assert_eq!(ids(&caches.circuit_breakers.resolve(&a)), vec!["cb-1"]);

    store.put_rule(cb("cb-1", 0, b.clone()));
    caches.circuit_breakers.update().unwrap();
    assert!(caches.circuit_breakers.resolve(&a).is_empty());
    assert_eq!(ids(&caches.circuit_breakers.resolve(&b)), vec!["cb-1"]);
}

#[test]
fn soft_delete_is_retracted_everywhere() {
    let (store, caches) = setup();
    let svc = ServiceKey::new("ns", "svc");
    store.put_rule(cb("cb-1", 0, svc.clone()));
    store.put_rule(RouterRule::new(RuleMeta::new("route-1", "r"), vec![], vec![svc.clone()]));
    store.put_instance(Instance::new("i1", "svc-1", svc.clone(), "10.0.0.1", 80));
    assert!(caches.manager.update_all().is_empty());

    store.delete_rule::<CircuitBreakerRule>("cb-1");
    store.delete_rule::<RouterRule>("route-1");
    store.delete_instance("i1");
    assert!(caches.manager.update_all().is_empty());

    assert!(caches.circuit_breakers.get_rule("cb-1").is_none());
    assert!(caches.circuit_breakers.resolve(&svc).is_empty());
    assert!(caches.routers.get_rule("route-1").is_none());
    assert!(caches.routers.resolve_routes(&svc, Direction::Inbound).is_empty());
    assert!(caches.instances.get_instance("i1").is_none());
    assert!(caches.instances.discover("svc-1", false, "scenario").is_empty());
}

#[test]
fn replaying_a_batch_after_clear_is_idempotent() {
    let (store, caches) = setup();
    let services = [
        ServiceKey::new("ns1", "a"),
        ServiceKey::new("ns1", "b"),
        ServiceKey::new("ns2", "a"),
    ];
    store.put_rule(cb("g", 3, ServiceKey::all()));
    store.put_rule(cb("n", 2, ServiceKey::namespace_wildcard("ns1")));
    store.put_rule(cb("e", 1, services[0].clone()));

    caches.circuit_breakers.update().unwrap();
    let once: Vec<_> = services
        .iter()
        .map(|s| {
            let r = caches.circuit_breakers.resolve(s);
            (ids(&r), r.revision)
        })
        .collect();

    caches.circuit_breakers.clear().unwrap();
    caches.circuit_breakers.update().unwrap();
    caches.circuit_breakers.coordinator().reset_last_fetch_time();
    caches.circuit_breakers.update().unwrap();
    let twice: Vec<_> = services
        .iter()
        .map(|s| {
            let r = caches.circuit_breakers.resolve(s);
            (ids(&r), r.revision)
        })
        .collect();

    assert_eq!(once, twice);
}

#[test]
fn failed_refresh_serves_stale_state() {
    let (store, caches) = setup();
    let svc = ServiceKey::new("ns", "svc");
    store.put_rule(cb("cb-1", 0, svc.clone()));
    caches.circuit_breakers.update().unwrap();

    store.set_unavailable(true);
    store.put_rule(cb("cb-2", 0, svc.clone()));
    let err = caches.circuit_breakers.update().unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(ids(&caches.circuit_breakers.resolve(&svc)), vec!["cb-1"]);

    store.set_unavailable(false);
    caches.circuit_breakers.update().unwrap();
    assert_eq!(ids(&caches.circuit_breakers.resolve(&svc)), vec!["cb-1", "cb-2"]);
}
