//! Load tests for meshcache with thousands of rules and instances.
//!
//! These tests verify the caches hold up under load:
//! - Concurrent refreshes collapsing into one store read
//! - Readers racing a stream of rule changes
//! - Large rule and instance sets
//!
//! Run with: `cargo test --package integration-tests --test load_tests -- --nocapture`

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use meshcache::prelude::*;
use proptest::prelude::*;

fn cb(id: &str, priority: u32, scope: ServiceKey) -> CircuitBreakerRule {
    let mut meta = RuleMeta::new(id, id);
    meta.priority = priority;
    CircuitBreakerRule::new(meta, scope)
}

fn service(i: usize) -> ServiceKey {
    ServiceKey::new(format!("ns-{}", i % 10), format!("svc-{i}"))
}

/// Concurrent callers share one in-flight refresh.
#[test]
fn test_concurrent_updates_share_one_fetch() {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(CircuitBreakerCache::circuit_breakers(
        Arc::clone(&store),
        Duration::from_secs(1),
    ));
    store.put_rule(cb("r1", 0, ServiceKey::all()));
    store.set_fetch_delay(Duration::from_millis(200));

    let callers = 8;
    let barrier = Arc::new(Barrier::new(callers));
    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.update()
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let fetches = store.fetch_count();
    let stats = cache.coordinator().stats();
    println!(
        "{} callers, {} fetches, {} joined",
        callers,
        fetches,
        stats.joined()
    );
    assert!(fetches < callers as u64);
    assert!(stats.joined() >= 1);
    assert_eq!(stats.refreshes() + stats.joined(), callers as u64);
    assert_eq!(cache.resolve(&service(1)).len(), 1);
}

/// Readers always see a complete bucket while rules churn.
#[test]
fn test_readers_during_rule_churn() {
    let store = Arc::new(MemoryStore::new());
    let caches = CacheManagerBuilder::new().build(Arc::clone(&store)).unwrap();
    let target = service(3);

    store.put_rule(cb("base", 0, target.clone()));
    caches.circuit_breakers.update().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let reads = Arc::new(AtomicU64::new(0));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let cache = Arc::clone(&caches.circuit_breakers);
            let stop = Arc::clone(&stop);
            let reads = Arc::clone(&reads);
            let target = target.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let resolved = cache.resolve(&target);
                    // "base" never leaves; churned rules come and go.
                    assert!(resolved.rules.iter().any(|r| r.id() == "base"));
                    let mut sorted = resolved.rules.clone();
                    sorted.sort_by(|a, b| (a.priority(), a.id()).cmp(&(b.priority(), b.id())));
                    let order: Vec<&str> = resolved.rules.iter().map(|r| r.id()).collect();
                    let expected: Vec<&str> = sorted.iter().map(|r| r.id()).collect();
                    assert_eq!(order, expected);
                    reads.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    let start = Instant::now();
    for round in 0..200u32 {
        let id = format!("churn-{}", round % 5);
        if round % 3 == 0 {
            store.delete_rule::<CircuitBreakerRule>(&id);
        } else {
            store.put_rule(cb(&id, round % 4, target.clone()));
        }
        caches.circuit_breakers.update().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().unwrap();
    }

    println!(
        "200 refreshes in {:?} alongside {} reads",
        start.elapsed(),
        reads.load(Ordering::Relaxed)
    );
}

/// Test that the rule index handles 1000 services with wildcard layers.
#[test]
fn test_1000_services() {
    let store = Arc::new(MemoryStore::new());
    let caches = CacheManagerBuilder::new().build(Arc::clone(&store)).unwrap();
    let num_services = 1000;

    store.put_rule(cb("global", 100, ServiceKey::all()));
    for ns in 0..10 {
        store.put_rule(cb(&format!("ns-rule-{ns}"), 50, ServiceKey::namespace_wildcard(format!("ns-{ns}"))));
    }
    for i in 0..num_services {
        store.put_rule(cb(&format!("own-{i}"), 0, service(i)));
    }

    let start = Instant::now();
    caches.circuit_breakers.update().unwrap();
    println!("Loaded {} rules in {:?}", caches.circuit_breakers.rule_count(), start.elapsed());
    assert_eq!(caches.circuit_breakers.rule_count(), num_services + 11);

    let start = Instant::now();
    for i in 0..num_services {
        let resolved = caches.circuit_breakers.resolve(&service(i));
        let got: Vec<&str> = resolved.rules.iter().map(|r| r.id()).collect();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0], format!("own-{i}"));
        assert_eq!(got[1], format!("ns-rule-{}", i % 10));
        assert_eq!(got[2], "global");
    }
    let elapsed = start.elapsed();
    println!(
        "Resolved {} services in {:?} ({:.2} µs/op)",
        num_services,
        elapsed,
        elapsed.as_micros() as f64 / num_services as f64
    );
}

/// Test discovery over 5000 instances spread across 50 services.
#[test]
fn test_5000_instances() {
    let store = Arc::new(MemoryStore::new());
    let caches = CacheManagerBuilder::new().build(Arc::clone(&store)).unwrap();

    for i in 0..5000 {
        let svc = format!("svc-{}", i % 50);
        let mut inst = Instance::new(
            format!("inst-{i}"),
            svc.clone(),
            ServiceKey::new("ns", svc),
            format!("10.{}.{}.{}", i / 65536, (i / 256) % 256, i % 256),
            8080,
        );
        inst.healthy = i % 5 != 0;
        store.put_instance(inst);
    }

    let start = Instant::now();
    caches.instances.update().unwrap();
    println!("Loaded 5000 instances in {:?}", start.elapsed());

    assert_eq!(caches.instances.instance_count(), 5000);
    for s in 0..50 {
        let id = format!("svc-{s}");
        assert_eq!(caches.instances.discover(&id, false, "load").len(), 100);
        assert_eq!(caches.instances.discover(&id, true, "load").len(), 80);
    }
}

/// The periodic driver keeps caches current while readers run.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_manager_loop_under_load() {
    let store = Arc::new(MemoryStore::new());
    let config = CacheConfig {
        refresh_interval_ms: 5,
        ..Default::default()
    };
    let caches = CacheManagerBuilder::new()
        .config(config)
        .build(Arc::clone(&store))
        .unwrap();

    let (tx, rx) = tokio::sync::watch::channel(false);
    let driver = tokio::spawn(Arc::clone(&caches.manager).run(rx));

    for i in 0..100 {
        store.put_rule(cb(&format!("r{i}"), 0, service(i)));
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while caches.circuit_breakers.rule_count() < 100 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(caches.circuit_breakers.rule_count(), 100);
    for i in 0..100 {
        assert_eq!(caches.circuit_breakers.resolve(&service(i)).len(), 1);
    }

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), driver)
        .await
        .expect("driver did not stop")
        .unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Any interleaving of puts and deletes ends with the cache matching
    /// a fresh full load of the same store.
    #[test]
    fn incremental_matches_full_load(ops in prop::collection::vec((0usize..8, 0usize..6, any::<bool>()), 1..40)) {
        let store = Arc::new(MemoryStore::new());
        let incremental = CircuitBreakerCache::circuit_breakers(Arc::clone(&store), Duration::from_secs(1));
        incremental.update().unwrap();

        for (rule, scope, delete) in ops {
            let id = format!("r{rule}");
            if delete {
                store.delete_rule::<CircuitBreakerRule>(&id);
            } else {
                let key = match scope {
                    0 => ServiceKey::all(),
                    1 => ServiceKey::namespace_wildcard("ns-1"),
                    n => service(n),
                };
                store.put_rule(cb(&id, (rule % 3) as u32, key));
            }
            incremental.update().unwrap();
        }

        let fresh = CircuitBreakerCache::circuit_breakers(Arc::clone(&store), Duration::from_secs(1));
        fresh.update().unwrap();

        for n in 0..12 {
            let svc = service(n);
            let a = incremental.resolve(&svc);
            let b = fresh.resolve(&svc);
            prop_assert_eq!(&a.rules, &b.rules);
            prop_assert_eq!(a.revision, b.revision);
        }
    }
}
