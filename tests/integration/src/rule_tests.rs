//! Rule caches of every kind refreshed from one store.

use std::collections::HashMap;
use std::sync::Arc;

use mesh_cache::{LegacyRoute, Predicate};
use mesh_core::model::{LaneRule, LegacyOrigin, RoutingPolicy};
use meshcache::prelude::*;

fn setup() -> (Arc<MemoryStore>, MeshCaches) {
    let store = Arc::new(MemoryStore::new());
    let caches = CacheManagerBuilder::new().build(Arc::clone(&store)).unwrap();
    (store, caches)
}

fn meta(id: &str, priority: u32) -> RuleMeta {
    let mut meta = RuleMeta::new(id, id);
    meta.priority = priority;
    meta
}

fn ids<R: Rule>(resolved: &ResolvedRules<R>) -> Vec<String> {
    resolved.rules.iter().map(|r| r.id().to_string()).collect()
}

fn lane(name: &str) -> LaneRule {
    LaneRule {
        name: name.to_string(),
        enable: true,
        priority: 0,
        label_value: name.to_string(),
    }
}

#[test]
fn router_rules_bind_by_direction() {
    let (store, caches) = setup();
    let gateway = ServiceKey::new("prod", "gateway");
    let orders = ServiceKey::new("prod", "orders");

    store.put_rule(RouterRule::new(meta("to-orders", 1), vec![gateway.clone()], vec![orders.clone()]));
    store.put_rule(RouterRule::new(
        meta("prod-wide", 5),
        vec![ServiceKey::namespace_wildcard("prod")],
        vec![ServiceKey::namespace_wildcard("prod")],
    ));
    caches.routers.update().unwrap();

    let inbound = caches.routers.resolve_routes(&orders, Direction::Inbound);
    assert_eq!(ids(&inbound), vec!["to-orders", "prod-wide"]);
    let outbound = caches.routers.resolve_routes(&gateway, Direction::Outbound);
    assert_eq!(ids(&outbound), vec!["to-orders", "prod-wide"]);

    // gateway is never a destination of the exact rule.
    let gateway_in = caches.routers.resolve_routes(&gateway, Direction::Inbound);
    assert_eq!(ids(&gateway_in), vec!["prod-wide"]);
}

#[test]
fn legacy_projection_follows_router_changes() {
    let (store, caches) = setup();
    let svc = ServiceKey::new("prod", "orders");

    let mut converted = RouterRule::new(meta("legacy-1", 0), vec![], vec![svc.clone()]);
    converted.legacy = Some(LegacyOrigin { service: svc.clone() });
    store.put_rule(converted);

    let mut metadata = RouterRule::new(meta("meta-1", 1), vec![], vec![svc.clone()]);
    metadata.policy = RoutingPolicy::MetadataRouting;
    store.put_rule(metadata);
    caches.routers.update().unwrap();

    let routing = caches.routers.index().legacy_routing(&svc);
    let inbound: Vec<&str> = routing.inbounds.iter().map(|r: &LegacyRoute| r.rule_id.as_str()).collect();
    assert_eq!(inbound, vec!["legacy-1"]);
    assert_eq!(caches.routers.index().converted_from_legacy(&svc), vec!["legacy-1"]);
    let before = routing.revision;

    store.delete_rule::<RouterRule>("legacy-1");
    caches.routers.update().unwrap();

    let routing = caches.routers.index().legacy_routing(&svc);
    assert!(routing.inbounds.is_empty());
    assert_ne!(routing.revision, before);
    assert!(caches.routers.index().converted_from_legacy(&svc).is_empty());
}

#[test]
fn lane_groups_bind_entries_and_destinations() {
    let (store, caches) = setup();
    let entry = ServiceKey::new("prod", "gateway");
    let dest = ServiceKey::new("prod", "orders");

    let mut group = LaneGroup::new(meta("canary", 0));
    group.entries = vec![entry.clone()];
    group.destinations = vec![dest.clone()];
    group.lanes = vec![lane("blue"), lane("green")];
    store.put_rule(group);
    caches.lanes.update().unwrap();

    assert_eq!(ids(&caches.lanes.resolve(&entry)), vec!["canary"]);
    assert_eq!(ids(&caches.lanes.resolve(&dest)), vec!["canary"]);
    assert!(caches.lanes.resolve(&ServiceKey::new("prod", "billing")).is_empty());
}

#[test]
fn invalid_lane_group_is_skipped() {
    let (store, caches) = setup();
    let svc = ServiceKey::new("prod", "gateway");

    let mut group = LaneGroup::new(meta("broken", 0));
    group.entries = vec![svc.clone()];
    group.lanes = vec![lane("blue"), lane("blue")];
    store.put_rule(group);

    caches.lanes.update().unwrap();
    assert!(caches.lanes.get_rule("broken").is_none());
    assert!(caches.lanes.resolve(&svc).is_empty());
    assert_eq!(caches.lanes.coordinator().stats().skipped(), 1);
}

#[test]
fn disabled_rule_is_cached_but_not_indexed() {
    let (store, caches) = setup();
    let svc = ServiceKey::new("prod", "orders");

    let mut m = meta("fd-1", 0);
    m.enable = false;
    store.put_rule(FaultDetectRule::new(m, svc.clone()));
    caches.fault_detects.update().unwrap();

    assert!(caches.fault_detects.get_rule("fd-1").is_some());
    assert!(caches.fault_detects.resolve(&svc).is_empty());

    store.put_rule(FaultDetectRule::new(meta("fd-1", 0), svc.clone()));
    caches.fault_detects.update().unwrap();
    assert_eq!(ids(&caches.fault_detects.resolve(&svc)), vec!["fd-1"]);
}

#[test]
fn unrelated_change_keeps_bucket_revision() {
    let (store, caches) = setup();
    let a = ServiceKey::new("ns1", "a");
    let b = ServiceKey::new("ns2", "b");

    store.put_rule(CircuitBreakerRule::new(meta("cb-a", 0), a.clone()));
    store.put_rule(CircuitBreakerRule::new(meta("cb-b", 0), b.clone()));
    caches.circuit_breakers.update().unwrap();
    let rev_a = caches.circuit_breakers.resolve(&a).revision;
    let rev_b = caches.circuit_breakers.resolve(&b).revision;

    store.put_rule(CircuitBreakerRule::new(meta("cb-b", 3), b.clone()));
    caches.circuit_breakers.update().unwrap();

    assert_eq!(caches.circuit_breakers.resolve(&a).revision, rev_a);
    assert_ne!(caches.circuit_breakers.resolve(&b).revision, rev_b);
}

#[test]
fn global_change_reaches_every_service() {
    let (store, caches) = setup();
    let services: Vec<ServiceKey> = (0..5)
        .map(|i| ServiceKey::new(format!("ns{}", i % 2), format!("svc{i}")))
        .collect();
    for (i, svc) in services.iter().enumerate() {
        store.put_rule(CircuitBreakerRule::new(meta(&format!("own-{i}"), 0), svc.clone()));
    }
    caches.circuit_breakers.update().unwrap();

    store.put_rule(CircuitBreakerRule::new(meta("global", 9), ServiceKey::all()));
    caches.circuit_breakers.update().unwrap();
    for (i, svc) in services.iter().enumerate() {
        assert_eq!(
            ids(&caches.circuit_breakers.resolve(svc)),
            vec![format!("own-{i}"), "global".to_string()]
        );
    }

    store.delete_rule::<CircuitBreakerRule>("global");
    caches.circuit_breakers.update().unwrap();
    for (i, svc) in services.iter().enumerate() {
        assert_eq!(ids(&caches.circuit_breakers.resolve(svc)), vec![format!("own-{i}")]);
    }
}

#[test]
fn query_filters_and_pages_cached_rules() {
    let (store, caches) = setup();
    for (id, priority, name) in [("r1", 3, "pay"), ("r2", 1, "pay"), ("r3", 2, "ship")] {
        store.put_rule(CircuitBreakerRule::new(meta(id, priority), ServiceKey::new("prod", name)));
    }
    caches.circuit_breakers.update().unwrap();

    let mut params = HashMap::new();
    params.insert("service".to_string(), "pay".to_string());
    params.insert("order_field".to_string(), "priority".to_string());
    params.insert("order_type".to_string(), "asc".to_string());
    let query = RuleQuery::from_params(&params).unwrap();

    let page = caches.circuit_breakers.query(&query, &[]);
    assert_eq!(page.total, 2);
    let got: Vec<&str> = page.items.iter().map(|r| r.id()).collect();
    assert_eq!(got, vec!["r2", "r1"]);

    let high_only: Predicate<CircuitBreakerRule> = Box::new(|r: &CircuitBreakerRule| r.priority() > 1);
    let page = caches.circuit_breakers.query(&query, &[high_only]);
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].id(), "r1");
}

#[test]
fn bad_query_parameter_is_rejected() {
    let mut params = HashMap::new();
    params.insert("limit".to_string(), "many".to_string());
    let err = RuleQuery::from_params(&params).unwrap_err();
    assert!(matches!(err, CacheError::InvalidQuery { .. }));
}
