//! Bidirectional router rule container.
//!
//! Routing rules are indexed twice: under their destinations for inbound
//! lookups and under their sources for outbound lookups. Each bucket also
//! keeps a legacy per-service projection of its rule-routing rules, rebuilt
//! whenever the bucket is reloaded.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use mesh_core::model::{LegacyOrigin, RouterRule, Rule, RoutingPolicy};
use mesh_core::{compute_revision, Record, Revision, ServiceKey};

use crate::rules::RuleIndexer;
use crate::wildcard::{IndexMode, Projection, ResolvedRules, WildcardRuleIndex};

/// Lookup direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Rules whose destinations cover the service.
    Inbound,
    /// Rules whose sources cover the service.
    Outbound,
}

/// One rule in the legacy per-service routing shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyRoute {
    /// Originating rule.
    pub rule_id: String,
    /// Evaluation priority.
    pub priority: u32,
    /// Calling services.
    pub sources: Vec<ServiceKey>,
    /// Called services.
    pub destinations: Vec<ServiceKey>,
}

/// Legacy projection of one bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyRoutes {
    /// Routes in evaluation order.
    pub routes: Vec<LegacyRoute>,
}

/// Projects rule-routing rules into the legacy shape. Metadata routing has
/// no legacy equivalent and is left out.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyRouteProjection;

impl Projection<RouterRule> for LegacyRouteProjection {
    type View = LegacyRoutes;

    fn project(_scope: &ServiceKey, rules: &[Arc<RouterRule>]) -> LegacyRoutes {
        LegacyRoutes {
            routes: rules
                .iter()
                .filter(|r| r.policy == RoutingPolicy::RuleRouting)
                .map(|r| LegacyRoute {
                    rule_id: r.id().to_string(),
                    priority: r.priority(),
                    sources: r.sources.clone(),
                    destinations: r.destinations.clone(),
                })
                .collect(),
        }
    }
}

/// Legacy routing document for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyRouting {
    /// Service the document describes.
    pub service: ServiceKey,
    /// Routes applying to calls into the service.
    pub inbounds: Vec<LegacyRoute>,
    /// Routes applying to calls made by the service.
    pub outbounds: Vec<LegacyRoute>,
    /// Revision over both directions.
    pub revision: Revision,
}

type RouterIndex = WildcardRuleIndex<RouterRule, LegacyRouteProjection>;

/// Inbound and outbound router indexes plus legacy-conversion tracking.
#[derive(Debug)]
pub struct RouteRuleContainer {
    inbound: RouterIndex,
    outbound: RouterIndex,
    /// Legacy service → ids of rules converted from its document.
    converted: DashMap<ServiceKey, BTreeSet<String>>,
}

impl Default for RouteRuleContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteRuleContainer {
    /// Create an empty container.
    pub fn new() -> Self {
        Self {
            inbound: WildcardRuleIndex::new(IndexMode::Union, RouterRule::destination_scopes),
            outbound: WildcardRuleIndex::new(IndexMode::Union, RouterRule::source_scopes),
            converted: DashMap::new(),
        }
    }

    /// Index for one direction.
    pub fn index(&self, direction: Direction) -> &RouterIndex {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    /// Rules effective for `svc` in `direction`.
    pub fn resolve(&self, svc: &ServiceKey, direction: Direction) -> ResolvedRules<RouterRule> {
        self.index(direction).resolve(svc)
    }

    /// Rules for `svc` in `direction` restricted to one policy family.
    pub fn resolve_policy(
        &self,
        svc: &ServiceKey,
        direction: Direction,
        policy: RoutingPolicy,
    ) -> Vec<Arc<RouterRule>> {
        self.resolve(svc, direction)
            .rules
            .into_iter()
            .filter(|r| r.policy == policy)
            .collect()
    }

    /// Legacy routing document for `svc`, merged from the projections of
    /// every bucket covering it.
    pub fn legacy_routing(&self, svc: &ServiceKey) -> LegacyRouting {
        let inbounds = Self::merge_layers(&self.inbound, svc);
        let outbounds = Self::merge_layers(&self.outbound, svc);
        let revision = compute_revision(
            inbounds
                .1
                .iter()
                .chain(outbounds.1.iter())
                .filter(|r| !r.is_empty())
                .map(|r| r.as_str().to_string()),
        );
        LegacyRouting {
            service: svc.clone(),
            inbounds: inbounds.0,
            outbounds: outbounds.0,
            revision,
        }
    }

    /// Ids of rules converted from `service`'s legacy document.
    pub fn converted_from_legacy(&self, service: &ServiceKey) -> Vec<String> {
        self.converted
            .get(service)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn merge_layers(index: &RouterIndex, svc: &ServiceKey) -> (Vec<LegacyRoute>, Vec<Revision>) {
        let mut seen = HashSet::new();
        let mut routes = Vec::new();
        let mut revisions = Vec::new();
        for layer in index.layers(svc) {
            revisions.push(layer.revision.clone());
            for route in &layer.view.routes {
                if seen.insert(route.rule_id.clone()) {
                    routes.push(route.clone());
                }
            }
        }
        routes.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        (routes, revisions)
    }

    fn track_legacy(&self, rule: &RouterRule) {
        if let Some(LegacyOrigin { service }) = &rule.legacy {
            self.converted
                .entry(service.clone())
                .or_default()
                .insert(rule.id().to_string());
        }
    }

    fn untrack_legacy(&self, rule: &RouterRule) {
        if let Some(LegacyOrigin { service }) = &rule.legacy {
            let mut emptied = false;
            if let Some(mut ids) = self.converted.get_mut(service) {
                ids.remove(rule.id());
                emptied = ids.is_empty();
            }
            if emptied {
                self.converted.remove_if(service, |_, ids| ids.is_empty());
            }
        }
    }
}

impl RuleIndexer<RouterRule> for RouteRuleContainer {
    fn is_scope_change(&self, old: &RouterRule, new: &RouterRule) -> bool {
        self.inbound.is_scope_change(old, new)
            || self.outbound.is_scope_change(old, new)
            || old.legacy != new.legacy
    }

    fn bind(&self, rule: &Arc<RouterRule>) {
        self.inbound.bind(rule);
        self.outbound.bind(rule);
        if rule.enabled() {
            self.track_legacy(rule);
        } else {
            self.untrack_legacy(rule);
        }
    }

    fn unbind(&self, rule: &RouterRule) {
        self.inbound.unbind(rule);
        self.outbound.unbind(rule);
        self.untrack_legacy(rule);
    }

    fn reload_dirty(&self) -> usize {
        self.inbound.reload_dirty() + self.outbound.reload_dirty()
    }

    fn clear(&self) {
        self.inbound.clear();
        self.outbound.clear();
        self.converted.clear();
    }
}
