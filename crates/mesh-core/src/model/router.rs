//! Routing rules.
//!
//! Routing rules are the only kind with two binding directions: a rule is
//! indexed under its destinations for inbound lookups and under its sources
//! for outbound lookups. Rules converted from the per-service legacy format
//! remember the service they came from.

use serde::{Deserialize, Serialize};

use super::rule::{impl_rule_record, normalize_scopes, validate_body, Rule, RuleMeta};
use crate::{CacheResult, ServiceKey};

/// Routing policy family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Match on request attributes, route to instance subsets.
    #[default]
    RuleRouting,
    /// Route by caller metadata to instances with matching metadata.
    MetadataRouting,
}

/// Origin of a rule converted from the legacy per-service format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LegacyOrigin {
    /// Service the legacy routing document belonged to.
    pub service: ServiceKey,
}

/// A routing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterRule {
    /// Shared metadata.
    pub meta: RuleMeta,
    /// Policy family.
    pub policy: RoutingPolicy,
    /// Calling services, the outbound binding.
    #[serde(default)]
    pub sources: Vec<ServiceKey>,
    /// Called services, the inbound binding.
    #[serde(default)]
    pub destinations: Vec<ServiceKey>,
    /// Routing body as stored, a JSON object.
    pub body: String,
    /// Set when the rule was converted from the legacy format.
    #[serde(default)]
    pub legacy: Option<LegacyOrigin>,
}

impl RouterRule {
    /// Create a rule-routing rule between `sources` and `destinations`.
    pub fn new(meta: RuleMeta, sources: Vec<ServiceKey>, destinations: Vec<ServiceKey>) -> Self {
        Self {
            meta,
            policy: RoutingPolicy::RuleRouting,
            sources,
            destinations,
            body: "{}".to_string(),
            legacy: None,
        }
    }

    /// Outbound binding scopes.
    pub fn source_scopes(&self) -> Vec<ServiceKey> {
        normalize_scopes(self.sources.iter().cloned())
    }

    /// Inbound binding scopes.
    pub fn destination_scopes(&self) -> Vec<ServiceKey> {
        normalize_scopes(self.destinations.iter().cloned())
    }
}

impl_rule_record!(RouterRule);

impl Rule for RouterRule {
    const KIND: &'static str = "router";

    fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    fn scopes(&self) -> Vec<ServiceKey> {
        self.destination_scopes()
    }

    fn related_services(&self) -> Vec<ServiceKey> {
        normalize_scopes(self.sources.iter().chain(self.destinations.iter()).cloned())
    }

    fn validate(&self) -> CacheResult<()> {
        validate_body(Self::KIND, &self.meta.id, &self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directional_scopes() {
        let rule = RouterRule::new(
            RuleMeta::new("r1", "route"),
            vec![ServiceKey::new("ns1", "caller")],
            vec![],
        );
        assert_eq!(rule.source_scopes(), vec![ServiceKey::new("ns1", "caller")]);
        assert_eq!(rule.destination_scopes(), vec![ServiceKey::all()]);
        assert_eq!(rule.scopes(), rule.destination_scopes());
    }
}
