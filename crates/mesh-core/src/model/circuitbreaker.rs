//! Circuit-breaker rules.

use serde::{Deserialize, Serialize};

use super::rule::{impl_rule_record, normalize_scopes, validate_body, Rule, RuleMeta};
use crate::{CacheResult, ServiceKey};

/// Granularity at which a circuit breaker trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerLevel {
    /// Whole service.
    #[default]
    Service,
    /// Single method or path.
    Method,
    /// Single instance.
    Instance,
    /// Group of instances sharing a subset label.
    Group,
}

/// A circuit-breaker rule bound to a destination service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerRule {
    /// Shared metadata.
    pub meta: RuleMeta,
    /// Trip granularity.
    pub level: CircuitBreakerLevel,
    /// Calling service the rule applies to.
    pub source: ServiceKey,
    /// Called service the rule protects; this is where the rule is indexed.
    pub destination: ServiceKey,
    /// Policy body as stored, a JSON object.
    pub body: String,
}

impl CircuitBreakerRule {
    /// Create a service-level rule protecting `destination`.
    pub fn new(meta: RuleMeta, destination: ServiceKey) -> Self {
        Self {
            meta,
            level: CircuitBreakerLevel::Service,
            source: ServiceKey::all(),
            destination,
            body: "{}".to_string(),
        }
    }
}

impl_rule_record!(CircuitBreakerRule);

impl Rule for CircuitBreakerRule {
    const KIND: &'static str = "circuitbreaker";

    fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    fn scopes(&self) -> Vec<ServiceKey> {
        normalize_scopes([self.destination.clone()])
    }

    fn related_services(&self) -> Vec<ServiceKey> {
        normalize_scopes([self.source.clone(), self.destination.clone()])
    }

    fn validate(&self) -> CacheResult<()> {
        validate_body(Self::KIND, &self.meta.id, &self.body)
    }
}
