//! Active fault-detection rules.

use serde::{Deserialize, Serialize};

use super::rule::{impl_rule_record, normalize_scopes, validate_body, Rule, RuleMeta};
use crate::{CacheError, CacheResult, ServiceKey};

/// A fault-detection (active probing) rule bound to a destination service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultDetectRule {
    /// Shared metadata.
    pub meta: RuleMeta,
    /// Probed service.
    pub destination: ServiceKey,
    /// Probed method, empty for the whole service.
    #[serde(default)]
    pub method: String,
    /// Probe protocol, e.g. `http` or `tcp`.
    pub protocol: String,
    /// Probe body as stored, a JSON object.
    pub body: String,
}

impl FaultDetectRule {
    /// Create an HTTP probing rule for `destination`.
    pub fn new(meta: RuleMeta, destination: ServiceKey) -> Self {
        Self {
            meta,
            destination,
            method: String::new(),
            protocol: "http".to_string(),
            body: "{}".to_string(),
        }
    }
}

impl_rule_record!(FaultDetectRule);

impl Rule for FaultDetectRule {
    const KIND: &'static str = "faultdetect";

    fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    fn scopes(&self) -> Vec<ServiceKey> {
        normalize_scopes([self.destination.clone()])
    }

    fn validate(&self) -> CacheResult<()> {
        if self.protocol.is_empty() {
            return Err(CacheError::decode(Self::KIND, &self.meta.id, "probe protocol is empty"));
        }
        validate_body(Self::KIND, &self.meta.id, &self.body)
    }
}
