//! Canary lane groups.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::rule::{impl_rule_record, normalize_scopes, Rule, RuleMeta};
use crate::{CacheError, CacheResult, ServiceKey};

/// One lane inside a group: a traffic-matching condition and the label
/// value that marks instances serving the lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneRule {
    /// Lane name, unique within its group.
    pub name: String,
    /// Disabled lanes stay in the group but match nothing.
    pub enable: bool,
    /// Lower values are matched first.
    #[serde(default)]
    pub priority: u32,
    /// Instance label value that identifies lane members.
    pub label_value: String,
}

/// A group of lanes spanning a set of entry and destination services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneGroup {
    /// Shared metadata.
    pub meta: RuleMeta,
    /// Services where traffic enters the lane and gets colored.
    #[serde(default)]
    pub entries: Vec<ServiceKey>,
    /// Services whose instances serve lane traffic.
    #[serde(default)]
    pub destinations: Vec<ServiceKey>,
    /// Lanes defined by the group.
    #[serde(default)]
    pub lanes: Vec<LaneRule>,
}

impl LaneGroup {
    /// Create an empty group.
    pub fn new(meta: RuleMeta) -> Self {
        Self {
            meta,
            entries: Vec::new(),
            destinations: Vec::new(),
            lanes: Vec::new(),
        }
    }

    /// Enabled lanes ordered by priority, then name.
    pub fn active_lanes(&self) -> Vec<&LaneRule> {
        let mut lanes: Vec<&LaneRule> = self.lanes.iter().filter(|l| l.enable).collect();
        lanes.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        lanes
    }
}

impl_rule_record!(LaneGroup);

impl Rule for LaneGroup {
    const KIND: &'static str = "lane";

    fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    fn scopes(&self) -> Vec<ServiceKey> {
        normalize_scopes(self.entries.iter().chain(self.destinations.iter()).cloned())
    }

    fn validate(&self) -> CacheResult<()> {
        let mut seen = HashSet::new();
        for lane in &self.lanes {
            if lane.name.is_empty() {
                return Err(CacheError::decode(Self::KIND, &self.meta.id, "lane without a name"));
            }
            if !seen.insert(lane.name.as_str()) {
                return Err(CacheError::decode(
                    Self::KIND,
                    &self.meta.id,
                    format!("duplicate lane {}", lane.name),
                ));
            }
        }
        Ok(())
    }
}
