//! Shared rule metadata and the [`Rule`] trait.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{CacheError, CacheResult, Record, ServiceKey, Timestamp};

/// Fields common to every governance rule kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMeta {
    /// Unique, stable identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Namespace the rule was created in.
    pub namespace: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// Disabled rules are indexed nowhere.
    pub enable: bool,
    /// Lower values are evaluated first.
    #[serde(default)]
    pub priority: u32,
    /// Version assigned at write time.
    pub revision: String,
    /// Last modification time.
    pub modify_time: Timestamp,
    /// Soft-delete flag.
    pub valid: bool,
}

impl RuleMeta {
    /// Create metadata for an enabled, valid rule.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            revision: format!("{id}-0"),
            id,
            name: name.into(),
            namespace: String::new(),
            description: String::new(),
            enable: true,
            priority: 0,
            modify_time: Utc::now(),
            valid: true,
        }
    }
}

/// A governance rule that can be bound to service scopes.
///
/// Implementors expose their scopes and a validation hook; the caches take
/// care of indexing, revisions, and retraction.
pub trait Rule: Record + Clone + fmt::Debug + 'static {
    /// Resource kind, used as cache name and watermark label.
    const KIND: &'static str;

    /// Shared metadata.
    fn meta(&self) -> &RuleMeta;

    /// Scopes the rule binds to on the callee side.
    ///
    /// An empty list binds the rule to the global wildcard.
    fn scopes(&self) -> Vec<ServiceKey>;

    /// Every service the rule mentions, used by service filters in searches.
    fn related_services(&self) -> Vec<ServiceKey> {
        self.scopes()
    }

    /// Decode-time validation. Failing records are skipped, not applied.
    fn validate(&self) -> CacheResult<()>;

    /// Rule name.
    fn name(&self) -> &str {
        &self.meta().name
    }

    /// Whether the rule is enabled.
    fn enabled(&self) -> bool {
        self.meta().enable
    }

    /// Evaluation priority, lower first.
    fn priority(&self) -> u32 {
        self.meta().priority
    }
}

/// Deduplicate scopes, binding scope-less rules to the global wildcard.
pub(crate) fn normalize_scopes(scopes: impl IntoIterator<Item = ServiceKey>) -> Vec<ServiceKey> {
    let mut out: Vec<ServiceKey> = scopes.into_iter().collect();
    out.sort();
    out.dedup();
    if out.is_empty() {
        out.push(ServiceKey::all());
    }
    out
}

/// Check that a rule body is a JSON object.
pub(crate) fn validate_body(kind: &str, id: &str, body: &str) -> CacheResult<()> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| CacheError::decode(kind, id, format!("malformed body: {e}")))?;
    if value.is_object() {
        Ok(())
    } else {
        Err(CacheError::decode(kind, id, "body must be a JSON object"))
    }
}

/// Implement [`Record`] for a rule type carrying a `meta: RuleMeta` field.
macro_rules! impl_rule_record {
    ($ty:ty) => {
        impl $crate::Record for $ty {
            fn id(&self) -> &str {
                &self.meta.id
            }

            fn revision(&self) -> &str {
                &self.meta.revision
            }

            fn modify_time(&self) -> $crate::Timestamp {
                self.meta.modify_time
            }

            fn is_valid(&self) -> bool {
                self.meta.valid
            }
        }
    };
}

pub(crate) use impl_rule_record;
