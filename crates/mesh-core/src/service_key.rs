//! Service identification and wildcard scopes.
//!
//! This module provides [`ServiceKey`], the `(namespace, name)` pair used to
//! bind governance rules to services. Either half may be the reserved
//! [`ALL_MATCHED`] value, which turns the key into a wildcard scope.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved value matching every namespace or every service name.
pub const ALL_MATCHED: &str = "*";

/// `(namespace, name)` pair identifying a service or a wildcard scope.
///
/// # Example
///
/// ```rust
/// use mesh_core::ServiceKey;
///
/// let exact = ServiceKey::new("prod", "orders");
/// let ns = ServiceKey::namespace_wildcard("prod");
/// let all = ServiceKey::all();
///
/// assert!(exact.is_exact());
/// assert!(ns.is_namespace_wildcard());
/// assert!(all.is_all_wildcard());
/// assert!(ns.matches(&exact));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    /// Namespace, or [`ALL_MATCHED`].
    pub namespace: String,
    /// Service name, or [`ALL_MATCHED`].
    pub name: String,
}

/// Where a key lands in a three-tier wildcard index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeTier {
    /// Keyed by [`ServiceKey::domain`].
    Exact(String),
    /// Keyed by namespace.
    Namespace(String),
    /// The global singleton.
    All,
}

impl ServiceKey {
    /// Create a key from a namespace and service name.
    ///
    /// Empty halves are normalized to [`ALL_MATCHED`], so a rule naming no
    /// service binds to the wildcard scope.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let mut namespace = namespace.into();
        let mut name = name.into();
        if namespace.is_empty() {
            namespace = ALL_MATCHED.to_string();
        }
        if name.is_empty() {
            name = ALL_MATCHED.to_string();
        }
        Self { namespace, name }
    }

    /// The `(*, *)` global wildcard.
    #[must_use]
    pub fn all() -> Self {
        Self::new(ALL_MATCHED, ALL_MATCHED)
    }

    /// The `(namespace, *)` wildcard.
    #[must_use]
    pub fn namespace_wildcard(namespace: impl Into<String>) -> Self {
        Self::new(namespace, ALL_MATCHED)
    }

    /// `name.namespace`, the exact-match index key.
    #[must_use]
    pub fn domain(&self) -> String {
        format!("{}.{}", self.name, self.namespace)
    }

    /// Check if both halves are wildcards.
    ///
    /// A wildcard namespace with a concrete name cannot be indexed by
    /// namespace, so it is treated as global as well.
    #[must_use]
    pub fn is_all_wildcard(&self) -> bool {
        self.namespace == ALL_MATCHED
    }

    /// Check if only the service name is a wildcard.
    #[must_use]
    pub fn is_namespace_wildcard(&self) -> bool {
        self.namespace != ALL_MATCHED && self.name == ALL_MATCHED
    }

    /// Check if this key names one concrete service.
    #[must_use]
    pub fn is_exact(&self) -> bool {
        self.namespace != ALL_MATCHED && self.name != ALL_MATCHED
    }

    /// Partition of a three-tier index this key belongs to.
    #[must_use]
    pub fn tier(&self) -> ScopeTier {
        if self.is_all_wildcard() {
            ScopeTier::All
        } else if self.is_namespace_wildcard() {
            ScopeTier::Namespace(self.namespace.clone())
        } else {
            ScopeTier::Exact(self.domain())
        }
    }

    /// Check whether this scope covers `other`.
    #[must_use]
    pub fn matches(&self, other: &ServiceKey) -> bool {
        let ns_ok = self.namespace == ALL_MATCHED || self.namespace == other.namespace;
        let name_ok = self.name == ALL_MATCHED || self.name == other.name;
        ns_ok && name_ok
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
