//! Revision tokens and aggregate fingerprints.
//!
//! This module provides [`Revision`], the opaque version string assigned to
//! a record at write time, and [`compute_revision`], which derives a stable
//! token for an aggregate (a service's rule set, a rule group) from the
//! revisions of its members.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Separator written between member revisions before hashing.
const SEPARATOR: &[u8] = b"|";

/// Opaque version token.
///
/// An empty revision means "no effective rules" and is distinct from any
/// computed fingerprint.
///
/// # Example
///
/// ```rust
/// use mesh_core::Revision;
///
/// let v1 = Revision::new("v1");
/// let empty = Revision::empty();
///
/// assert!(!v1.is_empty());
/// assert!(empty.is_empty());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    /// Create a revision from a string.
    #[must_use]
    pub fn new(revision: impl Into<String>) -> Self {
        Self(revision.into())
    }

    /// Create an empty revision.
    #[must_use]
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Check if the revision is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get the revision as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Revision {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Revision {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for Revision {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Compute an order-independent fingerprint over a set of member revisions.
///
/// Inputs are sorted before hashing, so any permutation of the same set
/// yields the same token. An empty input yields [`Revision::empty`].
///
/// # Example
///
/// ```rust
/// use mesh_core::compute_revision;
///
/// assert!(compute_revision(Vec::<String>::new()).is_empty());
/// assert_eq!(compute_revision(["a", "b"]), compute_revision(["b", "a"]));
/// ```
#[must_use]
pub fn compute_revision<I, S>(revisions: I) -> Revision
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut sorted: Vec<S> = revisions.into_iter().collect();
    if sorted.is_empty() {
        return Revision::empty();
    }
    sorted.sort_by(|a, b| a.as_ref().cmp(b.as_ref()));

    let mut hasher = Sha256::new();
    for (i, revision) in sorted.iter().enumerate() {
        if i > 0 {
            hasher.update(SEPARATOR);
        }
        hasher.update(revision.as_ref().as_bytes());
    }
    Revision(hex::encode(hasher.finalize()))
}
