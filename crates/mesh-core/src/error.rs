//! Error types for cache operations.
//!
//! This module provides [`CacheError`], the single error type surfaced by
//! refreshes, record decoding, and paged searches.

use std::sync::Arc;

/// Shared error source.
///
/// Sources are reference counted so a failed refresh can be handed to every
/// caller that joined it.
pub type SharedSource = Arc<dyn std::error::Error + Send + Sync>;

/// Error type for cache operations.
///
/// Variants follow the failure classes of the refresh protocol:
/// - store-read failures abort a refresh and leave watermarks untouched
/// - decode failures affect a single record and never abort a batch
/// - panics during delta application are contained at the refresh boundary
///
/// # Example
///
/// ```rust
/// use mesh_core::CacheError;
///
/// let err = CacheError::decode("circuitbreaker", "rule-1", "body is not JSON");
/// assert!(err.to_string().contains("rule-1"));
/// assert!(!err.is_retryable());
/// ```
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// The backing store could not be read.
    #[error("store unavailable for {cache}: {message}")]
    StoreUnavailable {
        /// Name of the cache whose refresh failed.
        cache: String,
        /// Description of the failure.
        message: String,
        /// Optional underlying error.
        #[source]
        source: Option<SharedSource>,
    },

    /// A single record could not be decoded or converted.
    #[error("cannot decode {kind} record {id}: {reason}")]
    Decode {
        /// Resource kind of the record.
        kind: String,
        /// Record identifier.
        id: String,
        /// Reason for the failure.
        reason: String,
    },

    /// Delta application panicked and was contained.
    #[error("refresh of {cache} panicked: {message}")]
    RefreshPanicked {
        /// Name of the cache whose refresh panicked.
        cache: String,
        /// Panic payload rendered as text.
        message: String,
    },

    /// Search arguments were malformed.
    #[error("invalid query: {reason}")]
    InvalidQuery {
        /// Reason the query was rejected.
        reason: String,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unexpected internal error.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl CacheError {
    /// Create a store error from any error type.
    pub fn store<E>(cache: impl Into<String>, message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::StoreUnavailable {
            cache: cache.into(),
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Create a decode error for one record.
    pub fn decode(kind: impl Into<String>, id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            kind: kind.into(),
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid query error.
    pub fn invalid_query(reason: impl Into<String>) -> Self {
        Self::InvalidQuery {
            reason: reason.into(),
        }
    }

    /// Whether the next scheduled refresh may succeed where this one failed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. } | Self::RefreshPanicked { .. }
        )
    }
}
