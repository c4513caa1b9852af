//! # mesh-core
//!
//! Core types, traits, and error handling for the mesh governance cache.
//!
//! This crate provides the foundational types used by the caching engine:
//!
//! - [`CacheError`] - Error taxonomy for refreshes, records, and queries
//! - [`Revision`] - Opaque version token, plus [`compute_revision`] for aggregates
//! - [`ServiceKey`] - `(namespace, name)` pair with wildcard scopes
//! - [`Record`] - Trait implemented by everything the store hands back
//! - [`model`] - Governance rules and service instances
//!
//! ## Example
//!
//! ```rust
//! use mesh_core::{compute_revision, ServiceKey};
//!
//! let svc = ServiceKey::new("default", "payments");
//! assert_eq!(svc.domain(), "payments.default");
//!
//! let a = compute_revision(["r2", "r1"]);
//! let b = compute_revision(["r1", "r2"]);
//! assert_eq!(a, b);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
pub mod model;
mod record;
mod revision;
mod service_key;

pub use error::CacheError;
pub use record::{Record, Timestamp};
pub use revision::{compute_revision, Revision};
pub use service_key::{ScopeTier, ServiceKey, ALL_MATCHED};

/// Result type alias using [`CacheError`].
pub type CacheResult<T> = std::result::Result<T, CacheError>;
