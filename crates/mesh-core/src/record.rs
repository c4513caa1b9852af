//! The record contract shared by every cached resource kind.

use chrono::{DateTime, Utc};

/// Point in time as reported by the backing store.
pub type Timestamp = DateTime<Utc>;

/// A resource row returned by an incremental store fetch.
///
/// `is_valid() == false` marks a logical delete: the row is still returned
/// so the cache can retract it, and its effects must be gone from every
/// derived index once the refresh that observed it completes.
pub trait Record: Send + Sync {
    /// Unique, stable identifier.
    fn id(&self) -> &str;

    /// Opaque version assigned at write time.
    fn revision(&self) -> &str;

    /// Last modification time.
    fn modify_time(&self) -> Timestamp;

    /// Soft-delete flag.
    fn is_valid(&self) -> bool;
}
