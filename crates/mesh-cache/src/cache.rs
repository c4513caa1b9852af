//! The `Cache` trait implemented by every refreshable cache.

/// Trait for refreshable caches.
///
/// Provides the administrative surface shared by all resource kinds.
pub trait Cache: Send + Sync {
    /// Resource-kind identifier, used for refresh de-duplication and
    /// watermark labels.
    fn name(&self) -> &'static str;

    /// Pull changes from the store.
    ///
    /// Concurrent callers share a single in-flight refresh.
    fn update(&self) -> mesh_core::CacheResult<()>;

    /// Drop all state and return to the pre-first-update condition.
    fn clear(&self) -> mesh_core::CacheResult<()>;
}
