//! Refresh statistics.
//!
//! Counters are kept as atomics for cheap local inspection and mirrored to
//! the `metrics` facade, labelled by cache name. No exporter is installed
//! here; whoever embeds the caches decides where metrics go.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;

/// Statistics for one cache's refreshes.
///
/// All counters are atomic and can be safely accessed from multiple threads.
#[derive(Debug)]
pub struct RefreshStats {
    cache: &'static str,
    /// Completed refreshes, successful or not.
    refreshes: AtomicU64,
    /// Callers that joined an in-flight refresh instead of starting one.
    joined: AtomicU64,
    /// Refreshes that returned an error.
    failures: AtomicU64,
    /// Refreshes whose delta application panicked.
    panics: AtomicU64,
    /// Records applied to the cache.
    applied: AtomicU64,
    /// Records skipped because they failed to decode.
    skipped: AtomicU64,
    /// Refreshes that rebuilt state from scratch.
    full_reloads: AtomicU64,
}

impl RefreshStats {
    /// Create statistics for the named cache.
    pub fn new(cache: &'static str) -> Self {
        Self {
            cache,
            refreshes: AtomicU64::new(0),
            joined: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            panics: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            full_reloads: AtomicU64::new(0),
        }
    }

    /// Record a completed refresh.
    #[inline]
    pub fn record_refresh(&self, applied: u64, skipped: u64, full_reload: bool) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        self.applied.fetch_add(applied, Ordering::Relaxed);
        self.skipped.fetch_add(skipped, Ordering::Relaxed);
        counter!("mesh_cache_refresh_total", "cache" => self.cache).increment(1);
        counter!("mesh_cache_records_applied_total", "cache" => self.cache).increment(applied);
        if skipped > 0 {
            counter!("mesh_cache_records_skipped_total", "cache" => self.cache).increment(skipped);
        }
        if full_reload {
            self.full_reloads.fetch_add(1, Ordering::Relaxed);
            counter!("mesh_cache_full_reload_total", "cache" => self.cache).increment(1);
        }
    }

    /// Record a caller joining an in-flight refresh.
    #[inline]
    pub fn record_joined(&self) {
        self.joined.fetch_add(1, Ordering::Relaxed);
        counter!("mesh_cache_refresh_joined_total", "cache" => self.cache).increment(1);
    }

    /// Record a failed refresh.
    #[inline]
    pub fn record_failure(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
        counter!("mesh_cache_refresh_failures_total", "cache" => self.cache).increment(1);
    }

    /// Record a contained panic. Also counts as a failure.
    #[inline]
    pub fn record_panic(&self) {
        self.panics.fetch_add(1, Ordering::Relaxed);
        counter!("mesh_cache_refresh_panics_total", "cache" => self.cache).increment(1);
        self.record_failure();
    }

    /// Completed refreshes.
    #[inline]
    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Joined callers.
    #[inline]
    pub fn joined(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }

    /// Failed refreshes.
    #[inline]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Contained panics.
    #[inline]
    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    /// Records applied.
    #[inline]
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Records skipped.
    #[inline]
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Full reloads.
    #[inline]
    pub fn full_reloads(&self) -> u64 {
        self.full_reloads.load(Ordering::Relaxed)
    }

    /// Reset all statistics.
    pub fn reset(&self) {
        self.refreshes.store(0, Ordering::Relaxed);
        self.joined.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.panics.store(0, Ordering::Relaxed);
        self.applied.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
        self.full_reloads.store(0, Ordering::Relaxed);
    }
}
