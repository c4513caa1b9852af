//! Cache configuration.

use std::time::Duration;

use mesh_core::{CacheError, CacheResult};
use serde::Deserialize;

/// Configuration for the cache layer.
///
/// Deserializable from any serde format; missing fields take their
/// defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Interval between scheduled refreshes, in milliseconds.
    pub refresh_interval_ms: u64,
    /// Clock-skew margin subtracted from the fetch watermark, in seconds.
    pub fetch_time_diff_secs: u64,
    /// Per-subscriber buffer for instance events.
    pub event_buffer_size: usize,
    /// Instance cache settings.
    pub instance: InstanceCacheConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 1000,
            fetch_time_diff_secs: 5,
            event_buffer_size: 1024,
            instance: InstanceCacheConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Interval between scheduled refreshes.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// Clock-skew margin for fetch watermarks.
    pub fn fetch_time_diff(&self) -> Duration {
        Duration::from_secs(self.fetch_time_diff_secs)
    }

    /// Reject values the caches cannot run with.
    pub fn validate(&self) -> CacheResult<()> {
        if self.refresh_interval_ms == 0 {
            return Err(CacheError::Configuration(
                "refresh_interval_ms must be positive".to_string(),
            ));
        }
        if self.event_buffer_size == 0 {
            return Err(CacheError::Configuration(
                "event_buffer_size must be positive".to_string(),
            ));
        }
        self.instance.validate()
    }
}

/// Instance cache configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct InstanceCacheConfig {
    /// Enable zero protection.
    pub zero_protect: bool,
    /// Healthy ratio at or below which protection kicks in.
    pub protect_threshold: f64,
    /// Minimum spacing of store count reconciliations, in seconds.
    pub reconcile_interval_secs: u64,
}

impl Default for InstanceCacheConfig {
    fn default() -> Self {
        Self {
            zero_protect: false,
            protect_threshold: 0.8,
            reconcile_interval_secs: 60,
        }
    }
}

impl InstanceCacheConfig {
    /// Minimum spacing of store count reconciliations.
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    fn validate(&self) -> CacheResult<()> {
        if !(0.0..=1.0).contains(&self.protect_threshold) {
            return Err(CacheError::Configuration(format!(
                "protect_threshold {} is outside [0, 1]",
                self.protect_threshold
            )));
        }
        Ok(())
    }
}
