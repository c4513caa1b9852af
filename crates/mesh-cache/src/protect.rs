//! Zero protection.
//!
//! When a service's healthy ratio drops to or below the threshold, the
//! unhealthy instances whose heartbeat lags the freshest unhealthy peer by
//! more than three TTLs keep being served as healthy. The authoritative
//! health flag is never touched; protected instances are exposed through
//! a separate view.

use std::sync::Arc;

use mesh_core::model::{Instance, METADATA_ZERO_PROTECTED};

/// Heartbeat periods an instance may lag the freshest peer by before it
/// qualifies for protection.
pub const STALE_TTL_FACTOR: i64 = 3;

/// Ids of the instances to protect, sorted.
///
/// Returns nothing while `healthy / total > threshold`.
pub fn select_protected<'a, I>(instances: I, threshold: f64) -> Vec<String>
where
    I: IntoIterator<Item = &'a Arc<Instance>>,
{
    let instances: Vec<&Arc<Instance>> = instances.into_iter().collect();
    let total = instances.len();
    if total == 0 {
        return Vec::new();
    }
    let healthy = instances.iter().filter(|i| i.healthy).count();
    if healthy as f64 / total as f64 > threshold {
        return Vec::new();
    }

    let unhealthy: Vec<(&Arc<Instance>, i64)> = instances
        .iter()
        .filter(|i| !i.healthy)
        .filter_map(|i| i.last_heartbeat().map(|hb| (*i, hb)))
        .collect();
    let Some(last_beat) = unhealthy.iter().map(|(_, hb)| *hb).max() else {
        return Vec::new();
    };

    let mut ids: Vec<String> = unhealthy
        .into_iter()
        .filter(|(i, hb)| last_beat - STALE_TTL_FACTOR * i64::from(i.ttl()) > *hb)
        .map(|(i, _)| i.id.clone())
        .collect();
    ids.sort();
    ids
}

/// The consumer-facing view of a protected instance.
pub fn protected_view(instance: &Instance) -> Instance {
    let mut view = instance.clone();
    view.healthy = true;
    view.metadata
        .insert(METADATA_ZERO_PROTECTED.to_string(), "true".to_string());
    view
}
