//! Store collaborator interfaces.
//!
//! The backing store is external to the cache. These traits describe the
//! minimum it must offer: a clock, one incremental fetch per resource kind,
//! and a repeatable-read transaction for instances.

use mesh_core::model::{Instance, Rule};
use mesh_core::{CacheResult, Timestamp};

/// Access to the store's notion of "now".
pub trait StoreClock: Send + Sync {
    /// Current store time, used as the next fetch watermark.
    fn now(&self) -> CacheResult<Timestamp>;
}

impl std::fmt::Debug for dyn StoreClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StoreClock")
    }
}

/// Incremental fetch for one rule kind.
pub trait RuleStore<R: Rule>: StoreClock {
    /// Records with `modify_time >= since`.
    ///
    /// With `first_update` only currently valid records are returned, since
    /// there is nothing to retract yet.
    fn rules_for_cache(&self, since: Timestamp, first_update: bool) -> CacheResult<Vec<R>>;
}

/// Instance store with repeatable-read snapshots.
pub trait InstanceStore: StoreClock {
    /// Open a read-only transaction.
    fn start_read_tx(&self) -> CacheResult<Box<dyn ReadTx + '_>>;

    /// Authoritative count of valid instances.
    fn instance_count(&self) -> CacheResult<u64>;
}

/// A read-only transaction against the instance store.
pub trait ReadTx {
    /// Pin a consistent point-in-time view for the reads that follow.
    fn create_read_view(&mut self) -> CacheResult<()>;

    /// Instances with `modify_time >= since`, read from the pinned view.
    fn instances_for_cache(
        &mut self,
        since: Timestamp,
        first_update: bool,
    ) -> CacheResult<Vec<Instance>>;

    /// Finish the transaction.
    fn commit(self: Box<Self>) -> CacheResult<()>;

    /// Abandon the transaction.
    fn rollback(self: Box<Self>) -> CacheResult<()>;
}
