//! Incremental refresh coordination.
//!
//! A [`RefreshCoordinator`] owns the watermarks of one cache and runs its
//! delta application:
//!
//! 1. Concurrent refreshes for the same cache collapse into one flight.
//! 2. Store time is read before fetching and becomes the next watermark,
//!    so rows committed during the fetch are picked up next time.
//! 3. Per-label modify-time watermarks only ever advance.
//! 4. A failed or panicking delta application leaves every watermark
//!    untouched; the next refresh retries from the same point.
//! 5. Clearing waits for a running refresh. A watermark reset made while a
//!    refresh runs survives that refresh's commit.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mesh_core::{CacheError, CacheResult, Timestamp};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::flight::SingleFlight;
use crate::stats::RefreshStats;
use crate::store::StoreClock;

/// Inputs handed to a cache's delta application.
#[derive(Debug, Clone)]
pub struct RefreshContext {
    /// Fetch records modified at or after this point.
    pub since: Timestamp,
    /// True only before the first successful refresh.
    pub first_update: bool,
    /// True when state must be rebuilt from scratch rather than patched:
    /// on the first update and after watermarks were reset.
    pub full_reload: bool,
}

/// What a delta application reports back.
#[derive(Debug, Clone, Default)]
pub struct RefreshOutput {
    /// Max modify time observed per label.
    pub last_mtimes: HashMap<String, Timestamp>,
    /// Records applied.
    pub applied: usize,
    /// Records skipped because they failed to decode.
    pub skipped: usize,
}

impl RefreshOutput {
    /// Fold one record's modify time into the label's watermark.
    pub fn observe(&mut self, label: &str, mtime: Timestamp) {
        self.last_mtimes
            .entry(label.to_string())
            .and_modify(|m| {
                if mtime > *m {
                    *m = mtime;
                }
            })
            .or_insert(mtime);
    }
}

#[derive(Debug)]
struct Watermarks {
    last_fetch_time: Timestamp,
    last_mtimes: HashMap<String, Timestamp>,
    first_update: bool,
    /// Bumped by every reset; a refresh commits only if it is unchanged.
    generation: u64,
}

impl Watermarks {
    fn initial() -> Self {
        Self {
            last_fetch_time: Timestamp::UNIX_EPOCH,
            last_mtimes: HashMap::new(),
            first_update: true,
            generation: 0,
        }
    }
}

/// Watermark owner and refresh executor for one cache.
#[derive(Debug)]
pub struct RefreshCoordinator {
    name: &'static str,
    clock: Arc<dyn StoreClock>,
    fetch_time_diff: chrono::Duration,
    watermarks: Mutex<Watermarks>,
    /// Held by a running refresh and by `clear_with`.
    serial: Mutex<()>,
    flight: SingleFlight<CacheResult<()>>,
    stats: RefreshStats,
}

impl RefreshCoordinator {
    /// Create a coordinator for the named cache.
    pub fn new(name: &'static str, clock: Arc<dyn StoreClock>, fetch_time_diff: Duration) -> Self {
        Self {
            name,
            clock,
            fetch_time_diff: chrono::Duration::from_std(fetch_time_diff)
                .unwrap_or_else(|_| chrono::Duration::zero()),
            watermarks: Mutex::new(Watermarks::initial()),
            serial: Mutex::new(()),
            flight: SingleFlight::new(),
            stats: RefreshStats::new(name),
        }
    }

    /// Cache name, the de-duplication key.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Refresh statistics.
    #[inline]
    pub fn stats(&self) -> &RefreshStats {
        &self.stats
    }

    /// Whether no refresh has succeeded yet.
    pub fn is_first_update(&self) -> bool {
        self.watermarks.lock().first_update
    }

    /// Store time recorded by the last successful refresh.
    pub fn last_fetch_time(&self) -> Timestamp {
        self.watermarks.lock().last_fetch_time
    }

    /// Max modify time observed for `label`, or the epoch.
    pub fn last_mtime(&self, label: &str) -> Timestamp {
        self.watermarks
            .lock()
            .last_mtimes
            .get(label)
            .copied()
            .unwrap_or(Timestamp::UNIX_EPOCH)
    }

    /// Forget the modify-time watermark for `label`.
    pub fn reset_last_mtime(&self, label: &str) {
        let mut watermarks = self.watermarks.lock();
        watermarks.last_mtimes.remove(label);
        watermarks.generation += 1;
    }

    /// Rewind the fetch watermark, forcing the next refresh to reload
    /// everything.
    pub fn reset_last_fetch_time(&self) {
        let mut watermarks = self.watermarks.lock();
        watermarks.last_fetch_time = Timestamp::UNIX_EPOCH;
        watermarks.generation += 1;
    }

    /// Return to the pre-first-update condition.
    pub fn clear(&self) {
        self.clear_with(|| {});
    }

    /// Wait for any running refresh, then run `drop_state` and return to
    /// the pre-first-update condition. No refresh starts until both are
    /// done.
    pub fn clear_with<F: FnOnce()>(&self, drop_state: F) {
        let _serial = self.serial.lock();
        drop_state();
        let mut watermarks = self.watermarks.lock();
        let generation = watermarks.generation + 1;
        *watermarks = Watermarks::initial();
        watermarks.generation = generation;
    }

    /// Run one refresh, or join the one already in flight.
    ///
    /// `apply` fetches from the store and applies the delta. Its error is
    /// returned to every caller sharing this flight.
    pub fn update<F>(&self, apply: F) -> CacheResult<()>
    where
        F: FnOnce(&RefreshContext) -> CacheResult<RefreshOutput>,
    {
        self.update_with(|| {}, apply)
    }

    /// Like [`update`](Self::update), with `prepare` run by the flight
    /// leader before the refresh context is taken. Joined callers skip it.
    pub fn update_with<P, F>(&self, prepare: P, apply: F) -> CacheResult<()>
    where
        P: FnOnce(),
        F: FnOnce(&RefreshContext) -> CacheResult<RefreshOutput>,
    {
        let (result, joined) = self.flight.run(self.name, || self.refresh(prepare, apply));
        if joined {
            self.stats.record_joined();
        }
        result
    }

    fn context(&self) -> (RefreshContext, u64) {
        let watermarks = self.watermarks.lock();
        let rewound = watermarks.last_fetch_time == Timestamp::UNIX_EPOCH;
        let since = if rewound {
            Timestamp::UNIX_EPOCH
        } else {
            (watermarks.last_fetch_time - self.fetch_time_diff).max(Timestamp::UNIX_EPOCH)
        };
        let ctx = RefreshContext {
            since,
            first_update: watermarks.first_update,
            full_reload: watermarks.first_update || rewound,
        };
        (ctx, watermarks.generation)
    }

    fn refresh<P, F>(&self, prepare: P, apply: F) -> CacheResult<()>
    where
        P: FnOnce(),
        F: FnOnce(&RefreshContext) -> CacheResult<RefreshOutput>,
    {
        let _serial = self.serial.lock();
        prepare();
        let (ctx, generation) = self.context();
        if ctx.first_update {
            info!(cache = self.name, "begin first update");
        }

        let store_time = match self.clock.now() {
            Ok(now) => now,
            Err(err) => {
                let previous = self.last_fetch_time();
                warn!(
                    cache = self.name,
                    error = %err,
                    "cannot read store time, keeping previous watermark"
                );
                previous
            }
        };

        let start = Instant::now();
        let output = match panic::catch_unwind(AssertUnwindSafe(|| apply(&ctx))) {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                self.stats.record_failure();
                error!(cache = self.name, error = %err, "refresh failed");
                return Err(err);
            }
            Err(payload) => {
                self.stats.record_panic();
                let message = panic_message(payload.as_ref());
                error!(cache = self.name, panic = %message, "refresh panicked, watermark kept");
                return Err(CacheError::RefreshPanicked {
                    cache: self.name.to_string(),
                    message,
                });
            }
        };

        let mut watermarks = self.watermarks.lock();
        if watermarks.generation != generation {
            debug!(cache = self.name, "watermarks reset during refresh, keeping the reset");
        } else {
            for (label, mtime) in &output.last_mtimes {
                watermarks
                    .last_mtimes
                    .entry(label.clone())
                    .and_modify(|m| {
                        if *mtime > *m {
                            *m = *mtime;
                        }
                    })
                    .or_insert(*mtime);
            }
            watermarks.last_fetch_time = store_time;
            watermarks.first_update = false;
        }
        drop(watermarks);

        self.stats
            .record_refresh(output.applied as u64, output.skipped as u64, ctx.full_reload);
        let elapsed = start.elapsed();
        if ctx.full_reload || output.applied > 0 || output.skipped > 0 {
            debug!(
                cache = self.name,
                applied = output.applied,
                skipped = output.skipped,
                full_reload = ctx.full_reload,
                since = %ctx.since,
                elapsed_ms = elapsed.as_millis() as u64,
                "refresh applied"
            );
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
