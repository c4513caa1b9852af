//! Single-flight join group.
//!
//! The first caller for a key executes; callers arriving while it runs
//! block until it finishes and receive a clone of its result. Nothing is
//! memoized past completion: the next call after that starts a new flight.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

enum CallState<T> {
    Pending,
    Done(T),
    /// The leader unwound before producing a result.
    Abandoned,
}

struct Call<T> {
    state: Mutex<CallState<T>>,
    cond: Condvar,
}

impl<T: Clone> Call<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(CallState::Pending),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                CallState::Pending => self.cond.wait(&mut state),
                CallState::Done(value) => return Some(value.clone()),
                CallState::Abandoned => return None,
            }
        }
    }

    fn finish(&self, state: CallState<T>) {
        *self.state.lock() = state;
        self.cond.notify_all();
    }
}

/// Removes the flight and wakes joiners even if the leader unwinds.
struct LeaderGuard<'a, T: Clone> {
    group: &'a SingleFlight<T>,
    key: &'a str,
    call: Arc<Call<T>>,
    result: Option<T>,
}

impl<T: Clone> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        self.group.calls.lock().remove(self.key);
        match self.result.take() {
            Some(value) => self.call.finish(CallState::Done(value)),
            None => self.call.finish(CallState::Abandoned),
        }
    }
}

/// Join group keyed by name.
pub struct SingleFlight<T> {
    calls: Mutex<HashMap<String, Arc<Call<T>>>>,
}

impl<T> std::fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.calls.lock().len())
            .finish()
    }
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> SingleFlight<T> {
    /// Create an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` unless a call for `key` is already in flight, in which case
    /// wait for it and share its result.
    ///
    /// Returns the result and whether this caller joined another's flight.
    pub fn run<F>(&self, key: &str, f: F) -> (T, bool)
    where
        F: FnOnce() -> T,
    {
        loop {
            let (call, leader) = {
                let mut calls = self.calls.lock();
                match calls.get(key) {
                    Some(call) => (Arc::clone(call), false),
                    None => {
                        let call = Arc::new(Call::new());
                        calls.insert(key.to_string(), Arc::clone(&call));
                        (call, true)
                    }
                }
            };

            if leader {
                let mut guard = LeaderGuard {
                    group: self,
                    key,
                    call,
                    result: None,
                };
                let value = f();
                guard.result = Some(value.clone());
                return (value, false);
            }

            trace!(key, "joining in-flight call");
            if let Some(value) = call.wait() {
                return (value, true);
            }
            // Leader unwound; race to become the next leader.
        }
    }

    /// Whether a call for `key` is currently executing.
    pub fn in_flight(&self, key: &str) -> bool {
        self.calls.lock().contains_key(key)
    }
}
