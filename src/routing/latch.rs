//! src/routing/latch.rs
//!
//! `Latch<T>`: a single-assignment async completion cell. Used for
//! `entity_keys`, where the first resolver of a peer's public key material
//! publishes it and every later reader — however many are already
//! waiting — observes the same value (§4.5, §9 "on-demand latch").

use tokio::sync::{Notify, OnceCell};

/// A one-shot value that may be awaited before it exists. `try_set` is the
/// only writer operation and is idempotent: once set, later calls are no-ops
/// (SPEC_FULL §8 property 5, "latch monotonicity").
pub struct Latch<T> {
    cell: OnceCell<T>,
    notify: Notify,
}

impl<T: Clone> Latch<T> {
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            notify: Notify::new(),
        }
    }

    /// Sets the value if unset. Returns `true` if this call was the one that
    /// set it, `false` if it was already set by someone else.
    pub fn try_set(&self, value: T) -> bool {
        let set = self.cell.set(value).is_ok();
        if set {
            self.notify.notify_waiters();
        }
        set
    }

    pub fn get(&self) -> Option<T> {
        self.cell.get().cloned()
    }

    /// Awaits the value, suspending if it is not yet set. No timeout is
    /// imposed here (§4.5): callers that need one wrap this in
    /// `tokio::time::timeout`.
    pub async fn wait(&self) -> T {
        loop {
            if let Some(value) = self.cell.get() {
                return value.clone();
            }
            let notified = self.notify.notified();
            if let Some(value) = self.cell.get() {
                return value.clone();
            }
            notified.await;
        }
    }
}

impl<T: Clone> Default for Latch<T> {
    fn default() -> Self {
        Self::new()
    }
}
