//! Listener hooks fired by a [`Cache`](crate::cache::manager::Cache).
//!
//! Listeners are called synchronously in registration order. A listener
//! returning `true` stops propagation to the listeners registered after it.
//! Listeners observe; they never alter cache state.

use std::sync::{Arc, Mutex};

use crate::cache::object::CachedObject;

/// Told when space has been set aside in a volume.
pub trait ReservationListener: Send + Sync {
    fn reservation_made(&self, volume: &str, size: u64) -> bool;
}

/// Told when an object has been written and catalogued.
pub trait SaveListener: Send + Sync {
    fn object_saved(&self, obj: &CachedObject) -> bool;
}

/// Told when objects have been evicted or uncached from a volume.
pub trait DeletionListener: Send + Sync {
    fn objects_deleted(&self, volume: &str, names: &[String], freed: u64) -> bool;
}

/// Per-cache registry of listeners.
#[derive(Default)]
pub struct Observers {
    reservation: Mutex<Vec<Arc<dyn ReservationListener>>>,
    save: Mutex<Vec<Arc<dyn SaveListener>>>,
    deletion: Mutex<Vec<Arc<dyn DeletionListener>>>,
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers").finish_non_exhaustive()
    }
}

fn snapshot<T: ?Sized>(list: &Mutex<Vec<Arc<T>>>) -> Vec<Arc<T>> {
    list.lock()
        .map(|l| l.clone())
        .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
}

fn push<T: ?Sized>(list: &Mutex<Vec<Arc<T>>>, item: Arc<T>) {
    list.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(item);
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_reservation(&self, listener: Arc<dyn ReservationListener>) {
        push(&self.reservation, listener);
    }

    pub fn on_save(&self, listener: Arc<dyn SaveListener>) {
        push(&self.save, listener);
    }

    pub fn on_deletion(&self, listener: Arc<dyn DeletionListener>) {
        push(&self.deletion, listener);
    }

    /// Returns `true` if some listener stopped propagation.
    pub fn reservation_made(&self, volume: &str, size: u64) -> bool {
        snapshot(&self.reservation)
            .iter()
            .any(|l| l.reservation_made(volume, size))
    }

    pub fn object_saved(&self, obj: &CachedObject) -> bool {
        snapshot(&self.save).iter().any(|l| l.object_saved(obj))
    }

    pub fn objects_deleted(&self, volume: &str, names: &[String], freed: u64) -> bool {
        if names.is_empty() {
            return false;
        }
        snapshot(&self.deletion)
            .iter()
            .any(|l| l.objects_deleted(volume, names, freed))
    }
}
