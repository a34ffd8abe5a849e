use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

type Slot = Arc<tokio::sync::Mutex<()>>;

/// One async mutex per instance id.
///
/// A slot lives only while some caller holds or waits on it; the last
/// [`KeyGuard`] to go removes it from the table.
#[derive(Debug, Default)]
pub(crate) struct KeyedLocks {
    slots: Mutex<HashMap<String, Slot>>,
}

/// Holds one key's lock. Drop it to release the key before awaiting the
/// provisioner.
#[derive(Debug)]
pub(crate) struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub(crate) async fn acquire(&self, key: &str) -> KeyGuard<'_> {
        // Built before waiting so a cancelled wait still releases the slot.
        let mut held = KeyGuard {
            locks: self,
            key: key.to_string(),
            guard: None,
        };
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(key.to_string()).or_default())
        };
        held.guard = Some(slot.lock_owned().await);
        held
    }

    /// Remove `key`'s slot unless another caller still has a handle on it.
    /// Handles are only cloned under the table lock, so the count is stable.
    fn release(&self, key: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(key);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(&self.key);
    }
}
