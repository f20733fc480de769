use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

/// One async mutex per key, created on first use and dropped once the last
/// holder or waiter lets go.
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<Ulid, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: Ulid) -> KeyedGuard<'_> {
        // Built before waiting, so a waiter dropped mid-wait still cleans up
        // its entry. Declared first, dropped after the pending acquire.
        let mut held = KeyedGuard {
            owner: self,
            key,
            guard: None,
        };
        // Clone under the shard lock so `KeyedGuard::drop` sees our reference.
        let mutex = self.locks.entry(key).or_default().value().clone();
        held.guard = Some(mutex.lock_owned().await);
        held
    }

    /// Keys with a live holder or waiter.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

pub struct KeyedGuard<'a> {
    owner: &'a KeyedLocks,
    key: Ulid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        // Release first: the owned guard holds one strong reference itself.
        self.guard.take();
        self.owner
            .locks
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}
