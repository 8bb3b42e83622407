use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use proctyper_common::ExecutableIdentity;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Table of per-identity inspection locks.
///
/// Locks are created on demand and only weakly referenced by the table, so an
/// identity nobody is holding or waiting for costs nothing once swept.
#[derive(Default)]
pub struct InflightTable {
    locks: Mutex<HashMap<ExecutableIdentity, Weak<AsyncMutex<()>>>>,
}

/// Exclusive right to inspect one identity. Dropping it lets the next waiter in.
pub struct InflightGuard {
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<InflightTable>,
    identity: ExecutableIdentity,
}

impl InflightTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Waits until no other caller holds the lock for `identity`.
    pub async fn lock(self: &Arc<Self>, identity: ExecutableIdentity) -> InflightGuard {
        let slot = self.slot(identity);
        let guard = slot.lock_owned().await;
        InflightGuard {
            guard: Some(guard),
            table: Arc::clone(self),
            identity,
        }
    }

    fn slot(&self, identity: ExecutableIdentity) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = locks.get(&identity).and_then(Weak::upgrade) {
            return slot;
        }
        let slot = Arc::new(AsyncMutex::new(()));
        locks.insert(identity, Arc::downgrade(&slot));
        slot
    }

    fn sweep(&self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, slot| slot.strong_count() > 0);
    }

    /// Number of identities currently locked or waited on.
    pub fn len(&self) -> usize {
        self.sweep();
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl InflightGuard {
    pub fn identity(&self) -> ExecutableIdentity {
        self.identity
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        // release before sweeping so our own reference is gone
        self.guard.take();
        self.table.sweep();
    }
}
