use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::Duration,
};

use lru::LruCache;
use proctyper_common::ExecutableIdentity;

use super::ClassificationResult;

/// Bounded LRU store of classification results keyed by executable identity.
///
/// The lock is only held for O(1) map operations, never across an inspection.
pub struct ClassificationCache {
    entries: Mutex<LruCache<ExecutableIdentity, Arc<ClassificationResult>>>,
    /// How long a failed classification stays valid. `None` keeps it until eviction.
    failure_ttl: Option<Duration>,
}

impl ClassificationCache {
    pub fn new(capacity: NonZeroUsize, failure_ttl: Option<Duration>) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            failure_ttl,
        }
    }

    /// Returns the cached result and marks it most recently used.
    ///
    /// An expired failure is dropped and reported as a miss so the binary is
    /// inspected again.
    pub fn lookup(&self, identity: &ExecutableIdentity) -> Option<Arc<ClassificationResult>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let hit = entries.get(identity).cloned()?;

        if let Some(ttl) = self.failure_ttl
            && hit.is_failure()
            && hit.is_expired(ttl)
        {
            entries.pop(identity);
            return None;
        }

        Some(hit)
    }

    /// Inserts or overwrites a result. Returns the identity evicted to make room.
    pub fn insert(
        &self,
        identity: ExecutableIdentity,
        result: Arc<ClassificationResult>,
    ) -> Option<ExecutableIdentity> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let evicted = entries
            .push(identity, result)
            .map(|(key, _)| key)
            .filter(|key| *key != identity);

        debug_assert!(entries.len() <= entries.cap().get());
        evicted
    }

    /// Checks for an entry without touching its recency.
    pub fn contains(&self, identity: &ExecutableIdentity) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cap()
            .get()
    }
}
