//! Bounded per-owner attribute tracking.
//!
//! Ephemeral values observed at runtime (e.g. remote ports of a process's
//! connections) are kept per owner in a deduplicating set with a hard cap.
//! Once an owner's set is full, new values are rejected and counted; existing
//! values are never displaced.

use std::{
    collections::{HashMap, HashSet},
    hash::Hash,
    num::NonZeroUsize,
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use log::debug;

use crate::telemetry;

struct OwnerSet<V> {
    values: HashSet<V>,
    rejected: u64,
    last_update: Instant,
}

impl<V: Eq + Hash> OwnerSet<V> {
    fn new() -> Self {
        Self {
            values: HashSet::new(),
            rejected: 0,
            last_update: Instant::now(),
        }
    }
}

pub struct BoundedAttributeTracker<O, V> {
    owners: RwLock<HashMap<O, Arc<Mutex<OwnerSet<V>>>>>,
    capacity: usize,
}

impl<O, V> BoundedAttributeTracker<O, V>
where
    O: Copy + Eq + Hash + std::fmt::Debug,
    V: Clone + Eq + Hash,
{
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            owners: RwLock::new(HashMap::new()),
            capacity: capacity.get(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records `value` for `owner`. Returns true only if the value was new and
    /// the owner's set had room for it.
    ///
    /// The map lock is held until the set is updated, so a concurrent
    /// `remove_owner` or `evict_idle` either sees the value or runs first.
    pub fn add(&self, owner: O, value: V) -> bool {
        {
            let owners = self.owners.read().unwrap_or_else(|e| e.into_inner());
            if let Some(set) = owners.get(&owner) {
                let mut set = set.lock().unwrap_or_else(|e| e.into_inner());
                return self.record(owner, &mut set, value);
            }
        }

        let mut owners = self.owners.write().unwrap_or_else(|e| e.into_inner());
        let set = owners
            .entry(owner)
            .or_insert_with(|| Arc::new(Mutex::new(OwnerSet::new())));
        let mut set = set.lock().unwrap_or_else(|e| e.into_inner());
        self.record(owner, &mut set, value)
    }

    fn record(&self, owner: O, set: &mut OwnerSet<V>, value: V) -> bool {
        set.last_update = Instant::now();

        if set.values.contains(&value) {
            return false;
        }
        if set.values.len() >= self.capacity {
            if set.rejected == 0 {
                debug!(
                    "Attribute set for {:?} reached its cap of {}; dropping new values",
                    owner, self.capacity
                );
            }
            set.rejected += 1;
            telemetry::record_tracker_rejection();
            return false;
        }

        set.values.insert(value);
        debug_assert!(set.values.len() <= self.capacity);
        true
    }

    /// Drops all state for an owner that has gone away.
    pub fn remove_owner(&self, owner: O) -> bool {
        self.owners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&owner)
            .is_some()
    }

    /// Removes owners with no observation in the last `max_idle`, for owners
    /// whose exit was never reported. Returns how many were removed.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        match Instant::now().checked_sub(max_idle) {
            Some(cutoff) => self.evict_updated_before(cutoff),
            None => 0,
        }
    }

    fn evict_updated_before(&self, cutoff: Instant) -> usize {
        let mut owners = self.owners.write().unwrap_or_else(|e| e.into_inner());
        let before = owners.len();
        owners.retain(|_, set| {
            let set = set.lock().unwrap_or_else(|e| e.into_inner());
            set.last_update >= cutoff
        });
        before - owners.len()
    }

    pub fn snapshot(&self, owner: O) -> Vec<V> {
        let owners = self.owners.read().unwrap_or_else(|e| e.into_inner());
        owners
            .get(&owner)
            .map(|set| {
                let set = set.lock().unwrap_or_else(|e| e.into_inner());
                set.values.iter().cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self, owner: O) -> usize {
        let owners = self.owners.read().unwrap_or_else(|e| e.into_inner());
        owners
            .get(&owner)
            .map(|set| set.lock().unwrap_or_else(|e| e.into_inner()).values.len())
            .unwrap_or(0)
    }

    /// How many values were turned away for `owner` because its set was full.
    pub fn rejected(&self, owner: O) -> u64 {
        let owners = self.owners.read().unwrap_or_else(|e| e.into_inner());
        owners
            .get(&owner)
            .map(|set| set.lock().unwrap_or_else(|e| e.into_inner()).rejected)
            .unwrap_or(0)
    }

    pub fn contains_owner(&self, owner: O) -> bool {
        self.owners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&owner)
    }

    pub fn owners(&self) -> usize {
        self.owners.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl<O, V> BoundedAttributeTracker<O, V>
where
    O: Copy + Eq + Hash + std::fmt::Debug,
    V: Clone + Eq + Hash + Ord,
{
    pub fn sorted_snapshot(&self, owner: O) -> Vec<V> {
        let mut values = self.snapshot(owner);
        values.sort();
        values
    }
}

/// Remote ports seen per process.
pub type PortTracker = BoundedAttributeTracker<u32, u16>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn tracker(capacity: usize) -> PortTracker {
        PortTracker::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn test_duplicates_are_noops() {
        let tracker = tracker(4);
        assert!(tracker.add(100, 443));
        assert!(!tracker.add(100, 443));
        assert_eq!(tracker.len(100), 1);
    }

    #[test]
    fn test_set_never_exceeds_capacity() {
        let tracker = tracker(3);
        for port in 1000..1010u16 {
            tracker.add(7, port);
            assert!(tracker.len(7) <= 3);
        }
        assert_eq!(tracker.len(7), 3);
        assert_eq!(tracker.rejected(7), 7);
    }

    #[test]
    fn test_full_set_rejects_new_and_keeps_old() {
        let tracker = tracker(2);
        assert!(tracker.add(1, 80));
        assert!(tracker.add(1, 443));
        assert!(!tracker.add(1, 8080));

        assert_eq!(tracker.sorted_snapshot(1), vec![80, 443]);
        // duplicates of admitted values are still no-ops, not rejections
        assert!(!tracker.add(1, 80));
        assert_eq!(tracker.rejected(1), 1);
    }

    #[test]
    fn test_owners_are_independent() {
        let tracker = tracker(1);
        assert!(tracker.add(1, 53));
        assert!(tracker.add(2, 53));
        assert!(!tracker.add(1, 54));
        assert_eq!(tracker.owners(), 2);
    }

    #[test]
    fn test_remove_owner_drops_state() {
        let tracker = tracker(2);
        tracker.add(5, 22);
        tracker.add(5, 23);
        tracker.add(5, 24);

        assert!(tracker.remove_owner(5));
        assert!(!tracker.contains_owner(5));
        assert!(tracker.snapshot(5).is_empty());
        assert_eq!(tracker.rejected(5), 0);
        assert!(!tracker.remove_owner(5));

        // a new process reusing the pid starts empty
        assert!(tracker.add(5, 24));
    }

    #[test]
    fn test_evict_idle_owners() {
        let tracker = tracker(2);
        tracker.add(1, 80);
        std::thread::sleep(Duration::from_millis(30));
        tracker.add(2, 80);

        assert_eq!(tracker.evict_idle(Duration::from_millis(20)), 1);
        assert!(!tracker.contains_owner(1));
        assert!(tracker.contains_owner(2));
    }

    #[test]
    fn test_add_racing_eviction_is_never_lost() {
        let tracker = Arc::new(tracker(4));
        for _ in 0..500 {
            tracker.remove_owner(9);
            tracker.add(9, 1);
            std::thread::sleep(Duration::from_micros(100));
            let cutoff = Instant::now();

            let barrier = Arc::new(Barrier::new(2));
            let adder = {
                let tracker = Arc::clone(&tracker);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    tracker.add(9, 2)
                })
            };
            barrier.wait();
            tracker.evict_updated_before(cutoff);

            // either the eviction ran first and the add made a fresh set, or
            // the add refreshed the owner and the eviction spared it
            assert!(adder.join().unwrap());
            assert!(tracker.snapshot(9).contains(&2));
        }
    }

    #[test]
    fn test_concurrent_adds_stay_bounded() {
        let tracker = Arc::new(tracker(16));
        let handles: Vec<_> = (0..8u16)
            .map(|t| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for i in 0..200u16 {
                        tracker.add(42, t * 1000 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(tracker.len(42), 16);
        assert_eq!(tracker.rejected(42), 8 * 200 - 16);
    }
}
