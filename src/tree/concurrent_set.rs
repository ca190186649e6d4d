/// The polymorphic surface shared by the three tree implementations.
///
/// Threads must be announced before concurrent use, in order: one call to
/// [`set_thread_count`](ConcurrentSet::set_thread_count), then one
/// [`register_thread`](ConcurrentSet::register_thread) per worker with a
/// unique id below the count. Operating concurrently from an unregistered
/// thread is a caller bug.
pub trait ConcurrentSet<K>: Send + Sync {
    fn new() -> Self
    where
        Self: Sized;

    /// Returns `true` if `key` was absent and is now present.
    fn insert(&self, key: K) -> bool;

    /// Removes `key` if present; a no-op otherwise.
    fn erase(&self, key: &K);

    /// Returns `true` iff `key` is currently present.
    fn find(&self, key: &K) -> bool;

    /// Cached element count. Updated after each committed insert or erase, so
    /// under concurrency it lags the structure; it is exact at quiescence.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Restores the empty state. Exclusive access is required, which the
    /// receiver type enforces.
    fn clear(&mut self);

    fn set_thread_count(&self, n: usize);

    fn register_thread(&self, tid: usize);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::ConcurrentSet;
    use crossbeam_utils::thread;
    use rand::prelude::*;
    use std::collections::BTreeSet;

    fn solo<S: ConcurrentSet<i32>>() -> S {
        let set = S::new();
        set.set_thread_count(1);
        set.register_thread(0);
        set
    }

    /// Any single-threaded operation sequence agrees with an ordered-set
    /// model applied in the same order.
    pub(crate) fn matches_model<S: ConcurrentSet<i32>>() {
        let set = solo::<S>();
        let mut model = BTreeSet::new();
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let key = rng.gen_range(0..1_000);
            match rng.gen_range(0..3) {
                0 => assert_eq!(set.insert(key), model.insert(key)),
                1 => {
                    set.erase(&key);
                    model.remove(&key);
                }
                _ => assert_eq!(set.find(&key), model.contains(&key)),
            }
        }
        assert_eq!(set.len(), model.len());
        for key in 0..1_000 {
            assert_eq!(set.find(&key), model.contains(&key));
        }
    }

    pub(crate) fn round_trip<S: ConcurrentSet<i32>>() {
        let set = solo::<S>();
        assert!(set.insert(42));
        assert!(set.find(&42));
        assert!(!set.insert(42));
        set.erase(&42);
        assert!(!set.find(&42));
        set.erase(&42);
        assert!(!set.find(&42));
        assert!(set.is_empty());
    }

    /// The extremes of the key type are ordinary members and the internal
    /// sentinels never leak into membership.
    pub(crate) fn extreme_keys<S: ConcurrentSet<i32>>() {
        let set = solo::<S>();
        for key in [0, -5, 17] {
            assert!(set.insert(key));
        }
        assert!(!set.find(&i32::MIN));
        assert!(!set.find(&i32::MAX));
        assert!(set.insert(i32::MAX));
        assert!(set.insert(i32::MIN));
        assert!(set.find(&i32::MAX));
        assert!(set.find(&i32::MIN));
        set.erase(&i32::MAX);
        assert!(!set.find(&i32::MAX));
        assert!(set.find(&i32::MIN));
        assert_eq!(set.len(), 4);
    }

    pub(crate) fn small_scenarios<S: ConcurrentSet<i32>>() {
        let mut set = solo::<S>();
        for key in 0..5 {
            assert!(set.insert(key));
        }
        for key in 0..5 {
            assert!(set.find(&key));
        }
        assert!(!set.find(&5));
        assert_eq!(set.len(), 5);
        set.erase(&2);
        assert!(!set.find(&2));
        assert_eq!(set.len(), 4);

        set.clear();
        assert!(set.is_empty());

        // An interior victim with two children.
        for key in [5, 3, 7, 1, 4, 6, 8] {
            assert!(set.insert(key));
        }
        set.erase(&3);
        assert!(!set.find(&3));
        for key in [1, 4, 5, 6, 7, 8] {
            assert!(set.find(&key));
        }
        assert_eq!(set.len(), 6);
    }

    /// Each thread owns a disjoint key range and runs a full
    /// insert/find/erase cycle over it; afterwards the set is empty.
    pub(crate) fn disjoint_ranges<S: ConcurrentSet<i32>>(threads: usize, per_thread: i32) {
        let set = S::new();
        set.set_thread_count(threads);
        thread::scope(|s| {
            for tid in 0..threads {
                let set = &set;
                s.spawn(move |_| {
                    set.register_thread(tid);
                    let base = tid as i32 * per_thread;
                    let mut keys: Vec<i32> = (base..base + per_thread).collect();
                    keys.shuffle(&mut rand::thread_rng());
                    for &key in &keys {
                        assert!(set.insert(key));
                    }
                    for &key in &keys {
                        assert!(set.find(&key));
                    }
                    for &key in &keys {
                        set.erase(&key);
                    }
                    for &key in &keys {
                        assert!(!set.find(&key));
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(set.len(), 0);
    }

    /// Parallel inserts of disjoint ranges; after join every key is present.
    pub(crate) fn disjoint_inserts<S: ConcurrentSet<i32>>(threads: usize, per_thread: i32) {
        let set = S::new();
        set.set_thread_count(threads);
        thread::scope(|s| {
            for tid in 0..threads {
                let set = &set;
                s.spawn(move |_| {
                    set.register_thread(tid);
                    let base = tid as i32 * per_thread;
                    for key in base..base + per_thread {
                        assert!(set.insert(key));
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(set.len(), threads * per_thread as usize);
        for key in 0..threads as i32 * per_thread {
            assert!(set.find(&key));
        }
    }

    /// All threads hammer the same key range; once quiescent, the cached
    /// length must agree exactly with observed membership.
    pub(crate) fn overlapping_ranges<S: ConcurrentSet<i32>>(threads: usize, range: i32) {
        let set = S::new();
        set.set_thread_count(threads);
        thread::scope(|s| {
            for tid in 0..threads {
                let set = &set;
                s.spawn(move |_| {
                    set.register_thread(tid);
                    let mut rng = rand::thread_rng();
                    for _ in 0..5_000 {
                        let key = rng.gen_range(0..range);
                        match rng.gen_range(0..3) {
                            0 => {
                                set.insert(key);
                            }
                            1 => set.erase(&key),
                            _ => {
                                set.find(&key);
                            }
                        }
                    }
                });
            }
        })
        .unwrap();
        let members = (0..range).filter(|key| set.find(key)).count();
        assert_eq!(set.len(), members);
    }

    /// One writer keeps inserting while readers probe; keys inserted before
    /// the readers started must always be found.
    pub(crate) fn read_while_write<S: ConcurrentSet<i32>>(readers: usize) {
        const PREFILL: i32 = 1_000;
        let set = S::new();
        set.set_thread_count(readers + 1);
        set.register_thread(0);
        for key in 0..PREFILL {
            assert!(set.insert(key));
        }
        thread::scope(|s| {
            let set = &set;
            s.spawn(move |_| {
                set.register_thread(0);
                for key in PREFILL..10_000 {
                    set.insert(key);
                }
            });
            for tid in 1..=readers {
                s.spawn(move |_| {
                    set.register_thread(tid);
                    let mut rng = rand::thread_rng();
                    for _ in 0..20_000 {
                        assert!(set.find(&rng.gen_range(0..PREFILL)));
                        set.find(&rng.gen_range(PREFILL..20_000));
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(set.len(), 10_000);
    }

    /// Forces many reclamation rounds: repeated insert/erase churn over a
    /// small range from every thread.
    pub(crate) fn reclamation_churn<S: ConcurrentSet<i32>>(threads: usize) {
        let set = S::new();
        set.set_thread_count(threads);
        thread::scope(|s| {
            for tid in 0..threads {
                let set = &set;
                s.spawn(move |_| {
                    set.register_thread(tid);
                    for round in 0..200 {
                        let base = (tid * 64) as i32;
                        for key in base..base + 64 {
                            set.insert(key + (round & 1));
                        }
                        for key in base..base + 64 {
                            set.erase(&(key + (round & 1)));
                        }
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(set.len(), 0);
    }
}
