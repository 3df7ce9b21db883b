use crate::metrics::{Counters, Metrics, Write};
use crate::node::CacheEntry;
use crate::raw::{self, probe, Table};
use crate::reclaim::{epoch, EntryPool, Guard, Owned, RetireShared, Shared};
use crate::rng::Prng;
use std::borrow::Borrow;
use std::fmt::{self, Debug, Formatter};
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, trace};

/// Number of compare-exchange attempts at random slots before a write gives up on
/// compare-exchange altogether and overwrites a slot unconditionally.
const RANDOM_ENTRY_RETRIES: usize = 3;

/// A fixed-capacity, lock-free cache of weak references.
///
/// The cache never owns the values it hands out. [`put`](LockFreeCache::put) records only a
/// [`Weak`](std::sync::Weak) to the value, so an entry disappears on its own once every
/// [`Arc`] to the value has been dropped. There is no eviction policy, no expiry, and no explicit
/// invalidation: a dead entry is noticed lazily, the next time an operation touches its slot.
///
/// All operations take `&self` and never block. Slots are only ever changed through atomic
/// compare-exchange, except for the last-resort overwrite described on
/// [`put`](LockFreeCache::put).
///
/// # Lookup window
///
/// A cache of `size` slots looks up a key at `max(1, floor(log2(size)))` probe positions, no
/// more. A write that finds none of those positions usable may place its entry elsewhere in the
/// table, where it counts towards [`len`](LockFreeCache::len) but is invisible to
/// [`get`](LockFreeCache::get). Lookups are bounded in cost, not guaranteed to recall every live
/// entry.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use weak_cache::LockFreeCache;
///
/// let cache = LockFreeCache::<String, Vec<u8>>::new(1024);
///
/// let blob = Arc::new(vec![1, 2, 3]);
/// cache.put("blob", &blob);
/// assert_eq!(cache.get("blob"), Some(vec![1, 2, 3]));
///
/// // once the last owner lets go, the entry is gone as well
/// drop(blob);
/// assert_eq!(cache.get("blob"), None);
/// ```
pub struct LockFreeCache<K, V, S = crate::DefaultHashBuilder> {
    /// The slots. Empty if and only if the cache is disabled.
    table: Table<V>,

    /// Entries waiting to be reused by the next write. Shared with the epoch collector, which
    /// returns unlinked entries here once no reader can see them any more.
    pool: Arc<EntryPool<V>>,

    /// How many probe positions a lookup visits.
    probe_depth: usize,

    /// Source of slot indices for random eviction.
    rng: Prng,

    counters: Counters,

    build_hasher: S,

    _key: PhantomData<fn(K)>,
}

impl<K, V> LockFreeCache<K, V, crate::DefaultHashBuilder> {
    /// Creates a cache with room for `size` entries.
    ///
    /// A `size` of 0 creates a disabled cache: writes are ignored and every lookup misses.
    ///
    /// # Examples
    ///
    /// ```
    /// use weak_cache::LockFreeCache;
    /// let cache: LockFreeCache<u64, String> = LockFreeCache::new(16);
    /// assert_eq!(cache.capacity(), 16);
    /// ```
    pub fn new(size: usize) -> Self {
        Self::with_hasher(size, crate::DefaultHashBuilder::default())
    }
}

impl<K, V, S> LockFreeCache<K, V, S> {
    /// Creates a cache with room for `size` entries which will use `hash_builder` to hash keys.
    ///
    /// Warning: `hash_builder` is normally randomly generated, and is designed to make collisions
    /// between distinct keys hard to provoke. Two keys with equal hashes are the same entry as
    /// far as the cache is concerned, so setting this manually can let one key shadow another.
    ///
    /// # Examples
    ///
    /// ```
    /// use weak_cache::{DefaultHashBuilder, LockFreeCache};
    ///
    /// let cache: LockFreeCache<u64, u64> = LockFreeCache::with_hasher(8, DefaultHashBuilder::default());
    /// assert_eq!(cache.capacity(), 8);
    /// ```
    pub fn with_hasher(size: usize, hash_builder: S) -> Self {
        let table = Table::new(size);
        let probe_depth = raw::probe_depth(size);

        if size == 0 {
            debug!("lock-free cache created with zero size; it is disabled");
        } else {
            debug!(size, probe_depth, "created lock-free cache");
        }

        Self {
            // the slot array's address stands in for the cache's identity; it is heap-allocated,
            // so it does not change when the cache value is moved.
            rng: Prng::from_time(table.addr()),
            pool: Arc::new(EntryPool::new(size)),
            table,
            probe_depth,
            counters: Counters::default(),
            build_hasher: hash_builder,
            _key: PhantomData,
        }
    }

    #[inline]
    fn is_disabled(&self) -> bool {
        self.table.is_empty()
    }

    /// Returns the fixed number of slots in the cache.
    ///
    /// This is 0 for a disabled cache.
    pub fn capacity(&self) -> usize {
        self.table.len()
    }

    /// Returns the number of slots holding a live value.
    ///
    /// This walks the whole table. Under concurrent modification the result is approximate: slots
    /// are inspected one after another, not as a single snapshot.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use weak_cache::LockFreeCache;
    ///
    /// let cache = LockFreeCache::<u32, u32>::new(32);
    /// let one = Arc::new(1);
    /// cache.put(&1, &one);
    /// cache.put(&2, &Arc::new(2));
    /// // the second value was dropped right after the call
    /// assert_eq!(cache.len(), 1);
    /// ```
    pub fn len(&self) -> usize {
        let guard = &epoch::pin();
        (0..self.table.len())
            .filter(|&i| {
                let entry = self.table.slot(i, guard);
                // safety: the entry was loaded while the epoch is pinned, and unlinked entries
                // are only recycled once every guard that could have seen them is dropped.
                match unsafe { entry.as_ref() } {
                    Some(entry) => !entry.is_vacant() && !entry.is_dead(),
                    None => false,
                }
            })
            .count()
    }

    /// Returns `true` if no slot holds a live value.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a snapshot of the cache's counters.
    pub fn metrics(&self) -> Metrics {
        self.counters.snapshot()
    }
}

impl<K, V, S> LockFreeCache<K, V, S>
where
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    fn hash<Q: ?Sized + Hash>(&self, key: &Q) -> u64 {
        crate::hash_key(&self.build_hasher, key)
    }

    /// Caches a weak reference to `value` under `key`.
    ///
    /// The cache does not keep `value` alive. Placement tries, in order:
    ///
    ///  1. replacing an entry for the same key within the key's lookup window;
    ///  2. claiming a slot that is empty or whose value has died, looking first within the lookup
    ///     window and then across the whole table;
    ///  3. evicting a random live entry, a few times through compare-exchange, and finally through
    ///     an unconditional store.
    ///
    /// The final store guarantees the call terminates, at the price of possibly discarding a
    /// concurrent write to the same slot. Exactly one counter in [`metrics`](Self::metrics)
    /// records which of these paths was taken. Writes to a disabled cache are ignored.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use weak_cache::LockFreeCache;
    ///
    /// let cache = LockFreeCache::<&str, u32>::new(16);
    /// let v1 = Arc::new(1);
    /// let v2 = Arc::new(2);
    /// cache.put("k", &v1);
    /// cache.put("k", &v2);
    /// assert_eq!(cache.get("k"), Some(2));
    /// ```
    pub fn put<Q>(&self, key: &Q, value: &Arc<V>)
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash,
    {
        if self.is_disabled() {
            return;
        }

        let hash = self.hash(key);
        let size = self.table.len();
        let guard = &epoch::pin();
        let mut entry = self.pool.take(hash, Arc::downgrade(value));

        // the first reclaimable slot within the lookup window, if any
        let mut window_slot = None;

        for i in 0..self.probe_depth {
            let index = probe(hash, i, size);
            let current = self.table.slot(index, guard);

            // safety: loaded while pinned; see `len`.
            match unsafe { current.as_ref() } {
                Some(existing) if existing.key_hash == hash => {
                    match self.table.cas_slot(index, current, entry, guard) {
                        Ok(_) => {
                            // safety: we just unlinked `current`
                            unsafe { self.retire(current, guard) };
                            self.counters
                                .write(if i == 0 { Write::First } else { Write::Probe });
                            return;
                        }
                        Err(changed) => {
                            // someone else got there first; the slot may still be claimable below
                            entry = changed.new;
                        }
                    }
                }
                Some(existing) if existing.is_reclaimable(hash) => {
                    window_slot.get_or_insert(index);
                }
                Some(_) => {}
                None => {
                    window_slot.get_or_insert(index);
                }
            }
        }

        let start = probe(hash, 0, size);
        let candidates = window_slot
            .into_iter()
            .chain((0..size).map(|i| (start + i) % size));

        for index in candidates {
            let current = self.table.slot(index, guard);

            // safety: loaded while pinned; see `len`.
            if let Some(existing) = unsafe { current.as_ref() } {
                if !existing.is_reclaimable(hash) {
                    continue;
                }
            }

            match self.table.cas_slot(index, current, entry, guard) {
                Ok(_) => {
                    // safety: we just unlinked `current`
                    unsafe { self.retire(current, guard) };
                    self.counters.write(Write::Empty);
                    return;
                }
                Err(changed) => entry = changed.new,
            }
        }

        // every slot holds a live value; evict one
        self.evict(entry, RANDOM_ENTRY_RETRIES, guard);
    }

    /// Publishes `entry` over a random slot, making `retries` compare-exchange attempts before
    /// overwriting a slot unconditionally.
    fn evict(&self, mut entry: Owned<CacheEntry<V>>, retries: usize, guard: &Guard) {
        let size = self.table.len();

        for _ in 0..retries {
            let index = self.rng.next_index(size);
            let current = self.table.slot(index, guard);

            match self.table.cas_slot(index, current, entry, guard) {
                Ok(_) => {
                    // safety: we just unlinked `current`
                    unsafe { self.retire(current, guard) };
                    self.counters.write(Write::RandomCas);
                    return;
                }
                Err(changed) => entry = changed.new,
            }
        }

        let index = self.rng.next_index(size);
        trace!(index, "random evictions contended; overwriting slot");
        let old = self.table.swap_slot(index, entry, guard);
        // safety: the swap unlinked `old`
        unsafe { self.retire(old, guard) };
        self.counters.write(Write::Random);
    }

    /// Returns a copy of the value cached under `key`, if it is still alive.
    ///
    /// See [`get_arc`](Self::get_arc) for how the lookup proceeds.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use weak_cache::LockFreeCache;
    ///
    /// let cache = LockFreeCache::<u8, String>::new(8);
    /// let name = Arc::new(String::from("ferris"));
    /// cache.put(&1, &name);
    /// assert_eq!(cache.get(&1).as_deref(), Some("ferris"));
    /// assert_eq!(cache.get(&2), None);
    /// ```
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash,
        V: Clone,
    {
        self.get_arc(key).map(|value| V::clone(&value))
    }

    /// Returns a strong reference to the value cached under `key`, if it is still alive.
    ///
    /// At most the key's lookup window is inspected. Dead entries met on the way are unlinked.
    /// If the entry for `key` itself turns out to be dead, the lookup stops there and misses
    /// rather than searching further.
    ///
    /// The returned [`Arc`] keeps the value alive like any other owner would.
    pub fn get_arc<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash,
    {
        if self.is_disabled() {
            return None;
        }

        let hash = self.hash(key);
        let size = self.table.len();
        let guard = &epoch::pin();

        for i in 0..self.probe_depth {
            let index = probe(hash, i, size);
            let current = self.table.slot(index, guard);

            // safety: loaded while pinned; see `len`.
            let entry = match unsafe { current.as_ref() } {
                Some(entry) if !entry.is_vacant() => entry,
                _ => continue,
            };

            if entry.is_dead() {
                self.invalidate(index, current, guard);
                continue;
            }

            if entry.key_hash == hash {
                if let Some(value) = self.upgrade_or_invalidate(index, current, entry, guard) {
                    self.counters.hit();
                    return Some(value);
                }
                break;
            }
        }

        self.counters.miss();
        None
    }

    /// Upgrades the value of `entry`, which is linked at slot `index` as `current`.
    ///
    /// Only reachable with a dead value if the last owner was dropped on another thread after the
    /// caller's liveness check. The slot is then unlinked.
    fn upgrade_or_invalidate(
        &self,
        index: usize,
        current: Shared<'_, CacheEntry<V>>,
        entry: &CacheEntry<V>,
        guard: &Guard,
    ) -> Option<Arc<V>> {
        let value = entry.value.upgrade();
        if value.is_none() {
            self.invalidate(index, current, guard);
        }
        value
    }

    /// Unlinks a dead `entry` from slot `index`, unless another thread changed the slot first.
    fn invalidate(&self, index: usize, entry: Shared<'_, CacheEntry<V>>, guard: &Guard) {
        if self.table.clear_slot(index, entry, guard) {
            // safety: we just unlinked `entry`
            unsafe { self.retire(entry, guard) };
        }
    }

    /// Hands an unlinked entry to the collector, which recycles it into the pool once no reader
    /// can still reach it. Null entries are ignored.
    ///
    /// # Safety
    ///
    /// The caller must have removed `entry` from its slot itself.
    unsafe fn retire(&self, entry: Shared<'_, CacheEntry<V>>, guard: &Guard) {
        if !entry.is_null() {
            unsafe { guard.retire_into(&self.pool, entry) };
        }
    }
}

impl<K, V, S> Debug for LockFreeCache<K, V, S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeCache")
            .field("capacity", &self.capacity())
            .field("probe_depth", &self.probe_depth)
            .field("pool", &self.pool)
            .field("metrics", &self.metrics())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::BuildHasherDefault;
    use std::hash::Hasher;

    /// Hashes a `u64` key to itself, which makes slot positions predictable.
    #[derive(Default)]
    struct IdentityHasher(u64);

    impl Hasher for IdentityHasher {
        fn finish(&self) -> u64 {
            self.0
        }
        fn write(&mut self, _: &[u8]) {
            unreachable!("only u64 keys are used with IdentityHasher");
        }
        fn write_u64(&mut self, n: u64) {
            self.0 = n;
        }
    }

    type Identity = BuildHasherDefault<IdentityHasher>;

    fn cache(size: usize) -> LockFreeCache<u64, u64, Identity> {
        LockFreeCache::with_hasher(size, Identity::default())
    }

    fn slot_hash(cache: &LockFreeCache<u64, u64, Identity>, index: usize) -> Option<u64> {
        let guard = &epoch::pin();
        unsafe { cache.table.slot(index, guard).as_ref() }.map(|e| e.key_hash)
    }

    #[test]
    fn probe_depth_follows_size() {
        assert_eq!(cache(0).probe_depth, 0);
        assert_eq!(cache(1).probe_depth, 1);
        assert_eq!(cache(4).probe_depth, 2);
        assert_eq!(cache(1024).probe_depth, 10);
    }

    /// A key whose probe sequence in a table of 16 slots is `lo % 16`, `(lo + hi) % 16`, ...
    fn key(hi: u64, lo: u64) -> u64 {
        hi << 32 | lo
    }

    #[test]
    fn first_write_lands_at_primary_slot() {
        let cache = cache(16);
        let k = key(1, 3);
        let v = Arc::new(1);
        cache.put(&k, &v);
        assert_eq!(slot_hash(&cache, 3), Some(k));
        assert_eq!(cache.metrics().empty_writes, 1);

        let w = Arc::new(2);
        cache.put(&k, &w);
        assert_eq!(cache.metrics().first_writes, 1);
        assert_eq!(cache.get(&k), Some(2));
    }

    #[test]
    fn same_key_further_along_probe_sequence() {
        // size 16 -> depth 4. both keys start at slot 3.
        let cache = cache(16);
        let (ka, kb) = (key(1, 3), key(1, 19));
        let a = Arc::new(1);
        let b = Arc::new(2);
        cache.put(&ka, &a);
        cache.put(&kb, &b);
        assert_eq!(slot_hash(&cache, 3), Some(ka));
        assert_eq!(slot_hash(&cache, probe(kb, 1, 16)), Some(kb));
        assert_eq!(cache.get(&kb), Some(2));

        let c = Arc::new(3);
        cache.put(&kb, &c);
        assert_eq!(cache.metrics().probe_writes, 1);
        assert_eq!(cache.get(&kb), Some(3));
        assert_eq!(cache.get(&ka), Some(1));
    }

    #[test]
    fn dead_slot_is_reclaimed() {
        let cache = cache(16);
        cache.put(&key(1, 3), &Arc::new(1));
        let v = Arc::new(2);
        cache.put(&key(1, 19), &v);
        // the dead entry at the shared primary slot is claimed in place
        assert_eq!(slot_hash(&cache, 3), Some(key(1, 19)));
        assert_eq!(cache.metrics().empty_writes, 2);
        assert_eq!(cache.get(&key(1, 19)), Some(2));
    }

    #[test]
    fn get_unlinks_dead_entries() {
        let cache = cache(16);
        let v = Arc::new(1);
        cache.put(&key(1, 5), &v);
        drop(v);
        assert!(slot_hash(&cache, 5).is_some());
        assert_eq!(cache.get(&key(1, 5)), None);
        assert!(slot_hash(&cache, 5).is_none());
        assert_eq!(cache.metrics().read_misses, 1);
    }

    #[test]
    fn entry_outside_lookup_window_is_unreachable() {
        // with a stride that is a multiple of 16, every probe of these keys is slot 3
        let cache = cache(16);
        let (ka, kb) = (key(16, 3), key(16, 19));
        let a = Arc::new(1);
        let b = Arc::new(2);
        cache.put(&ka, &a);
        cache.put(&kb, &b);
        assert_eq!(slot_hash(&cache, 4), Some(kb));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&kb), None);
        assert_eq!(cache.get(&ka), Some(1));
    }

    #[test]
    fn get_inspects_only_the_lookup_window() {
        let cache = cache(16);
        for i in 0..16 {
            cache.put(&key(1, i), &Arc::new(i));
        }
        let occupied = |cache: &LockFreeCache<u64, u64, Identity>| {
            (0..16).filter(|&i| slot_hash(cache, i).is_some()).count()
        };
        assert_eq!(occupied(&cache), 16);
        assert_eq!(cache.len(), 0);

        // every slot is dead; the lookup unlinks exactly the four it visits
        assert_eq!(cache.get(&key(1, 100)), None);
        assert_eq!(occupied(&cache), 12);
        for i in 4..8 {
            assert!(slot_hash(&cache, i).is_none());
        }
    }

    #[test]
    fn full_table_evicts_at_random() {
        let cache = cache(4);
        let values: Vec<_> = (0..4).map(Arc::new).collect();
        for (k, v) in values.iter().enumerate() {
            cache.put(&key(1, k as u64), v);
        }
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.metrics().empty_writes, 4);

        let extra = Arc::new(99);
        cache.put(&key(1, 100), &extra);
        let m = cache.metrics();
        assert_eq!(m.random_cas_writes + m.random_writes, 1);
        assert_eq!(m.total_writes(), 5);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn contended_eviction_overwrites() {
        let cache = cache(1);
        let a = Arc::new(1);
        cache.put(&key(1, 0), &a);

        let kb = key(1, 1);
        let b = Arc::new(2);
        let guard = &epoch::pin();
        // as if every compare-exchange attempt had lost its race
        cache.evict(cache.pool.take(kb, Arc::downgrade(&b)), 0, guard);

        let m = cache.metrics();
        assert_eq!(m.random_writes, 1);
        assert_eq!(m.random_cas_writes, 0);
        assert_eq!(slot_hash(&cache, 0), Some(kb));
        assert_eq!(cache.get(&kb), Some(2));
        assert_eq!(cache.get(&key(1, 0)), None);
    }

    #[test]
    fn value_dying_before_upgrade_unlinks_slot() {
        let cache = cache(16);
        let k = key(1, 2);
        let v = Arc::new(1);
        cache.put(&k, &v);

        let guard = &epoch::pin();
        let current = cache.table.slot(2, guard);
        let entry = unsafe { current.as_ref() }.unwrap();
        assert!(!entry.is_dead());

        // the last owner goes away between the liveness check and the upgrade
        drop(v);
        assert_eq!(cache.upgrade_or_invalidate(2, current, entry, guard), None);
        assert!(slot_hash(&cache, 2).is_none());
    }

    #[test]
    fn zero_hash_is_not_a_tombstone() {
        let cache = cache(8);
        let v = Arc::new(10);
        cache.put(&0, &v);
        assert_eq!(cache.get(&0), Some(10));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn disabled_cache() {
        let cache = cache(0);
        let v = Arc::new(1);
        cache.put(&1, &v);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.capacity(), 0);
        assert_eq!(cache.metrics(), Metrics::default());
    }

    #[test]
    fn replaced_entries_reach_the_pool() {
        let cache = cache(8);
        let v = Arc::new(1);
        for _ in 0..64 {
            cache.put(&1, &v);
        }
        // every replaced entry is retired; flushing the collector eventually recycles them
        for _ in 0..128 {
            epoch::pin().flush();
        }
        assert!(cache.pool.len() <= 8);
        assert_eq!(cache.get(&1), Some(1));
        assert_eq!(Arc::strong_count(&v), 1);
    }
}
