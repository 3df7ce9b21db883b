use crate::node::CacheEntry;
use crate::reclaim::{self, Atomic, Guard, Owned, Shared};
use std::fmt;
use std::sync::atomic::Ordering;

/// Second stride for the probe sequence: `hash` with its high and low halves swapped.
#[inline]
fn mix(hash: u64) -> u64 {
    hash.rotate_left(32)
}

/// The `i`-th candidate slot for `hash` in a table of `size` slots.
///
/// This is a cheap approximation of double hashing: keys whose primary hashes collide modulo
/// `size` still tend to diverge on the second probe, without computing a second hash function.
#[inline]
pub(crate) fn probe(hash: u64, i: usize, size: usize) -> usize {
    debug_assert!(size > 0);
    let index = hash.wrapping_add((i as u64).wrapping_mul(mix(hash)));
    (index % size as u64) as usize
}

/// Number of probe positions examined by lookups (and by the same-key tier of writes).
pub(crate) fn probe_depth(size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    std::cmp::max(1, size.ilog2() as usize)
}

/// Fixed-size array of atomically swapped entry pointers.
pub(crate) struct Table<V> {
    slots: Box<[Atomic<CacheEntry<V>>]>,
}

impl<V> Table<V> {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|_| Atomic::null()).collect(),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Heap address of the slot array, stable for the lifetime of the table.
    pub(crate) fn addr(&self) -> usize {
        self.slots.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn slot<'g>(&self, i: usize, guard: &'g Guard) -> Shared<'g, CacheEntry<V>> {
        self.slots[i].load(Ordering::Acquire, guard)
    }

    #[inline]
    #[allow(clippy::type_complexity)]
    pub(crate) fn cas_slot<'g>(
        &self,
        i: usize,
        current: Shared<'_, CacheEntry<V>>,
        new: Owned<CacheEntry<V>>,
        guard: &'g Guard,
    ) -> Result<
        Shared<'g, CacheEntry<V>>,
        reclaim::CompareExchangeError<'g, CacheEntry<V>, Owned<CacheEntry<V>>>,
    > {
        self.slots[i].compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire, guard)
    }

    /// Unlink `current` from slot `i`, leaving it empty.
    ///
    /// Returns `true` only for the caller that actually removed `current`.
    #[inline]
    pub(crate) fn clear_slot(
        &self,
        i: usize,
        current: Shared<'_, CacheEntry<V>>,
        guard: &Guard,
    ) -> bool {
        self.slots[i]
            .compare_exchange(
                current,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .is_ok()
    }

    /// Unconditionally publish `new` into slot `i`, returning whatever was there.
    #[inline]
    pub(crate) fn swap_slot<'g>(
        &self,
        i: usize,
        new: Owned<CacheEntry<V>>,
        guard: &'g Guard,
    ) -> Shared<'g, CacheEntry<V>> {
        self.slots[i].swap(new, Ordering::AcqRel, guard)
    }
}

impl<V> Drop for Table<V> {
    fn drop(&mut self) {
        // safety: we have &mut self, so no other thread can be reading the slots, and every
        // entry still linked into a slot is owned by the table alone. entries that were unlinked
        // earlier belong to the collector and are not reachable from here.
        let guard = unsafe { reclaim::epoch::unprotected() };

        for slot in self.slots.iter() {
            let entry = slot.swap(Shared::null(), Ordering::Relaxed, guard);
            if entry.is_null() {
                continue;
            }
            // safety: same as above
            drop(unsafe { entry.into_owned() });
        }
    }
}

impl<V> fmt::Debug for Table<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table").field("size", &self.len()).finish()
    }
}
