pub(crate) use crossbeam::epoch::{self, Atomic, CompareExchangeError, Guard, Owned, Shared};

use crate::node::CacheEntry;
use crossbeam::queue::ArrayQueue;
use std::fmt;
use std::sync::{Arc, Weak};

/// Recycles cache entries so that a write does not have to allocate.
///
/// Entries only come back here through [`RetireShared::retire_into`], i.e. once the epoch
/// collector has established that no pinned reader can still hold a reference to them. The pool
/// is bounded; entries recycled into a full pool are freed instead.
pub(crate) struct EntryPool<V> {
    entries: ArrayQueue<Owned<CacheEntry<V>>>,
}

impl<V> EntryPool<V> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Hands out an entry populated with the given fields.
    ///
    /// Allocates only if the pool is empty. The returned entry is exclusively owned by the caller
    /// until it is published.
    pub(crate) fn take(&self, key_hash: u64, value: Weak<V>) -> Owned<CacheEntry<V>> {
        match self.entries.pop() {
            Some(mut entry) => {
                debug_assert!(entry.is_vacant());
                entry.key_hash = key_hash;
                entry.value = value;
                entry
            }
            None => Owned::new(CacheEntry::new(key_hash, value)),
        }
    }

    pub(crate) fn recycle(&self, mut entry: Owned<CacheEntry<V>>) {
        entry.clear();
        // a full pool just lets the surplus entry go
        let _ = self.entries.push(entry);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<V> fmt::Debug for EntryPool<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryPool")
            .field("pooled", &self.len())
            .field("capacity", &self.entries.capacity())
            .finish()
    }
}

pub(crate) trait RetireShared {
    unsafe fn retire_into<V>(&self, pool: &Arc<EntryPool<V>>, shared: Shared<'_, CacheEntry<V>>);
}

impl RetireShared for Guard {
    /// Retire an entry that was just unlinked from a slot, returning it to `pool` once all
    /// outstanding references to it are gone.
    ///
    /// # Safety
    ///
    /// `shared` must be non-null and must no longer be reachable from any slot; that is, the
    /// caller must have won the compare-exchange (or swap) that removed it. The entry may not be
    /// accessed by the current thread after this guard is dropped.
    unsafe fn retire_into<V>(&self, pool: &Arc<EntryPool<V>>, shared: Shared<'_, CacheEntry<V>>) {
        debug_assert!(!shared.is_null());
        let pool = Arc::clone(pool);
        // safety: the deferred function runs only after every guard that was pinned when the
        // entry was unlinked has been dropped. at that point no reader can observe the entry, so
        // taking back ownership and rewriting its fields cannot race with anyone.
        unsafe { self.defer_unchecked(move || pool.recycle(shared.into_owned())) }
    }
}
