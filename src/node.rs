use std::fmt;
use std::sync::Weak;

/// Hash value reserved for an empty or reclaimable entry.
pub(crate) const TOMBSTONE: u64 = 0;

/// A cached association between a key hash and a weakly held value.
///
/// Once published into a slot, an entry is only ever read. Its fields are rewritten solely while
/// it is exclusively owned, either before publication or after the collector has handed it back
/// to the pool.
pub(crate) struct CacheEntry<V> {
    pub(crate) key_hash: u64,
    pub(crate) value: Weak<V>,
}

impl<V> CacheEntry<V> {
    pub(crate) fn new(key_hash: u64, value: Weak<V>) -> Self {
        Self { key_hash, value }
    }

    /// An entry that cannot match any key.
    pub(crate) fn is_vacant(&self) -> bool {
        self.key_hash == TOMBSTONE
    }

    /// Whether the referent has been dropped by all of its owners.
    ///
    /// This only reads the strong count; nothing is kept alive by asking.
    pub(crate) fn is_dead(&self) -> bool {
        self.value.strong_count() == 0
    }

    /// Whether a writer may claim the slot holding this entry.
    pub(crate) fn is_reclaimable(&self, key_hash: u64) -> bool {
        self.is_vacant() || self.key_hash == key_hash || self.is_dead()
    }

    pub(crate) fn clear(&mut self) {
        self.key_hash = TOMBSTONE;
        self.value = Weak::new();
    }
}

impl<V> fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key_hash", &self.key_hash)
            .field("alive", &!self.is_dead())
            .finish()
    }
}
