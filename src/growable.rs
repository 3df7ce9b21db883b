use crate::node::TOMBSTONE;
use crate::tracked::Tracked;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::borrow::Borrow;
use std::fmt::{self, Debug, Formatter};
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use tracing::trace;

/// A growable cache of weak references behind a single reader-writer lock.
///
/// This is the simple sibling of [`LockFreeCache`](crate::LockFreeCache). Entries live in a flat
/// list that grows on demand up to an optional maximum size, after which a new key replaces a
/// random existing entry. Every mutation is serialized through the lock; lookups share it.
///
/// Values are stored as [`Tracked`] so that the cache can free an entry as soon as its value
/// is destroyed, rather than only noticing on the next lookup.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use weak_cache::{GrowableCache, Tracked};
///
/// let cache = GrowableCache::<&str, String>::new(0, 0);
/// let value = Arc::new(Tracked::new(String::from("hello")));
/// cache.put("greeting", &value);
/// assert_eq!(cache.get("greeting").as_deref(), Some("hello"));
///
/// drop(value);
/// assert_eq!(cache.len(), 0);
/// assert_eq!(cache.get("greeting"), None);
/// ```
pub struct GrowableCache<K, V, S = crate::DefaultHashBuilder> {
    /// State shared with the drop callbacks of cached values.
    inner: Arc<Inner<V>>,

    /// Maximum number of entries; 0 means unbounded.
    max_size: usize,

    build_hasher: S,

    _key: PhantomData<fn(K)>,
}

struct Inner<V> {
    slots: RwLock<Slots<V>>,

    /// Hashes of dead values whose callback could not take the lock. Drained by the next write.
    dead: Mutex<Vec<u64>>,
}

struct Slots<V> {
    key_hashes: Vec<u64>,
    values: Vec<Weak<Tracked<V>>>,
}

impl<V> Slots<V> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            key_hashes: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
        }
    }

    fn position(&self, key_hash: u64) -> Option<usize> {
        self.key_hashes.iter().position(|&h| h == key_hash)
    }

    /// Stores `value` under `key_hash`.
    ///
    /// Returns `false` if the slot already referred to this very value, in which case it does
    /// not need another drop callback.
    fn insert(&mut self, key_hash: u64, value: Weak<Tracked<V>>, max_size: usize) -> bool {
        if let Some(index) = self.position(key_hash) {
            let fresh = !self.values[index].ptr_eq(&value);
            self.values[index] = value;
            return fresh;
        }

        let index = match self.position(TOMBSTONE) {
            Some(index) => index,
            None if max_size != 0 && self.key_hashes.len() >= max_size => {
                rand::thread_rng().gen_range(0..self.key_hashes.len())
            }
            None => {
                self.key_hashes.push(key_hash);
                self.values.push(value);
                return true;
            }
        };

        self.key_hashes[index] = key_hash;
        self.values[index] = value;
        true
    }

    /// Frees the slot for `key_hash` if its value is dead.
    fn forget(&mut self, key_hash: u64) {
        if let Some(index) = self.position(key_hash) {
            self.forget_at(index, key_hash);
        }
    }

    /// Frees slot `index` if it still belongs to `key_hash` and its value is dead.
    ///
    /// The slot may have been reused for another key, or refreshed with a live value for the
    /// same key, since the caller looked; both are left alone.
    fn forget_at(&mut self, index: usize, key_hash: u64) {
        if self.key_hashes.get(index) != Some(&key_hash) {
            return;
        }
        if self.values[index].strong_count() == 0 {
            self.key_hashes[index] = TOMBSTONE;
            self.values[index] = Weak::new();
        }
    }

    fn live(&self) -> usize {
        self.key_hashes
            .iter()
            .zip(&self.values)
            .filter(|&(&h, v)| h != TOMBSTONE && v.strong_count() > 0)
            .count()
    }
}

impl<V> Inner<V> {
    /// Called from the drop callback of a value cached under `key_hash`.
    ///
    /// The callback may run on a thread that already holds the lock, so it must not wait for it.
    fn reclaim(&self, key_hash: u64) {
        match self.slots.try_write() {
            Some(mut slots) => slots.forget(key_hash),
            None => {
                trace!(key_hash, "cache locked; deferring reclaim of dead entry");
                self.dead.lock().push(key_hash);
            }
        }
    }

    fn drain_dead(&self, slots: &mut Slots<V>) {
        let dead = std::mem::take(&mut *self.dead.lock());
        for key_hash in dead {
            slots.forget(key_hash);
        }
    }
}

impl<K, V> GrowableCache<K, V, crate::DefaultHashBuilder> {
    /// Creates a cache with room for `initial_size` entries before it first reallocates, holding
    /// at most `max_size` entries. A `max_size` of 0 lets the cache grow without bound.
    ///
    /// # Examples
    ///
    /// ```
    /// use weak_cache::GrowableCache;
    /// let cache: GrowableCache<u32, u32> = GrowableCache::new(16, 128);
    /// assert_eq!(cache.capacity(), 128);
    /// assert!(cache.is_empty());
    /// ```
    pub fn new(initial_size: usize, max_size: usize) -> Self {
        Self::with_hasher(initial_size, max_size, crate::DefaultHashBuilder::default())
    }
}

impl<K, V, S> Default for GrowableCache<K, V, S>
where
    S: Default,
{
    fn default() -> Self {
        Self::with_hasher(0, 0, S::default())
    }
}

impl<K, V, S> GrowableCache<K, V, S> {
    /// Like [`GrowableCache::new`], but uses `hash_builder` to hash keys.
    pub fn with_hasher(initial_size: usize, max_size: usize, hash_builder: S) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: RwLock::new(Slots::with_capacity(initial_size)),
                dead: Mutex::new(Vec::new()),
            }),
            max_size,
            build_hasher: hash_builder,
            _key: PhantomData,
        }
    }

    /// Returns the maximum number of entries, or 0 if the cache is unbounded.
    pub fn capacity(&self) -> usize {
        self.max_size
    }

    /// Returns the number of entries whose value is still alive.
    pub fn len(&self) -> usize {
        self.inner.slots.read().live()
    }

    /// Returns `true` if no entry holds a live value.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V, S> GrowableCache<K, V, S>
where
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    fn hash<Q: ?Sized + Hash>(&self, key: &Q) -> u64 {
        crate::hash_key(&self.build_hasher, key)
    }

    /// Caches a weak reference to `value` under `key`.
    ///
    /// An existing entry for `key` is overwritten. Otherwise the first freed slot is reused, the
    /// list grows by one, or, once `max_size` entries exist, a random entry is replaced.
    ///
    /// A drop callback is registered on `value` so that its slot is freed as soon as the value
    /// is destroyed. Putting the value that already occupies the key's slot registers nothing,
    /// but every other put does. Callbacks are only released when the value is dropped, so a
    /// long-lived value that keeps trading places with another under the same key accumulates
    /// one callback per put. Callbacks that outlive their slot are harmless when they run.
    pub fn put<Q>(&self, key: &Q, value: &Arc<Tracked<V>>)
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash,
    {
        let key_hash = self.hash(key);

        let fresh = {
            let mut slots = self.inner.slots.write();
            self.inner.drain_dead(&mut slots);
            slots.insert(key_hash, Arc::downgrade(value), self.max_size)
        };

        if fresh {
            // the callback must not keep the cache alive
            let inner = Arc::downgrade(&self.inner);
            value.on_drop(move || {
                if let Some(inner) = inner.upgrade() {
                    inner.reclaim(key_hash);
                }
            });
        }
    }

    /// Returns a copy of the value cached under `key`, if it is still alive.
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
    /// If the entry is found dead, its slot is freed before returning.
    pub fn get_arc<Q>(&self, key: &Q) -> Option<Arc<Tracked<V>>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash,
    {
        let key_hash = self.hash(key);

        // the read lock must be released before `value` can be dropped: if we end up holding the
        // last reference, the drop callbacks will want the lock.
        let (index, value) = {
            let slots = self.inner.slots.read();
            let index = slots.position(key_hash)?;
            (index, slots.values[index].upgrade())
        };

        if value.is_none() {
            let mut slots = self.inner.slots.write();
            self.inner.drain_dead(&mut slots);
            slots.forget_at(index, key_hash);
        }

        value
    }
}

impl<K, V, S> Debug for GrowableCache<K, V, S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let slots = self.inner.slots.read();
        f.debug_struct("GrowableCache")
            .field("slots", &slots.key_hashes.len())
            .field("live", &slots.live())
            .field("max_size", &self.max_size)
            .finish()
    }
}
