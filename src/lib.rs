//! Concurrent caches whose entries hold only weak references to their values.
//!
//! A value handed to one of these caches is not kept alive by it. The cache records a
//! [`Weak`](std::sync::Weak) to the value, and the entry stops answering lookups as soon as the
//! last [`Arc`](std::sync::Arc) to the value is dropped. There is no eviction policy to tune, no
//! expiry, and nothing to invalidate by hand: a cached entry lives exactly as long as the object
//! it describes. This makes the caches a good fit for in-process memoization of objects that are
//! owned elsewhere, such as parsed documents or compiled templates that a request may or may not
//! still be using.
//!
//! Two implementations share that contract:
//!
//!  - [`LockFreeCache`] is a fixed-size table mutated only through atomic compare-exchange on
//!    its slots. Reads and writes never block. Dead entries are discovered lazily, when an
//!    operation happens to touch their slot. This is the one to reach for under contention.
//!  - [`GrowableCache`] keeps its entries in a flat list behind a single
//!    [`RwLock`](parking_lot::RwLock), optionally bounded in size. Its values are wrapped in
//!    [`Tracked`], which lets the cache free an entry the moment its value is destroyed.
//!
//! # A note on lookups
//!
//! Both caches identify keys only by a 64-bit seeded hash; keys themselves are never stored.
//! Two distinct keys whose hashes collide are indistinguishable to the cache. With the default,
//! randomly seeded [`DefaultHashBuilder`] this is astronomically unlikely, but a caller-supplied
//! hasher can make it happen on purpose.
//!
//! [`LockFreeCache`] additionally bounds the cost of a lookup: it inspects at most
//! `max(1, floor(log2(capacity)))` slots. Under heavy load a write may have to place its entry
//! outside that window, in which case the entry is still counted by
//! [`len`](LockFreeCache::len) but cannot be found by [`get`](LockFreeCache::get). A miss is
//! always a legal answer from a cache; callers are expected to recompute (and re-`put`) on a
//! miss.
//!
//! # A note on memory reclamation
//!
//! [`LockFreeCache`] recycles the small records it stores in its slots. A record removed from a
//! slot is handed to an epoch-based collector (from [`crossbeam`]) and only returns to the
//! recycling pool once no concurrent reader can still be looking at it. A lookup can therefore
//! never see the fields of one key through a record that has meanwhile been reused for another.
//! The flip side is the `'static` bound on cached values: retired records may be recycled on any
//! thread, at any later point, including after the cache itself has been dropped.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use weak_cache::LockFreeCache;
//!
//! #[derive(Clone, Debug, PartialEq)]
//! struct Document {
//!     body: String,
//! }
//!
//! let cache = LockFreeCache::<String, Document>::new(256);
//!
//! let doc = Arc::new(Document { body: "hello".into() });
//! cache.put("index.html", &doc);
//!
//! // still owned by `doc`, so the lookup hits
//! assert_eq!(cache.get_arc("index.html").map(|d| d.body.clone()), Some("hello".to_string()));
//!
//! drop(doc);
//! assert!(cache.get("index.html").is_none());
//! ```
#![deny(
    missing_docs,
    missing_debug_implementations,
    unreachable_pub,
    rustdoc::broken_intra_doc_links
)]
#![warn(rust_2018_idioms)]

mod cache;
mod growable;
mod metrics;
mod node;
mod raw;
mod reclaim;
mod rng;
mod tracked;

pub use cache::LockFreeCache;
pub use growable::GrowableCache;
pub use metrics::Metrics;
pub use tracked::Tracked;

/// Default hasher for [`LockFreeCache`] and [`GrowableCache`].
///
/// Each cache builds its own instance, so the same key hashes differently in different caches.
pub type DefaultHashBuilder = ahash::RandomState;

/// Hashes `key` for use as a slot's key hash.
///
/// A key whose hash comes out as the tombstone value is moved to `1`, so that no live key can be
/// mistaken for an empty slot.
pub(crate) fn hash_key<S, Q>(build_hasher: &S, key: &Q) -> u64
where
    S: std::hash::BuildHasher,
    Q: ?Sized + std::hash::Hash,
{
    use std::hash::Hasher;
    let mut h = build_hasher.build_hasher();
    key.hash(&mut h);
    match h.finish() {
        node::TOMBSTONE => 1,
        hash => hash,
    }
}
