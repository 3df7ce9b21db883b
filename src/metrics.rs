//! Per-path cache counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// A snapshot of a [`LockFreeCache`](crate::LockFreeCache)'s counters.
///
/// Every counter only ever grows for the lifetime of the cache. Exactly one of the five write
/// counters is bumped by each [`put`](crate::LockFreeCache::put) on an enabled cache, recording
/// which placement path the write took.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use weak_cache::LockFreeCache;
///
/// let cache = LockFreeCache::<&str, u32>::new(64);
/// let value = Arc::new(1);
/// cache.put("a", &value);
/// assert_eq!(cache.get("a"), Some(1));
/// assert_eq!(cache.get("b"), None);
///
/// let metrics = cache.metrics();
/// assert_eq!(metrics.total_writes(), 1);
/// assert_eq!(metrics.read_hits, 1);
/// assert_eq!(metrics.read_misses, 1);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metrics {
    /// Lookups that returned a live value.
    pub read_hits: u64,
    /// Lookups that found nothing, or found only a dead referent.
    pub read_misses: u64,
    /// Writes that replaced the same key at its first probe position.
    pub first_writes: u64,
    /// Writes that replaced the same key further along its probe sequence.
    pub probe_writes: u64,
    /// Writes that claimed an empty, dead, or tombstoned slot.
    pub empty_writes: u64,
    /// Writes that evicted a random live slot through a compare-exchange.
    pub random_cas_writes: u64,
    /// Writes that fell back to an unconditional store at a random slot.
    pub random_writes: u64,
}

impl Metrics {
    /// Total number of lookups.
    pub fn total_reads(&self) -> u64 {
        self.read_hits + self.read_misses
    }

    /// Total number of writes, summed over every placement path.
    pub fn total_writes(&self) -> u64 {
        self.first_writes
            + self.probe_writes
            + self.empty_writes
            + self.random_cas_writes
            + self.random_writes
    }

    /// Fraction of lookups that hit, between 0.0 and 1.0.
    ///
    /// Returns 0.0 if there have been no lookups.
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_reads();
        if total == 0 {
            0.0
        } else {
            self.read_hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    read_hits: AtomicU64,
    read_misses: AtomicU64,
    first_writes: AtomicU64,
    probe_writes: AtomicU64,
    empty_writes: AtomicU64,
    random_cas_writes: AtomicU64,
    random_writes: AtomicU64,
}

/// Placement path taken by a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Write {
    First,
    Probe,
    Empty,
    RandomCas,
    Random,
}

impl Counters {
    #[inline]
    pub(crate) fn hit(&self) {
        self.read_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn miss(&self) {
        self.read_misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn write(&self, path: Write) {
        let counter = match path {
            Write::First => &self.first_writes,
            Write::Probe => &self.probe_writes,
            Write::Empty => &self.empty_writes,
            Write::RandomCas => &self.random_cas_writes,
            Write::Random => &self.random_writes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Metrics {
        Metrics {
            read_hits: self.read_hits.load(Ordering::Relaxed),
            read_misses: self.read_misses.load(Ordering::Relaxed),
            first_writes: self.first_writes.load(Ordering::Relaxed),
            probe_writes: self.probe_writes.load(Ordering::Relaxed),
            empty_writes: self.empty_writes.load(Ordering::Relaxed),
            random_cas_writes: self.random_cas_writes.load(Ordering::Relaxed),
            random_writes: self.random_writes.load(Ordering::Relaxed),
        }
    }
}
