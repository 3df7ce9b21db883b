use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;

/// A non-cryptographic generator shared by all writers of one cache.
///
/// Each draw is a single `fetch_add` on the state followed by the splitmix64 finalizer, so
/// concurrent callers never block each other and never observe the same state.
#[derive(Debug)]
pub(crate) struct Prng {
    state: AtomicU64,
}

impl Prng {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            state: AtomicU64::new(seed),
        }
    }

    /// Seeds from the wall clock mixed with `identity`, so that caches constructed at the same
    /// instant still draw different sequences.
    pub(crate) fn from_time(identity: usize) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self::new(nanos ^ finalize(identity as u64))
    }

    pub(crate) fn next_u64(&self) -> u64 {
        let state = self.state.fetch_add(GAMMA, Ordering::Relaxed);
        finalize(state.wrapping_add(GAMMA))
    }

    /// A uniformly-ish distributed index in `0..bound`.
    pub(crate) fn next_index(&self, bound: usize) -> usize {
        debug_assert!(bound > 0);
        (self.next_u64() % bound as u64) as usize
    }
}

fn finalize(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
