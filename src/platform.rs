//! CPU and memory-node topology consumed by the slab engine.

use core::sync::atomic::{AtomicU64, Ordering};

/// Topology and environment services the allocator needs from its host.
///
/// `current_cpu` may return a stale answer if the caller migrates right
/// after the call; the fast paths tolerate that by validating the per-CPU
/// transaction id.
pub trait SlabPlatform: Send + Sync {
    /// Number of CPUs that may call into the allocator.
    fn nr_cpus(&self) -> usize;

    /// CPU the caller is currently running on, in `0..nr_cpus()`.
    fn current_cpu(&self) -> usize;

    /// Number of memory nodes.
    fn nr_nodes(&self) -> usize {
        1
    }

    /// Memory node local to `cpu`.
    fn cpu_to_node(&self, _cpu: usize) -> usize {
        0
    }

    /// Relative access cost from `from` to `to`; smaller is closer.
    fn node_distance(&self, from: usize, to: usize) -> u32 {
        if from == to {
            10
        } else {
            20
        }
    }

    /// Identifier of the calling task, recorded in debug tracks.
    fn current_pid(&self) -> u32 {
        0
    }

    /// Monotonic timestamp recorded in debug tracks.
    fn now(&self) -> u64 {
        0
    }

    /// Source of randomness for freelist hardening and defrag decisions.
    fn random_u64(&self) -> u64 {
        static STATE: AtomicU64 = AtomicU64::new(0x9e37_79b9_7f4a_7c15);
        splitmix64(STATE.fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed))
    }

    /// Fail-injection hook consulted for caches created with `FAILSLAB`.
    fn should_fail_alloc(&self, _cache: &str) -> bool {
        false
    }
}

/// One CPU, one node.
#[derive(Debug, Default, Clone, Copy)]
pub struct UniprocessorPlatform;

impl SlabPlatform for UniprocessorPlatform {
    fn nr_cpus(&self) -> usize {
        1
    }

    fn current_cpu(&self) -> usize {
        0
    }
}

/// SplitMix64 finalizer.
#[inline]
pub(crate) fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Small xorshift generator for per-cache decisions that need no crypto
/// strength (freelist permutation, remote defrag sampling).
#[derive(Debug, Clone)]
pub(crate) struct XorShift64(u64);

impl XorShift64 {
    pub(crate) fn new(seed: u64) -> Self {
        Self(seed | 1)
    }

    pub(crate) fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Uniform-enough value in `0..bound`.
    pub(crate) fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}
