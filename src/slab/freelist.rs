//! Free pointer encoding and freelist randomization.
//!
//! A free object stores the address of the next free object at the cache's
//! free pointer offset. With hardening enabled the stored word is
//! `next ^ random ^ swab(location)`, so a leaked word does not disclose a
//! heap address and a linear overwrite does not produce a usable pointer.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::platform::XorShift64;

/// Encoder/decoder for free pointers of one cache.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FreePointerCodec {
    random: usize,
    hardened: bool,
}

impl FreePointerCodec {
    pub(crate) const fn new(random: usize, hardened: bool) -> Self {
        Self { random, hardened }
    }

    #[inline]
    fn mask(&self, location: usize) -> usize {
        if self.hardened {
            self.random ^ location.swap_bytes()
        } else {
            0
        }
    }

    /// Store `next` (0 for end of list) at `location`.
    ///
    /// # Safety
    /// `location` must be valid for a pointer-sized write.
    #[inline]
    pub(crate) unsafe fn write(&self, location: usize, next: usize) {
        (location as *mut usize).write_unaligned(next ^ self.mask(location));
    }

    /// Load the free pointer stored at `location`.
    ///
    /// # Safety
    /// `location` must be valid for a pointer-sized read.
    #[inline]
    pub(crate) unsafe fn read(&self, location: usize) -> usize {
        (location as *const usize).read_unaligned() ^ self.mask(location)
    }
}

/// Random permutation of `0..count` consumed when a slab is formatted.
pub(crate) fn random_sequence(count: usize, rng: &mut XorShift64) -> Box<[u16]> {
    let mut seq: Vec<u16> = (0..count as u16).collect();
    for i in (1..seq.len()).rev() {
        let j = rng.below(i as u64 + 1) as usize;
        seq.swap(i, j);
    }
    seq.into_boxed_slice()
}

/// Walks a random sequence from a random start, skipping indices beyond
/// the slab's capacity (slabs built at the fallback order hold fewer
/// objects than the sequence was computed for).
pub(crate) struct ShuffledIndices<'a> {
    seq: &'a [u16],
    pos: usize,
    remaining: usize,
    limit: usize,
}

impl<'a> ShuffledIndices<'a> {
    pub(crate) fn new(seq: &'a [u16], start: usize, limit: usize) -> Self {
        Self {
            seq,
            pos: if seq.is_empty() { 0 } else { start % seq.len() },
            remaining: limit.min(seq.len()),
            limit,
        }
    }
}

impl Iterator for ShuffledIndices<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        loop {
            let idx = self.seq[self.pos] as usize;
            self.pos = (self.pos + 1) % self.seq.len();
            if idx < self.limit {
                self.remaining -= 1;
                return Some(idx);
            }
        }
    }
}
