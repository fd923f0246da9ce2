// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Tunable constants for the heap and mapping engines.
//!
//! Everything here is a named constant rather than a literal buried in the
//! allocation path, so the trade-offs behind each number stay visible and
//! reviewable in one place.

use crate::header::BlockHeader;

/// Number of segregated free-list classes in the heap engine.
///
/// Class `c` holds free blocks whose size falls in
/// `(2 * HEADER_SIZE * 2^c, 2 * HEADER_SIZE * 2^(c+1)]`, with the last class
/// absorbing everything larger.
pub const NUM_SIZE_CLASSES: usize = 11;

/// Byte size of [`BlockHeader`]. Request sizes are rounded up to a multiple
/// of this, and it is the unit split/coalesce arithmetic is expressed in.
pub const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// Above this many bytes, the router hands a request to the mapping engine
/// instead of the heap engine.
pub const MAX_HEAP_ALLOC: usize = 128 * 1024;

/// How aggressively the heap region grows when every size class large enough
/// to satisfy a request is empty.
///
/// A factor of 3 is not a general-purpose tuning knob: it is the chosen
/// point on the size-vs-syscall-count curve for this allocator. Growing more
/// aggressively amortizes `sbrk` calls across request bursts at the cost of
/// address space that, once claimed, is never returned to the OS (the heap
/// region is monotone, see `heap::HeapState`).
pub const GROWTH_FACTOR: usize = 3;

/// A free block is only split off when the leftover slack exceeds this many
/// bytes; smaller remainders are handed out whole rather than fragmenting
/// the heap with slivers too small to usefully reuse.
pub const MIN_SPLIT_SLACK: usize = 2 * HEADER_SIZE;

/// Size class an already-aligned size belongs to when *inserted* as free.
///
/// Class `c` covers `(2H * 2^c, 2H * 2^(c+1)]` where `H` is [`HEADER_SIZE`].
pub fn free_class(size: usize) -> usize {
    let size = size.max(1);
    let h2 = 2 * HEADER_SIZE;
    // q = ceil(size / h2): smallest n with size <= n * h2.
    let q = (size + h2 - 1) / h2;
    // k = bits needed to represent q as a power-of-two upper bound, i.e.
    // smallest k with 2^k >= q. class = k - 1, clamped at 0.
    let k = if q <= 1 { 0 } else { usize::BITS - (q - 1).leading_zeros() };
    (k.saturating_sub(1) as usize).min(NUM_SIZE_CLASSES - 1)
}

/// Size class searched first when satisfying an allocation request of this
/// (already header-aligned) size: the same class the request's own size
/// would be filed under if it were freed.
///
/// Every class *above* this one is guaranteed large enough without a
/// per-block size comparison — a block filed in class `c` has size
/// strictly greater than `2H * 2^c`, which is at least `size` for any `c`
/// above `free_class(size)`. The starting class carries no such guarantee
/// (it can hold anything from just over its own lower bound up to `size`
/// itself), so the heap engine's inner search still checks sizes there.
/// Starting the scan here rather than one class up is what lets an
/// exact-size reuse — free a block, then request the same size again —
/// find that block directly instead of only by a later coalesce.
pub fn alloc_class(size: usize) -> usize {
    free_class(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_class_is_monotonic() {
        let mut prev = 0;
        for size in (1..=HEADER_SIZE * 4096).step_by(HEADER_SIZE) {
            let class = free_class(size);
            assert!(class >= prev);
            assert!(class < NUM_SIZE_CLASSES);
            prev = class;
        }
    }

    #[test]
    fn alloc_class_matches_free_class() {
        // An allocation search must start at the same class its own size
        // would be filed under if freed, or a same-size block sitting in
        // that exact class would never be found.
        for size in (HEADER_SIZE..HEADER_SIZE * 64).step_by(HEADER_SIZE) {
            assert_eq!(alloc_class(size), free_class(size));
        }
    }

    #[test]
    fn every_block_one_class_above_is_guaranteed_to_fit() {
        // The search only skips the size check for classes strictly above
        // alloc_class(size); confirm that guarantee actually holds by
        // checking the smallest possible size in each such class.
        let h2 = 2 * HEADER_SIZE;
        for size in (HEADER_SIZE..HEADER_SIZE * 64).step_by(HEADER_SIZE) {
            let start = alloc_class(size);
            if start + 1 >= NUM_SIZE_CLASSES {
                continue;
            }
            let smallest_in_next_class = h2 * (1 << (start + 1)) + 1;
            assert!(smallest_in_next_class >= size);
        }
    }

    #[test]
    fn smallest_sizes_land_in_class_zero() {
        assert_eq!(free_class(1), 0);
        assert_eq!(free_class(2 * HEADER_SIZE), 0);
    }

    #[test]
    fn huge_sizes_saturate_last_class() {
        assert_eq!(free_class(usize::MAX), NUM_SIZE_CLASSES - 1);
        assert_eq!(alloc_class(usize::MAX), NUM_SIZE_CLASSES - 1);
    }
}
