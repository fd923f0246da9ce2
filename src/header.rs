// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The shared block header laid out by both engines.
//!
//! Every live or free block, in either engine, is prefixed by one of these.
//! The magic tag is what lets the reference counter and the router recover
//! a block's engine and liveness without consulting a side table: both
//! engines agree on its offset (asserted in the tests below via
//! `memoffset::offset_of!`), so code that only has a `*mut BlockHeader` can
//! always read it.

use std::ptr::NonNull;

/// Tag for a live heap-engine block.
pub const HEAP_ALLOCATED: u32 = 0xCAFE_BABE;
/// Tag for a free heap-engine block sitting in a size-class free list.
pub const HEAP_FREED: u32 = 0xDEAD_BEEF;
/// Tag for a live mapping-engine block.
pub const MAPPING_ALLOCATED: u32 = 0xBEEF_CAFE;
/// Tag for a block that has been handed back to the mapping engine.
///
/// Mapping blocks are unmapped eagerly on free rather than kept in a free
/// list, so this tag is never observed on a block still reachable through
/// the all-blocks chain; it exists only so every lifecycle state has a
/// distinct magic value, matching the heap engine's four-state symmetry.
pub const MAPPING_FREED: u32 = 0xFEED_FACE;

/// Links shared by every block, in every engine.
///
/// `next`/`prev` are the engine's all-blocks chain (address-ordered for the
/// heap, allocation-ordered for the mapping engine). `next_free`/`prev_free`
/// are only ever populated by the heap engine's segregated free lists; the
/// mapping engine leaves them `None` for the lifetime of every block it
/// owns, since it has no free list to link into.
#[repr(C)]
pub struct BlockHeader {
    /// Payload byte count, not including this header.
    pub size: usize,
    /// Allocation-state and engine-provenance tag. Always the second field
    /// so heap and mapping headers agree on its offset.
    pub magic: u32,
    pub next: Option<NonNull<BlockHeader>>,
    pub prev: Option<NonNull<BlockHeader>>,
    pub next_free: Option<NonNull<BlockHeader>>,
    pub prev_free: Option<NonNull<BlockHeader>>,
    /// Reference count. Zero for a block that has never been retained, and
    /// for any block about to be freed outright.
    #[cfg(feature = "reference-counting")]
    pub ref_count: usize,
    /// Finalizer invoked once, immediately before the block is returned to
    /// its engine, when the reference count reaches zero.
    #[cfg(feature = "reference-counting")]
    pub destructor: Option<Box<dyn FnMut(*mut u8) + Send>>,
}

impl BlockHeader {
    /// Address of the payload this header fronts.
    #[inline]
    pub fn payload_ptr(header: NonNull<BlockHeader>) -> NonNull<u8> {
        // SAFETY: the header is always immediately followed by its payload.
        unsafe { NonNull::new_unchecked(header.as_ptr().add(1) as *mut u8) }
    }

    /// Recover the header from a payload pointer previously handed out by
    /// either engine.
    ///
    /// # Safety
    /// `payload` must be a pointer previously returned by this allocator's
    /// `allocate`/`reference_allocate`, still live (not yet the target of a
    /// later `free`/`release` that completed).
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<BlockHeader> {
        NonNull::new_unchecked((payload.as_ptr() as *mut BlockHeader).offset(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoffset::offset_of;

    #[test]
    fn magic_is_at_a_fixed_offset() {
        // The reference counter reads `magic` through a `*mut BlockHeader`
        // regardless of which engine produced the block; this only works if
        // every header flavor agrees on the field's offset.
        assert_eq!(offset_of!(BlockHeader, magic), core::mem::size_of::<usize>());
    }

    #[test]
    fn four_magic_tags_are_distinct() {
        let tags = [HEAP_ALLOCATED, HEAP_FREED, MAPPING_ALLOCATED, MAPPING_FREED];
        for (i, a) in tags.iter().enumerate() {
            for (j, b) in tags.iter().enumerate() {
                assert!(i == j || a != b, "magic tags must be pairwise distinct");
            }
        }
    }

    #[test]
    fn allocated_tags_are_distinct_across_engines() {
        // This is the specific property the refcount layer relies on to pick
        // the right engine's free path with no range table.
        assert_ne!(HEAP_ALLOCATED, MAPPING_ALLOCATED);
    }
}
