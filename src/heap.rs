// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The sbrk-backed contiguous heap engine.
//!
//! One monotone region, grown on demand via `sbrk` and never shrunk. Free
//! blocks live in [`crate::config::NUM_SIZE_CLASSES`] segregated lists;
//! live and free blocks together form one address-ordered doubly linked
//! chain (`next`/`prev` on [`BlockHeader`]) that coalescing walks.

use std::ptr::NonNull;

use crate::config::{self, GROWTH_FACTOR, HEADER_SIZE, MIN_SPLIT_SLACK, NUM_SIZE_CLASSES};
use crate::error::HeapError;
use crate::header::{BlockHeader, HEAP_ALLOCATED, HEAP_FREED};
use crate::sync::Mutex;

struct HeapState {
    /// First address ever handed to us by `sbrk`. Zero until initialized.
    base: usize,
    /// One past the last address currently committed.
    end: usize,
    head: Option<NonNull<BlockHeader>>,
    tail: Option<NonNull<BlockHeader>>,
    free_head: [Option<NonNull<BlockHeader>>; NUM_SIZE_CLASSES],
    free_tail: [Option<NonNull<BlockHeader>>; NUM_SIZE_CLASSES],
}

// All fields are either plain integers or pointers only ever touched while
// holding `HEAP`'s lock.
unsafe impl Send for HeapState {}

impl HeapState {
    const fn new() -> Self {
        HeapState {
            base: 0,
            end: 0,
            head: None,
            tail: None,
            free_head: [None; NUM_SIZE_CLASSES],
            free_tail: [None; NUM_SIZE_CLASSES],
        }
    }
}

static HEAP: Mutex<HeapState> = Mutex::new(HeapState::new());

#[inline]
fn round_to_header_multiple(size: usize) -> Option<usize> {
    let rounded = size.checked_add(HEADER_SIZE - 1)?;
    Some((rounded / HEADER_SIZE) * HEADER_SIZE)
}

/// Bring the region up if this is the first call into the heap engine.
///
/// Idempotent: a second call is a no-op. Safe to call from multiple
/// threads; only the first caller pays for the initial `sbrk`.
pub fn heap_init() -> Result<(), HeapError> {
    let mut state = HEAP.lock();
    if state.base != 0 {
        return Ok(());
    }
    // SAFETY: sbrk(0) only queries the current break, it cannot fail.
    let base = unsafe { libc::sbrk(0) } as usize;
    state.base = base;
    state.end = base;
    Ok(())
}

/// Extend the region by `GROWTH_FACTOR` times the current region size plus
/// `min_size`, so growth steps scale up as the region itself grows rather
/// than staying pinned to whatever the triggering request happened to be.
/// Files the new space as one free block, coalescing with the current tail
/// block if it is free.
fn grow(state: &mut HeapState, min_size: usize) -> Result<(), HeapError> {
    let current_size = state.end.saturating_sub(state.base);
    let grow_by = GROWTH_FACTOR.saturating_mul(current_size.saturating_add(min_size));
    let grow_by = round_to_header_multiple(grow_by).ok_or(HeapError::SizeOverflow)?;

    // SAFETY: sbrk is only ever called while holding HEAP's lock, so the
    // break pointer this thread observes cannot be invalidated by a
    // concurrent grow from another thread in this process.
    let prev_break = unsafe { libc::sbrk(grow_by as libc::intptr_t) };
    if prev_break as isize == -1 {
        log::warn!("heap: sbrk failed to grow region by {} bytes", grow_by);
        return Err(HeapError::RegionGrowthFailed);
    }

    let new_base = prev_break as usize;
    if state.base == 0 {
        state.base = new_base;
        state.end = new_base;
    }
    debug_assert_eq!(new_base, state.end, "heap region must stay contiguous");

    let new_block = new_base as *mut BlockHeader;
    // SAFETY: sbrk just committed grow_by bytes starting at new_base, and
    // grow_by is at least HEADER_SIZE (rounded up above).
    let mut new_block = unsafe { NonNull::new_unchecked(new_block) };
    let payload_size = grow_by - HEADER_SIZE;
    unsafe {
        new_block.as_mut().size = payload_size;
        new_block.as_mut().magic = HEAP_FREED;
        new_block.as_mut().next = None;
        new_block.as_mut().prev = state.tail;
        new_block.as_mut().next_free = None;
        new_block.as_mut().prev_free = None;
        #[cfg(feature = "reference-counting")]
        {
            new_block.as_mut().ref_count = 0;
            new_block.as_mut().destructor = None;
        }
    }

    state.end = new_base + grow_by;

    if let Some(mut tail) = state.tail {
        unsafe { tail.as_mut().next = Some(new_block) };
    } else {
        state.head = Some(new_block);
    }
    state.tail = Some(new_block);

    // The previous tail, if free, is adjacent in address space to the new
    // block: merge them into one free entry instead of filing two.
    let merged = match state.tail_neighbor_is_free(new_block) {
        Some(prev_free) => merge_free_neighbors(state, prev_free, new_block),
        None => new_block,
    };
    insert_free(state, merged);

    log::trace!("heap: grew region by {} bytes, now {} bytes total", grow_by, state.end - state.base);
    Ok(())
}

impl HeapState {
    /// If `block`'s immediate left neighbor in the all-blocks chain is a
    /// free block, return it.
    fn tail_neighbor_is_free(&self, block: NonNull<BlockHeader>) -> Option<NonNull<BlockHeader>> {
        let prev = unsafe { block.as_ref().prev }?;
        if unsafe { prev.as_ref().magic } == HEAP_FREED {
            Some(prev)
        } else {
            None
        }
    }
}

/// Merge `right` into `left` (both free, `left` immediately precedes
/// `right` in the all-blocks chain). Returns the surviving block, still
/// outside every free list; the caller is responsible for filing it.
fn merge_free_neighbors(
    state: &mut HeapState,
    left: NonNull<BlockHeader>,
    right: NonNull<BlockHeader>,
) -> NonNull<BlockHeader> {
    unlink_free(state, left);
    let right_size = unsafe { right.as_ref().size };
    let right_next = unsafe { right.as_ref().next };

    let mut left_mut = left;
    unsafe {
        left_mut.as_mut().size += HEADER_SIZE + right_size;
        left_mut.as_mut().next = right_next;
    }
    if let Some(mut next) = right_next {
        unsafe { next.as_mut().prev = Some(left) };
    } else {
        state.tail = Some(left);
    }
    left
}

fn class_for_free(size: usize) -> usize {
    config::free_class(size)
}

/// Files `block` at the tail of its class's free list, not the head.
///
/// `find_fit` always scans from `free_head` forward, so appending at the
/// tail keeps that scan first-fit in freed order: the block that has been
/// free the longest is the one handed back first, rather than whichever was
/// freed most recently.
fn insert_free(state: &mut HeapState, mut block: NonNull<BlockHeader>) {
    let class = class_for_free(unsafe { block.as_ref().size });
    unsafe {
        block.as_mut().magic = HEAP_FREED;
        block.as_mut().next_free = None;
        block.as_mut().prev_free = state.free_tail[class];
    }
    if let Some(mut old_tail) = state.free_tail[class] {
        unsafe { old_tail.as_mut().next_free = Some(block) };
    } else {
        state.free_head[class] = Some(block);
    }
    state.free_tail[class] = Some(block);
}

fn unlink_free(state: &mut HeapState, block: NonNull<BlockHeader>) {
    let class = class_for_free(unsafe { block.as_ref().size });
    let (prev, next) = unsafe { (block.as_ref().prev_free, block.as_ref().next_free) };

    match prev {
        Some(mut p) => unsafe { p.as_mut().next_free = next },
        None => state.free_head[class] = next,
    }
    match next {
        Some(mut n) => unsafe { n.as_mut().prev_free = prev },
        None => state.free_tail[class] = prev,
    }
}

/// Remove `block` from the all-blocks chain entirely. Only used when a
/// block is absorbed by a coalesce and stops existing as a distinct entry.
fn unlink_chain(state: &mut HeapState, block: NonNull<BlockHeader>) {
    let (prev, next) = unsafe { (block.as_ref().prev, block.as_ref().next) };
    match prev {
        Some(mut p) => unsafe { p.as_mut().next = next },
        None => state.head = next,
    }
    match next {
        Some(mut n) => unsafe { n.as_mut().prev = prev },
        None => state.tail = prev,
    }
}

/// Insert `fresh` into the all-blocks chain immediately after `after`.
fn insert_chain_after(state: &mut HeapState, after: NonNull<BlockHeader>, mut fresh: NonNull<BlockHeader>) {
    let next = unsafe { after.as_ref().next };
    unsafe {
        fresh.as_mut().prev = Some(after);
        fresh.as_mut().next = next;
    }
    match next {
        Some(mut n) => unsafe { n.as_mut().prev = Some(fresh) },
        None => state.tail = Some(fresh),
    }
    let mut after = after;
    unsafe { after.as_mut().next = Some(fresh) };
}

/// Find the first free block able to satisfy `size`.
///
/// Scans starting at [`config::alloc_class`], the same class `size` would
/// be filed under if freed: that starting class offers no size guarantee
/// (it can hold anything down to just over its own lower bound), so it is
/// scanned with a per-block check. Every class above it is guaranteed large
/// enough on its own (see `alloc_class`'s doc comment) and is taken whole
/// from its head — except the saturated top class, which absorbs a wide
/// enough range that it always needs the same per-block check.
fn find_fit(state: &HeapState, size: usize) -> Option<NonNull<BlockHeader>> {
    let start = config::alloc_class(size);
    for class in start..NUM_SIZE_CLASSES {
        let mut candidate = state.free_head[class];
        let guaranteed = class > start && class < NUM_SIZE_CLASSES - 1;
        if guaranteed {
            if candidate.is_some() {
                return candidate;
            }
            continue;
        }
        while let Some(block) = candidate {
            if unsafe { block.as_ref().size } >= size {
                return Some(block);
            }
            candidate = unsafe { block.as_ref().next_free };
        }
    }
    None
}

/// Split `block` if the leftover after carving out `size` bytes exceeds
/// [`MIN_SPLIT_SLACK`], filing the remainder as a new free block.
fn maybe_split(state: &mut HeapState, block: NonNull<BlockHeader>, size: usize) {
    let block_size = unsafe { block.as_ref().size };
    let leftover = block_size - size;
    if leftover <= MIN_SPLIT_SLACK {
        return;
    }

    let remainder_addr = (block.as_ptr() as usize) + HEADER_SIZE + size;
    let mut remainder = unsafe { NonNull::new_unchecked(remainder_addr as *mut BlockHeader) };
    let remainder_payload = leftover - HEADER_SIZE;
    unsafe {
        remainder.as_mut().size = remainder_payload;
        remainder.as_mut().magic = HEAP_FREED;
        remainder.as_mut().next_free = None;
        remainder.as_mut().prev_free = None;
        #[cfg(feature = "reference-counting")]
        {
            remainder.as_mut().ref_count = 0;
            remainder.as_mut().destructor = None;
        }
    }

    let mut block_mut = block;
    unsafe { block_mut.as_mut().size = size };
    insert_chain_after(state, block, remainder);
    insert_free(state, remainder);
}

/// Allocate `size` payload bytes from the heap region.
///
/// Rounds `size` up to a multiple of the header size, searches the
/// segregated free lists, growing the region at most once if every
/// candidate class is empty, then splits the winning block if worthwhile.
pub fn allocate(size: usize) -> Result<NonNull<u8>, HeapError> {
    let size = round_to_header_multiple(size.max(1)).ok_or(HeapError::SizeOverflow)?;

    let mut state = HEAP.lock();
    if state.base == 0 {
        grow(&mut state, size)?;
    }

    let block = match find_fit(&state, size) {
        Some(b) => b,
        None => {
            grow(&mut state, size)?;
            find_fit(&state, size).ok_or(HeapError::RegionGrowthFailed)?
        }
    };

    unlink_free(&mut state, block);
    maybe_split(&mut state, block, size);

    let mut block = block;
    unsafe {
        block.as_mut().magic = HEAP_ALLOCATED;
        #[cfg(feature = "reference-counting")]
        {
            block.as_mut().ref_count = 0;
            block.as_mut().destructor = None;
        }
    }

    Ok(BlockHeader::payload_ptr(block))
}

#[inline]
fn in_range(state: &HeapState, address: usize) -> bool {
    state.base != 0 && address >= state.base && address < state.end
}

/// Whether `address` falls inside the heap region's current `[base, end)`
/// extent.
///
/// A pair of integer comparisons under the engine lock, no header
/// dereference: the router's free path calls this first to decide which
/// engine owns a pointer before trusting anything that pointer's memory
/// says about itself.
pub(crate) fn in_heap_range(address: usize) -> bool {
    let state = HEAP.lock();
    in_range(&state, address)
}

/// Return the block at `address` to the heap engine, coalescing with free
/// neighbors in the all-blocks chain.
pub fn free(address: usize) -> Result<(), HeapError> {
    let mut state = HEAP.lock();
    if !in_range(&state, address) {
        return Err(HeapError::OutOfRange { address });
    }

    let header_addr = address.checked_sub(HEADER_SIZE).ok_or(HeapError::OutOfRange { address })?;
    let mut block = unsafe { NonNull::new_unchecked(header_addr as *mut BlockHeader) };
    if unsafe { block.as_ref().magic } != HEAP_ALLOCATED {
        return Err(HeapError::NotAllocated { address });
    }

    unsafe {
        block.as_mut().magic = HEAP_FREED;
        #[cfg(feature = "reference-counting")]
        {
            block.as_mut().destructor = None;
        }
    }

    let mut merged = block;

    if let Some(prev) = unsafe { block.as_ref().prev } {
        if unsafe { prev.as_ref().magic } == HEAP_FREED {
            unlink_free(&mut state, prev);
            unlink_chain(&mut state, merged);
            merged = merge_adjacent(prev, merged);
        }
    }
    if let Some(next) = unsafe { merged.as_ref().next } {
        if unsafe { next.as_ref().magic } == HEAP_FREED {
            unlink_free(&mut state, next);
            unlink_chain(&mut state, next);
            merged = merge_adjacent(merged, next);
        }
    }

    insert_free(&mut state, merged);
    Ok(())
}

/// Absorb `right`'s payload into `left` (both already unlinked from their
/// free lists and, for `right`, from the all-blocks chain). `left` remains
/// the chain entry for the combined block.
fn merge_adjacent(left: NonNull<BlockHeader>, right: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
    let right_size = unsafe { right.as_ref().size };
    let mut left = left;
    unsafe { left.as_mut().size += HEADER_SIZE + right_size };
    left
}

/// Borrow the heap-allocated block at `address` under the engine lock just
/// long enough to run `f`, then release the lock before returning.
///
/// Kept deliberately short-lived: callers that need to run arbitrary code
/// (a destructor) or call back into `free` must do so after this returns,
/// never while still holding the lock `f` ran under.
#[cfg(feature = "reference-counting")]
fn with_block<R>(address: usize, f: impl FnOnce(&mut BlockHeader) -> R) -> Result<R, HeapError> {
    let mut state = HEAP.lock();
    if !in_range(&state, address) {
        return Err(HeapError::OutOfRange { address });
    }
    let header_addr = address.checked_sub(HEADER_SIZE).ok_or(HeapError::OutOfRange { address })?;
    let mut block = unsafe { NonNull::new_unchecked(header_addr as *mut BlockHeader) };
    if unsafe { block.as_ref().magic } != HEAP_ALLOCATED {
        return Err(HeapError::NotAllocated { address });
    }
    let _keep_locked = &mut state;
    Ok(f(unsafe { block.as_mut() }))
}

/// Increment the reference count of the block at `address`, returning the
/// new count.
///
/// Under `debugger`, a count already at `usize::MAX` is left untouched and
/// logged rather than wrapped.
#[cfg(feature = "reference-counting")]
pub(crate) fn retain(address: usize) -> Result<usize, HeapError> {
    with_block(address, |block| {
        #[cfg(feature = "debugger")]
        if block.ref_count == usize::MAX {
            log::error!("heap: reference count overflow for block at {:#x}", address);
            return block.ref_count;
        }
        block.ref_count += 1;
        block.ref_count
    })
}

/// Read the current reference count without modifying it.
#[cfg(feature = "reference-counting")]
pub(crate) fn reference_count(address: usize) -> Result<usize, HeapError> {
    with_block(address, |block| block.ref_count)
}

/// Install `destructor`, replacing any previously set one.
#[cfg(feature = "reference-counting")]
pub(crate) fn set_destructor(
    address: usize,
    destructor: Box<dyn FnMut(*mut u8) + Send>,
) -> Result<(), HeapError> {
    with_block(address, |block| block.destructor = Some(destructor))
}

/// Decrement the reference count. If it reaches zero, takes the
/// destructor out of the block (if any) and returns it alongside the new
/// count; the caller runs it and frees the block itself, both *after* this
/// function has returned and the heap lock has been released.
#[cfg(feature = "reference-counting")]
pub(crate) fn release_decrement(
    address: usize,
) -> Result<(usize, Option<Box<dyn FnMut(*mut u8) + Send>>), HeapError> {
    with_block(address, |block| {
        block.ref_count = block.ref_count.saturating_sub(1);
        if block.ref_count == 0 {
            (0, block.destructor.take())
        } else {
            (block.ref_count, None)
        }
    })
}

/// Count live heap blocks that still carry a nonzero reference count.
#[cfg(feature = "reference-counting")]
pub(crate) fn count_live_refs() -> usize {
    let state = HEAP.lock();
    let mut current = state.head;
    let mut count = 0;
    while let Some(block) = current {
        let header = unsafe { block.as_ref() };
        if header.magic == HEAP_ALLOCATED && header.ref_count > 0 {
            count += 1;
        }
        current = header.next;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_to_header_multiple_rounds_up() {
        assert_eq!(round_to_header_multiple(1), Some(HEADER_SIZE));
        assert_eq!(round_to_header_multiple(HEADER_SIZE), Some(HEADER_SIZE));
        assert_eq!(round_to_header_multiple(HEADER_SIZE + 1), Some(2 * HEADER_SIZE));
    }

    #[test]
    fn allocate_and_free_round_trip() {
        heap_init().expect("heap_init should succeed under test");
        let ptr = allocate(64).expect("allocate should succeed");
        let address = ptr.as_ptr() as usize;
        free(address).expect("free of a live allocation should succeed");
    }

    #[test]
    fn double_free_is_rejected() {
        heap_init().expect("heap_init should succeed under test");
        let ptr = allocate(32).expect("allocate should succeed");
        let address = ptr.as_ptr() as usize;
        free(address).expect("first free should succeed");
        assert_eq!(free(address), Err(HeapError::NotAllocated { address }));
    }

    #[test]
    fn address_outside_region_is_rejected() {
        heap_init().expect("heap_init should succeed under test");
        let bogus = HEAP.lock().base.wrapping_sub(4096);
        assert_eq!(free(bogus), Err(HeapError::OutOfRange { address: bogus }));
    }

    #[test]
    fn coalescing_reunites_a_split_block() {
        heap_init().expect("heap_init should succeed under test");
        let a = allocate(256).expect("allocate a");
        let b = allocate(256).expect("allocate b");
        let a_addr = a.as_ptr() as usize;
        let b_addr = b.as_ptr() as usize;
        free(a_addr).expect("free a");
        free(b_addr).expect("free b");
        // Requesting something close to the combined size should succeed
        // without forcing the region to grow again.
        let before_end = HEAP.lock().end;
        let _ = allocate(400).expect("allocate after coalesce");
        assert_eq!(HEAP.lock().end, before_end);
    }

    #[test]
    fn freeing_then_reallocating_the_same_size_reuses_the_slot() {
        heap_init().expect("heap_init should succeed under test");
        let first = allocate(400).expect("allocate first");
        free(first.as_ptr() as usize).expect("free first");
        let second = allocate(400).expect("allocate second");
        assert_eq!(first, second);
        free(second.as_ptr() as usize).expect("free second");
    }

    #[test]
    fn freeing_a_middle_block_lets_an_equal_size_request_reuse_its_slot() {
        heap_init().expect("heap_init should succeed under test");
        let a = allocate(400).expect("allocate a");
        let b = allocate(200).expect("allocate b");
        let c = allocate(800).expect("allocate c");
        let d = allocate(280).expect("allocate d");
        free(b.as_ptr() as usize).expect("free b");
        free(d.as_ptr() as usize).expect("free d");
        let reused = allocate(200).expect("allocate 200 after freeing b and d");
        assert_eq!(reused, b, "first-fit in b's class must hand back b's own slot");
        free(a.as_ptr() as usize).unwrap();
        free(c.as_ptr() as usize).unwrap();
        free(reused.as_ptr() as usize).unwrap();
    }

    #[test]
    fn splitting_lets_a_thousand_round_trips_fit_in_the_first_peak_extent() {
        heap_init().expect("heap_init should succeed under test");
        let mut live: Vec<NonNull<u8>> = (0..1000)
            .map(|_| allocate(1000).expect("initial allocation should succeed"))
            .collect();
        let peak_after_fill = HEAP.lock().end;

        for (i, ptr) in live.iter().enumerate() {
            if i % 2 == 0 {
                free(ptr.as_ptr() as usize).expect("free of every other block should succeed");
            }
        }

        let mut refill = Vec::new();
        for i in 0..500 {
            let ptr = allocate(1000).expect("refill allocation should succeed");
            refill.push(ptr);
            live[i * 2] = ptr;
        }

        assert_eq!(HEAP.lock().end, peak_after_fill, "reuse of freed slots must not regrow the region");

        for ptr in live {
            let _ = free(ptr.as_ptr() as usize);
        }
    }

    #[test]
    fn freeing_a_stack_address_fails_without_crashing() {
        heap_init().expect("heap_init should succeed under test");
        let local = 0u64;
        let stack_address = &local as *const u64 as usize;
        assert_eq!(free(stack_address), Err(HeapError::OutOfRange { address: stack_address }));

        // Allocator state must be unaffected: a normal request still works.
        let ptr = allocate(64).expect("allocate after rejected free");
        free(ptr.as_ptr() as usize).expect("free of the real allocation should succeed");
    }
}
