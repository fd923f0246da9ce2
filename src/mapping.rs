// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The mmap-backed large-allocation engine.
//!
//! Unlike the heap engine, a mapping block is never split, coalesced, or
//! kept around once freed: each request gets its own anonymous, page
//! -rounded mapping, and freeing one unmaps it immediately. The all-blocks
//! chain exists only so the `debugger` feature can verify a pointer is
//! really ours before trusting it.

use std::ptr::NonNull;

use crate::error::MappingError;
use crate::header::{BlockHeader, MAPPING_ALLOCATED, MAPPING_FREED};
use crate::sync::Mutex;

struct MappingState {
    head: Option<NonNull<BlockHeader>>,
    tail: Option<NonNull<BlockHeader>>,
    page_size: usize,
}

unsafe impl Send for MappingState {}

impl MappingState {
    const fn new() -> Self {
        MappingState { head: None, tail: None, page_size: 0 }
    }
}

static MAPPING: Mutex<MappingState> = Mutex::new(MappingState::new());

/// Discover the page size once. Safe to call repeatedly; only the first
/// call pays for the `sysconf` round trip.
pub fn mapping_init() {
    let mut state = MAPPING.lock();
    if state.page_size == 0 {
        // SAFETY: sysconf with _SC_PAGESIZE has no preconditions.
        state.page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    }
}

fn round_to_page(size: usize, page_size: usize) -> usize {
    (size + page_size - 1) & !(page_size - 1)
}

fn header_size() -> usize {
    std::mem::size_of::<BlockHeader>()
}

/// Map a fresh anonymous region large enough for `size` payload bytes.
pub fn allocate_mapping(size: usize) -> Result<NonNull<u8>, MappingError> {
    let mut state = MAPPING.lock();
    if state.page_size == 0 {
        state.page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    }

    let total = header_size() + size;
    let mapped_len = round_to_page(total, state.page_size);

    // SAFETY: a fixed, well-formed set of mmap arguments requesting a fresh
    // private anonymous mapping; the result is checked for MAP_FAILED below.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            mapped_len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        log::warn!("mapping: mmap failed for {} bytes", mapped_len);
        return Err(MappingError::MapFailed);
    }

    let mut block = unsafe { NonNull::new_unchecked(addr as *mut BlockHeader) };
    unsafe {
        block.as_mut().size = mapped_len - header_size();
        block.as_mut().magic = MAPPING_ALLOCATED;
        block.as_mut().next = None;
        block.as_mut().prev = state.tail;
        block.as_mut().next_free = None;
        block.as_mut().prev_free = None;
        #[cfg(feature = "reference-counting")]
        {
            block.as_mut().ref_count = 0;
            block.as_mut().destructor = None;
        }
    }

    if let Some(mut tail) = state.tail {
        unsafe { tail.as_mut().next = Some(block) };
    } else {
        state.head = Some(block);
    }
    state.tail = Some(block);

    log::trace!("mapping: created {} byte mapping at {:p}", mapped_len, addr);
    Ok(BlockHeader::payload_ptr(block))
}

/// Returns whether `block` is currently reachable from the all-blocks
/// chain. Only used under the `debugger` feature, where the cost of a
/// linear scan on every free is accepted in exchange for catching a
/// pointer that didn't come from this engine.
#[cfg(feature = "debugger")]
fn chain_contains(state: &MappingState, block: NonNull<BlockHeader>) -> bool {
    let mut current = state.head;
    while let Some(node) = current {
        if node == block {
            return true;
        }
        current = unsafe { node.as_ref().next };
    }
    false
}

fn unlink(state: &mut MappingState, block: NonNull<BlockHeader>) {
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

/// Unmap the block at `address`.
///
/// In production this trusts the candidate address and unlinks directly,
/// exactly as the non-`debugger` C original does. There is no range check
/// analogous to the heap engine's `[base, end)` extent to validate a
/// mapping address against, so a garbage pointer or a second free of an
/// already-`munmap`'d block is unrecoverable UB here, same as libc's
/// `free()` on a bad pointer. With the `debugger` feature, the all-blocks
/// chain walk runs first and turns that UB into a graceful error for any
/// pointer that didn't come from this engine.
pub fn free_mapping(address: usize) -> Result<(), MappingError> {
    let mut state = MAPPING.lock();
    let header_addr = address.saturating_sub(header_size());
    let mut block = unsafe { NonNull::new_unchecked(header_addr as *mut BlockHeader) };

    #[cfg(feature = "debugger")]
    {
        if !chain_contains(&state, block) {
            return Err(MappingError::NotAllocated { address });
        }
        if unsafe { block.as_ref().magic } != MAPPING_ALLOCATED {
            return Err(MappingError::NotAllocated { address });
        }
    }

    unlink(&mut state, block);
    let mapped_len = header_size() + unsafe { block.as_ref().size };
    unsafe { block.as_mut().magic = MAPPING_FREED };

    let base = block.as_ptr() as *mut libc::c_void;
    // SAFETY: base/mapped_len describe exactly the mapping this block owns.
    let result = unsafe { libc::munmap(base, mapped_len) };
    if result != 0 {
        log::error!("mapping: munmap failed for block at {:#x}", address);
        return Err(MappingError::UnmapFailed { address });
    }

    Ok(())
}

/// Borrow the mapping-engine block at `address` under the engine lock just
/// long enough to run `f`. See [`crate::heap`]'s twin of this function for
/// why the lock must not still be held once `f` returns to its caller.
#[cfg(feature = "reference-counting")]
fn with_block<R>(address: usize, f: impl FnOnce(&mut BlockHeader) -> R) -> Result<R, MappingError> {
    let mut state = MAPPING.lock();
    let header_addr = address.checked_sub(header_size()).ok_or(MappingError::NotAllocated { address })?;
    let mut block = unsafe { NonNull::new_unchecked(header_addr as *mut BlockHeader) };
    if unsafe { block.as_ref().magic } != MAPPING_ALLOCATED {
        return Err(MappingError::NotAllocated { address });
    }
    let _keep_locked = &mut state;
    Ok(f(unsafe { block.as_mut() }))
}

/// Under `debugger`, a count already at `usize::MAX` is left untouched and
/// logged rather than wrapped.
#[cfg(feature = "reference-counting")]
pub(crate) fn retain(address: usize) -> Result<usize, MappingError> {
    with_block(address, |block| {
        #[cfg(feature = "debugger")]
        if block.ref_count == usize::MAX {
            log::error!("mapping: reference count overflow for block at {:#x}", address);
            return block.ref_count;
        }
        block.ref_count += 1;
        block.ref_count
    })
}

#[cfg(feature = "reference-counting")]
pub(crate) fn reference_count(address: usize) -> Result<usize, MappingError> {
    with_block(address, |block| block.ref_count)
}

#[cfg(feature = "reference-counting")]
pub(crate) fn set_destructor(
    address: usize,
    destructor: Box<dyn FnMut(*mut u8) + Send>,
) -> Result<(), MappingError> {
    with_block(address, |block| block.destructor = Some(destructor))
}

#[cfg(feature = "reference-counting")]
pub(crate) fn release_decrement(
    address: usize,
) -> Result<(usize, Option<Box<dyn FnMut(*mut u8) + Send>>), MappingError> {
    with_block(address, |block| {
        block.ref_count = block.ref_count.saturating_sub(1);
        if block.ref_count == 0 {
            (0, block.destructor.take())
        } else {
            (block.ref_count, None)
        }
    })
}

/// Count live mapping blocks that still carry a nonzero reference count.
///
/// The walk must advance `current` on every iteration; an earlier revision
/// of this check read `current` once and looped on it forever whenever the
/// mapping engine held more than one live block.
#[cfg(feature = "reference-counting")]
pub(crate) fn count_live_refs() -> usize {
    let state = MAPPING.lock();
    let mut current = state.head;
    let mut count = 0;
    while let Some(block) = current {
        let header = unsafe { block.as_ref() };
        if header.magic == MAPPING_ALLOCATED && header.ref_count > 0 {
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
    fn allocate_and_free_round_trip() {
        mapping_init();
        let ptr = allocate_mapping(4096 * 3).expect("allocate_mapping should succeed");
        let address = ptr.as_ptr() as usize;
        free_mapping(address).expect("free_mapping of a live mapping should succeed");
    }

    // Without the debugger feature, a second free on a mapping block reads
    // memory already returned to the OS by the first munmap: unrecoverable
    // UB, matching the non-debugger C original, not something this engine
    // can catch. Only under `debugger` does the chain walk make it safe to
    // assert a graceful error instead of crashing the test binary.
    #[cfg(feature = "debugger")]
    #[test]
    fn double_free_is_rejected() {
        mapping_init();
        let ptr = allocate_mapping(128).expect("allocate_mapping should succeed");
        let address = ptr.as_ptr() as usize;
        free_mapping(address).expect("first free should succeed");
        assert_eq!(free_mapping(address), Err(MappingError::NotAllocated { address }));
    }

    #[test]
    fn each_allocation_gets_its_own_mapping() {
        mapping_init();
        let a = allocate_mapping(200_000).expect("allocate a");
        let b = allocate_mapping(200_000).expect("allocate b");
        assert_ne!(a.as_ptr(), b.as_ptr());
        free_mapping(a.as_ptr() as usize).unwrap();
        free_mapping(b.as_ptr() as usize).unwrap();
    }
}
