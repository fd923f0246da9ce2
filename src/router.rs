// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Size-threshold router in front of the two engines.
//!
//! This is the only module client code is expected to call directly. It
//! decides which engine serves an allocation based on size, and which
//! engine owns a pointer at free time by checking whether the address
//! falls inside the heap engine's region, rather than asking the caller
//! to remember.

use std::sync::OnceLock;

use crate::config::MAX_HEAP_ALLOC;
use crate::{heap, mapping};

/// Returned by [`allocate`] when neither engine could satisfy the request.
pub const ALLOC_FAIL: *mut u8 = usize::MAX as *mut u8;
/// Returned by [`free`] when the address did not belong to a live
/// allocation in either engine.
pub const DEALLOC_FAIL: *mut u8 = (usize::MAX - 1) as *mut u8;

static INIT: OnceLock<()> = OnceLock::new();

/// Bring both engines up. Safe to call more than once or concurrently;
/// only the first caller does any work.
pub fn init() {
    INIT.get_or_init(|| {
        if let Err(e) = heap::heap_init() {
            log::error!("router: heap engine failed to initialize: {}", e);
        }
        mapping::mapping_init();
        log::trace!("router: initialized (heap threshold = {} bytes)", MAX_HEAP_ALLOC);
    });
}

/// Allocate `size` bytes, routing to the heap engine at or below
/// [`MAX_HEAP_ALLOC`] and to the mapping engine above it.
///
/// Returns [`ALLOC_FAIL`] if the request could not be satisfied. A `size`
/// of zero is not an error: it returns null without touching either
/// engine.
pub fn allocate(size: usize) -> *mut u8 {
    if size == 0 {
        return std::ptr::null_mut();
    }
    init();

    if size <= MAX_HEAP_ALLOC {
        match heap::allocate(size) {
            Ok(ptr) => ptr.as_ptr(),
            Err(e) => {
                log::warn!("router: heap allocation of {} bytes failed: {}", size, e);
                ALLOC_FAIL
            }
        }
    } else {
        match mapping::allocate_mapping(size) {
            Ok(ptr) => ptr.as_ptr(),
            Err(e) => {
                log::warn!("router: mapping allocation of {} bytes failed: {}", size, e);
                ALLOC_FAIL
            }
        }
    }
}

/// Free the block at `payload`, discovering its owning engine by asking the
/// heap engine whether `payload` falls inside its region.
///
/// `payload == null` is a no-op, matching `free(NULL)`. Returns
/// [`DEALLOC_FAIL`] if `payload` is not a live allocation in either engine
/// (double free, corrupted tag, or a pointer this allocator never produced).
pub fn free(payload: *mut u8) -> *mut u8 {
    if payload.is_null() {
        return std::ptr::null_mut();
    }

    let address = payload as usize;

    // `in_heap_range` is a pair of integer comparisons under the heap
    // engine's lock; it never dereferences `address`. Only once the engine
    // is known do we hand the address to that engine's own `free`, which
    // validates the header itself before touching it.
    if heap::in_heap_range(address) {
        return match heap::free(address) {
            Ok(()) => std::ptr::null_mut(),
            Err(e) => {
                log::warn!("router: free of {:#x} failed: {}", address, e);
                DEALLOC_FAIL
            }
        };
    }

    match mapping::free_mapping(address) {
        Ok(()) => std::ptr::null_mut(),
        Err(e) => {
            log::warn!("router: free of {:#x} failed: {}", address, e);
            DEALLOC_FAIL
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_request_round_trips_through_heap() {
        // Initializing env_logger here, as opposed to in every test, is
        // enough to surface the `log` calls this module (and the engines
        // it drives) make during `cargo test -- --nocapture`.
        let _ = env_logger::try_init();
        let ptr = allocate(128);
        assert_ne!(ptr, ALLOC_FAIL);
        assert!(free(ptr).is_null());
    }

    #[test]
    fn large_request_round_trips_through_mapping() {
        let ptr = allocate(MAX_HEAP_ALLOC + 1);
        assert_ne!(ptr, ALLOC_FAIL);
        assert!(free(ptr).is_null());
    }

    #[test]
    fn freeing_null_is_a_no_op() {
        assert!(free(std::ptr::null_mut()).is_null());
    }

    #[test]
    fn zero_size_request_returns_null() {
        assert!(allocate(0).is_null());
    }

    #[test]
    fn threshold_boundary_picks_heap_just_above_picks_mapping() {
        let at_threshold = allocate(MAX_HEAP_ALLOC);
        assert_ne!(at_threshold, ALLOC_FAIL);
        let above_threshold = allocate(MAX_HEAP_ALLOC + 1);
        assert_ne!(above_threshold, ALLOC_FAIL);
        assert!(free(at_threshold).is_null());
        assert!(free(above_threshold).is_null());
    }

    #[test]
    fn double_free_reports_failure() {
        let ptr = allocate(64);
        assert!(free(ptr).is_null());
        assert_eq!(free(ptr), DEALLOC_FAIL);
    }
}
