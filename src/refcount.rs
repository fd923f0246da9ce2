// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Reference counting, layered on top of either engine.
//!
//! A refcounted block is an ordinary heap or mapping block with its
//! `ref_count`/`destructor` fields in use. Which engine owns a given
//! address is decided the same way [`crate::router::free`] decides it: by
//! reading the magic tag, never by the caller declaring it up front.

use crate::config::HEADER_SIZE;
use crate::header::{BlockHeader, HEAP_ALLOCATED, MAPPING_ALLOCATED};
use crate::router::{self, ALLOC_FAIL, DEALLOC_FAIL};
use crate::{heap, mapping};

type Destructor = Box<dyn FnMut(*mut u8) + Send>;

fn magic_at(address: usize) -> Option<u32> {
    let header_addr = address.checked_sub(HEADER_SIZE)?;
    // SAFETY: same best-effort read router::free relies on; a pointer this
    // allocator never produced can still crash here.
    Some(unsafe { (*(header_addr as *const BlockHeader)).magic })
}

/// Allocate `size` bytes with an initial reference count of one, recording
/// `destructor` to run when the count returns to zero.
pub fn reference_allocate(size: usize, destructor: Option<Destructor>) -> *mut u8 {
    let ptr = router::allocate(size);
    if ptr.is_null() || ptr == ALLOC_FAIL {
        return ptr;
    }
    let address = ptr as usize;
    match magic_at(address) {
        Some(HEAP_ALLOCATED) => {
            debug_assert!(heap::retain(address).is_ok(), "a block just allocated must be retainable");
            if let Some(d) = destructor {
                let _ = heap::set_destructor(address, d);
            }
        }
        Some(MAPPING_ALLOCATED) => {
            debug_assert!(mapping::retain(address).is_ok(), "a block just allocated must be retainable");
            if let Some(d) = destructor {
                let _ = mapping::set_destructor(address, d);
            }
        }
        _ => unreachable!("router::allocate always returns a freshly tagged block"),
    }
    ptr
}

/// Increment the reference count of the block at `payload`.
///
/// A `payload` that is not a live, refcounted allocation is logged and
/// otherwise ignored, matching the original contract's "detected, not
/// propagated as a return value" treatment of retain-side errors.
pub fn retain(payload: *mut u8) {
    if payload.is_null() {
        return;
    }
    let address = payload as usize;
    let result = match magic_at(address) {
        Some(HEAP_ALLOCATED) => heap::retain(address).map(|_| ()).map_err(|e| e.to_string()),
        Some(MAPPING_ALLOCATED) => mapping::retain(address).map(|_| ()).map_err(|e| e.to_string()),
        _ => Err(format!("address {:#x} is not a recognized allocation", address)),
    };
    if let Err(message) = result {
        log::warn!("refcount: retain of {:#x} failed: {}", address, message);
    }
}

/// Decrement the reference count of the block at `payload`. When it
/// reaches zero, runs the destructor (if one was set) and frees the block.
///
/// The decrement happens under the owning engine's lock; the destructor
/// and the subsequent free both happen after that lock has been released,
/// so a destructor that itself allocates or frees cannot deadlock against
/// the decrement it is the result of.
///
/// Returns null on success (block still live, or freed), or
/// [`DEALLOC_FAIL`] if `payload` was not a live, refcounted allocation.
pub fn release(payload: *mut u8) -> *mut u8 {
    if payload.is_null() {
        return std::ptr::null_mut();
    }
    let address = payload as usize;

    match magic_at(address) {
        Some(HEAP_ALLOCATED) => match heap::release_decrement(address) {
            Ok((0, destructor)) => {
                if let Some(mut run) = destructor {
                    run(payload);
                }
                router::free(payload);
                std::ptr::null_mut()
            }
            Ok(_) => std::ptr::null_mut(),
            Err(e) => {
                log::warn!("refcount: release of {:#x} failed: {}", address, e);
                DEALLOC_FAIL
            }
        },
        Some(MAPPING_ALLOCATED) => match mapping::release_decrement(address) {
            Ok((0, destructor)) => {
                if let Some(mut run) = destructor {
                    run(payload);
                }
                router::free(payload);
                std::ptr::null_mut()
            }
            Ok(_) => std::ptr::null_mut(),
            Err(e) => {
                log::warn!("refcount: release of {:#x} failed: {}", address, e);
                DEALLOC_FAIL
            }
        },
        _ => DEALLOC_FAIL,
    }
}

/// Current reference count of the block at `payload`, or zero if it is not
/// a live, refcounted allocation.
pub fn reference_count(payload: *mut u8) -> usize {
    if payload.is_null() {
        return 0;
    }
    let address = payload as usize;
    match magic_at(address) {
        Some(HEAP_ALLOCATED) => heap::reference_count(address).unwrap_or(0),
        Some(MAPPING_ALLOCATED) => mapping::reference_count(address).unwrap_or(0),
        _ => 0,
    }
}

/// Walk both engines' all-blocks chains and return the number of live
/// blocks that still carry a nonzero reference count.
///
/// Intended as a leak diagnostic: called when a caller expects every
/// refcounted block it handed out to have been released, a nonzero result
/// names how many were not.
pub fn verify_reference_counting() -> usize {
    heap::count_live_refs() + mapping::count_live_refs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_allocate_starts_at_one() {
        let ptr = reference_allocate(64, None);
        assert_ne!(ptr, ALLOC_FAIL);
        assert_eq!(reference_count(ptr), 1);
        assert!(release(ptr).is_null());
    }

    #[test]
    fn retain_increments_and_release_decrements() {
        let ptr = reference_allocate(64, None);
        retain(ptr);
        assert_eq!(reference_count(ptr), 2);
        assert!(release(ptr).is_null());
        assert_eq!(reference_count(ptr), 1);
        assert!(release(ptr).is_null());
    }

    #[test]
    fn destructor_runs_exactly_once_on_final_release() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let ptr = reference_allocate(
            64,
            Some(Box::new(move |_| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );
        retain(ptr);

        assert!(release(ptr).is_null());
        assert_eq!(calls.load(Ordering::SeqCst), 0, "destructor must not run before the last release");

        assert!(release(ptr).is_null());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_of_unrecognized_address_fails() {
        // A real, mapped address that the allocator never produced: enough
        // bytes before it to read a header-shaped region without faulting,
        // but with a magic tag that can't match either engine's live tag.
        let local = 0u64;
        let bogus = (&local as *const u64 as usize) + 64;
        assert_eq!(release(bogus as *mut u8), DEALLOC_FAIL);
    }

    #[test]
    fn verify_reference_counting_survives_multiple_live_mappings() {
        // Regression test for the mapping-chain walk: with more than one
        // live mapping present, a walk that never advances would spin
        // forever instead of returning.
        let a = reference_allocate(crate::config::MAX_HEAP_ALLOC + 1, None);
        let b = reference_allocate(crate::config::MAX_HEAP_ALLOC + 1, None);
        assert!(verify_reference_counting() >= 2);
        assert!(release(a).is_null());
        assert!(release(b).is_null());
    }
}
