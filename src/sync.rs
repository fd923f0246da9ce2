// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The lock primitive behind both engines' global state.
//!
//! Swapped out entirely by the `thread-safe` feature rather than branching
//! at runtime: with it enabled, [`Mutex`] is `spin::Mutex`, for the reason
//! given in `heap`'s module docs. With it disabled, a single-threaded
//! client pays nothing for synchronization it doesn't need — no atomic, no
//! spin loop, just a cell.

#[cfg(feature = "thread-safe")]
pub use spin::Mutex;

#[cfg(not(feature = "thread-safe"))]
pub use single_threaded::Mutex;

#[cfg(not(feature = "thread-safe"))]
mod single_threaded {
    use std::cell::UnsafeCell;
    use std::ops::{Deref, DerefMut};

    /// A lock that does no locking.
    ///
    /// Sound only because `thread-safe` being disabled is an explicit
    /// opt-in: the caller is asserting this allocator is never reached from
    /// more than one thread. Nothing here enforces that assertion.
    pub struct Mutex<T> {
        inner: UnsafeCell<T>,
    }

    // SAFETY: see the assertion above; this impl is the whole point of the
    // `thread-safe` feature existing.
    unsafe impl<T> Sync for Mutex<T> {}

    impl<T> Mutex<T> {
        pub const fn new(value: T) -> Self {
            Mutex { inner: UnsafeCell::new(value) }
        }

        pub fn lock(&self) -> MutexGuard<'_, T> {
            MutexGuard { inner: &self.inner }
        }
    }

    pub struct MutexGuard<'a, T> {
        inner: &'a UnsafeCell<T>,
    }

    impl<'a, T> Deref for MutexGuard<'a, T> {
        type Target = T;
        fn deref(&self) -> &T {
            // SAFETY: single-threaded by the caller's own assertion, so no
            // concurrent access to the cell is possible.
            unsafe { &*self.inner.get() }
        }
    }

    impl<'a, T> DerefMut for MutexGuard<'a, T> {
        fn deref_mut(&mut self) -> &mut T {
            // SAFETY: same as `deref`.
            unsafe { &mut *self.inner.get() }
        }
    }
}
