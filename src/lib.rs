// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! A segregated-free-list process allocator.
//!
//! Small and medium requests are served from a contiguous heap region
//! grown with `sbrk` and organized into segregated size-class free lists
//! ([`heap`]); requests above [`config::MAX_HEAP_ALLOC`] get their own
//! anonymous `mmap` region instead ([`mapping`]). [`router`] picks between
//! the two and is the module most callers want. An optional reference
//! counting layer ([`refcount`], behind the `reference-counting` feature)
//! decorates blocks from either engine with a count and a destructor.
//!
//! This is a userspace allocator you call explicitly, not a
//! `#[global_allocator]` drop-in: it has no knowledge of `Layout` alignment
//! beyond the header's own alignment, and its addresses are plain `usize`s
//! passed around as `*mut u8`.

pub mod config;
pub mod error;
pub mod header;
pub mod heap;
pub mod mapping;
pub mod router;
mod sync;

#[cfg(feature = "reference-counting")]
pub mod refcount;

pub use router::{allocate, free, init, ALLOC_FAIL, DEALLOC_FAIL};

#[cfg(feature = "reference-counting")]
pub use refcount::{reference_allocate, reference_count, release, retain, verify_reference_counting};
