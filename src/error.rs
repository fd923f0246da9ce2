// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Internal error types for the two engines.
//!
//! Neither type crosses the public API: the router and refcount layer match
//! on these to decide what sentinel address to hand back and what to log,
//! but callers only ever see `ALLOC_FAIL`/`DEALLOC_FAIL`/`null`.

use std::fmt;

/// Failure modes of the heap engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// `sbrk` refused to grow the region (returned `(void *) -1`).
    RegionGrowthFailed,
    /// The requested size, after header rounding, overflowed `usize`.
    SizeOverflow,
    /// `free` was given an address that does not point at a live heap block.
    NotAllocated { address: usize },
    /// `free` was given an address outside the heap region entirely.
    OutOfRange { address: usize },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::RegionGrowthFailed => write!(f, "sbrk failed to grow the heap region"),
            HeapError::SizeOverflow => write!(f, "requested size overflows after header rounding"),
            HeapError::NotAllocated { address } => {
                write!(f, "address {:#x} is not a live heap allocation", address)
            }
            HeapError::OutOfRange { address } => {
                write!(f, "address {:#x} falls outside the heap region", address)
            }
        }
    }
}

impl std::error::Error for HeapError {}

/// Failure modes of the mapping engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingError {
    /// `mmap` returned `MAP_FAILED`.
    MapFailed,
    /// `munmap` returned nonzero.
    UnmapFailed { address: usize },
    /// `free` was given an address that isn't a block this engine produced.
    NotAllocated { address: usize },
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingError::MapFailed => write!(f, "mmap failed to create a new mapping"),
            MappingError::UnmapFailed { address } => {
                write!(f, "munmap failed for mapping at {:#x}", address)
            }
            MappingError::NotAllocated { address } => {
                write!(f, "address {:#x} is not a live mapping allocation", address)
            }
        }
    }
}

impl std::error::Error for MappingError {}
