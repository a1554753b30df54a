//! Batch (`MemEntries`) allocation: an all-or-nothing helper over repeated
//! calls to [`Allocator::alloc`](crate::allocator::Allocator::alloc).

use crate::flags::AllocFlags;
use std::ptr::NonNull;

/// One request within a batch allocation.
#[derive(Debug, Clone, Copy)]
pub struct MemEntry {
    /// Requirement/option flags for this entry, as passed to `alloc`.
    pub reqs: AllocFlags,
    /// Requested size in bytes.
    pub size: usize,
}

/// The address handed back for one successfully satisfied [`MemEntry`].
#[derive(Debug, Clone, Copy)]
pub struct MemEntryResult {
    /// The allocated block.
    pub addr: NonNull<u8>,
    /// The size that was actually allocated for it (after rounding).
    pub size: usize,
}
