//! Typed error channel for the handful of allocator operations with more
//! than one failure mode worth naming to the caller.
//!
//! The hot allocation/free paths use a "soft failure" channel
//! (`Option<NonNull<u8>>`, no error payload) and a "programming fault"
//! channel (`panic!`/`assert!`) for invariant violations.
//! [`AllocatorError`] covers the remainder: region (de)registration and
//! batch application, where the caller benefits from knowing *why* an
//! operation didn't proceed.

/// Errors surfaced by [`Allocator`](crate::allocator::Allocator) operations
/// outside the hot alloc/free path.
#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    /// `remove_region` was called on a region that still has outstanding
    /// allocations (`free != total`).
    #[error("region {name:?} still has {outstanding} of {total} bytes allocated")]
    RegionBusy {
        /// The region's registered name.
        name: String,
        /// Bytes currently allocated from the region (`total - free`).
        outstanding: usize,
        /// The region's total usable capacity.
        total: usize,
    },
    /// The region handle passed to `remove_region` doesn't belong to this
    /// allocator (already removed, or from a different `Allocator`).
    #[error("region handle does not belong to this allocator")]
    UnknownRegion,
    /// The handler handle passed to `remove_handler` doesn't belong to this
    /// allocator (already removed, or from a different `Allocator`).
    #[error("handler handle does not belong to this allocator")]
    UnknownHandler,
    /// A batch entry's requested address range overlapped an existing
    /// allocation or fell outside every registered region.
    #[error("batch entry {index} (size {size}) could not be satisfied")]
    EntryFailed {
        /// Index of the failing entry within the batch.
        index: usize,
        /// The entry's requested size.
        size: usize,
    },
}
