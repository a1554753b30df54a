//! Attribute/option flags shared by [`crate::region::Region`] registration
//! and allocation requests.
//!
//! The low 16 bits are *requirement* bits: they describe what a region
//! offers (on [`Region::attrs`](crate::region::Region)) and what a request
//! needs (on the `flags` argument of [`crate::allocator::Allocator::alloc`]
//! and friends). The high bits are *options*: they only make sense on a
//! request and never describe a region.

use bitflags::bitflags;

bitflags! {
    /// Combined requirement/option flags, matching the Amiga `MEMF_*` space.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct AllocFlags: u32 {
        /// Region is usable by any client (the common case).
        const PUBLIC = 1 << 0;
        /// Region is on a fast memory bus.
        const FAST = 1 << 1;
        /// Region is video-adapter memory.
        const VIDEO = 1 << 2;
        /// Region backs virtual (paged) memory.
        const VIRTUAL = 1 << 3;
        /// Region is never reclaimed by the system.
        const PERMANENT = 1 << 4;

        /// Zero the returned block before handing it back.
        const CLEAR = 1 << 16;
        /// Search the freelist from the top and carve from the back.
        const REVERSE = 1 << 17;
        /// Query option: report the largest single free chunk.
        const LARGEST = 1 << 18;
        /// Query option: report total (not just free) capacity.
        const TOTAL = 1 << 19;
        /// Interpret the location argument as an alignment exponent.
        const ALIGN = 1 << 20;
        /// Skip the handler chain on allocation failure.
        const NO_EXPUNGE = 1 << 21;
    }
}

/// Mask isolating the requirement bits (low 16) from the option bits.
pub const MASK_REQ: u32 = 0x0000_FFFF;

impl AllocFlags {
    /// No requirements: matches every region.
    pub const ANY: Self = Self::empty();

    /// True iff a region advertising `self` (as its `attrs`) satisfies a
    /// request for `request` — `(attrs & request & MASK_REQ) == (request & MASK_REQ)`.
    #[must_use]
    pub fn satisfies(self, request: Self) -> bool {
        let req_bits = request.bits() & MASK_REQ;
        (self.bits() & request.bits() & MASK_REQ) == req_bits
    }

    /// Just the requirement bits, discarding any options that were set.
    #[must_use]
    pub fn requirements(self) -> Self {
        Self::from_bits_truncate(self.bits() & MASK_REQ)
    }
}
