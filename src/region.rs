//! The per-region freelist allocator (L1).
//!
//! A [`Region`] manages one contiguous byte range handed to it by
//! [`Allocator::add_region`](crate::allocator::Allocator::add_region) as a
//! `Box<[u8]>`. Free space inside that range is tracked by an
//! address-ordered, non-adjacent chain of [`FreeChunk`] headers written
//! directly into the free bytes themselves — the freelist costs nothing
//! beyond the bytes it already owns, same as the Amiga original.
//!
//! Unlike the original, the `Region` bookkeeping struct itself (attrs,
//! name, bounds, the freelist head) lives outside the managed buffer: the
//! C allocator plants its `MemHeader` at the front of the region and eats
//! the space, but doing the same here would mean scattering `unsafe`
//! reads of a caller-owned byte buffer to get at our own struct fields.
//! Keeping it separate costs a small heap allocation per region and makes
//! every byte of the supplied buffer available to callers.

use crate::flags::AllocFlags;
use crate::intrusive_list::{Link, Linked, List};
use crate::{ALLOC_FILL, BLOCK_MASK, BLOCK_SIZE, FREE_FILL, round_down_block, round_up_block};
use std::ptr::{self, NonNull};

/// A maximal run of free bytes inside a [`Region`], linked into its
/// freelist. Lives inside the free memory it describes.
///
/// Invariant: `bytes` is a multiple of [`BLOCK_SIZE`] and at least
/// [`FreeChunk::MIN_BYTES`].
#[repr(C)]
pub(crate) struct FreeChunk {
    link: Link,
    bytes: usize,
}

unsafe impl Linked for FreeChunk {}

impl FreeChunk {
    /// Smallest chunk size that can hold a `FreeChunk` header, rounded up
    /// to the block quantum.
    pub(crate) const MIN_BYTES: usize = round_up_block(size_of::<FreeChunk>());

    /// Write a fresh `FreeChunk` header at `addr`, covering `bytes` total.
    ///
    /// # Safety
    /// `[addr, addr + bytes)` must be valid, writable, unaliased memory,
    /// `addr` must be `BLOCK_SIZE`-aligned, and `bytes >= FreeChunk::MIN_BYTES`.
    unsafe fn write_at(addr: NonNull<u8>, bytes: usize) -> NonNull<FreeChunk> {
        debug_assert_eq!(addr.as_ptr() as usize & BLOCK_MASK, 0);
        debug_assert!(bytes >= Self::MIN_BYTES);
        let ptr = addr.cast::<FreeChunk>();
        unsafe {
            ptr::write(
                ptr.as_ptr(),
                FreeChunk {
                    link: Link::unlinked(),
                    bytes,
                },
            );
        }
        ptr
    }

    fn addr(this: NonNull<FreeChunk>) -> usize {
        this.as_ptr() as usize
    }

    fn end(this: NonNull<FreeChunk>) -> usize {
        Self::addr(this) + unsafe { this.as_ref() }.bytes
    }

    fn bytes(this: NonNull<FreeChunk>) -> usize {
        unsafe { this.as_ref() }.bytes
    }
}

/// A contiguous byte range under management, with tagged attributes.
///
/// Intrusively linked into the [`Allocator`](crate::allocator::Allocator)'s
/// region list, sorted by descending priority.
#[repr(C)]
pub struct Region {
    link: Link,
    storage: Box<[u8]>,
    attrs: AllocFlags,
    priority: i16,
    name: String,
    lower: usize,
    upper: usize,
    total: usize,
    free: usize,
    freelist: List<FreeChunk>,
    debug_fill: bool,
}

unsafe impl Linked for Region {}

impl Region {
    /// Build a region managing `storage`, rounding the usable range inward
    /// to `BLOCK_SIZE` boundaries (the supplied buffer need not itself be
    /// block-aligned; a handful of bytes at each end may be sacrificed to
    /// alignment).
    pub(crate) fn new(
        mut storage: Box<[u8]>,
        attrs: AllocFlags,
        priority: i16,
        name: String,
        debug_fill: bool,
    ) -> Self {
        let base = storage.as_mut_ptr() as usize;
        let len = storage.len();
        let lower = round_up_block(base);
        let upper = round_down_block(base + len);
        let usable = upper.saturating_sub(lower);
        let mut freelist = List::new();
        let total = if usable >= FreeChunk::MIN_BYTES {
            let addr = NonNull::new(lower as *mut u8).expect("non-null region base");
            let chunk = unsafe { FreeChunk::write_at(addr, usable) };
            unsafe { freelist.push_back(chunk) };
            usable
        } else {
            0
        };
        log::debug!(
            "region {name:?}: base={base:#x} len={len} usable={total} attrs={attrs:?} priority={priority}"
        );
        Self {
            link: Link::unlinked(),
            storage,
            attrs,
            priority,
            name,
            lower,
            upper,
            total,
            free: total,
            freelist,
            debug_fill,
        }
    }

    pub(crate) fn attrs(&self) -> AllocFlags {
        self.attrs
    }

    pub(crate) fn priority(&self) -> i16 {
        self.priority
    }

    /// The region's registered name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total usable capacity, fixed at construction.
    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    /// Bytes currently free.
    #[must_use]
    pub fn free(&self) -> usize {
        self.free
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.lower <= addr && addr < self.upper
    }

    /// Recover the region's supplied storage. Only meaningful once the
    /// region has been unlinked from its allocator.
    pub(crate) fn into_storage(self) -> Box<[u8]> {
        self.storage
    }

    /// Sum of every free chunk's `bytes`, for the `R.free == Σ chunk.bytes`
    /// invariant (§8, property 1).
    pub(crate) fn freelist_bytes(&self) -> usize {
        self.freelist.iter().map(|c| c.bytes).sum()
    }

    /// Size of the single largest free chunk, or 0 if the region is full.
    pub(crate) fn largest_free_chunk(&self) -> usize {
        self.freelist.iter().map(|c| c.bytes).max().unwrap_or(0)
    }

    /// First-fit allocation of `size` bytes (§4.2.1).
    pub(crate) fn allocate(&mut self, size: usize, reverse: bool, clear: bool) -> Option<NonNull<u8>> {
        if size == 0 || self.free < size {
            return None;
        }
        let size = round_up_block(size);
        if self.free < size {
            return None;
        }
        let chunk = if reverse {
            self.freelist
                .iter_ptrs_rev()
                .find(|&c| FreeChunk::bytes(c) >= size)?
        } else {
            self.freelist
                .iter_ptrs()
                .find(|&c| FreeChunk::bytes(c) >= size)?
        };
        let chunk_bytes = FreeChunk::bytes(chunk);
        let addr = if chunk_bytes == size {
            unsafe { self.freelist.unlink(chunk) };
            FreeChunk::addr(chunk)
        } else if reverse {
            let new_bytes = chunk_bytes - size;
            unsafe { (*chunk.as_ptr()).bytes = new_bytes };
            FreeChunk::addr(chunk) + new_bytes
        } else {
            let addr = FreeChunk::addr(chunk);
            let remainder_addr = addr + size;
            let remainder_bytes = chunk_bytes - size;
            let pred = unsafe { self.freelist.pred_of(chunk) };
            let remainder =
                unsafe { FreeChunk::write_at(NonNull::new_unchecked(remainder_addr as *mut u8), remainder_bytes) };
            unsafe {
                self.freelist.unlink(chunk);
                self.freelist.insert_after(remainder, pred);
            }
            addr
        };
        self.free -= size;
        let ptr = unsafe { NonNull::new_unchecked(addr as *mut u8) };
        self.fill(ptr, size, clear);
        log::trace!("region {:?}: allocate {size} -> {addr:#x}", self.name);
        Some(ptr)
    }

    /// Allocation at an aligned or absolute address (§4.2.2).
    ///
    /// `align_exp` selects ALIGN mode (exponent) vs ABS mode (`location` is
    /// a required start address).
    pub(crate) fn allocate_abs(
        &mut self,
        size: usize,
        location: usize,
        align_exp: Option<u32>,
        reverse: bool,
        clear: bool,
    ) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let size = round_up_block(size);
        if self.free < size {
            return None;
        }

        let compute_start = |chunk: NonNull<FreeChunk>| -> Option<usize> {
            let start = FreeChunk::addr(chunk);
            let end = FreeChunk::end(chunk);
            if let Some(exp) = align_exp {
                let mask = ((1usize << exp) - 1).max(BLOCK_MASK);
                let aligned = if reverse {
                    (end.saturating_sub(size)) & !mask
                } else {
                    (start + mask) & !mask
                };
                if aligned >= start && aligned + size <= end {
                    Some(aligned)
                } else {
                    None
                }
            } else {
                let want = round_down_block(location);
                if want >= start && want + size <= end {
                    Some(want)
                } else {
                    None
                }
            }
        };

        let (chunk, alloc_start) = if reverse {
            self.freelist
                .iter_ptrs_rev()
                .find_map(|c| compute_start(c).map(|s| (c, s)))?
        } else {
            self.freelist
                .iter_ptrs()
                .find_map(|c| compute_start(c).map(|s| (c, s)))?
        };

        let chunk_start = FreeChunk::addr(chunk);
        let chunk_end = FreeChunk::end(chunk);
        let head_remainder = alloc_start - chunk_start;
        let tail_remainder = chunk_end - (alloc_start + size);
        let pred = unsafe { self.freelist.pred_of(chunk) };
        unsafe { self.freelist.unlink(chunk) };

        // Reinsert remainders; tail first so `pred` (still valid - it was
        // never touched) anchors both insertions in address order.
        if tail_remainder > 0 {
            debug_assert!(tail_remainder >= FreeChunk::MIN_BYTES);
            let tail_addr = alloc_start + size;
            let tail = unsafe {
                FreeChunk::write_at(NonNull::new_unchecked(tail_addr as *mut u8), tail_remainder)
            };
            unsafe { self.freelist.insert_after(tail, pred) };
        }
        if head_remainder > 0 {
            debug_assert!(head_remainder >= FreeChunk::MIN_BYTES);
            let head = unsafe {
                FreeChunk::write_at(NonNull::new_unchecked(chunk_start as *mut u8), head_remainder)
            };
            unsafe { self.freelist.insert_after(head, pred) };
        }

        self.free -= size;
        let ptr = unsafe { NonNull::new_unchecked(alloc_start as *mut u8) };
        self.fill(ptr, size, clear);
        log::trace!(
            "region {:?}: allocate_abs {size} @ {alloc_start:#x} (align={align_exp:?})",
            self.name
        );
        Some(ptr)
    }

    /// Return `[block, block+size)` to the freelist, coalescing with
    /// adjacent free chunks (§4.2.3).
    ///
    /// # Panics
    /// If `block` is not block-aligned, lies outside the region, or
    /// overlaps an existing free chunk (a programming fault per §7).
    pub(crate) fn deallocate(&mut self, block: NonNull<u8>, size: usize) {
        let block_addr = block.as_ptr() as usize;
        assert!(size > 0, "deallocate of zero bytes");
        assert_eq!(block_addr & BLOCK_MASK, 0, "deallocate of unaligned block");
        let size = round_up_block(size);
        assert!(
            self.contains(block_addr) && block_addr + size <= self.upper,
            "deallocate of block {block_addr:#x} (size {size}) outside region {:?} [{:#x}, {:#x})",
            self.name,
            self.lower,
            self.upper
        );

        let mut prev: Option<NonNull<FreeChunk>> = None;
        let mut next: Option<NonNull<FreeChunk>> = None;
        for c in self.freelist.iter_ptrs() {
            if FreeChunk::addr(c) <= block_addr {
                prev = Some(c);
            } else {
                next = Some(c);
                break;
            }
        }
        let prev_end = prev.map_or(self.lower, FreeChunk::end);
        let next_addr = next.map_or(self.upper, FreeChunk::addr);
        assert!(
            block_addr >= prev_end && block_addr + size <= next_addr,
            "double free or corrupted freelist: block {block_addr:#x} (size {size}) overlaps \
             neighbouring free chunk in region {:?} (prev_end={prev_end:#x}, next={next_addr:#x})",
            self.name
        );

        self.fill_free(block, size);
        let mut new_chunk = unsafe { FreeChunk::write_at(block, size) };
        unsafe { self.freelist.insert_after(new_chunk, prev) };

        // Coalesce with the predecessor first so `new_chunk` always refers
        // to the surviving, possibly-grown chunk afterwards.
        if let Some(p) = prev
            && prev_end == block_addr
        {
            unsafe { (*p.as_ptr()).bytes += size };
            unsafe { self.freelist.unlink(new_chunk) };
            new_chunk = p;
        }
        if let Some(n) = next
            && FreeChunk::end(new_chunk) == FreeChunk::addr(n)
        {
            let n_bytes = FreeChunk::bytes(n);
            unsafe { self.freelist.unlink(n) };
            unsafe { (*new_chunk.as_ptr()).bytes += n_bytes };
        }

        self.free += size;
        log::trace!(
            "region {:?}: deallocate {block_addr:#x} (size {size})",
            self.name
        );
    }

    fn debug_fill_enabled(&self) -> bool {
        self.debug_fill
    }

    fn fill(&self, ptr: NonNull<u8>, size: usize, clear: bool) {
        if clear {
            unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        } else if self.debug_fill_enabled() {
            unsafe { ptr::write_bytes(ptr.as_ptr(), ALLOC_FILL, size) };
        }
    }

    fn fill_free(&self, ptr: NonNull<u8>, size: usize) {
        if self.debug_fill_enabled() {
            unsafe { ptr::write_bytes(ptr.as_ptr(), FREE_FILL, size) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(size: usize) -> Region {
        let storage: Box<[u8]> = vec![0u8; size].into_boxed_slice();
        Region::new(storage, AllocFlags::PUBLIC, 0, "test".to_string(), true)
    }

    #[test]
    fn fill_and_drain() {
        let mut r = region(256);
        let total = r.total();
        let p = r.allocate(1, false, false).expect("alloc 1 byte");
        assert_eq!(r.free(), total - BLOCK_SIZE);
        r.deallocate(p, 1);
        assert_eq!(r.free(), total);
        assert_eq!(r.freelist_bytes(), r.free());
    }

    #[test]
    fn forward_first_fit_reuses_freed_middle_slot() {
        let mut r = region(1024);
        let a = r.allocate(64, false, false).unwrap();
        let b = r.allocate(64, false, false).unwrap();
        let _c = r.allocate(64, false, false).unwrap();
        r.deallocate(b, 64);
        let reused = r.allocate(32, false, false).unwrap();
        assert_eq!(reused.as_ptr(), b.as_ptr());
        let _ = a;
    }

    #[test]
    fn reverse_first_fit_carves_from_the_back() {
        let mut r = region(1024);
        let a = r.allocate(64, false, false).unwrap();
        let b = r.allocate(64, false, false).unwrap();
        let _c = r.allocate(64, false, false).unwrap();
        r.deallocate(b, 64);
        let reused = r.allocate(32, true, false).unwrap();
        assert_eq!(reused.as_ptr() as usize, b.as_ptr() as usize + 32);
        let _ = a;
    }

    #[test]
    fn coalesces_both_neighbours() {
        let mut r = region(1024);
        let a = r.allocate(32, false, false).unwrap();
        let b = r.allocate(32, false, false).unwrap();
        let c = r.allocate(32, false, false).unwrap();
        r.deallocate(a, 32);
        r.deallocate(c, 32);
        assert_eq!(r.freelist.iter().count(), 2);
        r.deallocate(b, 32);
        // Exactly one free chunk covering all three blocks plus slack.
        let mut count = 0;
        let mut found_96 = false;
        for chunk_bytes in r.freelist.iter().map(|c| c.bytes) {
            count += 1;
            if chunk_bytes >= 96 {
                found_96 = true;
            }
        }
        assert_eq!(count, 1);
        assert!(found_96);
    }

    #[test]
    fn debug_fill_disabled_leaves_freed_bytes_untouched() {
        let storage: Box<[u8]> = vec![0u8; 256].into_boxed_slice();
        let mut r = Region::new(storage, AllocFlags::PUBLIC, 0, "test".to_string(), false);
        let p = r.allocate(32, false, false).unwrap();
        unsafe { ptr::write_bytes(p.as_ptr(), 0x42, 32) };
        r.deallocate(p, 32);
        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 32) };
        assert!(
            bytes.iter().all(|&b| b == 0x42),
            "debug_fill=false must not overwrite freed bytes with FREE_FILL"
        );
    }

    #[test]
    fn clear_flag_zeroes_the_block() {
        let mut r = region(256);
        let p = r.allocate(32, false, false).unwrap();
        unsafe { ptr::write_bytes(p.as_ptr(), 0x42, 32) };
        r.deallocate(p, 32);
        let p2 = r.allocate(32, false, true).unwrap();
        assert_eq!(p2.as_ptr(), p.as_ptr());
        let bytes = unsafe { std::slice::from_raw_parts(p2.as_ptr(), 32) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn allocate_abs_honours_alignment_exponent() {
        let mut r = region(4096);
        let p = r.allocate_abs(64, 0, Some(8), false, false).unwrap();
        assert_eq!(p.as_ptr() as usize & 0xFF, 0);
    }

    #[test]
    #[should_panic(expected = "outside region")]
    fn deallocate_outside_region_panics() {
        let mut r = region(256);
        let bogus = unsafe { NonNull::new_unchecked(r.upper as *mut u8) };
        r.deallocate(bogus, 32);
    }
}
