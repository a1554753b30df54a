//! The central allocator façade (L2): region selection by attribute mask,
//! mungwall guard bands, the handler-chain retry loop, and batch
//! (`MemEntries`) allocation.

use crate::config::{AllocatorConfig, Direction};
use crate::entries::{MemEntry, MemEntryResult};
use crate::error::AllocatorError;
use crate::flags::AllocFlags;
use crate::handler::{HandlerStatus, MemHandler, MemHandlerData, ReclaimHandler};
use crate::intrusive_list::List;
use crate::region::Region;
use crate::{BLOCK_SIZE, FREE_FILL, MUNGWALL_HI, MUNGWALL_LO, round_up_block};
use std::ptr::{self, NonNull};
use std::sync::Mutex;

/// Word size used by the mungwall header fields (§4.3.2). Fixed at 8 bytes
/// regardless of host pointer width, matching the fixed-width 64-bit
/// magic constants below.
const MUNGWALL_WORD: usize = 8;
/// Bytes the mungwall front block reserves for its three header fields
/// (raw address, raw size, `MUNGWALL_LO`).
const MUNGWALL_RESERVED: usize = 3 * MUNGWALL_WORD;
/// Bytes reserved at the back of a guarded allocation for `MUNGWALL_HI`.
const MUNGWALL_BACK: usize = 8;
/// Header size of an `allocVec`/`freeVec` allocation (one word holding the
/// total allocated size).
const VEC_HEADER: usize = MUNGWALL_WORD;

/// Opaque handle to a registered [`Region`], returned by
/// [`Allocator::add_region`] and consumed by [`Allocator::remove_region`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionId(NonNull<Region>);

// SAFETY: a `RegionId` is an inert token; every operation that dereferences
// the pointer it wraps does so only while holding the owning Allocator's
// mutex.
unsafe impl Send for RegionId {}
unsafe impl Sync for RegionId {}

/// Opaque handle to a registered [`ReclaimHandler`], returned by
/// [`Allocator::add_handler`] and consumed by [`Allocator::remove_handler`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerId(NonNull<MemHandler>);

// SAFETY: see `RegionId` above.
unsafe impl Send for HandlerId {}
unsafe impl Sync for HandlerId {}

/// Read-only snapshot of one registered region, for [`Allocator::stats`].
#[derive(Debug, Clone)]
pub struct RegionStats {
    /// The region's registered name.
    pub name: String,
    /// The region's requirement attributes.
    pub attrs: AllocFlags,
    /// The region's priority (regions are searched highest-first).
    pub priority: i16,
    /// Bytes currently free.
    pub free: usize,
    /// Total usable capacity.
    pub total: usize,
}

/// Read-only snapshot of the whole allocator, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct AllocatorStats {
    /// One entry per registered region, in priority order.
    pub regions: Vec<RegionStats>,
    /// Number of registered reclaim handlers.
    pub handler_count: usize,
}

#[derive(Clone, Copy)]
enum AbsRequest {
    Location(usize),
    Align(u32),
}

struct AllocatorInner {
    regions: List<Region>,
    handlers: List<MemHandler>,
    cursor: Option<NonNull<MemHandler>>,
    config: AllocatorConfig,
}

// SAFETY: every pointer `AllocatorInner` holds (region/handler list nodes,
// the handler-chain cursor) is reachable only through `Allocator::inner`'s
// mutex; no reference derived from them is ever allowed to outlive the
// lock guard that produced it, and `Region`/`MemHandler`'s own payloads
// (`Box<[u8]>`, `Box<dyn ReclaimHandler>`) are themselves `Send`.
unsafe impl Send for AllocatorInner {}

/// The central allocator: a list of [`Region`]s and a list of reclaim
/// handlers behind one coarse [`Mutex`]. See the crate root docs for the
/// three-layer overview.
pub struct Allocator {
    inner: Mutex<AllocatorInner>,
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator {
    /// Construct an allocator with [`AllocatorConfig::default`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(AllocatorConfig::default())
    }

    /// Construct an allocator with an explicit configuration.
    #[must_use]
    pub fn with_config(config: AllocatorConfig) -> Self {
        Self {
            inner: Mutex::new(AllocatorInner {
                regions: List::new(),
                handlers: List::new(),
                cursor: None,
                config,
            }),
        }
    }

    /// Register a new region backed by `storage`, sorted into the region
    /// list by descending priority.
    pub fn add_region(
        &self,
        storage: Box<[u8]>,
        attrs: AllocFlags,
        priority: i16,
        name: impl Into<String>,
    ) -> RegionId {
        let mut inner = self.inner.lock().unwrap();
        let debug_fill = inner.config.debug_fill;
        let region = Region::new(storage, attrs.requirements(), priority, name.into(), debug_fill);
        let ptr = NonNull::from(Box::leak(Box::new(region)));
        unsafe {
            inner
                .regions
                .insert_sorted_by_key(ptr, |r| -i32::from(r.priority()));
        }
        RegionId(ptr)
    }

    /// Unregister a region, returning ownership of its backing storage.
    ///
    /// # Errors
    /// [`AllocatorError::UnknownRegion`] if `id` doesn't name a region
    /// currently registered with this allocator; [`AllocatorError::RegionBusy`]
    /// if the region still has outstanding allocations.
    pub fn remove_region(&self, id: RegionId) -> Result<Box<[u8]>, AllocatorError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.regions.iter_ptrs().any(|p| p == id.0) {
            return Err(AllocatorError::UnknownRegion);
        }
        let region_ref = unsafe { id.0.as_ref() };
        if region_ref.free() != region_ref.total() {
            return Err(AllocatorError::RegionBusy {
                name: region_ref.name().to_string(),
                outstanding: region_ref.total() - region_ref.free(),
                total: region_ref.total(),
            });
        }
        unsafe { inner.regions.unlink(id.0) };
        let region = unsafe { *Box::from_raw(id.0.as_ptr()) };
        Ok(region.into_storage())
    }

    /// Register a reclaim handler, sorted into the handler chain by
    /// descending priority.
    pub fn add_handler(
        &self,
        priority: i16,
        name: impl Into<String>,
        handler: impl ReclaimHandler + 'static,
    ) -> HandlerId {
        let handler = MemHandler::new(priority, name.into(), Box::new(handler));
        let ptr = NonNull::from(Box::leak(Box::new(handler)));
        let mut inner = self.inner.lock().unwrap();
        unsafe {
            inner
                .handlers
                .insert_sorted_by_key(ptr, |h| -i32::from(h.priority));
        }
        HandlerId(ptr)
    }

    /// Unregister a reclaim handler.
    ///
    /// # Errors
    /// [`AllocatorError::UnknownHandler`] if `id` doesn't name a handler
    /// currently registered with this allocator.
    pub fn remove_handler(&self, id: HandlerId) -> Result<(), AllocatorError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.handlers.iter_ptrs().any(|p| p == id.0) {
            return Err(AllocatorError::UnknownHandler);
        }
        if inner.cursor == Some(id.0) {
            inner.cursor = None;
        }
        unsafe { inner.handlers.unlink(id.0) };
        drop(unsafe { Box::from_raw(id.0.as_ptr()) });
        Ok(())
    }

    /// Allocate `size` bytes matching `flags`.
    ///
    /// # Panics
    /// If `size == 0` (a programming fault per §4.4).
    pub fn alloc(&self, size: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        assert!(size > 0, "alloc of zero bytes");
        self.inner.lock().unwrap().alloc_guarded(size, flags, None)
    }

    /// Allocate `size` bytes starting at the absolute address `location`
    /// (rounded down to the block quantum).
    ///
    /// # Panics
    /// If `size == 0`.
    pub fn alloc_abs(&self, size: usize, location: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        assert!(size > 0, "alloc of zero bytes");
        let flags = flags - AllocFlags::ALIGN;
        self.inner
            .lock()
            .unwrap()
            .alloc_guarded(size, flags, Some(AbsRequest::Location(location)))
    }

    /// Allocate `size` bytes aligned to `1 << align_exp`.
    ///
    /// # Panics
    /// If `size == 0` or `align_exp` is zero or exceeds the pointer width.
    pub fn alloc_align(&self, size: usize, align_exp: u32, flags: AllocFlags) -> Option<NonNull<u8>> {
        assert!(size > 0, "alloc of zero bytes");
        assert!(
            align_exp > 0 && (align_exp as usize) < usize::BITS as usize,
            "alignment exponent {align_exp} out of range"
        );
        let flags = flags | AllocFlags::ALIGN;
        self.inner
            .lock()
            .unwrap()
            .alloc_guarded(size, flags, Some(AbsRequest::Align(align_exp)))
    }

    /// Allocate `size + 1 word` bytes, stashing the full allocation size in
    /// the leading word. Pair with [`Allocator::free_vec`].
    pub fn alloc_vec(&self, size: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        let total = size.checked_add(VEC_HEADER).expect("allocVec size overflow");
        let base = self.alloc(total, flags)?;
        unsafe { write_u64(base.as_ptr(), total as u64) };
        Some(unsafe { NonNull::new_unchecked(base.as_ptr().add(VEC_HEADER)) })
    }

    /// Free a block returned by [`Allocator::alloc`] or [`Allocator::alloc_abs`]/[`Allocator::alloc_align`].
    ///
    /// # Panics
    /// If `ptr` is not owned by any registered region, or (with guard
    /// bands enabled) if its mungwall magic words are corrupted.
    pub fn free(&self, ptr: NonNull<u8>, size: usize) {
        assert!(size > 0, "free of zero bytes");
        self.inner.lock().unwrap().free_guarded(ptr, size);
    }

    /// Free a block returned by [`Allocator::alloc_vec`].
    pub fn free_vec(&self, ptr: NonNull<u8>) {
        let base = unsafe { NonNull::new_unchecked(ptr.as_ptr().sub(VEC_HEADER)) };
        let total = unsafe { read_u64(base.as_ptr()) } as usize;
        self.free(base, total);
    }

    /// Attempt every entry in order; on any failure, roll back every prior
    /// success and fail the whole batch (§4.3.5).
    ///
    /// # Errors
    /// [`AllocatorError::EntryFailed`] naming the first entry that could
    /// not be satisfied.
    pub fn alloc_entries(&self, entries: &[MemEntry]) -> Result<Vec<MemEntryResult>, AllocatorError> {
        let mut results = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            match self.alloc(entry.size, entry.reqs) {
                Some(addr) => results.push(MemEntryResult {
                    addr,
                    size: round_up_block(entry.size),
                }),
                None => {
                    for done in results.into_iter().rev() {
                        self.free(done.addr, done.size);
                    }
                    return Err(AllocatorError::EntryFailed {
                        index,
                        size: entry.size,
                    });
                }
            }
        }
        Ok(results)
    }

    /// Release every entry of a successful [`Allocator::alloc_entries`] call, in reverse order.
    pub fn free_entries(&self, results: &[MemEntryResult]) {
        for entry in results.iter().rev() {
            self.free(entry.addr, entry.size);
        }
    }

    /// Bytes available across every region matching `flags`.
    ///
    /// With [`AllocFlags::LARGEST`], the size of the single largest free
    /// chunk among matching regions instead. With [`AllocFlags::TOTAL`],
    /// total (not just free) capacity instead.
    #[must_use]
    pub fn avail_mem(&self, flags: AllocFlags) -> usize {
        let inner = self.inner.lock().unwrap();
        let matching = || inner.regions.iter().filter(|r| r.attrs().satisfies(flags));
        if flags.contains(AllocFlags::LARGEST) {
            matching()
                .map(|r| {
                    debug_assert_eq!(r.free(), r.freelist_bytes(), "freelist sum invariant violated");
                    r.largest_free_chunk()
                })
                .max()
                .unwrap_or(0)
        } else if flags.contains(AllocFlags::TOTAL) {
            matching().map(Region::total).sum()
        } else {
            matching().map(Region::free).sum()
        }
    }

    /// The attributes of the region owning `ptr`, or [`AllocFlags::ANY`] if none.
    #[must_use]
    pub fn type_of(&self, ptr: NonNull<u8>) -> AllocFlags {
        let inner = self.inner.lock().unwrap();
        let addr = ptr.as_ptr() as usize;
        inner
            .regions
            .iter()
            .find(|r| r.contains(addr))
            .map_or(AllocFlags::ANY, Region::attrs)
    }

    /// Read-only snapshot of every region and the handler count.
    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        let inner = self.inner.lock().unwrap();
        AllocatorStats {
            regions: inner
                .regions
                .iter()
                .map(|r| RegionStats {
                    name: r.name().to_string(),
                    attrs: r.attrs(),
                    priority: r.priority(),
                    free: r.free(),
                    total: r.total(),
                })
                .collect(),
            handler_count: inner.handlers.iter().count(),
        }
    }
}

impl AllocatorInner {
    fn reverse_for(&self, flags: AllocFlags) -> bool {
        if flags.contains(AllocFlags::REVERSE) {
            true
        } else {
            matches!(self.config.default_direction, Direction::Reverse)
        }
    }

    fn alloc_guarded(
        &mut self,
        size: usize,
        flags: AllocFlags,
        abs: Option<AbsRequest>,
    ) -> Option<NonNull<u8>> {
        let reverse = self.reverse_for(flags);
        let clear = flags.contains(AllocFlags::CLEAR);
        let no_expunge = flags.contains(AllocFlags::NO_EXPUNGE);

        let front_pad = if self.config.guard_bands {
            match abs {
                Some(AbsRequest::Align(exp)) => 1usize << exp,
                _ => BLOCK_SIZE,
            }
        } else {
            0
        };
        debug_assert!(
            !self.config.guard_bands || front_pad >= MUNGWALL_RESERVED,
            "front guard of {front_pad} bytes too small to hold the mungwall header"
        );
        let raw_size = front_pad
            + size
            + if self.config.guard_bands {
                MUNGWALL_BACK
            } else {
                0
            };

        let shifted_abs = match abs {
            Some(AbsRequest::Location(loc)) => {
                Some(AbsRequest::Location(loc.saturating_sub(front_pad)))
            }
            other => other,
        };
        let align_exp = match abs {
            Some(AbsRequest::Align(exp)) => Some(exp),
            _ => None,
        };

        loop {
            if let Some(raw) = self.alloc_once(raw_size, flags, reverse, clear, shifted_abs) {
                return Some(finish_alloc(&self.config, raw, raw_size, front_pad, size, flags));
            }
            if no_expunge {
                return None;
            }
            if self.run_handler_chain(size, align_exp, flags) {
                // ALL_DONE: no more handlers will help, but the one that
                // just ran may have freed memory right before returning it
                // (§4.3.4 scenario 5) — retry once before giving up.
                return self
                    .alloc_once(raw_size, flags, reverse, clear, shifted_abs)
                    .map(|raw| finish_alloc(&self.config, raw, raw_size, front_pad, size, flags));
            }
        }
    }

    fn alloc_once(
        &mut self,
        raw_size: usize,
        flags: AllocFlags,
        reverse: bool,
        clear: bool,
        abs: Option<AbsRequest>,
    ) -> Option<NonNull<u8>> {
        for region_ptr in self.regions.iter_ptrs() {
            let region = unsafe { &mut *region_ptr.as_ptr() };
            if !region.attrs().satisfies(flags) {
                continue;
            }
            let got = match abs {
                None => region.allocate(raw_size, reverse, clear),
                Some(AbsRequest::Location(loc)) => {
                    region.allocate_abs(raw_size, loc, None, reverse, clear)
                }
                Some(AbsRequest::Align(exp)) => {
                    region.allocate_abs(raw_size, 0, Some(exp), reverse, clear)
                }
            };
            if got.is_some() {
                return got;
            }
        }
        None
    }

    /// Run the handler chain one step (§4.3.4). Returns `true` if the
    /// caller should give up (`ALL_DONE`), `false` if it should retry the
    /// allocation.
    fn run_handler_chain(&mut self, size: usize, align_exp: Option<u32>, flags: AllocFlags) -> bool {
        if self.handlers.is_empty() {
            self.cursor = None;
            return true;
        }
        loop {
            let handler_ptr = match self.cursor {
                None => {
                    let first = self.handlers.iter_ptrs().next().unwrap();
                    unsafe { (*first.as_ptr()).recycle = false };
                    self.cursor = Some(first);
                    first
                }
                Some(cur) if unsafe { (*cur.as_ptr()).recycle } => cur,
                Some(cur) => match unsafe { self.handlers.succ_of(cur) } {
                    Some(next) => {
                        self.cursor = Some(next);
                        next
                    }
                    None => {
                        self.cursor = None;
                        return true;
                    }
                },
            };
            let request = MemHandlerData {
                size,
                align_exp,
                flags,
            };
            let handler = unsafe { &mut *handler_ptr.as_ptr() };
            let status = handler.invoke(&request);
            log::debug!("handler {:?}: {status:?}", handler.name);
            match status {
                HandlerStatus::DidNothing => {
                    unsafe { (*handler_ptr.as_ptr()).recycle = false };
                    continue;
                }
                HandlerStatus::TryAgain => {
                    unsafe { (*handler_ptr.as_ptr()).recycle = true };
                    return false;
                }
                HandlerStatus::AllDone => {
                    unsafe { (*handler_ptr.as_ptr()).recycle = false };
                    return true;
                }
            }
        }
    }

    fn free_guarded(&mut self, user: NonNull<u8>, size: usize) {
        if self.config.guard_bands {
            let (raw, raw_size) = check_and_consume_mungwall(user, size);
            self.deallocate_in_owning_region(raw, raw_size);
        } else {
            self.deallocate_in_owning_region(user, size);
        }
    }

    fn deallocate_in_owning_region(&mut self, ptr: NonNull<u8>, size: usize) {
        let addr = ptr.as_ptr() as usize;
        for region_ptr in self.regions.iter_ptrs() {
            let region = unsafe { &mut *region_ptr.as_ptr() };
            if region.contains(addr) {
                region.deallocate(ptr, size);
                return;
            }
        }
        panic!("free of address {addr:#x} (size {size}) not owned by any registered region");
    }
}

/// Shift a freshly carved raw block past its front guard (if any), install
/// the mungwall header/footer, and log the completed allocation.
fn finish_alloc(
    config: &AllocatorConfig,
    raw: NonNull<u8>,
    raw_size: usize,
    front_pad: usize,
    size: usize,
    flags: AllocFlags,
) -> NonNull<u8> {
    let user = unsafe { NonNull::new_unchecked(raw.as_ptr().add(front_pad)) };
    if config.guard_bands {
        install_mungwall(raw, raw_size, user, size);
    }
    log::trace!("alloc: size={size} flags={flags:?} -> {user:p}");
    user
}

unsafe fn write_u64(ptr: *mut u8, value: u64) {
    unsafe { ptr::write_unaligned(ptr.cast::<u64>(), value) };
}

unsafe fn read_u64(ptr: *const u8) -> u64 {
    unsafe { ptr::read_unaligned(ptr.cast::<u64>()) }
}

fn install_mungwall(raw: NonNull<u8>, raw_size: usize, user: NonNull<u8>, size: usize) {
    unsafe {
        let base = user.as_ptr();
        write_u64(base.sub(3 * MUNGWALL_WORD), raw.as_ptr() as u64);
        write_u64(base.sub(2 * MUNGWALL_WORD), raw_size as u64);
        write_u64(base.sub(MUNGWALL_WORD), MUNGWALL_LO);
        write_u64(base.add(size), MUNGWALL_HI);
    }
}

/// Verify and consume the mungwall surrounding a user allocation, returning
/// the raw (unpadded) address and size to forward to the owning region.
///
/// # Panics
/// If either magic word is corrupted (a programming fault per §7).
fn check_and_consume_mungwall(user: NonNull<u8>, size: usize) -> (NonNull<u8>, usize) {
    unsafe {
        let base = user.as_ptr();
        let lo = read_u64(base.sub(MUNGWALL_WORD));
        let hi = read_u64(base.add(size));
        if lo != MUNGWALL_LO || hi != MUNGWALL_HI {
            log::error!(
                "mungwall corrupted at {user:p} (size {size}): lo={lo:#x} (expected {MUNGWALL_LO:#x}), \
                 hi={hi:#x} (expected {MUNGWALL_HI:#x})"
            );
            panic!(
                "mungwall corrupted at {user:p}: lo={lo:#x} hi={hi:#x}; double free or out-of-bounds write"
            );
        }
        let raw_addr = read_u64(base.sub(3 * MUNGWALL_WORD)) as usize;
        let raw_size = read_u64(base.sub(2 * MUNGWALL_WORD)) as usize;
        let fill = u64::from_ne_bytes([FREE_FILL; 8]);
        write_u64(base.sub(MUNGWALL_WORD), fill);
        write_u64(base.add(size), fill);
        (NonNull::new_unchecked(raw_addr as *mut u8), raw_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(size: usize) -> Box<[u8]> {
        vec![0u8; size].into_boxed_slice()
    }

    #[test]
    fn fill_and_drain_through_the_facade() {
        let alloc = Allocator::new();
        alloc.add_region(region(4096), AllocFlags::PUBLIC, 0, "main");
        let p = alloc.alloc(64, AllocFlags::ANY).unwrap();
        alloc.free(p, 64);
        assert_eq!(alloc.avail_mem(AllocFlags::ANY), alloc.avail_mem(AllocFlags::ANY | AllocFlags::TOTAL));
    }

    #[test]
    fn mungwall_detects_overflow_writes() {
        let alloc = Allocator::new();
        alloc.add_region(region(4096), AllocFlags::PUBLIC, 0, "main");
        let p = alloc.alloc(64, AllocFlags::ANY).unwrap();
        unsafe { ptr::write(p.as_ptr().add(64), 0xFFu8) };
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| alloc.free(p, 64)));
        assert!(result.is_err());
    }

    #[test]
    fn aligned_allocation_is_aligned() {
        let alloc = Allocator::new();
        alloc.add_region(region(8192), AllocFlags::PUBLIC, 0, "main");
        let p = alloc.alloc_align(100, 8, AllocFlags::ANY).unwrap();
        assert_eq!(p.as_ptr() as usize % 256, 0);
    }

    #[test]
    fn handler_chain_recycle_then_advance() {
        let alloc = Allocator::new();
        // Sized so exactly one guarded 64-byte allocation (128 bytes raw,
        // after BLOCK_SIZE rounding) ever fits, regardless of the host
        // allocator's base alignment: usable capacity is always in
        // [138, 200], so a second 32-byte guarded request (96 bytes raw)
        // never has room afterwards.
        alloc.add_region(region(200), AllocFlags::PUBLIC, 0, "tiny");
        let first = alloc.alloc(64, AllocFlags::ANY).unwrap();

        let freed_first = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let calls_hi = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let freed_first = freed_first.clone();
            let calls_hi = calls_hi.clone();
            alloc.add_handler(10, "hi", move |_: &MemHandlerData| {
                let n = calls_hi.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n == 0 {
                    HandlerStatus::TryAgain
                } else {
                    HandlerStatus::DidNothing
                }
            });
            alloc.add_handler(5, "lo", move |_: &MemHandlerData| {
                freed_first.store(true, std::sync::atomic::Ordering::SeqCst);
                HandlerStatus::AllDone
            });
        }

        // No free space left; the low-priority handler is a no-op until we
        // arrange for it to free something by closing over a side channel.
        // Here we simply assert the chain terminates without succeeding,
        // since neither handler actually returns memory to the allocator.
        let result = alloc.alloc(32, AllocFlags::ANY);
        assert!(result.is_none());
        assert!(calls_hi.load(std::sync::atomic::Ordering::SeqCst) >= 2);
        assert!(freed_first.load(std::sync::atomic::Ordering::SeqCst));
        alloc.free(first, 64);
    }

    #[test]
    fn all_done_after_freeing_memory_lets_the_retry_succeed() {
        // Scenario 5: a handler that frees memory before reporting ALL_DONE
        // must give the blocked allocation one more chance, not just give up.
        let alloc = Allocator::with_config(AllocatorConfig {
            guard_bands: false,
            ..AllocatorConfig::default()
        });
        let id = alloc.add_region(region(256), AllocFlags::PUBLIC, 0, "main");

        // Held in reserve; the handler reclaims it once invoked, standing
        // in for the "free externally-held resources" step real handlers
        // perform without re-entering the allocator's own lock.
        let spare = alloc.alloc(64, AllocFlags::ANY).unwrap();
        while alloc.alloc(32, AllocFlags::ANY).is_some() {}

        alloc.add_handler(0, "reclaim-spare", move |_: &MemHandlerData| {
            unsafe { (*id.0.as_ptr()).deallocate(spare, 64) };
            HandlerStatus::AllDone
        });

        let retried = alloc.alloc(32, AllocFlags::ANY);
        assert!(
            retried.is_some(),
            "ALL_DONE following a successful free must trigger a final retry"
        );
    }

    #[test]
    fn batch_allocation_is_all_or_nothing() {
        let alloc = Allocator::new();
        alloc.add_region(region(256), AllocFlags::PUBLIC, 0, "main");
        let total_free = alloc.avail_mem(AllocFlags::ANY);
        let entries = [
            MemEntry { reqs: AllocFlags::ANY, size: 16 },
            MemEntry { reqs: AllocFlags::ANY, size: 32 },
            MemEntry { reqs: AllocFlags::ANY, size: total_free },
        ];
        let err = alloc.alloc_entries(&entries).unwrap_err();
        assert!(matches!(err, AllocatorError::EntryFailed { index: 2, .. }));
        assert_eq!(alloc.avail_mem(AllocFlags::ANY), total_free);
    }

    #[test]
    fn remove_region_rejects_busy_region() {
        let alloc = Allocator::new();
        let id = alloc.add_region(region(256), AllocFlags::PUBLIC, 0, "main");
        let _p = alloc.alloc(32, AllocFlags::ANY).unwrap();
        assert!(matches!(
            alloc.remove_region(id),
            Err(AllocatorError::RegionBusy { .. })
        ));
    }

    #[test]
    fn multiple_threads_can_allocate_concurrently() {
        use std::sync::Arc;
        use std::thread;

        let alloc = Arc::new(Allocator::new());
        alloc.add_region(region(1 << 20), AllocFlags::PUBLIC, 0, "main");
        let mut handles = Vec::new();
        for _ in 0..8 {
            let alloc = alloc.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..64 {
                    let p = alloc.alloc(48, AllocFlags::ANY).unwrap();
                    alloc.free(p, 48);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(alloc.avail_mem(AllocFlags::ANY), alloc.avail_mem(AllocFlags::TOTAL));
    }
}
