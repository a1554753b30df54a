//! Low-memory reclaim handlers.
//!
//! The Amiga original stores a handler as a raw function pointer plus an
//! opaque `void*` user-data blob. Per the crate's redesign notes, that's
//! replaced here with a typed capability trait: implementors carry their
//! own state, and the allocator stores them as `Box<dyn ReclaimHandler>`,
//! the same way the allocator stores its other trait-object capabilities.

use crate::flags::AllocFlags;
use crate::intrusive_list::{Link, Linked};

/// The outcome of one [`ReclaimHandler::reclaim`] invocation.
///
/// Values outside this set (a handler returning through FFI, say) are
/// treated as [`HandlerStatus::DidNothing`] per §4.4's failure table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum HandlerStatus {
    /// Freed nothing; advance to the next handler in the chain.
    DidNothing = 0,
    /// Freed something; the caller should retry the allocation immediately
    /// and call this same handler again first (before advancing) if the
    /// retry still fails.
    TryAgain = 1,
    /// No further handler in the chain can help; stop retrying.
    AllDone = -1,
}

/// The request a handler is being asked to make room for.
#[derive(Debug, Clone, Copy)]
pub struct MemHandlerData {
    /// Requested allocation size, after BLOCK_SIZE rounding.
    pub size: usize,
    /// Alignment exponent, if the failing request was an aligned allocation.
    pub align_exp: Option<u32>,
    /// The original request's flags.
    pub flags: AllocFlags,
}

/// A typed low-memory reclaim capability.
///
/// Implementors are invoked with the allocator's mutex held: per §4.3.4 they
/// must not re-enter the allocator, only free externally-held resources and
/// report what happened.
pub trait ReclaimHandler: Send {
    /// Attempt to free memory so a pending allocation can be retried.
    fn reclaim(&mut self, request: &MemHandlerData) -> HandlerStatus;
}

impl<F> ReclaimHandler for F
where
    F: FnMut(&MemHandlerData) -> HandlerStatus + Send,
{
    fn reclaim(&mut self, request: &MemHandlerData) -> HandlerStatus {
        self(request)
    }
}

/// A handler that never does anything. Preserved verbatim from the source
/// repository's `SystemMemHandler` stub (§9); registered at the lowest
/// priority by convention, but never automatically — callers opt in.
#[derive(Debug, Default)]
pub struct SystemMemHandler;

impl ReclaimHandler for SystemMemHandler {
    fn reclaim(&mut self, _request: &MemHandlerData) -> HandlerStatus {
        HandlerStatus::DidNothing
    }
}

/// A registered handler, intrusively linked into the allocator's handler
/// chain, sorted by descending priority.
#[repr(C)]
pub(crate) struct MemHandler {
    link: Link,
    pub(crate) priority: i16,
    pub(crate) name: String,
    pub(crate) recycle: bool,
    handler: Box<dyn ReclaimHandler>,
}

unsafe impl Linked for MemHandler {}

impl MemHandler {
    pub(crate) fn new(priority: i16, name: String, handler: Box<dyn ReclaimHandler>) -> Self {
        Self {
            link: Link::unlinked(),
            priority,
            name,
            recycle: false,
            handler,
        }
    }

    pub(crate) fn invoke(&mut self, request: &MemHandlerData) -> HandlerStatus {
        self.handler.reclaim(request)
    }
}
