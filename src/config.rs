//! Per-allocator configuration.
//!
//! A process-wide mutable debug toggle is the kind of anti-pattern worth
//! avoiding: instead of a `static mut`, callers supply an
//! [`AllocatorConfig`] once, at construction.

/// Freelist search direction used when no per-call override is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Walk the freelist from the lowest address, carving from the front
    /// of the chosen chunk.
    #[default]
    Forward,
    /// Walk the freelist from the highest address, carving from the back
    /// of the chosen chunk.
    Reverse,
}

/// Construction-time configuration for an [`Allocator`](crate::allocator::Allocator).
#[derive(Debug, Clone, Copy)]
pub struct AllocatorConfig {
    /// Install mungwall guard words around every public allocation.
    pub guard_bands: bool,
    /// Fill freshly allocated blocks with [`crate::ALLOC_FILL`] and freed
    /// blocks with [`crate::FREE_FILL`] when the block isn't zeroed.
    pub debug_fill: bool,
    /// Default search direction when a call doesn't request `REVERSE`.
    pub default_direction: Direction,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            guard_bands: true,
            debug_fill: cfg!(debug_assertions),
            default_direction: Direction::Forward,
        }
    }
}
