//! Size-class ("binned") pool allocator for event payload buffers (§4.4).
//!
//! Bins are indexed by `ceil(log2(size / MIN_WIDTH))`. Each bin keeps a free
//! list of fixed-width buffers; allocation pops from the free list (or
//! mallocs a fresh one if it's empty), and freeing pushes back onto it. Per
//! the data-model invariant ("pool blocks are... never compacted; freed on
//! process teardown"), a bin's free list only grows — buffers are never
//! returned to the general allocator while the pool is alive, even if a bin
//! goes completely idle.
//!
//! The original C++ core locates the owning block from a bare item pointer
//! by reading a 4-byte negative offset stored immediately before the item
//! (`allocItem`/`freeItem` in `event_system.cpp`). That trick exists to let
//! `free()` work from a raw `void*` with no other context. Rust's ownership
//! model gives us that context for free: [`PoolBuf`] already knows its own
//! bin and holds the `Rc` back to the pool that issued it, so freeing is a
//! plain method call in `Drop` rather than pointer arithmetic. This is
//! recorded as an explicit divergence in DESIGN.md.
//!
//! Requests above `max_pool_size` bypass the pool entirely and go straight
//! to the general allocator, matching the source's oversize path.

use std::cell::RefCell;
use std::rc::Rc;

/// `log2` of the smallest bin's width (16 bytes).
const MIN_WIDTH_BITS: u32 = 4;
const MIN_WIDTH: usize = 1 << MIN_WIDTH_BITS;
/// Bins double in width up to `MIN_WIDTH << (BIN_COUNT - 1)` (~512 MiB);
/// anything larger always falls through to `max_pool_size` and the general
/// allocator regardless of this count.
const BIN_COUNT: usize = 26;

/// `ceil(log2(size / MIN_WIDTH))`, clamped into `[0, BIN_COUNT)`.
#[must_use]
pub fn bin_for(size: usize) -> usize {
    let size = size.max(1);
    if size <= MIN_WIDTH {
        return 0;
    }
    let bits = usize::BITS - (size - 1).leading_zeros();
    (bits as usize).saturating_sub(MIN_WIDTH_BITS as usize).min(BIN_COUNT - 1)
}

#[must_use]
pub fn bin_width(bin: usize) -> usize {
    MIN_WIDTH << bin
}

#[derive(Default)]
struct Bin {
    free: Vec<Box<[u8]>>,
    /// Outstanding (allocated, not yet freed) buffers in this bin.
    outstanding: usize,
}

/// A size-binned free-list allocator for event payload buffers.
///
/// Single-threaded: the runtime never hands a pool handle across threads,
/// so this has no internal locking, mirroring the cooperative concurrency
/// model in §5.
pub struct EventPool {
    bins: Vec<Bin>,
    max_pool_size: usize,
}

impl EventPool {
    #[must_use]
    pub fn new(max_pool_size: usize) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            bins: (0..BIN_COUNT).map(|_| Bin::default()).collect(),
            max_pool_size,
        }))
    }

    /// Allocates at least `size` bytes, from the pool if `size` fits under
    /// `max_pool_size`, else from the general allocator.
    pub fn alloc(pool: &Rc<RefCell<Self>>, size: usize) -> PoolBuf {
        if size > pool.borrow().max_pool_size {
            return PoolBuf::Heap(vec![0u8; size].into_boxed_slice());
        }
        let bin = bin_for(size);
        let buf = {
            let mut p = pool.borrow_mut();
            let width = bin_width(bin);
            p.bins[bin].outstanding += 1;
            p.bins[bin]
                .free
                .pop()
                .unwrap_or_else(|| vec![0u8; width].into_boxed_slice())
        };
        PoolBuf::Pooled { bin, buf: Some(buf), pool: Rc::clone(pool) }
    }

    /// Total bytes currently checked out (not on a bin's free list) across
    /// every bin. Diagnostic only.
    #[must_use]
    pub fn bytes_outstanding(&self) -> usize {
        self.bins.iter().enumerate().map(|(bin, b)| b.outstanding * bin_width(bin)).sum()
    }

    fn free(&mut self, bin: usize, buf: Box<[u8]>) {
        self.bins[bin].outstanding -= 1;
        self.bins[bin].free.push(buf);
    }
}

/// A payload buffer backed either by a pool bin or, for oversize requests,
/// the general allocator. Returned to its bin's free list on drop.
pub enum PoolBuf {
    Heap(Box<[u8]>),
    Pooled { bin: usize, buf: Option<Box<[u8]>>, pool: Rc<RefCell<EventPool>> },
}

impl PoolBuf {
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Heap(b) => b,
            Self::Pooled { buf, .. } => buf.as_ref().expect("buffer taken only on drop"),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Self::Heap(b) => b,
            Self::Pooled { buf, .. } => buf.as_mut().expect("buffer taken only on drop"),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.as_slice().len()
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        if let Self::Pooled { bin, buf, pool } = self {
            if let Some(buf) = buf.take() {
                pool.borrow_mut().free(*bin, buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{bin_for, bin_width, EventPool};

    #[test]
    fn bin_sizing_is_monotonic_and_covers_request() {
        for size in [1usize, 15, 16, 17, 1000, 65536, 1_000_000] {
            let bin = bin_for(size);
            assert!(bin_width(bin) >= size, "bin {bin} width {} too small for {size}", bin_width(bin));
        }
    }

    #[test]
    fn freed_buffer_is_reused_by_same_bin() {
        let pool = EventPool::new(1 << 20);
        let buf = EventPool::alloc(&pool, 100);
        assert_eq!(pool.borrow().bytes_outstanding(), bin_width(bin_for(100)));
        drop(buf);
        assert_eq!(pool.borrow().bytes_outstanding(), 0);
        let buf2 = EventPool::alloc(&pool, 100);
        assert_eq!(buf2.capacity(), bin_width(bin_for(100)));
    }

    #[test]
    fn oversize_request_bypasses_pool() {
        let pool = EventPool::new(16);
        let buf = EventPool::alloc(&pool, 1000);
        assert!(matches!(buf, super::PoolBuf::Heap(_)));
        assert_eq!(pool.borrow().bytes_outstanding(), 0);
    }
}
