//! Accounting for heap blocks created on the receiving side of a call.
//!
//! Pointer wrappers that arrive over the wire copy their elements into a
//! [`TrackedVec`]. Creating one records an allocation with the node's
//! [`Allocator`], and dropping it records the matching release, so ownership
//! transfer can be checked by counting events.

use std::alloc::Layout;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Receives allocation and release events for tracked element blocks.
pub trait Allocator: Send + Sync {
    fn record_alloc(&self, layout: Layout);
    fn record_free(&self, layout: Layout);
}

/// Records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn record_alloc(&self, _layout: Layout) {}
    fn record_free(&self, _layout: Layout) {}
}

/// Counts allocation and release events.
#[derive(Debug, Default)]
pub struct CountingAllocator {
    allocations: AtomicUsize,
    deallocations: AtomicUsize,
    live_bytes: AtomicUsize,
}

impl CountingAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn deallocations(&self) -> usize {
        self.deallocations.load(Ordering::SeqCst)
    }

    /// Blocks allocated and not yet released.
    pub fn live(&self) -> usize {
        self.allocations().saturating_sub(self.deallocations())
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::SeqCst)
    }
}

impl Allocator for CountingAllocator {
    fn record_alloc(&self, layout: Layout) {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        self.live_bytes.fetch_add(layout.size(), Ordering::SeqCst);
    }

    fn record_free(&self, layout: Layout) {
        self.deallocations.fetch_add(1, Ordering::SeqCst);
        self.live_bytes.fetch_sub(layout.size(), Ordering::SeqCst);
    }
}

/// An element block whose lifetime is reported to an [`Allocator`].
///
/// Elements are dropped before the release is recorded, so nested
/// containers release their leaves first.
pub struct TrackedVec<T> {
    data: Vec<T>,
    allocator: Option<Arc<dyn Allocator>>,
    layout: Layout,
}

impl<T> TrackedVec<T> {
    /// Take `data` under `allocator`'s accounting.
    pub fn new_in(data: Vec<T>, allocator: Arc<dyn Allocator>) -> Self {
        let layout = block_layout::<T>(data.len());
        allocator.record_alloc(layout);
        Self {
            data,
            allocator: Some(allocator),
            layout,
        }
    }

    /// Hold `data` without accounting.
    pub fn untracked(data: Vec<T>) -> Self {
        let layout = block_layout::<T>(data.len());
        Self {
            data,
            allocator: None,
            layout,
        }
    }

    pub fn is_tracked(&self) -> bool {
        self.allocator.is_some()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Leave accounting and hand the elements to the caller.
    ///
    /// The release is recorded now; the returned vector is ordinary heap memory.
    pub fn into_vec(mut self) -> Vec<T> {
        self.release();
        std::mem::take(&mut self.data)
    }

    fn release(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            allocator.record_free(self.layout);
        }
    }
}

impl<T> Drop for TrackedVec<T> {
    fn drop(&mut self) {
        drop(std::mem::take(&mut self.data));
        self.release();
    }
}

impl<T: fmt::Debug> fmt::Debug for TrackedVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedVec")
            .field("data", &self.data)
            .field("tracked", &self.is_tracked())
            .finish()
    }
}

fn block_layout<T>(len: usize) -> Layout {
    Layout::array::<T>(len).unwrap_or_else(|_| Layout::new::<T>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_records_release() {
        let counter = Arc::new(CountingAllocator::new());
        {
            let v = TrackedVec::new_in(vec![1u32, 2, 3], counter.clone());
            assert_eq!(v.as_slice(), &[1, 2, 3]);
            assert_eq!(counter.allocations(), 1);
            assert_eq!(counter.live_bytes(), 12);
        }
        assert_eq!(counter.deallocations(), 1);
        assert_eq!(counter.live(), 0);
        assert_eq!(counter.live_bytes(), 0);
    }

    #[test]
    fn into_vec_releases_once() {
        let counter = Arc::new(CountingAllocator::new());
        let v = TrackedVec::new_in(vec![1u8; 4], counter.clone());
        let plain = v.into_vec();
        assert_eq!(plain.len(), 4);
        assert_eq!(counter.deallocations(), 1);
    }

    #[test]
    fn nested_blocks_release_leaves_first() {
        let counter = Arc::new(CountingAllocator::new());
        let inner: Vec<_> = (0..3)
            .map(|i| TrackedVec::new_in(vec![i; 2], counter.clone()))
            .collect();
        let outer = TrackedVec::new_in(inner, counter.clone());
        assert_eq!(counter.allocations(), 4);
        drop(outer);
        assert_eq!(counter.deallocations(), 4);
    }

    #[test]
    fn untracked_records_nothing() {
        let v = TrackedVec::untracked(vec![1u64]);
        assert!(!v.is_tracked());
    }
}
