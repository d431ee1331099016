use std::alloc::{self, Layout};
use std::any::type_name;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::error::Result;
use crate::{ResourceCleanup, ResourceScope, ScopeError, ScopedRegion};

/// A strategy for obtaining and returning raw memory.
///
/// Scopes do not know how memory is obtained; they only make sure the matching
/// [`deallocate()`][Self::deallocate] runs when they close.
pub trait NativeMemory: Send + Sync + 'static {
    /// Allocates a block of memory with the given layout, returning `None` on failure.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Returns a block of memory obtained from [`allocate()`][Self::allocate].
    ///
    /// # Safety
    ///
    /// The caller must guarantee that `ptr` was returned by `allocate()` on this instance with
    /// the same `layout`, and that it is not used after this call.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Zero-initialized memory from the global allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemMemory;

impl NativeMemory for SystemMemory {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            // Zero-sized blocks need an aligned address but no actual memory.
            return NonNull::new(ptr::without_provenance_mut(layout.align()));
        }

        // SAFETY: The layout has a non-zero size.
        NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }

        // SAFETY: Forwarding the caller's guarantees; the block came from `alloc_zeroed()`.
        unsafe {
            alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}

/// Something that can hand out memory regions whose lifetime is governed by a scope.
pub trait SegmentAllocator {
    /// Allocates `byte_size` bytes aligned to `byte_alignment`.
    ///
    /// # Errors
    ///
    /// * [`ScopeError::InvalidLayout`] if the size and alignment do not form a valid layout.
    /// * [`ScopeError::OutOfMemory`] if the memory could not be obtained.
    /// * Any error from registering the release of the memory with the scope, in which case
    ///   the memory has already been returned.
    fn allocate(&self, byte_size: usize, byte_alignment: usize) -> Result<ScopedRegion>;
}

impl SegmentAllocator for ResourceScope {
    fn allocate(&self, byte_size: usize, byte_alignment: usize) -> Result<ScopedRegion> {
        allocate_in(self, Arc::new(SystemMemory), byte_size, byte_alignment)
    }
}

/// Allocates from a custom [`NativeMemory`] strategy into a scope.
///
/// # Examples
///
/// ```
/// use resource_scope::{ResourceScope, ScopeAllocator, SegmentAllocator, SystemMemory};
///
/// let scope = ResourceScope::shared();
/// let allocator = ScopeAllocator::new(scope.clone(), SystemMemory);
///
/// let region = allocator.allocate(64, 8).unwrap();
/// assert_eq!(region.byte_size(), 64);
///
/// scope.close().unwrap();
/// ```
pub struct ScopeAllocator<M> {
    scope: ResourceScope,
    memory: Arc<M>,
}

impl<M> ScopeAllocator<M>
where
    M: NativeMemory,
{
    /// Creates an allocator that obtains memory from `memory` and releases it when `scope`
    /// closes.
    #[must_use]
    pub fn new(scope: ResourceScope, memory: M) -> Self {
        Self {
            scope,
            memory: Arc::new(memory),
        }
    }

    /// The scope that governs the lifetime of allocated regions.
    #[must_use]
    pub fn scope(&self) -> &ResourceScope {
        &self.scope
    }
}

impl<M> SegmentAllocator for ScopeAllocator<M>
where
    M: NativeMemory,
{
    fn allocate(&self, byte_size: usize, byte_alignment: usize) -> Result<ScopedRegion> {
        allocate_in(
            &self.scope,
            Arc::clone(&self.memory),
            byte_size,
            byte_alignment,
        )
    }
}

impl<M> fmt::Debug for ScopeAllocator<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// A block address that is only ever dereferenced by the code that owns the block.
struct BlockAddress(NonNull<u8>);

// SAFETY: The address is only used to return the block to its allocator, which is `Sync`.
unsafe impl Send for BlockAddress {}

fn allocate_in<M>(
    scope: &ResourceScope,
    memory: Arc<M>,
    byte_size: usize,
    byte_alignment: usize,
) -> Result<ScopedRegion>
where
    M: NativeMemory,
{
    let layout = Layout::from_size_align(byte_size, byte_alignment).map_err(|_| {
        ScopeError::InvalidLayout {
            byte_size,
            byte_alignment,
        }
    })?;

    // No point in allocating for a scope we already know we cannot register with.
    scope.check_valid_state_slow()?;

    let address = memory.allocate(layout).ok_or(ScopeError::OutOfMemory {
        byte_size,
        byte_alignment,
    })?;

    let block = BlockAddress(address);

    // If the scope closed since the check above, the memory is returned right away.
    scope.add_or_cleanup_if_fail(ResourceCleanup::memory(move || {
        let block = block;

        // SAFETY: The block came from this allocator with this layout and the scope runs each
        // cleanup exactly once, after which no access through the scope is possible.
        unsafe {
            memory.deallocate(block.0, layout);
        }
    }))?;

    Ok(ScopedRegion::new(address, byte_size, scope.clone()))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(SystemMemory: NativeMemory);
    assert_impl_all!(ScopeAllocator<SystemMemory>: Send, Sync, fmt::Debug);

    /// Counts outstanding blocks so tests can verify that everything is returned.
    #[derive(Debug, Default)]
    struct TrackingMemory {
        outstanding: AtomicUsize,
    }

    impl NativeMemory for Arc<TrackingMemory> {
        fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
            self.outstanding.fetch_add(1, Ordering::SeqCst);
            SystemMemory.allocate(layout)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);

            // SAFETY: Forwarding the caller's guarantees.
            unsafe {
                SystemMemory.deallocate(ptr, layout);
            }
        }
    }

    #[test]
    fn close_returns_memory() {
        let tracking = Arc::new(TrackingMemory::default());
        let scope = ResourceScope::shared();
        let allocator = ScopeAllocator::new(scope.clone(), Arc::clone(&tracking));

        let _a = allocator.allocate(16, 8).unwrap();
        let _b = allocator.allocate(32, 16).unwrap();

        assert_eq!(tracking.outstanding.load(Ordering::SeqCst), 2);
        assert!(scope.backs_memory());

        scope.close().unwrap();

        assert_eq!(tracking.outstanding.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn allocation_is_aligned_and_zeroed() {
        let scope = ResourceScope::confined();

        let region = scope.allocate(100, 64).unwrap();

        assert_eq!(region.address().as_ptr().addr() % 64, 0);
        assert!((0..100).all(|offset| region.get_u8(offset) == Ok(0)));

        scope.close().unwrap();
    }

    #[test]
    fn invalid_alignment_is_rejected() {
        let scope = ResourceScope::shared();

        assert_eq!(
            scope.allocate(16, 3).unwrap_err(),
            ScopeError::InvalidLayout {
                byte_size: 16,
                byte_alignment: 3
            }
        );
        assert!(!scope.backs_memory());
    }

    #[test]
    fn closed_scope_allocates_nothing() {
        let tracking = Arc::new(TrackingMemory::default());
        let scope = ResourceScope::shared();
        let allocator = ScopeAllocator::new(scope.clone(), Arc::clone(&tracking));

        scope.close().unwrap();

        assert_eq!(
            allocator.allocate(16, 8).unwrap_err(),
            ScopeError::AlreadyClosed
        );
        assert_eq!(tracking.outstanding.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn zero_sized_allocation_works() {
        let scope = ResourceScope::shared();

        let region = scope.allocate(0, 16).unwrap();

        assert_eq!(region.byte_size(), 0);
        scope.close().unwrap();
    }

    #[test]
    fn implicit_scope_returns_memory_when_abandoned() {
        let tracking = Arc::new(TrackingMemory::default());

        {
            let scope = ResourceScope::implicit_with(crate::Cleaner::inline());
            let allocator = ScopeAllocator::new(scope, Arc::clone(&tracking));
            let region = allocator.allocate(8, 8).unwrap();
            region.set_u8(0, 7).unwrap();
        }

        assert_eq!(tracking.outstanding.load(Ordering::SeqCst), 0);
    }
}
