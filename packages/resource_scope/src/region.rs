use std::any::type_name;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::{ResourceScope, ScopedAccessError};

/// A block of memory whose lifetime is governed by a [`ResourceScope`].
///
/// This is the minimal view needed to exercise the scope contract: every byte access happens
/// inside an access window of the scope, so it either completes before the memory is released
/// or fails with [`ScopedAccessError`]. Bytes are accessed atomically, so concurrent readers
/// and writers on shared scopes do not race.
pub struct ScopedRegion {
    address: NonNull<u8>,
    byte_size: usize,
    scope: ResourceScope,
}

// SAFETY: The region only hands out data via atomic byte access inside access windows of its
// scope, which guarantees the memory is not released during the access.
unsafe impl Send for ScopedRegion {}
// SAFETY: See above.
unsafe impl Sync for ScopedRegion {}

impl ScopedRegion {
    pub(crate) fn new(address: NonNull<u8>, byte_size: usize, scope: ResourceScope) -> Self {
        Self {
            address,
            byte_size,
            scope,
        }
    }

    /// Start address of the region. Only valid while the scope is alive.
    #[must_use]
    pub fn address(&self) -> NonNull<u8> {
        self.address
    }

    /// Size of the region in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// The scope governing the lifetime of the region.
    #[must_use]
    pub fn scope(&self) -> &ResourceScope {
        &self.scope
    }

    /// Reads the byte at `offset`.
    ///
    /// # Errors
    ///
    /// Fails if the scope is closed or confined to another thread.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is out of bounds.
    pub fn get_u8(&self, offset: usize) -> Result<u8, ScopedAccessError> {
        let byte = self.byte_at(offset);
        self.scope.access(|| byte.load(Ordering::Relaxed))
    }

    /// Writes the byte at `offset`.
    ///
    /// # Errors
    ///
    /// Fails if the scope is closed or confined to another thread.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is out of bounds.
    pub fn set_u8(&self, offset: usize, value: u8) -> Result<(), ScopedAccessError> {
        let byte = self.byte_at(offset);
        self.scope.access(|| byte.store(value, Ordering::Relaxed))
    }

    /// Sets every byte of the region to `value` within a single access window.
    ///
    /// # Errors
    ///
    /// Fails if the scope is closed or confined to another thread.
    pub fn fill(&self, value: u8) -> Result<(), ScopedAccessError> {
        self.scope.access(|| {
            for offset in 0..self.byte_size {
                self.byte_at(offset).store(value, Ordering::Relaxed);
            }
        })
    }

    /// Creating the reference does not touch the memory; only loads and stores do, and those
    /// must happen inside an access window.
    fn byte_at(&self, offset: usize) -> &AtomicU8 {
        assert!(
            offset < self.byte_size,
            "offset {offset} out of bounds of region with {} bytes",
            self.byte_size
        );

        // SAFETY: The offset is in bounds of the block, which is valid for reads and writes
        // while the scope is alive. All access to the block goes through atomics.
        unsafe { AtomicU8::from_ptr(self.address.as_ptr().add(offset)) }
    }
}

impl fmt::Debug for ScopedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("address", &self.address)
            .field("byte_size", &self.byte_size)
            .field("scope", &self.scope)
            .finish()
    }
}
