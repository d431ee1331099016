use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{ResourceScope, ScopeInner};

/// Proof that a scope was alive when it was acquired, keeping it from being closed until the
/// handle is released.
///
/// Obtained from [`ResourceScope::acquire()`]. For shared scopes, every outstanding handle
/// makes [`ResourceScope::close()`] fail with [`StillAcquired`][crate::ScopeError::StillAcquired].
/// Confined, implicit and global scopes do not count their handles.
///
/// Releasing is idempotent: only the first call to [`release()`][Self::release] has an effect.
/// Dropping an unreleased handle releases it.
#[must_use = "dropping the handle immediately releases it"]
pub struct ScopeHandle {
    scope: Arc<ScopeInner>,

    /// Whether this handle holds a counted acquisition on a shared scope.
    counted: bool,

    released: AtomicBool,
}

impl ScopeHandle {
    pub(crate) fn new(scope: Arc<ScopeInner>, counted: bool) -> Self {
        Self {
            scope,
            counted,
            released: AtomicBool::new(false),
        }
    }

    /// The scope this handle was acquired from.
    #[must_use]
    pub fn scope(&self) -> ResourceScope {
        ResourceScope::from_inner(Arc::clone(&self.scope))
    }

    /// Whether the handle has already been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Releases the handle. Calling this more than once has no further effect.
    pub fn release(&self) {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if self.counted {
            self.scope.release_acquisition();
        }
    }
}

impl Drop for ScopeHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ScopeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("counted", &self.counted)
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}
