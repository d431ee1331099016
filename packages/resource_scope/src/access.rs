use std::any::type_name;
use std::fmt;

use crate::{ResourceScope, SharedAccess};

/// An open access window on a scope, obtained from [`ResourceScope::enter()`].
///
/// While the guard exists, the scope cannot complete a close. The guard is tied to the thread
/// that opened it and the window closes when the guard is dropped.
pub struct AccessGuard<'a> {
    scope: &'a ResourceScope,

    /// `None` for scopes whose owner thread is the only possible closer, or that never close.
    shared: Option<SharedAccess>,
}

impl<'a> AccessGuard<'a> {
    pub(crate) fn unguarded(scope: &'a ResourceScope) -> Self {
        Self {
            scope,
            shared: None,
        }
    }

    pub(crate) fn shared(scope: &'a ResourceScope, access: SharedAccess) -> Self {
        Self {
            scope,
            shared: Some(access),
        }
    }

    /// The scope this window is open on.
    #[must_use]
    pub fn scope(&self) -> &'a ResourceScope {
        self.scope
    }
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        // A window variant withdraws itself when dropped.
        if let Some(SharedAccess::Acquired) = self.shared.take() {
            self.scope.end_acquired_access();
        }
    }
}

impl fmt::Debug for AccessGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("scope", self.scope)
            .field("shared", &self.shared)
            .finish()
    }
}
