use std::num::NonZero;
use std::thread::ThreadId;

use crate::scope::{DEFAULT_CLOSE_SPIN_LIMIT, ScopeKind};
use crate::{Cleaner, ConfinedState, ResourceScope, SharedState, current_thread_id};

/// Builder for creating an instance of [`ResourceScope`].
///
/// You only need to use this builder if you want to customize the scope configuration.
/// [`ResourceScope::shared()`] and [`ResourceScope::confined()`] are sufficient for most use
/// cases.
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use resource_scope::{Cleaner, ResourceScope};
///
/// let scope = ResourceScope::builder()
///     .cleaner(Cleaner::inline())
///     .close_spin_limit(NonZero::new(4096).unwrap())
///     .build();
///
/// assert!(scope.owner_thread().is_none());
/// ```
#[derive(Debug)]
#[must_use]
pub struct ScopeBuilder {
    /// `None` for a shared scope.
    owner: Option<ThreadId>,

    cleaner: Option<Cleaner>,

    close_spin_limit: NonZero<u32>,
}

impl ScopeBuilder {
    pub(crate) fn new() -> Self {
        Self {
            owner: None,
            cleaner: None,
            close_spin_limit: DEFAULT_CLOSE_SPIN_LIMIT,
        }
    }

    /// Confines the scope to the current thread.
    pub fn confined(self) -> Self {
        self.confined_to(current_thread_id())
    }

    /// Confines the scope to the thread `owner`.
    pub fn confined_to(mut self, owner: ThreadId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Makes the scope usable from any thread. This is the default.
    pub fn shared(mut self) -> Self {
        self.owner = None;
        self
    }

    /// Sets the cleaner that runs pending actions if the scope is dropped without being closed.
    ///
    /// Without a cleaner, such actions are discarded without running.
    pub fn cleaner(mut self, cleaner: Cleaner) -> Self {
        self.cleaner = Some(cleaner);
        self
    }

    /// Sets how many times a closer of a shared scope spins while waiting for another thread
    /// to leave its access window before the close fails with
    /// [`BeingAccessed`][crate::ScopeError::BeingAccessed].
    ///
    /// Has no effect on confined scopes.
    pub fn close_spin_limit(mut self, limit: NonZero<u32>) -> Self {
        self.close_spin_limit = limit;
        self
    }

    /// Builds the scope with the specified configuration.
    #[must_use]
    pub fn build(self) -> ResourceScope {
        let kind = match self.owner {
            Some(owner) => ScopeKind::Confined(ConfinedState::new(owner)),
            None => ScopeKind::Shared(SharedState::new(self.close_spin_limit)),
        };

        ResourceScope::new(kind, self.cleaner)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn default_is_shared() {
        let scope = ResourceScope::builder().build();

        assert_eq!(scope.owner_thread(), None);
        assert!(!scope.is_implicit());
    }

    #[test]
    fn confined_uses_current_thread() {
        let scope = ResourceScope::builder().confined().build();

        assert_eq!(scope.owner_thread(), Some(thread::current().id()));
    }

    #[test]
    fn shared_overrides_confined() {
        let scope = ResourceScope::builder().confined().shared().build();

        assert_eq!(scope.owner_thread(), None);
    }
}
