use std::any::type_name;
use std::fmt;

/// A single release action registered against a scope, such as freeing a buffer,
/// unmapping a file or releasing a handle held on another scope.
///
/// The action is consumed when it runs, so a cleanup can run at most once.
pub struct ResourceCleanup {
    action: Box<dyn FnOnce() + Send>,

    /// Whether the action releases raw memory, as opposed to some incidental resource.
    /// Scopes use this to report whether they back live memory.
    has_memory: bool,
}

impl ResourceCleanup {
    /// Creates a cleanup that runs `action` when the owning scope is closed.
    ///
    /// # Examples
    ///
    /// ```
    /// use resource_scope::{ResourceCleanup, ResourceScope};
    ///
    /// let scope = ResourceScope::shared();
    /// scope
    ///     .add_cleanup(ResourceCleanup::new(|| println!("closed")))
    ///     .unwrap();
    /// scope.close().unwrap();
    /// ```
    #[must_use]
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Box::new(action),
            has_memory: false,
        }
    }

    /// Creates a cleanup that releases raw memory when the owning scope is closed.
    ///
    /// Registering such a cleanup marks the scope as backing live memory.
    #[must_use]
    pub fn memory(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Box::new(action),
            has_memory: true,
        }
    }

    /// Whether this cleanup releases raw memory.
    #[must_use]
    pub fn has_memory(&self) -> bool {
        self.has_memory
    }

    /// Runs the cleanup action, consuming it.
    pub fn run(self) {
        (self.action)();
    }
}

impl fmt::Debug for ResourceCleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("has_memory", &self.has_memory)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(ResourceCleanup: Send, fmt::Debug);

    #[test]
    fn run_invokes_action() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cleanup = ResourceCleanup::new({
            let counter = Arc::clone(&counter);
            move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });

        assert!(!cleanup.has_memory());

        cleanup.run();

        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn memory_cleanup_is_flagged() {
        let cleanup = ResourceCleanup::memory(|| {});

        assert!(cleanup.has_memory());
    }
}
