use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use crate::{ScopeError, ScopedAccessError};

thread_local! {
    static CURRENT_THREAD_ID: ThreadId = thread::current().id();
}

/// Identifies the current thread without touching the reference-counted `Thread` handle.
pub(crate) fn current_thread_id() -> ThreadId {
    CURRENT_THREAD_ID
        .try_with(|id| *id)
        .unwrap_or_else(|_| thread::current().id())
}

/// Liveness state of a scope owned by exactly one thread.
///
/// Only the owner thread can access memory through the scope and only the owner thread can
/// close it, so the owner can never race with itself. The closed flag is atomic only so that
/// other threads may ask whether the scope is alive; the owner reads it without ordering.
#[derive(Debug)]
pub(crate) struct ConfinedState {
    owner: ThreadId,
    closed: AtomicBool,
}

impl ConfinedState {
    pub(crate) fn new(owner: ThreadId) -> Self {
        Self {
            owner,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn owner(&self) -> ThreadId {
        self.owner
    }

    pub(crate) fn is_owned_by_current_thread(&self) -> bool {
        current_thread_id() == self.owner
    }

    pub(crate) fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn check_valid_state(&self) -> Result<(), ScopedAccessError> {
        if !self.is_owned_by_current_thread() {
            return Err(ScopedAccessError::WrongThread);
        }

        // Once we know we are on the owner thread, nobody else can have written the flag.
        if self.closed.load(Ordering::Relaxed) {
            return Err(ScopedAccessError::Closed);
        }

        Ok(())
    }

    /// Marks the scope closed. The caller runs the cleanup actions afterwards.
    pub(crate) fn close(&self) -> Result<(), ScopeError> {
        self.check_valid_state()?;

        // Release so that other threads observing `is_alive() == false` also observe
        // everything the owner did before closing.
        self.closed.store(true, Ordering::Release);

        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn owner_can_close_once() {
        let state = ConfinedState::new(current_thread_id());

        assert!(state.is_alive());
        assert_eq!(state.check_valid_state(), Ok(()));

        state.close().unwrap();

        assert!(!state.is_alive());
        assert_eq!(state.check_valid_state(), Err(ScopedAccessError::Closed));
        assert_eq!(state.close(), Err(ScopeError::AlreadyClosed));
    }

    #[cfg_attr(miri, ignore)] // Miri is slow at spawning threads.
    #[test]
    fn other_thread_cannot_close() {
        let state = ConfinedState::new(current_thread_id());

        thread::scope(|s| {
            s.spawn(|| {
                assert_eq!(state.close(), Err(ScopeError::WrongThread));
                assert_eq!(state.check_valid_state(), Err(ScopedAccessError::WrongThread));
                assert!(state.is_alive());
            });
        });

        assert!(state.is_alive());
    }

    #[test]
    fn current_thread_id_is_stable() {
        assert_eq!(current_thread_id(), thread::current().id());
        assert_eq!(current_thread_id(), current_thread_id());
    }
}
