use std::hint::spin_loop;
use std::num::NonZero;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;

use crate::{AccessWindow, ScopeError, ScopedAccessError, close_handshake, new_scope_id};

// The state of a shared scope is a single integer:
// * ALIVE: alive and not acquired.
// * 1..=MAX_ACQUISITIONS: alive with this many outstanding acquisitions.
// * CLOSING: a close is in progress; it may still be rolled back to ALIVE.
// * CLOSED: permanently closed.
const ALIVE: i32 = 0;
const CLOSING: i32 = -1;
const CLOSED: i32 = -2;
const MAX_ACQUISITIONS: i32 = i32::MAX;

/// How often an accessor waiting out a close attempt yields its time slice instead of spinning.
const YIELD_EVERY_SPINS: u32 = 64;

/// How a shared scope is being held open for the duration of an access.
#[derive(Debug)]
pub(crate) enum SharedAccess {
    /// The scope identity is published in the access slot of the current thread.
    Window(AccessWindow),

    /// No window was available, so the scope was acquired instead. The holder must call
    /// [`SharedState::release()`] when the access ends.
    Acquired,
}

/// Liveness state of a scope that may be used from any thread.
///
/// All transitions are compare-and-swap loops on one integer. Nothing here ever blocks:
/// a close that cannot proceed fails fast and leaves it to the caller to retry.
#[derive(Debug)]
pub(crate) struct SharedState {
    state: AtomicI32,

    /// Identity published in access windows. Never reused by another scope.
    id: usize,

    /// How long a closer waits for a thread to leave its access window before giving up.
    close_spin_limit: NonZero<u32>,
}

impl SharedState {
    pub(crate) fn new(close_spin_limit: NonZero<u32>) -> Self {
        Self {
            state: AtomicI32::new(ALIVE),
            id: new_scope_id(),
            close_spin_limit,
        }
    }

    /// A scope in the middle of a close attempt is still alive, as the attempt may fail.
    pub(crate) fn is_alive(&self) -> bool {
        self.state.load(Ordering::Acquire) != CLOSED
    }

    #[inline]
    pub(crate) fn check_valid_state(&self) -> Result<(), ScopedAccessError> {
        if self.state.load(Ordering::Acquire) < ALIVE {
            return Err(ScopedAccessError::Closed);
        }

        Ok(())
    }

    /// Number of outstanding acquisitions, or zero if the scope is closing or closed.
    #[cfg(test)]
    fn acquisitions(&self) -> u32 {
        u32::try_from(self.state.load(Ordering::Acquire)).unwrap_or(0)
    }

    pub(crate) fn acquire(&self) -> Result<(), ScopeError> {
        let mut value = self.state.load(Ordering::SeqCst);

        loop {
            if value < ALIVE {
                return Err(ScopeError::AlreadyClosed);
            }

            if value == MAX_ACQUISITIONS {
                return Err(ScopeError::AcquireLimitExceeded);
            }

            // Cannot overflow, we just checked against the maximum.
            let next = value.wrapping_add(1);

            match self.state.compare_exchange_weak(
                value,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => value = actual,
            }
        }
    }

    /// Releases one acquisition. Callers guarantee that every release matches an acquire.
    pub(crate) fn release(&self) {
        let mut value = self.state.load(Ordering::SeqCst);

        loop {
            // The scope cannot close while acquired, so there is always something to release.
            if value <= ALIVE {
                debug_assert!(false, "released a shared scope that was not acquired: {value}");
                return;
            }

            let next = value.wrapping_sub(1);

            match self.state.compare_exchange_weak(
                value,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => value = actual,
            }
        }
    }

    /// Attempts to move the scope from alive to closed.
    ///
    /// On success, the caller has exclusive responsibility for running the cleanup actions.
    pub(crate) fn close(&self) -> Result<(), ScopeError> {
        // SeqCst pairs with the SeqCst publication of access windows (see `handshake.rs`).
        match self
            .state
            .compare_exchange(ALIVE, CLOSING, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {}
            Err(previous) if previous < ALIVE => return Err(ScopeError::AlreadyClosed),
            Err(previous) => {
                return Err(ScopeError::StillAcquired {
                    count: previous.unsigned_abs(),
                });
            }
        }

        if close_handshake(self.id, self.close_spin_limit) {
            self.state.store(CLOSED, Ordering::SeqCst);
            Ok(())
        } else {
            self.state.store(ALIVE, Ordering::SeqCst);
            Err(ScopeError::BeingAccessed)
        }
    }

    /// Holds the scope open for one access by the current thread.
    ///
    /// If a close attempt is in progress, waits for it to resolve: the attempt is bounded by
    /// the handshake spin limit and we are not holding anything it could be waiting for.
    pub(crate) fn enter(&self) -> Result<SharedAccess, ScopedAccessError> {
        loop {
            let Some(window) = AccessWindow::open(self.id) else {
                return self.enter_acquired();
            };

            match self.state.load(Ordering::SeqCst) {
                ALIVE.. => return Ok(SharedAccess::Window(window)),
                CLOSING => {
                    drop(window);
                    self.wait_while_closing();
                }
                _ => return Err(ScopedAccessError::Closed),
            }
        }
    }

    fn enter_acquired(&self) -> Result<SharedAccess, ScopedAccessError> {
        loop {
            match self.acquire() {
                Ok(()) => return Ok(SharedAccess::Acquired),
                Err(ScopeError::AcquireLimitExceeded) => {
                    return Err(ScopedAccessError::AcquireLimitExceeded);
                }
                // Closing may still be rolled back, in which case we try again.
                Err(_) if self.state.load(Ordering::Acquire) != CLOSED => {
                    self.wait_while_closing();
                }
                Err(_) => return Err(ScopedAccessError::Closed),
            }
        }
    }

    #[cfg_attr(test, mutants::skip)] // Only affects timing.
    fn wait_while_closing(&self) {
        let mut spins: u32 = 0;

        // The closer may have been preempted, so we must let it run.
        while self.state.load(Ordering::Acquire) == CLOSING {
            spins = spins.wrapping_add(1);

            if spins % YIELD_EVERY_SPINS == 0 {
                thread::yield_now();
            } else {
                spin_loop();
            }
        }
    }

    #[cfg(test)]
    fn force_state(&self, value: i32) {
        self.state.store(value, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    use super::*;

    const SPIN_LIMIT: NonZero<u32> = NonZero::new(64).unwrap();

    #[test]
    fn close_fails_while_acquired() {
        let state = SharedState::new(SPIN_LIMIT);

        state.acquire().unwrap();
        state.acquire().unwrap();

        assert_eq!(
            state.close(),
            Err(ScopeError::StillAcquired { count: 2 })
        );
        assert!(state.is_alive());
        assert_eq!(state.acquisitions(), 2);

        state.release();
        state.release();

        assert_eq!(state.close(), Ok(()));
        assert!(!state.is_alive());
    }

    #[test]
    fn second_close_fails() {
        let state = SharedState::new(SPIN_LIMIT);

        state.close().unwrap();

        assert_eq!(state.close(), Err(ScopeError::AlreadyClosed));
        assert_eq!(state.acquire(), Err(ScopeError::AlreadyClosed));
        assert_eq!(state.check_valid_state(), Err(ScopedAccessError::Closed));
    }

    #[test]
    fn acquire_limit_is_enforced() {
        let state = SharedState::new(SPIN_LIMIT);
        state.force_state(MAX_ACQUISITIONS);

        assert_eq!(state.acquire(), Err(ScopeError::AcquireLimitExceeded));

        state.release();
        assert_eq!(state.acquire(), Ok(()));
    }

    #[test]
    fn closing_counts_as_alive_but_invalid() {
        let state = SharedState::new(SPIN_LIMIT);
        state.force_state(CLOSING);

        assert!(state.is_alive());
        assert_eq!(state.check_valid_state(), Err(ScopedAccessError::Closed));
        assert_eq!(state.acquire(), Err(ScopeError::AlreadyClosed));
        assert_eq!(state.acquisitions(), 0);
    }

    #[test]
    fn open_window_rejects_close_and_keeps_scope_alive() {
        let state = SharedState::new(SPIN_LIMIT);

        let access = state.enter().unwrap();

        assert_eq!(state.close(), Err(ScopeError::BeingAccessed));
        assert!(state.is_alive());
        assert_eq!(state.check_valid_state(), Ok(()));

        drop(access);

        assert_eq!(state.close(), Ok(()));
        assert_eq!(
            state.enter().unwrap_err(),
            ScopedAccessError::Closed
        );
    }

    #[test]
    fn states_have_distinct_identities() {
        let first = SharedState::new(SPIN_LIMIT);
        let second = SharedState::new(SPIN_LIMIT);

        assert_ne!(first.id, second.id);
    }

    #[test]
    fn leaked_access_only_blocks_its_own_scope() {
        let leaked = SharedState::new(SPIN_LIMIT);
        std::mem::forget(leaked.enter().unwrap());

        assert_eq!(leaked.close(), Err(ScopeError::BeingAccessed));

        let other = SharedState::new(SPIN_LIMIT);
        assert_eq!(other.close(), Ok(()));
    }

    #[cfg_attr(miri, ignore)] // Miri is too slow for cross-thread spinning.
    #[test]
    fn enter_waits_out_close_attempt() {
        let state = Arc::new(SharedState::new(SPIN_LIMIT));
        state.force_state(CLOSING);

        let entered = Arc::new(AtomicBool::new(false));

        let accessor = thread::spawn({
            let state = Arc::clone(&state);
            let entered = Arc::clone(&entered);
            move || {
                let access = state.enter();
                entered.store(true, Ordering::SeqCst);
                access.is_ok()
            }
        });

        // The close attempt "fails" and rolls back.
        state.force_state(ALIVE);

        assert!(accessor.join().unwrap());
        assert!(entered.load(Ordering::SeqCst));
    }
}
