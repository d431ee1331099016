//! Close-vs-access exclusion for shared scopes.
//!
//! Every thread that accesses memory of a shared scope owns an access slot in a process-wide
//! registry. Before touching the memory, the thread publishes the identity of the scope in its
//! slot and only then checks the scope state. A closer first moves the scope into the closing
//! state and only then scans the slots. Both sides use sequentially consistent operations, so at
//! least one of them observes the other:
//!
//! * either the accessor sees the closing/closed state and backs off without touching memory,
//! * or the closer sees the published identity and waits (a bounded number of spins) for the
//!   accessor to leave its access window, giving up if it does not.
//!
//! Slots are never deallocated. A slot is recycled when its thread exits, so the registry size is
//! bounded by the peak number of simultaneously live accessing threads.

use std::hint::spin_loop;
use std::marker::PhantomData;
use std::num::NonZero;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::thread;

use tracing::{debug, trace};

/// How many access windows (to different or identical scopes) one thread may have open at the
/// same time before further windows fall back to counted acquisition.
const MAX_NESTED_WINDOWS: usize = 4;

/// Marks an unused entry in an access slot. Scope identities start at one.
const NO_SCOPE: usize = 0;

/// How often a waiting closer yields its time slice instead of just spinning.
const YIELD_EVERY_SPINS: u32 = 64;

/// Source of scope identities. Identities are never reused, so a window that is never closed
/// (e.g. because its guard was leaked) can only ever block the scope it was opened for.
static NEXT_SCOPE_ID: AtomicUsize = AtomicUsize::new(1);

/// Head of the append-only list of all slots ever created.
static SLOTS: AtomicPtr<AccessSlot> = AtomicPtr::new(ptr::null_mut());

/// Hands out a process-wide unique, non-zero scope identity.
pub(crate) fn new_scope_id() -> usize {
    let id = NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed);

    // Wrapping would take centuries at any realistic scope creation rate.
    debug_assert_ne!(id, NO_SCOPE);

    id
}

#[derive(Debug)]
struct AccessSlot {
    /// Identities of the scopes the owning thread is currently accessing.
    ///
    /// Only the owning thread writes here; closers only read.
    windows: [AtomicUsize; MAX_NESTED_WINDOWS],

    /// Whether a live thread currently owns this slot.
    in_use: AtomicBool,

    /// Next slot in the registry. Immutable once the slot is published.
    next: AtomicPtr<AccessSlot>,
}

impl AccessSlot {
    fn new_claimed() -> Self {
        Self {
            windows: [const { AtomicUsize::new(NO_SCOPE) }; MAX_NESTED_WINDOWS],
            in_use: AtomicBool::new(true),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Claims a slot for the current thread, recycling a free one if available.
    fn claim() -> &'static Self {
        if let Some(slot) = registered_slots().find(|slot| {
            slot.in_use
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        }) {
            return slot;
        }

        let slot: &'static Self = Box::leak(Box::new(Self::new_claimed()));
        let slot_ptr = ptr::from_ref(slot).cast_mut();

        let mut head = SLOTS.load(Ordering::Acquire);

        loop {
            slot.next.store(head, Ordering::Relaxed);

            // SeqCst so that a closer whose scan misses this slot is ordered before our first
            // window publication, which then observes the closer's state transition.
            match SLOTS.compare_exchange_weak(head, slot_ptr, Ordering::SeqCst, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }

        trace!("registered new scoped access slot");

        slot
    }
}

fn registered_slots() -> impl Iterator<Item = &'static AccessSlot> {
    // SAFETY: Slots are leaked on creation and never freed, so any published pointer is valid
    // for 'static. Null terminates the list.
    let first = unsafe { SLOTS.load(Ordering::SeqCst).as_ref() };

    std::iter::successors(first, |slot| {
        // SAFETY: As above.
        unsafe { slot.next.load(Ordering::Acquire).as_ref() }
    })
}

/// Owns the slot of the current thread and hands it back to the registry on thread exit.
struct ThreadSlot {
    slot: &'static AccessSlot,
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        for window in &self.slot.windows {
            window.store(NO_SCOPE, Ordering::Release);
        }

        self.slot.in_use.store(false, Ordering::Release);
    }
}

thread_local! {
    static THREAD_SLOT: ThreadSlot = ThreadSlot {
        slot: AccessSlot::claim(),
    };
}

/// An open access window of the current thread on one scope.
///
/// While this exists, the identity of the scope stays published in the slot of the current
/// thread and any close of that scope will wait for (or be rejected because of) this window.
#[derive(Debug)]
pub(crate) struct AccessWindow {
    window: &'static AtomicUsize,

    // The window belongs to the slot of the thread that opened it.
    _not_send: PhantomData<*const ()>,
}

impl AccessWindow {
    /// Publishes `scope_id` as being accessed by the current thread.
    ///
    /// The caller must check the scope state after this returns and only access memory if the
    /// scope is still alive.
    ///
    /// Returns `None` if the current thread has no free window entries left or is being torn
    /// down, in which case the caller needs another way to keep the scope open.
    pub(crate) fn open(scope_id: usize) -> Option<Self> {
        debug_assert_ne!(scope_id, NO_SCOPE);

        THREAD_SLOT
            .try_with(|thread_slot| {
                // Only this thread writes to its own slot, so a relaxed read is sufficient to
                // find a free entry.
                let window = thread_slot
                    .slot
                    .windows
                    .iter()
                    .find(|window| window.load(Ordering::Relaxed) == NO_SCOPE)?;

                // SeqCst pairs with the SeqCst state transition and slot scan of the closer.
                window.store(scope_id, Ordering::SeqCst);

                Some(Self {
                    window,
                    _not_send: PhantomData,
                })
            })
            .ok()
            .flatten()
    }
}

impl Drop for AccessWindow {
    fn drop(&mut self) {
        // Release so that every memory access inside the window happens-before the closer
        // observing the window as closed (and subsequently freeing the memory).
        self.window.store(NO_SCOPE, Ordering::Release);
    }
}

/// Waits for every thread to leave its access windows on `scope_id`.
///
/// The caller must have already moved the scope into a state in which new accessors back off.
///
/// Returns `false` if some thread stayed inside a window for longer than `spin_limit` spins.
pub(crate) fn close_handshake(scope_id: usize, spin_limit: NonZero<u32>) -> bool {
    let mut slots_scanned: usize = 0;

    for slot in registered_slots() {
        slots_scanned = slots_scanned.wrapping_add(1);

        for window in &slot.windows {
            if !wait_for_exit(window, scope_id, spin_limit) {
                debug!(
                    scope_id,
                    spin_limit, "close handshake failed: thread still inside access window"
                );
                return false;
            }
        }
    }

    trace!(scope_id, slots_scanned, "close handshake completed");

    true
}

#[cfg_attr(test, mutants::skip)] // Spin tuning; mutations only change timing.
fn wait_for_exit(window: &AtomicUsize, scope_id: usize, spin_limit: NonZero<u32>) -> bool {
    let mut spins: u32 = 0;

    while window.load(Ordering::SeqCst) == scope_id {
        if spins >= spin_limit.get() {
            return false;
        }

        spins = spins.wrapping_add(1);

        if spins % YIELD_EVERY_SPINS == 0 {
            thread::yield_now();
        } else {
            spin_loop();
        }
    }

    true
}
