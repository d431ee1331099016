use std::any::type_name;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use tracing::error;

use crate::{ListAlreadyClosed, ResourceCleanup};

/// Only the address of this is used, as the head value of a list that has been cleaned up.
static CLOSED_MARKER: u8 = 0;

fn closed_marker() -> *mut Node {
    ptr::from_ref(&CLOSED_MARKER).cast_mut().cast()
}

struct Node {
    cleanup: ResourceCleanup,
    next: *mut Node,
}

/// The cleanup actions registered against one scope.
///
/// The actions form an intrusive singly linked list with new actions inserted at the head.
/// Insertion is lock-free: concurrent adds race on the head pointer via compare-and-swap and
/// the loser simply retries. Adds never race against [`cleanup()`][Self::cleanup] because
/// scopes only add while holding an acquisition, which prevents the scope from closing.
///
/// Once cleaned up, the list is permanently closed and rejects further actions.
pub struct ResourceList {
    /// Null if empty, [`closed_marker()`] if cleaned up, otherwise the most recently added node.
    head: AtomicPtr<Node>,
}

impl ResourceList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Adds a cleanup action to the list, racing safely against other concurrent adds.
    ///
    /// # Errors
    ///
    /// Returns the cleanup back to the caller if the list has already been cleaned up.
    pub fn add(&self, cleanup: ResourceCleanup) -> Result<(), ResourceCleanup> {
        let node = Box::into_raw(Box::new(Node {
            cleanup,
            next: ptr::null_mut(),
        }));

        let mut head = self.head.load(Ordering::Acquire);

        loop {
            if head == closed_marker() {
                // SAFETY: The node was never published, so we are still its only owner.
                let node = unsafe { Box::from_raw(node) };
                return Err(node.cleanup);
            }

            // SAFETY: The node is not yet published, so nobody else can be accessing it.
            unsafe {
                (*node).next = head;
            }

            // Release so that whoever runs the cleanup sees the fully initialized node.
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(actual) => head = actual,
            }
        }
    }

    /// Adds a cleanup action without synchronizing against other adds.
    ///
    /// Only valid when the caller guarantees that no other thread is adding to or cleaning up
    /// the list at the same time (e.g. the owner thread of a confined scope). Violating this
    /// can lose actions but cannot corrupt memory.
    pub(crate) fn add_exclusive(&self, cleanup: ResourceCleanup) -> Result<(), ResourceCleanup> {
        let head = self.head.load(Ordering::Relaxed);

        if head == closed_marker() {
            return Err(cleanup);
        }

        let node = Box::into_raw(Box::new(Node { cleanup, next: head }));
        self.head.store(node, Ordering::Release);

        Ok(())
    }

    /// Whether [`cleanup()`][Self::cleanup] has already been called on this list.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.head.load(Ordering::Acquire) == closed_marker()
    }

    /// Runs every registered action exactly once and closes the list.
    ///
    /// Actions run most-recently-added first, although callers must not rely on any order.
    /// Returns the number of actions that were run.
    ///
    /// # Errors
    ///
    /// Returns [`ListAlreadyClosed`] if the list has already been cleaned up.
    ///
    /// # Panics
    ///
    /// If an action panics, the remaining actions still run and the first panic is resumed
    /// once all of them have completed.
    pub fn cleanup(&self) -> Result<usize, ListAlreadyClosed> {
        // AcqRel: acquire every node published by `add()`, release the closed state to adders.
        let mut current = self.head.swap(closed_marker(), Ordering::AcqRel);

        if current == closed_marker() {
            return Err(ListAlreadyClosed);
        }

        let mut executed: usize = 0;
        let mut first_panic = None;

        while !current.is_null() {
            // SAFETY: Only the thread that swapped in the closed marker can reach the nodes,
            // and every node was created via `Box::into_raw()` by `add()` or `add_exclusive()`.
            let node = unsafe { Box::from_raw(current) };
            let Node { cleanup, next } = *node;
            current = next;

            executed = executed.wrapping_add(1);

            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| cleanup.run())) {
                error!(
                    action_index = executed,
                    "cleanup action panicked; continuing with remaining actions"
                );
                first_panic.get_or_insert(payload);
            }
        }

        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }

        Ok(executed)
    }
}

impl Default for ResourceList {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResourceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("is_closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for ResourceList {
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();

        if current == closed_marker() {
            return;
        }

        // Nobody asked for the actions to run, so we only free the nodes.
        while !current.is_null() {
            // SAFETY: We have exclusive access and every node came from `Box::into_raw()`.
            let node = unsafe { Box::from_raw(current) };
            current = node.next;
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::panic::catch_unwind;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(ResourceList: Send, Sync, fmt::Debug);

    fn counting_cleanup(counter: &Arc<AtomicUsize>) -> ResourceCleanup {
        let counter = Arc::clone(counter);
        ResourceCleanup::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn cleanup_runs_every_action_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let list = ResourceList::new();

        for _ in 0..5 {
            list.add(counting_cleanup(&counter)).unwrap();
        }

        assert_eq!(list.cleanup(), Ok(5));
        assert_eq!(counter.load(Ordering::Relaxed), 5);
        assert!(list.is_closed());
    }

    #[test]
    fn second_cleanup_fails() {
        let list = ResourceList::new();

        assert_eq!(list.cleanup(), Ok(0));
        assert_eq!(list.cleanup(), Err(ListAlreadyClosed));
    }

    #[test]
    fn add_after_cleanup_returns_action() {
        let counter = Arc::new(AtomicUsize::new(0));
        let list = ResourceList::new();
        list.cleanup().unwrap();

        let rejected = list.add(counting_cleanup(&counter)).unwrap_err();
        let rejected_exclusive = list.add_exclusive(counting_cleanup(&counter)).unwrap_err();

        assert_eq!(counter.load(Ordering::Relaxed), 0);

        rejected.run();
        rejected_exclusive.run();

        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn exclusive_and_shared_adds_mix() {
        let counter = Arc::new(AtomicUsize::new(0));
        let list = ResourceList::new();

        list.add_exclusive(counting_cleanup(&counter)).unwrap();
        list.add(counting_cleanup(&counter)).unwrap();
        list.add_exclusive(counting_cleanup(&counter)).unwrap();

        assert_eq!(list.cleanup(), Ok(3));
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn actions_run_most_recent_first() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let list = ResourceList::new();

        for i in 0..3 {
            let order = Arc::clone(&order);
            list.add(ResourceCleanup::new(move || order.lock().unwrap().push(i)))
                .unwrap();
        }

        list.cleanup().unwrap();

        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn panicking_action_does_not_suppress_others() {
        let counter = Arc::new(AtomicUsize::new(0));
        let list = ResourceList::new();

        list.add(counting_cleanup(&counter)).unwrap();
        list.add(ResourceCleanup::new(|| panic!("intentional panic")))
            .unwrap();
        list.add(counting_cleanup(&counter)).unwrap();

        let result = catch_unwind(AssertUnwindSafe(|| list.cleanup()));

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::Relaxed), 2);
        assert!(list.is_closed());
    }

    #[test]
    fn drop_without_cleanup_does_not_run_actions() {
        let counter = Arc::new(AtomicUsize::new(0));

        {
            let list = ResourceList::new();
            list.add(counting_cleanup(&counter)).unwrap();
            list.add(counting_cleanup(&counter)).unwrap();
        }

        assert_eq!(counter.load(Ordering::Relaxed), 0);
        // The closures (and their captured Arc clones) must have been dropped.
        assert_eq!(Arc::strong_count(&counter), 1);
    }

    #[cfg_attr(miri, ignore)] // Slow under Miri.
    #[test]
    fn concurrent_adds_are_all_observed() {
        const THREADS: usize = 8;
        const ADDS_PER_THREAD: usize = 500;

        let counter = Arc::new(AtomicUsize::new(0));
        let list = Arc::new(ResourceList::new());

        let threads = (0..THREADS)
            .map(|_| {
                let list = Arc::clone(&list);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..ADDS_PER_THREAD {
                        list.add(counting_cleanup(&counter)).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(list.cleanup(), Ok(THREADS * ADDS_PER_THREAD));
        assert_eq!(counter.load(Ordering::Relaxed), THREADS * ADDS_PER_THREAD);
    }
}
