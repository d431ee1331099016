#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for multi-threaded tests.
//!
//! Concurrency bugs in scope lifecycle code tend to show up as hangs (a closer spinning on a
//! window that never closes, an accessor waiting on a close that never resolves). The watchdog
//! turns such a hang into a test failure instead of a stalled test run.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Default time a watched test may run. Miri is much slower at thread synchronization.
fn default_timeout() -> Duration {
    if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    }
}

/// Runs `test_fn` on a separate thread and fails if it does not finish within the default
/// timeout (10 seconds, or 60 seconds under Miri).
///
/// Panics from `test_fn` are propagated to the caller.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", `test_fn` runs directly on
/// the calling thread so that mutation testing can detect mutations that cause hangs.
///
/// # Panics
///
/// Panics if the test exceeds the timeout.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let answer = with_watchdog(|| 6 * 7);
/// assert_eq!(answer, 42);
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    with_watchdog_timeout(default_timeout(), test_fn)
}

/// Like [`with_watchdog()`] but with a custom timeout.
///
/// # Panics
///
/// Panics if the test exceeds `timeout`.
pub fn with_watchdog_timeout<F, R>(timeout: Duration, test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (result_tx, result_rx) = mpsc::channel();

    let test_thread = thread::Builder::new()
        .name("watched-test".to_string())
        .spawn(move || {
            // If the watchdog already gave up, nobody is listening any more.
            drop(result_tx.send(test_fn()));
        })
        .expect("failed to spawn watched test thread");

    match result_rx.recv_timeout(timeout) {
        Ok(result) => {
            test_thread
                .join()
                .expect("watched test thread panicked after reporting its result");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test did not complete within {timeout:?}; it is probably hanging");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_thread.join() {
            Ok(()) => panic!("watched test thread exited without reporting a result"),
            Err(payload) => std::panic::resume_unwind(payload),
        },
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn returns_result_of_fast_test() {
        assert_eq!(with_watchdog(|| 42), 42);
    }

    #[test]
    #[should_panic]
    fn propagates_panic() {
        with_watchdog(|| panic!("intentional panic"));
    }

    #[cfg_attr(miri, ignore)] // Sleeping under Miri is slow.
    #[test]
    #[should_panic]
    fn fails_hanging_test() {
        with_watchdog_timeout(Duration::from_millis(10), || {
            thread::sleep(Duration::from_secs(5));
        });
    }
}
