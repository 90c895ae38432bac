#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for tests, benchmarks and examples in flowlink packages.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Runs a test with a timeout to prevent infinite hangs.
///
/// Synchronization tests fail by hanging more often than by asserting. This wraps the test body
/// so that a hang becomes a panic instead of a stuck CI job.
///
/// The timeout is 10 seconds under normal conditions and 60 seconds under
/// Miri, where thread synchronization primitives are significantly slower.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog
/// is disabled and the test function is executed directly, so that mutation
/// testing can detect hanging mutations through its own timeout.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode).
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// with_watchdog(|| {
///     assert_eq!(2 + 2, 4);
/// });
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // If this fails, the watchdog has already given up on us.
        drop(tx.send(result));
    });

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_handle.join().expect("test thread should not panic after sending its result");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test exceeded the {timeout:?} watchdog timeout");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("test thread disconnected unexpectedly"),
            Err(e) => std::panic::resume_unwind(e),
        },
    }
}

/// A thread-safe, ordered log of observed values.
///
/// Test sinks push every message they receive into a recorder; the test then inspects what
/// arrived, optionally blocking until a given number of values has been observed.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
///
/// use testing::Recorder;
///
/// let recorder = Recorder::new();
/// recorder.record("first");
///
/// assert!(recorder.wait_for_len(1, Duration::from_secs(1)));
/// assert_eq!(recorder.values(), vec!["first"]);
/// ```
#[derive(Debug)]
pub struct Recorder<T> {
    values: Mutex<Vec<T>>,
    changed: Condvar,
}

impl<T> Recorder<T> {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: Mutex::new(Vec::new()),
            changed: Condvar::new(),
        }
    }

    /// Appends a value and wakes anyone waiting for the log to grow.
    pub fn record(&self, value: T) {
        self.values.lock().push(value);
        self.changed.notify_all();
    }

    /// The number of values recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    /// Whether nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }

    /// Blocks until at least `len` values have been recorded or `timeout` elapses.
    ///
    /// Returns whether the length was reached.
    #[must_use]
    pub fn wait_for_len(&self, len: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut values = self.values.lock();

        while values.len() < len {
            if self.changed.wait_until(&mut values, deadline).timed_out() {
                return values.len() >= len;
            }
        }

        true
    }
}

impl<T: Clone> Recorder<T> {
    /// A copy of every value recorded so far, in recording order.
    #[must_use]
    pub fn values(&self) -> Vec<T> {
        self.values.lock().clone()
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn watchdog_returns_value() {
        let result = with_watchdog(|| 42);
        assert_eq!(result, 42);
    }

    #[test]
    fn recorder_keeps_order() {
        let recorder = Recorder::new();

        recorder.record(3);
        recorder.record(1);
        recorder.record(2);

        assert_eq!(recorder.values(), vec![3, 1, 2]);
        assert_eq!(recorder.len(), 3);
    }

    #[test]
    fn wait_for_len_sees_values_from_other_threads() {
        with_watchdog(|| {
            let recorder = Arc::new(Recorder::new());

            let producer = thread::spawn({
                let recorder = Arc::clone(&recorder);
                move || {
                    for value in 0..5 {
                        recorder.record(value);
                    }
                }
            });

            assert!(recorder.wait_for_len(5, Duration::from_secs(5)));
            producer.join().unwrap();
        });
    }

    #[test]
    fn wait_for_len_times_out() {
        let recorder = Recorder::<u8>::new();

        assert!(!recorder.wait_for_len(1, Duration::from_millis(10)));
        assert!(recorder.is_empty());
    }
}
