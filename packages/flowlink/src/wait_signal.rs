//! Manual-reset signal that can be waited on by blocking threads and by async tasks alike.

use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use foldhash::{HashMap, HashMapExt};
use futures::future::BoxFuture;
use parking_lot::{Condvar, Mutex};

use crate::{CancellationToken, Clock, Deadline, SystemClock};

/// A resettable latch.
///
/// While set, every wait completes immediately. While not set, waiters block (or suspend, for
/// async waiters) until the next [`set()`][Self::set]. A single `set()` releases every waiter
/// that is waiting at that moment, blocking and async alike, with no ordering between the two.
///
/// Each `set()` starts a new generation. A waiter remembers the generation it started waiting
/// in and is released as soon as the generation moves on, so a [`reset()`][Self::reset] that
/// races with the wake-up cannot strand a waiter that was already released.
///
/// Timeouts of async waits are measured with the signal's [`Clock`]. Blocking waits are
/// measured with the operating system clock because they park the calling thread.
///
/// # Example
///
/// ```rust
/// use flowlink::WaitSignal;
///
/// let signal = WaitSignal::new();
/// assert!(!signal.is_set());
///
/// signal.set();
/// assert!(signal.wait_timeout(std::time::Duration::ZERO));
///
/// signal.reset();
/// assert!(signal.would_wait());
/// ```
#[derive(Debug)]
pub struct WaitSignal {
    shared: Arc<SignalShared>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug)]
struct SignalShared {
    // Mirrors `state.is_set` so that observers can check without taking the lock.
    is_set: AtomicBool,
    state: Mutex<SignalState>,
    condvar: Condvar,
}

#[derive(Debug)]
struct SignalState {
    is_set: bool,
    generation: u64,
    next_waiter_id: u64,
    waiters: HashMap<u64, Waker>,
}

impl WaitSignal {
    /// Creates a signal in the "not set" state, using the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(false, SystemClock::shared())
    }

    /// Creates a signal that starts out set.
    #[must_use]
    pub fn new_set() -> Self {
        Self::with_clock(true, SystemClock::shared())
    }

    /// Creates a signal with an explicit initial state and clock.
    #[must_use]
    pub fn with_clock(initially_set: bool, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(SignalShared::new(initially_set)),
            clock,
        }
    }

    /// Sets the signal, releasing all current waiters and every future waiter until reset.
    ///
    /// Setting an already set signal does nothing.
    #[cfg_attr(test, mutants::skip)] // Critical primitive - mutations only produce hangs.
    pub fn set(&self) {
        self.shared.set();
    }

    /// Clears the signal so that subsequent waits block again.
    ///
    /// Waiters that were released by an earlier `set()` are unaffected.
    pub fn reset(&self) {
        self.shared.reset();
    }

    /// Whether the signal is currently set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.shared.is_set()
    }

    /// Whether a wait started now would have to block.
    #[must_use]
    pub fn would_wait(&self) -> bool {
        !self.is_set()
    }

    /// Blocks the current thread until the signal is set.
    pub fn wait(&self) {
        self.shared.wait_until(Deadline::never());
    }

    /// Blocks the current thread until the signal is set or `timeout` elapses.
    ///
    /// Returns `true` if the signal was set, `false` on timeout.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.shared.wait_until(os_deadline(timeout))
    }

    /// Blocks the current thread until the signal is set or `deadline` passes.
    ///
    /// Returns `true` if the signal was set, `false` if the deadline passed first.
    #[must_use]
    pub fn wait_until(&self, deadline: Deadline) -> bool {
        self.shared.wait_until(deadline)
    }

    /// Waits asynchronously until the signal is set.
    ///
    /// Returns `true` if the signal was set, `false` if `timeout` elapsed (measured on the
    /// signal's clock) or `cancellation` was triggered first. A timed out or cancelled wait
    /// withdraws only its own registration; the signal and other waiters are untouched.
    pub async fn wait_async(
        &self,
        timeout: Option<Duration>,
        cancellation: Option<&CancellationToken>,
    ) -> bool {
        if self.is_set() {
            return true;
        }

        WaitAny {
            signalled: self.shared.wait_future(),
            cancelled: cancellation.map(CancellationToken::cancelled),
            timed_out: timeout.map(|timeout| self.clock.sleep(timeout)),
        }
        .await
    }

    /// Returns a handle that external wait infrastructure can block on or await.
    ///
    /// The handle shares state with this signal and stays valid after the signal is dropped.
    /// This implementation always provides a handle.
    #[must_use]
    pub fn try_native_handle(&self) -> Option<NativeWaitHandle> {
        Some(NativeWaitHandle {
            shared: Arc::clone(&self.shared),
        })
    }

    /// A future that completes when the signal is set, without timeout or cancellation.
    #[must_use]
    pub fn wait_future(&self) -> SignalWait {
        self.shared.wait_future()
    }

    /// The clock used for async timeouts.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[cfg(test)]
    fn registered_waiters(&self) -> usize {
        self.shared.state.lock().waiters.len()
    }
}

impl Default for WaitSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalShared {
    fn new(initially_set: bool) -> Self {
        Self {
            is_set: AtomicBool::new(initially_set),
            state: Mutex::new(SignalState {
                is_set: initially_set,
                generation: 0,
                next_waiter_id: 0,
                waiters: HashMap::new(),
            }),
            condvar: Condvar::new(),
        }
    }

    fn set(&self) {
        if self.is_set.load(Ordering::Acquire) {
            return;
        }

        let wakers = {
            let mut state = self.state.lock();

            if state.is_set {
                return;
            }

            state.is_set = true;
            state.generation = state.generation.wrapping_add(1);
            self.is_set.store(true, Ordering::Release);

            mem::take(&mut state.waiters)
        };

        self.condvar.notify_all();

        for (_, waker) in wakers {
            waker.wake();
        }
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.is_set = false;
        self.is_set.store(false, Ordering::Release);
    }

    fn is_set(&self) -> bool {
        self.is_set.load(Ordering::Acquire)
    }

    fn wait_until(&self, deadline: Deadline) -> bool {
        let mut state = self.state.lock();

        if state.is_set {
            return true;
        }

        let generation = state.generation;

        loop {
            match deadline.instant() {
                None => self.condvar.wait(&mut state),
                Some(at) => {
                    if self.condvar.wait_until(&mut state, at).timed_out() {
                        return state.generation != generation;
                    }
                }
            }

            // Spurious wake-ups leave the generation unchanged.
            if state.generation != generation {
                return true;
            }
        }
    }

    fn wait_future(self: &Arc<Self>) -> SignalWait {
        SignalWait {
            shared: Arc::clone(self),
            registration: None,
        }
    }
}

fn os_deadline(timeout: Duration) -> Deadline {
    Instant::now()
        .checked_add(timeout)
        .map_or_else(Deadline::never, Deadline::at)
}

/// A future that completes when the signal it was created from is set.
///
/// Dropping the future before completion withdraws its registration.
#[derive(Debug)]
pub struct SignalWait {
    shared: Arc<SignalShared>,
    registration: Option<Registration>,
}

#[derive(Clone, Copy, Debug)]
struct Registration {
    id: u64,
    generation: u64,
}

impl Future for SignalWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let mut state = this.shared.state.lock();

        match this.registration {
            None => {
                if state.is_set {
                    return Poll::Ready(());
                }

                let id = state.next_waiter_id;
                state.next_waiter_id = state.next_waiter_id.wrapping_add(1);
                state.waiters.insert(id, cx.waker().clone());

                this.registration = Some(Registration {
                    id,
                    generation: state.generation,
                });

                Poll::Pending
            }
            Some(registration) => {
                if state.generation != registration.generation {
                    // The releasing `set()` already drained our waker.
                    this.registration = None;
                    return Poll::Ready(());
                }

                state
                    .waiters
                    .entry(registration.id)
                    .and_modify(|waker| waker.clone_from(cx.waker()))
                    .or_insert_with(|| cx.waker().clone());

                Poll::Pending
            }
        }
    }
}

impl Drop for SignalWait {
    fn drop(&mut self) {
        if let Some(registration) = self.registration.take() {
            self.shared.state.lock().waiters.remove(&registration.id);
        }
    }
}

struct WaitAny {
    signalled: SignalWait,
    cancelled: Option<SignalWait>,
    timed_out: Option<BoxFuture<'static, ()>>,
}

impl Future for WaitAny {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        let this = self.get_mut();

        if Pin::new(&mut this.signalled).poll(cx).is_ready() {
            return Poll::Ready(true);
        }

        if let Some(cancelled) = this.cancelled.as_mut() {
            if Pin::new(cancelled).poll(cx).is_ready() {
                return Poll::Ready(false);
            }
        }

        if let Some(timed_out) = this.timed_out.as_mut() {
            if timed_out.as_mut().poll(cx).is_ready() {
                return Poll::Ready(false);
            }
        }

        Poll::Pending
    }
}

/// A detached handle to a [`WaitSignal`], for interop with external wait infrastructure.
///
/// Obtained from [`WaitSignal::try_native_handle()`]. The handle can be cloned freely and
/// moved to other threads; it observes the same state as the signal it came from.
#[derive(Clone, Debug)]
pub struct NativeWaitHandle {
    shared: Arc<SignalShared>,
}

impl NativeWaitHandle {
    /// Whether the underlying signal is currently set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.shared.is_set()
    }

    /// Blocks the current thread until the underlying signal is set.
    pub fn wait(&self) {
        self.shared.wait_until(Deadline::never());
    }

    /// Blocks the current thread until the underlying signal is set or `timeout` elapses.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.shared.wait_until(os_deadline(timeout))
    }

    /// Returns a future that completes when the underlying signal is set.
    #[must_use]
    pub fn wait_future(&self) -> SignalWait {
        self.shared.wait_future()
    }
}
