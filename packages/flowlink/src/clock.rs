//! Time sources and the deadline representation shared by every timeout in the crate.
//!
//! Components never read the process clock directly. Each time-aware type receives an
//! `Arc<dyn Clock>` at construction, which lets tests drive time by hand via [`ManualClock`].

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::warn;

/// A source of the current time that can also produce timers.
///
/// The same clock is used to compute [`Deadline`]s and to sleep until they pass, so that all
/// timeouts of a component agree with each other.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Debug + Send + Sync + 'static {
    /// Returns the current time.
    fn now(&self) -> Instant;

    /// Returns a future that completes once `duration` has passed on this clock.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;

    /// Blocks the current thread until `duration` has passed on this clock.
    fn sleep_blocking(&self, duration: Duration) {
        futures::executor::block_on(self.sleep(duration));
    }
}

/// The real clock, backed by [`Instant::now`].
///
/// Timers use the Tokio time driver when [`sleep()`][Clock::sleep] is first polled inside a
/// Tokio runtime. On any other executor each sleep is served by a short-lived timer thread that
/// exits early if the sleep is dropped.
///
/// # Panics
///
/// Polling a sleep inside a Tokio runtime that was built without the time driver panics, as
/// Tokio timers always do there.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Returns the system clock as a shareable trait object.
    #[must_use]
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if tokio::runtime::Handle::try_current().is_ok() {
                tokio::time::sleep(duration).await;
            } else {
                ThreadSleep::start(duration).await;
            }
        })
    }

    fn sleep_blocking(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// A sleep served by a dedicated thread, for executors without a timer of their own.
struct ThreadSleep {
    // Dropped before the timer thread is unparked so that it observes the closed channel.
    receiver: Option<oneshot::Receiver<()>>,
    timer: Option<Thread>,
}

impl ThreadSleep {
    fn start(duration: Duration) -> Self {
        let (sender, receiver) = oneshot::channel();

        let spawned = thread::Builder::new()
            .name("flowlink-timer".to_string())
            .spawn(move || {
                let deadline = Instant::now().checked_add(duration);

                loop {
                    if sender.is_closed() {
                        return;
                    }

                    let remaining = match deadline {
                        Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                        None => Duration::MAX,
                    };

                    if remaining.is_zero() {
                        // The sleeper may already be gone, which is fine.
                        _ = sender.send(());
                        return;
                    }

                    thread::park_timeout(remaining);
                }
            });

        match spawned {
            Ok(handle) => Self {
                receiver: Some(receiver),
                timer: Some(handle.thread().clone()),
            },
            Err(error) => {
                // Without a timer the sleep completes at once; callers see an early timeout.
                warn!(%error, "cannot start timer thread");
                Self {
                    receiver: None,
                    timer: None,
                }
            }
        }
    }
}

impl Future for ThreadSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        match this.receiver.as_mut() {
            // The thread keeps the sender until it fires, so an error here cannot cut it short.
            Some(receiver) => Pin::new(receiver).poll(cx).map(|_| ()),
            None => Poll::Ready(()),
        }
    }
}

impl Drop for ThreadSleep {
    fn drop(&mut self) {
        drop(self.receiver.take());

        if let Some(timer) = self.timer.take() {
            timer.unpark();
        }
    }
}

/// A clock that only moves when told to.
///
/// Time starts at the moment of creation and advances via [`advance()`][Self::advance].
/// Sleepers are woken when the clock is advanced past their wake-up time.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
///
/// use flowlink::{Clock, ManualClock};
///
/// let clock = ManualClock::new();
/// let start = clock.now();
///
/// clock.advance(Duration::from_secs(5));
/// assert_eq!(clock.now() - start, Duration::from_secs(5));
/// ```
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    state: Arc<Mutex<ManualState>>,
}

#[derive(Debug, Default)]
struct ManualState {
    elapsed: Duration,
    next_sleeper_id: u64,
    sleepers: Vec<Sleeper>,
}

#[derive(Debug)]
struct Sleeper {
    id: u64,
    wake_at: Duration,
    waker: Waker,
}

impl ManualClock {
    /// Creates a clock frozen at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Arc::new(Mutex::new(ManualState::default())),
        }
    }

    /// Creates a clock and returns it as a shareable trait object alongside a typed handle.
    #[must_use]
    pub fn shared() -> (Arc<Self>, Arc<dyn Clock>) {
        let clock = Arc::new(Self::new());
        let as_dyn: Arc<dyn Clock> = Arc::clone(&clock) as Arc<dyn Clock>;
        (clock, as_dyn)
    }

    /// Moves the clock forward, waking every sleeper whose time has come.
    pub fn advance(&self, duration: Duration) {
        let due = {
            let mut state = self.state.lock();
            state.elapsed = state.elapsed.saturating_add(duration);
            let elapsed = state.elapsed;

            let (due, waiting): (Vec<_>, Vec<_>) = state
                .sleepers
                .drain(..)
                .partition(|sleeper| sleeper.wake_at <= elapsed);
            state.sleepers = waiting;
            due
        };

        // Wake outside the lock; a woken task may immediately poll and need the lock.
        for sleeper in due {
            sleeper.waker.wake();
        }
    }

    /// Returns how far the clock has been advanced since creation.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }

    #[cfg(test)]
    pub(crate) fn pending_sleepers(&self) -> usize {
        self.state.lock().sleepers.len()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin
            .checked_add(self.state.lock().elapsed)
            .unwrap_or(self.origin)
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let wake_at = self.state.lock().elapsed.saturating_add(duration);

        Box::pin(ManualSleep {
            state: Arc::clone(&self.state),
            wake_at,
            id: None,
        })
    }
}

struct ManualSleep {
    state: Arc<Mutex<ManualState>>,
    wake_at: Duration,
    id: Option<u64>,
}

impl Future for ManualSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let mut state = this.state.lock();

        if state.elapsed >= this.wake_at {
            if let Some(id) = this.id.take() {
                state.sleepers.retain(|sleeper| sleeper.id != id);
            }
            return Poll::Ready(());
        }

        if let Some(id) = this.id {
            if let Some(sleeper) = state.sleepers.iter_mut().find(|sleeper| sleeper.id == id) {
                sleeper.waker.clone_from(cx.waker());
                return Poll::Pending;
            }
        }

        let id = state.next_sleeper_id;
        state.next_sleeper_id = state.next_sleeper_id.wrapping_add(1);
        state.sleepers.push(Sleeper {
            id,
            wake_at: this.wake_at,
            waker: cx.waker().clone(),
        });
        this.id = Some(id);

        Poll::Pending
    }
}

impl Drop for ManualSleep {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.state.lock().sleepers.retain(|sleeper| sleeper.id != id);
        }
    }
}

/// A point in time after which an operation is considered timed out.
///
/// A deadline may also be "never", in which case it never expires.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// A deadline `timeout` after the current time of `clock`.
    ///
    /// A timeout too large to represent yields a deadline that never expires.
    #[must_use]
    pub fn after(clock: &dyn Clock, timeout: Duration) -> Self {
        Self {
            at: clock.now().checked_add(timeout),
        }
    }

    /// A deadline at a specific instant.
    #[must_use]
    pub const fn at(instant: Instant) -> Self {
        Self { at: Some(instant) }
    }

    /// A deadline that never expires.
    #[must_use]
    pub const fn never() -> Self {
        Self { at: None }
    }

    /// The instant of the deadline, or `None` if it never expires.
    #[must_use]
    pub const fn instant(&self) -> Option<Instant> {
        self.at
    }

    /// Whether the deadline has been reached at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.at.is_some_and(|at| now >= at)
    }

    /// Time left until the deadline, or `None` if it never expires.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(now))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::task::Context;

    use futures::task::noop_waker_ref;

    use super::*;

    #[test]
    fn manual_clock_starts_frozen() {
        let clock = ManualClock::new();

        let first = clock.now();
        let second = clock.now();

        assert_eq!(first, second);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new();
        let start = clock.now();

        clock.advance(Duration::from_millis(250));
        clock.advance(Duration::from_millis(250));

        assert_eq!(clock.now() - start, Duration::from_millis(500));
    }

    #[test]
    fn manual_sleep_completes_only_after_advance() {
        let clock = ManualClock::new();
        let mut cx = Context::from_waker(noop_waker_ref());

        let mut sleep = clock.sleep(Duration::from_secs(1));
        assert!(sleep.as_mut().poll(&mut cx).is_pending());

        clock.advance(Duration::from_millis(999));
        assert!(sleep.as_mut().poll(&mut cx).is_pending());

        clock.advance(Duration::from_millis(1));
        assert!(sleep.as_mut().poll(&mut cx).is_ready());
    }

    #[test]
    fn dropped_sleep_deregisters() {
        let clock = ManualClock::new();
        let mut cx = Context::from_waker(noop_waker_ref());

        let mut sleep = clock.sleep(Duration::from_secs(1));
        assert!(sleep.as_mut().poll(&mut cx).is_pending());
        assert_eq!(clock.state.lock().sleepers.len(), 1);

        drop(sleep);
        assert!(clock.state.lock().sleepers.is_empty());
    }

    #[test]
    fn zero_sleep_is_immediately_ready() {
        let clock = ManualClock::new();
        let mut cx = Context::from_waker(noop_waker_ref());

        let mut sleep = clock.sleep(Duration::ZERO);
        assert!(sleep.as_mut().poll(&mut cx).is_ready());
    }

    #[test]
    fn system_sleep_works_without_tokio_runtime() {
        testing::with_watchdog(|| {
            let started = Instant::now();

            futures::executor::block_on(SystemClock.sleep(Duration::from_millis(10)));

            assert!(started.elapsed() >= Duration::from_millis(10));
        });
    }

    #[cfg_attr(miri, ignore)]
    #[tokio::test]
    async fn system_sleep_uses_tokio_timer_inside_runtime() {
        let started = Instant::now();

        SystemClock.sleep(Duration::from_millis(10)).await;

        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn deadline_after_uses_clock_time() {
        let base = Instant::now();
        let mut clock = MockClock::new();
        clock.expect_now().return_const(base);

        let deadline = Deadline::after(&clock, Duration::from_secs(5));

        assert_eq!(deadline.instant(), Some(base + Duration::from_secs(5)));
        assert!(!deadline.is_expired(base + Duration::from_secs(4)));
        assert!(deadline.is_expired(base + Duration::from_secs(5)));
        assert_eq!(
            deadline.remaining(base + Duration::from_secs(2)),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn never_deadline_does_not_expire() {
        let deadline = Deadline::never();

        assert!(!deadline.is_expired(Instant::now() + Duration::from_secs(1_000_000)));
        assert_eq!(deadline.remaining(Instant::now()), None);
    }

    #[test]
    fn oversized_timeout_never_expires() {
        let clock = ManualClock::new();

        let deadline = Deadline::after(&clock, Duration::MAX);

        assert_eq!(deadline, Deadline::never());
    }
}
