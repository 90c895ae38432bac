//! Reader-writer lock that spins briefly and then suspends, for blocking and async callers.
//!
//! The whole lock state lives in one `AtomicI32`:
//!
//! * `0` - unlocked.
//! * `> 0` - write-locked; the value is a sentinel, not a count.
//! * `< 0` - read-locked; the magnitude is the number of readers.
//!
//! Every transition is a single compare-and-swap (or, for reader release, an atomic increment),
//! so no intermediate state is ever visible to other threads.
//!
//! Fairness is approximate. Each contender counts its failed attempts ("pressure") and publishes
//! the highest count per side. A contender whose own pressure is below the published maximum of
//! its side lets the more starved peers go first, and new readers defer to writers while writer
//! pressure is at least as high as reader pressure. Whoever finally acquires resets the published
//! maximum of its side to zero.

use std::cell::UnsafeCell;
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::spin_wait::SpinWait;
use crate::{SpinPolicy, WaitSignal};

const UNLOCKED: i32 = 0;
const WRITE_LOCKED: i32 = 1;

/// Decoded view of the lock state word.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockState {
    /// Nobody holds the lock.
    Unlocked,

    /// The lock is held by this many readers.
    ReadLocked(u32),

    /// The lock is held by one writer.
    WriteLocked,
}

impl LockState {
    fn decode(raw: i32) -> Self {
        match raw.cmp(&UNLOCKED) {
            CmpOrdering::Equal => Self::Unlocked,
            CmpOrdering::Greater => Self::WriteLocked,
            CmpOrdering::Less => Self::ReadLocked(raw.unsigned_abs()),
        }
    }
}

/// What a contender does after a failed acquisition attempt.
enum Backoff {
    Retry,
    Suspend,
}

/// One contender's failed attempts, published to the shared maximum of its side.
///
/// A contender that gives up before acquiring (a dropped async acquisition) withdraws its
/// published value, unless someone has since published a higher one or already reset it.
struct Pressure<'a> {
    max: &'a AtomicU32,
    own: u32,
}

impl<'a> Pressure<'a> {
    fn new(max: &'a AtomicU32) -> Self {
        Self { max, own: 0 }
    }

    fn raise(&mut self) {
        self.own = self.own.saturating_add(1);
        self.max.fetch_max(self.own, Ordering::Relaxed);
    }

    fn acquired(mut self) {
        self.max.store(0, Ordering::Relaxed);
        self.own = 0;
    }
}

impl Drop for Pressure<'_> {
    fn drop(&mut self) {
        if self.own > 0 {
            // Losing the exchange means the published value is no longer ours to withdraw.
            _ = self
                .max
                .compare_exchange(self.own, 0, Ordering::Relaxed, Ordering::Relaxed);
        }
    }
}

/// A reader-writer lock with spin-then-suspend backoff and starvation control.
///
/// Any number of readers may hold the lock at the same time; a writer holds it alone.
/// Acquisition is available both as blocking calls ([`read()`][Self::read],
/// [`write()`][Self::write]) and as async calls ([`read_async()`][Self::read_async],
/// [`write_async()`][Self::write_async]) on the same lock.
///
/// Guards release the lock when dropped. A guard that is never dropped starves every other
/// contender; this is not detected.
///
/// # Example
///
/// ```rust
/// use flowlink::HybridRwLock;
///
/// let lock = HybridRwLock::new(5);
///
/// {
///     let first = lock.read();
///     let second = lock.read();
///     assert_eq!(*first + *second, 10);
/// }
///
/// *lock.write() += 1;
/// assert_eq!(*lock.read(), 6);
/// ```
pub struct HybridRwLock<T> {
    state: AtomicI32,
    max_read_pressure: AtomicU32,
    max_write_pressure: AtomicU32,

    // Set whenever the lock becomes free; suspended contenders wait on it.
    released: WaitSignal,

    policy: SpinPolicy,
    data: UnsafeCell<T>,
}

// SAFETY: The lock owns the data; moving the lock to another thread moves the data with it.
unsafe impl<T: Send> Send for HybridRwLock<T> {}

// SAFETY: Writers get exclusive access (requires T: Send as with a mutex) and readers get
// shared access from many threads at once (requires T: Sync).
unsafe impl<T: Send + Sync> Sync for HybridRwLock<T> {}

impl<T> HybridRwLock<T> {
    /// Creates an unlocked lock with the [`SpinPolicy::Balanced`] policy.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self::with_policy(value, SpinPolicy::default())
    }

    /// Creates an unlocked lock whose plain acquisition methods use `policy`.
    #[must_use]
    pub fn with_policy(value: T, policy: SpinPolicy) -> Self {
        Self {
            state: AtomicI32::new(UNLOCKED),
            max_read_pressure: AtomicU32::new(0),
            max_write_pressure: AtomicU32::new(0),
            released: WaitSignal::new_set(),
            policy,
            data: UnsafeCell::new(value),
        }
    }

    /// The policy used by [`read()`][Self::read], [`write()`][Self::write] and their async
    /// counterparts.
    #[must_use]
    pub fn policy(&self) -> SpinPolicy {
        self.policy
    }

    /// A snapshot of the lock state. It may be stale by the time the caller looks at it.
    #[must_use]
    pub fn state(&self) -> LockState {
        LockState::decode(self.state.load(Ordering::Relaxed))
    }

    /// Acquires shared access, blocking the current thread while necessary.
    pub fn read(&self) -> ReadGuard<'_, T> {
        self.read_with(self.policy)
    }

    /// Acquires shared access with an explicit backoff policy.
    #[cfg_attr(test, mutants::skip)] // Mutations mostly produce hangs.
    pub fn read_with(&self, policy: SpinPolicy) -> ReadGuard<'_, T> {
        let mut spin = SpinWait::new();
        let mut pressure = Pressure::new(&self.max_read_pressure);

        while !self.try_enter_read(pressure.own) {
            pressure.raise();

            let backoff =
                self.backoff(policy, &mut spin, |current| self.reader_must_wait(current, u32::MAX));

            if matches!(backoff, Backoff::Suspend) {
                self.released.wait();
                spin.reset();
            }
        }

        pressure.acquired();
        ReadGuard { lock: self }
    }

    /// Acquires shared access, suspending the current task while necessary.
    pub async fn read_async(&self) -> ReadGuard<'_, T> {
        self.read_async_with(self.policy).await
    }

    /// Acquires shared access asynchronously with an explicit backoff policy.
    #[cfg_attr(test, mutants::skip)] // Mutations mostly produce hangs.
    pub async fn read_async_with(&self, policy: SpinPolicy) -> ReadGuard<'_, T> {
        let mut spin = SpinWait::new();
        let mut pressure = Pressure::new(&self.max_read_pressure);

        while !self.try_enter_read(pressure.own) {
            pressure.raise();

            let backoff =
                self.backoff(policy, &mut spin, |current| self.reader_must_wait(current, u32::MAX));

            if matches!(backoff, Backoff::Suspend) {
                self.released.wait_future().await;
                spin.reset();
            }
        }

        pressure.acquired();
        ReadGuard { lock: self }
    }

    /// Acquires shared access if that is possible without waiting.
    #[must_use]
    pub fn try_read(&self) -> Option<ReadGuard<'_, T>> {
        let current = self.state.load(Ordering::Relaxed);

        if current > UNLOCKED {
            return None;
        }

        let next = current.checked_sub(1)?;

        self.state
            .compare_exchange(current, next, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ReadGuard { lock: self })
    }

    /// Acquires exclusive access, blocking the current thread while necessary.
    pub fn write(&self) -> WriteGuard<'_, T> {
        self.write_with(self.policy)
    }

    /// Acquires exclusive access with an explicit backoff policy.
    #[cfg_attr(test, mutants::skip)] // Mutations mostly produce hangs.
    pub fn write_with(&self, policy: SpinPolicy) -> WriteGuard<'_, T> {
        let mut spin = SpinWait::new();
        let mut pressure = Pressure::new(&self.max_write_pressure);

        while !self.try_enter_write(pressure.own) {
            pressure.raise();

            let backoff =
                self.backoff(policy, &mut spin, |current| self.writer_must_wait(current, u32::MAX));

            if matches!(backoff, Backoff::Suspend) {
                self.released.wait();
                spin.reset();
            }
        }

        pressure.acquired();
        WriteGuard { lock: self }
    }

    /// Acquires exclusive access, suspending the current task while necessary.
    pub async fn write_async(&self) -> WriteGuard<'_, T> {
        self.write_async_with(self.policy).await
    }

    /// Acquires exclusive access asynchronously with an explicit backoff policy.
    #[cfg_attr(test, mutants::skip)] // Mutations mostly produce hangs.
    pub async fn write_async_with(&self, policy: SpinPolicy) -> WriteGuard<'_, T> {
        let mut spin = SpinWait::new();
        let mut pressure = Pressure::new(&self.max_write_pressure);

        while !self.try_enter_write(pressure.own) {
            pressure.raise();

            let backoff =
                self.backoff(policy, &mut spin, |current| self.writer_must_wait(current, u32::MAX));

            if matches!(backoff, Backoff::Suspend) {
                self.released.wait_future().await;
                spin.reset();
            }
        }

        pressure.acquired();
        WriteGuard { lock: self }
    }

    /// Acquires exclusive access if that is possible without waiting.
    #[must_use]
    pub fn try_write(&self) -> Option<WriteGuard<'_, T>> {
        self.state
            .compare_exchange(UNLOCKED, WRITE_LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| WriteGuard { lock: self })
    }

    /// Mutable access without locking; the borrow checker proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consumes the lock and returns the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    fn reader_must_wait(&self, current: i32, pressure: u32) -> bool {
        current > UNLOCKED
            || (current < UNLOCKED
                && self.max_write_pressure.load(Ordering::Relaxed)
                    >= self.max_read_pressure.load(Ordering::Relaxed))
            || pressure < self.max_read_pressure.load(Ordering::Relaxed)
    }

    fn writer_must_wait(&self, current: i32, pressure: u32) -> bool {
        current != UNLOCKED || pressure < self.max_write_pressure.load(Ordering::Relaxed)
    }

    fn try_enter_read(&self, pressure: u32) -> bool {
        let current = self.state.load(Ordering::Relaxed);

        if self.reader_must_wait(current, pressure) {
            return false;
        }

        let Some(next) = current.checked_sub(1) else {
            return false;
        };

        self.state
            .compare_exchange(current, next, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn try_enter_write(&self, pressure: u32) -> bool {
        let current = self.state.load(Ordering::Relaxed);

        !self.writer_must_wait(current, pressure)
            && self
                .state
                .compare_exchange(UNLOCKED, WRITE_LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    fn backoff(
        &self,
        policy: SpinPolicy,
        spin: &mut SpinWait,
        must_wait: impl Fn(i32) -> bool,
    ) -> Backoff {
        if policy.should_spin(spin) {
            spin.spin_once();
            return Backoff::Retry;
        }

        // Arm the signal first and only then look at the state again. A release that happens
        // after this point sets the signal, so the wait below cannot miss it.
        self.released.reset();

        if must_wait(self.state.load(Ordering::Acquire)) {
            Backoff::Suspend
        } else {
            Backoff::Retry
        }
    }

    fn exit_read(&self) {
        let remaining = self.state.fetch_add(1, Ordering::Release).wrapping_add(1);

        if remaining == UNLOCKED {
            self.released.set();
        }
    }

    fn exit_write(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
        self.released.set();
    }
}

impl<T: Default> Default for HybridRwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for HybridRwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridRwLock")
            .field("state", &self.state())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Shared access to the value of a [`HybridRwLock`]. Releases the lock when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ReadGuard<'a, T> {
    lock: &'a HybridRwLock<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: We hold a read lock, so no writer can exist until we are dropped.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.exit_read();
    }
}

impl<T: fmt::Debug> fmt::Debug for ReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Exclusive access to the value of a [`HybridRwLock`]. Releases the lock when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a, T> {
    lock: &'a HybridRwLock<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: We hold the write lock, so nobody else can access the data.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: We hold the write lock, so nobody else can access the data.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.exit_write();
    }
}

impl<T: fmt::Debug> fmt::Debug for WriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
