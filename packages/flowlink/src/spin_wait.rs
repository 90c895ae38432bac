use std::hint::spin_loop;
use std::thread;

/// After this many spins, further spinning yields the thread instead of burning CPU.
const YIELD_THRESHOLD: u32 = 10;

/// How a contended lock acquisition spends the time between attempts.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SpinPolicy {
    /// Spin for a short while, then suspend until the lock is released.
    #[default]
    Balanced,

    /// Suspend until the lock is released after every failed attempt.
    NoSpinning,

    /// Never suspend. Spin, and once spinning gets long, yield the thread between attempts.
    ///
    /// Async acquisitions with this policy do not yield to the executor.
    OnlySpinning,
}

impl SpinPolicy {
    pub(crate) fn should_spin(self, spin: &SpinWait) -> bool {
        match self {
            Self::OnlySpinning => true,
            Self::Balanced => !spin.next_spin_will_yield(),
            Self::NoSpinning => false,
        }
    }
}

/// Exponential CPU backoff that degrades into thread yields.
#[derive(Debug, Default)]
pub(crate) struct SpinWait {
    count: u32,
}

impl SpinWait {
    pub(crate) const fn new() -> Self {
        Self { count: 0 }
    }

    pub(crate) fn next_spin_will_yield(&self) -> bool {
        self.count >= YIELD_THRESHOLD
    }

    pub(crate) fn spin_once(&mut self) {
        if self.next_spin_will_yield() {
            thread::yield_now();
        } else {
            for _ in 0..(1_u32 << self.count) {
                spin_loop();
            }
        }

        self.count = self.count.saturating_add(1);
    }

    pub(crate) fn reset(&mut self) {
        self.count = 0;
    }
}
