//! Sliding-window suppression of repeated messages.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tracing::{debug, trace, warn};

use crate::{
    Clock, Deadline, FanOutPolicy, HybridRwLock, Result, Sink, Source, SourceHelper, SystemClock,
    WaitSignal,
};

/// How often the background thread purges expired entries, unless configured otherwise.
pub const DEFAULT_CLEANUP_PERIOD: Duration = Duration::from_secs(10);

/// The cleanup period is never shorter than this many suppression windows.
const CLEANUP_PERIOD_FACTOR: u32 = 100;

/// The cleanup thread never wakes more often than this.
const MIN_CLEANUP_PERIOD: Duration = Duration::from_millis(1);

type Equivalence<M> = Box<dyn Fn(&M, &M) -> bool + Send + Sync>;

/// A forwarding node that drops messages equivalent to one it has already forwarded within
/// the suppression window.
///
/// Every forwarded message opens a window of the configured suppression time. While the window
/// is open, equivalent messages are dropped silently. Once it has passed, the next equivalent
/// message is forwarded again and opens a new window.
///
/// Expired entries are purged lazily on every post. A background thread additionally purges
/// them periodically so that a quiet suppressor does not hold on to old messages; it can be
/// disabled through the builder, in which case [`cleanup()`][Self::cleanup] does the same on
/// demand.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use flowlink::{DuplicateSuppressor, ManualClock, PriorityReceiver, Sink, Source};
///
/// let (clock, shared_clock) = ManualClock::shared();
///
/// let suppressor = DuplicateSuppressor::<u32>::builder(Duration::from_secs(1))
///     .clock(shared_clock)
///     .background_cleanup(false)
///     .build();
///
/// let receiver = suppressor.connect_to(&Arc::new(PriorityReceiver::<u32>::new()));
///
/// suppressor.post(7).unwrap();
/// assert_eq!(receiver.try_receive(), Some(7));
///
/// // Within the window, the repeat is dropped.
/// suppressor.post(7).unwrap();
/// assert_eq!(receiver.try_receive(), None);
///
/// clock.advance(Duration::from_secs(2));
///
/// suppressor.post(7).unwrap();
/// assert_eq!(receiver.try_receive(), Some(7));
/// ```
pub struct DuplicateSuppressor<M: 'static> {
    core: Arc<SuppressorCore<M>>,
    helper: SourceHelper<M>,
    cleanup_thread: Option<CleanupThread>,
}

struct SuppressorCore<M> {
    // Ordered by expiry: every entry gets the same suppression time.
    window: HybridRwLock<VecDeque<(M, Deadline)>>,
    suppression_time: Duration,
    equivalence: Equivalence<M>,
    clock: Arc<dyn Clock>,
}

struct CleanupThread {
    stop: Arc<WaitSignal>,
    handle: Option<JoinHandle<()>>,
}

impl<M> DuplicateSuppressor<M>
where
    M: PartialEq + Send + Sync + 'static,
{
    /// Starts building a suppressor that treats equal messages as duplicates.
    #[must_use]
    pub fn builder(suppression_time: Duration) -> DuplicateSuppressorBuilder<M> {
        DuplicateSuppressorBuilder::new(suppression_time, Box::new(|a: &M, b: &M| a == b))
    }

    /// Creates a suppressor with default settings and a background cleanup thread.
    #[must_use]
    pub fn new(suppression_time: Duration) -> Self {
        Self::builder(suppression_time).build()
    }
}

impl<M> DuplicateSuppressor<M>
where
    M: Send + Sync + 'static,
{
    /// Starts building a suppressor with a custom duplicate test.
    ///
    /// `equivalence(incoming, seen)` returning `true` suppresses `incoming`.
    #[must_use]
    pub fn with_equivalence<F>(
        suppression_time: Duration,
        equivalence: F,
    ) -> DuplicateSuppressorBuilder<M>
    where
        F: Fn(&M, &M) -> bool + Send + Sync + 'static,
    {
        DuplicateSuppressorBuilder::new(suppression_time, Box::new(equivalence))
    }

    /// Marks `message` as seen, suppressing equivalent messages for one suppression window,
    /// without forwarding it.
    pub fn add_suppressor(&self, message: M) {
        let expiry = self.core.expiry(self.core.clock.now());
        self.core.window.write().push_back((message, expiry));
    }

    /// Removes every entry whose window has passed. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        self.core.cleanup()
    }

    /// The number of entries currently suppressing messages, including expired ones that have
    /// not been purged yet.
    #[must_use]
    pub fn suppressor_count(&self) -> usize {
        self.core.window.read().len()
    }

    /// The configured suppression window.
    #[must_use]
    pub fn suppression_time(&self) -> Duration {
        self.core.suppression_time
    }

    /// Whether a background cleanup thread is running for this suppressor.
    #[must_use]
    pub fn has_background_cleanup(&self) -> bool {
        self.cleanup_thread.is_some()
    }
}

impl<M> SuppressorCore<M>
where
    M: Send + Sync + 'static,
{
    fn expiry(&self, now: Instant) -> Deadline {
        now.checked_add(self.suppression_time)
            .map_or_else(Deadline::never, Deadline::at)
    }

    fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let removed = purge_expired(&mut self.window.write(), now);

        if removed > 0 {
            debug!(removed, "expired suppressors purged");
        }

        removed
    }
}

impl<M> SuppressorCore<M>
where
    M: Clone + Send + Sync + 'static,
{
    /// Records `message` unless an equivalent one is already in the window.
    ///
    /// Returns whether the message is a duplicate.
    fn check_and_record(&self, window: &mut VecDeque<(M, Deadline)>, message: &M) -> bool {
        let now = self.clock.now();
        purge_expired(window, now);

        if window
            .iter()
            .any(|(seen, _)| (self.equivalence)(message, seen))
        {
            return true;
        }

        window.push_back((message.clone(), self.expiry(now)));
        false
    }
}

/// An entry expires only once `now` is strictly past its deadline.
fn purge_expired<M>(window: &mut VecDeque<(M, Deadline)>, now: Instant) -> usize {
    let mut removed: usize = 0;

    while let Some((_, expiry)) = window.front() {
        match expiry.instant() {
            Some(at) if now > at => {
                window.pop_front();
                removed = removed.wrapping_add(1);
            }
            _ => break,
        }
    }

    removed
}

impl CleanupThread {
    fn spawn<M>(core: Weak<SuppressorCore<M>>, period: Duration) -> Option<Self>
    where
        M: Send + Sync + 'static,
    {
        let stop = Arc::new(WaitSignal::new());

        let spawned = thread::Builder::new()
            .name("flowlink-suppressor-cleanup".to_string())
            .spawn({
                let stop = Arc::clone(&stop);
                move || run_cleanup(&core, &stop, period)
            });

        match spawned {
            Ok(handle) => {
                debug!(?period, "suppressor cleanup thread started");

                Some(Self {
                    stop,
                    handle: Some(handle),
                })
            }
            Err(error) => {
                warn!(
                    %error,
                    "failed to start suppressor cleanup thread, expired entries are purged on post only"
                );
                None
            }
        }
    }
}

fn run_cleanup<M>(core: &Weak<SuppressorCore<M>>, stop: &WaitSignal, period: Duration)
where
    M: Send + Sync + 'static,
{
    while !stop.wait_timeout(period) {
        let Some(core) = core.upgrade() else {
            break;
        };

        core.cleanup();
    }

    debug!("suppressor cleanup thread stopped");
}

impl Drop for CleanupThread {
    fn drop(&mut self) {
        self.stop.set();

        if let Some(handle) = self.handle.take() {
            // A panic in the cleanup thread has nothing left to clean up after.
            _ = handle.join();
        }
    }
}

impl<M> Sink<M> for DuplicateSuppressor<M>
where
    M: Clone + Send + Sync + 'static,
{
    fn post(&self, message: M) -> Result<()> {
        let duplicate = self
            .core
            .check_and_record(&mut self.core.window.write(), &message);

        if duplicate {
            trace!("duplicate message suppressed");
            return Ok(());
        }

        self.helper.forward(message)
    }

    fn post_async(&self, message: M) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let duplicate = {
                let mut window = self.core.window.write_async().await;
                self.core.check_and_record(&mut window, &message)
            };

            if duplicate {
                trace!("duplicate message suppressed");
                return Ok(());
            }

            self.helper.forward_async(message).await
        })
    }
}

impl<M: 'static> Source<M> for DuplicateSuppressor<M> {
    fn source_helper(&self) -> &SourceHelper<M> {
        &self.helper
    }
}

impl<M: 'static> fmt::Debug for DuplicateSuppressor<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplicateSuppressor")
            .field("suppression_time", &self.core.suppression_time)
            .field("clock", &self.core.clock)
            .field("helper", &self.helper)
            .field("background_cleanup", &self.cleanup_thread.is_some())
            .finish_non_exhaustive()
    }
}

/// Configures and creates a [`DuplicateSuppressor`].
///
/// Obtained from [`DuplicateSuppressor::builder()`] or
/// [`DuplicateSuppressor::with_equivalence()`].
#[must_use]
pub struct DuplicateSuppressorBuilder<M> {
    suppression_time: Duration,
    cleanup_period: Duration,
    background_cleanup: bool,
    equivalence: Equivalence<M>,
    clock: Option<Arc<dyn Clock>>,
    policy: FanOutPolicy,
}

impl<M> DuplicateSuppressorBuilder<M>
where
    M: Send + Sync + 'static,
{
    fn new(suppression_time: Duration, equivalence: Equivalence<M>) -> Self {
        Self {
            suppression_time,
            cleanup_period: DEFAULT_CLEANUP_PERIOD,
            background_cleanup: true,
            equivalence,
            clock: None,
            policy: FanOutPolicy::default(),
        }
    }

    /// Replaces the duplicate test. `equivalence(incoming, seen)` returning `true` suppresses
    /// `incoming`.
    pub fn equivalence<F>(mut self, equivalence: F) -> Self
    where
        F: Fn(&M, &M) -> bool + Send + Sync + 'static,
    {
        self.equivalence = Box::new(equivalence);
        self
    }

    /// How often the background thread purges expired entries.
    ///
    /// Never shorter than 100 suppression windows or one millisecond; shorter values are raised.
    pub fn cleanup_period(mut self, period: Duration) -> Self {
        self.cleanup_period = period;
        self
    }

    /// Whether to run a background cleanup thread. Enabled by default.
    pub fn background_cleanup(mut self, enabled: bool) -> Self {
        self.background_cleanup = enabled;
        self
    }

    /// The clock that suppression windows are measured with. Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// How failures of downstream sinks are reported.
    pub fn fan_out_policy(mut self, policy: FanOutPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The cleanup period after applying the lower bound.
    fn effective_cleanup_period(&self) -> Duration {
        self.cleanup_period
            .max(self.suppression_time.saturating_mul(CLEANUP_PERIOD_FACTOR))
            .max(MIN_CLEANUP_PERIOD)
    }

    /// Creates the suppressor, starting the cleanup thread if enabled.
    #[must_use]
    pub fn build(self) -> DuplicateSuppressor<M> {
        let period = self.effective_cleanup_period();

        let core = Arc::new(SuppressorCore {
            window: HybridRwLock::new(VecDeque::new()),
            suppression_time: self.suppression_time,
            equivalence: self.equivalence,
            clock: self.clock.unwrap_or_else(SystemClock::shared),
        });

        let cleanup_thread = if self.background_cleanup {
            CleanupThread::spawn(Arc::downgrade(&core), period)
        } else {
            None
        };

        DuplicateSuppressor {
            core,
            helper: SourceHelper::with_policy(self.policy),
            cleanup_thread,
        }
    }
}

impl<M> fmt::Debug for DuplicateSuppressorBuilder<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplicateSuppressorBuilder")
            .field("suppression_time", &self.suppression_time)
            .field("cleanup_period", &self.cleanup_period)
            .field("background_cleanup", &self.background_cleanup)
            .field("clock", &self.clock)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
