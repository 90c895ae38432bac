//! Plain graph nodes for feeding messages in and passing them along.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::{Clock, FanOutPolicy, Result, Sink, Source, SourceHelper, SystemClock};

/// The entry point of a graph: a source that producers push messages into.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use flowlink::{PriorityReceiver, Sender, Source};
///
/// let sender = Sender::<u32>::new();
/// let receiver = sender.connect_to(&Arc::new(PriorityReceiver::<u32>::new()));
///
/// sender.send(7).unwrap();
///
/// assert_eq!(receiver.try_receive(), Some(7));
/// ```
#[derive(Debug)]
pub struct Sender<M: 'static> {
    helper: SourceHelper<M>,
}

impl<M> Sender<M>
where
    M: Clone + Send + 'static,
{
    /// Creates a sender with no connections and the default fan-out policy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            helper: SourceHelper::new(),
        }
    }

    /// Creates a sender with no connections and the given fan-out policy.
    #[must_use]
    pub fn with_policy(policy: FanOutPolicy) -> Self {
        Self {
            helper: SourceHelper::with_policy(policy),
        }
    }

    /// Delivers `message` to every connected sink.
    ///
    /// # Errors
    ///
    /// Reports sink failures according to the sender's [`FanOutPolicy`].
    pub fn send(&self, message: M) -> Result<()> {
        self.helper.forward(message)
    }

    /// Delivers `message` to every connected sink, awaiting each in turn.
    ///
    /// # Errors
    ///
    /// Reports sink failures according to the sender's [`FanOutPolicy`].
    pub async fn send_async(&self, message: M) -> Result<()> {
        self.helper.forward_async(message).await
    }
}

impl<M> Default for Sender<M>
where
    M: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M: 'static> Source<M> for Sender<M> {
    fn source_helper(&self) -> &SourceHelper<M> {
        &self.helper
    }
}

/// A sink that passes every message on to its own connections unchanged.
///
/// Useful as a named junction in a graph: producers connect to the forwarder once, and the
/// consumers behind it can be rewired without touching the producers.
#[derive(Debug)]
pub struct Forwarder<M: 'static> {
    helper: SourceHelper<M>,
}

impl<M> Forwarder<M>
where
    M: Clone + Send + 'static,
{
    /// Creates a forwarder with no connections and the default fan-out policy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            helper: SourceHelper::new(),
        }
    }

    /// Creates a forwarder with no connections and the given fan-out policy.
    #[must_use]
    pub fn with_policy(policy: FanOutPolicy) -> Self {
        Self {
            helper: SourceHelper::with_policy(policy),
        }
    }
}

impl<M> Default for Forwarder<M>
where
    M: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Sink<M> for Forwarder<M>
where
    M: Clone + Send + Sync + 'static,
{
    fn post(&self, message: M) -> Result<()> {
        self.helper.forward(message)
    }

    fn post_async(&self, message: M) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.helper.forward_async(message))
    }
}

impl<M: 'static> Source<M> for Forwarder<M> {
    fn source_helper(&self) -> &SourceHelper<M> {
        &self.helper
    }
}

/// A forwarder that holds every message for a fixed delay before passing it on.
///
/// The delay is measured on the forwarder's clock on both paths. A blocking
/// [`post()`][Sink::post] blocks the posting thread for the delay; [`post_async()`][Sink::post_async]
/// suspends the posting task instead. A zero delay forwards immediately.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use flowlink::{DelayingForwarder, PriorityReceiver, Sender, Source};
///
/// let sender = Sender::<u32>::new();
/// let receiver = sender
///     .connect_to(&Arc::new(DelayingForwarder::<u32>::new(Duration::from_millis(5))))
///     .connect_to(&Arc::new(PriorityReceiver::<u32>::new()));
///
/// sender.send(3).unwrap();
///
/// assert_eq!(receiver.try_receive(), Some(3));
/// ```
#[derive(Debug)]
pub struct DelayingForwarder<M: 'static> {
    helper: SourceHelper<M>,
    delay: Duration,
    clock: Arc<dyn Clock>,
}

impl<M> DelayingForwarder<M>
where
    M: Clone + Send + 'static,
{
    /// Creates a forwarder that delays every message by `delay` on the system clock.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self::with_clock(delay, SystemClock::shared())
    }

    /// Creates a forwarder that delays every message by `delay` on `clock`.
    #[must_use]
    pub fn with_clock(delay: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            helper: SourceHelper::new(),
            delay,
            clock,
        }
    }

    /// How long each message is held.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl<M> Sink<M> for DelayingForwarder<M>
where
    M: Clone + Send + Sync + 'static,
{
    fn post(&self, message: M) -> Result<()> {
        if !self.delay.is_zero() {
            self.clock.sleep_blocking(self.delay);
        }

        self.helper.forward(message)
    }

    fn post_async(&self, message: M) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                self.clock.sleep(self.delay).await;
            }

            self.helper.forward_async(message).await
        })
    }
}

impl<M: 'static> Source<M> for DelayingForwarder<M> {
    fn source_helper(&self) -> &SourceHelper<M> {
        &self.helper
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::future::Future;
    use std::task::{Context, Poll};
    use std::thread;

    use futures::executor::block_on;
    use futures::task::noop_waker_ref;
    use static_assertions::assert_impl_all;
    use testing::{Recorder, with_watchdog};

    use super::*;
    use crate::ManualClock;

    assert_impl_all!(Sender<String>: Send, Sync);
    assert_impl_all!(Forwarder<String>: Send, Sync, Sink<String>);
    assert_impl_all!(DelayingForwarder<String>: Send, Sync, Sink<String>);

    #[test]
    fn sender_without_connections_succeeds() {
        let sender = Sender::<u32>::new();

        sender.send(1).unwrap();
        block_on(sender.send_async(2)).unwrap();
    }

    #[test]
    fn forwarder_chain_delivers_end_to_end() {
        let sender = Sender::<u32>::new();
        let recorder = Arc::new(Recorder::<u32>::new());

        sender
            .connect_to(&Arc::new(Forwarder::<u32>::new()))
            .connect_to(&Arc::new(Forwarder::<u32>::new()))
            .connect_to(&recorder);

        sender.send(1).unwrap();
        block_on(sender.send_async(2)).unwrap();

        assert_eq!(recorder.values(), vec![1, 2]);
    }

    #[test]
    fn forwarder_fans_out_to_every_connection() {
        let forwarder = Forwarder::<&str>::new();
        let first = forwarder.connect_to(&Arc::new(Recorder::<&str>::new()));
        let second = forwarder.connect_to(&Arc::new(Recorder::<&str>::new()));

        forwarder.post("hello").unwrap();

        assert_eq!(first.values(), vec!["hello"]);
        assert_eq!(second.values(), vec!["hello"]);
    }

    #[test]
    fn delaying_forwarder_passes_messages_through() {
        let sender = Sender::<String>::new();
        let recorder = sender
            .connect_to(&Arc::new(DelayingForwarder::<String>::new(Duration::ZERO)))
            .connect_to(&Arc::new(Recorder::<String>::new()));

        sender.send("first".to_string()).unwrap();
        block_on(sender.send_async("second".to_string())).unwrap();

        assert_eq!(recorder.values(), vec!["first", "second"]);
    }

    #[test]
    fn delaying_forwarder_blocks_post_until_clock_passes_delay() {
        with_watchdog(|| {
            let (clock, shared) = ManualClock::shared();
            let forwarder =
                DelayingForwarder::<u32>::with_clock(Duration::from_millis(100), shared);
            let recorder = forwarder.connect_to(&Arc::new(Recorder::<u32>::new()));

            thread::scope(|s| {
                let poster = s.spawn(|| forwarder.post(42));

                while clock.pending_sleepers() == 0 {
                    thread::yield_now();
                }

                // The clock has not moved, so nothing gets through however long we wait.
                assert!(!recorder.wait_for_len(1, Duration::from_millis(20)));

                clock.advance(Duration::from_millis(99));
                assert!(!recorder.wait_for_len(1, Duration::from_millis(20)));

                clock.advance(Duration::from_millis(1));
                assert!(recorder.wait_for_len(1, Duration::from_secs(5)));

                poster.join().unwrap().unwrap();
            });

            assert_eq!(recorder.values(), vec![42]);
        });
    }

    #[test]
    fn delaying_forwarder_suspends_async_post_until_clock_passes_delay() {
        let (clock, shared) = ManualClock::shared();
        let forwarder = DelayingForwarder::<u32>::with_clock(Duration::from_secs(1), shared);
        let recorder = forwarder.connect_to(&Arc::new(Recorder::<u32>::new()));
        let mut cx = Context::from_waker(noop_waker_ref());

        let mut post = forwarder.post_async(7);
        assert!(post.as_mut().poll(&mut cx).is_pending());
        assert!(recorder.is_empty());

        clock.advance(Duration::from_secs(1));

        assert!(matches!(post.as_mut().poll(&mut cx), Poll::Ready(Ok(()))));
        assert_eq!(recorder.values(), vec![7]);
    }
}
