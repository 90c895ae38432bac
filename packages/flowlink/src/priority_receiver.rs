//! Single-slot receiver that keeps only the highest-priority message.

use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::trace;

use crate::{
    CancellationToken, Clock, HybridRwLock, Result, Sink, SourceHelper, SystemClock, WaitSignal,
};

/// Conversion of an incoming message into the type a sink stores, if it is of that type.
///
/// A sink that accepts a family of messages `M` but only stores `T` narrows every message on
/// arrival. Messages that do not narrow are handed back unchanged so that the sink can route
/// them elsewhere.
///
/// Every type narrows to itself. Implement this for an enum of message kinds to let a
/// [`PriorityReceiver`] pick out one of them.
///
/// # Example
///
/// ```rust
/// use flowlink::Narrow;
///
/// #[derive(Clone, Debug, PartialEq)]
/// enum Event {
///     Alarm(u8),
///     Heartbeat,
/// }
///
/// impl Narrow<u8> for Event {
///     fn narrow(self) -> Result<u8, Self> {
///         match self {
///             Self::Alarm(level) => Ok(level),
///             other => Err(other),
///         }
///     }
/// }
///
/// assert_eq!(Narrow::<u8>::narrow(Event::Alarm(3)), Ok(3));
/// assert_eq!(Narrow::<u8>::narrow(Event::Heartbeat), Err(Event::Heartbeat));
/// ```
pub trait Narrow<T>: Sized {
    /// Returns the message as `T`, or gives it back if it is something else.
    ///
    /// # Errors
    ///
    /// Returns the original message if it is not a `T`.
    fn narrow(self) -> std::result::Result<T, Self>;
}

impl<T> Narrow<T> for T {
    fn narrow(self) -> std::result::Result<T, Self> {
        Ok(self)
    }
}

type Comparator<T> = Box<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// A sink that holds at most one message: the one with the highest priority seen since the
/// last receive.
///
/// An incoming message replaces the held one unless the held one compares as greater, so among
/// equal priorities the most recent message wins. Lower-priority messages are dropped.
///
/// Messages of type `M` that do not [narrow][Narrow] to `T` are passed to the
/// [`else_route()`][Self::else_route] if anything ever asked for it, and dropped otherwise.
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
/// for reading in [42, 99, 10] {
///     sender.send(reading).unwrap();
/// }
///
/// assert_eq!(receiver.try_receive(), Some(99));
/// assert_eq!(receiver.try_receive(), None);
/// ```
pub struct PriorityReceiver<T, M = T>
where
    M: 'static,
{
    slot: HybridRwLock<Option<T>>,
    readable: WaitSignal,
    comparator: Comparator<T>,
    else_route: OnceLock<SourceHelper<M>>,
}

impl<T, M> PriorityReceiver<T, M>
where
    T: Ord + 'static,
    M: 'static,
{
    /// Creates an empty receiver that prioritizes by the natural order of `T`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_comparator(T::cmp)
    }

    /// Creates an empty receiver ordered by `T` whose async timeouts run on `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_comparator_and_clock(T::cmp, clock)
    }
}

impl<T, M> PriorityReceiver<T, M>
where
    M: 'static,
{
    /// Creates an empty receiver with a custom priority order.
    ///
    /// `comparator(held, incoming)` returning [`Ordering::Greater`] keeps the held message;
    /// any other result replaces it.
    #[must_use]
    pub fn with_comparator<F>(comparator: F) -> Self
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        Self::with_comparator_and_clock(comparator, SystemClock::shared())
    }

    /// Creates an empty receiver with a custom priority order whose async timeouts run on
    /// `clock`.
    #[must_use]
    pub fn with_comparator_and_clock<F>(comparator: F, clock: Arc<dyn Clock>) -> Self
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        Self {
            slot: HybridRwLock::new(None),
            readable: WaitSignal::with_clock(false, clock),
            comparator: Box::new(comparator),
            else_route: OnceLock::new(),
        }
    }

    /// The source that receives messages which are not of the stored type.
    ///
    /// Created on first access; until then such messages are dropped.
    pub fn else_route(&self) -> &SourceHelper<M> {
        self.else_route.get_or_init(SourceHelper::new)
    }

    /// Takes the held message, if any.
    pub fn try_receive(&self) -> Option<T> {
        let mut slot = self.slot.write();
        self.take(&mut slot)
    }

    /// Takes the held message, first waiting up to `timeout` for one to arrive if the receiver
    /// is empty.
    ///
    /// A zero timeout does not wait at all.
    pub async fn try_receive_async(&self, timeout: Duration) -> Option<T> {
        if self.is_empty() && !timeout.is_zero() {
            // A timeout here just means we find the slot empty below.
            _ = self.readable.wait_async(Some(timeout), None).await;
        }

        let mut slot = self.slot.write_async().await;
        self.take(&mut slot)
    }

    /// Takes every held message. For this receiver that is at most one.
    pub fn receive_all(&self) -> Vec<T> {
        self.try_receive().into_iter().collect()
    }

    /// Discards the held message, if any.
    pub fn clear(&self) {
        let mut slot = self.slot.write();
        *slot = None;
        self.readable.reset();
    }

    /// The number of held messages: zero or one.
    #[must_use]
    pub fn count(&self) -> usize {
        usize::from(!self.is_empty())
    }

    /// Whether no message is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.readable.is_set()
    }

    /// Always `false`: a new message can always take the slot or be dropped.
    #[must_use]
    pub fn is_full(&self) -> bool {
        false
    }

    /// The signal that is set while a message is held.
    #[must_use]
    pub fn readable(&self) -> &WaitSignal {
        &self.readable
    }

    /// Blocks until a message is held.
    pub fn wait(&self) {
        self.readable.wait();
    }

    /// Blocks until a message is held or `timeout` elapses. Returns whether a message is held.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.readable.wait_timeout(timeout)
    }

    /// Waits until a message is held, `timeout` elapses or `cancellation` is triggered.
    ///
    /// Returns whether a message is held.
    pub async fn wait_async(
        &self,
        timeout: Option<Duration>,
        cancellation: Option<&CancellationToken>,
    ) -> bool {
        self.readable.wait_async(timeout, cancellation).await
    }

    /// Whether a wait started now would have to block.
    #[must_use]
    pub fn would_wait(&self) -> bool {
        self.readable.would_wait()
    }

    fn take(&self, slot: &mut Option<T>) -> Option<T> {
        let taken = slot.take();

        if taken.is_some() {
            self.readable.reset();
        }

        taken
    }

    fn should_replace(&self, held: Option<&T>, incoming: &T) -> bool {
        held.is_none_or(|held| (self.comparator)(held, incoming) != Ordering::Greater)
    }

    fn store(&self, slot: &mut Option<T>, incoming: T) {
        if self.should_replace(slot.as_ref(), &incoming) {
            *slot = Some(incoming);
            self.readable.set();
        } else {
            trace!("lower-priority message dropped");
        }
    }
}

impl<T: Clone, M> PriorityReceiver<T, M>
where
    M: 'static,
{
    /// A copy of the held message, if any.
    #[must_use]
    pub fn try_peek(&self) -> Option<T> {
        self.slot.read().clone()
    }

    /// Copies of every held message. For this receiver that is at most one.
    #[must_use]
    pub fn peek_all(&self) -> Vec<T> {
        self.try_peek().into_iter().collect()
    }
}

impl<T, M> PriorityReceiver<T, M>
where
    T: Clone + Into<M>,
    M: 'static,
{
    /// Copies of every held message, as the receiver's incoming message type.
    #[must_use]
    pub fn queued_messages(&self) -> Vec<M> {
        self.peek_all().into_iter().map(Into::into).collect()
    }
}

impl<T, M> PriorityReceiver<T, M>
where
    M: Clone + Send + 'static,
{
    fn route_elsewhere(&self, message: M) -> Result<()> {
        match self.else_route.get() {
            Some(route) => route.forward(message),
            None => {
                trace!("message of other type dropped, no else route");
                Ok(())
            }
        }
    }

    async fn route_elsewhere_async(&self, message: M) -> Result<()> {
        match self.else_route.get() {
            Some(route) => route.forward_async(message).await,
            None => {
                trace!("message of other type dropped, no else route");
                Ok(())
            }
        }
    }
}

impl<T, M> Default for PriorityReceiver<T, M>
where
    T: Ord + 'static,
    M: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, M> Sink<M> for PriorityReceiver<T, M>
where
    T: Send + Sync,
    M: Narrow<T> + Clone + Send + Sync + 'static,
{
    fn post(&self, message: M) -> Result<()> {
        match message.narrow() {
            Ok(incoming) => {
                let mut slot = self.slot.write();
                self.store(&mut slot, incoming);
                Ok(())
            }
            Err(other) => self.route_elsewhere(other),
        }
    }

    fn post_async(&self, message: M) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match message.narrow() {
                Ok(incoming) => {
                    let mut slot = self.slot.write_async().await;
                    self.store(&mut slot, incoming);
                    Ok(())
                }
                Err(other) => self.route_elsewhere_async(other).await,
            }
        })
    }
}

impl<T, M> fmt::Debug for PriorityReceiver<T, M>
where
    M: 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityReceiver")
            .field("holding", &!self.is_empty())
            .field("else_route", &self.else_route.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::future::Future;
    use std::task::{Context, Poll};
    use std::thread;

    use futures::executor::block_on;
    use static_assertions::assert_impl_all;
    use testing::{Recorder, with_watchdog};

    use super::*;
    use crate::{ManualClock, Sender, Source};

    assert_impl_all!(PriorityReceiver<u32>: Send, Sync, Sink<u32>);

    #[derive(Clone, Debug, PartialEq)]
    enum Reading {
        Temperature(i32),
        Label(&'static str),
    }

    impl Narrow<i32> for Reading {
        fn narrow(self) -> std::result::Result<i32, Self> {
            match self {
                Self::Temperature(value) => Ok(value),
                other @ Self::Label(_) => Err(other),
            }
        }
    }

    impl From<i32> for Reading {
        fn from(value: i32) -> Self {
            Self::Temperature(value)
        }
    }

    #[test]
    fn keeps_highest_priority_message() {
        let sender = Sender::<u32>::new();
        let receiver = sender.connect_to(&Arc::new(PriorityReceiver::<u32>::new()));

        sender.send(42).unwrap();
        sender.send(99).unwrap();
        sender.send(10).unwrap();
        assert_eq!(receiver.try_receive(), Some(99));

        sender.send(10).unwrap();
        assert_eq!(receiver.try_receive(), Some(10));
    }

    #[test]
    fn equal_priority_replaces() {
        let receiver = PriorityReceiver::<(u8, &str)>::with_comparator(|held, incoming| {
            held.0.cmp(&incoming.0)
        });

        receiver.post((1, "first")).unwrap();
        receiver.post((1, "second")).unwrap();

        assert_eq!(receiver.try_receive(), Some((1, "second")));
    }

    #[test]
    fn custom_comparator_can_invert_order() {
        let receiver = PriorityReceiver::<u32>::with_comparator(|held, incoming| incoming.cmp(held));

        for value in [42, 99, 10] {
            receiver.post(value).unwrap();
        }

        assert_eq!(receiver.try_receive(), Some(10));
    }

    #[test]
    fn readable_follows_slot() {
        let receiver = PriorityReceiver::<u32>::new();
        let readable = receiver.readable().wait_future();

        assert!(receiver.is_empty());
        assert!(receiver.would_wait());
        assert_eq!(receiver.count(), 0);

        receiver.post(42).unwrap();

        // The wait registered before the post completes now.
        block_on(readable);
        assert!(!receiver.is_empty());
        assert_eq!(receiver.count(), 1);
        assert!(!receiver.is_full());

        assert_eq!(receiver.receive_all(), vec![42]);
        assert!(receiver.is_empty());
        assert!(receiver.readable().would_wait());
        assert!(receiver.receive_all().is_empty());
    }

    #[test]
    fn peeking_does_not_take() {
        let receiver = PriorityReceiver::<u32>::new();
        assert_eq!(receiver.try_peek(), None);

        receiver.post(7).unwrap();

        assert_eq!(receiver.try_peek(), Some(7));
        assert_eq!(receiver.peek_all(), vec![7]);
        assert_eq!(receiver.count(), 1);

        receiver.clear();
        assert!(receiver.peek_all().is_empty());
        assert!(receiver.is_empty());
    }

    #[test]
    fn other_message_types_are_dropped_without_else_route() {
        let receiver = PriorityReceiver::<i32, Reading>::new();

        receiver.post(Reading::Label("ignored")).unwrap();
        receiver.post(Reading::Temperature(21)).unwrap();

        assert_eq!(receiver.queued_messages(), vec![Reading::Temperature(21)]);
        assert_eq!(receiver.try_receive(), Some(21));
    }

    #[test]
    fn other_message_types_go_to_else_route() {
        let receiver = PriorityReceiver::<i32, Reading>::new();
        let others = receiver
            .else_route()
            .connect_to(&Arc::new(Recorder::<Reading>::new()));

        receiver.post(Reading::Label("boiler")).unwrap();
        block_on(receiver.post_async(Reading::Label("attic"))).unwrap();
        receiver.post(Reading::Temperature(19)).unwrap();

        assert_eq!(
            others.values(),
            vec![Reading::Label("boiler"), Reading::Label("attic")]
        );
        assert_eq!(receiver.try_receive(), Some(19));
    }

    #[test]
    fn async_post_uses_same_priority_rule() {
        let receiver = PriorityReceiver::<u32>::new();

        block_on(async {
            receiver.post_async(5).await.unwrap();
            receiver.post_async(3).await.unwrap();
        });

        assert_eq!(receiver.try_receive(), Some(5));
    }

    #[test]
    fn try_receive_async_with_zero_timeout_does_not_wait() {
        let receiver = PriorityReceiver::<u32>::new();

        assert_eq!(block_on(receiver.try_receive_async(Duration::ZERO)), None);
    }

    #[test]
    fn try_receive_async_times_out_without_tokio_runtime() {
        with_watchdog(|| {
            let receiver = PriorityReceiver::<u32>::new();

            assert_eq!(
                block_on(receiver.try_receive_async(Duration::from_millis(10))),
                None
            );
        });
    }

    #[test]
    fn comparator_and_clock_constructor_uses_both() {
        let (clock, shared) = ManualClock::shared();
        // Reversed order: the lowest value wins.
        let receiver = PriorityReceiver::<u32>::with_comparator_and_clock(
            |held, incoming| incoming.cmp(held),
            shared,
        );

        receiver.post(5).unwrap();
        receiver.post(9).unwrap();
        assert_eq!(receiver.try_peek(), Some(5));

        let mut wait = Box::pin(receiver.wait_async(Some(Duration::from_secs(1)), None));
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        assert_eq!(wait.as_mut().poll(&mut cx), Poll::Ready(true));
        drop(wait);

        receiver.clear();
        let mut wait = Box::pin(receiver.wait_async(Some(Duration::from_secs(1)), None));
        assert!(wait.as_mut().poll(&mut cx).is_pending());

        clock.advance(Duration::from_secs(1));
        assert_eq!(wait.as_mut().poll(&mut cx), Poll::Ready(false));
    }

    #[test]
    fn try_receive_async_waits_for_message() {
        with_watchdog(|| {
            // A manual clock that nobody advances keeps the timeout from ever firing.
            let receiver = PriorityReceiver::<u32>::with_clock(ManualClock::shared().1);

            thread::scope(|s| {
                s.spawn(|| {
                    thread::sleep(Duration::from_millis(20));
                    receiver.post(8).unwrap();
                });

                let received = block_on(receiver.try_receive_async(Duration::from_secs(5)));
                assert_eq!(received, Some(8));
            });
        });
    }

    #[test]
    fn try_receive_async_times_out_on_receiver_clock() {
        let (clock, shared) = ManualClock::shared();
        let receiver = PriorityReceiver::<u32>::with_clock(shared);

        let mut receive = Box::pin(receiver.try_receive_async(Duration::from_secs(1)));
        let waker = futures::task::noop_waker_ref();
        let mut cx = Context::from_waker(waker);

        assert!(receive.as_mut().poll(&mut cx).is_pending());

        clock.advance(Duration::from_secs(1));

        assert_eq!(receive.as_mut().poll(&mut cx), Poll::Ready(None));
    }

    #[test]
    fn blocking_wait_sees_post_from_other_thread() {
        with_watchdog(|| {
            let receiver = Arc::new(PriorityReceiver::<u32>::new());

            thread::scope(|s| {
                s.spawn(|| receiver.post(1).unwrap());

                receiver.wait();
                assert!(receiver.wait_timeout(Duration::ZERO));
            });
        });
    }

    #[test]
    fn wait_async_honours_cancellation() {
        let receiver = PriorityReceiver::<u32>::new();
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        assert!(!block_on(receiver.wait_async(None, Some(&cancellation))));
    }
}
