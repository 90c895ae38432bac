//! The outgoing side of a graph node: the set of connected sinks and fan-out delivery.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, trace, warn};

use crate::{Error, Result, Sink, SinkRef};

/// What a fan-out does when one of the sinks fails.
///
/// The same policy applies to synchronous and asynchronous fan-out.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FanOutPolicy {
    /// Offer the message to every sink, then report [`Error::FanOut`] if any of them failed.
    #[default]
    BestEffort,

    /// Stop at the first failing sink and return its error. Later sinks do not see the message.
    FailFast,
}

/// The connection set of a source and the logic to fan messages out over it.
///
/// Connections are kept in order. Every delivery works on a snapshot of the connections taken
/// when the delivery starts: sinks connected or disconnected while a delivery is in flight do
/// not affect that delivery, only later ones.
///
/// Connecting the same sink twice creates two connections and the sink receives each message
/// twice.
pub struct SourceHelper<M> {
    connections: ArcSwap<Vec<SinkRef<M>>>,
    policy: FanOutPolicy,
}

impl<M: 'static> SourceHelper<M> {
    /// Creates an empty connection set with the [`FanOutPolicy::BestEffort`] policy.
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy(FanOutPolicy::default())
    }

    /// Creates an empty connection set with the given failure policy.
    #[must_use]
    pub fn with_policy(policy: FanOutPolicy) -> Self {
        Self {
            connections: ArcSwap::from_pointee(Vec::new()),
            policy,
        }
    }

    /// The failure policy applied to fan-out.
    #[must_use]
    pub fn policy(&self) -> FanOutPolicy {
        self.policy
    }

    /// Adds a connection at the end of the connection order.
    pub fn add(&self, sink: SinkRef<M>) {
        let weak = sink.is_weak();

        let previous = self.connections.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(sink.clone());
            next
        });

        debug!(
            weak,
            connections = previous.len().saturating_add(1),
            "sink connected"
        );
    }

    /// Removes every connection that points at `sink`.
    pub fn remove<S>(&self, sink: &Arc<S>)
    where
        S: Sink<M> + ?Sized,
    {
        let previous = self.connections.rcu(|current| {
            current
                .iter()
                .filter(|connection| !connection.points_to(sink))
                .cloned()
                .collect::<Vec<_>>()
        });

        let removed = previous
            .iter()
            .filter(|connection| connection.points_to(sink))
            .count();

        debug!(removed, "sink disconnected");
    }

    /// Removes every connection.
    pub fn clear(&self) {
        let previous = self.connections.swap(Arc::new(Vec::new()));

        debug!(removed = previous.len(), "all sinks disconnected");
    }

    /// Removes weak connections whose sink no longer exists.
    ///
    /// Dead connections are skipped during delivery anyway; compaction only reclaims their space.
    pub fn compact(&self) {
        let previous = self.connections.rcu(|current| {
            current
                .iter()
                .filter(|connection| connection.is_alive())
                .cloned()
                .collect::<Vec<_>>()
        });

        let removed = previous
            .iter()
            .filter(|connection| !connection.is_alive())
            .count();

        if removed > 0 {
            debug!(removed, "dead weak connections compacted");
        }
    }

    /// The number of connections whose sink is alive.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.connections
            .load()
            .iter()
            .filter(|connection| connection.is_alive())
            .count()
    }

    /// The number of connections, including weak connections whose sink is gone.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load().len()
    }

    /// The live sinks, in connection order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<dyn Sink<M>>> {
        self.connections
            .load()
            .iter()
            .filter_map(SinkRef::resolve)
            .collect()
    }
}

impl<M> SourceHelper<M>
where
    M: Clone + Send + 'static,
{
    /// Delivers `message` to every live sink, in connection order.
    ///
    /// # Errors
    ///
    /// With [`FanOutPolicy::FailFast`], returns the error of the first failing sink and skips
    /// the remaining ones. With [`FanOutPolicy::BestEffort`], delivers to all sinks and then
    /// returns [`Error::FanOut`] if any of them failed.
    pub fn forward(&self, message: M) -> Result<()> {
        let snapshot = self.connections.load_full();
        let mut outcome = FanOutOutcome::new(self.policy);

        for sink in snapshot.iter().filter_map(SinkRef::resolve) {
            outcome.record(sink.post(message.clone()))?;
        }

        trace!(sinks = outcome.attempted, "message forwarded");
        outcome.finish()
    }

    /// Delivers `message` to every live sink, awaiting each sink before offering the message to
    /// the next one.
    ///
    /// # Errors
    ///
    /// Same as [`forward()`][Self::forward].
    pub async fn forward_async(&self, message: M) -> Result<()> {
        let snapshot = self.connections.load_full();
        let mut outcome = FanOutOutcome::new(self.policy);

        for sink in snapshot.iter().filter_map(SinkRef::resolve) {
            outcome.record(sink.post_async(message.clone()).await)?;
        }

        trace!(sinks = outcome.attempted, "message forwarded asynchronously");
        outcome.finish()
    }
}

impl<M: 'static> Default for SourceHelper<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for SourceHelper<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceHelper")
            .field("connections", &self.connections.load().len())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Bookkeeping for one fan-out pass.
struct FanOutOutcome {
    policy: FanOutPolicy,
    attempted: usize,
    failed: usize,
    first_failure: Option<Error>,
}

impl FanOutOutcome {
    fn new(policy: FanOutPolicy) -> Self {
        Self {
            policy,
            attempted: 0,
            failed: 0,
            first_failure: None,
        }
    }

    /// Records the result of one delivery. Returns `Err` if delivery must stop here.
    fn record(&mut self, result: Result<()>) -> Result<()> {
        self.attempted = self.attempted.wrapping_add(1);

        let Err(error) = result else {
            return Ok(());
        };

        match self.policy {
            FanOutPolicy::FailFast => Err(error),
            FanOutPolicy::BestEffort => {
                warn!(%error, "sink failed during fan-out, continuing with remaining sinks");

                self.failed = self.failed.wrapping_add(1);
                self.first_failure.get_or_insert(error);
                Ok(())
            }
        }
    }

    fn finish(self) -> Result<()> {
        match self.first_failure {
            None => Ok(()),
            Some(first) => Err(Error::FanOut {
                failed: self.failed,
                attempted: self.attempted,
                first: Box::new(first),
            }),
        }
    }
}

/// A graph node that can be connected to sinks of `M`.
///
/// Implementors only expose their [`SourceHelper`]; connection management is provided.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use flowlink::{Forwarder, Sender, Source};
///
/// let sender = Sender::<u32>::new();
/// let first = Arc::new(Forwarder::<u32>::new());
/// let second = Arc::new(Forwarder::<u32>::new());
///
/// // Connections chain: the sender feeds `first`, which feeds `second`.
/// sender.connect_to(&first).connect_to(&second);
///
/// assert_eq!(sender.count_connected_sinks(), 1);
/// assert_eq!(first.count_connected_sinks(), 1);
/// ```
pub trait Source<M: 'static> {
    /// The connection set of this source.
    fn source_helper(&self) -> &SourceHelper<M>;

    /// Adds a prepared connection.
    fn connect(&self, sink: SinkRef<M>) {
        self.source_helper().add(sink);
    }

    /// Connects `sink` with an owning reference and returns it, for chaining.
    fn connect_to<S>(&self, sink: &Arc<S>) -> Arc<S>
    where
        S: Sink<M> + 'static,
        Self: Sized,
    {
        self.connect(SinkRef::strong(sink));
        Arc::clone(sink)
    }

    /// Connects `sink` with a non-owning reference and returns it, for chaining.
    ///
    /// The connection does not keep the sink alive; once the sink is dropped elsewhere, it is
    /// silently skipped.
    fn connect_weak_to<S>(&self, sink: &Arc<S>) -> Arc<S>
    where
        S: Sink<M> + 'static,
        Self: Sized,
    {
        self.connect(SinkRef::weak(sink));
        Arc::clone(sink)
    }

    /// Removes every connection to `sink`.
    fn disconnect_from<S>(&self, sink: &Arc<S>)
    where
        S: Sink<M> + ?Sized,
        Self: Sized,
    {
        self.source_helper().remove(sink);
    }

    /// Removes every connection.
    fn disconnect_all(&self) {
        self.source_helper().clear();
    }

    /// The number of connected sinks that are alive.
    fn count_connected_sinks(&self) -> usize {
        self.source_helper().live_count()
    }

    /// The connected sinks that are alive, in connection order.
    fn connected_sinks(&self) -> Vec<Arc<dyn Sink<M>>> {
        self.source_helper().snapshot()
    }
}

impl<M: 'static> Source<M> for SourceHelper<M> {
    fn source_helper(&self) -> &SourceHelper<M> {
        self
    }
}
