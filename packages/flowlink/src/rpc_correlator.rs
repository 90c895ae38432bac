//! Matching of responses to outstanding requests, with per-request expiry.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use foldhash::{HashMap, HashMapExt};
use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{Clock, Deadline, Error, HybridRwLock, Result, Sink, SystemClock};

/// Identifies a request so that its response can be matched to it.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RequestId(u64);

impl RequestId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A response to the request identified by `request_id`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RpcResponse<R> {
    /// The request this responds to.
    pub request_id: RequestId,

    /// The response payload.
    pub result: R,
}

impl<R> RpcResponse<R> {
    /// Creates a response to `request_id`.
    #[must_use]
    pub fn new(request_id: RequestId, result: R) -> Self {
        Self { request_id, result }
    }
}

/// Why a pending request ended without a response.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum RpcError {
    /// The request was cancelled before a response arrived.
    #[error("request was cancelled")]
    Cancelled,

    /// The request's deadline passed before a response arrived.
    #[error("request timed out")]
    TimedOut,

    /// The correlator was dropped while the request was pending.
    #[error("correlator was dropped before the request completed")]
    Abandoned,
}

type Outcome<R> = std::result::Result<R, RpcError>;

struct PendingEntry<R> {
    sender: oneshot::Sender<Outcome<R>>,
    deadline: Deadline,
}

impl<R> PendingEntry<R> {
    fn complete(self, outcome: Outcome<R>) {
        // The requester may have stopped listening; the request is finished either way.
        _ = self.sender.send(outcome);
    }
}

/// Keeps track of outstanding requests and completes each with the first of: its response, a
/// cancellation, or its deadline passing.
///
/// Responses can be fed in directly with [`try_complete()`][Self::try_complete] or routed to the
/// correlator through the graph, as it is a sink of [`RpcResponse<R>`].
///
/// Deadlines are enforced by [`sweep_expired()`][Self::sweep_expired], which the owner calls
/// periodically. A response that arrives for a request whose deadline has already passed
/// completes that request as timed out instead.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
///
/// use flowlink::{RpcCorrelator, RpcResponse};
///
/// let correlator = RpcCorrelator::<String>::new();
///
/// let id = correlator.next_request_id();
/// let pending = correlator.register_request(id, Duration::from_secs(5)).unwrap();
///
/// assert!(correlator.try_complete(RpcResponse::new(id, "pong".to_string())));
/// assert_eq!(pending.wait(), Ok("pong".to_string()));
/// ```
pub struct RpcCorrelator<R> {
    pending: HybridRwLock<HashMap<RequestId, PendingEntry<R>>>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl<R> RpcCorrelator<R>
where
    R: Send + 'static,
{
    /// Creates a correlator that measures deadlines with the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// Creates a correlator that measures deadlines with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            pending: HybridRwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            clock,
        }
    }

    /// Allocates an id that no other call on this correlator returns.
    pub fn next_request_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a request that must be answered within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRequestId`] if a request with the same id is still pending.
    /// A request whose deadline has passed no longer counts as pending; it is completed as
    /// timed out and replaced.
    pub fn register_request(
        &self,
        id: RequestId,
        timeout: Duration,
    ) -> Result<PendingResponse<R>> {
        let now = self.clock.now();
        let deadline = Deadline::after(&*self.clock, timeout);
        let (sender, receiver) = oneshot::channel();

        let replaced = {
            let mut pending = self.pending.write();

            if pending
                .get(&id)
                .is_some_and(|existing| !existing.deadline.is_expired(now))
            {
                return Err(Error::DuplicateRequestId { id });
            }

            pending.insert(id, PendingEntry { sender, deadline })
        };

        if let Some(expired) = replaced {
            debug!(%id, "expired request replaced by new registration");
            expired.complete(Err(RpcError::TimedOut));
        }

        Ok(PendingResponse { id, receiver })
    }

    /// Completes the matching pending request with the response payload.
    ///
    /// Returns `false` if no request with that id is pending, for example because it was
    /// already completed, cancelled or expired.
    pub fn try_complete(&self, response: RpcResponse<R>) -> bool {
        let entry = self.pending.write().remove(&response.request_id);
        self.finish(entry, response)
    }

    /// Completes the pending request `id` with [`RpcError::Cancelled`].
    ///
    /// Returns `false` if no request with that id is pending.
    pub fn cancel(&self, id: RequestId) -> bool {
        let Some(entry) = self.pending.write().remove(&id) else {
            return false;
        };

        debug!(%id, "request cancelled");
        entry.complete(Err(RpcError::Cancelled));
        true
    }

    /// Completes every pending request whose deadline has passed with [`RpcError::TimedOut`].
    ///
    /// Returns how many requests expired.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();

        let expired: Vec<PendingEntry<R>> = {
            let mut pending = self.pending.write();

            let ids: Vec<RequestId> = pending
                .iter()
                .filter(|(_, entry)| entry.deadline.is_expired(now))
                .map(|(id, _)| *id)
                .collect();

            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let count = expired.len();

        for entry in expired {
            entry.complete(Err(RpcError::TimedOut));
        }

        if count > 0 {
            debug!(count, "pending requests expired");
        }

        count
    }

    /// The number of requests that have neither completed nor been swept.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }

    fn finish(&self, entry: Option<PendingEntry<R>>, response: RpcResponse<R>) -> bool {
        let id = response.request_id;

        let Some(entry) = entry else {
            trace!(%id, "response without pending request ignored");
            return false;
        };

        if entry.deadline.is_expired(self.clock.now()) {
            debug!(%id, "response arrived after deadline");
            entry.complete(Err(RpcError::TimedOut));
            return false;
        }

        entry.complete(Ok(response.result));
        true
    }
}

impl<R> Default for RpcCorrelator<R>
where
    R: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<R> fmt::Debug for RpcCorrelator<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcCorrelator")
            .field("pending", &self.pending.read().len())
            .field("next_id", &self.next_id)
            .field("clock", &self.clock)
            .finish()
    }
}

impl<R> Sink<RpcResponse<R>> for RpcCorrelator<R>
where
    R: Send + Sync + 'static,
{
    fn post(&self, message: RpcResponse<R>) -> Result<()> {
        self.try_complete(message);
        Ok(())
    }

    fn post_async(&self, message: RpcResponse<R>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let entry = self.pending.write_async().await.remove(&message.request_id);
            self.finish(entry, message);
            Ok(())
        })
    }
}

/// The eventual outcome of a registered request.
///
/// Await it, or block on it with [`wait()`][Self::wait]. If the correlator is dropped first,
/// the outcome is [`RpcError::Abandoned`].
pub struct PendingResponse<R> {
    id: RequestId,
    receiver: oneshot::Receiver<Outcome<R>>,
}

impl<R> PendingResponse<R> {
    /// The id the request was registered with.
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Blocks until the request completes.
    ///
    /// # Errors
    ///
    /// Returns the reason if the request ended without a response.
    pub fn wait(self) -> Outcome<R> {
        self.receiver.recv().unwrap_or(Err(RpcError::Abandoned))
    }

    /// Returns the outcome if the request has completed, without blocking.
    ///
    /// The outcome is handed out once; later calls report [`RpcError::Abandoned`].
    pub fn try_result(&mut self) -> Option<Outcome<R>> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::TryRecvError::Empty) => None,
            Err(oneshot::TryRecvError::Disconnected) => Some(Err(RpcError::Abandoned)),
        }
    }
}

impl<R> fmt::Debug for PendingResponse<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponse")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl<R> Future for PendingResponse<R> {
    type Output = Outcome<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RpcError::Abandoned)))
    }
}
