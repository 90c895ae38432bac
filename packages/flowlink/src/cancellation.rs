use std::sync::Arc;

use crate::{SignalWait, WaitSignal};

/// Cooperative cancellation for async waits.
///
/// All clones share one underlying signal: cancelling any clone cancels all of them.
/// Cancellation is permanent.
///
/// # Example
///
/// ```rust
/// use flowlink::{CancellationToken, WaitSignal};
/// # use futures::executor::block_on;
///
/// let signal = WaitSignal::new();
/// let token = CancellationToken::new();
/// token.cancel();
///
/// // The wait gives up because of the cancellation, the signal itself is untouched.
/// assert!(!block_on(signal.wait_async(None, Some(&token))));
/// assert!(!signal.is_set());
/// ```
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    signal: Arc<WaitSignal>,
}

impl CancellationToken {
    /// Creates a token that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the token. All clones observe the cancellation.
    pub fn cancel(&self) {
        self.signal.set();
    }

    /// Whether the token has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_set()
    }

    /// Returns a future that completes once the token is cancelled.
    #[must_use]
    pub fn cancelled(&self) -> SignalWait {
        self.signal.wait_future()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::task::Context;

    use futures::task::noop_waker_ref;

    use super::*;

    #[test]
    fn clones_share_cancellation() {
        let token = CancellationToken::new();
        let clone = token.clone();

        assert!(!clone.is_cancelled());

        token.cancel();

        assert!(clone.is_cancelled());
    }

    #[test]
    fn cancelled_future_completes_on_cancel() {
        let token = CancellationToken::new();
        let mut cx = Context::from_waker(noop_waker_ref());

        let mut cancelled = token.cancelled();
        assert!(Pin::new(&mut cancelled).poll(&mut cx).is_pending());

        token.cancel();

        assert!(Pin::new(&mut cancelled).poll(&mut cx).is_ready());
    }
}
