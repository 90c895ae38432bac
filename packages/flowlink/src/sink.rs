use std::fmt;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;

use crate::Result;

/// A node that accepts messages of type `M`.
///
/// Both methods may be called concurrently from any number of sources.
///
/// `post()` is expected to complete without suspending; `post_async()` may suspend, for example
/// to acquire a lock asynchronously or to await downstream sinks.
pub trait Sink<M>: Send + Sync {
    /// Delivers a message synchronously.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink (or, for forwarding sinks, a downstream sink) could not
    /// process the message.
    fn post(&self, message: M) -> Result<()>;

    /// Delivers a message, suspending if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink (or, for forwarding sinks, a downstream sink) could not
    /// process the message.
    fn post_async(&self, message: M) -> BoxFuture<'_, Result<()>>;
}

/// A connection from a source to a sink: either owning or non-owning.
///
/// A strong reference keeps the sink alive for as long as the connection exists. A weak
/// reference does not; once the sink is dropped elsewhere, the reference simply no longer
/// resolves and the connection is skipped.
pub enum SinkRef<M> {
    /// Owning reference.
    Strong(Arc<dyn Sink<M>>),

    /// Non-owning reference.
    Weak(Weak<dyn Sink<M>>),
}

impl<M: 'static> SinkRef<M> {
    /// An owning reference to `sink`.
    #[must_use]
    pub fn strong<S>(sink: &Arc<S>) -> Self
    where
        S: Sink<M> + 'static,
    {
        Self::Strong(Arc::clone(sink) as Arc<dyn Sink<M>>)
    }

    /// A non-owning reference to `sink`.
    #[must_use]
    pub fn weak<S>(sink: &Arc<S>) -> Self
    where
        S: Sink<M> + 'static,
    {
        let sink: Arc<dyn Sink<M>> = Arc::clone(sink) as Arc<dyn Sink<M>>;
        Self::Weak(Arc::downgrade(&sink))
    }

    /// A reference to an already type-erased sink.
    #[must_use]
    pub fn from_dyn(sink: &Arc<dyn Sink<M>>, weak: bool) -> Self {
        if weak {
            Self::Weak(Arc::downgrade(sink))
        } else {
            Self::Strong(Arc::clone(sink))
        }
    }
}

impl<M> SinkRef<M> {
    /// Returns the sink if it is still alive.
    #[must_use]
    pub fn resolve(&self) -> Option<Arc<dyn Sink<M>>> {
        match self {
            Self::Strong(sink) => Some(Arc::clone(sink)),
            Self::Weak(sink) => sink.upgrade(),
        }
    }

    /// Whether the sink is still alive. Strong references are always alive.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        match self {
            Self::Strong(_) => true,
            Self::Weak(sink) => sink.strong_count() > 0,
        }
    }

    /// Whether this is a non-owning reference.
    #[must_use]
    pub fn is_weak(&self) -> bool {
        matches!(self, Self::Weak(_))
    }

    /// Whether this reference points at `sink`, compared by identity.
    #[must_use]
    pub fn points_to<S>(&self, sink: &Arc<S>) -> bool
    where
        S: Sink<M> + ?Sized,
    {
        self.target_address() == Arc::as_ptr(sink).cast::<()>()
    }

    fn target_address(&self) -> *const () {
        match self {
            Self::Strong(sink) => Arc::as_ptr(sink).cast::<()>(),
            // The address stays comparable even after the sink is gone.
            Self::Weak(sink) => sink.as_ptr().cast::<()>(),
        }
    }
}

impl<M> Clone for SinkRef<M> {
    fn clone(&self) -> Self {
        match self {
            Self::Strong(sink) => Self::Strong(Arc::clone(sink)),
            Self::Weak(sink) => Self::Weak(Weak::clone(sink)),
        }
    }
}

impl<M> fmt::Debug for SinkRef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkRef")
            .field("weak", &self.is_weak())
            .field("alive", &self.is_alive())
            .field("target", &self.target_address())
            .finish()
    }
}
