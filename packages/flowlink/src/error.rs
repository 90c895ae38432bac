use thiserror::Error;

use crate::RequestId;

/// Errors reported by graph operations.
///
/// Timeouts and cancellations are not errors; they are reported as `false` or `None` outcomes
/// by the operations that can time out.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A sink refused or failed to process a message.
    #[error("sink failed to process message: {reason}")]
    SinkFailed {
        /// A human-readable description of the problem.
        reason: String,
    },

    /// One or more sinks failed during a best-effort fan-out.
    ///
    /// Every connected sink was still offered the message.
    #[error("{failed} of {attempted} sinks failed during fan-out, first failure: {first}")]
    FanOut {
        /// How many sinks reported a failure.
        failed: usize,

        /// How many live sinks the message was offered to.
        attempted: usize,

        /// The first failure, in connection order.
        first: Box<Error>,
    },

    /// A request was registered with an id that already has a pending request.
    #[error("request id {id} already has a pending request")]
    DuplicateRequestId {
        /// The conflicting request id.
        id: RequestId,
    },
}

impl Error {
    /// Shorthand for [`Error::SinkFailed`].
    #[must_use]
    pub fn sink_failed(reason: impl Into<String>) -> Self {
        Self::SinkFailed {
            reason: reason.into(),
        }
    }
}

/// A specialized `Result` type for graph operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn fan_out_message_names_first_failure() {
        let error = Error::FanOut {
            failed: 2,
            attempted: 3,
            first: Box::new(Error::sink_failed("disk full")),
        };

        let message = error.to_string();

        assert!(message.contains("2 of 3"));
        assert!(message.contains("disk full"));
    }

    #[test]
    fn duplicate_request_id_names_id() {
        let error = Error::DuplicateRequestId {
            id: RequestId::new(17),
        };

        assert!(error.to_string().contains("17"));
    }
}
