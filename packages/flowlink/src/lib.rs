#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Synchronization primitives and a message-routing graph for producer/consumer pipelines.
//!
//! The building blocks:
//!
//! * [`HybridRwLock`] - a reader-writer lock that spins briefly before suspending, usable from
//!   blocking and async code alike, with approximate fairness between readers and writers.
//! * [`WaitSignal`] - a manual-reset latch that blocking threads and async tasks can wait on
//!   together, with timeouts and [cancellation][CancellationToken].
//! * [`Source`] and [`Sink`] - the two sides of a graph edge. Sources fan every message out to
//!   their connected sinks, in connection order, holding each sink strongly or weakly.
//!
//! And the endpoints built on them:
//!
//! * [`PriorityReceiver`] - holds only the highest-priority message seen since the last receive.
//! * [`DuplicateSuppressor`] - drops repeats of a message within a time window.
//! * [`RpcCorrelator`] - matches responses to pending requests, with per-request expiry.
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use flowlink::{DuplicateSuppressor, PriorityReceiver, Sender, Source};
//!
//! let sender = Sender::<u32>::new();
//!
//! let receiver = sender
//!     .connect_to(&Arc::new(DuplicateSuppressor::<u32>::new(Duration::from_secs(60))))
//!     .connect_to(&Arc::new(PriorityReceiver::<u32>::new()));
//!
//! for reading in [42, 99, 42, 10] {
//!     sender.send(reading).unwrap();
//! }
//!
//! assert_eq!(receiver.try_receive(), Some(99));
//! ```
//!
//! # Time
//!
//! Every time-aware type takes an [`Arc<dyn Clock>`][Clock]. [`SystemClock`] is the default;
//! [`ManualClock`] only moves when told to and makes timing behavior deterministic in tests.
//!
//! # Logging
//!
//! The crate emits [`tracing`] events: topology changes and expiry at debug level, per-message
//! decisions at trace level, and absorbed sink failures at warn level. Install a subscriber to
//! see them.

mod cancellation;
mod clock;
mod duplicate_suppressor;
mod error;
mod hybrid_rw_lock;
mod priority_receiver;
mod rpc_correlator;
mod sender;
mod sink;
mod source;
mod spin_wait;
mod wait_signal;

#[cfg(test)]
mod test_support;

pub use cancellation::*;
pub use clock::*;
pub use duplicate_suppressor::*;
pub use error::*;
pub use hybrid_rw_lock::*;
pub use priority_receiver::*;
pub use rpc_correlator::*;
pub use sender::*;
pub use sink::*;
pub use source::*;
pub use spin_wait::SpinPolicy;
pub use wait_signal::*;
