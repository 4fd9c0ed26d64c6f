#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![doc = include_str!("../README.md")]

mod cell;
mod error;
mod options;
mod subscriber;

pub use cell::{Detach, ReactiveCell};
pub use error::{SubscribeError, UnsubscribeError};
pub use options::{Notify, QueueSpec, SubscribeOptions};
pub use subscriber::{Subscriber, Tracked, TrackingMode};

pub use petiole::{registry, Clock, ParseClockError, Queue};

/// Runs `f` as one synchronous stretch.
///
/// Scheduled drains cannot interleave between the mutations inside, so a
/// burst of changes to a cell batches into at most one notification per
/// queued subscriber. Synchronous subscribers still run inline, once per
/// change.
pub fn batch<T>(f: impl FnOnce() -> T) -> T {
	petiole::critical(f)
}

#[doc = include_str!("../README.md")]
mod readme {}
