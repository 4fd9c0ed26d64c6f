use std::sync::Arc;

use petiole::{registry, Clock, Queue};

/// How a subscription is dispatched, and whether it fires once at
/// subscription time.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
	/// The queue carrying notifications; synchronous when unset.
	pub queue: QueueSpec,
	/// The first-fire behavior.
	pub notify: Notify,
}

impl SubscribeOptions {
	/// Synchronous dispatch on the notifying call stack. The default.
	#[must_use]
	pub fn sync() -> Self {
		Self::default()
	}

	/// Batched dispatch on the shared queue for `clock`.
	#[must_use]
	pub fn on(clock: Clock) -> Self {
		Self {
			queue: QueueSpec::Clock(clock),
			notify: Notify::None,
		}
	}

	/// Batched dispatch on the shared queue for `(clock, timeout)`.
	#[must_use]
	pub fn on_with_timeout(clock: Clock, timeout: i64) -> Self {
		Self {
			queue: QueueSpec::ClockTimeout(clock, timeout),
			notify: Notify::None,
		}
	}

	/// Batched dispatch on a concrete queue.
	#[must_use]
	pub fn on_queue(queue: Arc<Queue>) -> Self {
		Self {
			queue: QueueSpec::Queue(queue),
			notify: Notify::None,
		}
	}

	/// Replaces the first-fire behavior.
	#[must_use]
	pub fn notify(mut self, notify: Notify) -> Self {
		self.notify = notify;
		self
	}
}

/// Selects the queue, if any, that carries a subscription's
/// notifications.
#[derive(Debug, Clone, Default)]
pub enum QueueSpec {
	/// Dispatch inline, on the notifying call stack.
	#[default]
	Sync,
	/// The shared queue for a clock tag, without a timeout parameter.
	/// [`Clock::Sync`] here means inline dispatch, same as
	/// [`QueueSpec::Sync`].
	Clock(Clock),
	/// The shared queue for a clock tag and timeout.
	ClockTimeout(Clock, i64),
	/// A concrete queue.
	Queue(Arc<Queue>),
}

impl QueueSpec {
	/// The queue notifications go through, or [`None`] for inline
	/// dispatch.
	pub(crate) fn resolve(&self) -> Option<Arc<Queue>> {
		match self {
			QueueSpec::Sync
			| QueueSpec::Clock(Clock::Sync)
			| QueueSpec::ClockTimeout(Clock::Sync, _) => None,
			QueueSpec::Clock(clock) => Some(registry::acquire(*clock, -1)),
			QueueSpec::ClockTimeout(clock, timeout) => Some(registry::acquire(*clock, *timeout)),
			QueueSpec::Queue(queue) => Some(Arc::clone(queue)),
		}
	}
}

/// Whether and how a fresh subscription fires once at subscribe time.
///
/// Regular notifications afterwards always go through the subscription's
/// queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Notify {
	/// Do not fire on subscribe. The default.
	#[default]
	None,
	/// Fire once through the chosen queue.
	Queued,
	/// Fire once synchronously, regardless of the chosen queue.
	Sync,
}
