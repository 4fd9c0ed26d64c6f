//! Clock sources: strategies deciding *when* a queue's drain runs.
//!
//! A clock source never buffers; buffering is the queue's job. Each
//! variant is a thin strategy mapping onto the background driver (delay,
//! cancellability) plus a rank in the cross-queue priority order.

use core::{fmt, str::FromStr, time::Duration};

/// How long the modelled repaint interval lasts.
pub(crate) const FRAME: Duration = Duration::from_millis(16);
/// When an idle request carries no cap, fire after this long.
pub(crate) const IDLE_FALLBACK: Duration = Duration::from_millis(50);
/// The time-slice budget an idle drain may spend before yielding.
pub(crate) const IDLE_SLICE: Duration = Duration::from_millis(12);

/// A clock source tag.
///
/// Timeout parameters travel next to the tag wherever one applies (queue
/// construction, registry keys); `-1` conventionally means "none given".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Clock {
	/// No scheduling at all; dispatch is inline and no queue can carry
	/// this tag.
	Sync,
	/// Fires once the current synchronous stack has unwound.
	Microtask,
	/// Same class as [`Microtask`](`Clock::Microtask`), draining just
	/// after it when both are pending.
	Promise,
	/// A higher-priority microtask on hosts that distinguish one.
	Tick,
	/// The next task, no minimum delay, cancellable.
	Immediate,
	/// The next task via a message round trip; not cancellable.
	Message,
	/// A task after at least the given number of milliseconds; zero or
	/// negative means "as soon as possible".
	Timeout,
	/// Before the next repaint, modelled here as a fixed frame interval.
	Animation,
	/// When the host is idle, or after the given cap if one is provided.
	/// Drains under this tag are time-sliced by a deadline.
	Idle,
	/// Never fires on its own; only an explicit flush advances it.
	Manual,
}

impl Clock {
	/// All tags, in priority order.
	pub const ALL: [Clock; 10] = [
		Clock::Sync,
		Clock::Microtask,
		Clock::Promise,
		Clock::Tick,
		Clock::Message,
		Clock::Immediate,
		Clock::Timeout,
		Clock::Animation,
		Clock::Idle,
		Clock::Manual,
	];

	/// The rank of a queue on this clock within the cross-queue drain
	/// order, given the queue's timeout parameter.
	///
	/// # Logic
	///
	/// Whenever a queue is flushed, every queue of strictly lower
	/// priority is drained to empty first. `Timeout` floats within its
	/// band by its delay, below `Animation`.
	#[must_use]
	pub fn priority(self, timeout: i64) -> Priority {
		match self {
			Clock::Sync => Priority::new(0, 0),
			Clock::Microtask => Priority::new(1, 0),
			Clock::Promise => Priority::new(1, 1),
			Clock::Tick => Priority::new(2, 0),
			Clock::Message => Priority::new(3, 0),
			Clock::Immediate => Priority::new(4, 0),
			Clock::Timeout => Priority::new(4, timeout.max(0)),
			Clock::Animation => Priority::new(5, 0),
			Clock::Idle => Priority::new(6, 0),
			Clock::Manual => Priority::new(7, 0),
		}
	}

	/// Whether an outstanding scheduling on this clock can be revoked.
	#[must_use]
	pub fn is_cancellable(self) -> bool {
		matches!(
			self,
			Clock::Immediate | Clock::Timeout | Clock::Animation | Clock::Idle
		)
	}

	/// Whether queues on this clock use the double-buffered drain flavor.
	///
	/// Clocks whose re-scheduling is cheap use a single buffer instead,
	/// with in-drain appends joining the current drain.
	#[must_use]
	pub fn is_buffered(self) -> bool {
		matches!(
			self,
			Clock::Immediate | Clock::Message | Clock::Timeout | Clock::Animation | Clock::Idle
		)
	}

	/// The driver delay for this clock, or [`None`] when it never fires
	/// by itself.
	pub(crate) fn delay(self, timeout: i64) -> Option<Duration> {
		#[allow(clippy::cast_sign_loss)]
		match self {
			Clock::Sync | Clock::Manual => None,
			Clock::Microtask
			| Clock::Promise
			| Clock::Tick
			| Clock::Immediate
			| Clock::Message => Some(Duration::ZERO),
			Clock::Timeout => Some(Duration::from_millis(timeout.max(0) as u64)),
			Clock::Animation => Some(FRAME),
			Clock::Idle => Some(if timeout >= 0 {
				Duration::from_millis(timeout as u64)
			} else {
				IDLE_FALLBACK
			}),
		}
	}

	/// Whether natural drains on this clock are time-sliced by a deadline.
	pub(crate) fn is_deadline_sliced(self) -> bool {
		self == Clock::Idle
	}
}

impl fmt::Display for Clock {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Clock::Sync => "sync",
			Clock::Microtask => "microtask",
			Clock::Promise => "promise",
			Clock::Tick => "tick",
			Clock::Immediate => "immediate",
			Clock::Message => "message",
			Clock::Timeout => "timeout",
			Clock::Animation => "animation",
			Clock::Idle => "idle",
			Clock::Manual => "manual",
		})
	}
}

/// The error returned when parsing an unsupported clock tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown clock tag `{0}`")]
pub struct ParseClockError(pub String);

impl FromStr for Clock {
	type Err = ParseClockError;

	fn from_str(tag: &str) -> Result<Self, Self::Err> {
		Ok(match tag {
			"sync" => Clock::Sync,
			"microtask" => Clock::Microtask,
			"promise" => Clock::Promise,
			"tick" => Clock::Tick,
			"immediate" => Clock::Immediate,
			"message" => Clock::Message,
			"timeout" => Clock::Timeout,
			"animation" => Clock::Animation,
			"idle" => Clock::Idle,
			"manual" => Clock::Manual,
			_ => return Err(ParseClockError(tag.to_owned())),
		})
	}
}

/// A queue's rank within the cross-queue drain order. Lower drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority {
	class: u8,
	detail: i64,
}

impl Priority {
	const fn new(class: u8, detail: i64) -> Self {
		Self { class, detail }
	}

	/// A priority above every clock source; nothing drains after it.
	#[must_use]
	pub const fn ceiling() -> Self {
		Self::new(u8::MAX, i64::MAX)
	}
}

#[cfg(test)]
mod tests {
	use super::{Clock, ParseClockError};

	#[test]
	fn tags_round_trip() {
		for clock in Clock::ALL {
			assert_eq!(clock.to_string().parse(), Ok(clock));
		}
		assert_eq!(
			"oracle".parse::<Clock>(),
			Err(ParseClockError("oracle".to_owned()))
		);
	}

	#[test]
	fn ranks_are_layered() {
		let ranks = [
			Clock::Sync.priority(-1),
			Clock::Microtask.priority(-1),
			Clock::Promise.priority(-1),
			Clock::Tick.priority(-1),
			Clock::Message.priority(-1),
			Clock::Immediate.priority(-1),
			Clock::Timeout.priority(0),
			Clock::Timeout.priority(7),
			Clock::Animation.priority(-1),
			Clock::Idle.priority(-1),
			Clock::Manual.priority(-1),
		];
		for pair in ranks.windows(2) {
			assert!(pair[0] <= pair[1], "{:?} must not outrank {:?}", pair[0], pair[1]);
		}
		// Immediate and an unparameterised timeout share a rank.
		assert_eq!(Clock::Immediate.priority(-1), Clock::Timeout.priority(-1));
		// Longer timeouts drain later within the band.
		assert!(Clock::Timeout.priority(3) < Clock::Timeout.priority(30));
	}
}
