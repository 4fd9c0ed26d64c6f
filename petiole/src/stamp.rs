//! The global notification counter.
//!
//! Dirty state throughout the engine is *equality*-compared against this
//! counter (and against the per-subscriber call counters layered on top of
//! it), never range-compared, so plain wrapping arithmetic keeps the
//! protocol sound arbitrarily far along.

use core::sync::atomic::{AtomicU64, Ordering};

// Only read and advanced inside the critical section, hence `Relaxed`.
static COUNTER: AtomicU64 = AtomicU64::new(1);

/// The current value of the counter.
#[must_use]
pub fn current() -> u64 {
	COUNTER.load(Ordering::Relaxed)
}

/// Advances the counter by one notification event, returning the new value.
///
/// Notification events are the synchronous dispatch phase of a cell and
/// each batch boundary of a queue drain, including the leading one. (The
/// leading advance is what lets a callback that runs inside a drained
/// batch re-enqueue against cells notified in the previous batch.)
pub fn advance() -> u64 {
	COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

/// Moves the counter to an arbitrary point.
///
/// Only useful to exercise wrapping in tests.
#[doc(hidden)]
pub fn warp(value: u64) {
	COUNTER.store(value, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
	use super::{advance, current, warp};

	#[test]
	fn advances_across_the_wrap() {
		warp(u64::MAX - 1);
		let before = current();
		assert_eq!(advance(), u64::MAX);
		assert_eq!(advance(), 0);
		assert_eq!(advance(), 1);
		// Equality against a stale snapshot must not resurface.
		assert_ne!(current(), before);
		warp(1);
	}
}
