//! The process-wide queue registry.
//!
//! Shared queues are pooled by `(clock, timeout)` and lazily created on
//! first acquisition. Queues that sit empty and unused between two reap
//! passes are dropped from the pool again. Independently of the pool, a
//! weak roster of every queue ever constructed backs the cross-queue
//! chase loop and the global flush.

use std::{
	cell::RefCell,
	collections::BTreeMap,
	sync::{Arc, Weak},
	time::Duration,
};

use once_cell::sync::Lazy;
use tracing::debug;

use crate::{
	clock::{Clock, Priority},
	critical::critical,
	driver,
	queue::Queue,
};

struct Registry {
	state: RefCell<RegistryState>,
}

// State is only touched inside the critical section.
unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

struct RegistryState {
	pool: BTreeMap<(Clock, i64), Arc<Queue>>,
	roster: Vec<Weak<Queue>>,
	reap_interval: Option<Duration>,
	reap_threshold: usize,
	reap_scheduled: bool,
}

static REGISTRY: Lazy<Registry> = Lazy::new(|| Registry {
	state: RefCell::new(RegistryState {
		pool: BTreeMap::new(),
		roster: Vec::new(),
		reap_interval: Some(Duration::from_secs(5)),
		reap_threshold: 10,
		reap_scheduled: false,
	}),
});

/// Returns the shared queue for `(clock, timeout)`, creating it on first
/// use. Pass `-1` for "no timeout".
///
/// # Panics
///
/// Panics when `clock` is [`Clock::Sync`]; synchronous dispatch is inline
/// and has no queue.
#[must_use]
pub fn acquire(clock: Clock, timeout: i64) -> Arc<Queue> {
	critical(|| {
		if let Some(queue) = REGISTRY.state.borrow().pool.get(&(clock, timeout)) {
			return Arc::clone(queue);
		}
		let queue = Queue::new(clock, timeout);
		let (grown_past_threshold, schedule_reap) = {
			let mut state = REGISTRY.state.borrow_mut();
			state.pool.insert((clock, timeout), Arc::clone(&queue));
			let schedule = !state.reap_scheduled && state.reap_interval.is_some();
			state.reap_scheduled |= schedule;
			(state.pool.len() > state.reap_threshold, schedule)
		};
		if schedule_reap {
			schedule_reap_pass();
		}
		if grown_past_threshold {
			reap(false);
		}
		queue
	})
}

/// Flushes every live registered queue, in ascending priority order.
///
/// See [`Queue::flush`] for what `recursive` means for a queue that is
/// already draining.
pub fn flush_all(recursive: bool) {
	critical(|| {
		let mut queues: Vec<Arc<Queue>> = {
			let mut state = REGISTRY.state.borrow_mut();
			state.roster.retain(|queue| queue.strong_count() > 0);
			state.roster.iter().filter_map(Weak::upgrade).collect()
		};
		queues.sort_by_key(|queue| queue.priority());
		for queue in queues {
			queue.flush(recursive);
		}
	});
}

/// Drops pooled queues that are empty and, unless `force` is given, went
/// unused since the last pass. Clears the usage marks either way.
pub fn reap(force: bool) {
	critical(|| {
		let mut state = REGISTRY.state.borrow_mut();
		let before = state.pool.len();
		state.pool.retain(|_, queue| {
			let used = queue.take_used();
			!queue.is_reapable() || (used && !force)
		});
		state.roster.retain(|queue| queue.strong_count() > 0);
		let reaped = before - state.pool.len();
		if reaped > 0 {
			debug!(reaped, remaining = state.pool.len(), "reaped queue pool");
		}
	});
}

/// Sets the period of the background reap pass. [`None`] disables it.
/// Defaults to 5 seconds.
pub fn set_reap_interval(interval: Option<Duration>) {
	critical(|| REGISTRY.state.borrow_mut().reap_interval = interval);
}

/// Sets the pool size past which an acquisition triggers an eager reap
/// pass. Defaults to 10.
pub fn set_reap_threshold(threshold: usize) {
	critical(|| REGISTRY.state.borrow_mut().reap_threshold = threshold);
}

fn schedule_reap_pass() {
	let Some(interval) = critical(|| REGISTRY.state.borrow().reap_interval) else {
		critical(|| REGISTRY.state.borrow_mut().reap_scheduled = false);
		return;
	};
	driver::schedule(
		interval,
		Priority::ceiling(),
		Box::new(|| {
			critical(|| {
				reap(false);
				let again = {
					let state = REGISTRY.state.borrow();
					!state.pool.is_empty() && state.reap_interval.is_some()
				};
				if again {
					schedule_reap_pass();
				} else {
					REGISTRY.state.borrow_mut().reap_scheduled = false;
				}
			});
		}),
	);
}

/// Adds a queue to the roster. Called from [`Queue::new`].
pub(crate) fn enroll(queue: &Arc<Queue>) {
	critical(|| {
		REGISTRY.state.borrow_mut().roster.push(Arc::downgrade(queue));
	});
}

/// Drains every live queue of priority strictly below `limit` until none
/// of them has anything pending. Queues whose drain is already on the
/// stack are left to the frame that owns them.
pub(crate) fn drain_below(limit: Priority) {
	loop {
		let next = {
			let state = REGISTRY.state.borrow();
			state
				.roster
				.iter()
				.filter_map(Weak::upgrade)
				.filter(|queue| queue.priority() < limit && queue.wants_chase())
				.min_by_key(|queue| queue.priority())
		};
		match next {
			Some(queue) => queue.chase_drain(),
			None => return,
		}
	}
}

#[cfg(test)]
mod tests {
	use parking_lot::Mutex;

	use crate::queue::{Dispatch, DispatchToken, QueueId};

	use super::{acquire, reap, set_reap_interval, Arc, Clock};

	static SERIAL: Mutex<()> = Mutex::new(());

	struct Noop(DispatchToken);

	impl Dispatch for Noop {
		fn dispatch(&self, _queue: QueueId) {}

		fn token(&self) -> DispatchToken {
			self.0
		}
	}

	#[test]
	fn acquisitions_share_one_queue_per_key() {
		let _serial = SERIAL.lock();
		set_reap_interval(None);
		let a = acquire(Clock::Timeout, 7001);
		let b = acquire(Clock::Timeout, 7001);
		let c = acquire(Clock::Timeout, 7002);
		assert_eq!(a.id(), b.id());
		assert_ne!(a.id(), c.id());
	}

	#[test]
	#[should_panic(expected = "cannot back a queue")]
	fn the_sync_clock_has_no_queue() {
		let _ = acquire(Clock::Sync, -1);
	}

	#[test]
	fn unused_empty_queues_are_reaped() {
		let _serial = SERIAL.lock();
		set_reap_interval(None);

		let fresh = acquire(Clock::Timeout, 7100);
		let id = fresh.id();
		drop(fresh);
		// Never drained, so the first pass already drops it.
		reap(false);
		assert_ne!(acquire(Clock::Timeout, 7100).id(), id);

		let used = acquire(Clock::Timeout, 7200);
		let id = used.id();
		used.enqueue(Arc::new(Noop(DispatchToken::next())));
		used.flush(false);
		// Draining marked it used, so it survives exactly one pass.
		let _keep = Arc::clone(&used);
		reap(false);
		assert_eq!(acquire(Clock::Timeout, 7200).id(), id);
		reap(false);
		assert_ne!(acquire(Clock::Timeout, 7200).id(), id);
	}
}
