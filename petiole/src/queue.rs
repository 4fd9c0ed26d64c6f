//! Queues: FIFO buffers of pending dispatch targets for one clock source.
//!
//! Two drain flavors exist. Clocks whose next firing is cheap use a single
//! buffer whose in-drain appends join the current drain at the next batch
//! boundary. Clocks whose re-scheduling is expensive are double-buffered:
//! the drain swaps the buffers and iterates the swapped-out one while new
//! enqueues land in the other, looping until both settle.
//!
//! Whenever a queue drains, every registered queue of strictly lower
//! priority is drained to empty first, so chains of effects spread across
//! clock sources settle within one firing of the highest one involved.

use core::mem;
use std::{
	cell::RefCell,
	fmt::{self, Debug, Formatter},
	num::NonZeroU64,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::Instant,
};

use scopeguard::ScopeGuard;
use tracing::trace;

use crate::{
	clock::{Clock, Priority, IDLE_SLICE},
	critical::critical,
	driver, registry, stamp,
};

/// A dispatch target a queue can buffer and later invoke.
///
/// # Logic
///
/// [`dispatch`](`Dispatch::dispatch`) runs inside the critical section;
/// implementations may re-enter the engine freely (enqueue, dequeue,
/// flush, notify).
pub trait Dispatch: Send + Sync {
	/// Invokes the target. `queue` identifies the draining queue.
	fn dispatch(&self, queue: QueueId);

	/// A process-unique identity used to find this target in queue
	/// buffers without comparing pointers.
	fn token(&self) -> DispatchToken;
}

/// Process-unique identity of a [`Dispatch`] implementor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DispatchToken(NonZeroU64);

impl DispatchToken {
	/// Creates a fresh token.
	#[must_use]
	pub fn next() -> Self {
		static COUNTER: AtomicU64 = AtomicU64::new(0);
		Self(
			(COUNTER.fetch_add(1, Ordering::Relaxed) + 1)
				.try_into()
				.expect("infallible within reasonable time"),
		)
	}
}

/// Process-unique identity of a [`Queue`].
///
/// Subscriber-side bookkeeping keys by this value so it does not have to
/// hold on to the queue itself longer than needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueId(NonZeroU64);

impl QueueId {
	fn next() -> Self {
		static COUNTER: AtomicU64 = AtomicU64::new(0);
		Self(
			(COUNTER.fetch_add(1, Ordering::Relaxed) + 1)
				.try_into()
				.expect("infallible within reasonable time"),
		)
	}
}

impl fmt::Display for QueueId {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "q{}", self.0)
	}
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
	index: usize,
	batch: usize,
}

struct State {
	pending: Vec<Arc<dyn Dispatch>>,
	/// The swapped-out buffer a double-buffered drain iterates.
	active: Vec<Arc<dyn Dispatch>>,
	cursor: Option<Cursor>,
	scheduled: Option<driver::Token>,
	deadline: Option<Instant>,
	used: bool,
	max_inline: usize,
	inline_flush_recursive: bool,
}

impl State {
	fn new() -> Self {
		Self {
			pending: Vec::new(),
			active: Vec::new(),
			cursor: None,
			scheduled: None,
			deadline: None,
			used: false,
			max_inline: 500,
			inline_flush_recursive: true,
		}
	}
}

enum Step {
	Invoke(Arc<dyn Dispatch>),
	Boundary,
	Yield,
	Settled,
}

/// A FIFO of dispatch targets awaiting one clock source.
pub struct Queue {
	id: QueueId,
	clock: Clock,
	timeout: i64,
	state: RefCell<State>,
}

// State is only touched inside the critical section.
unsafe impl Send for Queue {}
unsafe impl Sync for Queue {}

impl Queue {
	/// Creates a standalone queue on `clock`.
	///
	/// Shared queues are normally obtained from the
	/// [`registry`](`crate::registry`) instead; a queue created here
	/// still participates in cross-queue draining and global flushes.
	///
	/// # Panics
	///
	/// Panics when `clock` is [`Clock::Sync`], which dispatches inline
	/// and cannot back a queue.
	#[must_use]
	pub fn new(clock: Clock, timeout: i64) -> Arc<Self> {
		assert!(
			clock != Clock::Sync,
			"the `sync` clock dispatches inline and cannot back a queue"
		);
		let queue = Arc::new(Self {
			id: QueueId::next(),
			clock,
			timeout,
			state: RefCell::new(State::new()),
		});
		registry::enroll(&queue);
		queue
	}

	/// This queue's identity.
	#[must_use]
	pub fn id(&self) -> QueueId {
		self.id
	}

	/// The clock source this queue drains on.
	#[must_use]
	pub fn clock(&self) -> Clock {
		self.clock
	}

	/// The timeout parameter this queue was created with; `-1` when none
	/// was given.
	#[must_use]
	pub fn timeout(&self) -> i64 {
		self.timeout
	}

	/// This queue's rank in the cross-queue drain order.
	#[must_use]
	pub fn priority(&self) -> Priority {
		self.clock.priority(self.timeout)
	}

	/// How many entries are waiting to be notified.
	#[must_use]
	pub fn len(&self) -> usize {
		critical(|| self.unnotified(&self.state.borrow()))
	}

	/// Whether no entries are waiting to be notified.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Caps how many unnotified entries may accumulate before an enqueue
	/// drains inline instead of waiting for the clock. Defaults to 500.
	pub fn set_max_inline(&self, max_inline: usize) {
		critical(|| self.state.borrow_mut().max_inline = max_inline);
	}

	/// Whether an inline overflow drain resumes an in-flight iteration.
	/// Defaults to `true`.
	pub fn set_inline_flush_recursive(&self, recursive: bool) {
		critical(|| self.state.borrow_mut().inline_flush_recursive = recursive);
	}

	/// Appends `target`.
	///
	/// If the unnotified count exceeds the inline cap this drains on the
	/// spot; otherwise a backend scheduling is requested unless one is
	/// already outstanding or a drain is already running.
	///
	/// Callers are responsible for not enqueueing a target that is
	/// already waiting here.
	pub fn enqueue(self: &Arc<Self>, target: Arc<dyn Dispatch>) {
		critical(|| {
			let overflow = {
				let mut state = self.state.borrow_mut();
				state.pending.push(target);
				if self.unnotified(&state) > state.max_inline {
					Some(state.inline_flush_recursive)
				} else {
					if state.cursor.is_none() && state.scheduled.is_none() {
						self.request_schedule(&mut state);
					}
					None
				}
			};
			if let Some(recursive) = overflow {
				self.flush(recursive);
			}
		});
	}

	/// Removes the latest entry with `token`, searching from the tail.
	///
	/// Returns whether an entry was removed. When the queue empties and
	/// the clock can cancel, the outstanding scheduling is revoked.
	pub fn dequeue(&self, token: DispatchToken) -> bool {
		critical(|| {
			let mut state = self.state.borrow_mut();
			let State {
				pending,
				active,
				cursor,
				..
			} = &mut *state;

			let buffered = self.clock.is_buffered();
			let mut removed = false;
			if let Some(at) = pending.iter().rposition(|d| d.token() == token) {
				pending.remove(at);
				if !buffered {
					if let Some(cursor) = cursor {
						if at < cursor.index {
							cursor.index -= 1;
						}
						if at < cursor.batch {
							cursor.batch -= 1;
						}
					}
				}
				removed = true;
			} else if buffered {
				if let Some(cursor) = cursor {
					// The not-yet-notified tail of the swapped buffer is
					// still eligible.
					if let Some(offset) =
						active[cursor.index..].iter().rposition(|d| d.token() == token)
					{
						active.remove(cursor.index + offset);
						cursor.batch -= 1;
						removed = true;
					}
				}
			}

			if removed && self.unnotified(&state) == 0 && self.clock.is_cancellable() {
				if let Some(token) = state.scheduled.take() {
					driver::cancel(token);
				}
			}
			removed
		})
	}

	/// Drains now.
	///
	/// While a drain is already running this resumes the in-flight
	/// iteration iff `recursive` (the very same iteration: nothing is
	/// restarted and nothing is notified twice) and otherwise does
	/// nothing. When idle, any outstanding backend scheduling is
	/// cancelled, every registered queue of strictly lower priority is
	/// drained to empty, and then this queue drains.
	pub fn flush(self: &Arc<Self>, recursive: bool) {
		critical(|| {
			{
				let state = self.state.borrow();
				if state.cursor.is_some() {
					drop(state);
					if recursive {
						self.run();
					}
					return;
				}
				if state.pending.is_empty() {
					return;
				}
			}
			{
				let mut state = self.state.borrow_mut();
				if let Some(token) = state.scheduled.take() {
					driver::cancel(token);
				}
			}
			registry::drain_below(self.priority());
			let began = {
				let mut state = self.state.borrow_mut();
				self.begin(&mut state, None)
			};
			if began {
				self.run();
			}
		});
	}

	/// The clock source fired.
	pub(crate) fn fire(self: &Arc<Self>) {
		critical(|| {
			{
				let mut state = self.state.borrow_mut();
				state.scheduled = None;
				if state.cursor.is_some() || state.pending.is_empty() {
					// Either an explicit flush won the critical section
					// first, or everything was dequeued off a clock that
					// cannot cancel.
					return;
				}
			}
			registry::drain_below(self.priority());
			let deadline = if self.clock.is_deadline_sliced() {
				Some(Instant::now() + IDLE_SLICE)
			} else {
				None
			};
			let began = {
				let mut state = self.state.borrow_mut();
				self.begin(&mut state, deadline)
			};
			if began {
				self.run();
			}
		});
	}

	/// Used by the registry's chase loop; lower ranks were already
	/// handled by the caller's ascending order.
	pub(crate) fn chase_drain(self: &Arc<Self>) {
		{
			let mut state = self.state.borrow_mut();
			if state.cursor.is_some() || state.pending.is_empty() {
				return;
			}
			if let Some(token) = state.scheduled.take() {
				driver::cancel(token);
			}
			if !self.begin(&mut state, None) {
				return;
			}
		}
		self.run();
	}

	/// Whether the chase loop has anything to do here.
	pub(crate) fn wants_chase(&self) -> bool {
		let state = self.state.borrow();
		state.cursor.is_none() && !state.pending.is_empty()
	}

	pub(crate) fn is_reapable(&self) -> bool {
		let state = self.state.borrow();
		state.cursor.is_none() && state.pending.is_empty() && state.active.is_empty()
	}

	pub(crate) fn take_used(&self) -> bool {
		mem::replace(&mut self.state.borrow_mut().used, false)
	}

	fn unnotified(&self, state: &State) -> usize {
		if self.clock.is_buffered() {
			let tail = state
				.cursor
				.map_or(0, |cursor| state.active.len() - cursor.index);
			state.pending.len() + tail
		} else {
			// Entries before the cursor have been notified but not yet
			// truncated at a boundary.
			state.pending.len() - state.cursor.map_or(0, |cursor| cursor.index)
		}
	}

	fn request_schedule(self: &Arc<Self>, state: &mut State) {
		let Some(delay) = self.clock.delay(self.timeout) else {
			return;
		};
		let queue = Arc::downgrade(self);
		let token = driver::schedule(
			delay,
			self.priority(),
			Box::new(move || {
				if let Some(queue) = queue.upgrade() {
					queue.fire();
				}
			}),
		);
		state.scheduled = Some(token);
	}

	/// Starts an iteration. Returns whether there was anything to drain.
	fn begin(&self, state: &mut State, deadline: Option<Instant>) -> bool {
		debug_assert!(state.cursor.is_none());
		if state.pending.is_empty() {
			return false;
		}
		if let Some(token) = state.scheduled.take() {
			driver::cancel(token);
		}
		state.used = true;
		state.deadline = deadline;
		stamp::advance();
		if self.clock.is_buffered() {
			debug_assert!(state.active.is_empty());
			mem::swap(&mut state.pending, &mut state.active);
			state.cursor = Some(Cursor {
				index: 0,
				batch: state.active.len(),
			});
		} else {
			state.cursor = Some(Cursor {
				index: 0,
				batch: state.pending.len(),
			});
		}
		trace!(queue = %self.id, clock = %self.clock, "drain starting");
		true
	}

	/// Advances the shared iteration until it settles or yields.
	///
	/// Re-entrant calls pick up the very same cursor, which is what makes
	/// a recursive flush resume rather than restart.
	fn run(self: &Arc<Self>) {
		loop {
			let step = {
				let mut state = self.state.borrow_mut();
				self.next_step(&mut state)
			};
			match step {
				Step::Settled => return,
				Step::Yield => {
					let mut state = self.state.borrow_mut();
					self.yield_remaining(&mut state);
					return;
				}
				Step::Invoke(target) => {
					// An unwinding callback abandons the iteration; the
					// already notified prefix must not run again.
					let guard = scopeguard::guard_on_unwind(Arc::clone(self), |queue| {
						let mut state = queue.state.borrow_mut();
						queue.yield_remaining(&mut state);
					});
					target.dispatch(self.id);
					let _ = ScopeGuard::into_inner(guard);
				}
				Step::Boundary => {
					let mut state = self.state.borrow_mut();
					if !self.turn(&mut state) {
						trace!(queue = %self.id, "drain settled");
						return;
					}
				}
			}
		}
	}

	fn next_step(&self, state: &mut State) -> Step {
		let Some(cursor) = state.cursor else {
			return Step::Settled;
		};
		if cursor.index >= cursor.batch {
			return Step::Boundary;
		}
		if let Some(deadline) = state.deadline {
			if Instant::now() >= deadline {
				return Step::Yield;
			}
		}
		let buffer = if self.clock.is_buffered() {
			&state.active
		} else {
			&state.pending
		};
		let target = Arc::clone(&buffer[cursor.index]);
		state.cursor = Some(Cursor {
			index: cursor.index + 1,
			..cursor
		});
		Step::Invoke(target)
	}

	/// Crosses a batch boundary. Returns whether another batch follows.
	fn turn(&self, state: &mut State) -> bool {
		let Some(cursor) = state.cursor else {
			return false;
		};
		if self.clock.is_buffered() {
			state.active.clear();
			if state.pending.is_empty() {
				state.cursor = None;
				state.deadline = None;
				false
			} else {
				mem::swap(&mut state.pending, &mut state.active);
				stamp::advance();
				state.cursor = Some(Cursor {
					index: 0,
					batch: state.active.len(),
				});
				true
			}
		} else {
			let fresh = state.pending.len() - cursor.batch;
			if fresh == 0 {
				state.pending.clear();
				state.cursor = None;
				state.deadline = None;
				false
			} else {
				// Drop the notified prefix to keep memory bounded across
				// long recursive cascades.
				state.pending.drain(..cursor.batch);
				stamp::advance();
				state.cursor = Some(Cursor {
					index: 0,
					batch: fresh,
				});
				true
			}
		}
	}

	/// Ends the iteration early, keeping the unfinished tail pending and
	/// re-requesting a scheduling for it.
	fn yield_remaining(self: &Arc<Self>, state: &mut State) {
		let Some(cursor) = state.cursor.take() else {
			return;
		};
		state.deadline = None;
		if self.clock.is_buffered() {
			let mut tail = state.active.split_off(cursor.index);
			state.active.clear();
			tail.append(&mut state.pending);
			state.pending = tail;
		} else {
			state.pending.drain(..cursor.index);
		}
		if !state.pending.is_empty() && state.scheduled.is_none() {
			trace!(queue = %self.id, remaining = state.pending.len(), "drain yielding");
			self.request_schedule(state);
		}
	}
}

impl Debug for Queue {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		critical(|| {
			let state = self.state.borrow();
			f.debug_struct("Queue")
				.field("id", &self.id)
				.field("clock", &self.clock)
				.field("timeout", &self.timeout)
				.field("pending", &self.unnotified(&state))
				.finish_non_exhaustive()
		})
	}
}

#[cfg(test)]
mod tests {
	use std::{thread::sleep, time::Duration};

	use parking_lot::Mutex;

	use super::{Arc, Clock, Dispatch, DispatchToken, Queue, QueueId};

	type Log = Arc<Mutex<Vec<&'static str>>>;

	// Cross-queue draining is global, so these tests take turns.
	static SERIAL: Mutex<()> = Mutex::new(());

	struct Probe {
		token: DispatchToken,
		name: &'static str,
		log: Log,
		effect: Mutex<Box<dyn FnMut(QueueId) + Send>>,
	}

	impl Dispatch for Probe {
		fn dispatch(&self, queue: QueueId) {
			self.log.lock().push(self.name);
			let mut effect = self.effect.lock();
			(*effect)(queue);
		}

		fn token(&self) -> DispatchToken {
			self.token
		}
	}

	fn probe(name: &'static str, log: &Log) -> Arc<Probe> {
		probe_with(name, log, |_| ())
	}

	fn probe_with(
		name: &'static str,
		log: &Log,
		effect: impl FnMut(QueueId) + Send + 'static,
	) -> Arc<Probe> {
		Arc::new(Probe {
			token: DispatchToken::next(),
			name,
			log: Arc::clone(log),
			effect: Mutex::new(Box::new(effect)),
		})
	}

	#[test]
	fn manual_queue_only_flushes_explicitly() {
		let _serial = SERIAL.lock();
		let log: Log = Log::default();
		let queue = Queue::new(Clock::Manual, -1);
		queue.enqueue(probe("a", &log));
		queue.enqueue(probe("b", &log));
		sleep(Duration::from_millis(30));
		assert_eq!(*log.lock(), Vec::<&str>::new());
		queue.flush(false);
		assert_eq!(*log.lock(), ["a", "b"]);
		assert!(queue.is_empty());
	}

	#[test]
	fn in_drain_enqueues_join_the_same_drain() {
		let _serial = SERIAL.lock();
		let log: Log = Log::default();
		let queue = Queue::new(Clock::Manual, -1);
		let late = probe("late", &log);
		queue.enqueue(probe_with("early", &log, {
			let queue = Arc::clone(&queue);
			let late = Arc::clone(&late);
			move |_| queue.enqueue(Arc::clone(&late) as Arc<dyn Dispatch>)
		}));
		queue.enqueue(probe("middle", &log));
		queue.flush(false);
		assert_eq!(*log.lock(), ["early", "middle", "late"]);
	}

	#[test]
	fn recursive_flush_resumes_the_iteration_in_flight() {
		let _serial = SERIAL.lock();
		let log: Log = Log::default();
		let queue = Queue::new(Clock::Manual, -1);
		queue.enqueue(probe_with("a", &log, {
			let queue = Arc::clone(&queue);
			let log = Log::clone(&log);
			move |_| {
				queue.flush(true);
				log.lock().push("a-done");
			}
		}));
		queue.enqueue(probe("b", &log));
		queue.flush(false);
		// `b` ran inside `a`, and exactly once.
		assert_eq!(*log.lock(), ["a", "b", "a-done"]);
	}

	#[test]
	fn nonrecursive_flush_during_a_drain_is_inert() {
		let _serial = SERIAL.lock();
		let log: Log = Log::default();
		let queue = Queue::new(Clock::Manual, -1);
		queue.enqueue(probe_with("a", &log, {
			let queue = Arc::clone(&queue);
			let log = Log::clone(&log);
			move |_| {
				queue.flush(false);
				log.lock().push("a-done");
			}
		}));
		queue.enqueue(probe("b", &log));
		queue.flush(false);
		assert_eq!(*log.lock(), ["a", "a-done", "b"]);
	}

	#[test]
	fn dequeue_mid_drain_adjusts_the_cursor() {
		let _serial = SERIAL.lock();
		let log: Log = Log::default();
		let queue = Queue::new(Clock::Manual, -1);
		let b = probe("b", &log);
		queue.enqueue(probe_with("a", &log, {
			let queue = Arc::clone(&queue);
			let token = b.token;
			move |_| {
				assert!(queue.dequeue(token));
			}
		}));
		queue.enqueue(b);
		queue.enqueue(probe("c", &log));
		queue.flush(false);
		assert_eq!(*log.lock(), ["a", "c"]);
	}

	#[test]
	fn overflow_drains_inline() {
		let _serial = SERIAL.lock();
		let log: Log = Log::default();
		let queue = Queue::new(Clock::Manual, -1);
		queue.set_max_inline(2);
		queue.enqueue(probe("a", &log));
		queue.enqueue(probe("b", &log));
		assert_eq!(*log.lock(), Vec::<&str>::new());
		queue.enqueue(probe("c", &log));
		assert_eq!(*log.lock(), ["a", "b", "c"]);
	}

	#[test]
	fn buffered_drain_loops_until_settled() {
		let _serial = SERIAL.lock();
		let log: Log = Log::default();
		// A far-off timeout: the driver never beats the explicit flush.
		let queue = Queue::new(Clock::Timeout, 60_000);
		let late = probe("late", &log);
		queue.enqueue(probe_with("early", &log, {
			let queue = Arc::clone(&queue);
			let late = Arc::clone(&late);
			move |_| queue.enqueue(Arc::clone(&late) as Arc<dyn Dispatch>)
		}));
		queue.enqueue(probe("middle", &log));
		queue.flush(false);
		assert_eq!(*log.lock(), ["early", "middle", "late"]);
		assert!(queue.is_empty());
	}

	#[test]
	fn overflow_flush_during_deadline_drain() {
		let _serial = SERIAL.lock();
		let log: Log = Log::default();
		let queue = Queue::new(Clock::Idle, 60_000);
		queue.set_max_inline(1);
		let b = probe("b", &log);
		let c = probe("c", &log);
		queue.enqueue(probe_with("a", &log, {
			let queue = Arc::clone(&queue);
			move |_| {
				// The second enqueue overflows and resumes the deadline
				// drain inline.
				queue.enqueue(Arc::clone(&b) as Arc<dyn Dispatch>);
				queue.enqueue(Arc::clone(&c) as Arc<dyn Dispatch>);
			}
		}));
		queue.fire();
		assert_eq!(*log.lock(), ["a", "b", "c"]);
		assert!(queue.is_empty());
	}

	#[test]
	fn exhausted_deadline_hands_the_tail_back() {
		let _serial = SERIAL.lock();
		let log: Log = Log::default();
		let queue = Queue::new(Clock::Idle, 60_000);
		let slow = |name| {
			probe_with(name, &log, |_| sleep(Duration::from_millis(20)))
		};
		queue.enqueue(slow("a"));
		queue.enqueue(slow("b"));
		queue.fire();
		// The slice is shorter than one dispatch, so only the first entry
		// ran; the tail went back to pending and was re-scheduled.
		assert_eq!(*log.lock(), ["a"]);
		assert_eq!(queue.len(), 1);
		queue.flush(false);
		assert_eq!(*log.lock(), ["a", "b"]);
	}
}
