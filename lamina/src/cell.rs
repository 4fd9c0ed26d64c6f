//! Reactive cells and the notification protocol.

use std::{
	any::Any,
	cell::RefCell,
	fmt::{self, Debug, Formatter},
	sync::{Arc, Weak},
};

use parking_lot::RwLock;
use petiole::{critical, stamp};
use scopeguard::ScopeGuard;

use crate::{
	error::{SubscribeError, UnsubscribeError},
	options::{Notify, SubscribeOptions},
	subscriber::{RawLink, Subscriber},
};

/// Object-safe view of a cell, held by tracking subscribers.
pub(crate) trait ErasedCell: Send + Sync {
	/// A clone of the current value, boxed for transport.
	fn value_erased(&self) -> Arc<dyn Any + Send + Sync>;

	/// Re-types the handle for downcasting.
	fn as_arc_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// The in-flight window of a synchronous notification walk.
#[derive(Debug, Clone, Copy)]
struct Window {
	cursor: usize,
	stop: usize,
}

struct Links {
	/// Invoked inline, on the notifying call stack.
	sync: Vec<Arc<RawLink>>,
	/// Enqueued onto their target queues instead.
	deferred: Vec<Arc<RawLink>>,
	/// The notification counter at the last deferred enqueue; if it has
	/// not advanced since, re-queueing is skipped wholesale.
	stamp: u64,
	/// Present while a synchronous walk is in flight. A recursive notify
	/// of the same cell collapses into it.
	window: Option<Window>,
}

pub(crate) struct RawCell<T> {
	value: RwLock<T>,
	links: RefCell<Links>,
}

// Link lists are only touched inside the critical section.
unsafe impl<T: Send + Sync> Sync for RawCell<T> {}

impl<T: Clone + Send + Sync + 'static> ErasedCell for RawCell<T> {
	fn value_erased(&self) -> Arc<dyn Any + Send + Sync> {
		Arc::new(self.value.read().clone())
	}

	fn as_arc_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
		self
	}
}

impl<T: Clone + Send + Sync + 'static> RawCell<T> {
	/// Dispatches one change of this cell.
	fn notify(&self) {
		self.refresh_caches();

		// Deferred phase first: every queued subscriber is enqueued
		// exactly once, no matter how the synchronous phase below
		// unfolds or recurses.
		let deferred = {
			let mut links = self.links.borrow_mut();
			if links.deferred.is_empty() || links.stamp == stamp::current() {
				Vec::new()
			} else {
				links.stamp = stamp::current();
				links.deferred.clone()
			}
		};
		for link in deferred {
			if !link.is_detached() {
				link.subscriber().enqueue(&link);
			}
		}

		let n = self.links.borrow().sync.len();
		if n == 0 {
			return;
		}
		stamp::advance();
		if n > 1 {
			// Pre-mark everything after index 0; the walk below is gated
			// on dirtiness so a recursive dispatch that already ran a
			// subscriber silently takes it off this change.
			let mut links = self.links.borrow_mut();
			for link in &links.sync[1..] {
				link.mark_dirty();
			}
			links.window = Some(Window { cursor: 1, stop: n });
		}
		// An unwinding callback abandons the walk; no window survives it.
		let guard = scopeguard::guard_on_unwind((), |()| {
			self.links.borrow_mut().window = None;
		});
		let first = self.links.borrow().sync.first().cloned();
		if let Some(first) = first {
			first.invoke();
		}
		if n > 1 {
			loop {
				let next = {
					let mut links = self.links.borrow_mut();
					let Links { sync, window, .. } = &mut *links;
					match window {
						Some(window) if window.cursor < window.stop => {
							let link = Arc::clone(&sync[window.cursor]);
							window.cursor += 1;
							Some(link)
						}
						// Spent, or collapsed by a recursive notify that
						// walked to its own end already.
						_ => None,
					}
				};
				match next {
					Some(link) => {
						if link.is_dirty() {
							link.invoke();
						}
					}
					None => break,
				}
			}
			self.links.borrow_mut().window = None;
		}
		let _ = ScopeGuard::into_inner(guard);
	}

	/// Hands the current value to every tracking link of this cell.
	fn refresh_caches(&self) {
		let tracked: Vec<Arc<RawLink>> = {
			let links = self.links.borrow();
			links
				.sync
				.iter()
				.chain(&links.deferred)
				.filter(|link| link.has_cache())
				.map(Arc::clone)
				.collect()
		};
		if tracked.is_empty() {
			return;
		}
		let value: Arc<dyn Any + Send + Sync> = Arc::new(self.value.read().clone());
		for link in tracked {
			link.store_cache(Arc::clone(&value));
		}
	}

	fn remove_link_of(&self, subscriber: &Subscriber) -> Result<Arc<RawLink>, UnsubscribeError> {
		let mut links = self.links.borrow_mut();
		let Links { sync, deferred, window, .. } = &mut *links;
		if let Some(at) = sync
			.iter()
			.position(|link| link.subscriber().same(subscriber))
		{
			let link = sync.remove(at);
			// Keep an in-flight walk aligned with the shifted indices.
			if let Some(window) = window {
				if window.cursor > at {
					window.cursor -= 1;
				}
				if at < window.stop {
					window.stop -= 1;
				}
			}
			Ok(link)
		} else if let Some(at) = deferred
			.iter()
			.position(|link| link.subscriber().same(subscriber))
		{
			Ok(deferred.remove(at))
		} else {
			Err(UnsubscribeError::NotSubscribed)
		}
	}
}

/// A reactive value holder.
///
/// Handles are cheap to clone and all address the same cell. Reads are
/// lock-based and never notify; every write path funnels through
/// [`notify`](`ReactiveCell::notify`) unless explicitly coalesced with
/// [`assume`](`ReactiveCell::assume`).
pub struct ReactiveCell<T>(Arc<RawCell<T>>);

impl<T> Clone for ReactiveCell<T> {
	fn clone(&self) -> Self {
		Self(Arc::clone(&self.0))
	}
}

impl<T: Clone + Send + Sync + 'static> ReactiveCell<T> {
	/// Creates a cell holding `value`.
	#[must_use]
	pub fn new(value: T) -> Self {
		Self(Arc::new(RawCell {
			value: RwLock::new(value),
			links: RefCell::new(Links {
				sync: Vec::new(),
				deferred: Vec::new(),
				stamp: stamp::current().wrapping_sub(1),
				window: None,
			}),
		}))
	}

	pub(crate) fn from_raw(raw: Arc<RawCell<T>>) -> Self {
		Self(raw)
	}

	/// A clone of the current value. Never notifies.
	#[must_use]
	pub fn get(&self) -> T {
		self.0.value.read().clone()
	}

	/// Reads the current value in place. Never notifies.
	///
	/// The value stays read-locked while `read` runs; storing into this
	/// same cell from inside it deadlocks.
	pub fn with<R>(&self, read: impl FnOnce(&T) -> R) -> R {
		read(&self.0.value.read())
	}

	/// Stores `value` and notifies.
	pub fn set(&self, value: T) {
		critical(|| {
			*self.0.value.write() = value;
			self.0.notify();
		});
	}

	/// Stores `value` *without* notifying, for coalescing externally
	/// batched updates. Follow up with [`notify`](`ReactiveCell::notify`)
	/// once the batch is complete.
	pub fn assume(&self, value: T) {
		critical(|| *self.0.value.write() = value);
	}

	/// Updates the value in place and notifies.
	pub fn update(&self, update: impl FnOnce(&mut T)) {
		critical(|| {
			update(&mut *self.0.value.write());
			self.0.notify();
		});
	}

	/// Dispatches a change of this cell: deferred subscribers are
	/// enqueued onto their queues, synchronous subscribers run inline,
	/// each at most once for this change.
	///
	/// Callbacks may re-enter freely, including notifying this same cell
	/// again; a recursive notify collapses into the walk already in
	/// flight instead of double-dispatching it.
	///
	/// # Panics
	///
	/// Callback panics are not suppressed. Bookkeeping is consistent
	/// before each callback runs, so an unwinding callback cancels the
	/// rest of the walk but corrupts nothing.
	pub fn notify(&self) {
		critical(|| self.0.notify());
	}

	/// Registers `subscriber` and returns the new subscriber count.
	///
	/// # Errors
	///
	/// [`SubscribeError::AlreadySubscribed`] when the subscriber already
	/// holds a link on this cell.
	pub fn subscribe(
		&self,
		subscriber: &Subscriber,
		options: SubscribeOptions,
	) -> Result<usize, SubscribeError> {
		critical(|| {
			{
				let links = self.0.links.borrow();
				if links
					.sync
					.iter()
					.chain(&links.deferred)
					.any(|link| link.subscriber().same(subscriber))
				{
					return Err(SubscribeError::AlreadySubscribed);
				}
			}
			let queue = options.queue.resolve();
			let link = Arc::new(RawLink::new(
				subscriber.clone(),
				queue.clone(),
				subscriber.is_tracking(),
			));
			if subscriber.is_tracking() {
				// Prime the cache so a dependency that never changes
				// still has a value to show.
				link.store_cache(Arc::new(self.get()));
				subscriber.record_dep(erased_weak(&self.0), &link);
			}
			let count = {
				let mut links = self.0.links.borrow_mut();
				// During a notification walk this lands beyond the
				// window's stop: clean, and silent for the in-flight
				// change.
				if queue.is_some() {
					links.deferred.push(Arc::clone(&link));
				} else {
					links.sync.push(Arc::clone(&link));
				}
				links.sync.len() + links.deferred.len()
			};
			match options.notify {
				Notify::None => {}
				Notify::Queued => {
					if link.queue().is_some() {
						subscriber.enqueue(&link);
					} else {
						link.invoke();
					}
				}
				Notify::Sync => link.invoke(),
			}
			Ok(count)
		})
	}

	/// Like [`subscribe`](`ReactiveCell::subscribe`), but returns a bound
	/// unsubscribe thunk instead of the count.
	///
	/// # Errors
	///
	/// [`SubscribeError::AlreadySubscribed`] when the subscriber already
	/// holds a link on this cell.
	pub fn subscribe_detach(
		&self,
		subscriber: &Subscriber,
		options: SubscribeOptions,
	) -> Result<Detach, SubscribeError> {
		self.subscribe(subscriber, options)?;
		let cell = self.clone();
		let subscriber = subscriber.clone();
		Ok(Detach(Box::new(move || cell.unsubscribe(&subscriber))))
	}

	/// Removes `subscriber`'s link and cancels any notification still
	/// pending for it on this cell's behalf.
	///
	/// # Errors
	///
	/// [`UnsubscribeError::NotSubscribed`] when no link exists.
	pub fn unsubscribe(&self, subscriber: &Subscriber) -> Result<(), UnsubscribeError> {
		critical(|| {
			let removed = self.0.remove_link_of(subscriber)?;
			removed.subscriber().release(&removed);
			Ok(())
		})
	}

	/// Removes every subscriber. A cell without subscribers is left as
	/// is.
	pub fn unsubscribe_all(&self) {
		critical(|| {
			let removed: Vec<Arc<RawLink>> = {
				let mut links = self.0.links.borrow_mut();
				// Collapse an in-flight walk; nothing is left to visit.
				if let Some(window) = &mut links.window {
					window.stop = window.cursor;
				}
				let mut removed: Vec<_> = links.sync.drain(..).collect();
				removed.extend(links.deferred.drain(..));
				removed
			};
			for link in removed {
				link.subscriber().release(&link);
			}
		});
	}

	/// How many subscribers this cell currently has.
	#[must_use]
	pub fn subscriber_count(&self) -> usize {
		critical(|| {
			let links = self.0.links.borrow();
			links.sync.len() + links.deferred.len()
		})
	}
}

fn erased_weak<T: Clone + Send + Sync + 'static>(raw: &Arc<RawCell<T>>) -> Weak<dyn ErasedCell> {
	Arc::downgrade(&(Arc::clone(raw) as Arc<dyn ErasedCell>))
}

impl<T: Debug> Debug for ReactiveCell<T> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_tuple("ReactiveCell")
			.field(&&*self.0.value.read())
			.finish()
	}
}

/// A bound unsubscribe thunk, as handed out by
/// [`ReactiveCell::subscribe_detach`].
pub struct Detach(Box<dyn FnOnce() -> Result<(), UnsubscribeError> + Send>);

impl Detach {
	/// Severs the subscription this thunk is bound to.
	///
	/// # Errors
	///
	/// [`UnsubscribeError::NotSubscribed`] when the subscription was
	/// already severed another way.
	pub fn detach(self) -> Result<(), UnsubscribeError> {
		(self.0)()
	}
}

impl Debug for Detach {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("Detach").finish_non_exhaustive()
	}
}
