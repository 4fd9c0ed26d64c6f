//! Subscribers and the links binding them to cells.
//!
//! A link is the edge between one cell and one subscriber. Its dirty flag
//! is a wrapping counter stamp: the link is dirty iff the stamp equals the
//! subscriber's call counter, so bumping that counter cleans every link of
//! the subscriber at once, without walking anything.

use core::mem;
use std::{
	any::Any,
	cell::{Cell, RefCell},
	fmt::{self, Debug, Formatter},
	sync::{Arc, Weak},
};

use petiole::{
	critical,
	queue::{Dispatch, DispatchToken, Queue, QueueId},
};

use crate::cell::{ErasedCell, RawCell, ReactiveCell};

/// What a tracking subscriber's callback receives per dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingMode {
	/// The dependency cells themselves.
	Deps,
	/// The dependencies' values, read when the callback fires.
	Values,
	/// The dependencies' values as last seen by their own notifications.
	/// A dependency that did not change is never re-read; its value stays
	/// the one cached when it last notified (or when the subscription
	/// primed it).
	Cached,
}

/// One dependency handed to a tracking subscriber's callback, in
/// subscription order.
pub struct Tracked {
	cell: Option<Arc<dyn ErasedCell>>,
	value: Option<Arc<dyn Any + Send + Sync>>,
}

impl Tracked {
	/// The dependency's value, per the subscriber's [`TrackingMode`].
	///
	/// [`None`] under [`TrackingMode::Deps`], when `T` is not the
	/// dependency's value type, or when the dependency cell was dropped.
	#[must_use]
	pub fn value<T: Clone + 'static>(&self) -> Option<T> {
		self.value.as_ref()?.downcast_ref::<T>().cloned()
	}

	/// The dependency cell itself, while it is alive and holds `T`.
	#[must_use]
	pub fn cell<T: Clone + Send + Sync + 'static>(&self) -> Option<ReactiveCell<T>> {
		let cell = Arc::clone(self.cell.as_ref()?);
		cell.as_arc_any()
			.downcast::<RawCell<T>>()
			.ok()
			.map(ReactiveCell::from_raw)
	}
}

impl Debug for Tracked {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_struct("Tracked")
			.field("alive", &self.cell.is_some())
			.field("carries_value", &self.value.is_some())
			.finish()
	}
}

enum Callback {
	Plain(Box<dyn Fn() + Send + Sync>),
	Tracking(TrackingMode, Box<dyn Fn(&[Tracked]) + Send + Sync>),
}

/// A callable plus its per-queue dispatch bookkeeping.
///
/// Cloning is shallow: clones share identity, bookkeeping and callback.
#[derive(Clone)]
pub struct Subscriber(pub(crate) Arc<RawSubscriber>);

impl Subscriber {
	/// Wraps a plain callback.
	#[must_use]
	pub fn new(callback: impl 'static + Fn() + Send + Sync) -> Self {
		Self::from_callback(Callback::Plain(Box::new(callback)))
	}

	/// Wraps a callback that receives its dependencies (in subscription
	/// order) according to `mode`.
	#[must_use]
	pub fn tracking(
		mode: TrackingMode,
		callback: impl 'static + Fn(&[Tracked]) + Send + Sync,
	) -> Self {
		Self::from_callback(Callback::Tracking(mode, Box::new(callback)))
	}

	fn from_callback(callback: Callback) -> Self {
		Self(Arc::new(RawSubscriber {
			token: DispatchToken::next(),
			call_count: Cell::new(1),
			queued: RefCell::new(Vec::new()),
			deps: RefCell::new(Vec::new()),
			callback,
		}))
	}

	/// Whether both handles dispatch to the same underlying subscriber.
	#[must_use]
	pub fn same(&self, other: &Subscriber) -> bool {
		Arc::ptr_eq(&self.0, &other.0)
	}

	pub(crate) fn raw(&self) -> &RawSubscriber {
		&self.0
	}

	pub(crate) fn is_tracking(&self) -> bool {
		matches!(self.0.callback, Callback::Tracking(..))
	}

	/// Marks `link` dirty and makes sure its target queue will call this
	/// subscriber. Dirty links were already accounted for.
	pub(crate) fn enqueue(&self, link: &Arc<RawLink>) {
		critical(|| {
			if link.is_dirty() {
				return;
			}
			link.mark_dirty();
			let queue = Arc::clone(
				link.queue()
					.expect("only asynchronous links can be enqueued"),
			);
			let fresh = {
				let mut queued = self.0.queued.borrow_mut();
				match queued.iter_mut().find(|entry| entry.queue_id == queue.id()) {
					Some(entry) => {
						entry.count += 1;
						false
					}
					None => {
						queued.push(QueuedEntry {
							queue_id: queue.id(),
							count: 1,
							queue: Arc::clone(&queue),
						});
						true
					}
				}
			};
			if fresh {
				queue.enqueue(Arc::clone(&self.0) as Arc<dyn Dispatch>);
			}
		});
	}

	/// Undoes `link`'s contribution to the bookkeeping and detaches it.
	/// Called when the owning cell removes the link.
	pub(crate) fn release(&self, link: &Arc<RawLink>) {
		critical(|| {
			link.detach();
			if link.is_dirty() {
				link.mark_clean();
				if let Some(queue) = link.queue() {
					let withdrawn = {
						let mut queued = self.0.queued.borrow_mut();
						match queued
							.iter()
							.position(|entry| entry.queue_id == queue.id())
						{
							Some(at) => {
								queued[at].count -= 1;
								if queued[at].count == 0 {
									Some(queued.remove(at))
								} else {
									None
								}
							}
							None => None,
						}
					};
					if let Some(entry) = withdrawn {
						entry.queue.dequeue(self.0.token);
					}
				}
			}
			let gone = Arc::downgrade(link);
			self.0
				.deps
				.borrow_mut()
				.retain(|record| !Weak::ptr_eq(&record.link, &gone));
		});
	}

	pub(crate) fn record_dep(&self, cell: Weak<dyn ErasedCell>, link: &Arc<RawLink>) {
		self.0.deps.borrow_mut().push(DepRecord {
			cell,
			link: Arc::downgrade(link),
		});
	}
}

impl Debug for Subscriber {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		critical(|| {
			f.debug_struct("Subscriber")
				.field("token", &self.0.token)
				.field("queued", &self.0.queued.borrow().len())
				.finish_non_exhaustive()
		})
	}
}

struct QueuedEntry {
	queue_id: QueueId,
	count: usize,
	queue: Arc<Queue>,
}

#[derive(Clone)]
struct DepRecord {
	cell: Weak<dyn ErasedCell>,
	link: Weak<RawLink>,
}

pub(crate) struct RawSubscriber {
	token: DispatchToken,
	/// Wrapping; equality against link stamps is all that matters.
	call_count: Cell<u64>,
	/// One entry per queue currently holding this subscriber, with the
	/// number of dirty links that share it. Usually one or two entries,
	/// hence a vector rather than a map.
	queued: RefCell<Vec<QueuedEntry>>,
	/// Tracking dependencies, in subscription order.
	deps: RefCell<Vec<DepRecord>>,
	callback: Callback,
}

// Bookkeeping is only touched inside the critical section.
unsafe impl Send for RawSubscriber {}
unsafe impl Sync for RawSubscriber {}

impl RawSubscriber {
	/// Dispatches this subscriber.
	///
	/// Housekeeping comes first, contractually: the matching queue entry
	/// is dropped, the subscriber withdraws itself from every other queue
	/// (one invocation covers all pending changes), and the call counter
	/// bump cleans every link. Only then does the callback run, so an
	/// unwinding callback cannot leave the bookkeeping half-done.
	pub(crate) fn call(&self, queue: Option<QueueId>) {
		critical(|| {
			let stale = {
				let mut queued = self.queued.borrow_mut();
				if let Some(id) = queue {
					if let Some(at) = queued.iter().position(|entry| entry.queue_id == id) {
						queued.remove(at);
					}
				}
				mem::take(&mut *queued)
			};
			for entry in stale {
				entry.queue.dequeue(self.token);
			}
			self.call_count.set(self.call_count.get().wrapping_add(1));
			match &self.callback {
				Callback::Plain(callback) => callback(),
				Callback::Tracking(mode, callback) => {
					let tracked = self.collect_tracked(*mode);
					callback(&tracked);
				}
			}
		});
	}

	fn collect_tracked(&self, mode: TrackingMode) -> Vec<Tracked> {
		let records = self.deps.borrow().clone();
		records
			.iter()
			.map(|record| {
				let cell = record.cell.upgrade();
				let value = match mode {
					TrackingMode::Deps => None,
					TrackingMode::Values => cell.as_ref().map(|cell| cell.value_erased()),
					TrackingMode::Cached => {
						record.link.upgrade().and_then(|link| link.cached_value())
					}
				};
				Tracked { cell, value }
			})
			.collect()
	}
}

impl Dispatch for RawSubscriber {
	fn dispatch(&self, queue: QueueId) {
		self.call(Some(queue));
	}

	fn token(&self) -> DispatchToken {
		self.token
	}
}

/// The edge between one cell and one subscriber.
pub(crate) struct RawLink {
	subscriber: Subscriber,
	/// Dirty iff equal to the subscriber's call counter.
	stamp: Cell<u64>,
	detached: Cell<bool>,
	/// The target queue; [`None`] for synchronous links.
	queue: Option<Arc<Queue>>,
	/// The last value this link's cell handed it; tracking links only.
	cached: Option<RefCell<Option<Arc<dyn Any + Send + Sync>>>>,
}

// Link state is only touched inside the critical section.
unsafe impl Send for RawLink {}
unsafe impl Sync for RawLink {}

impl RawLink {
	pub(crate) fn new(subscriber: Subscriber, queue: Option<Arc<Queue>>, tracking: bool) -> Self {
		let stamp = subscriber.raw().call_count.get().wrapping_sub(1);
		Self {
			subscriber,
			stamp: Cell::new(stamp),
			detached: Cell::new(false),
			queue,
			cached: tracking.then(|| RefCell::new(None)),
		}
	}

	pub(crate) fn subscriber(&self) -> &Subscriber {
		&self.subscriber
	}

	pub(crate) fn queue(&self) -> Option<&Arc<Queue>> {
		self.queue.as_ref()
	}

	pub(crate) fn is_dirty(&self) -> bool {
		self.stamp.get() == self.subscriber.raw().call_count.get()
	}

	pub(crate) fn mark_dirty(&self) {
		self.stamp.set(self.subscriber.raw().call_count.get());
	}

	pub(crate) fn mark_clean(&self) {
		self.stamp
			.set(self.subscriber.raw().call_count.get().wrapping_sub(1));
	}

	pub(crate) fn is_detached(&self) -> bool {
		self.detached.get()
	}

	fn detach(&self) {
		self.detached.set(true);
	}

	pub(crate) fn has_cache(&self) -> bool {
		self.cached.is_some()
	}

	pub(crate) fn store_cache(&self, value: Arc<dyn Any + Send + Sync>) {
		if let Some(cached) = &self.cached {
			*cached.borrow_mut() = Some(value);
		}
	}

	fn cached_value(&self) -> Option<Arc<dyn Any + Send + Sync>> {
		self.cached.as_ref().and_then(|cached| cached.borrow().clone())
	}

	/// Dispatches the subscriber synchronously.
	pub(crate) fn invoke(&self) {
		self.subscriber.raw().call(None);
	}
}
