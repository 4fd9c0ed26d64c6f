use std::sync::{
	atomic::{AtomicUsize, Ordering},
	Arc,
};

use lamina::{ReactiveCell, SubscribeOptions, Subscriber, TrackingMode};

mod _validator;
use _validator::Validator;

/// Counts how often the wrapped value is read out of its cell.
#[derive(Debug)]
struct Counted {
	reads: Arc<AtomicUsize>,
	value: i64,
}

impl Clone for Counted {
	fn clone(&self) -> Self {
		self.reads.fetch_add(1, Ordering::SeqCst);
		Self {
			reads: Arc::clone(&self.reads),
			value: self.value,
		}
	}
}

#[test]
fn cached_tracking_reads_an_unchanged_dependency_only_to_prime() {
	let reads = Arc::new(AtomicUsize::new(0));
	let first = ReactiveCell::new(0_i64);
	let expensive = ReactiveCell::new(Counted {
		reads: Arc::clone(&reads),
		value: 40,
	});
	let last = ReactiveCell::new(0_i64);

	let seen = Arc::new(Validator::new());
	let watcher = Subscriber::tracking(TrackingMode::Cached, {
		let seen = Arc::clone(&seen);
		move |deps| {
			assert_eq!(deps.len(), 3);
			// The middle dependency is deliberately left untouched here;
			// copying it out would be indistinguishable from a read.
			seen.push((
				deps[0].value::<i64>().unwrap(),
				deps[2].value::<i64>().unwrap(),
			));
		}
	});
	first
		.subscribe(&watcher, SubscribeOptions::sync())
		.unwrap();
	expensive
		.subscribe(&watcher, SubscribeOptions::sync())
		.unwrap();
	last.subscribe(&watcher, SubscribeOptions::sync()).unwrap();

	// Priming read the expensive value exactly once.
	assert_eq!(reads.load(Ordering::SeqCst), 1);

	first.set(1);
	last.set(2);
	first.set(3);

	// Only the mutated dependencies were refreshed; the middle one was
	// never read again.
	seen.expect([(1, 0), (1, 2), (3, 2)]);
	assert_eq!(reads.load(Ordering::SeqCst), 1);
}

#[test]
fn value_tracking_re_reads_every_dependency_per_call() {
	let reads = Arc::new(AtomicUsize::new(0));
	let driver_cell = ReactiveCell::new(0_i64);
	let expensive = ReactiveCell::new(Counted {
		reads: Arc::clone(&reads),
		value: 7,
	});

	let calls = Arc::new(AtomicUsize::new(0));
	let watcher = Subscriber::tracking(TrackingMode::Values, {
		let calls = Arc::clone(&calls);
		move |deps| {
			calls.fetch_add(1, Ordering::SeqCst);
			assert_eq!(deps[1].value::<Counted>().unwrap().value, 7);
		}
	});
	driver_cell
		.subscribe(&watcher, SubscribeOptions::sync())
		.unwrap();
	expensive
		.subscribe(&watcher, SubscribeOptions::sync())
		.unwrap();

	let baseline = reads.load(Ordering::SeqCst);
	driver_cell.set(1);
	driver_cell.set(2);
	assert_eq!(calls.load(Ordering::SeqCst), 2);
	// Each invocation fetched the expensive value afresh.
	assert!(reads.load(Ordering::SeqCst) > baseline);
}

#[test]
fn dep_tracking_hands_out_the_cells_themselves() {
	let origin = ReactiveCell::new(11_i64);
	let calls = Arc::new(AtomicUsize::new(0));
	let watcher = Subscriber::tracking(TrackingMode::Deps, {
		let calls = Arc::clone(&calls);
		move |deps| {
			calls.fetch_add(1, Ordering::SeqCst);
			let cell = deps[0].cell::<i64>().expect("dependency is alive");
			assert_eq!(cell.get(), 12);
			assert_eq!(deps[0].value::<i64>(), None);
		}
	});
	origin
		.subscribe(&watcher, SubscribeOptions::sync())
		.unwrap();

	origin.set(12);
	assert_eq!(calls.load(Ordering::SeqCst), 1);
}
