use std::sync::{
	atomic::{AtomicUsize, Ordering},
	Arc,
};

use lamina::{batch, registry, Clock, ReactiveCell, SubscribeOptions, Subscriber};

#[test]
fn dispatch_stays_exact_across_the_counter_wrap() {
	// Park the notification counter just short of the wrap, so the
	// rounds below drive it across.
	petiole::stamp::warp(u64::MAX - 3);

	let value = ReactiveCell::new(0_i64);
	let sync_calls = Arc::new(AtomicUsize::new(0));
	let queued_calls = Arc::new(AtomicUsize::new(0));
	let inline = Subscriber::new({
		let sync_calls = Arc::clone(&sync_calls);
		move || {
			sync_calls.fetch_add(1, Ordering::SeqCst);
		}
	});
	let queued = Subscriber::new({
		let queued_calls = Arc::clone(&queued_calls);
		move || {
			queued_calls.fetch_add(1, Ordering::SeqCst);
		}
	});
	let queue = registry::acquire(Clock::Manual, 91);
	value.subscribe(&inline, SubscribeOptions::sync()).unwrap();
	value
		.subscribe(&queued, SubscribeOptions::on_queue(Arc::clone(&queue)))
		.unwrap();

	for round in 1..=8_i64 {
		batch(|| value.set(round));
		queue.flush(false);
		// Never a missed change, never a double dispatch, on either
		// side of the wrap.
		assert_eq!(sync_calls.load(Ordering::SeqCst) as i64, round);
		assert_eq!(queued_calls.load(Ordering::SeqCst) as i64, round);
	}
}
