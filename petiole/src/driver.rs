//! The deferred-firing driver.
//!
//! A library crate has no host event loop, so clock sources that fire
//! "later" are driven by one background thread holding a deadline map.
//! Entries that fall due together run in priority order, which the queue
//! layer reinforces with its own chase-and-drain pass.

use std::{
	collections::BTreeMap,
	panic::{catch_unwind, AssertUnwindSafe},
	sync::atomic::{AtomicU64, Ordering},
	thread,
	time::{Duration, Instant},
};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

use crate::clock::Priority;

/// Cancellation handle for one scheduling. Doubles as the map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Token {
	due: Instant,
	seq: u64,
}

struct Entry {
	priority: Priority,
	thunk: Box<dyn FnOnce() + Send>,
}

struct Driver {
	entries: Mutex<BTreeMap<Token, Entry>>,
	wake: Condvar,
	seq: AtomicU64,
}

static DRIVER: Lazy<&'static Driver> = Lazy::new(|| {
	let driver: &'static Driver = Box::leak(Box::new(Driver {
		entries: Mutex::new(BTreeMap::new()),
		wake: Condvar::new(),
		seq: AtomicU64::new(0),
	}));
	thread::Builder::new()
		.name("petiole-driver".to_owned())
		.spawn(|| driver.run())
		.expect("failed to spawn the petiole driver thread");
	driver
});

/// Schedules `thunk` to run on the driver thread after `delay`.
pub(crate) fn schedule(
	delay: Duration,
	priority: Priority,
	thunk: Box<dyn FnOnce() + Send>,
) -> Token {
	let driver = *DRIVER;
	let token = Token {
		due: Instant::now() + delay,
		seq: driver.seq.fetch_add(1, Ordering::Relaxed),
	};
	trace!(?delay, seq = token.seq, "driver scheduling");
	driver.entries.lock().insert(token, Entry { priority, thunk });
	driver.wake.notify_one();
	token
}

/// Revokes a scheduling. Returns whether it was still outstanding.
pub(crate) fn cancel(token: Token) -> bool {
	let driver = *DRIVER;
	let cancelled = driver.entries.lock().remove(&token).is_some();
	if cancelled {
		driver.wake.notify_one();
	}
	cancelled
}

impl Driver {
	fn run(&self) {
		let mut entries = self.entries.lock();
		loop {
			let now = Instant::now();
			let mut due = Vec::new();
			loop {
				let next = entries.first_key_value().map(|(&token, _)| token);
				let Some(token) = next else {
					break;
				};
				if token.due > now {
					break;
				}
				let entry = entries.remove(&token).expect("just observed");
				due.push((token, entry));
			}

			if due.is_empty() {
				let next_due = entries.keys().next().map(|token| token.due);
				match next_due {
					Some(at) => {
						let _ = self.wake.wait_until(&mut entries, at);
					}
					None => self.wake.wait(&mut entries),
				}
				continue;
			}

			// Simultaneously due entries fire lowest rank first.
			due.sort_by_key(|&(token, ref entry)| (entry.priority, token));
			drop(entries);
			for (token, entry) in due {
				trace!(seq = token.seq, "driver firing");
				// A panic here has no caller to propagate to; swallowing
				// it beats killing the driver thread.
				if let Err(payload) = catch_unwind(AssertUnwindSafe(entry.thunk)) {
					let message = payload
						.downcast_ref::<&str>()
						.map(ToString::to_string)
						.or_else(|| payload.downcast_ref::<String>().cloned());
					error!(seq = token.seq, panic = ?message, "scheduled drain panicked");
				}
			}
			entries = self.entries.lock();
		}
	}
}
