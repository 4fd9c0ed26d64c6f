use std::{
	fmt::Debug,
	sync::{Mutex, MutexGuard, PoisonError},
	thread,
	time::{Duration, Instant},
};

/// Collects events as they happen and asserts on the accumulated order.
pub struct Validator<T>(Mutex<Vec<T>>);

impl<T> Validator<T> {
	pub const fn new() -> Self {
		Self(Mutex::new(Vec::new()))
	}

	pub fn push(&self, event: T) {
		self.0
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.push(event);
	}

	#[track_caller]
	pub fn expect(&self, expected: impl IntoIterator<Item = T>)
	where
		T: Debug + PartialEq,
	{
		let seen: Vec<T> = self
			.0
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.drain(..)
			.collect();
		let expected: Vec<T> = expected.into_iter().collect();
		assert_eq!(seen, expected);
	}
}

/// Polls until `done` holds or `within` elapses.
#[track_caller]
pub fn settle(within: Duration, done: impl Fn() -> bool) {
	let deadline = Instant::now() + within;
	while !done() {
		assert!(
			Instant::now() < deadline,
			"did not settle within {within:?}"
		);
		thread::sleep(Duration::from_millis(2));
	}
}

static SERIAL: Mutex<()> = Mutex::new(());

/// Tests in one binary share the live queue pool; they take turns.
pub fn serial() -> MutexGuard<'static, ()> {
	SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}
