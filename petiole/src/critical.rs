use once_cell::sync::Lazy;
use parking_lot::ReentrantMutex;

static CRITICAL: Lazy<ReentrantMutex<()>> = Lazy::new(|| ReentrantMutex::new(()));

/// Runs `f` inside the engine's process-wide reentrant critical section.
///
/// # Logic
///
/// Queue buffers, link lists and subscriber bookkeeping **must** only be
/// touched while this section is held. Re-entry from the same thread is
/// permitted, so callbacks dispatched by the engine can call back into any
/// engine operation. Other threads block until the section is released.
pub fn critical<T>(f: impl FnOnce() -> T) -> T {
	let _guard = CRITICAL.lock();
	f()
}
