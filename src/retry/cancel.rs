//! Cancellation shared between the attempt loop and the signal thread.
//!
//! A termination signal received by the wrapper is forwarded to the in-flight
//! child and stops the loop: no further attempt is started and a pending
//! backoff wait returns early.

use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};

const NO_CHILD: i32 = 0;

#[derive(Debug, Default)]
struct Inner {
	signal: Mutex<Option<i32>>,
	wake: Condvar,
	child: AtomicI32,
}

#[derive(Debug, Clone, Default)]
pub struct Cancellation {
	inner: Arc<Inner>,
}

impl Cancellation {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record `signal`, forward it to the current child and wake any waiter.
	pub fn cancel(&self, signal: i32) {
		{
			let mut slot = self
				.inner
				.signal
				.lock()
				.unwrap_or_else(PoisonError::into_inner);
			slot.get_or_insert(signal);
		}
		self.inner.wake.notify_all();
		self.forward(signal);
	}

	pub fn signal(&self) -> Option<i32> {
		*self
			.inner
			.signal
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
	}

	/// Sleep for `timeout` unless cancelled first. Returns `true` on cancellation.
	pub fn wait(&self, timeout: Duration) -> bool {
		let deadline = Instant::now() + timeout;
		let mut slot = self
			.inner
			.signal
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		while slot.is_none() {
			let now = Instant::now();
			if now >= deadline {
				return false;
			}
			slot = self
				.inner
				.wake
				.wait_timeout(slot, deadline - now)
				.unwrap_or_else(PoisonError::into_inner)
				.0;
		}
		true
	}

	/// Register the in-flight child so signals reach it.
	pub fn set_child(&self, pid: Option<u32>) {
		let pid = pid
			.and_then(|pid| i32::try_from(pid).ok())
			.unwrap_or(NO_CHILD);
		self.inner.child.store(pid, Ordering::SeqCst);
	}

	fn forward(&self, signal: i32) {
		let pid = self.inner.child.load(Ordering::SeqCst);
		if pid != NO_CHILD {
			// SAFETY: kill(2) has no memory-safety preconditions.
			unsafe {
				libc::kill(pid, signal);
			}
		}
	}
}

/// Background thread turning termination signals into [`Cancellation::cancel`].
///
/// Dropping the forwarder stops the thread.
#[derive(Debug)]
pub struct SignalForwarder {
	handle: Handle,
	thread: Option<JoinHandle<()>>,
}

impl SignalForwarder {
	pub const SIGNALS: [i32; 4] = [SIGINT, SIGTERM, SIGHUP, SIGQUIT];

	pub fn install(cancellation: Cancellation) -> io::Result<Self> {
		let mut signals = Signals::new(Self::SIGNALS)?;
		let handle = signals.handle();
		let thread = thread::Builder::new()
			.name("git-retry-signals".into())
			.spawn(move || {
				for signal in signals.forever() {
					cancellation.cancel(signal);
				}
			})?;
		Ok(Self {
			handle,
			thread: Some(thread),
		})
	}
}

impl Drop for SignalForwarder {
	fn drop(&mut self) {
		self.handle.close();
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}
