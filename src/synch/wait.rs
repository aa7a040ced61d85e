use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, MutexGuard};
use std::time::Duration;

use crate::errno::{Error, Result};

/// Parks user tasks until the protocol worker changes relevant state.
///
/// A `WaitContext` is a condition variable with a waiter count and a sticky
/// "interrupted" latch. `interrupt` wakes every parker and each of them
/// observes [`Error::Interrupted`] exactly once; the latch clears itself
/// when the last parker has consumed it.
///
/// The counters are only mutated while the caller holds the stack lock
/// whose guard is passed to [`WaitContext::sleep`].
pub struct WaitContext {
	cond: Condvar,
	waiters: AtomicUsize,
	interrupted: AtomicBool,
}

impl WaitContext {
	pub fn new() -> Self {
		Self {
			cond: Condvar::new(),
			waiters: AtomicUsize::new(0),
			interrupted: AtomicBool::new(false),
		}
	}

	/// Atomically releases the lock behind `guard` and parks the calling
	/// task until [`wakeup`](Self::wakeup), [`interrupt`](Self::interrupt)
	/// or the deadline. The lock is reacquired before returning.
	///
	/// Wakeups may be spurious; callers re-check their condition and park
	/// again, exactly like a plain condition variable.
	pub fn sleep<'a, T>(
		&self,
		guard: MutexGuard<'a, T>,
		deadline: Option<Duration>,
	) -> (MutexGuard<'a, T>, Result<()>) {
		if self.interrupted.load(Ordering::Relaxed) {
			return (guard, Err(Error::Interrupted));
		}
		self.waiters.fetch_add(1, Ordering::Relaxed);

		let (guard, timed_out) = match deadline {
			Some(timeout) => {
				let (guard, result) = self.cond.wait_timeout(guard, timeout).unwrap();
				(guard, result.timed_out())
			}
			None => (self.cond.wait(guard).unwrap(), false),
		};

		self.waiters.fetch_sub(1, Ordering::Relaxed);
		if self.interrupted.load(Ordering::Relaxed) {
			if self.waiters.load(Ordering::Relaxed) == 0 {
				self.interrupted.store(false, Ordering::Relaxed);
			}
			return (guard, Err(Error::Interrupted));
		}
		if timed_out {
			return (guard, Err(Error::TimedOut));
		}
		(guard, Ok(()))
	}

	/// Wakes all parked tasks.
	pub fn wakeup(&self) {
		self.cond.notify_all();
	}

	/// Sets the interrupted latch and wakes all parked tasks.
	pub fn interrupt(&self) {
		self.interrupted.store(true, Ordering::Relaxed);
		self.cond.notify_all();
	}

	/// Fails while parkers remain; release paths use this to detect that
	/// users are still present and defer reclamation.
	pub fn destroy(&self) -> Result<()> {
		if self.waiters.load(Ordering::Relaxed) > 0 {
			return Err(Error::InUse);
		}
		Ok(())
	}
}

impl Default for WaitContext {
	fn default() -> Self {
		Self::new()
	}
}
