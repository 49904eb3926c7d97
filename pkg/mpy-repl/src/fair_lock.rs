//! A ticket-based mutex that actually queues waiters in arrival order.
//!
//! `std::sync::Mutex` makes no fairness guarantee at all — its docs note
//! explicitly that an unlock can wake any blocked thread, not the one that
//! blocked first. [`AcquirePolicy::Fifo`](crate::session::AcquirePolicy::Fifo)
//! needs the opposite: callers that find the session busy must be served in
//! the order they asked, so one caller can't be starved by a faster one that
//! keeps re-acquiring the lock. This is the classic ticket-lock construction
//! (a counter per arrival, a `Condvar` wake gated on "is it my number yet").

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

struct FairLockState<T> {
	next_ticket: u64,
	now_serving: u64,
	value: T,
}

pub struct FairLock<T> {
	state: Mutex<FairLockState<T>>,
	cond: Condvar,
}

pub struct FairLockGuard<'a, T> {
	lock: &'a FairLock<T>,
	state: Option<MutexGuard<'a, FairLockState<T>>>,
}

impl<T> FairLock<T> {
	pub fn new(value: T) -> Self {
		Self {
			state: Mutex::new(FairLockState {
				next_ticket: 0,
				now_serving: 0,
				value,
			}),
			cond: Condvar::new(),
		}
	}

	/// Block until this call's ticket comes up, in the order callers arrived.
	pub fn lock(&self) -> FairLockGuard<'_, T> {
		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		let ticket = state.next_ticket;
		state.next_ticket += 1;
		while state.now_serving != ticket {
			state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
		}
		FairLockGuard {
			lock: self,
			state: Some(state),
		}
	}

	/// Take the lock only if it is free right now and nobody is already
	/// queued for it, without blocking.
	///
	/// A waiter parked in [`Self::lock`] releases the underlying mutex while
	/// it sleeps in the `Condvar`, so a bare `try_lock` on that mutex can
	/// succeed even though a ticket is outstanding. Checking
	/// `now_serving == next_ticket` before granting keeps this call from
	/// cutting ahead of (and permanently stranding) that waiter.
	pub fn try_lock(&self) -> Option<FairLockGuard<'_, T>> {
		let mut state = match self.state.try_lock() {
			Ok(state) => state,
			Err(std::sync::TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
			Err(std::sync::TryLockError::WouldBlock) => return None,
		};
		if state.now_serving != state.next_ticket {
			return None;
		}
		state.next_ticket += 1;
		state.now_serving = state.next_ticket;
		Some(FairLockGuard {
			lock: self,
			state: Some(state),
		})
	}
}

impl<T> std::ops::Deref for FairLockGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &T {
		&self.state.as_ref().expect("state dropped before guard").value
	}
}

impl<T> std::ops::DerefMut for FairLockGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		&mut self.state.as_mut().expect("state dropped before guard").value
	}
}

impl<T> Drop for FairLockGuard<'_, T> {
	fn drop(&mut self) {
		if let Some(state) = self.state.take() {
			drop(state);
			self.lock.cond.notify_all();
		}
	}
}
