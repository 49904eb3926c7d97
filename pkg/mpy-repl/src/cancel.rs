//! A cooperative cancellation signal shared between a caller and an
//! in-flight [`crate::engine::ExecutionEngine::execute`] call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cheaply-cloned handle that lets a caller ask an in-flight execution to
/// stop at its next cancellation checkpoint.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
	#[must_use]
	pub fn new() -> Self {
		Self(Arc::new(AtomicBool::new(false)))
	}

	/// Request cancellation. Idempotent.
	pub fn cancel(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod unit_tests {
	use super::*;

	#[test]
	pub fn starts_uncancelled_and_latches_once_cancelled() {
		let token = CancelToken::new();
		assert!(!token.is_cancelled());
		token.cancel();
		assert!(token.is_cancelled());
	}

	#[test]
	pub fn clones_share_the_same_signal() {
		let token = CancelToken::new();
		let clone = token.clone();
		clone.cancel();
		assert!(token.is_cancelled());
	}
}
