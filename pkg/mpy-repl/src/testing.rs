//! Test-only doubles for driving the engine without real hardware.
//!
//! Distinct from the "mock that silently returns defaults" pitfall called
//! out for the original interception layer: [`MockTransport`] only ever
//! plays back bytes it was explicitly given, and it errors loudly
//! (`DeviceError::Timeout`) the moment its script runs dry rather than
//! fabricating a plausible-looking reply.

use crate::errors::DeviceError;
use crate::transport::Transport;
use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

/// Installs a `tracing-subscriber` writer to the test harness's captured
/// output, once per process, so `cargo test -- --nocapture` shows the
/// `debug!`/`warn!` events the protocol engine emits at its retry and
/// recovery seams. Mirrors the once-only-init guard the teacher lineage uses
/// for its own logging bootstrap (`pkg/log`'s `HAS_INITIALIZED_LOGGING`).
static TEST_SUBSCRIBER_INIT: Lazy<Mutex<bool>> = Lazy::new(|| Mutex::new(false));

pub fn init_test_tracing() {
	let mut initialized = TEST_SUBSCRIBER_INIT.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
	if *initialized {
		return;
	}
	let _ = tracing_subscriber::fmt()
		.with_test_writer()
		.with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
		.try_init();
	*initialized = true;
}

/// A [`Transport`] that plays back a fixed script of byte chunks.
///
/// Each call to [`Transport::read`] pops one chunk off the front of the
/// script, ignoring `deadline` entirely; once the script is exhausted it
/// reports [`DeviceError::Timeout`] regardless of how far in the future the
/// deadline is. Tests that need to exercise real wall-clock timeout
/// behavior should pass an already-elapsed deadline rather than relying on
/// this transport to sleep.
#[derive(Debug, Default)]
pub struct MockTransport {
	chunks: VecDeque<Vec<u8>>,
	/// The tail of a chunk that didn't fit in the caller's `buf` on the last
	/// `read`, handed out before the next scripted chunk is popped.
	pending: Vec<u8>,
	written: Vec<u8>,
	closed: bool,
}

impl MockTransport {
	#[must_use]
	pub fn new(chunks: Vec<Vec<u8>>) -> Self {
		Self {
			chunks: chunks.into(),
			pending: Vec::new(),
			written: Vec::new(),
			closed: false,
		}
	}

	/// Everything written to this transport so far, in order.
	#[must_use]
	pub fn written(&self) -> &[u8] {
		&self.written
	}

	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.closed
	}
}

impl Transport for MockTransport {
	fn read(&mut self, buf: &mut [u8], _deadline: Instant) -> Result<usize, DeviceError> {
		if self.pending.is_empty() {
			match self.chunks.pop_front() {
				Some(chunk) => self.pending = chunk,
				None => return Err(DeviceError::Timeout { phase: "mock_read".into() }),
			}
		}
		let n = self.pending.len().min(buf.len());
		buf[..n].copy_from_slice(&self.pending[..n]);
		self.pending.drain(..n);
		Ok(n)
	}

	fn write_all(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
		self.written.extend_from_slice(bytes);
		Ok(())
	}

	fn drain_input(&mut self) -> Result<(), DeviceError> {
		self.pending.clear();
		self.chunks.clear();
		Ok(())
	}

	fn close(&mut self) -> Result<(), DeviceError> {
		self.closed = true;
		Ok(())
	}
}

#[cfg(test)]
mod unit_tests {
	use super::*;

	#[test]
	pub fn read_pops_chunks_in_order() {
		let mut transport = MockTransport::new(vec![b"a".to_vec(), b"b".to_vec()]);
		let mut buf = [0_u8; 4];
		assert_eq!(transport.read(&mut buf, Instant::now()).unwrap(), 1);
		assert_eq!(&buf[..1], b"a");
		assert_eq!(transport.read(&mut buf, Instant::now()).unwrap(), 1);
		assert_eq!(&buf[..1], b"b");
	}

	#[test]
	pub fn read_splits_a_chunk_wider_than_the_caller_buffer_across_calls() {
		let mut transport = MockTransport::new(vec![b"abcdef".to_vec()]);
		let mut buf = [0_u8; 4];
		assert_eq!(transport.read(&mut buf, Instant::now()).unwrap(), 4);
		assert_eq!(&buf[..4], b"abcd");
		assert_eq!(transport.read(&mut buf, Instant::now()).unwrap(), 2);
		assert_eq!(&buf[..2], b"ef");
	}

	#[test]
	pub fn read_times_out_once_the_script_is_exhausted() {
		let mut transport = MockTransport::new(vec![]);
		let mut buf = [0_u8; 4];
		assert!(matches!(
			transport.read(&mut buf, Instant::now()),
			Err(DeviceError::Timeout { .. })
		));
	}

	#[test]
	pub fn write_all_records_bytes_written() {
		let mut transport = MockTransport::new(vec![]);
		transport.write_all(b"\x01").unwrap();
		transport.write_all(b"\x02").unwrap();
		assert_eq!(transport.written(), b"\x01\x02");
	}
}
