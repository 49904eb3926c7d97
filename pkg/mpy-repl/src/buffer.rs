//! The byte accumulator the rest of the engine reads framed replies through.
//!
//! [`LineBuffer`] never drops a byte: a prompt match consumes exactly the
//! bytes up to and including the match, and every other lookahead
//! (`peek`) is non-destructive. It transparently pulls more bytes from a
//! [`Transport`] as needed, so a sentinel that straddles two transport
//! reads is still recognized.

use crate::errors::DeviceError;
use crate::transport::Transport;
use bytes::{Bytes, BytesMut};
use std::time::Instant;

const PULL_CHUNK_SIZE: usize = 512;

/// An accumulating byte buffer with pattern-based framing reads.
#[derive(Debug, Default)]
pub struct LineBuffer {
	data: BytesMut,
}

impl LineBuffer {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Append bytes already read from the transport by some other caller.
	pub fn feed(&mut self, bytes: &[u8]) {
		self.data.extend_from_slice(bytes);
	}

	#[must_use]
	pub fn pending_len(&self) -> usize {
		self.data.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.data.is_empty()
	}

	/// Check whether `pattern` is already present in the buffer, without
	/// consuming anything or touching the transport.
	#[must_use]
	pub fn peek(&self, pattern: &[u8]) -> bool {
		find(&self.data, pattern).is_some()
	}

	/// A bounded, lossy tail of whatever is currently buffered, suitable for
	/// embedding in a [`DeviceError::ProtocolViolation`].
	#[must_use]
	pub fn observed_tail(&self, max_len: usize) -> String {
		let start = self.data.len().saturating_sub(max_len);
		String::from_utf8_lossy(&self.data[start..]).into_owned()
	}

	/// Read bytes from the transport until `pattern` appears, returning
	/// everything up to and including it. Bytes already buffered are
	/// searched first.
	///
	/// ## Errors
	///
	/// [`DeviceError::Timeout`] if `deadline` passes before the pattern
	/// arrives; [`DeviceError::Transport`] if the transport fails or closes
	/// first.
	pub fn read_until(
		&mut self,
		transport: &mut dyn Transport,
		pattern: &[u8],
		deadline: Instant,
	) -> Result<Bytes, DeviceError> {
		loop {
			if let Some(at) = find(&self.data, pattern) {
				return Ok(self.data.split_to(at + pattern.len()).freeze());
			}
			self.pull_more(transport, deadline)?;
		}
	}

	/// Like [`Self::read_until`], but for any one of several candidate
	/// patterns. Returns the index into `patterns` of whichever matched
	/// first, along with the consumed bytes.
	///
	/// ## Errors
	///
	/// Same as [`Self::read_until`].
	pub fn read_until_any(
		&mut self,
		transport: &mut dyn Transport,
		patterns: &[&[u8]],
		deadline: Instant,
	) -> Result<(usize, Bytes), DeviceError> {
		loop {
			for (index, pattern) in patterns.iter().enumerate() {
				if let Some(at) = find(&self.data, pattern) {
					return Ok((index, self.data.split_to(at + pattern.len()).freeze()));
				}
			}
			self.pull_more(transport, deadline)?;
		}
	}

	/// Read exactly `count` bytes, pulling more from the transport as
	/// needed.
	///
	/// ## Errors
	///
	/// Same as [`Self::read_until`].
	pub fn read_exact(
		&mut self,
		transport: &mut dyn Transport,
		count: usize,
		deadline: Instant,
	) -> Result<Bytes, DeviceError> {
		while self.data.len() < count {
			self.pull_more(transport, deadline)?;
		}
		Ok(self.data.split_to(count).freeze())
	}

	/// Read a single byte, pulling from the transport if none is buffered.
	///
	/// ## Errors
	///
	/// Same as [`Self::read_until`].
	pub fn read_byte(
		&mut self,
		transport: &mut dyn Transport,
		deadline: Instant,
	) -> Result<u8, DeviceError> {
		Ok(self.read_exact(transport, 1, deadline)?[0])
	}

	/// Pop a single byte already sitting in the buffer, without touching the
	/// transport. Returns `None` if nothing is buffered right now.
	pub fn take_buffered_byte(&mut self) -> Option<u8> {
		if self.data.is_empty() {
			None
		} else {
			Some(self.data.split_to(1)[0])
		}
	}

	/// Opportunistically pull whatever bytes are immediately available
	/// (non-blocking, i.e. a deadline of "now") without requiring any
	/// particular pattern. Returns how many new bytes were buffered.
	///
	/// ## Errors
	///
	/// [`DeviceError::Transport`] if the transport reports a real failure.
	/// A plain timeout (nothing available right now) is not an error here
	/// and reports zero bytes pulled.
	pub fn try_fill(&mut self, transport: &mut dyn Transport) -> Result<usize, DeviceError> {
		let mut chunk = [0_u8; PULL_CHUNK_SIZE];
		match transport.read(&mut chunk, Instant::now()) {
			Ok(0) => Ok(0),
			Ok(n) => {
				self.feed(&chunk[..n]);
				Ok(n)
			}
			Err(DeviceError::Timeout { .. }) => Ok(0),
			Err(other) => Err(other),
		}
	}

	fn pull_more(&mut self, transport: &mut dyn Transport, deadline: Instant) -> Result<(), DeviceError> {
		let mut chunk = [0_u8; PULL_CHUNK_SIZE];
		let read = transport.read(&mut chunk, deadline)?;
		if read == 0 {
			return Err(DeviceError::transport(
				"transport reached end-of-stream while the engine was waiting for more data",
			));
		}
		self.feed(&chunk[..read]);
		Ok(())
	}
}

fn find(haystack: &[u8], pattern: &[u8]) -> Option<usize> {
	if pattern.is_empty() || haystack.len() < pattern.len() {
		return None;
	}
	haystack
		.windows(pattern.len())
		.position(|window| window == pattern)
}

#[cfg(test)]
mod unit_tests {
	use super::*;
	use crate::testing::MockTransport;

	#[test]
	pub fn read_until_finds_pattern_already_buffered() {
		let mut buffer = LineBuffer::new();
		buffer.feed(b"hello>>> world");
		let mut transport = MockTransport::new(vec![]);
		let result = buffer
			.read_until(&mut transport, b">>> ", Instant::now() + std::time::Duration::from_secs(1))
			.unwrap();
		assert_eq!(&result[..], b"hello>>> ");
		assert_eq!(&buffer.data[..], b"world");
	}

	#[test]
	pub fn read_until_recognizes_a_pattern_split_across_two_reads() {
		let mut transport = MockTransport::new(vec![b"abc>".to_vec(), b">> tail".to_vec()]);
		let mut buffer = LineBuffer::new();
		let result = buffer
			.read_until(&mut transport, b">>> ", Instant::now() + std::time::Duration::from_secs(1))
			.unwrap();
		assert_eq!(&result[..], b"abc>>> ");
		assert_eq!(&buffer.data[..], b"tail");
	}

	#[test]
	pub fn read_until_any_reports_which_pattern_matched() {
		let mut transport = MockTransport::new(vec![b"R\x00".to_vec()]);
		let mut buffer = LineBuffer::new();
		let (index, bytes) = buffer
			.read_until_any(
				&mut transport,
				&[b"R\x00", b"R\x01"],
				Instant::now() + std::time::Duration::from_secs(1),
			)
			.unwrap();
		assert_eq!(index, 0);
		assert_eq!(&bytes[..], b"R\x00");
	}

	#[test]
	pub fn read_until_times_out_when_nothing_arrives() {
		let mut transport = MockTransport::new(vec![]);
		let mut buffer = LineBuffer::new();
		let result = buffer.read_until(&mut transport, b">>> ", Instant::now());
		assert!(matches!(result, Err(DeviceError::Timeout { .. })));
	}
}
