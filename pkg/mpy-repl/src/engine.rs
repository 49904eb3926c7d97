//! The top-level execute operation (§4.5): ships code, demultiplexes the
//! device's framed reply stream, and recovers from timeouts and
//! cancellation.

use crate::buffer::LineBuffer;
use crate::cancel::CancelToken;
use crate::errors::{DeviceError, ErrorContext};
use crate::mode::{ModeDriver, ReplSubmode};
use crate::paste::{send_code, SendMode};
use crate::transport::Transport;
use crate::wire::ControlByte;
use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const ACK: &[u8] = b"OK";
const FRAME_DELIMITER: &[u8] = b"\x04";
const CANCEL_POLL_SLICE: Duration = Duration::from_millis(50);

/// The captured result of a completed execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionReply {
	pub stdout: Bytes,
	pub stderr: Bytes,
	pub terminated_normally: bool,
}

/// Drives one `execute()` call against a transport already sitting in
/// [`ReplSubmode::Raw`] or [`ReplSubmode::RawPaste`].
pub struct ExecutionEngine<'a> {
	transport: &'a mut dyn Transport,
	buffer: &'a mut LineBuffer,
	mode_driver: &'a ModeDriver,
}

impl<'a> ExecutionEngine<'a> {
	pub fn new(transport: &'a mut dyn Transport, buffer: &'a mut LineBuffer, mode_driver: &'a ModeDriver) -> Self {
		Self {
			transport,
			buffer,
			mode_driver,
		}
	}

	/// Run `code` to completion, or fail with a [`DeviceError`], re-syncing
	/// the device back to [`ReplSubmode::Raw`] along any failure path.
	///
	/// ## Errors
	///
	/// [`DeviceError::Timeout`] if `deadline` passes before the device
	/// finishes replying; [`DeviceError::Interrupted`] if `cancel` fires
	/// before the stdout/stderr frames are fully read; [`DeviceError::Syntax`]
	/// or [`DeviceError::Runtime`] if the code raised; [`DeviceError::Transport`]
	/// or [`DeviceError::ProtocolViolation`] for anything else unexpected.
	pub fn execute(
		&mut self,
		code: &[u8],
		send_mode: &mut SendMode,
		deadline: Instant,
		cancel: Option<&CancelToken>,
	) -> Result<ExecutionReply, DeviceError> {
		if let Err(error) = send_code(self.transport, self.buffer, code, send_mode, deadline) {
			return self.recover_from(error, "send_code");
		}

		if let Err(outcome) = self.poll_exact(ACK.len(), deadline, cancel) {
			return self.recover_from(outcome, "read_ack");
		}

		let stdout = match self.poll_until(FRAME_DELIMITER, deadline, cancel) {
			Ok(bytes) => bytes.slice(..bytes.len() - 1),
			Err(outcome) => return self.recover_from(outcome, "read_stdout"),
		};

		let stderr = match self.poll_until(FRAME_DELIMITER, deadline, cancel) {
			Ok(bytes) => bytes.slice(..bytes.len() - 1),
			Err(outcome) => return self.recover_from(outcome, "read_stderr"),
		};

		let terminator = match self.buffer.read_byte(self.transport, deadline) {
			Ok(byte) => byte,
			Err(error) => return self.recover_from(error, "read_terminator"),
		};
		if terminator != b'>' {
			let context = self.context("read_terminator");
			return Err(DeviceError::ProtocolViolation {
				expected: "'>'".into(),
				observed: format!("{terminator:#04x}"),
				context,
			});
		}

		if stderr.is_empty() {
			Ok(ExecutionReply {
				stdout,
				stderr,
				terminated_normally: true,
			})
		} else {
			Err(DeviceError::from_device_traceback(&stderr, self.context("read_stderr")))
		}
	}

	/// Read until `pattern` arrives, polling in short slices so `cancel` is
	/// observed promptly instead of only once the whole deadline elapses.
	fn poll_until(
		&mut self,
		pattern: &[u8],
		deadline: Instant,
		cancel: Option<&CancelToken>,
	) -> Result<Bytes, DeviceError> {
		loop {
			if cancel.is_some_and(CancelToken::is_cancelled) {
				return Err(DeviceError::Interrupted {
					context: ErrorContext::new("cancelled"),
				});
			}
			let now = Instant::now();
			if now >= deadline {
				return Err(DeviceError::Timeout { phase: String::new() });
			}
			let step_deadline = now + CANCEL_POLL_SLICE.min(deadline.saturating_duration_since(now));
			match self.buffer.read_until(self.transport, pattern, step_deadline) {
				Ok(bytes) => return Ok(bytes),
				Err(DeviceError::Timeout { .. }) => continue,
				Err(other) => return Err(other),
			}
		}
	}

	/// Like [`Self::poll_until`] but for an exact byte count (the `OK` ack).
	fn poll_exact(&mut self, count: usize, deadline: Instant, cancel: Option<&CancelToken>) -> Result<Bytes, DeviceError> {
		loop {
			if cancel.is_some_and(CancelToken::is_cancelled) {
				return Err(DeviceError::Interrupted {
					context: ErrorContext::new("cancelled"),
				});
			}
			let now = Instant::now();
			if now >= deadline {
				return Err(DeviceError::Timeout { phase: String::new() });
			}
			let step_deadline = now + CANCEL_POLL_SLICE.min(deadline.saturating_duration_since(now));
			match self.buffer.read_exact(self.transport, count, step_deadline) {
				Ok(bytes) => return Ok(bytes),
				Err(DeviceError::Timeout { .. }) => continue,
				Err(other) => return Err(other),
			}
		}
	}

	/// Common recovery path for a timeout or cancellation mid-reply (§4.5
	/// step 5, §5's cancellation contract): interrupt, drain, re-enter Raw,
	/// then report the original failure with `phase` filled in.
	fn recover_from(&mut self, error: DeviceError, phase: &str) -> Result<ExecutionReply, DeviceError> {
		match &error {
			DeviceError::Interrupted { .. } => debug!(phase, "execution cancelled, resyncing to raw prompt"),
			DeviceError::Timeout { .. } => warn!(phase, "execution timed out, resyncing to raw prompt"),
			other => warn!(phase, %other, "execution failed, resyncing to raw prompt"),
		}
		let _ = self.transport.write_all(&[ControlByte::Interrupt.into()]);
		let _ = self.transport.drain_input();
		self.mode_driver.enter_raw(self.transport, self.buffer)?;

		Err(match error {
			DeviceError::Timeout { .. } => DeviceError::Timeout { phase: phase.into() },
			DeviceError::Interrupted { mut context } => {
				context.phase = phase.into();
				DeviceError::Interrupted { context }
			}
			other => other,
		})
	}

	fn context(&self, phase: &str) -> ErrorContext {
		ErrorContext::new(phase)
			.with_submodes(ReplSubmode::Raw, ReplSubmode::Raw)
			.with_buffer_pending(self.buffer.pending_len())
	}
}

#[cfg(test)]
mod unit_tests {
	use super::*;
	use crate::testing::MockTransport;
	use std::time::Duration;

	fn deadline() -> Instant {
		Instant::now() + Duration::from_secs(1)
	}

	#[test]
	pub fn executes_a_simple_expression() {
		let mut transport = MockTransport::new(vec![b"OK4\r\n\x04\x04>".to_vec()]);
		let mut buffer = LineBuffer::new();
		let driver = ModeDriver::default();
		let mut engine = ExecutionEngine::new(&mut transport, &mut buffer, &driver);
		let reply = engine
			.execute(b"2+2\n", &mut SendMode::Classic, deadline(), None)
			.unwrap();
		assert_eq!(&reply.stdout[..], b"4\r\n");
		assert!(reply.stderr.is_empty());
		assert!(reply.terminated_normally);
	}

	#[test]
	pub fn maps_a_syntax_error_reply() {
		let reply = b"OK\x04Traceback (most recent call last):\r\n  File \"<stdin>\", line 1\r\n    1=\r\n    ^\r\nSyntaxError: invalid syntax\r\n\x04>";
		let mut transport = MockTransport::new(vec![reply.to_vec()]);
		let mut buffer = LineBuffer::new();
		let driver = ModeDriver::default();
		let mut engine = ExecutionEngine::new(&mut transport, &mut buffer, &driver);
		let error = engine
			.execute(b"1=\n", &mut SendMode::Classic, deadline(), None)
			.unwrap_err();
		assert!(matches!(error, DeviceError::Syntax { ref message, .. } if message == "invalid syntax"));
	}

	#[test]
	pub fn maps_a_runtime_error_reply() {
		let reply =
			b"OK\x04Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\nValueError: bad\r\n\x04>";
		let mut transport = MockTransport::new(vec![reply.to_vec()]);
		let mut buffer = LineBuffer::new();
		let driver = ModeDriver::default();
		let mut engine = ExecutionEngine::new(&mut transport, &mut buffer, &driver);
		let error = engine
			.execute(b"raise ValueError('bad')\n", &mut SendMode::Classic, deadline(), None)
			.unwrap_err();
		match error {
			DeviceError::Runtime {
				exception_class, message, ..
			} => {
				assert_eq!(exception_class, "ValueError");
				assert_eq!(message, "bad");
			}
			other => panic!("expected Runtime, got {other:?}"),
		}
	}

	#[test]
	pub fn cancellation_before_stdout_yields_interrupted() {
		let mut transport = MockTransport::new(vec![RAW_PROMPT_SENTINEL_CHUNK.to_vec()]);
		let mut buffer = LineBuffer::new();
		let driver = ModeDriver::new(Duration::from_millis(200), 0);
		let mut engine = ExecutionEngine::new(&mut transport, &mut buffer, &driver);
		let cancel = CancelToken::new();
		cancel.cancel();
		let error = engine
			.execute(b"while True: pass\n", &mut SendMode::Classic, deadline(), Some(&cancel))
			.unwrap_err();
		assert!(matches!(error, DeviceError::Interrupted { .. }));
	}

	const RAW_PROMPT_SENTINEL_CHUNK: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";
}
