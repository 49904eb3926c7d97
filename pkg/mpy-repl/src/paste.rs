//! The windowed raw-paste code sender, and its classic-Raw fallback (§4.4).

use crate::buffer::LineBuffer;
use crate::errors::{DeviceError, ErrorContext};
use crate::mode::ReplSubmode;
use crate::transport::Transport;
use crate::wire::{ControlByte, PASTE_ABORT, WINDOW_REPLENISH};
use std::time::Instant;
use tracing::{trace, warn};

/// The device-advertised flow-control window for a raw-paste transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PasteWindow {
	initial_size: u16,
	remaining: u16,
}

impl PasteWindow {
	#[must_use]
	pub fn new(initial_size: u16) -> Self {
		Self {
			initial_size,
			remaining: initial_size,
		}
	}

	#[must_use]
	pub fn remaining(&self) -> u16 {
		self.remaining
	}

	#[must_use]
	pub fn initial_size(&self) -> u16 {
		self.initial_size
	}

	/// Reset the window back to its full advertised size. The device's
	/// window is per-transfer (§4.4: "State: window = initial_size"), so
	/// this must run at the start of every `send_raw_paste` call, not just
	/// once at raw-paste negotiation — otherwise a window left depleted by
	/// one execution starves the next, which never gets a fresh `\x01` from
	/// the device to replenish it.
	pub fn reset(&mut self) {
		self.remaining = self.initial_size;
	}
}

/// How to ship code to the device, chosen once per execution by whether raw
/// REPL entry negotiated raw-paste support.
#[derive(Debug)]
pub enum SendMode {
	RawPaste(PasteWindow),
	Classic,
}

/// Ship `code` to the device and write the terminating `Ctrl-D`, respecting
/// `mode`'s flow control.
///
/// ## Errors
///
/// [`DeviceError::ProtocolViolation`] on an unrecognized control byte from
/// the device; [`DeviceError::Interrupted`] if the device aborts the
/// transfer mid-stream; [`DeviceError::Timeout`] or
/// [`DeviceError::Transport`] from the underlying transport.
pub fn send_code(
	transport: &mut dyn Transport,
	buffer: &mut LineBuffer,
	code: &[u8],
	mode: &mut SendMode,
	deadline: Instant,
) -> Result<(), DeviceError> {
	match mode {
		SendMode::RawPaste(window) => send_raw_paste(transport, buffer, code, window, deadline)?,
		SendMode::Classic => transport.write_all(code)?,
	}
	transport.write_all(&[ControlByte::FrameDelimiter.into()])
}

fn send_raw_paste(
	transport: &mut dyn Transport,
	buffer: &mut LineBuffer,
	code: &[u8],
	window: &mut PasteWindow,
	deadline: Instant,
) -> Result<(), DeviceError> {
	window.reset();
	let mut offset = 0;
	while offset < code.len() {
		if window.remaining == 0 {
			let byte = buffer.read_byte(transport, deadline)?;
			apply_control_byte(byte, window, transport, buffer, deadline)?;
			continue;
		}

		buffer.try_fill(transport)?;
		while let Some(byte) = buffer.take_buffered_byte() {
			apply_control_byte(byte, window, transport, buffer, deadline)?;
		}

		let chunk_len = usize::from(window.remaining.min(window.initial_size)).min(code.len() - offset);
		if chunk_len == 0 {
			continue;
		}
		transport.write_all(&code[offset..offset + chunk_len])?;
		offset += chunk_len;
		window.remaining -= chunk_len as u16;
	}
	Ok(())
}

fn apply_control_byte(
	byte: u8,
	window: &mut PasteWindow,
	transport: &mut dyn Transport,
	buffer: &mut LineBuffer,
	deadline: Instant,
) -> Result<(), DeviceError> {
	match byte {
		WINDOW_REPLENISH => {
			window.remaining = window.remaining.saturating_add(window.initial_size);
			trace!(remaining = window.remaining, "paste window replenished");
			Ok(())
		}
		PASTE_ABORT => {
			warn!("device aborted raw-paste transfer, resyncing");
			buffer.read_until(transport, &[PASTE_ABORT], deadline)?;
			Err(DeviceError::Interrupted {
				context: ErrorContext::new("raw_paste_send")
					.with_submodes(ReplSubmode::RawPaste, ReplSubmode::RawPaste)
					.with_buffer_pending(buffer.pending_len()),
			})
		}
		other => Err(DeviceError::ProtocolViolation {
			expected: "\\x01 (window replenish) or \\x04 (abort)".into(),
			observed: format!("{other:#04x}"),
			context: ErrorContext::new("raw_paste_send").with_submodes(ReplSubmode::RawPaste, ReplSubmode::RawPaste),
		}),
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
	pub fn classic_send_writes_code_then_frame_delimiter() {
		let mut transport = MockTransport::new(vec![]);
		let mut buffer = LineBuffer::new();
		let mut mode = SendMode::Classic;
		send_code(&mut transport, &mut buffer, b"1+1", &mut mode, deadline()).unwrap();
		assert_eq!(transport.written(), b"1+1\x04");
	}

	#[test]
	pub fn raw_paste_send_respects_window_and_replenishes() {
		let mut transport = MockTransport::new(vec![b"\x01".to_vec()]);
		let mut buffer = LineBuffer::new();
		let mut mode = SendMode::RawPaste(PasteWindow::new(4));
		let code = b"abcdefgh";
		send_code(&mut transport, &mut buffer, code, &mut mode, deadline()).unwrap();
		assert_eq!(transport.written(), b"abcdefgh\x04");
	}

	#[test]
	pub fn raw_paste_send_surfaces_device_abort_as_interrupted() {
		let mut transport = MockTransport::new(vec![b"\x04".to_vec(), b"\x04".to_vec()]);
		let mut buffer = LineBuffer::new();
		let mut mode = SendMode::RawPaste(PasteWindow::new(0));
		let result = send_code(&mut transport, &mut buffer, b"ab", &mut mode, deadline());
		assert!(matches!(result, Err(DeviceError::Interrupted { .. })));
	}

	#[test]
	pub fn raw_paste_send_rejects_unknown_control_byte() {
		let mut transport = MockTransport::new(vec![b"Z".to_vec()]);
		let mut buffer = LineBuffer::new();
		let mut mode = SendMode::RawPaste(PasteWindow::new(0));
		let result = send_code(&mut transport, &mut buffer, b"ab", &mut mode, deadline());
		assert!(matches!(result, Err(DeviceError::ProtocolViolation { .. })));
	}
}
