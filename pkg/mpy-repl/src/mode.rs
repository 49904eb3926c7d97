//! The submode state machine (§4.3): driving the device between the
//! friendly interactive prompt, raw REPL, and the windowed raw-paste
//! sub-protocol.

use crate::buffer::LineBuffer;
use crate::errors::{DeviceError, ErrorContext};
use crate::transport::Transport;
use crate::wire::{
	ControlByte, FRIENDLY_PROMPT_SENTINEL, RAW_PASTE_REQUEST, RAW_PROMPT_SENTINEL,
};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Which of the device's four REPL submodes the engine currently believes
/// it is in.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ReplSubmode {
	/// Nothing has been negotiated yet; the device's actual state is not
	/// known to the host.
	#[default]
	Unknown,
	/// The interactive `>>> ` prompt.
	Friendly,
	/// Raw REPL: accepts code followed by `Ctrl-D` to execute.
	Raw,
	/// The windowed binary sub-protocol entered from [`Self::Raw`].
	RawPaste,
}

impl Display for ReplSubmode {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		match *self {
			Self::Unknown => write!(fmt, "unknown"),
			Self::Friendly => write!(fmt, "friendly"),
			Self::Raw => write!(fmt, "raw"),
			Self::RawPaste => write!(fmt, "raw-paste"),
		}
	}
}

/// Drives submode transitions against a transport, per the handshake in
/// §4.3.
#[derive(Clone, Debug)]
pub struct ModeDriver {
	pub handshake_timeout: Duration,
	pub max_retries: u32,
}

impl Default for ModeDriver {
	fn default() -> Self {
		Self {
			handshake_timeout: Duration::from_millis(2000),
			max_retries: 2,
		}
	}
}

impl ModeDriver {
	#[must_use]
	pub fn new(handshake_timeout: Duration, max_retries: u32) -> Self {
		Self {
			handshake_timeout,
			max_retries,
		}
	}

	/// Negotiate raw REPL from whatever submode the device is currently in,
	/// interrupting any running program along the way.
	///
	/// Sends `\r\n`, two `Ctrl-C`s with a settling drain between them, then
	/// `Ctrl-A`, and waits for [`RAW_PROMPT_SENTINEL`]. Retries the
	/// `Ctrl-A`/sentinel step up to `max_retries` times before giving up.
	///
	/// ## Errors
	///
	/// [`DeviceError::ProtocolViolation`] if the sentinel never arrives
	/// within the retry budget; [`DeviceError::Transport`] if the transport
	/// fails along the way.
	pub fn enter_raw(
		&self,
		transport: &mut dyn Transport,
		buffer: &mut LineBuffer,
	) -> Result<ReplSubmode, DeviceError> {
		transport.write_all(b"\r\n")?;
		transport.write_all(&[ControlByte::Interrupt.into()])?;
		self.settle(transport, buffer);
		transport.write_all(&[ControlByte::Interrupt.into()])?;
		self.settle(transport, buffer);
		buffer.feed(&[]);
		transport.drain_input()?;

		let mut last_error = None;
		for attempt in 0..=self.max_retries {
			transport.write_all(&[ControlByte::EnterRawRepl.into()])?;
			let deadline = Instant::now() + self.handshake_timeout;
			match buffer.read_until(transport, RAW_PROMPT_SENTINEL, deadline) {
				Ok(_) => {
					if attempt > 0 {
						debug!(attempt, "raw prompt sentinel arrived after retry");
					}
					return Ok(ReplSubmode::Raw);
				}
				Err(error) => {
					debug!(attempt, max_retries = self.max_retries, %error, "raw prompt sentinel missed, retrying");
					last_error = Some(error);
				}
			}
		}

		warn!(max_retries = self.max_retries, "giving up entering raw REPL");
		Err(last_error.unwrap_or_else(|| {
			DeviceError::ProtocolViolation {
				expected: String::from_utf8_lossy(RAW_PROMPT_SENTINEL).into_owned(),
				observed: buffer.observed_tail(128),
				context: ErrorContext::new("enter_raw").with_submodes(ReplSubmode::Unknown, ReplSubmode::Unknown),
			}
		}))
	}

	/// Return to the friendly prompt from raw REPL via `Ctrl-B`.
	///
	/// ## Errors
	///
	/// [`DeviceError::Timeout`] or [`DeviceError::Transport`] if the
	/// friendly prompt sentinel doesn't arrive within the handshake
	/// timeout.
	pub fn exit_to_friendly(
		&self,
		transport: &mut dyn Transport,
		buffer: &mut LineBuffer,
	) -> Result<ReplSubmode, DeviceError> {
		transport.write_all(&[ControlByte::ExitRawRepl.into()])?;
		let deadline = Instant::now() + self.handshake_timeout;
		buffer.read_until(transport, FRIENDLY_PROMPT_SENTINEL, deadline)?;
		Ok(ReplSubmode::Friendly)
	}

	/// From [`ReplSubmode::Raw`], attempt to negotiate the windowed
	/// raw-paste sub-protocol.
	///
	/// Returns `Some(window_size)` if the device accepted raw-paste, or
	/// `None` if it replied `R\x00` (no raw-paste support, caller should
	/// fall back to classic raw-mode execution per §4.4).
	///
	/// ## Errors
	///
	/// [`DeviceError::ProtocolViolation`] if the device's two-byte reply is
	/// neither `R\x00` nor `R\x01`.
	pub fn try_enter_raw_paste(
		&self,
		transport: &mut dyn Transport,
		buffer: &mut LineBuffer,
	) -> Result<Option<u16>, DeviceError> {
		transport.write_all(RAW_PASTE_REQUEST)?;
		let deadline = Instant::now() + self.handshake_timeout;
		let header = buffer.read_exact(transport, 2, deadline)?;
		match (header[0], header[1]) {
			(b'R', 0x00) => {
				debug!("device declined raw-paste, staying in classic raw mode");
				Ok(None)
			}
			(b'R', 0x01) => {
				let window_bytes = buffer.read_exact(transport, 2, deadline)?;
				let window = u16::from_le_bytes([window_bytes[0], window_bytes[1]]);
				debug!(window, "device accepted raw-paste");
				Ok(Some(window))
			}
			(first, second) => Err(DeviceError::ProtocolViolation {
				expected: "R\\x00 or R\\x01<window-lo><window-hi>".into(),
				observed: format!("{first:#04x} {second:#04x}"),
				context: ErrorContext::new("raw_paste_negotiation")
					.with_submodes(ReplSubmode::Raw, ReplSubmode::Raw),
			}),
		}
	}

	/// Drain whatever arrives for roughly 50ms, the settling window the
	/// device needs between interrupt bytes.
	fn settle(&self, transport: &mut dyn Transport, buffer: &mut LineBuffer) {
		let until = Instant::now() + Duration::from_millis(50);
		while Instant::now() < until {
			if buffer.try_fill(transport).unwrap_or(0) == 0 {
				thread::sleep(Duration::from_millis(5));
			}
		}
	}
}
