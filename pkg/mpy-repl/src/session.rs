//! The connection-state guard (§4.8): serializes execution against one
//! device and owns the transport exclusively.

use crate::cancel::CancelToken;
use crate::decode::{decode, DecodedValue, ResultKind};
use crate::engine::ExecutionEngine;
use crate::errors::DeviceError;
use crate::fair_lock::FairLock;
use crate::mode::{ModeDriver, ReplSubmode};
use crate::paste::{PasteWindow, SendMode};
use crate::transport::{ConnectionEndpoint, Transport};
use crate::buffer::LineBuffer;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Whether a caller that finds the session already executing should queue
/// or fail immediately (§5).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AcquirePolicy {
	#[default]
	Fifo,
	Busy,
}

/// Tunable protocol parameters, with the defaults named in §3.
#[derive(Clone, Debug)]
pub struct SessionConfig {
	pub handshake_timeout: Duration,
	pub command_timeout: Duration,
	pub paste_window_size: u16,
	pub max_retries: u32,
	pub stdout_drain_throttle: Duration,
	pub acquire_policy: AcquirePolicy,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			handshake_timeout: Duration::from_millis(2000),
			command_timeout: Duration::from_millis(30_000),
			paste_window_size: 256,
			max_retries: 3,
			stdout_drain_throttle: Duration::ZERO,
			acquire_policy: AcquirePolicy::Fifo,
		}
	}
}

/// Where the session guard believes the connection currently stands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
	Executing,
	Disconnecting,
	Faulted,
}

struct SessionInner {
	transport: Option<Box<dyn Transport>>,
	buffer: LineBuffer,
	submode: ReplSubmode,
	send_mode: SendMode,
	state: ConnectionState,
}

/// A single device connection: owns its transport, serializes `execute`
/// calls against it, and tracks [`ConnectionState`].
pub struct Session {
	endpoint: ConnectionEndpoint,
	config: SessionConfig,
	mode_driver: ModeDriver,
	inner: FairLock<SessionInner>,
}

impl Session {
	#[must_use]
	pub fn new(endpoint: ConnectionEndpoint, config: SessionConfig) -> Self {
		let mode_driver = ModeDriver::new(config.handshake_timeout, config.max_retries);
		Self {
			endpoint,
			config,
			mode_driver,
			inner: FairLock::new(SessionInner {
				transport: None,
				buffer: LineBuffer::new(),
				submode: ReplSubmode::Unknown,
				send_mode: SendMode::Classic,
				state: ConnectionState::Disconnected,
			}),
		}
	}

	/// Build an already-[`ConnectionState::Connected`] session around a
	/// transport that has already completed the raw REPL handshake,
	/// bypassing [`Self::connect`]. Used to unit-test everything layered on
	/// top of the engine against a [`crate::testing::MockTransport`]
	/// without driving a real handshake through it.
	#[cfg(test)]
	#[must_use]
	pub(crate) fn new_connected_for_testing(
		transport: Box<dyn Transport>,
		send_mode: SendMode,
		config: SessionConfig,
	) -> Self {
		let mode_driver = ModeDriver::new(config.handshake_timeout, config.max_retries);
		Self {
			endpoint: ConnectionEndpoint::Subprocess {
				executable: String::new(),
				args: vec![],
			},
			config,
			mode_driver,
			inner: FairLock::new(SessionInner {
				transport: Some(transport),
				buffer: LineBuffer::new(),
				submode: ReplSubmode::Raw,
				send_mode,
				state: ConnectionState::Connected,
			}),
		}
	}

	#[must_use]
	pub fn state(&self) -> ConnectionState {
		self.inner.lock().state
	}

	/// Open the transport and drive the mode handshake to Raw (and
	/// raw-paste, if the device supports it).
	///
	/// ## Errors
	///
	/// Any [`DeviceError`] the transport open or the handshake raises. The
	/// session is left [`ConnectionState::Faulted`] on failure.
	pub fn connect(&self, _deadline: Instant) -> Result<(), DeviceError> {
		let mut inner = self.inner.lock();
		inner.state = ConnectionState::Connecting;

		let transport = match self.endpoint.open() {
			Ok(transport) => transport,
			Err(error) => {
				warn!(%error, "failed to open transport");
				inner.state = ConnectionState::Faulted;
				return Err(error);
			}
		};
		inner.transport = Some(transport);

		let result = (|| -> Result<(), DeviceError> {
			let transport = inner.transport.as_deref_mut().expect("just populated");
			self.mode_driver.enter_raw(transport, &mut inner.buffer)?;
			inner.submode = ReplSubmode::Raw;

			match self.mode_driver.try_enter_raw_paste(transport, &mut inner.buffer)? {
				Some(window) => {
					inner.submode = ReplSubmode::RawPaste;
					inner.send_mode = SendMode::RawPaste(PasteWindow::new(window));
				}
				None => inner.send_mode = SendMode::Classic,
			}
			Ok(())
		})();

		match result {
			Ok(()) => {
				debug!(submode = %inner.submode, "connected");
				inner.state = ConnectionState::Connected;
				Ok(())
			}
			Err(error) => {
				warn!(%error, "failed to negotiate raw REPL, session faulted");
				inner.state = ConnectionState::Faulted;
				Err(error)
			}
		}
	}

	/// Run `code`, decoding its stdout as `kind`. Mutually exclusive with
	/// every other in-flight `execute` call on this session.
	///
	/// ## Errors
	///
	/// [`DeviceError::Busy`] if `acquire_policy` is [`AcquirePolicy::Busy`]
	/// and another execution is in flight; [`DeviceError::Disconnected`] if
	/// the session never connected; any [`DeviceError`] the engine or
	/// decoder raise otherwise. On an unrecoverable failure the session is
	/// left [`ConnectionState::Faulted`].
	pub fn execute(
		&self,
		code: &str,
		kind: ResultKind,
		deadline: Instant,
		cancel: Option<&CancelToken>,
	) -> Result<DecodedValue, DeviceError> {
		let mut inner = match self.config.acquire_policy {
			AcquirePolicy::Fifo => self.inner.lock(),
			AcquirePolicy::Busy => self.inner.try_lock().ok_or(DeviceError::Busy)?,
		};

		if inner.state != ConnectionState::Connected {
			return Err(DeviceError::Disconnected);
		}
		inner.state = ConnectionState::Executing;

		let wrapped = kind.wrap_code(code);
		let outcome = {
			let SessionInner {
				transport,
				buffer,
				send_mode,
				..
			} = &mut *inner;
			let transport = transport.as_deref_mut().ok_or(DeviceError::Disconnected)?;
			let mut engine = ExecutionEngine::new(transport, buffer, &self.mode_driver);
			engine.execute(wrapped.as_bytes(), send_mode, deadline, cancel)
		};

		// Raw-paste is negotiated once, at connect (§4.8: "A connect call
		// re-drives the mode driver to Raw (and attempts RawPaste)"); it is
		// not re-requested before each send. So a session whose `send_mode`
		// is `RawPaste` stays RawPaste-capable across every execution, and
		// `submode` must track that rather than collapsing to bare `Raw`
		// once execution finishes — otherwise the two fields disagree about
		// what sub-protocol this session is actually speaking.
		let resting_submode = match inner.send_mode {
			SendMode::RawPaste(_) => ReplSubmode::RawPaste,
			SendMode::Classic => ReplSubmode::Raw,
		};

		match outcome {
			Ok(reply) => {
				inner.state = ConnectionState::Connected;
				inner.submode = resting_submode;
				decode(kind, &reply.stdout)
			}
			Err(error @ (DeviceError::Timeout { .. } | DeviceError::Interrupted { .. })) => {
				inner.state = ConnectionState::Connected;
				inner.submode = resting_submode;
				Err(error)
			}
			Err(error @ (DeviceError::Syntax { .. } | DeviceError::Runtime { .. })) => {
				inner.state = ConnectionState::Connected;
				inner.submode = resting_submode;
				Err(error)
			}
			Err(error) => {
				warn!(%error, "execution left the session in an unrecoverable state, faulted");
				inner.state = ConnectionState::Faulted;
				Err(error)
			}
		}
	}

	/// Return the device to the friendly prompt and close the transport.
	/// Idempotent: calling this on an already-disconnected session is a
	/// no-op.
	///
	/// ## Errors
	///
	/// [`DeviceError`] if the transport fails to close cleanly; the session
	/// is still left [`ConnectionState::Disconnected`] regardless.
	pub fn disconnect(&self, _deadline: Instant) -> Result<(), DeviceError> {
		let mut inner = self.inner.lock();
		if inner.transport.is_none() {
			inner.state = ConnectionState::Disconnected;
			return Ok(());
		}
		inner.state = ConnectionState::Disconnecting;
		debug!("disconnecting");

		let result = {
			let SessionInner { transport, buffer, .. } = &mut *inner;
			let transport = transport.as_deref_mut().expect("checked above");
			self.mode_driver
				.exit_to_friendly(transport, buffer)
				.and_then(|_| transport.close())
		};

		inner.transport = None;
		inner.state = ConnectionState::Disconnected;
		result.map(|_| ())
	}
}

#[cfg(test)]
mod unit_tests {
	use super::*;
	use crate::testing::MockTransport;
	use std::time::Duration;

	fn deadline() -> Instant {
		Instant::now() + Duration::from_secs(2)
	}

	#[test]
	pub fn new_session_starts_disconnected() {
		let session = Session::new(
			ConnectionEndpoint::Subprocess {
				executable: "/bin/does-not-matter".into(),
				args: vec![],
			},
			SessionConfig::default(),
		);
		assert_eq!(session.state(), ConnectionState::Disconnected);
	}

	#[test]
	pub fn execute_before_connect_reports_disconnected() {
		let session = Session::new(
			ConnectionEndpoint::Subprocess {
				executable: "/bin/does-not-matter".into(),
				args: vec![],
			},
			SessionConfig::default(),
		);
		let result = session.execute("1+1", ResultKind::Integer, deadline(), None);
		assert!(matches!(result, Err(DeviceError::Disconnected)));
	}

	/// §8 scenario 2: `print('hi')` decoded as a raw string strips exactly
	/// one trailing CRLF.
	#[test]
	pub fn execute_decodes_print_output_as_raw_string() {
		let transport = MockTransport::new(vec![b"OKhi\r\n\x04\x04>".to_vec()]);
		let session = Session::new_connected_for_testing(Box::new(transport), SendMode::Classic, SessionConfig::default());
		let value = session.execute("print('hi')", ResultKind::RawString, deadline(), None).unwrap();
		assert_eq!(value, DecodedValue::RawString("hi".to_string()));
		assert_eq!(session.state(), ConnectionState::Connected);
	}

	/// §8 scenario 6: a raw-paste session ships code that fits under its
	/// negotiated window in one go and still decodes the result normally,
	/// leaving the session connected. (The leading empty chunk stands in for
	/// "nothing from the device yet" during the opportunistic control-byte
	/// poll that happens before each write — see `paste.rs` for the window
	/// replenish/abort mechanics themselves.)
	#[test]
	pub fn execute_over_raw_paste_respects_the_negotiated_window() {
		let transport = MockTransport::new(vec![Vec::new(), b"OK4\r\n\x04\x04>".to_vec()]);
		let session = Session::new_connected_for_testing(
			Box::new(transport),
			SendMode::RawPaste(PasteWindow::new(32)),
			SessionConfig::default(),
		);
		let value = session.execute("2+2", ResultKind::Integer, deadline(), None).unwrap();
		assert_eq!(value, DecodedValue::Integer(4));
		assert_eq!(session.state(), ConnectionState::Connected);
	}

	/// §4.4's "State: window = initial_size" is per transfer, not per
	/// session: a second raw-paste execution that exactly exhausted the
	/// window on the first must still get a full window of its own, rather
	/// than inheriting the depleted `remaining` the first call left behind.
	#[test]
	pub fn execute_over_raw_paste_refills_the_window_on_every_call() {
		let transport = MockTransport::new(vec![
			Vec::new(),
			b"OK4\r\n\x04\x04>".to_vec(),
			Vec::new(),
			b"OK6\r\n\x04\x04>".to_vec(),
		]);
		let session = Session::new_connected_for_testing(
			Box::new(transport),
			SendMode::RawPaste(PasteWindow::new(3)),
			SessionConfig::default(),
		);
		let first = session.execute("2+2", ResultKind::Integer, deadline(), None).unwrap();
		assert_eq!(first, DecodedValue::Integer(4));
		assert_eq!(session.state(), ConnectionState::Connected);

		let second = session.execute("3+3", ResultKind::Integer, deadline(), None).unwrap();
		assert_eq!(second, DecodedValue::Integer(6));
		assert_eq!(session.state(), ConnectionState::Connected);
	}

	/// A syntax error leaves the session `Connected` (and implicitly `Raw`),
	/// not `Faulted` — device-side errors are recoverable (§4.8, P1/P5).
	#[test]
	pub fn execute_recovers_to_connected_after_a_device_side_error() {
		let reply = b"OK\x04Traceback (most recent call last):\r\n  File \"<stdin>\", line 1\r\n    1=\r\n    ^\r\nSyntaxError: invalid syntax\r\n\x04>";
		let transport = MockTransport::new(vec![reply.to_vec()]);
		let session = Session::new_connected_for_testing(Box::new(transport), SendMode::Classic, SessionConfig::default());
		let result = session.execute("1=", ResultKind::RawString, deadline(), None);
		assert!(matches!(result, Err(DeviceError::Syntax { .. })));
		assert_eq!(session.state(), ConnectionState::Connected);
	}
}
