//! The byte-oriented duplex channel the protocol engine drives.
//!
//! Two concrete transports exist: [`serial::SyncSerialPort`] for a real
//! board over a UART, and [`subprocess::SubprocessTransport`] for a locally
//! spawned interpreter (the `unix`/`micropython` binary, a CircuitPython
//! simulator, ...) wired through pipes. Both are reached only through the
//! narrow [`Transport`] trait the rest of the engine programs against.

pub mod serial;
pub mod subprocess;

use crate::errors::DeviceError;
use std::time::{Duration, Instant};

/// A blocking, byte-oriented duplex channel to a device.
///
/// Every method here is the full contract: nothing upstream reaches past
/// this trait to the OS.
pub trait Transport: Send {
	/// Read whatever bytes are available into `buf`, blocking until at
	/// least one byte has arrived or `deadline` passes.
	///
	/// Returns the number of bytes placed into `buf`, or `0` on a clean
	/// end-of-stream (the far end closed the channel).
	///
	/// ## Errors
	///
	/// [`DeviceError::Timeout`] if `deadline` passes with nothing read;
	/// [`DeviceError::Transport`] for any other I/O failure.
	fn read(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize, DeviceError>;

	/// Write every byte in `bytes`, blocking until the OS has accepted all
	/// of it.
	///
	/// ## Errors
	///
	/// [`DeviceError::Transport`] if the OS reports a failure (including a
	/// broken pipe).
	fn write_all(&mut self, bytes: &[u8]) -> Result<(), DeviceError>;

	/// Discard anything currently readable without blocking.
	///
	/// ## Errors
	///
	/// [`DeviceError::Transport`] if discarding fails at the OS level.
	fn drain_input(&mut self) -> Result<(), DeviceError>;

	/// Close the channel. Idempotent: calling this more than once must not
	/// error.
	///
	/// ## Errors
	///
	/// [`DeviceError::Transport`] if the OS reports a failure closing the
	/// channel.
	fn close(&mut self) -> Result<(), DeviceError>;
}

/// An immutable description of where to connect, parsed once at
/// construction time (§6: "The core consumes an already-parsed
/// `ConnectionEndpoint`").
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEndpoint {
	/// A serial port at a fixed line configuration.
	Serial {
		path: String,
		baud: u32,
		read_timeout: Duration,
		write_timeout: Duration,
	},
	/// A locally spawned interpreter process, talked to over its stdio
	/// pipes.
	Subprocess {
		executable: String,
		args: Vec<String>,
	},
}

impl ConnectionEndpoint {
	/// Open the transport this endpoint describes.
	///
	/// ## Errors
	///
	/// [`DeviceError::Transport`] if the OS cannot open the serial port or
	/// spawn the subprocess.
	pub fn open(&self) -> Result<Box<dyn Transport>, DeviceError> {
		match self {
			Self::Serial {
				path,
				baud,
				read_timeout,
				..
			} => {
				let mut port = serial::SyncSerialPort::open(path, *baud)?;
				port.set_read_timeout(*read_timeout);
				Ok(Box::new(port))
			}
			Self::Subprocess { executable, args } => {
				Ok(Box::new(subprocess::SubprocessTransport::spawn(executable, args)?))
			}
		}
	}
}

impl std::str::FromStr for ConnectionEndpoint {
	type Err = DeviceError;

	/// Parse the connection-string grammar from §6:
	/// `serial:<path>[@<baud>]` or `subprocess:<path-to-executable>
	/// [ <args...>]`.
	fn from_str(value: &str) -> Result<Self, Self::Err> {
		if let Some(rest) = value.strip_prefix("serial:") {
			let (path, baud) = match rest.rsplit_once('@') {
				Some((path, baud)) => (
					path,
					baud.parse::<u32>().map_err(|_| {
						DeviceError::transport(format!("invalid baud rate in connection string: {baud}"))
					})?,
				),
				None => (rest, 115_200),
			};
			if path.is_empty() {
				return Err(DeviceError::transport(
					"serial connection string is missing a device path",
				));
			}
			return Ok(Self::Serial {
				path: path.to_string(),
				baud,
				read_timeout: Duration::from_millis(3000),
				write_timeout: Duration::from_millis(3000),
			});
		}

		if let Some(rest) = value.strip_prefix("subprocess:") {
			let mut parts = rest.split_whitespace();
			let executable = parts
				.next()
				.ok_or_else(|| DeviceError::transport("subprocess connection string is missing an executable"))?
				.to_string();
			let args = parts.map(str::to_string).collect();
			return Ok(Self::Subprocess { executable, args });
		}

		Err(DeviceError::transport(format!(
			"connection string must start with \"serial:\" or \"subprocess:\", got: {value}"
		)))
	}
}

#[cfg(test)]
mod unit_tests {
	use super::*;

	#[test]
	pub fn parses_serial_with_explicit_baud() {
		let endpoint: ConnectionEndpoint = "serial:/dev/ttyACM0@9600".parse().unwrap();
		assert_eq!(
			endpoint,
			ConnectionEndpoint::Serial {
				path: "/dev/ttyACM0".into(),
				baud: 9600,
				read_timeout: Duration::from_millis(3000),
				write_timeout: Duration::from_millis(3000),
			}
		);
	}

	#[test]
	pub fn parses_serial_with_default_baud() {
		let endpoint: ConnectionEndpoint = "serial:/dev/ttyACM0".parse().unwrap();
		assert!(matches!(endpoint, ConnectionEndpoint::Serial { baud: 115_200, .. }));
	}

	#[test]
	pub fn parses_subprocess_with_args() {
		let endpoint: ConnectionEndpoint = "subprocess:/usr/bin/micropython -i".parse().unwrap();
		assert_eq!(
			endpoint,
			ConnectionEndpoint::Subprocess {
				executable: "/usr/bin/micropython".into(),
				args: vec!["-i".into()],
			}
		);
	}

	#[test]
	pub fn rejects_unknown_scheme() {
		assert!("telnet:localhost".parse::<ConnectionEndpoint>().is_err());
	}
}
