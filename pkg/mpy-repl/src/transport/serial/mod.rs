//! A synchronous serial port, configured the way a MicroPython/CircuitPython
//! board expects it (8 data bits, no parity, 1 stop bit, no flow control).
//!
//! This interface began as a trim of a termios/overlapped-I/O based serial
//! port fork. See `sys/unix.rs` and `sys/windows.rs` for the per-OS raw
//! implementations.

mod sys;

use crate::errors::DeviceError;
use crate::transport::Transport;
use std::{
	io::ErrorKind as IoErrorKind,
	path::Path,
	time::{Duration, Instant},
};
use sys::RawSerialPort;

/// A serial port opened at a fixed line configuration.
#[derive(Debug)]
pub struct SyncSerialPort {
	inner: RawSerialPort,
}

impl SyncSerialPort {
	/// Open `path` (a TTY device on unix, a `COMn` name on Windows) at
	/// `baud`, 8N1, no flow control.
	///
	/// ## Errors
	///
	/// [`DeviceError::Transport`] if the OS refuses to open or configure the
	/// port.
	pub fn open(path: impl AsRef<Path>, baud: u32) -> Result<Self, DeviceError> {
		let inner = RawSerialPort::open(path.as_ref(), baud).map_err(|cause| {
			DeviceError::transport(format!(
				"failed to open serial port {}: {cause}",
				path.as_ref().display()
			))
		})?;
		Ok(Self { inner })
	}

	pub fn set_read_timeout(&mut self, timeout: Duration) {
		self.inner
			.set_read_timeout_ms(timeout.as_millis().try_into().unwrap_or(u32::MAX));
	}
}

impl Transport for SyncSerialPort {
	fn read(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize, DeviceError> {
		let remaining = deadline.saturating_duration_since(Instant::now());
		if remaining.is_zero() {
			return Err(DeviceError::Timeout {
				phase: "serial_read".into(),
			});
		}
		self.set_read_timeout(remaining);
		self.inner.read(buf).map_err(|cause| {
			if cause.kind() == IoErrorKind::TimedOut {
				DeviceError::Timeout {
					phase: "serial_read".into(),
				}
			} else {
				DeviceError::transport(format!("serial read failed: {cause}"))
			}
		})
	}

	fn write_all(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
		self.inner
			.write_all(bytes)
			.map_err(|cause| DeviceError::transport(format!("serial write failed: {cause}")))
	}

	fn drain_input(&mut self) -> Result<(), DeviceError> {
		self.inner
			.drain_input()
			.map_err(|cause| DeviceError::transport(format!("serial drain failed: {cause}")))
	}

	fn close(&mut self) -> Result<(), DeviceError> {
		// Dropping the underlying file/handle closes the port; nothing else
		// to flush, so this is a no-op that makes `close()` idempotent by
		// construction.
		Ok(())
	}
}
