//! Thin wrapper around the OS APIs (unix) for talking to a serial port
//! synchronously.
//!
//! Adapted from a termios-based raw serial port implementation; trimmed down
//! to the subset of behavior the [`crate::transport::Transport`] contract
//! needs (open, read-with-timeout, write, drain, close). Line-signal control
//! (RTS/DTR/CTS/...) and port enumeration are not needed here and are left
//! out.

use crate::transport::serial::sys::DEFAULT_TIMEOUT_MS;
use libc::{O_NOCTTY, O_NONBLOCK};
use std::{
	fs::{File, OpenOptions},
	io::{Error as IoError, ErrorKind as IoErrorKind, Result as IoResult},
	os::{
		raw::c_short,
		unix::{fs::OpenOptionsExt, io::AsRawFd},
	},
	path::Path,
};

#[cfg(all(
	any(target_os = "android", target_os = "linux"),
	not(any(target_arch = "powerpc", target_arch = "powerpc64"))
))]
type RawTermios = libc::termios2;
#[cfg(not(all(
	any(target_os = "android", target_os = "linux"),
	not(any(target_arch = "powerpc", target_arch = "powerpc64"))
)))]
type RawTermios = libc::termios;

#[derive(Debug)]
pub struct RawSerialPort {
	fd: File,
	read_timeout_ms: u32,
}

impl RawSerialPort {
	/// Open and configure a serial port for 8N1 raw I/O at `baud`.
	///
	/// ## Errors
	///
	/// If we cannot open the device node, or cannot put it into raw mode at
	/// the requested baud rate.
	pub fn open(path: impl AsRef<Path>, baud: u32) -> IoResult<Self> {
		let fd = OpenOptions::new()
			.read(true)
			.write(true)
			.create(false)
			.custom_flags(O_NONBLOCK | O_NOCTTY)
			.open(path)?;

		let mut termios = Self::get_termios(&fd)?;
		Self::set_baud_rate(&mut termios, baud)?;
		unsafe { libc::cfmakeraw(&mut termios) };
		termios.c_cflag |= libc::CLOCAL | libc::CREAD;
		Self::set_termios(&fd, &termios)?;

		Ok(Self {
			fd,
			read_timeout_ms: DEFAULT_TIMEOUT_MS,
		})
	}

	pub fn set_read_timeout_ms(&mut self, timeout_ms: u32) {
		self.read_timeout_ms = timeout_ms;
	}

	/// Read whatever is available, blocking up to the configured read
	/// timeout for the first byte to arrive.
	///
	/// ## Errors
	///
	/// [`std::io::ErrorKind::TimedOut`] if nothing arrived in time, or any
	/// other error the OS reports.
	#[allow(clippy::cast_sign_loss)]
	pub fn read(&self, buf: &mut [u8]) -> IoResult<usize> {
		if !Self::poll(&self.fd, libc::POLLIN, self.read_timeout_ms)? {
			return Err(IoErrorKind::TimedOut.into());
		}

		loop {
			match unsafe {
				Self::check_isize(libc::read(
					self.fd.as_raw_fd(),
					buf.as_mut_ptr().cast(),
					buf.len(),
				))
			} {
				Ok(size) => return Ok(size as usize),
				Err(cause) => {
					if cause.raw_os_error() == Some(libc::EINTR) {
						continue;
					}
					return Err(cause);
				}
			}
		}
	}

	/// Write the whole buffer, blocking until the OS accepts every byte.
	///
	/// ## Errors
	///
	/// If the OS reports an error (including a broken pipe on the far end).
	pub fn write_all(&self, mut buf: &[u8]) -> IoResult<()> {
		while !buf.is_empty() {
			if !Self::poll(&self.fd, libc::POLLOUT, DEFAULT_TIMEOUT_MS)? {
				return Err(IoErrorKind::TimedOut.into());
			}
			match unsafe {
				Self::check_isize(libc::write(
					self.fd.as_raw_fd(),
					buf.as_ptr().cast(),
					buf.len(),
				))
			} {
				Ok(0) => return Err(IoErrorKind::WriteZero.into()),
				Ok(n) => buf = &buf[n as usize..],
				Err(cause) => {
					if cause.raw_os_error() == Some(libc::EINTR) {
						continue;
					}
					return Err(cause);
				}
			}
		}
		Ok(())
	}

	/// Discard anything currently sitting in the kernel input buffer without
	/// blocking.
	///
	/// ## Errors
	///
	/// If `tcflush` reports an OS error.
	pub fn drain_input(&self) -> IoResult<()> {
		unsafe { Self::check(libc::tcflush(self.fd.as_raw_fd(), libc::TCIFLUSH))? };
		Ok(())
	}

	fn poll(fd: &File, events: c_short, timeout_ms: u32) -> IoResult<bool> {
		let mut poll_fd = libc::pollfd {
			fd: fd.as_raw_fd(),
			events,
			revents: 0,
		};
		unsafe { Self::check(libc::poll(&mut poll_fd, 1, timeout_ms as i32))? };
		Ok(poll_fd.revents != 0)
	}

	fn get_termios(fd: &File) -> IoResult<RawTermios> {
		#[cfg(all(
			any(target_os = "android", target_os = "linux"),
			not(any(target_arch = "powerpc", target_arch = "powerpc64"))
		))]
		unsafe {
			let mut termios = std::mem::zeroed();
			Self::check(libc::ioctl(fd.as_raw_fd(), libc::TCGETS2 as _, &mut termios))?;
			Ok(termios)
		}

		#[cfg(not(all(
			any(target_os = "android", target_os = "linux"),
			not(any(target_arch = "powerpc", target_arch = "powerpc64"))
		)))]
		unsafe {
			let mut termios = std::mem::zeroed();
			Self::check(libc::tcgetattr(fd.as_raw_fd(), &mut termios))?;
			Ok(termios)
		}
	}

	fn set_termios(fd: &File, termios: &RawTermios) -> IoResult<()> {
		#[cfg(all(
			any(target_os = "android", target_os = "linux"),
			not(any(target_arch = "powerpc", target_arch = "powerpc64"))
		))]
		unsafe {
			Self::check(libc::ioctl(fd.as_raw_fd(), libc::TCSETSW2 as _, termios))?;
			Ok(())
		}

		#[cfg(not(all(
			any(target_os = "android", target_os = "linux"),
			not(any(target_arch = "powerpc", target_arch = "powerpc64"))
		)))]
		unsafe {
			Self::check(libc::tcsetattr(fd.as_raw_fd(), libc::TCSADRAIN, termios))?;
			Ok(())
		}
	}

	#[allow(clippy::unnecessary_wraps)]
	fn set_baud_rate(termios: &mut RawTermios, baud: u32) -> IoResult<()> {
		#[cfg(any(
			target_os = "dragonfly",
			target_os = "freebsd",
			target_os = "ios",
			target_os = "macos",
			target_os = "netbsd",
			target_os = "openbsd",
		))]
		unsafe {
			Self::check(libc::cfsetospeed(termios, baud as _))?;
			Self::check(libc::cfsetispeed(termios, baud as _))?;
			Ok(())
		}

		#[cfg(all(
			not(any(
				target_os = "dragonfly",
				target_os = "freebsd",
				target_os = "ios",
				target_os = "macos",
				target_os = "netbsd",
				target_os = "openbsd",
			)),
			any(target_os = "android", target_os = "linux"),
			not(any(target_arch = "powerpc", target_arch = "powerpc64"))
		))]
		{
			termios.c_cflag &= !(libc::CBAUD | libc::CIBAUD);
			termios.c_cflag |= libc::BOTHER;
			termios.c_cflag |= libc::BOTHER << libc::IBSHIFT;
			termios.c_ospeed = baud;
			termios.c_ispeed = baud;
			Ok(())
		}

		#[cfg(not(any(
			target_os = "dragonfly",
			target_os = "freebsd",
			target_os = "ios",
			target_os = "macos",
			target_os = "netbsd",
			target_os = "openbsd",
			target_os = "android",
			target_os = "linux",
		)))]
		unsafe {
			let _ = baud;
			Ok(())
		}
	}

	fn check(ret: i32) -> IoResult<i32> {
		if ret == -1 {
			Err(IoError::last_os_error())
		} else {
			Ok(ret)
		}
	}

	fn check_isize(ret: isize) -> IoResult<isize> {
		if ret == -1 {
			Err(IoError::last_os_error())
		} else {
			Ok(ret)
		}
	}
}
