//! Thin wrapper around the OS APIs (Windows) for talking to a serial port
//! synchronously.
//!
//! Adapted from an overlapped-I/O based serial port implementation; trimmed
//! to the subset [`crate::transport::Transport`] needs. We always pass
//! `FILE_FLAG_OVERLAPPED` (required to avoid pathological blocking on
//! `ReadFile`/`WriteFile`) and synchronously wait on the single operation in
//! flight with `GetOverlappedResult`.

use crate::transport::serial::sys::DEFAULT_TIMEOUT_MS;
use std::{
	fs::{File, OpenOptions},
	io::{Error as IoError, ErrorKind as IoErrorKind, Result as IoResult},
	os::windows::{fs::OpenOptionsExt, io::AsRawHandle},
	path::{Path, PathBuf},
};
use windows::Win32::{
	Devices::Communication::{
		PurgeComm, SetCommState, SetCommTimeouts, COMMTIMEOUTS, DCB, NOPARITY, ONESTOPBIT,
		PURGE_RXCLEAR, PURGE_TXCLEAR,
	},
	Foundation::{ERROR_IO_PENDING, HANDLE},
	Storage::FileSystem::{ReadFile, WriteFile, FILE_FLAG_OVERLAPPED},
	System::IO::{GetOverlappedResult, OVERLAPPED},
};

#[derive(Debug)]
pub struct RawSerialPort {
	fd: File,
	read_timeout_ms: u32,
}

impl RawSerialPort {
	/// Open and configure a serial port (by `COMn` name) for 8N1 raw I/O at
	/// `baud`.
	///
	/// ## Errors
	///
	/// If we cannot open the device, or cannot configure the comm state.
	#[allow(clippy::cast_possible_truncation)]
	pub fn open(path: impl AsRef<Path>, baud: u32) -> IoResult<Self> {
		let mut full_path = PathBuf::from(r"\\.");
		full_path.push(path);

		let fd = OpenOptions::new()
			.read(true)
			.write(true)
			.create(false)
			.custom_flags(FILE_FLAG_OVERLAPPED.0)
			.open(&full_path)?;

		let dcb = DCB {
			DCBlength: std::mem::size_of::<DCB>() as u32,
			BaudRate: baud,
			ByteSize: 8,
			Parity: NOPARITY,
			StopBits: ONESTOPBIT,
			..Default::default()
		};
		unsafe {
			SetCommState(Self::handle(&fd), &dcb).map_err(|_| IoError::last_os_error())?;
		}

		let this = Self {
			fd,
			read_timeout_ms: DEFAULT_TIMEOUT_MS,
		};
		this.apply_timeouts()?;
		Ok(this)
	}

	pub fn set_read_timeout_ms(&mut self, timeout_ms: u32) {
		self.read_timeout_ms = timeout_ms;
		let _ = self.apply_timeouts();
	}

	fn apply_timeouts(&self) -> IoResult<()> {
		let timeouts = COMMTIMEOUTS {
			ReadIntervalTimeout: u32::MAX,
			ReadTotalTimeoutMultiplier: u32::MAX,
			ReadTotalTimeoutConstant: self.read_timeout_ms,
			WriteTotalTimeoutMultiplier: 0,
			WriteTotalTimeoutConstant: DEFAULT_TIMEOUT_MS,
		};
		unsafe {
			SetCommTimeouts(Self::handle(&self.fd), &timeouts)
				.map_err(|_| IoError::last_os_error())?;
		}
		Ok(())
	}

	/// Read whatever is available, blocking up to the configured read
	/// timeout for the first byte to arrive.
	///
	/// ## Errors
	///
	/// [`std::io::ErrorKind::TimedOut`] if nothing arrived in time, or any
	/// other error the OS reports.
	#[allow(clippy::cast_possible_wrap)]
	pub fn read(&self, buf: &mut [u8]) -> IoResult<usize> {
		let mut read_bytes = 0_u32;
		let mut overlapped = Self::new_overlapped()?;

		match unsafe {
			ReadFile(
				Self::handle(&self.fd),
				Some(buf),
				Some(&mut read_bytes),
				Some(&mut overlapped),
			)
		} {
			Ok(()) => {
				if read_bytes == 0 {
					Err(IoErrorKind::TimedOut.into())
				} else {
					Ok(read_bytes as usize)
				}
			}
			Err(cause) if cause.code().0 as u32 == ERROR_IO_PENDING.0 => {
				Self::wait_overlapped(&self.fd, &mut overlapped)
			}
			Err(_) => Err(IoError::last_os_error()),
		}
	}

	/// Write the whole buffer, blocking until the OS accepts every byte.
	///
	/// ## Errors
	///
	/// If the OS reports an error writing to the port.
	pub fn write_all(&self, buf: &[u8]) -> IoResult<()> {
		let mut written = 0_u32;
		let mut overlapped = Self::new_overlapped()?;

		match unsafe {
			WriteFile(
				Self::handle(&self.fd),
				Some(buf),
				Some(&mut written),
				Some(&mut overlapped),
			)
		} {
			Ok(()) => Ok(()),
			Err(cause) if cause.code().0 as u32 == ERROR_IO_PENDING.0 => {
				Self::wait_overlapped(&self.fd, &mut overlapped).map(|_| ())
			}
			Err(_) => Err(IoError::last_os_error()),
		}
	}

	/// Discard anything currently sitting in the input buffer.
	///
	/// ## Errors
	///
	/// If `PurgeComm` reports an OS error.
	pub fn drain_input(&self) -> IoResult<()> {
		unsafe {
			PurgeComm(Self::handle(&self.fd), PURGE_RXCLEAR | PURGE_TXCLEAR)
				.map_err(|_| IoError::last_os_error())?;
		}
		Ok(())
	}

	fn handle(fd: &File) -> HANDLE {
		HANDLE(fd.as_raw_handle() as isize)
	}

	fn new_overlapped() -> IoResult<OVERLAPPED> {
		Ok(unsafe { std::mem::zeroed() })
	}

	#[allow(clippy::cast_possible_wrap)]
	fn wait_overlapped(fd: &File, overlapped: &mut OVERLAPPED) -> IoResult<usize> {
		let mut transferred = 0_u32;
		unsafe {
			GetOverlappedResult(Self::handle(fd), overlapped, &mut transferred, true)
				.map_err(|_| IoError::last_os_error())?;
		}
		Ok(transferred as usize)
	}
}
