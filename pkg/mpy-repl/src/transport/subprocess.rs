//! A transport backed by a locally spawned interpreter process, talked to
//! over its stdin/stdout pipes.
//!
//! `std::process::ChildStdout::read` has no notion of a deadline, so a
//! background thread drains it continuously into a channel; [`Transport::read`]
//! just becomes `recv_timeout` against that channel. This is the same shape
//! as a PTY/subprocess reader thread paired with an `mpsc` channel used
//! elsewhere in the wild for giving blocking child-process I/O a timeout.

use crate::errors::DeviceError;
use crate::transport::Transport;
use std::{
	io::{Read, Write},
	process::{Child, ChildStdin, Command, ExitStatus, Stdio},
	sync::mpsc::{self, Receiver, RecvTimeoutError},
	thread::JoinHandle,
	time::Instant,
};

enum ReaderEvent {
	Chunk(Vec<u8>),
	Eof,
	Error(String),
}

/// A spawned interpreter subprocess, exposed as a [`Transport`].
pub struct SubprocessTransport {
	child: Child,
	stdin: ChildStdin,
	events: Receiver<ReaderEvent>,
	reader_thread: Option<JoinHandle<()>>,
	eof_seen: bool,
	/// Bytes from a chunk that didn't fit in the caller's `buf` on the last
	/// `read`, held here so the next call hands them out before touching the
	/// channel again.
	pending: Vec<u8>,
}

impl SubprocessTransport {
	/// Spawn `executable` with `args`, wiring its stdio through pipes.
	///
	/// ## Errors
	///
	/// [`DeviceError::Transport`] if the OS cannot spawn the process or wire
	/// up its pipes.
	pub fn spawn(executable: &str, args: &[String]) -> Result<Self, DeviceError> {
		let mut child = Command::new(executable)
			.args(args)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.spawn()
			.map_err(|cause| {
				DeviceError::transport(format!("failed to spawn interpreter subprocess {executable}: {cause}"))
			})?;

		let stdin = child
			.stdin
			.take()
			.ok_or_else(|| DeviceError::transport("spawned subprocess has no stdin pipe"))?;
		let mut stdout = child
			.stdout
			.take()
			.ok_or_else(|| DeviceError::transport("spawned subprocess has no stdout pipe"))?;

		let (sender, events) = mpsc::channel();
		let reader_thread = std::thread::spawn(move || {
			let mut chunk = [0_u8; 4096];
			loop {
				match stdout.read(&mut chunk) {
					Ok(0) => {
						let _ = sender.send(ReaderEvent::Eof);
						return;
					}
					Ok(n) => {
						if sender.send(ReaderEvent::Chunk(chunk[..n].to_vec())).is_err() {
							return;
						}
					}
					Err(cause) => {
						let _ = sender.send(ReaderEvent::Error(cause.to_string()));
						return;
					}
				}
			}
		});

		Ok(Self {
			child,
			stdin,
			events,
			reader_thread: Some(reader_thread),
			eof_seen: false,
			pending: Vec::new(),
		})
	}

	/// The exit status of the child process, once it has actually exited.
	///
	/// ## Errors
	///
	/// [`DeviceError::Transport`] if querying the OS for the status fails.
	pub fn try_exit_status(&mut self) -> Result<Option<ExitStatus>, DeviceError> {
		self.child
			.try_wait()
			.map_err(|cause| DeviceError::transport(format!("failed to poll child status: {cause}")))
	}
}

impl Transport for SubprocessTransport {
	fn read(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize, DeviceError> {
		if !self.pending.is_empty() {
			let n = self.pending.len().min(buf.len());
			buf[..n].copy_from_slice(&self.pending[..n]);
			self.pending.drain(..n);
			return Ok(n);
		}

		if self.eof_seen {
			return Ok(0);
		}

		let remaining = deadline.saturating_duration_since(Instant::now());
		if remaining.is_zero() {
			return Err(DeviceError::Timeout {
				phase: "subprocess_read".into(),
			});
		}

		match self.events.recv_timeout(remaining) {
			Ok(ReaderEvent::Chunk(mut chunk)) => {
				let n = chunk.len().min(buf.len());
				buf[..n].copy_from_slice(&chunk[..n]);
				if chunk.len() > n {
					self.pending = chunk.split_off(n);
				}
				Ok(n)
			}
			Ok(ReaderEvent::Eof) => {
				self.eof_seen = true;
				Ok(0)
			}
			Ok(ReaderEvent::Error(message)) => Err(DeviceError::transport(format!(
				"subprocess stdout reader failed: {message}"
			))),
			Err(RecvTimeoutError::Timeout) => Err(DeviceError::Timeout {
				phase: "subprocess_read".into(),
			}),
			Err(RecvTimeoutError::Disconnected) => {
				self.eof_seen = true;
				match self.try_exit_status() {
					Ok(Some(_)) => Ok(0),
					_ => Err(DeviceError::transport("subprocess exited unexpectedly (child_exited)")),
				}
			}
		}
	}

	fn write_all(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
		self.stdin
			.write_all(bytes)
			.and_then(|()| self.stdin.flush())
			.map_err(|cause| DeviceError::transport(format!("subprocess stdin write failed: {cause}")))
	}

	fn drain_input(&mut self) -> Result<(), DeviceError> {
		self.pending.clear();
		while let Ok(event) = self.events.try_recv() {
			if matches!(event, ReaderEvent::Eof) {
				self.eof_seen = true;
				break;
			}
		}
		Ok(())
	}

	fn close(&mut self) -> Result<(), DeviceError> {
		let _ = self.child.kill();
		let _ = self.child.wait();
		if let Some(handle) = self.reader_thread.take() {
			let _ = handle.join();
		}
		Ok(())
	}
}

impl Drop for SubprocessTransport {
	fn drop(&mut self) {
		let _ = self.close();
	}
}

#[cfg(test)]
mod unit_tests {
	use super::*;
	use std::time::Duration;

	fn deadline() -> Instant {
		Instant::now() + Duration::from_secs(2)
	}

	// `cat` echoes stdin back on stdout unmodified, so it stands in for a
	// device that emits a single chunk bigger than the 512-byte slices the
	// line buffer reads through; regression test for the truncation bug
	// where a reader-thread chunk wider than the caller's `buf` lost its
	// tail instead of being queued for the next read.
	#[test]
	#[cfg(unix)]
	pub fn read_reassembles_a_chunk_wider_than_the_caller_buffer() {
		let mut transport = SubprocessTransport::spawn("cat", &[]).unwrap();
		let payload = vec![b'x'; 4096];
		transport.write_all(&payload).unwrap();

		let mut collected = Vec::new();
		let mut buf = [0_u8; 64];
		while collected.len() < payload.len() {
			let n = transport.read(&mut buf, deadline()).unwrap();
			assert_ne!(n, 0, "cat exited before echoing the full payload back");
			collected.extend_from_slice(&buf[..n]);
		}
		assert_eq!(collected, payload);
		transport.close().unwrap();
	}
}
