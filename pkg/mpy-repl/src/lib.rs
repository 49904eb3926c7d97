//! A host-side driver for the MicroPython/CircuitPython Raw REPL protocol.
//!
//! This crate drives a device's interactive interpreter through its
//! `Friendly` → `Raw` → `RawPaste` submodes over a serial port or a locally
//! spawned interpreter subprocess, ships code across the framed,
//! flow-controlled raw-paste channel, demultiplexes the device's stdout and
//! stderr, and maps device-side tracebacks to structured [`errors::DeviceError`]
//! values.
//!
//! [`session::Session`] is the entry point: build a
//! [`transport::ConnectionEndpoint`], construct a `Session` around it, call
//! [`session::Session::connect`], then [`session::Session::execute`].
#![allow(
	// We import things elsewhere, usually outside of modules themselves.
	clippy::module_name_repetitions,
)]

pub mod buffer;
pub mod cancel;
pub mod decode;
pub mod engine;
pub mod errors;
pub mod fair_lock;
pub mod files;
pub mod mode;
pub mod paste;
pub mod session;
pub mod task;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub mod testing;

pub use cancel::CancelToken;
pub use decode::{DecodedValue, ResultKind};
pub use errors::DeviceError;
pub use mode::ReplSubmode;
pub use session::{AcquirePolicy, ConnectionState, Session, SessionConfig};
pub use transport::ConnectionEndpoint;
