//! Bit-exact constants for the device-facing wire protocol (§6).

use std::fmt::{Display, Formatter, Result as FmtResult};

/// A single control byte the host sends to steer the device's REPL state
/// machine.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum ControlByte {
	/// `Ctrl-A` (0x01) — enter raw REPL.
	EnterRawRepl,
	/// `Ctrl-B` (0x02) — exit raw REPL back to the friendly prompt.
	ExitRawRepl,
	/// `Ctrl-C` (0x03) — interrupt whatever is currently running.
	Interrupt,
	/// `Ctrl-D` (0x04) — soft-reboot / execute-and-terminate / frame
	/// delimiter, depending on submode.
	FrameDelimiter,
	/// `Ctrl-E` (0x05) — the first byte of a raw-paste mode request.
	RequestRawPaste,
}

impl From<ControlByte> for u8 {
	fn from(value: ControlByte) -> Self {
		match value {
			ControlByte::EnterRawRepl => 0x01,
			ControlByte::ExitRawRepl => 0x02,
			ControlByte::Interrupt => 0x03,
			ControlByte::FrameDelimiter => 0x04,
			ControlByte::RequestRawPaste => 0x05,
		}
	}
}

impl Display for ControlByte {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		match *self {
			Self::EnterRawRepl => write!(fmt, "Ctrl-A(0x01)"),
			Self::ExitRawRepl => write!(fmt, "Ctrl-B(0x02)"),
			Self::Interrupt => write!(fmt, "Ctrl-C(0x03)"),
			Self::FrameDelimiter => write!(fmt, "Ctrl-D(0x04)"),
			Self::RequestRawPaste => write!(fmt, "Ctrl-E(0x05)"),
		}
	}
}

/// The sentinel the device prints on entering raw REPL.
pub const RAW_PROMPT_SENTINEL: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";
/// The sentinel the device prints on returning to the friendly prompt.
pub const FRIENDLY_PROMPT_SENTINEL: &[u8] = b"\r\n>>> ";
/// The four bytes that request raw-paste mode from within raw REPL.
pub const RAW_PASTE_REQUEST: &[u8] = b"\x05A\x01";
/// The control byte the device sends to replenish the paste window.
pub const WINDOW_REPLENISH: u8 = 0x01;
/// The control byte the device sends to abort an in-flight paste transfer.
pub const PASTE_ABORT: u8 = 0x04;
/// The byte that signals readiness for the next command, at the very end of
/// an execution reply.
pub const READY_PROMPT: u8 = b'>';
