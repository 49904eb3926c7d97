//! The error type surfaced by the Raw REPL protocol engine.
//!
//! All error paths in the engine are values, not panics: timeouts,
//! cancellation, and device-side tracebacks are ordinary [`DeviceError`]
//! variants rather than exceptions used for control flow.

use crate::mode::ReplSubmode;
use miette::Diagnostic;
use std::time::Instant;
use thiserror::Error;

/// Free-form diagnostic context every surfaced [`DeviceError`] carries.
///
/// Upper layers (a method-interception proxy, a file-transfer call) can push
/// additional `(key, value)` pairs onto `extra` without needing a new
/// [`DeviceError`] variant — this is the "Upper layers may add keys ...
/// without modifying the variant" escape hatch the protocol spec calls for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorContext {
	/// Which step of the protocol we were in (`"mode_driver"`,
	/// `"send_code"`, `"read_stdout"`, `"read_stderr"`, ...).
	pub phase: String,
	/// The submode the session was in before the failing operation started.
	pub submode_before: ReplSubmode,
	/// The submode the session ended up in once the failure was handled.
	pub submode_after: ReplSubmode,
	/// How many bytes were still sitting unread in the line buffer when the
	/// error was raised.
	pub bytes_pending_in_buffer: usize,
	/// Wall-clock time spent on the operation that failed, in milliseconds.
	pub elapsed_ms: u64,
	/// Additional caller-supplied key/value pairs (e.g. a proxy-method name).
	pub extra: Vec<(&'static str, String)>,
}

impl ErrorContext {
	#[must_use]
	pub fn new(phase: impl Into<String>) -> Self {
		Self {
			phase: phase.into(),
			..Self::default()
		}
	}

	#[must_use]
	pub fn with_submodes(mut self, before: ReplSubmode, after: ReplSubmode) -> Self {
		self.submode_before = before;
		self.submode_after = after;
		self
	}

	#[must_use]
	pub fn with_buffer_pending(mut self, bytes: usize) -> Self {
		self.bytes_pending_in_buffer = bytes;
		self
	}

	#[must_use]
	pub fn with_elapsed_since(mut self, started: Instant) -> Self {
		self.elapsed_ms = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
		self
	}

	/// Append a diagnostic key/value without replacing the variant this
	/// context is attached to.
	pub fn push(&mut self, key: &'static str, value: impl Into<String>) {
		self.extra.push((key, value.into()));
	}
}

/// Every way the Raw REPL engine can fail to run a fragment of code to
/// completion.
///
/// Variants are strictly disjoint (§3, §7 of the design this implements):
/// a device-emitted traceback is always [`Self::Syntax`] or [`Self::Runtime`],
/// never both; a blocking step that overran its deadline is always
/// [`Self::Timeout`], never folded into [`Self::ProtocolViolation`].
#[derive(Error, Diagnostic, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
	/// The device rejected the code before running it: `SyntaxError`,
	/// `IndentationError`, or `TabError`.
	#[error("syntax error: {message}")]
	#[diagnostic(code(mpy_repl::syntax))]
	Syntax {
		message: String,
		/// The `File "<stdin>", line N` excerpt pulled from the traceback,
		/// if the device included one.
		code_excerpt: Option<String>,
		context: ErrorContext,
	},
	/// Code ran and raised any exception other than the syntax-class ones
	/// above.
	#[error("{exception_class}: {message}")]
	#[diagnostic(code(mpy_repl::runtime))]
	Runtime {
		exception_class: String,
		message: String,
		device_traceback: String,
		context: ErrorContext,
	},
	/// A blocking step did not complete before its deadline.
	#[error("timed out waiting for the device during phase \"{phase}\"")]
	#[diagnostic(code(mpy_repl::timeout))]
	Timeout { phase: String },
	/// The transport (serial port or subprocess pipe) failed outright.
	#[error("transport error: {message}")]
	#[diagnostic(code(mpy_repl::transport))]
	Transport { message: String },
	/// The device sent bytes that don't fit any sentinel or framing rule we
	/// know about.
	#[error("protocol violation: expected {expected}, observed {observed}")]
	#[diagnostic(code(mpy_repl::protocol_violation))]
	ProtocolViolation {
		expected: String,
		/// A bounded, lossily-decoded tail of whatever the device actually
		/// sent, for diagnostics.
		observed: String,
		context: ErrorContext,
	},
	/// A caller-supplied cancel signal fired before the engine reached a
	/// point where completion was already guaranteed.
	#[error("execution was cancelled")]
	#[diagnostic(code(mpy_repl::interrupted))]
	Interrupted { context: ErrorContext },
	/// The session is not connected (or lost its connection) when the
	/// caller tried to use it.
	#[error("not connected to a device")]
	#[diagnostic(code(mpy_repl::disconnected))]
	Disconnected,
	/// A configured `Busy` session refused an `execute` call because
	/// another execution already held the guard.
	#[error("session is busy with another execution")]
	#[diagnostic(code(mpy_repl::busy))]
	Busy,
}

const SYNTAX_CLASS_NAMES: [&str; 3] = ["SyntaxError", "IndentationError", "TabError"];

impl DeviceError {
	pub(crate) fn transport(message: impl Into<String>) -> Self {
		Self::Transport {
			message: message.into(),
		}
	}

	/// Classify a device traceback captured in an execution's stderr frame
	/// (§4.7). `stderr` is always non-empty when this is called — an empty
	/// stderr frame means the execution succeeded and never reaches here.
	#[must_use]
	pub fn from_device_traceback(stderr: &[u8], context: ErrorContext) -> Self {
		let text = String::from_utf8_lossy(stderr).into_owned();
		let last_line = text.lines().rev().find(|line| !line.trim().is_empty());

		let Some((class_name, message)) = last_line.and_then(split_class_and_message) else {
			return Self::Runtime {
				exception_class: "Unknown".into(),
				message: text.clone(),
				device_traceback: text,
				context,
			};
		};

		if SYNTAX_CLASS_NAMES.contains(&class_name.as_str()) {
			Self::Syntax {
				message,
				code_excerpt: extract_code_excerpt(&text),
				context,
			}
		} else {
			Self::Runtime {
				exception_class: class_name,
				message,
				device_traceback: text,
				context,
			}
		}
	}

	/// The diagnostic context attached to this error, if the variant carries
	/// one. [`Self::Timeout`], [`Self::Transport`], and [`Self::Disconnected`]
	/// are raised from places too close to the wire to have assembled a full
	/// [`ErrorContext`]; callers that need one should enrich at the point
	/// where the error is caught (see [`crate::session::Session::execute`]).
	#[must_use]
	pub fn context(&self) -> Option<&ErrorContext> {
		match self {
			Self::Syntax { context, .. }
			| Self::Runtime { context, .. }
			| Self::ProtocolViolation { context, .. }
			| Self::Interrupted { context } => Some(context),
			Self::Timeout { .. } | Self::Transport { .. } | Self::Disconnected | Self::Busy => None,
		}
	}

	/// Append a diagnostic key/value to this error's context, if it carries
	/// one. No-op for variants without one (see [`Self::context`]).
	pub fn push_context(&mut self, key: &'static str, value: impl Into<String>) {
		let context = match self {
			Self::Syntax { context, .. }
			| Self::Runtime { context, .. }
			| Self::ProtocolViolation { context, .. }
			| Self::Interrupted { context } => context,
			Self::Timeout { .. } | Self::Transport { .. } | Self::Disconnected | Self::Busy => return,
		};
		context.push(key, value);
	}
}

/// Split a traceback's last line into `(ExceptionClass, message)` on its
/// first colon, the way `repr(exc)` always renders. Lines with no colon
/// (stack frames, blank separators) don't match.
fn split_class_and_message(line: &str) -> Option<(String, String)> {
	let (class_name, message) = line.split_once(": ")?;
	if class_name.is_empty() || class_name.contains(char::is_whitespace) {
		return None;
	}
	Some((class_name.to_string(), message.to_string()))
}

/// Pull the `File "<stdin>", line N` excerpt out of a traceback, if present.
fn extract_code_excerpt(traceback: &str) -> Option<String> {
	traceback
		.lines()
		.find(|line| line.trim_start().starts_with("File \"<stdin>\""))
		.map(str::trim)
		.map(str::to_string)
}

#[cfg(test)]
mod unit_tests {
	use super::*;

	#[test]
	pub fn maps_syntax_error_traceback() {
		let stderr = b"Traceback (most recent call last):\r\n  File \"<stdin>\", line 1\r\n    1=\r\n    ^\r\nSyntaxError: invalid syntax\r\n";
		let error = DeviceError::from_device_traceback(stderr, ErrorContext::new("read_stderr"));
		assert!(matches!(
			error,
			DeviceError::Syntax { ref message, .. } if message == "invalid syntax"
		));
	}

	#[test]
	pub fn maps_runtime_error_traceback() {
		let stderr = b"Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\nValueError: bad\r\n";
		let error = DeviceError::from_device_traceback(stderr, ErrorContext::new("read_stderr"));
		match error {
			DeviceError::Runtime {
				exception_class, message, ..
			} => {
				assert_eq!(exception_class, "ValueError");
				assert_eq!(message, "bad");
			}
			other => panic!("expected Runtime, got {other:?}"),
		}
	}

	#[test]
	pub fn falls_back_to_unknown_runtime_when_no_line_matches() {
		let stderr = b"something went wrong without a class name\r\n";
		let error = DeviceError::from_device_traceback(stderr, ErrorContext::new("read_stderr"));
		assert!(matches!(
			error,
			DeviceError::Runtime { ref exception_class, .. } if exception_class == "Unknown"
		));
	}

	#[test]
	pub fn push_context_is_a_no_op_for_contextless_variants() {
		let mut error = DeviceError::Timeout {
			phase: "read_stdout".into(),
		};
		error.push_context("proxy_method", "blink");
		assert_eq!(error.context(), None);
	}

	#[test]
	pub fn push_context_appends_for_contextful_variants() {
		let mut error = DeviceError::Interrupted {
			context: ErrorContext::new("read_stderr"),
		};
		error.push_context("proxy_method", "blink");
		assert_eq!(
			error.context().unwrap().extra,
			vec![("proxy_method", "blink".to_string())]
		);
	}
}
