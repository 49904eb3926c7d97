//! `DeviceTask` (§9, §11): the explicit-descriptor replacement for the
//! out-of-scope reflection-based method-interception layer.
//!
//! A task is a name, a fixed parameter list, a code template with
//! positional holes (`{0}`, `{1}`, ...), and the decode kind its template
//! is expected to print. There is no registry of live object methods and
//! no macro lowering a method call into one of these — callers build a
//! `DeviceTask` by hand and call [`DeviceTask::render_and_decode`].

use crate::cancel::CancelToken;
use crate::decode::{DecodedValue, ResultKind};
use crate::errors::{DeviceError, ErrorContext};
use crate::session::Session;
use std::time::Instant;

/// A pre-rendered device-executed operation, registered once (typically at
/// session construction) and invoked by filling in its positional holes.
#[derive(Clone, Debug)]
pub struct DeviceTask {
	name: String,
	parameter_names: Vec<String>,
	code_template: String,
	return_kind: ResultKind,
}

impl DeviceTask {
	#[must_use]
	pub fn new(
		name: impl Into<String>,
		parameter_names: Vec<String>,
		code_template: impl Into<String>,
		return_kind: ResultKind,
	) -> Self {
		Self {
			name: name.into(),
			parameter_names,
			code_template: code_template.into(),
			return_kind,
		}
	}

	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	#[must_use]
	pub fn parameter_names(&self) -> &[String] {
		&self.parameter_names
	}

	/// Substitute `args` into this task's `{0}`, `{1}`, ... holes.
	///
	/// ## Errors
	///
	/// [`DeviceError::ProtocolViolation`] if `args` doesn't have exactly as
	/// many entries as this task declares parameters.
	pub fn render(&self, args: &[&str]) -> Result<String, DeviceError> {
		if args.len() != self.parameter_names.len() {
			return Err(DeviceError::ProtocolViolation {
				expected: format!("{} argument(s) for task \"{}\"", self.parameter_names.len(), self.name),
				observed: format!("{} argument(s)", args.len()),
				context: ErrorContext::new("render_task"),
			});
		}

		let mut rendered = self.code_template.clone();
		for (index, value) in args.iter().enumerate() {
			rendered = rendered.replace(&format!("{{{index}}}"), value);
		}
		Ok(rendered)
	}

	/// Render this task's template with `args` and run it through
	/// `execute()`, decoding the result as this task's declared
	/// [`ResultKind`].
	///
	/// ## Errors
	///
	/// [`DeviceError::ProtocolViolation`] on an argument-count mismatch
	/// (see [`Self::render`]); any [`DeviceError`] `execute` itself raises
	/// otherwise.
	pub fn render_and_decode(
		&self,
		session: &Session,
		args: &[&str],
		deadline: Instant,
		cancel: Option<&CancelToken>,
	) -> Result<DecodedValue, DeviceError> {
		let code = self.render(args)?;
		session.execute(&code, self.return_kind, deadline, cancel)
	}
}
