//! `put_file`/`get_file` (§6, §11): a small file-transfer facility built
//! entirely out of `execute()` calls against a bootstrap script, rather
//! than a protocol extension of its own.

use crate::cancel::CancelToken;
use crate::decode::{DecodedValue, ResultKind};
use crate::errors::{DeviceError, ErrorContext};
use crate::session::Session;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::time::Instant;

/// How many raw bytes each base64-encoded chunk carries, per transfer
/// direction. Kept well under a typical raw-paste window so a single
/// chunk's wrapped `execute()` call never itself needs flow control beyond
/// what the engine already provides.
const CHUNK_SIZE: usize = 512;

/// Write `bytes` to `remote_path` on the device, base64-encoded in
/// [`CHUNK_SIZE`]-byte pieces, one `execute()` call per piece.
///
/// ## Errors
///
/// Any [`DeviceError`] a constituent `execute()` call raises (a device-side
/// `OSError` opening the path surfaces as [`DeviceError::Runtime`]).
pub fn put_file(
	session: &Session,
	remote_path: &str,
	bytes: &[u8],
	deadline: Instant,
	cancel: Option<&CancelToken>,
) -> Result<(), DeviceError> {
	run_statement(
		session,
		&format!("__mpy_repl_f = open({remote_path:?}, 'wb')"),
		deadline,
		cancel,
	)?;

	for chunk in bytes.chunks(CHUNK_SIZE) {
		let encoded = BASE64.encode(chunk);
		let code = format!("import ubinascii; __mpy_repl_f.write(ubinascii.a2b_base64({encoded:?}))");
		run_statement(session, &code, deadline, cancel)?;
	}

	run_statement(session, "__mpy_repl_f.close(); del __mpy_repl_f", deadline, cancel)?;
	Ok(())
}

/// Read the full contents of `remote_path` off the device, one
/// base64-decoded [`CHUNK_SIZE`]-byte `execute()` call at a time until a
/// short (or empty) chunk signals end-of-file.
///
/// ## Errors
///
/// Any [`DeviceError`] a constituent `execute()` call raises;
/// [`DeviceError::ProtocolViolation`] if a reply doesn't decode as base64.
pub fn get_file(
	session: &Session,
	remote_path: &str,
	deadline: Instant,
	cancel: Option<&CancelToken>,
) -> Result<Vec<u8>, DeviceError> {
	run_statement(
		session,
		&format!("__mpy_repl_f = open({remote_path:?}, 'rb')"),
		deadline,
		cancel,
	)?;

	let mut contents = Vec::new();
	loop {
		let code = format!(
			"import ubinascii; print(ubinascii.b2a_base64(__mpy_repl_f.read({CHUNK_SIZE})).decode().strip())"
		);
		let encoded = run_statement(session, &code, deadline, cancel)?;
		let chunk = BASE64.decode(encoded.as_bytes()).map_err(|cause| DeviceError::ProtocolViolation {
			expected: "base64-encoded file chunk".into(),
			observed: format!("{encoded:?} ({cause})"),
			context: ErrorContext::new("get_file"),
		})?;

		let is_last = chunk.len() < CHUNK_SIZE;
		contents.extend_from_slice(&chunk);
		if chunk.is_empty() || is_last {
			break;
		}
	}

	run_statement(session, "__mpy_repl_f.close(); del __mpy_repl_f", deadline, cancel)?;
	Ok(contents)
}

fn run_statement(
	session: &Session,
	code: &str,
	deadline: Instant,
	cancel: Option<&CancelToken>,
) -> Result<String, DeviceError> {
	match session.execute(code, ResultKind::RawString, deadline, cancel)? {
		DecodedValue::RawString(text) => Ok(text),
		other => unreachable!("ResultKind::RawString always decodes to DecodedValue::RawString, got {other:?}"),
	}
}
