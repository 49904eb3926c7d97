//! Converts a captured stdout frame into a caller-requested value (§4.6).
//!
//! The decoder never looks at stderr: a non-empty stderr frame is always
//! routed to the error mapper before a decoder ever runs.

use crate::errors::{DeviceError, ErrorContext};
use serde_json::Value as JsonValue;

/// The scalar or structured shape a caller asked `execute` to decode stdout
/// into.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResultKind {
	RawString,
	Integer,
	Float,
	Boolean,
	Structured,
}

/// The decoded value of an execution whose stderr frame was empty.
#[derive(Clone, Debug, PartialEq)]
pub enum DecodedValue {
	RawString(String),
	Integer(i64),
	Float(f64),
	Boolean(bool),
	Structured(JsonValue),
}

impl ResultKind {
	/// Wrap `code` so the device emits the canonical textual encoding this
	/// kind expects, or leave it untouched for [`Self::RawString`].
	#[must_use]
	pub fn wrap_code(self, code: &str) -> String {
		match self {
			Self::RawString => code.to_string(),
			Self::Integer | Self::Float | Self::Boolean => format!("print(repr(({code})))"),
			Self::Structured => format!("import json; print(json.dumps({code}))"),
		}
	}
}

/// Decode a stdout frame per §4.6, stripping a single trailing `\r\n` first.
///
/// ## Errors
///
/// [`DeviceError::ProtocolViolation`] if `stdout` doesn't parse as `kind`
/// expects (an unparsable integer, a JSON document containing `NaN`/
/// `Infinity`, ...).
pub fn decode(kind: ResultKind, stdout: &[u8]) -> Result<DecodedValue, DeviceError> {
	let text = String::from_utf8_lossy(stdout);
	let trimmed = text.strip_suffix("\r\n").unwrap_or(&text);

	match kind {
		ResultKind::RawString => Ok(DecodedValue::RawString(trimmed.to_string())),
		ResultKind::Integer => trimmed
			.parse::<i64>()
			.map(DecodedValue::Integer)
			.map_err(|_| violation("integer", trimmed)),
		ResultKind::Float => trimmed
			.parse::<f64>()
			.map(DecodedValue::Float)
			.map_err(|_| violation("float", trimmed)),
		ResultKind::Boolean => match trimmed {
			"True" => Ok(DecodedValue::Boolean(true)),
			"False" => Ok(DecodedValue::Boolean(false)),
			other => Err(violation("boolean", other)),
		},
		ResultKind::Structured => {
			let value: JsonValue = serde_json::from_str(trimmed).map_err(|_| violation("structured", trimmed))?;
			if contains_non_finite_number(&value) {
				return Err(violation("structured (finite JSON numbers only)", trimmed));
			}
			Ok(DecodedValue::Structured(value))
		}
	}
}

fn violation(expected: &str, observed: &str) -> DeviceError {
	DeviceError::ProtocolViolation {
		expected: expected.to_string(),
		observed: observed.to_string(),
		context: ErrorContext::new("decode"),
	}
}

/// `serde_json` parses `NaN`/`Infinity` literals only through its
/// `arbitrary_precision`/non-standard extensions; guard anyway for any
/// numeric value that round-tripped through a non-finite `f64`.
fn contains_non_finite_number(value: &JsonValue) -> bool {
	match value {
		JsonValue::Number(n) => n.as_f64().is_some_and(|f| !f.is_finite()),
		JsonValue::Array(items) => items.iter().any(contains_non_finite_number),
		JsonValue::Object(map) => map.values().any(contains_non_finite_number),
		_ => false,
	}
}

#[cfg(test)]
mod unit_tests {
	use super::*;

	#[test]
	pub fn raw_string_strips_a_single_trailing_crlf() {
		let decoded = decode(ResultKind::RawString, b"hi\r\n").unwrap();
		assert_eq!(decoded, DecodedValue::RawString("hi".to_string()));
	}

	#[test]
	pub fn integer_parses_repr_output() {
		let decoded = decode(ResultKind::Integer, b"4\r\n").unwrap();
		assert_eq!(decoded, DecodedValue::Integer(4));
	}

	#[test]
	pub fn integer_rejects_unparsable_output() {
		let result = decode(ResultKind::Integer, b"not-a-number\r\n");
		assert!(matches!(result, Err(DeviceError::ProtocolViolation { .. })));
	}

	#[test]
	pub fn boolean_parses_python_capitalization() {
		assert_eq!(
			decode(ResultKind::Boolean, b"True\r\n").unwrap(),
			DecodedValue::Boolean(true)
		);
		assert_eq!(
			decode(ResultKind::Boolean, b"False\r\n").unwrap(),
			DecodedValue::Boolean(false)
		);
	}

	#[test]
	pub fn structured_parses_json_dumps_output() {
		let decoded = decode(ResultKind::Structured, b"{\"a\": 1}\r\n").unwrap();
		assert_eq!(decoded, DecodedValue::Structured(serde_json::json!({"a": 1})));
	}

	#[test]
	pub fn wrap_code_templates_match_requested_kind() {
		assert_eq!(ResultKind::Integer.wrap_code("1+1"), "print(repr((1+1)))");
		assert_eq!(
			ResultKind::Structured.wrap_code("get_status()"),
			"import json; print(json.dumps(get_status()))"
		);
		assert_eq!(ResultKind::RawString.wrap_code("print('hi')"), "print('hi')");
	}
}
