//! Uniform error taxonomy shared by auth, client, pool, and gateway layers.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Symbolic error kind. Mirrors the state table in the error handling design:
/// most kinds carry a fixed HTTP-like `state`, `Http` carries whatever status
/// the remote server actually returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	ConfigInvalid,
	InvalidConnectionString,
	UnknownSource,
	AuthRefreshFailed,
	KeyLoadFailed,
	Http,
	InvalidJsonResponse,
	ConnectionError,
	NotFound,
	ValidationError,
	NotImplemented,
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::ConfigInvalid => "CONFIG_INVALID",
			Self::InvalidConnectionString => "INVALID_CONNECTION_STRING",
			Self::UnknownSource => "UNKNOWN_SOURCE",
			Self::AuthRefreshFailed => "AUTH_REFRESH_FAILED",
			Self::KeyLoadFailed => "KEY_LOAD_FAILED",
			Self::Http => "HTTP_ERROR",
			Self::InvalidJsonResponse => "INVALID_JSON_RESPONSE",
			Self::ConnectionError => "CONNECTION_ERROR",
			Self::NotFound => "NOT_FOUND",
			Self::ValidationError => "VALIDATION_ERROR",
			Self::NotImplemented => "NOT_IMPLEMENTED",
		};
		f.write_str(s)
	}
}

/// Numeric HTTP-like state, or `Unknown` when no code could be recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorState {
	Code(u16),
	Unknown,
}

impl fmt::Display for ErrorState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Code(c) => write!(f, "{c}"),
			Self::Unknown => f.write_str("UNKNOWN"),
		}
	}
}

/// Canonical gateway error: `{kind, state, message, cause}`.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct FHIRConnectionError {
	pub kind: ErrorKind,
	pub state: ErrorState,
	pub message: String,
	#[source]
	pub cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

pub type Result<T> = std::result::Result<T, FHIRConnectionError>;

impl FHIRConnectionError {
	fn new(kind: ErrorKind, state: ErrorState, message: impl Into<String>) -> Self {
		Self { kind, state, message: message.into(), cause: None }
	}

	pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
		self.cause = Some(Arc::new(cause));
		self
	}

	pub fn config_invalid(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::ConfigInvalid, ErrorState::Unknown, message)
	}

	pub fn invalid_connection_string(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::InvalidConnectionString, ErrorState::Code(500), message)
	}

	pub fn unknown_source(name: impl fmt::Display) -> Self {
		Self::new(ErrorKind::UnknownSource, ErrorState::Unknown, format!("unknown source `{name}`"))
	}

	pub fn auth_refresh_failed(state: ErrorState, message: impl Into<String>) -> Self {
		Self::new(ErrorKind::AuthRefreshFailed, state, message)
	}

	pub fn key_load_failed(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::KeyLoadFailed, ErrorState::Unknown, message)
	}

	pub fn invalid_json_response(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::InvalidJsonResponse, ErrorState::Unknown, message)
	}

	/// Fixed-state helper: an inbound/outbound resource fails schema validation (state 422).
	pub fn create_validation_error(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::ValidationError, ErrorState::Code(422), message)
	}

	/// Fixed-state helper: transport/network failure reaching the remote server (state 503).
	pub fn create_connection_error(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::ConnectionError, ErrorState::Code(503), message)
	}

	/// Fixed-state helper: authorization required but missing/invalid (state 401).
	pub fn create_authentication_error(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::AuthRefreshFailed, ErrorState::Code(401), message)
	}

	pub fn not_found(operation: &str, resource_type: &str, id: Option<&str>) -> Self {
		let target = target_string(resource_type, id);
		Self::new(
			ErrorKind::NotFound,
			ErrorState::Unknown,
			format!("{operation} {target} failed: resource does not exist"),
		)
	}

	pub fn not_implemented(message: impl Into<String>) -> Self {
		Self::new(ErrorKind::NotImplemented, ErrorState::Unknown, message)
	}

	/// Build an `HTTP_*` error from a known status code, per the state/template table.
	pub fn from_status(
		status: u16,
		operation: &str,
		resource_type: &str,
		id: Option<&str>,
		diagnostics: Option<&str>,
	) -> Self {
		let fragment = template_fragment(status).unwrap_or("request failed");
		let target = target_string(resource_type, id);
		let message = match diagnostics {
			Some(d) if !d.is_empty() => format!("{operation} {target} failed: {fragment} ({d})"),
			_ => format!("{operation} {target} failed: {fragment}"),
		};
		Self::new(ErrorKind::Http, ErrorState::Code(status), message)
	}

	/// Recover a known 3-digit status code embedded in a stringified exception message,
	/// per §4.E step 2 of the error mapper ("else parse the stringified exception for an
	/// embedded 3-digit code in the table").
	pub fn from_message(
		raw: &str,
		operation: &str,
		resource_type: &str,
		id: Option<&str>,
	) -> Self {
		for code in KNOWN_STATES {
			if raw.contains(&code.to_string()) {
				return Self::from_status(code, operation, resource_type, id, None);
			}
		}
		let target = target_string(resource_type, id);
		Self::new(
			ErrorKind::Http,
			ErrorState::Unknown,
			format!("{operation} {target} failed: {raw}"),
		)
	}
}

const KNOWN_STATES: [u16; 9] = [400, 401, 403, 404, 405, 409, 410, 412, 422];

fn template_fragment(status: u16) -> Option<&'static str> {
	match status {
		400 => Some("parsed/validated poorly, or multiple conditional matches"),
		401 => Some("authorization required"),
		403 => Some("permission denied"),
		404 => Some("does not exist"),
		405 => Some("server rejects client-defined ids"),
		409 => Some("version conflict on update"),
		410 => Some("gone"),
		412 => Some("version-id mismatch"),
		422 => Some("violates profile/business rules"),
		_ => None,
	}
}

fn target_string(resource_type: &str, id: Option<&str>) -> String {
	match id {
		Some(id) => format!("{resource_type}/{id}"),
		None => resource_type.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn from_status_known_table() {
		let err = FHIRConnectionError::from_status(404, "read", "Patient", Some("123"), None);
		assert_eq!(err.state, ErrorState::Code(404));
		assert!(err.message.contains("read Patient/123 failed"));
		assert!(err.message.contains("does not exist"));
	}

	#[test]
	fn from_status_unknown_falls_back_to_unknown_state() {
		let err = FHIRConnectionError::from_status(418, "read", "Patient", Some("123"), None);
		assert_eq!(err.state, ErrorState::Code(418));
		assert!(err.message.contains("request failed"));
	}

	#[test]
	fn from_message_recovers_embedded_code() {
		let err = FHIRConnectionError::from_message(
			"server responded with 409 Conflict",
			"update",
			"Patient",
			Some("1"),
		);
		assert_eq!(err.state, ErrorState::Code(409));
	}

	#[test]
	fn from_message_without_known_code_is_unknown() {
		let err = FHIRConnectionError::from_message("boom", "update", "Patient", Some("1"));
		assert_eq!(err.state, ErrorState::Unknown);
	}
}
