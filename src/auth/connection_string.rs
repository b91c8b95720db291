//! Bidirectional mapping between `fhir://…` connection strings and [`AuthConfig`], plus the
//! environment-variable loader.

use std::collections::BTreeMap;
use std::env;

use url::Url;

use super::config::{AuthConfig, ClientSecret, DEFAULT_SCOPE, DEFAULT_TIMEOUT_SECONDS};
use crate::error::{FHIRConnectionError, Result};

const SCHEME: &str = "fhir://";

/// Parse a `fhir://host[:port]/path?k=v&…` connection string into an [`AuthConfig`].
///
/// Presence of any auth-related query key triggers full authenticated validation; absence
/// yields a public-endpoint config holding only `base_url`/`timeout`/`verify_tls`.
pub fn parse(connection_string: &str) -> Result<AuthConfig> {
	if !connection_string.starts_with(SCHEME) {
		return Err(FHIRConnectionError::invalid_connection_string(format!(
			"connection string must start with `{SCHEME}`, got `{connection_string}`"
		)));
	}

	// Reparse through a generic `https://` scheme since `url` rejects unknown schemes with
	// query semantics we rely on; the real scheme never reaches the resulting base_url.
	let rewritten = format!("https://{}", &connection_string[SCHEME.len()..]);
	let parsed = Url::parse(&rewritten)
		.map_err(|e| FHIRConnectionError::invalid_connection_string(format!("malformed connection string: {e}")))?;

	let params: BTreeMap<String, String> = parsed.query_pairs().into_owned().collect();

	let netloc = parsed.host_str().ok_or_else(|| {
		FHIRConnectionError::invalid_connection_string("connection string is missing a hostname")
	})?;
	let netloc = match parsed.port() {
		Some(port) => format!("{netloc}:{port}"),
		None => netloc.to_string(),
	};
	let base_url_str = format!("https://{netloc}{}", parsed.path());
	let base_url = Url::parse(&base_url_str)
		.map_err(|e| FHIRConnectionError::invalid_connection_string(format!("invalid base_url: {e}")))?;

	let auth_keys = [
		"client_id",
		"client_secret",
		"client_secret_path",
		"token_url",
		"scope",
		"audience",
		"use_jwt_assertion",
		"key_id",
	];
	let has_auth = auth_keys.iter().any(|k| params.contains_key(*k));

	let known_keys: [&str; 10] = [
		"client_id",
		"client_secret",
		"client_secret_path",
		"token_url",
		"scope",
		"audience",
		"timeout",
		"verify_ssl",
		"use_jwt_assertion",
		"key_id",
	];
	for key in params.keys() {
		if !known_keys.contains(&key.as_str()) {
			tracing::debug!(key, "unknown connection-string parameter ignored");
		}
	}

	let timeout = match params.get("timeout") {
		Some(v) => v
			.parse()
			.map_err(|_| FHIRConnectionError::invalid_connection_string(format!("invalid timeout value `{v}`")))?,
		None => DEFAULT_TIMEOUT_SECONDS,
	};
	let verify_tls = parse_bool(params.get("verify_ssl"), true)?;

	let mut builder =
		AuthConfig::builder().base_url(base_url).timeout(timeout).verify_tls(verify_tls);

	if has_auth {
		if let Some(v) = params.get("client_id") {
			builder = builder.client_id(v.clone());
		}
		match (params.get("client_secret"), params.get("client_secret_path")) {
			(Some(_), Some(_)) => {
				return Err(FHIRConnectionError::config_invalid(
					"client_secret and client_secret_path are mutually exclusive",
				))
			}
			(Some(v), None) => builder = builder.client_secret(v.clone()),
			(None, Some(v)) => builder = builder.client_secret_path(v.clone()),
			(None, None) => {}
		}
		if let Some(v) = params.get("token_url") {
			builder = builder.token_url(v.clone());
		}
		builder = builder.scope(params.get("scope").cloned().unwrap_or_else(|| DEFAULT_SCOPE.to_string()));
		if let Some(v) = params.get("audience") {
			builder = builder.audience(v.clone());
		}
		builder = builder.use_jwt_assertion(parse_bool(params.get("use_jwt_assertion"), false)?);
		if let Some(v) = params.get("key_id") {
			builder = builder.key_id(v.clone());
		}
	}

	builder.build()
}

fn parse_bool(value: Option<&String>, default: bool) -> Result<bool> {
	match value {
		None => Ok(default),
		Some(v) => match v.to_ascii_lowercase().as_str() {
			"true" => Ok(true),
			"false" => Ok(false),
			_ => Err(FHIRConnectionError::invalid_connection_string(format!("invalid boolean value `{v}`"))),
		},
	}
}

/// Serialize an [`AuthConfig`] to a connection string that re-parses to an equivalent
/// config. Default-valued fields (`timeout=30`, `verify_ssl=true`, default `scope`) are
/// omitted to keep the string stable across builds.
#[must_use]
pub fn to_connection_string(config: &AuthConfig) -> String {
	let host_and_path = config
		.base_url
		.as_str()
		.strip_prefix("https://")
		.or_else(|| config.base_url.as_str().strip_prefix("http://"))
		.unwrap_or_else(|| config.base_url.as_str());
	let host_and_path = host_and_path.trim_end_matches('/');

	let mut params: Vec<(&str, String)> = Vec::new();
	if let Some(client_id) = &config.client_id {
		params.push(("client_id", client_id.clone()));
	}
	match &config.client_secret {
		Some(ClientSecret::Value(v)) => params.push(("client_secret", v.clone())),
		Some(ClientSecret::Path(p)) => params.push(("client_secret_path", p.clone())),
		None => {}
	}
	if let Some(token_url) = &config.token_url {
		params.push(("token_url", token_url.clone()));
	}
	if let Some(scope) = &config.scope {
		if scope != DEFAULT_SCOPE {
			params.push(("scope", scope.clone()));
		}
	}
	if let Some(audience) = &config.audience {
		params.push(("audience", audience.clone()));
	}
	if config.timeout != DEFAULT_TIMEOUT_SECONDS {
		params.push(("timeout", config.timeout.to_string()));
	}
	if !config.verify_tls {
		params.push(("verify_ssl", "false".to_string()));
	}
	if config.use_jwt_assertion {
		params.push(("use_jwt_assertion", "true".to_string()));
	}
	if let Some(key_id) = &config.key_id {
		params.push(("key_id", key_id.clone()));
	}

	if params.is_empty() {
		format!("fhir://{host_and_path}")
	} else {
		let query = url::form_urlencoded::Serializer::new(String::new())
			.extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())))
			.finish();
		format!("fhir://{host_and_path}?{query}")
	}
}

/// Load an [`AuthConfig`] from environment variables under prefix `P`: reads
/// `P_CLIENT_ID`, `P_BASE_URL`, `P_TOKEN_URL` (required if auth is intended), plus the
/// optional fields listed in the external-interfaces environment-variable table.
pub fn from_env(prefix: &str) -> Result<AuthConfig> {
	let var = |suffix: &str| env::var(format!("{prefix}_{suffix}"));

	let base_url_str = var("BASE_URL")
		.map_err(|_| FHIRConnectionError::config_invalid(format!("{prefix}_BASE_URL is required")))?;
	let base_url = Url::parse(&base_url_str)
		.map_err(|e| FHIRConnectionError::config_invalid(format!("invalid {prefix}_BASE_URL: {e}")))?;

	let client_id = var("CLIENT_ID").ok();
	let token_url = var("TOKEN_URL").ok();
	let client_secret = var("CLIENT_SECRET").ok();
	let client_secret_path = var("CLIENT_SECRET_PATH").ok();

	let has_auth = client_id.is_some()
		|| token_url.is_some()
		|| client_secret.is_some()
		|| client_secret_path.is_some();

	let timeout = match var("TIMEOUT") {
		Ok(v) => v
			.parse()
			.map_err(|_| FHIRConnectionError::config_invalid(format!("invalid {prefix}_TIMEOUT")))?,
		Err(_) => DEFAULT_TIMEOUT_SECONDS,
	};
	let verify_tls = match var("VERIFY_SSL") {
		Ok(v) => parse_bool(Some(&v), true)?,
		Err(_) => true,
	};

	let mut builder = AuthConfig::builder().base_url(base_url).timeout(timeout).verify_tls(verify_tls);

	if has_auth {
		if client_id.is_none() {
			return Err(FHIRConnectionError::config_invalid(format!("{prefix}_CLIENT_ID is required")));
		}
		if token_url.is_none() {
			return Err(FHIRConnectionError::config_invalid(format!("{prefix}_TOKEN_URL is required")));
		}
		builder = builder.client_id(client_id.unwrap()).token_url(token_url.unwrap());

		match (client_secret, client_secret_path) {
			(Some(_), Some(_)) => {
				return Err(FHIRConnectionError::config_invalid(
					"client_secret and client_secret_path are mutually exclusive",
				))
			}
			(Some(v), None) => builder = builder.client_secret(v),
			(None, Some(v)) => builder = builder.client_secret_path(v),
			(None, None) => {
				return Err(FHIRConnectionError::config_invalid(format!(
					"{prefix}_CLIENT_SECRET or {prefix}_CLIENT_SECRET_PATH is required"
				)))
			}
		}

		builder = builder.scope(var("SCOPE").unwrap_or_else(|_| DEFAULT_SCOPE.to_string()));
		if let Ok(v) = var("AUDIENCE") {
			builder = builder.audience(v);
		}
		if let Ok(v) = var("USE_JWT_ASSERTION") {
			builder = builder.use_jwt_assertion(parse_bool(Some(&v), false)?);
		}
		if let Ok(v) = var("KEY_ID") {
			builder = builder.key_id(v);
		}
	}

	builder.build()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_public_endpoint() {
		let config = parse("fhir://ex.org/R4").unwrap();
		assert!(!config.requires_auth());
		assert_eq!(config.base_url.as_str(), "https://ex.org/R4");
		assert_eq!(config.timeout, DEFAULT_TIMEOUT_SECONDS);
	}

	#[test]
	fn parses_authed_endpoint() {
		let config =
			parse("fhir://ex.org/R4?client_id=c&client_secret=x&token_url=https://ex.org/tok").unwrap();
		assert!(config.requires_auth());
		assert_eq!(config.client_id.as_deref(), Some("c"));
		assert_eq!(config.scope.as_deref(), Some(DEFAULT_SCOPE));
	}

	#[test]
	fn rejects_missing_scheme() {
		let err = parse("https://ex.org/R4").unwrap_err();
		assert!(err.message.contains("fhir://"));
	}

	#[test]
	fn round_trips_through_serialization() {
		let original =
			parse("fhir://ex.org/R4?client_id=c&client_secret=x&token_url=https://ex.org/tok&audience=aud")
				.unwrap();
		let serialized = to_connection_string(&original);
		let reparsed = parse(&serialized).unwrap();
		assert_eq!(original, reparsed);
	}

	#[test]
	fn round_trips_public_endpoint() {
		let original = parse("fhir://ex.org/R4").unwrap();
		let serialized = to_connection_string(&original);
		assert_eq!(serialized, "fhir://ex.org/R4");
		let reparsed = parse(&serialized).unwrap();
		assert_eq!(original, reparsed);
	}

	#[test]
	fn round_trips_non_default_timeout_and_verify() {
		let original =
			parse("fhir://ex.org/R4?client_id=c&client_secret=x&token_url=https://ex.org/tok&timeout=10&verify_ssl=false")
				.unwrap();
		let serialized = to_connection_string(&original);
		let reparsed = parse(&serialized).unwrap();
		assert_eq!(original, reparsed);
	}
}
