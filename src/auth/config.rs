//! [`AuthConfig`]: validated, immutable-after-construction auth + transport settings for one
//! FHIR source.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{FHIRConnectionError, Result};

pub const DEFAULT_SCOPE: &str = "system/*.read system/*.write";
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Either a literal shared secret or a path to a PEM private key used for JWT
/// client-assertion signing. Exactly one of these backs `AuthConfig.client_secret`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientSecret {
	Value(String),
	Path(String),
}

/// Authentication and transport configuration for one configured FHIR source.
///
/// Built via [`AuthConfigBuilder`], from a connection string
/// ([`crate::auth::connection_string::parse`]), or from environment variables
/// ([`crate::auth::connection_string::from_env`]). Validated at construction time per the
/// invariants below; once built, a value is never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
	pub base_url: Url,
	pub timeout: u64,
	pub verify_tls: bool,

	pub client_id: Option<String>,
	pub client_secret: Option<ClientSecret>,
	pub token_url: Option<String>,
	pub scope: Option<String>,
	pub audience: Option<String>,
	pub use_jwt_assertion: bool,
	pub key_id: Option<String>,
}

impl AuthConfig {
	/// A source requires auth iff any auth-related field is set.
	#[must_use]
	pub fn requires_auth(&self) -> bool {
		self.client_id.is_some()
			|| self.client_secret.is_some()
			|| self.token_url.is_some()
			|| self.scope.is_some()
			|| self.audience.is_some()
			|| self.use_jwt_assertion
			|| self.key_id.is_some()
	}

	pub fn builder() -> AuthConfigBuilder {
		AuthConfigBuilder::default()
	}

	fn validate(&self) -> Result<()> {
		if !self.requires_auth() {
			return Ok(());
		}
		if self.client_id.is_none() {
			return Err(FHIRConnectionError::config_invalid("client_id is required when auth is configured"));
		}
		if self.token_url.is_none() {
			return Err(FHIRConnectionError::config_invalid("token_url is required when auth is configured"));
		}
		match &self.client_secret {
			None => {
				return Err(FHIRConnectionError::config_invalid(
					"exactly one of client_secret or client_secret_path is required",
				))
			}
			Some(ClientSecret::Value(_)) if self.use_jwt_assertion => {
				return Err(FHIRConnectionError::config_invalid(
					"use_jwt_assertion requires client_secret_path, not client_secret",
				))
			}
			Some(_) => {}
		}
		Ok(())
	}
}

impl fmt::Display for ClientSecret {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		// Never print the secret value itself.
		match self {
			Self::Value(_) => f.write_str("<secret>"),
			Self::Path(path) => write!(f, "<path:{path}>"),
		}
	}
}

/// Fallible builder for [`AuthConfig`]. Mirrors the client builder pattern used throughout
/// this crate: every setter is infallible, `build()` performs the §3 invariant checks once.
#[derive(Debug, Clone, Default)]
pub struct AuthConfigBuilder {
	base_url: Option<Url>,
	timeout: Option<u64>,
	verify_tls: Option<bool>,
	client_id: Option<String>,
	client_secret: Option<ClientSecret>,
	token_url: Option<String>,
	scope: Option<String>,
	audience: Option<String>,
	use_jwt_assertion: bool,
	key_id: Option<String>,
}

impl AuthConfigBuilder {
	pub fn base_url(mut self, base_url: Url) -> Self {
		self.base_url = Some(base_url);
		self
	}

	pub fn timeout(mut self, timeout: u64) -> Self {
		self.timeout = Some(timeout);
		self
	}

	pub fn verify_tls(mut self, verify_tls: bool) -> Self {
		self.verify_tls = Some(verify_tls);
		self
	}

	pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
		self.client_id = Some(client_id.into());
		self
	}

	pub fn client_secret(mut self, secret: impl Into<String>) -> Self {
		self.client_secret = Some(ClientSecret::Value(secret.into()));
		self
	}

	pub fn client_secret_path(mut self, path: impl Into<String>) -> Self {
		self.client_secret = Some(ClientSecret::Path(path.into()));
		self
	}

	pub fn token_url(mut self, token_url: impl Into<String>) -> Self {
		self.token_url = Some(token_url.into());
		self
	}

	pub fn scope(mut self, scope: impl Into<String>) -> Self {
		self.scope = Some(scope.into());
		self
	}

	pub fn audience(mut self, audience: impl Into<String>) -> Self {
		self.audience = Some(audience.into());
		self
	}

	pub fn use_jwt_assertion(mut self, use_jwt_assertion: bool) -> Self {
		self.use_jwt_assertion = use_jwt_assertion;
		self
	}

	pub fn key_id(mut self, key_id: impl Into<String>) -> Self {
		self.key_id = Some(key_id.into());
		self
	}

	pub fn build(self) -> Result<AuthConfig> {
		let base_url =
			self.base_url.ok_or_else(|| FHIRConnectionError::config_invalid("base_url is required"))?;
		let config = AuthConfig {
			base_url,
			timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECONDS),
			verify_tls: self.verify_tls.unwrap_or(true),
			client_id: self.client_id,
			client_secret: self.client_secret,
			token_url: self.token_url,
			scope: self.scope,
			audience: self.audience,
			use_jwt_assertion: self.use_jwt_assertion,
			key_id: self.key_id,
		};
		config.validate()?;
		Ok(config)
	}
}
