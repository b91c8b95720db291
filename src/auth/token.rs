//! Cached bearer token and the async OAuth2 client-credentials/JWT-assertion manager.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use super::config::{AuthConfig, ClientSecret};
use crate::error::{ErrorState, FHIRConnectionError, Result};

pub const DEFAULT_REFRESH_BUFFER_SECONDS: i64 = 300;

/// Cached bearer token, as returned by the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
	pub access_token: String,
	pub token_type: String,
	pub expires_in: u64,
	pub scope: Option<String>,
	pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
	access_token: String,
	#[serde(default = "default_token_type")]
	token_type: String,
	#[serde(default = "default_expires_in")]
	expires_in: u64,
	scope: Option<String>,
}

fn default_token_type() -> String {
	"Bearer".to_string()
}

fn default_expires_in() -> u64 {
	3600
}

impl TokenInfo {
	pub(crate) fn from_response(response: TokenResponse, now: DateTime<Utc>) -> Self {
		let expires_at = now + chrono::Duration::seconds(response.expires_in as i64);
		Self {
			access_token: response.access_token,
			token_type: response.token_type,
			expires_in: response.expires_in,
			scope: response.scope,
			expires_at,
		}
	}

	/// True if the token is already expired or will expire within `buffer_seconds`.
	#[must_use]
	pub fn is_expired(&self, buffer_seconds: i64) -> bool {
		Utc::now() + chrono::Duration::seconds(buffer_seconds) >= self.expires_at
	}
}

/// Manages OAuth2 client-credentials tokens with single-flight refresh.
///
/// Cloning shares the same underlying cache and lock: all clones observe the same token.
#[derive(Clone, Debug)]
pub struct OAuth2TokenManager {
	inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
	http: reqwest::Client,
	config: AuthConfig,
	refresh_buffer_seconds: i64,
	token: Mutex<Option<TokenInfo>>,
}

impl OAuth2TokenManager {
	#[must_use]
	pub fn new(config: AuthConfig) -> Self {
		Self::with_refresh_buffer(config, DEFAULT_REFRESH_BUFFER_SECONDS)
	}

	#[must_use]
	pub fn with_refresh_buffer(config: AuthConfig, refresh_buffer_seconds: i64) -> Self {
		let http = reqwest::Client::builder()
			.timeout(Duration::from_secs(config.timeout))
			.danger_accept_invalid_certs(!config.verify_tls)
			.build()
			.expect("reqwest client configuration is always valid here");
		Self {
			inner: Arc::new(Inner { http, config, refresh_buffer_seconds, token: Mutex::new(None) }),
		}
	}

	/// Return a valid access token, refreshing if necessary.
	///
	/// Holds the refresh lock for the whole check-then-refresh sequence: callers that block
	/// behind an in-flight refresh re-check the now-cached token instead of issuing a second
	/// request, which is what makes "exactly one POST per expiry cycle" hold under
	/// concurrency.
	pub async fn get_access_token(&self) -> Result<String> {
		let mut guard = self.inner.token.lock().await;
		let needs_refresh = match guard.as_ref() {
			Some(token) => token.is_expired(self.inner.refresh_buffer_seconds),
			None => true,
		};
		if needs_refresh {
			let refreshed = self.refresh(guard.as_ref()).await?;
			*guard = Some(refreshed);
		}
		Ok(guard.as_ref().expect("just set above").access_token.clone())
	}

	/// Clear the cached token, forcing the next call to refresh.
	pub async fn invalidate_token(&self) {
		*self.inner.token.lock().await = None;
	}

	async fn refresh(&self, previous: Option<&TokenInfo>) -> Result<TokenInfo> {
		let config = &self.inner.config;
		tracing::debug!(token_url = %config.token_url.as_deref().unwrap_or(""), "refreshing FHIR access token");

		let mut form: Vec<(&str, String)> = Vec::new();
		if config.use_jwt_assertion {
			let assertion = self.create_jwt_assertion()?;
			form.push(("grant_type", "client_credentials".to_string()));
			form.push((
				"client_assertion_type",
				"urn:ietf:params:oauth:client-assertion-type:jwt-bearer".to_string(),
			));
			form.push(("client_assertion", assertion));
		} else {
			let client_id = config
				.client_id
				.clone()
				.ok_or_else(|| FHIRConnectionError::config_invalid("client_id is required to refresh a token"))?;
			let secret = match &config.client_secret {
				Some(ClientSecret::Value(v)) => v.clone(),
				_ => {
					return Err(FHIRConnectionError::config_invalid(
						"client_secret is required for standard client-credentials refresh",
					))
				}
			};
			form.push(("grant_type", "client_credentials".to_string()));
			form.push(("client_id", client_id));
			form.push(("client_secret", secret));
		}
		if let Some(scope) = &config.scope {
			form.push(("scope", scope.clone()));
		}
		if let Some(audience) = &config.audience {
			form.push(("audience", audience.clone()));
		}

		let token_url = config
			.token_url
			.clone()
			.ok_or_else(|| FHIRConnectionError::config_invalid("token_url is required to refresh a token"))?;

		let response = self
			.inner
			.http
			.post(&token_url)
			.form(&form)
			.send()
			.await
			.map_err(|e| FHIRConnectionError::auth_refresh_failed(ErrorState::Unknown, e.to_string()).with_cause(e))?;

		let status = response.status();
		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();
			let snippet: String = body.chars().take(500).collect();
			tracing::error!(%status, body = %snippet, "token refresh failed");
			// Leave `previous` untouched: the caller only overwrites the cache with our
			// return value, and we return an error instead.
			let _ = previous;
			return Err(FHIRConnectionError::auth_refresh_failed(
				ErrorState::Code(status.as_u16()),
				format!("failed to refresh token: {status} {snippet}"),
			));
		}

		let response_data: TokenResponse = response
			.json()
			.await
			.map_err(|e| FHIRConnectionError::invalid_json_response(e.to_string()).with_cause(e))?;
		let token = TokenInfo::from_response(response_data, Utc::now());
		tracing::debug!(expires_at = %token.expires_at, "token refreshed successfully");
		Ok(token)
	}

	#[cfg(feature = "jwt-assertion")]
	fn create_jwt_assertion(&self) -> Result<String> {
		use jsonwebtoken::{Algorithm, EncodingKey, Header};
		use serde::Serialize;

		#[derive(Serialize)]
		struct Claims {
			iss: String,
			sub: String,
			aud: String,
			jti: String,
			iat: i64,
			exp: i64,
		}

		let config = &self.inner.config;
		let path = match &config.client_secret {
			Some(ClientSecret::Path(path)) => path,
			_ => {
				return Err(FHIRConnectionError::config_invalid(
					"use_jwt_assertion requires client_secret_path",
				))
			}
		};
		let pem = std::fs::read(path)
			.map_err(|e| FHIRConnectionError::key_load_failed(format!("failed to load private key from {path}: {e}")))?;
		let key = EncodingKey::from_rsa_pem(&pem)
			.map_err(|e| FHIRConnectionError::key_load_failed(format!("failed to parse private key from {path}: {e}")))?;

		let client_id = config
			.client_id
			.clone()
			.ok_or_else(|| FHIRConnectionError::config_invalid("client_id is required for JWT assertion"))?;
		let token_url = config
			.token_url
			.clone()
			.ok_or_else(|| FHIRConnectionError::config_invalid("token_url is required for JWT assertion"))?;

		let now = Utc::now();
		let claims = Claims {
			iss: client_id.clone(),
			sub: client_id,
			aud: token_url,
			jti: uuid::Uuid::new_v4().to_string(),
			iat: now.timestamp(),
			exp: (now + chrono::Duration::minutes(5)).timestamp(),
		};

		let mut header = Header::new(Algorithm::RS384);
		header.kid = config.key_id.clone();
		jsonwebtoken::encode(&header, &claims, &key)
			.map_err(|e| FHIRConnectionError::key_load_failed(format!("failed to sign JWT assertion: {e}")))
	}

	#[cfg(not(feature = "jwt-assertion"))]
	fn create_jwt_assertion(&self) -> Result<String> {
		Err(FHIRConnectionError::config_invalid(
			"use_jwt_assertion requires the `jwt-assertion` crate feature",
		))
	}
}
