//! Blocking counterpart of [`super::token::OAuth2TokenManager`], for the sync gateway/client.
//! Refresh serialization uses a `std::sync::Mutex` (process-level) instead of a
//! `tokio::sync::Mutex`; the double-checked refresh logic is otherwise identical.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use super::config::{AuthConfig, ClientSecret};
use super::token::TokenInfo;
use crate::error::{ErrorState, FHIRConnectionError, Result};

#[derive(Clone)]
pub struct SyncOAuth2TokenManager {
	inner: Arc<Inner>,
}

struct Inner {
	http: reqwest::blocking::Client,
	config: AuthConfig,
	refresh_buffer_seconds: i64,
	token: Mutex<Option<TokenInfo>>,
}

impl SyncOAuth2TokenManager {
	#[must_use]
	pub fn new(config: AuthConfig) -> Self {
		Self::with_refresh_buffer(config, super::token::DEFAULT_REFRESH_BUFFER_SECONDS)
	}

	#[must_use]
	pub fn with_refresh_buffer(config: AuthConfig, refresh_buffer_seconds: i64) -> Self {
		let http = reqwest::blocking::Client::builder()
			.timeout(Duration::from_secs(config.timeout))
			.danger_accept_invalid_certs(!config.verify_tls)
			.build()
			.expect("reqwest client configuration is always valid here");
		Self {
			inner: Arc::new(Inner { http, config, refresh_buffer_seconds, token: Mutex::new(None) }),
		}
	}

	pub fn get_access_token(&self) -> Result<String> {
		let mut guard = self.inner.token.lock().expect("token mutex poisoned");
		let needs_refresh = match guard.as_ref() {
			Some(token) => token.is_expired(self.inner.refresh_buffer_seconds),
			None => true,
		};
		if needs_refresh {
			*guard = Some(self.refresh()?);
		}
		Ok(guard.as_ref().expect("just set above").access_token.clone())
	}

	pub fn invalidate_token(&self) {
		*self.inner.token.lock().expect("token mutex poisoned") = None;
	}

	fn refresh(&self) -> Result<TokenInfo> {
		let config = &self.inner.config;
		if config.use_jwt_assertion {
			return Err(FHIRConnectionError::config_invalid(
				"JWT client-assertion is only supported by the async token manager",
			));
		}
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
		let mut form: Vec<(&str, String)> =
			vec![("grant_type", "client_credentials".to_string()), ("client_id", client_id), ("client_secret", secret)];
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

		let response = self.inner.http.post(&token_url).form(&form).send().map_err(|e| {
			FHIRConnectionError::auth_refresh_failed(ErrorState::Unknown, e.to_string()).with_cause(e)
		})?;
		let status = response.status();
		if !status.is_success() {
			let body = response.text().unwrap_or_default();
			let snippet: String = body.chars().take(500).collect();
			return Err(FHIRConnectionError::auth_refresh_failed(
				ErrorState::Code(status.as_u16()),
				format!("failed to refresh token: {status} {snippet}"),
			));
		}
		let response_data: super::token::TokenResponse = response
			.json()
			.map_err(|e| FHIRConnectionError::invalid_json_response(e.to_string()).with_cause(e))?;
		Ok(TokenInfo::from_response(response_data, Utc::now()))
	}
}
