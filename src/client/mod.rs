//! The typed single-server FHIR HTTP client surface (CRUD, search, transaction,
//! capabilities) plus its blocking counterpart.

pub mod sync;
mod type_registry;

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde_json::Value;

use crate::auth::{AuthConfig, OAuth2TokenManager};
use crate::error::{FHIRConnectionError, Result};
use crate::resource::{extract_operation_outcome_diagnostics, Bundle, FHIRResource};
use type_registry::ResourceTypeRegistry;

pub const FHIR_JSON_MIME: &str = "application/fhir+json";

/// Async, single-server FHIR client. Built once per distinct connection string by
/// [`crate::pool::ClientPool`] and reused across calls.
#[derive(Clone, Debug)]
pub struct AsyncFhirClient {
	http: reqwest::Client,
	config: AuthConfig,
	tokens: Option<OAuth2TokenManager>,
	type_registry: ResourceTypeRegistry,
}

impl AsyncFhirClient {
	#[must_use]
	pub fn new(config: AuthConfig) -> Self {
		let http = reqwest::Client::builder()
			.timeout(Duration::from_secs(config.timeout))
			.danger_accept_invalid_certs(!config.verify_tls)
			.build()
			.expect("reqwest client configuration is always valid here");
		// Public-endpoint clients skip token-manager construction entirely and never send
		// `Authorization`.
		let tokens = config.requires_auth().then(|| OAuth2TokenManager::new(config.clone()));
		Self { http, config, tokens, type_registry: ResourceTypeRegistry::default() }
	}

	/// Dispose of pooled connections. `reqwest::Client` tears down its pool on drop, so this
	/// simply drops the shared handle; exposed explicitly to mirror the §4.C lifecycle
	/// contract and give callers a point to call before discarding a client.
	pub fn close(self) {
		drop(self);
	}

	fn url_for(&self, segments: &[&str]) -> Result<reqwest::Url> {
		let mut url = self.config.base_url.clone();
		{
			let mut path_segments = url
				.path_segments_mut()
				.map_err(|()| FHIRConnectionError::config_invalid("base_url cannot be a base"))?;
			path_segments.pop_if_empty();
			for segment in segments {
				path_segments.push(segment);
			}
		}
		Ok(url)
	}

	async fn bearer_header(&self) -> Result<Option<String>> {
		match &self.tokens {
			Some(tokens) => Ok(Some(format!("Bearer {}", tokens.get_access_token().await?))),
			None => Ok(None),
		}
	}

	fn request(&self, method: Method, url: reqwest::Url) -> reqwest::RequestBuilder {
		self.http
			.request(method, url)
			.header(reqwest::header::ACCEPT, FHIR_JSON_MIME)
			.header(reqwest::header::CONTENT_TYPE, FHIR_JSON_MIME)
	}

	async fn send(
		&self,
		mut builder: reqwest::RequestBuilder,
		operation: &str,
		resource_type: &str,
		id: Option<&str>,
	) -> Result<reqwest::Response> {
		if let Some(bearer) = self.bearer_header().await? {
			builder = builder.header(reqwest::header::AUTHORIZATION, bearer);
		}
		builder.send().await.map_err(|e| {
			FHIRConnectionError::create_connection_error(format!("{operation} {resource_type} failed: {e}"))
				.with_cause(e)
		})
	}

	/// Parse a response body as JSON, or raise `INVALID_JSON_RESPONSE`.
	async fn parse_json(response: reqwest::Response) -> Result<Value> {
		let bytes = response
			.bytes()
			.await
			.map_err(|e| FHIRConnectionError::invalid_json_response(e.to_string()).with_cause(e))?;
		serde_json::from_slice(&bytes)
			.map_err(|e| FHIRConnectionError::invalid_json_response(format!("response body is not valid JSON: {e}")))
	}

	async fn handle_error_response(
		response: reqwest::Response,
		operation: &str,
		resource_type: &str,
		id: Option<&str>,
	) -> FHIRConnectionError {
		let status = response.status();
		let body = Self::parse_json(response).await.ok();
		let diagnostics = body.as_ref().and_then(extract_operation_outcome_diagnostics);
		FHIRConnectionError::from_status(status.as_u16(), operation, resource_type, id, diagnostics.as_deref())
	}

	pub async fn capabilities(&self) -> Result<FHIRResource> {
		let url = self.url_for(&["metadata"])?;
		let response = self.send(self.request(Method::GET, url), "capabilities", "CapabilityStatement", None).await?;
		if !response.status().is_success() {
			return Err(Self::handle_error_response(response, "capabilities", "CapabilityStatement", None).await);
		}
		let body = Self::parse_json(response).await?;
		FHIRResource::from_value(body)
	}

	pub async fn read(&self, resource_type: &str, id: &str) -> Result<FHIRResource> {
		let resource_type = self.type_registry.resolve(resource_type)?;
		let url = self.url_for(&[resource_type, id])?;
		let response = self.send(self.request(Method::GET, url), "read", resource_type, Some(id)).await?;
		if !response.status().is_success() {
			return Err(Self::handle_error_response(response, "read", resource_type, Some(id)).await);
		}
		let body = Self::parse_json(response).await?;
		FHIRResource::from_value(body)
	}

	pub async fn search(&self, resource_type: &str, params: &BTreeMap<String, String>) -> Result<Bundle> {
		let resource_type = self.type_registry.resolve(resource_type)?;
		let mut url = self.url_for(&[resource_type])?;
		{
			let mut query = url.query_pairs_mut();
			for (key, value) in params {
				query.append_pair(key, value);
			}
		}
		let response = self.send(self.request(Method::GET, url), "search", resource_type, None).await?;
		if !response.status().is_success() {
			return Err(Self::handle_error_response(response, "search", resource_type, None).await);
		}
		let body = Self::parse_json(response).await?;
		Ok(Bundle::from_resource(FHIRResource::from_value(body)?))
	}

	/// Re-issue a search against the query map parsed from a `next` pagination link, per the
	/// "same client's `search`" requirement.
	pub async fn search_url(&self, next_url: &str) -> Result<Bundle> {
		let parsed = reqwest::Url::parse(next_url)
			.map_err(|e| FHIRConnectionError::invalid_connection_string(format!("invalid pagination link: {e}")))?;
		let resource_type = parsed
			.path_segments()
			.and_then(|mut segments| segments.next_back())
			.ok_or_else(|| FHIRConnectionError::invalid_connection_string("pagination link is missing a resource type"))?
			.to_string();
		let params: BTreeMap<String, String> = parsed.query_pairs().into_owned().collect();
		self.search(&resource_type, &params).await
	}

	pub async fn create(&self, resource: &FHIRResource) -> Result<FHIRResource> {
		let resource_type = self.type_registry.resolve(resource.resource_type())?;
		let url = self.url_for(&[resource_type])?;
		let builder = self.request(Method::POST, url).json(resource.as_value());
		let response = self.send(builder, "create", resource_type, None).await?;
		if !response.status().is_success() {
			return Err(Self::handle_error_response(response, "create", resource_type, None).await);
		}
		let body = Self::parse_json(response).await?;
		FHIRResource::from_value(body)
	}

	pub async fn update(&self, resource: &FHIRResource) -> Result<FHIRResource> {
		let resource_type = self.type_registry.resolve(resource.resource_type())?;
		let id = resource
			.id()
			.ok_or_else(|| FHIRConnectionError::config_invalid("update requires a resource with a non-empty id"))?;
		let url = self.url_for(&[resource_type, id])?;
		let builder = self.request(Method::PUT, url).json(resource.as_value());
		let response = self.send(builder, "update", resource_type, Some(id)).await?;
		if !response.status().is_success() {
			return Err(Self::handle_error_response(response, "update", resource_type, Some(id)).await);
		}
		let body = Self::parse_json(response).await?;
		FHIRResource::from_value(body)
	}

	pub async fn delete(&self, resource_type: &str, id: &str) -> Result<bool> {
		let resource_type = self.type_registry.resolve(resource_type)?;
		let url = self.url_for(&[resource_type, id])?;
		let response = self.send(self.request(Method::DELETE, url), "delete", resource_type, Some(id)).await?;
		match response.status() {
			StatusCode::OK | StatusCode::NO_CONTENT => Ok(true),
			_ => Err(Self::handle_error_response(response, "delete", resource_type, Some(id)).await),
		}
	}

	pub async fn transaction(&self, bundle: &Bundle) -> Result<Bundle> {
		let url = self.url_for(&[])?;
		let builder = self.request(Method::POST, url).json(bundle.as_resource().as_value());
		let response = self.send(builder, "transaction", "Bundle", None).await?;
		if !response.status().is_success() {
			return Err(Self::handle_error_response(response, "transaction", "Bundle", None).await);
		}
		let body = Self::parse_json(response).await?;
		Ok(Bundle::from_resource(FHIRResource::from_value(body)?))
	}
}
