//! Blocking single-server FHIR client, used by the sync gateway and sync connection manager.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::blocking::Response;
use reqwest::{Method, StatusCode};
use serde_json::Value;

use super::type_registry::ResourceTypeRegistry;
use super::FHIR_JSON_MIME;
use crate::auth::{AuthConfig, SyncOAuth2TokenManager};
use crate::error::{FHIRConnectionError, Result};
use crate::resource::{extract_operation_outcome_diagnostics, Bundle, FHIRResource};

#[derive(Clone)]
pub struct SyncFhirClient {
	http: reqwest::blocking::Client,
	config: AuthConfig,
	tokens: Option<SyncOAuth2TokenManager>,
	type_registry: ResourceTypeRegistry,
}

impl SyncFhirClient {
	#[must_use]
	pub fn new(config: AuthConfig) -> Self {
		let http = reqwest::blocking::Client::builder()
			.timeout(Duration::from_secs(config.timeout))
			.danger_accept_invalid_certs(!config.verify_tls)
			.build()
			.expect("reqwest client configuration is always valid here");
		let tokens = config.requires_auth().then(|| SyncOAuth2TokenManager::new(config.clone()));
		Self { http, config, tokens, type_registry: ResourceTypeRegistry::default() }
	}

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

	fn bearer_header(&self) -> Result<Option<String>> {
		match &self.tokens {
			Some(tokens) => Ok(Some(format!("Bearer {}", tokens.get_access_token()?))),
			None => Ok(None),
		}
	}

	fn request(&self, method: Method, url: reqwest::Url) -> reqwest::blocking::RequestBuilder {
		self.http
			.request(method, url)
			.header(reqwest::header::ACCEPT, FHIR_JSON_MIME)
			.header(reqwest::header::CONTENT_TYPE, FHIR_JSON_MIME)
	}

	fn send(&self, mut builder: reqwest::blocking::RequestBuilder, operation: &str, resource_type: &str) -> Result<Response> {
		if let Some(bearer) = self.bearer_header()? {
			builder = builder.header(reqwest::header::AUTHORIZATION, bearer);
		}
		builder
			.send()
			.map_err(|e| FHIRConnectionError::create_connection_error(format!("{operation} {resource_type} failed: {e}")).with_cause(e))
	}

	fn parse_json(response: Response) -> Result<Value> {
		let bytes = response
			.bytes()
			.map_err(|e| FHIRConnectionError::invalid_json_response(e.to_string()).with_cause(e))?;
		serde_json::from_slice(&bytes)
			.map_err(|e| FHIRConnectionError::invalid_json_response(format!("response body is not valid JSON: {e}")))
	}

	fn handle_error_response(response: Response, operation: &str, resource_type: &str, id: Option<&str>) -> FHIRConnectionError {
		let status = response.status();
		let body = Self::parse_json(response).ok();
		let diagnostics = body.as_ref().and_then(extract_operation_outcome_diagnostics);
		FHIRConnectionError::from_status(status.as_u16(), operation, resource_type, id, diagnostics.as_deref())
	}

	pub fn capabilities(&self) -> Result<FHIRResource> {
		let url = self.url_for(&["metadata"])?;
		let response = self.send(self.request(Method::GET, url), "capabilities", "CapabilityStatement")?;
		if !response.status().is_success() {
			return Err(Self::handle_error_response(response, "capabilities", "CapabilityStatement", None));
		}
		FHIRResource::from_value(Self::parse_json(response)?)
	}

	pub fn read(&self, resource_type: &str, id: &str) -> Result<FHIRResource> {
		let resource_type = self.type_registry.resolve(resource_type)?;
		let url = self.url_for(&[resource_type, id])?;
		let response = self.send(self.request(Method::GET, url), "read", resource_type)?;
		if !response.status().is_success() {
			return Err(Self::handle_error_response(response, "read", resource_type, Some(id)));
		}
		FHIRResource::from_value(Self::parse_json(response)?)
	}

	pub fn search(&self, resource_type: &str, params: &BTreeMap<String, String>) -> Result<Bundle> {
		let resource_type = self.type_registry.resolve(resource_type)?;
		let mut url = self.url_for(&[resource_type])?;
		{
			let mut query = url.query_pairs_mut();
			for (key, value) in params {
				query.append_pair(key, value);
			}
		}
		let response = self.send(self.request(Method::GET, url), "search", resource_type)?;
		if !response.status().is_success() {
			return Err(Self::handle_error_response(response, "search", resource_type, None));
		}
		Ok(Bundle::from_resource(FHIRResource::from_value(Self::parse_json(response)?)?))
	}

	pub fn search_url(&self, next_url: &str) -> Result<Bundle> {
		let parsed = reqwest::Url::parse(next_url)
			.map_err(|e| FHIRConnectionError::invalid_connection_string(format!("invalid pagination link: {e}")))?;
		let resource_type = parsed
			.path_segments()
			.and_then(|mut segments| segments.next_back())
			.ok_or_else(|| FHIRConnectionError::invalid_connection_string("pagination link is missing a resource type"))?
			.to_string();
		let params: BTreeMap<String, String> = parsed.query_pairs().into_owned().collect();
		self.search(&resource_type, &params)
	}

	pub fn create(&self, resource: &FHIRResource) -> Result<FHIRResource> {
		let resource_type = self.type_registry.resolve(resource.resource_type())?;
		let url = self.url_for(&[resource_type])?;
		let builder = self.request(Method::POST, url).json(resource.as_value());
		let response = self.send(builder, "create", resource_type)?;
		if !response.status().is_success() {
			return Err(Self::handle_error_response(response, "create", resource_type, None));
		}
		FHIRResource::from_value(Self::parse_json(response)?)
	}

	pub fn update(&self, resource: &FHIRResource) -> Result<FHIRResource> {
		let resource_type = self.type_registry.resolve(resource.resource_type())?;
		let id = resource
			.id()
			.ok_or_else(|| FHIRConnectionError::config_invalid("update requires a resource with a non-empty id"))?;
		let url = self.url_for(&[resource_type, id])?;
		let builder = self.request(Method::PUT, url).json(resource.as_value());
		let response = self.send(builder, "update", resource_type)?;
		if !response.status().is_success() {
			return Err(Self::handle_error_response(response, "update", resource_type, Some(id)));
		}
		FHIRResource::from_value(Self::parse_json(response)?)
	}

	pub fn delete(&self, resource_type: &str, id: &str) -> Result<bool> {
		let resource_type = self.type_registry.resolve(resource_type)?;
		let url = self.url_for(&[resource_type, id])?;
		let response = self.send(self.request(Method::DELETE, url), "delete", resource_type)?;
		match response.status() {
			StatusCode::OK | StatusCode::NO_CONTENT => Ok(true),
			_ => Err(Self::handle_error_response(response, "delete", resource_type, Some(id))),
		}
	}

	pub fn transaction(&self, bundle: &Bundle) -> Result<Bundle> {
		let url = self.url_for(&[])?;
		let builder = self.request(Method::POST, url).json(bundle.as_resource().as_value());
		let response = self.send(builder, "transaction", "Bundle")?;
		if !response.status().is_success() {
			return Err(Self::handle_error_response(response, "transaction", "Bundle", None));
		}
		Ok(Bundle::from_resource(FHIRResource::from_value(Self::parse_json(response)?)?))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use url::Url;
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	// wiremock's MockServer needs an async runtime to start, but SyncFhirClient itself makes
	// blocking calls off that runtime's thread, matching how the sync client is actually used
	// embedded in a multi-threaded host application.
	#[tokio::test]
	async fn read_public_endpoint_without_authorization() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/R4/Patient/1"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"resourceType": "Patient",
				"id": "1",
			})))
			.mount(&server)
			.await;

		let base_url = format!("{}/R4", server.uri());
		tokio::task::spawn_blocking(move || {
			let config = AuthConfig::builder().base_url(Url::parse(&base_url).unwrap()).build().unwrap();
			let client = SyncFhirClient::new(config);
			let resource = client.read("Patient", "1").unwrap();
			assert_eq!(resource.id(), Some("1"));
		})
		.await
		.unwrap();
	}

	#[tokio::test]
	async fn http_404_on_read_maps_to_error_state_404() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/R4/Patient/999"))
			.respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
				"resourceType": "OperationOutcome",
				"issue": [{"severity": "error", "diagnostics": "does not exist"}]
			})))
			.mount(&server)
			.await;

		let base_url = format!("{}/R4", server.uri());
		tokio::task::spawn_blocking(move || {
			let config = AuthConfig::builder().base_url(Url::parse(&base_url).unwrap()).build().unwrap();
			let client = SyncFhirClient::new(config);
			let err = client.read("Patient", "999").unwrap_err();
			assert_eq!(err.state, crate::error::ErrorState::Code(404));
			assert!(err.message.contains("does not exist"));
		})
		.await
		.unwrap();
	}
}
