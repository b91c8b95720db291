//! Async FHIR gateway: the cooperative-single-thread concurrency variant.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::json;

use super::{build_capability_statement, wrap_predict_output, HandlerRegistry, PredictOutput};
use crate::client::AsyncFhirClient;
use crate::connection_manager::FHIRConnectionManager;
use crate::error::{FHIRConnectionError, Result};
use crate::events::{EventSink, NoopEventSink, OperationEvent};
use crate::resource::{Bundle, FHIRResource};

pub const DEFAULT_ROUTE_PREFIX: &str = "/fhir";

/// The integration point: orchestrates CRUD/search/transaction against pooled clients,
/// registers `transform`/`aggregate`/`predict` handlers, and emits operation events.
pub struct AsyncFHIRGateway {
	pub(crate) manager: Arc<FHIRConnectionManager>,
	pub(crate) registry: HandlerRegistry,
	sink: Arc<dyn EventSink>,
	events_enabled: bool,
	pub(crate) prefix: String,
}

impl AsyncFHIRGateway {
	#[must_use]
	pub fn new(manager: Arc<FHIRConnectionManager>) -> Self {
		Self {
			manager,
			registry: HandlerRegistry::new(),
			sink: Arc::new(NoopEventSink),
			events_enabled: false,
			prefix: DEFAULT_ROUTE_PREFIX.to_string(),
		}
	}

	#[must_use]
	pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
		self.sink = sink;
		self.events_enabled = true;
		self
	}

	#[must_use]
	pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.prefix = prefix.into();
		self
	}

	pub fn registry_mut(&mut self) -> &mut HandlerRegistry {
		&mut self.registry
	}

	async fn emit(&self, event: OperationEvent) {
		if self.events_enabled {
			self.sink.emit(event).await;
		}
	}

	/// The single wrapper through which every transport error is translated (§4.F): fetch
	/// the pooled client, run `op`, and map any failure through the error taxonomy.
	async fn execute_with_client<T, F, Fut>(&self, source: Option<&str>, op: F) -> Result<T>
	where
		F: FnOnce(AsyncFhirClient) -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		let client = self.manager.get_client(source).await?;
		op(client).await
	}

	fn source_name(&self, source: Option<&str>) -> String {
		source.unwrap_or("default").to_string()
	}

	pub async fn capabilities(&self, source: Option<&str>) -> Result<FHIRResource> {
		let result = self.execute_with_client(source, |client| async move { client.capabilities().await }).await?;
		self.emit(OperationEvent::new("capabilities", "CapabilityStatement", None, self.source_name(source), json!({})))
			.await;
		Ok(result)
	}

	pub async fn read(&self, resource_type: &str, id: &str, source: Option<&str>) -> Result<FHIRResource> {
		let resource_type_owned = resource_type.to_string();
		let id_owned = id.to_string();
		let result = self
			.execute_with_client(source, move |client| async move { client.read(&resource_type_owned, &id_owned).await })
			.await?;
		self.emit(OperationEvent::new("read", resource_type, Some(id.to_string()), self.source_name(source), json!({})))
			.await;
		Ok(result)
	}

	/// `search` with optional pagination-following and provenance stamping. See §4.F.
	#[allow(clippy::too_many_arguments)]
	pub async fn search(
		&self,
		resource_type: &str,
		params: BTreeMap<String, String>,
		source: Option<&str>,
		add_provenance: bool,
		provenance_tag: Option<&str>,
		follow_pagination: bool,
		max_pages: Option<usize>,
	) -> Result<Bundle> {
		let client = self.manager.get_client(source).await?;
		let mut bundle = client.search(resource_type, &params).await?;

		if follow_pagination {
			let mut pages = 1usize;
			loop {
				if let Some(max) = max_pages {
					if pages >= max {
						break;
					}
				}
				let Some(next_url) = bundle.next_link() else { break };
				let next_page = client.search_url(&next_url).await?;
				bundle.extend_entries(&next_page);
				// Carry the new page's links forward so the loop condition is re-evaluated
				// against its `next` relation, not the first page's.
				bundle = replace_links(bundle, &next_page);
				pages += 1;
			}
		}

		let source_name = self.source_name(source);
		if add_provenance {
			bundle.for_each_resource_mut(|resource| resource.stamp_provenance(&source_name, provenance_tag));
		}

		let count = bundle.entries().len();
		self.emit(OperationEvent::new("search", resource_type, None, source_name, json!({ "count": count }))).await;
		Ok(bundle)
	}

	pub async fn create(&self, resource: FHIRResource, source: Option<&str>) -> Result<FHIRResource> {
		let resource_type = resource.resource_type().to_string();
		let result =
			self.execute_with_client(source, move |client| async move { client.create(&resource).await }).await?;
		self.emit(OperationEvent::new(
			"create",
			&resource_type,
			result.id().map(str::to_string),
			self.source_name(source),
			json!({}),
		))
		.await;
		Ok(result)
	}

	pub async fn update(&self, resource: FHIRResource, source: Option<&str>) -> Result<FHIRResource> {
		if resource.id().map(str::is_empty).unwrap_or(true) {
			return Err(FHIRConnectionError::config_invalid("update requires a resource with a non-empty id"));
		}
		let resource_type = resource.resource_type().to_string();
		let id = resource.id().map(str::to_string);
		let result =
			self.execute_with_client(source, move |client| async move { client.update(&resource).await }).await?;
		self.emit(OperationEvent::new("update", &resource_type, id, self.source_name(source), json!({}))).await;
		Ok(result)
	}

	pub async fn delete(&self, resource_type: &str, id: &str, source: Option<&str>) -> Result<bool> {
		let resource_type_owned = resource_type.to_string();
		let id_owned = id.to_string();
		let success = self
			.execute_with_client(source, move |client| async move { client.delete(&resource_type_owned, &id_owned).await })
			.await?;
		if success {
			self.emit(OperationEvent::new("delete", resource_type, Some(id.to_string()), self.source_name(source), json!({})))
				.await;
		}
		Ok(success)
	}

	pub async fn transaction(&self, bundle: Bundle, source: Option<&str>) -> Result<Bundle> {
		let entry_count = bundle.entries().len();
		let result =
			self.execute_with_client(source, move |client| async move { client.transaction(&bundle).await }).await?;
		let result_count = result.entries().len();
		self.emit(OperationEvent::new(
			"transaction",
			"Bundle",
			None,
			self.source_name(source),
			json!({ "entry_count": entry_count, "result_count": result_count }),
		))
		.await;
		Ok(result)
	}

	/// Scoped read-mutate-write: reads (or seeds an empty resource of `resource_type` when
	/// `id` is `None`), yields it to `mutate`, and on successful exit issues `create` (no id)
	/// or `update` (has id). Transport failures from either the read or write leg are
	/// funneled through the same error mapper as every other operation.
	pub async fn modify<F, Fut>(
		&self,
		resource_type: &str,
		id: Option<&str>,
		source: Option<&str>,
		mutate: F,
	) -> Result<FHIRResource>
	where
		F: FnOnce(&mut FHIRResource) -> Fut,
		Fut: Future<Output = Result<()>>,
	{
		let mut resource = match id {
			Some(id) => self.read(resource_type, id, source).await?,
			None => FHIRResource::new(resource_type),
		};
		mutate(&mut resource).await?;
		match resource.id() {
			Some(_) => self.update(resource, source).await,
			None => self.create(resource, source).await,
		}
	}

	/// Dispatch a registered `predict(Type)` handler and wrap its output into `resource_type`.
	pub async fn predict(&self, resource_type: &str, patient_id: &str) -> Result<FHIRResource> {
		let (handler, status) = self
			.registry
			.predict(resource_type)
			.ok_or_else(|| FHIRConnectionError::not_implemented(format!("no predict handler registered for {resource_type}")))?;
		let output: PredictOutput = handler(patient_id.to_string()).await?;
		wrap_predict_output(resource_type, &status, patient_id, output)
	}

	/// Dispatch a registered `transform(Type)` handler, validating that the produced resource
	/// matches `resource_type` (the Rust equivalent of the original return-type-annotation
	/// check, performed at invocation time since `FHIRResource` carries no static type tag).
	pub async fn transform(&self, resource_type: &str, id: &str, source: Option<&str>) -> Result<FHIRResource> {
		let handler = self
			.registry
			.transform(resource_type)
			.ok_or_else(|| FHIRConnectionError::not_implemented(format!("no transform handler registered for {resource_type}")))?;
		let result = handler(id.to_string(), source.map(str::to_string)).await?;
		if result.resource_type() != resource_type {
			return Err(FHIRConnectionError::config_invalid(format!(
				"transform({resource_type}) handler returned a {} resource",
				result.resource_type()
			)));
		}
		Ok(result)
	}

	pub async fn aggregate(
		&self,
		resource_type: &str,
		id: Option<String>,
		sources: Option<Vec<String>>,
	) -> Result<serde_json::Value> {
		let handler = self
			.registry
			.aggregate(resource_type)
			.ok_or_else(|| FHIRConnectionError::not_implemented(format!("no aggregate handler registered for {resource_type}")))?;
		handler(id, sources).await
	}

	pub async fn capability_statement(&self) -> FHIRResource {
		let sources = self.manager.get_sources().await;
		build_capability_statement(&self.registry.registered_types(), &sources, "async")
	}

	pub async fn status(&self) -> serde_json::Value {
		let pool_status = self.manager.get_pool_status().await;
		json!({
			"gateway_kind": "async",
			"sources": pool_status.sources,
			"pooling_enabled": pool_status.pooling_enabled,
			"active_clients": pool_status.active_clients,
			"operations": self.registry.registered_types().iter().map(|(resource_type, op)| {
				json!({
					"endpoint": format!("{}/{}/{}", self.prefix, op, resource_type),
					"method": "GET",
				})
			}).collect::<Vec<_>>(),
		})
	}
}

fn replace_links(mut bundle: Bundle, latest_page: &Bundle) -> Bundle {
	// `Bundle` only exposes entry mutation, not link replacement, because pagination is the
	// only caller that needs to advance `link` between pages; do it through the raw value.
	let value = bundle.as_resource().as_value().clone();
	let mut value = value;
	if let Some(object) = value.as_object_mut() {
		if let Some(links) = latest_page.as_resource().as_value().get("link") {
			object.insert("link".to_string(), links.clone());
		} else {
			object.remove("link");
		}
	}
	bundle = Bundle::from_resource(FHIRResource::from_value(value).expect("bundle value is always a valid resource"));
	bundle
}

#[cfg(test)]
mod tests {
	use super::*;
	use wiremock::matchers::{method, path, query_param};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	async fn gateway_for(server: &MockServer) -> AsyncFHIRGateway {
		let manager = Arc::new(FHIRConnectionManager::new());
		manager.add_source("s", format!("fhir://{}/R4", server.address())).await.unwrap();
		AsyncFHIRGateway::new(manager)
	}

	#[tokio::test]
	async fn search_follows_pagination_across_three_pages() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/R4/Patient"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"resourceType": "Bundle",
				"type": "searchset",
				"entry": [{"resource": {"resourceType": "Patient", "id": "1"}}],
				"link": [{"relation": "next", "url": format!("http://{}/R4/Patient?page=2", server.address())}],
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/R4/Patient"))
			.and(query_param("page", "2"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"resourceType": "Bundle",
				"type": "searchset",
				"entry": [{"resource": {"resourceType": "Patient", "id": "2"}}],
				"link": [{"relation": "next", "url": format!("http://{}/R4/Patient?page=3", server.address())}],
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/R4/Patient"))
			.and(query_param("page", "3"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"resourceType": "Bundle",
				"type": "searchset",
				"entry": [{"resource": {"resourceType": "Patient", "id": "3"}}],
			})))
			.mount(&server)
			.await;

		let gateway = gateway_for(&server).await;
		let bundle = gateway
			.search("Patient", BTreeMap::new(), Some("s"), false, None, true, None)
			.await
			.unwrap();
		assert_eq!(bundle.entries().len(), 3);
	}

	#[tokio::test]
	async fn search_stamps_provenance_with_tag() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/R4/Condition"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"resourceType": "Bundle",
				"type": "searchset",
				"entry": [
					{"resource": {"resourceType": "Condition", "id": "1"}},
					{"resource": {"resourceType": "Condition", "id": "2"}},
				],
			})))
			.mount(&server)
			.await;

		let gateway = gateway_for(&server).await;
		let bundle = gateway
			.search("Condition", BTreeMap::new(), Some("s"), true, Some("aggregated"), false, None)
			.await
			.unwrap();
		for entry in bundle.entries() {
			let resource = entry.resource.unwrap();
			assert_eq!(resource.as_value()["meta"]["source"], "urn:healthchain:source:s");
			assert_eq!(resource.as_value()["meta"]["tag"][0]["code"], "aggregated");
		}
	}

	#[tokio::test]
	async fn modify_creates_when_no_id_given() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/R4/Patient"))
			.respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
				"resourceType": "Patient",
				"id": "new-1",
			})))
			.mount(&server)
			.await;

		let gateway = gateway_for(&server).await;
		let result = gateway
			.modify("Patient", None, Some("s"), |resource| {
				resource.as_value();
				Box::pin(async move { Ok(()) })
			})
			.await
			.unwrap();
		assert_eq!(result.id(), Some("new-1"));
	}

	#[tokio::test]
	async fn predict_wraps_float_output() {
		let server = MockServer::start().await;
		let mut gateway = gateway_for(&server).await;
		gateway.registry_mut().register_predict(
			"RiskAssessment",
			"final",
			Arc::new(|_patient_id| Box::pin(async move { Ok(PredictOutput::Float(0.75)) })),
		);
		let resource = gateway.predict("RiskAssessment", "P1").await.unwrap();
		assert_eq!(resource.as_value()["prediction"][0]["probabilityDecimal"], 0.75);
	}
}
