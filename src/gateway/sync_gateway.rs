//! Sync FHIR gateway: the parallel-threads concurrency variant.
//!
//! Per the design notes, this differs from [`super::async_gateway::AsyncFHIRGateway`] only in
//! lock type (`std::sync::Mutex`/`RwLock` transitively, via [`SyncFHIRConnectionManager`]) and
//! in not awaiting client calls; the operation sequencing, pagination, and provenance logic is
//! identical in shape.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::json;

use super::{build_capability_statement, wrap_predict_output, PredictOutput};
use crate::client::sync::SyncFhirClient;
use crate::connection_manager::SyncFHIRConnectionManager;
use crate::error::{FHIRConnectionError, Result};
use crate::events::{NoopSyncEventSink, OperationEvent, SyncEventSink};
use crate::resource::{Bundle, FHIRResource};

pub const DEFAULT_ROUTE_PREFIX: &str = "/fhir";

/// Blocking transform handler: `(id, source) -> Result<FHIRResource>`.
pub type SyncTransformHandler = dyn Fn(String, Option<String>) -> Result<FHIRResource> + Send + Sync;
/// Blocking aggregate handler: `(id?, sources?) -> Result<serde_json::Value>`.
pub type SyncAggregateHandler =
	dyn Fn(Option<String>, Option<Vec<String>>) -> Result<serde_json::Value> + Send + Sync;
/// Blocking predict handler: `(patient_id) -> Result<PredictOutput>`.
pub type SyncPredictHandler = dyn Fn(String) -> Result<PredictOutput> + Send + Sync;

/// Blocking counterpart of [`super::HandlerRegistry`].
#[derive(Default)]
pub struct SyncHandlerRegistry {
	transforms: HashMap<String, Arc<SyncTransformHandler>>,
	aggregates: HashMap<String, Arc<SyncAggregateHandler>>,
	predicts: HashMap<String, (Arc<SyncPredictHandler>, String)>,
}

impl SyncHandlerRegistry {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register_transform(&mut self, resource_type: impl Into<String>, handler: Arc<SyncTransformHandler>) {
		self.transforms.insert(resource_type.into(), handler);
	}

	pub fn register_aggregate(&mut self, resource_type: impl Into<String>, handler: Arc<SyncAggregateHandler>) {
		self.aggregates.insert(resource_type.into(), handler);
	}

	pub fn register_predict(
		&mut self,
		resource_type: impl Into<String>,
		status: impl Into<String>,
		handler: Arc<SyncPredictHandler>,
	) {
		self.predicts.insert(resource_type.into(), (handler, status.into()));
	}

	#[must_use]
	pub fn transform(&self, resource_type: &str) -> Option<Arc<SyncTransformHandler>> {
		self.transforms.get(resource_type).cloned()
	}

	#[must_use]
	pub fn aggregate(&self, resource_type: &str) -> Option<Arc<SyncAggregateHandler>> {
		self.aggregates.get(resource_type).cloned()
	}

	#[must_use]
	pub fn predict(&self, resource_type: &str) -> Option<(Arc<SyncPredictHandler>, String)> {
		self.predicts.get(resource_type).cloned()
	}

	#[must_use]
	pub fn registered_types(&self) -> Vec<(&str, &'static str)> {
		let mut out = Vec::new();
		out.extend(self.transforms.keys().map(|k| (k.as_str(), "transform")));
		out.extend(self.aggregates.keys().map(|k| (k.as_str(), "aggregate")));
		out.extend(self.predicts.keys().map(|k| (k.as_str(), "predict")));
		out
	}
}

/// The blocking FHIR gateway: same operation surface as [`super::async_gateway::AsyncFHIRGateway`]
/// with no router exposure, since the pluggable HTTP framework this crate targets (axum) is
/// itself async-only — the sync variant is for embedding in non-async applications.
pub struct FHIRGateway {
	manager: Arc<SyncFHIRConnectionManager>,
	registry: SyncHandlerRegistry,
	sink: Arc<dyn SyncEventSink>,
	events_enabled: bool,
	prefix: String,
}

impl FHIRGateway {
	#[must_use]
	pub fn new(manager: Arc<SyncFHIRConnectionManager>) -> Self {
		Self {
			manager,
			registry: SyncHandlerRegistry::new(),
			sink: Arc::new(NoopSyncEventSink),
			events_enabled: false,
			prefix: DEFAULT_ROUTE_PREFIX.to_string(),
		}
	}

	#[must_use]
	pub fn with_event_sink(mut self, sink: Arc<dyn SyncEventSink>) -> Self {
		self.sink = sink;
		self.events_enabled = true;
		self
	}

	#[must_use]
	pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.prefix = prefix.into();
		self
	}

	pub fn registry_mut(&mut self) -> &mut SyncHandlerRegistry {
		&mut self.registry
	}

	fn emit(&self, event: OperationEvent) {
		if self.events_enabled {
			self.sink.emit(event);
		}
	}

	/// The single wrapper through which every transport error is translated (§4.F).
	fn execute_with_client<T>(&self, source: Option<&str>, op: impl FnOnce(SyncFhirClient) -> Result<T>) -> Result<T> {
		let client = self.manager.get_client(source)?;
		op(client)
	}

	fn source_name(&self, source: Option<&str>) -> String {
		source.unwrap_or("default").to_string()
	}

	pub fn capabilities(&self, source: Option<&str>) -> Result<FHIRResource> {
		let result = self.execute_with_client(source, |client| client.capabilities())?;
		self.emit(OperationEvent::new("capabilities", "CapabilityStatement", None, self.source_name(source), json!({})));
		Ok(result)
	}

	pub fn read(&self, resource_type: &str, id: &str, source: Option<&str>) -> Result<FHIRResource> {
		let result = self.execute_with_client(source, |client| client.read(resource_type, id))?;
		self.emit(OperationEvent::new("read", resource_type, Some(id.to_string()), self.source_name(source), json!({})));
		Ok(result)
	}

	#[allow(clippy::too_many_arguments)]
	pub fn search(
		&self,
		resource_type: &str,
		params: BTreeMap<String, String>,
		source: Option<&str>,
		add_provenance: bool,
		provenance_tag: Option<&str>,
		follow_pagination: bool,
		max_pages: Option<usize>,
	) -> Result<Bundle> {
		let client = self.manager.get_client(source)?;
		let mut bundle = client.search(resource_type, &params)?;

		if follow_pagination {
			let mut pages = 1usize;
			loop {
				if let Some(max) = max_pages {
					if pages >= max {
						break;
					}
				}
				let Some(next_url) = bundle.next_link() else { break };
				let next_page = client.search_url(&next_url)?;
				bundle.extend_entries(&next_page);
				bundle = replace_links(bundle, &next_page);
				pages += 1;
			}
		}

		let source_name = self.source_name(source);
		if add_provenance {
			bundle.for_each_resource_mut(|resource| resource.stamp_provenance(&source_name, provenance_tag));
		}

		let count = bundle.entries().len();
		self.emit(OperationEvent::new("search", resource_type, None, source_name, json!({ "count": count })));
		Ok(bundle)
	}

	pub fn create(&self, resource: FHIRResource, source: Option<&str>) -> Result<FHIRResource> {
		let resource_type = resource.resource_type().to_string();
		let result = self.execute_with_client(source, |client| client.create(&resource))?;
		self.emit(OperationEvent::new(
			"create",
			&resource_type,
			result.id().map(str::to_string),
			self.source_name(source),
			json!({}),
		));
		Ok(result)
	}

	pub fn update(&self, resource: FHIRResource, source: Option<&str>) -> Result<FHIRResource> {
		if resource.id().map(str::is_empty).unwrap_or(true) {
			return Err(FHIRConnectionError::config_invalid("update requires a resource with a non-empty id"));
		}
		let resource_type = resource.resource_type().to_string();
		let id = resource.id().map(str::to_string);
		let result = self.execute_with_client(source, |client| client.update(&resource))?;
		self.emit(OperationEvent::new("update", &resource_type, id, self.source_name(source), json!({})));
		Ok(result)
	}

	pub fn delete(&self, resource_type: &str, id: &str, source: Option<&str>) -> Result<bool> {
		let success = self.execute_with_client(source, |client| client.delete(resource_type, id))?;
		if success {
			self.emit(OperationEvent::new("delete", resource_type, Some(id.to_string()), self.source_name(source), json!({})));
		}
		Ok(success)
	}

	pub fn transaction(&self, bundle: Bundle, source: Option<&str>) -> Result<Bundle> {
		let entry_count = bundle.entries().len();
		let result = self.execute_with_client(source, |client| client.transaction(&bundle))?;
		let result_count = result.entries().len();
		self.emit(OperationEvent::new(
			"transaction",
			"Bundle",
			None,
			self.source_name(source),
			json!({ "entry_count": entry_count, "result_count": result_count }),
		));
		Ok(result)
	}

	/// Blocking scoped read-mutate-write; see [`super::async_gateway::AsyncFHIRGateway::modify`]
	/// for the semantics, here expressed as a plain mutating closure instead of an awaited one
	/// since Rust has no stable generator-based context manager either way (§9).
	pub fn modify(
		&self,
		resource_type: &str,
		id: Option<&str>,
		source: Option<&str>,
		mutate: impl FnOnce(&mut FHIRResource) -> Result<()>,
	) -> Result<FHIRResource> {
		let mut resource = match id {
			Some(id) => self.read(resource_type, id, source)?,
			None => FHIRResource::new(resource_type),
		};
		mutate(&mut resource)?;
		match resource.id() {
			Some(_) => self.update(resource, source),
			None => self.create(resource, source),
		}
	}

	pub fn predict(&self, resource_type: &str, patient_id: &str) -> Result<FHIRResource> {
		let (handler, status) = self
			.registry
			.predict(resource_type)
			.ok_or_else(|| FHIRConnectionError::not_implemented(format!("no predict handler registered for {resource_type}")))?;
		let output = handler(patient_id.to_string())?;
		wrap_predict_output(resource_type, &status, patient_id, output)
	}

	pub fn transform(&self, resource_type: &str, id: &str, source: Option<&str>) -> Result<FHIRResource> {
		let handler = self
			.registry
			.transform(resource_type)
			.ok_or_else(|| FHIRConnectionError::not_implemented(format!("no transform handler registered for {resource_type}")))?;
		let result = handler(id.to_string(), source.map(str::to_string))?;
		if result.resource_type() != resource_type {
			return Err(FHIRConnectionError::config_invalid(format!(
				"transform({resource_type}) handler returned a {} resource",
				result.resource_type()
			)));
		}
		Ok(result)
	}

	pub fn aggregate(&self, resource_type: &str, id: Option<String>, sources: Option<Vec<String>>) -> Result<serde_json::Value> {
		let handler = self
			.registry
			.aggregate(resource_type)
			.ok_or_else(|| FHIRConnectionError::not_implemented(format!("no aggregate handler registered for {resource_type}")))?;
		handler(id, sources)
	}

	pub fn capability_statement(&self) -> FHIRResource {
		let sources = self.manager.get_sources();
		build_capability_statement(&self.registry.registered_types(), &sources, "sync")
	}

	pub fn status(&self) -> serde_json::Value {
		let pool_status = self.manager.get_pool_status();
		json!({
			"gateway_kind": "sync",
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
