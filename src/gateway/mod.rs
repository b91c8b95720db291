//! Shared base layer for the sync/async FHIR gateways: handler registry, capability-statement
//! builder, and the predict-output wrapping shared by both concrete variants.
//!
//! Per the design notes, the two concrete gateways differ only in lock type and in whether
//! client calls are awaited; this module holds everything that doesn't need to know which.

pub mod async_gateway;
pub mod router;
pub mod sync_gateway;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::{FHIRConnectionError, Result};
use crate::resource::FHIRResource;

pub use async_gateway::AsyncFHIRGateway;
pub use router::build_router;
pub use sync_gateway::{FHIRGateway, SyncHandlerRegistry};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The value a registered `predict` handler returns: either a bare probability or a map of
/// named fields (`score`, `qualitativeRisk`, …).
#[derive(Debug, Clone)]
pub enum PredictOutput {
	Float(f64),
	Map(serde_json::Map<String, Value>),
}

/// Async transform handler: `(id, source) -> Result<FHIRResource>`.
pub type AsyncTransformHandler =
	dyn Fn(String, Option<String>) -> BoxFuture<'static, Result<FHIRResource>> + Send + Sync;
/// Async aggregate handler: `(id?, sources?) -> Result<serde_json::Value>` (free-form).
pub type AsyncAggregateHandler =
	dyn Fn(Option<String>, Option<Vec<String>>) -> BoxFuture<'static, Result<Value>> + Send + Sync;
/// Async predict handler: `(patient_id) -> Result<PredictOutput>`.
pub type AsyncPredictHandler = dyn Fn(String) -> BoxFuture<'static, Result<PredictOutput>> + Send + Sync;

/// Per-resource-type, per-operation handler registry. Populated at setup time; runtime
/// mutation after the gateway starts serving traffic is not a supported use case.
#[derive(Default)]
pub struct HandlerRegistry {
	transforms: HashMap<String, Arc<AsyncTransformHandler>>,
	aggregates: HashMap<String, Arc<AsyncAggregateHandler>>,
	predicts: HashMap<String, (Arc<AsyncPredictHandler>, String)>,
}

impl HandlerRegistry {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a `transform(Type)` handler. In the original dynamically-typed gateway this
	/// is where a mismatched return-type annotation would be rejected; here `FHIRResource` is
	/// the uniform resource representation, so the equivalent check — that the produced
	/// resource's `resourceType` equals `resource_type` — happens once per invocation in
	/// [`AsyncFHIRGateway`]'s route dispatch instead of at registration time.
	pub fn register_transform(
		&mut self,
		resource_type: impl Into<String>,
		handler: Arc<AsyncTransformHandler>,
	) {
		self.transforms.insert(resource_type.into(), handler);
	}

	pub fn register_aggregate(&mut self, resource_type: impl Into<String>, handler: Arc<AsyncAggregateHandler>) {
		self.aggregates.insert(resource_type.into(), handler);
	}

	pub fn register_predict(
		&mut self,
		resource_type: impl Into<String>,
		status: impl Into<String>,
		handler: Arc<AsyncPredictHandler>,
	) {
		self.predicts.insert(resource_type.into(), (handler, status.into()));
	}

	#[must_use]
	pub fn transform(&self, resource_type: &str) -> Option<Arc<AsyncTransformHandler>> {
		self.transforms.get(resource_type).cloned()
	}

	#[must_use]
	pub fn aggregate(&self, resource_type: &str) -> Option<Arc<AsyncAggregateHandler>> {
		self.aggregates.get(resource_type).cloned()
	}

	#[must_use]
	pub fn predict(&self, resource_type: &str) -> Option<(Arc<AsyncPredictHandler>, String)> {
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

/// Wrap a `predict` handler's raw output into the target resource type. Only `RiskAssessment`
/// is defined; every other type raises `NOT_IMPLEMENTED` (§4.F, §9 ambiguity: "predict
/// supports only RiskAssessment").
pub fn wrap_predict_output(
	resource_type: &str,
	status: &str,
	patient_id: &str,
	output: PredictOutput,
) -> Result<FHIRResource> {
	if resource_type != "RiskAssessment" {
		return Err(FHIRConnectionError::not_implemented(format!(
			"predict wrapping is not implemented for resource type `{resource_type}`"
		)));
	}

	let mut body = json!({
		"resourceType": "RiskAssessment",
		"status": status,
		"subject": { "reference": format!("Patient/{patient_id}") },
	});

	match output {
		PredictOutput::Float(score) => {
			body["prediction"] = json!([{ "probabilityDecimal": score }]);
		}
		PredictOutput::Map(map) => {
			let mut prediction = serde_json::Map::new();
			if let Some(score) = map.get("score") {
				prediction.insert("probabilityDecimal".to_string(), score.clone());
			}
			if let Some(qualitative) = map.get("qualitativeRisk").and_then(Value::as_str) {
				prediction.insert(
					"qualitativeRisk".to_string(),
					json!({ "coding": [{ "display": qualitative }] }),
				);
			}
			body["prediction"] = json!([Value::Object(prediction)]);
		}
	}

	FHIRResource::from_value(body)
}

/// Build a `CapabilityStatement`-shaped resource describing every registered
/// `(resource_type, operation)` pair and the connected source names, per the capability
/// statement rules: `transform` contributes a `read` interaction, `aggregate` contributes
/// `search-type`, `predict` contributes `read` tagged as an ML prediction.
#[must_use]
pub fn build_capability_statement(
	registered_types: &[(&str, &'static str)],
	sources: &[String],
	gateway_kind: &str,
) -> FHIRResource {
	let mut resources: HashMap<&str, Vec<Value>> = HashMap::new();
	for &(resource_type, op) in registered_types {
		let interaction = match op {
			"transform" => json!({ "code": "read", "documentation": format!("transform({resource_type})") }),
			"aggregate" => json!({ "code": "search-type", "documentation": format!("aggregate({resource_type})") }),
			"predict" => json!({
				"code": "read",
				"documentation": format!("predict({resource_type}): machine-learning prediction endpoint"),
			}),
			_ => unreachable!("HandlerRegistry only registers transform/aggregate/predict"),
		};
		resources.entry(resource_type).or_default().push(interaction);
	}

	let rest_resources: Vec<Value> = resources
		.into_iter()
		.map(|(resource_type, interactions)| {
			json!({ "type": resource_type, "interaction": interactions })
		})
		.collect();

	let body = json!({
		"resourceType": "CapabilityStatement",
		"status": "active",
		"kind": "instance",
		"fhirVersion": "4.3.0",
		"format": ["json"],
		"rest": [{ "mode": "server", "resource": rest_resources }],
		"extension": [{
			"url": "urn:healthchain:gateway",
			"valueString": gateway_kind,
		}],
		"contact": sources.iter().map(|s| json!({"name": s})).collect::<Vec<_>>(),
	});
	FHIRResource::from_value(body).expect("constructed body always has a resourceType")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn wraps_float_into_risk_assessment() {
		let resource = wrap_predict_output("RiskAssessment", "final", "P1", PredictOutput::Float(0.75)).unwrap();
		assert_eq!(resource.as_value()["prediction"][0]["probabilityDecimal"], 0.75);
		assert_eq!(resource.as_value()["subject"]["reference"], "Patient/P1");
		assert_eq!(resource.as_value()["status"], "final");
	}

	#[test]
	fn wrapping_unsupported_type_is_not_implemented() {
		let err = wrap_predict_output("Observation", "final", "P1", PredictOutput::Float(0.1)).unwrap_err();
		assert_eq!(err.kind, crate::error::ErrorKind::NotImplemented);
	}

	#[test]
	fn capability_statement_tags_predict_as_read() {
		let mut registry = HandlerRegistry::new();
		registry.register_predict(
			"RiskAssessment",
			"final",
			Arc::new(|_id| Box::pin(async { Ok(PredictOutput::Float(0.1)) })),
		);
		let statement = build_capability_statement(&registry.registered_types(), &["s".to_string()], "async");
		let resource_entry = &statement.as_value()["rest"][0]["resource"][0];
		assert_eq!(resource_entry["type"], "RiskAssessment");
		assert_eq!(resource_entry["interaction"][0]["code"], "read");
	}
}
