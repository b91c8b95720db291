//! Generic FHIR resource model.
//!
//! Per the data model, a resource is treated here as `(resource_type, id?, JSON payload)`
//! rather than as one generated Rust type per FHIR resource — schema validation happens on
//! round-trip, not through a closed set of typed structs. [`Bundle`] and
//! [`extract_operation_outcome_diagnostics`] are the two places the gateway needs structured
//! access into that JSON payload.

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::error::{FHIRConnectionError, Result};

/// A FHIR resource: `resourceType` plus an optional `id`, backed by its JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct FHIRResource(Value);

impl FHIRResource {
	/// Build an empty resource of the given type, e.g. as the seed for `modify` when no
	/// prior resource exists.
	#[must_use]
	pub fn new(resource_type: impl Into<String>) -> Self {
		Self(json!({ "resourceType": resource_type.into() }))
	}

	/// Validate and wrap a JSON value as a FHIR resource: it must be a JSON object carrying
	/// a non-empty `resourceType` string.
	pub fn from_value(value: Value) -> Result<Self> {
		match value.get("resourceType").and_then(Value::as_str) {
			Some(rt) if !rt.is_empty() => Ok(Self(value)),
			_ => Err(FHIRConnectionError::create_validation_error(
				"resource is missing a non-empty `resourceType`",
			)),
		}
	}

	#[must_use]
	pub fn resource_type(&self) -> &str {
		self.0.get("resourceType").and_then(Value::as_str).unwrap_or_default()
	}

	#[must_use]
	pub fn id(&self) -> Option<&str> {
		self.0.get("id").and_then(Value::as_str)
	}

	pub fn set_id(&mut self, id: impl Into<String>) {
		self.as_object_mut().insert("id".to_string(), Value::String(id.into()));
	}

	#[must_use]
	pub fn as_value(&self) -> &Value {
		&self.0
	}

	#[must_use]
	pub fn into_value(self) -> Value {
		self.0
	}

	fn as_object_mut(&mut self) -> &mut Map<String, Value> {
		if !self.0.is_object() {
			self.0 = json!({});
		}
		self.0.as_object_mut().expect("just ensured object above")
	}

	/// Stamp `meta.source`, `meta.lastUpdated`, and optionally a `meta.tag` coding, per the
	/// provenance contract of `search(add_provenance=true)`.
	pub fn stamp_provenance(&mut self, source_name: &str, tag_code: Option<&str>) {
		let meta = self
			.as_object_mut()
			.entry("meta")
			.or_insert_with(|| json!({}))
			.as_object_mut()
			.map(std::mem::take)
			.unwrap_or_default();
		let mut meta = meta;
		meta.insert("source".to_string(), Value::String(format!("urn:healthchain:source:{source_name}")));
		meta.insert("lastUpdated".to_string(), Value::String(Utc::now().to_rfc3339()));
		if let Some(code) = tag_code {
			let tags = meta.entry("tag").or_insert_with(|| Value::Array(Vec::new()));
			if let Some(arr) = tags.as_array_mut() {
				arr.push(json!({ "code": code, "display": code }));
			}
		}
		self.as_object_mut().insert("meta".to_string(), Value::Object(meta));
	}
}

impl serde::Serialize for FHIRResource {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		self.0.serialize(serializer)
	}
}

impl<'de> serde::Deserialize<'de> for FHIRResource {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
		let value = Value::deserialize(deserializer)?;
		Self::from_value(value).map_err(serde::de::Error::custom)
	}
}

/// One entry in a [`Bundle`].
#[derive(Debug, Clone)]
pub struct BundleEntry {
	pub resource: Option<FHIRResource>,
	pub full_url: Option<String>,
	pub request: Option<Value>,
}

impl BundleEntry {
	fn from_value(value: &Value) -> Self {
		let resource = value.get("resource").cloned().and_then(|r| FHIRResource::from_value(r).ok());
		let full_url = value.get("fullUrl").and_then(Value::as_str).map(str::to_string);
		let request = value.get("request").cloned();
		Self { resource, full_url, request }
	}

	fn to_value(&self) -> Value {
		let mut entry = Map::new();
		if let Some(resource) = &self.resource {
			entry.insert("resource".to_string(), resource.as_value().clone());
		}
		if let Some(full_url) = &self.full_url {
			entry.insert("fullUrl".to_string(), Value::String(full_url.clone()));
		}
		if let Some(request) = &self.request {
			entry.insert("request".to_string(), request.clone());
		}
		Value::Object(entry)
	}
}

/// A `link` relation, used for search-result pagination.
#[derive(Debug, Clone)]
pub struct BundleLink {
	pub relation: String,
	pub url: String,
}

/// A `Bundle` resource: an ordered list of entries plus optional paging links.
#[derive(Debug, Clone)]
pub struct Bundle(FHIRResource);

impl Bundle {
	#[must_use]
	pub fn from_resource(resource: FHIRResource) -> Self {
		Self(resource)
	}

	#[must_use]
	pub fn empty(bundle_type: &str) -> Self {
		Self(FHIRResource(json!({ "resourceType": "Bundle", "type": bundle_type, "entry": [] })))
	}

	#[must_use]
	pub fn entries(&self) -> Vec<BundleEntry> {
		self.0
			.as_value()
			.get("entry")
			.and_then(Value::as_array)
			.map(|entries| entries.iter().map(BundleEntry::from_value).collect())
			.unwrap_or_default()
	}

	#[must_use]
	pub fn links(&self) -> Vec<BundleLink> {
		self.0
			.as_value()
			.get("link")
			.and_then(Value::as_array)
			.map(|links| {
				links
					.iter()
					.filter_map(|l| {
						let relation = l.get("relation")?.as_str()?.to_string();
						let url = l.get("url")?.as_str()?.to_string();
						Some(BundleLink { relation, url })
					})
					.collect()
			})
			.unwrap_or_default()
	}

	#[must_use]
	pub fn next_link(&self) -> Option<String> {
		self.links().into_iter().find(|l| l.relation == "next").map(|l| l.url)
	}

	/// Mutate every entry's resource via `f`, used to apply provenance stamping across a
	/// page of search results in place.
	pub fn for_each_resource_mut(&mut self, mut f: impl FnMut(&mut FHIRResource)) {
		if let Some(entries) = self.0.as_value().clone().get("entry").and_then(Value::as_array).cloned() {
			let updated: Vec<Value> = entries
				.into_iter()
				.map(|entry_value| {
					let mut entry = BundleEntry::from_value(&entry_value);
					if let Some(resource) = entry.resource.as_mut() {
						f(resource);
					}
					entry.to_value()
				})
				.collect();
			self.set_entries_value(updated);
		}
	}

	/// Append entries from another page, preserving order, for `follow_pagination`.
	pub fn extend_entries(&mut self, other: &Bundle) {
		let mut combined: Vec<Value> = self
			.0
			.as_value()
			.get("entry")
			.and_then(Value::as_array)
			.cloned()
			.unwrap_or_default();
		combined.extend(other.entries().iter().map(BundleEntry::to_value));
		self.set_entries_value(combined);
	}

	fn set_entries_value(&mut self, entries: Vec<Value>) {
		let object = match self.0 .0.as_object_mut() {
			Some(obj) => obj,
			None => {
				self.0 .0 = json!({});
				self.0 .0.as_object_mut().expect("just ensured object above")
			}
		};
		object.insert("entry".to_string(), Value::Array(entries));
	}

	#[must_use]
	pub fn into_resource(self) -> FHIRResource {
		self.0
	}

	#[must_use]
	pub fn as_resource(&self) -> &FHIRResource {
		&self.0
	}
}

/// Extract `issue[0].diagnostics` from an `OperationOutcome` body, per the §4.C response
/// handling contract. Returns `None` if the body is not an `OperationOutcome` or carries no
/// diagnostics.
#[must_use]
pub fn extract_operation_outcome_diagnostics(value: &Value) -> Option<String> {
	if value.get("resourceType").and_then(Value::as_str) != Some("OperationOutcome") {
		return None;
	}
	value
		.get("issue")
		.and_then(Value::as_array)
		.and_then(|issues| issues.first())
		.and_then(|issue| issue.get("diagnostics"))
		.and_then(Value::as_str)
		.map(str::to_string)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_missing_resource_type() {
		let err = FHIRResource::from_value(json!({"id": "1"})).unwrap_err();
		assert!(err.message.contains("resourceType"));
	}

	#[test]
	fn stamps_provenance_with_source_and_tag() {
		let mut resource = FHIRResource::from_value(json!({
			"resourceType": "Condition",
			"id": "1"
		}))
		.unwrap();
		resource.stamp_provenance("s", Some("aggregated"));
		let meta = resource.as_value().get("meta").unwrap();
		assert_eq!(meta.get("source").unwrap(), "urn:healthchain:source:s");
		assert_eq!(meta.get("tag").unwrap()[0].get("code").unwrap(), "aggregated");
	}

	#[test]
	fn bundle_pagination_concatenates_entries_in_order() {
		let mut first = Bundle::from_resource(
			FHIRResource::from_value(json!({
				"resourceType": "Bundle",
				"type": "searchset",
				"entry": [{"resource": {"resourceType": "Patient", "id": "1"}}]
			}))
			.unwrap(),
		);
		let second = Bundle::from_resource(
			FHIRResource::from_value(json!({
				"resourceType": "Bundle",
				"type": "searchset",
				"entry": [{"resource": {"resourceType": "Patient", "id": "2"}}]
			}))
			.unwrap(),
		);
		first.extend_entries(&second);
		assert_eq!(first.entries().len(), 2);
	}

	#[test]
	fn extracts_operation_outcome_diagnostics() {
		let body = json!({
			"resourceType": "OperationOutcome",
			"issue": [{"severity": "error", "diagnostics": "not found"}]
		});
		assert_eq!(extract_operation_outcome_diagnostics(&body).as_deref(), Some("not found"));
	}

	#[test]
	fn no_diagnostics_for_non_operation_outcome() {
		let body = json!({"resourceType": "Patient"});
		assert_eq!(extract_operation_outcome_diagnostics(&body), None);
	}
}
