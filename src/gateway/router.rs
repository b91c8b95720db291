//! Axum router mounting the gateway's HTTP-exposed surface: the `transform`/`aggregate`/
//! `predict` routes registered via [`super::HandlerRegistry`], plus the `/metadata` and
//! `/status` introspection endpoints (§4.F, §6).
//!
//! Grounded on the octofhir-auth `http` module's `State`-extractor handler style: each route
//! is a plain async fn taking `State<Arc<AsyncFHIRGateway>>` plus axum extractors, returning
//! `impl IntoResponse`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use super::async_gateway::AsyncFHIRGateway;
use crate::client::FHIR_JSON_MIME;
use crate::error::FHIRConnectionError;
use crate::resource::FHIRResource;

/// Build the router for `gateway`, mounted under `gateway.prefix` (default `/fhir`, §6).
///
/// The returned `Router` has no state attached to the gateway's own routes yet in the sense
/// that it is nested under the caller's own app state via `.with_state`; here the gateway
/// itself is the route state since every handler needs it.
#[must_use]
pub fn build_router(gateway: Arc<AsyncFHIRGateway>) -> Router {
	let prefix = gateway.prefix.clone();
	Router::new()
		.route(&format!("{prefix}/metadata"), get(metadata_handler))
		.route(&format!("{prefix}/status"), get(status_handler))
		.route(&format!("{prefix}/transform/:resource_type/:id"), get(transform_handler))
		.route(&format!("{prefix}/aggregate/:resource_type"), get(aggregate_handler))
		.route(&format!("{prefix}/predict/:resource_type/:id"), get(predict_handler))
		.with_state(gateway)
}

fn fhir_json_response(status: StatusCode, resource: &FHIRResource) -> Response {
	(status, [(axum::http::header::CONTENT_TYPE, FHIR_JSON_MIME)], Json(resource.as_value().clone())).into_response()
}

/// Translate any gateway error into an HTTP response: `detail` plus the error's own state when
/// it carries a concrete HTTP-like code, 500 otherwise with the message preserved (§7
/// propagation policy — route handlers translate, never leak unmapped exceptions).
fn error_response(err: FHIRConnectionError) -> Response {
	let status = match err.state {
		crate::error::ErrorState::Code(code) if (100..1000).contains(&code) => {
			StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
		}
		_ => StatusCode::INTERNAL_SERVER_ERROR,
	};
	(status, Json(json!({ "detail": err.message }))).into_response()
}

async fn metadata_handler(State(gateway): State<Arc<AsyncFHIRGateway>>) -> Response {
	let statement = gateway.capability_statement().await;
	fhir_json_response(StatusCode::OK, &statement)
}

async fn status_handler(State(gateway): State<Arc<AsyncFHIRGateway>>) -> Response {
	Json(gateway.status().await).into_response()
}

#[derive(Debug, Deserialize)]
struct TransformQuery {
	source: Option<String>,
}

async fn transform_handler(
	State(gateway): State<Arc<AsyncFHIRGateway>>,
	Path((resource_type, id)): Path<(String, String)>,
	Query(query): Query<TransformQuery>,
) -> Response {
	match gateway.transform(&resource_type, &id, query.source.as_deref()).await {
		Ok(resource) => fhir_json_response(StatusCode::OK, &resource),
		Err(err) => error_response(err),
	}
}

#[derive(Debug, Deserialize)]
struct AggregateQuery {
	id: Option<String>,
	sources: Option<String>,
}

async fn aggregate_handler(
	State(gateway): State<Arc<AsyncFHIRGateway>>,
	Path(resource_type): Path<String>,
	Query(query): Query<AggregateQuery>,
) -> Response {
	let sources = query.sources.map(|s| s.split(',').map(str::to_string).collect::<Vec<_>>());
	match gateway.aggregate(&resource_type, query.id, sources).await {
		Ok(value) => (StatusCode::OK, [(axum::http::header::CONTENT_TYPE, FHIR_JSON_MIME)], Json(value)).into_response(),
		Err(err) => error_response(err),
	}
}

async fn predict_handler(
	State(gateway): State<Arc<AsyncFHIRGateway>>,
	Path((resource_type, patient_id)): Path<(String, String)>,
) -> Response {
	match gateway.predict(&resource_type, &patient_id).await {
		Ok(resource) => fhir_json_response(StatusCode::OK, &resource),
		Err(err) => error_response(err),
	}
}

#[cfg(test)]
fn parse_query(raw: &str) -> std::collections::BTreeMap<String, String> {
	url::form_urlencoded::parse(raw.as_bytes()).into_owned().collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::connection_manager::FHIRConnectionManager;
	use crate::gateway::PredictOutput;
	use axum::body::Body;
	use axum::http::Request;
	use tower::ServiceExt;
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	async fn gateway_with_source(server: &MockServer) -> Arc<AsyncFHIRGateway> {
		let manager = Arc::new(FHIRConnectionManager::new());
		manager.add_source("s", format!("fhir://{}/R4", server.address())).await.unwrap();
		Arc::new(AsyncFHIRGateway::new(manager))
	}

	#[tokio::test]
	async fn metadata_route_returns_capability_statement() {
		let server = MockServer::start().await;
		let gateway = gateway_with_source(&server).await;
		let router = build_router(gateway);

		let response = router
			.oneshot(Request::builder().uri("/fhir/metadata").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(response.headers().get(axum::http::header::CONTENT_TYPE).unwrap(), FHIR_JSON_MIME);
	}

	#[tokio::test]
	async fn status_route_returns_plain_json() {
		let server = MockServer::start().await;
		let gateway = gateway_with_source(&server).await;
		let router = build_router(gateway);

		let response = router
			.oneshot(Request::builder().uri("/fhir/status").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn predict_route_wraps_handler_output() {
		let server = MockServer::start().await;
		let mut gateway = AsyncFHIRGateway::new({
			let manager = Arc::new(FHIRConnectionManager::new());
			manager.add_source("s", format!("fhir://{}/R4", server.address())).await.unwrap();
			manager
		});
		gateway
			.registry_mut()
			.register_predict("RiskAssessment", "final", Arc::new(|_pid| Box::pin(async { Ok(PredictOutput::Float(0.75)) })));
		let router = build_router(Arc::new(gateway));

		let response = router
			.oneshot(Request::builder().uri("/fhir/predict/RiskAssessment/P1").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
		let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
		let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(value["prediction"][0]["probabilityDecimal"], 0.75);
	}

	#[tokio::test]
	async fn transform_route_translates_not_implemented_to_5xx() {
		let server = MockServer::start().await;
		let gateway = gateway_with_source(&server).await;
		let router = build_router(gateway);

		let response = router
			.oneshot(Request::builder().uri("/fhir/transform/Patient/1").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
	}

	#[test]
	fn parses_source_query_param() {
		let params = parse_query("source=s1");
		assert_eq!(params.get("source"), Some(&"s1".to_string()));
	}
}
