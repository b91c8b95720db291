#![cfg(feature = "gateway")]

mod common;

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use eyre::Result;
use healthchain_fhir_gateway::connection_manager::FHIRConnectionManager;
use healthchain_fhir_gateway::gateway::{build_router, AsyncFHIRGateway, PredictOutput};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn gateway_over(server: &MockServer) -> Arc<AsyncFHIRGateway> {
    common::setup_logging();
    let manager = Arc::new(FHIRConnectionManager::new());
    manager.add_source("primary", format!("fhir://{}/R4", server.address())).await.unwrap();
    Arc::new(AsyncFHIRGateway::new(manager))
}

#[tokio::test]
async fn metadata_lists_registered_predict_operation() -> Result<()> {
    let server = MockServer::start().await;
    let mut gateway = AsyncFHIRGateway::new({
        let manager = Arc::new(FHIRConnectionManager::new());
        manager.add_source("primary", format!("fhir://{}/R4", server.address())).await?;
        manager
    });
    gateway
        .registry_mut()
        .register_predict("RiskAssessment", "final", Arc::new(|_patient_id| Box::pin(async { Ok(PredictOutput::Float(0.42)) })));
    let router = build_router(Arc::new(gateway));

    let response =
        router.oneshot(Request::builder().uri("/fhir/metadata").body(Body::empty())?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await?;
    let statement: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(statement["resourceType"], "CapabilityStatement");
    let resources = statement["rest"][0]["resource"].as_array().expect("rest[0].resource array");
    assert!(resources.iter().any(|r| r["type"] == "RiskAssessment"));
    Ok(())
}

#[tokio::test]
async fn predict_route_end_to_end_through_router() -> Result<()> {
    let server = MockServer::start().await;
    let gateway = gateway_over(&server).await;
    let router = build_router(gateway);

    let response = router
        .oneshot(Request::builder().uri("/fhir/predict/RiskAssessment/P1").body(Body::empty())?)
        .await?;
    // No predict handler registered on this gateway instance -> NOT_IMPLEMENTED surfaces as 5xx.
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    Ok(())
}

#[tokio::test]
async fn status_route_reports_configured_sources() -> Result<()> {
    let server = MockServer::start().await;
    let gateway = gateway_over(&server).await;
    let router = build_router(gateway);

    let response =
        router.oneshot(Request::builder().uri("/fhir/status").body(Body::empty())?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await?;
    let status: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(status["sources"], serde_json::json!(["primary"]));
    assert_eq!(status["gateway_kind"], "async");
    Ok(())
}

#[tokio::test]
async fn unconfigured_source_surfaces_as_error_response() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/R4/Patient/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "resourceType": "Patient",
            "id": "1",
        })))
        .mount(&server)
        .await;
    let gateway = gateway_over(&server).await;

    let resource = gateway.read("Patient", "1", Some("primary")).await?;
    assert_eq!(resource.id(), Some("1"));

    let err = gateway.read("Patient", "1", Some("does-not-exist")).await.unwrap_err();
    assert_eq!(err.kind, healthchain_fhir_gateway::ErrorKind::UnknownSource);
    Ok(())
}
