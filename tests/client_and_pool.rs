mod common;

use eyre::Result;
use healthchain_fhir_gateway::connection_manager::FHIRConnectionManager;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn pooled_clients_are_reused_per_source() -> Result<()> {
    common::setup_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/R4/metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "resourceType": "CapabilityStatement",
            "status": "active",
        })))
        .mount(&server)
        .await;

    let manager = FHIRConnectionManager::new();
    manager.add_source("a", format!("fhir://{}/R4", server.address())).await?;

    let first = manager.get_client(Some("a")).await?;
    let second = manager.get_client(Some("a")).await?;
    first.capabilities().await?;
    second.capabilities().await?;

    let status = manager.get_pool_status().await;
    assert_eq!(status.active_clients, 1);
    assert!(status.pooling_enabled);
    Ok(())
}

#[tokio::test]
async fn add_source_config_bypasses_connection_string_parsing() -> Result<()> {
    common::setup_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/R4/Patient/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "resourceType": "Patient",
            "id": "7",
        })))
        .mount(&server)
        .await;

    let base_url = url::Url::parse(&format!("http://{}/R4", server.address()))?;
    let config = healthchain_fhir_gateway::auth::AuthConfig::builder().base_url(base_url).build()?;

    let manager = FHIRConnectionManager::new();
    manager.add_source_config("direct", "fhir://unused", config).await;

    let client = manager.get_client(Some("direct")).await?;
    let resource = client.read("Patient", "7").await?;
    assert_eq!(resource.id(), Some("7"));
    Ok(())
}

#[tokio::test]
async fn unknown_source_name_is_rejected() -> Result<()> {
    let manager = FHIRConnectionManager::new();
    manager.add_source("a", "fhir://a.example.org/R4").await?;
    let err = manager.get_client(Some("b")).await.unwrap_err();
    assert_eq!(err.kind, healthchain_fhir_gateway::ErrorKind::UnknownSource);
    Ok(())
}
