//! Multi-source FHIR gateway: authenticated, pooled clients over several remote FHIR servers,
//! with OAuth2 token lifecycle, CRUD/search/transaction orchestration, and HTTP-exposed
//! transform/aggregate/predict routing.
//!
//! The crate is organized leaf-first, mirroring the component layering of the gateway design:
//!
//! - [`auth`] — OAuth2 token manager and the `fhir://…` connection-string/[`auth::AuthConfig`]
//!   plumbing.
//! - [`client`] — the typed single-server FHIR HTTP client (async and blocking).
//! - [`pool`] and [`connection_manager`] — name→client multiplexing with a bounded, shared HTTP
//!   connection pool.
//! - [`error`] — the uniform error taxonomy consulted by every layer above it.
//! - [`resource`] — the generic FHIR resource/`Bundle` representation.
//! - [`events`] — fire-and-forget operation-event emission.
//! - [`gateway`] — the integration point: sync and async gateways, plus the axum router
//!   exposing `transform`/`aggregate`/`predict` over HTTP.
//!
//! Most applications only need [`gateway::AsyncFHIRGateway`] (or [`gateway::FHIRGateway`] for a
//! non-async host) built on a [`connection_manager::FHIRConnectionManager`] (or
//! [`connection_manager::SyncFHIRConnectionManager`]) with one or more sources registered via
//! [`connection_manager::FHIRConnectionManager::add_source`].

pub mod auth;
#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "client")]
pub mod connection_manager;
pub mod error;
pub mod events;
#[cfg(feature = "gateway")]
pub mod gateway;
#[cfg(feature = "client")]
pub mod pool;
pub mod resource;

pub use error::{ErrorKind, ErrorState, FHIRConnectionError, Result};
pub use resource::{Bundle, FHIRResource};
