//! Name→client manager: owns the set of configured sources and multiplexes access to pooled
//! (async) or unpooled (sync) clients.

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::auth::{connection_string, AuthConfig};
use crate::client::sync::SyncFhirClient;
use crate::client::AsyncFhirClient;
use crate::error::{FHIRConnectionError, Result};
use crate::pool::{ClientPool, ConnectionLimits};

struct SourceEntry {
	name: String,
	connection_string: String,
	config: AuthConfig,
}

/// Async connection manager: sources are backed by a bounded, pooled [`ClientPool`].
pub struct FHIRConnectionManager {
	sources: RwLock<Vec<SourceEntry>>,
	pool: ClientPool<AsyncFhirClient>,
}

impl FHIRConnectionManager {
	#[must_use]
	pub fn new() -> Self {
		Self::with_limits(ConnectionLimits::default())
	}

	#[must_use]
	pub fn with_limits(limits: ConnectionLimits) -> Self {
		Self { sources: RwLock::new(Vec::new()), pool: ClientPool::new(limits, |config, _limits| AsyncFhirClient::new(config)) }
	}

	/// Validate and register a source from a raw `fhir://…` connection string. Re-adding an
	/// existing name overwrites it.
	pub async fn add_source(&self, name: impl Into<String>, connection_string: impl Into<String>) -> Result<()> {
		let connection_string = connection_string.into();
		let config = connection_string::parse(&connection_string)?;
		self.add_source_config(name, connection_string, config).await;
		Ok(())
	}

	/// Register a source from an already-built [`AuthConfig`], bypassing connection-string
	/// parsing entirely (§10.3 "direct construction from Connection Manager config").
	pub async fn add_source_config(&self, name: impl Into<String>, connection_string: impl Into<String>, config: AuthConfig) {
		let name = name.into();
		let connection_string = connection_string.into();
		let mut sources = self.sources.write().await;
		sources.retain(|entry| entry.name != name);
		sources.push(SourceEntry { name, connection_string, config });
	}

	/// Register a source by reading environment variables under `prefix`, per the §4.B env
	/// loader (§10.5 supplement).
	pub async fn add_source_from_env(&self, name: impl Into<String>, prefix: &str) -> Result<()> {
		let config = connection_string::from_env(prefix)?;
		let connection_string = connection_string::to_connection_string(&config);
		self.add_source_config(name, connection_string, config).await;
		Ok(())
	}

	async fn resolve_source(&self, name: Option<&str>) -> Result<(String, AuthConfig)> {
		let sources = self.sources.read().await;
		let entry = match name {
			Some(name) => sources.iter().find(|entry| entry.name == name),
			None => sources.first(),
		};
		match entry {
			Some(entry) => Ok((entry.connection_string.clone(), entry.config.clone())),
			None => Err(name.map_or_else(
				|| FHIRConnectionError::unknown_source("<no sources configured>"),
				FHIRConnectionError::unknown_source,
			)),
		}
	}

	/// Return the pooled client for `name`, defaulting to the first configured source.
	pub async fn get_client(&self, name: Option<&str>) -> Result<AsyncFhirClient> {
		let (connection_string, config) = self.resolve_source(name).await?;
		Ok(self.pool.get_client(&connection_string, config).await)
	}

	pub async fn get_sources(&self) -> Vec<String> {
		self.sources.read().await.iter().map(|entry| entry.name.clone()).collect()
	}

	pub async fn get_pool_status(&self) -> PoolStatus {
		PoolStatus {
			client_kind: "async",
			pooling_enabled: true,
			sources: self.get_sources().await,
			active_clients: self.pool.active_count().await,
			limits: self.pool_limits_snapshot(),
		}
	}

	fn pool_limits_snapshot(&self) -> BTreeMap<&'static str, u64> {
		BTreeMap::new()
	}

	pub async fn close(&self) {
		self.pool.close_all().await;
	}
}

impl Default for FHIRConnectionManager {
	fn default() -> Self {
		Self::new()
	}
}

/// Sync connection manager: no pooling per §4.D/§9 — every `get_client` call either returns a
/// cached plain client or builds a new one synchronously; `pooling_enabled` is reported
/// `false` in [`PoolStatus`] to match the upstream sync client's documented behavior.
pub struct SyncFHIRConnectionManager {
	sources: std::sync::RwLock<Vec<SourceEntry>>,
	clients: std::sync::RwLock<std::collections::HashMap<String, SyncFhirClient>>,
}

impl SyncFHIRConnectionManager {
	#[must_use]
	pub fn new() -> Self {
		Self { sources: std::sync::RwLock::new(Vec::new()), clients: std::sync::RwLock::new(std::collections::HashMap::new()) }
	}

	pub fn add_source(&self, name: impl Into<String>, connection_string: impl Into<String>) -> Result<()> {
		let connection_string = connection_string.into();
		let config = connection_string::parse(&connection_string)?;
		self.add_source_config(name, connection_string, config);
		Ok(())
	}

	pub fn add_source_config(&self, name: impl Into<String>, connection_string: impl Into<String>, config: AuthConfig) {
		let name = name.into();
		let connection_string = connection_string.into();
		let mut sources = self.sources.write().expect("sources lock poisoned");
		sources.retain(|entry| entry.name != name);
		sources.push(SourceEntry { name, connection_string, config });
	}

	pub fn add_source_from_env(&self, name: impl Into<String>, prefix: &str) -> Result<()> {
		let config = connection_string::from_env(prefix)?;
		let connection_string = connection_string::to_connection_string(&config);
		self.add_source_config(name, connection_string, config);
		Ok(())
	}

	fn resolve_source(&self, name: Option<&str>) -> Result<(String, AuthConfig)> {
		let sources = self.sources.read().expect("sources lock poisoned");
		let entry = match name {
			Some(name) => sources.iter().find(|entry| entry.name == name),
			None => sources.first(),
		};
		match entry {
			Some(entry) => Ok((entry.connection_string.clone(), entry.config.clone())),
			None => Err(name.map_or_else(
				|| FHIRConnectionError::unknown_source("<no sources configured>"),
				FHIRConnectionError::unknown_source,
			)),
		}
	}

	pub fn get_client(&self, name: Option<&str>) -> Result<SyncFhirClient> {
		let (connection_string, config) = self.resolve_source(name)?;
		if let Some(client) = self.clients.read().expect("clients lock poisoned").get(&connection_string) {
			return Ok(client.clone());
		}
		let client = SyncFhirClient::new(config);
		self.clients.write().expect("clients lock poisoned").insert(connection_string, client.clone());
		Ok(client)
	}

	pub fn get_sources(&self) -> Vec<String> {
		self.sources.read().expect("sources lock poisoned").iter().map(|entry| entry.name.clone()).collect()
	}

	pub fn get_pool_status(&self) -> PoolStatus {
		PoolStatus {
			client_kind: "sync",
			pooling_enabled: false,
			sources: self.get_sources(),
			active_clients: self.clients.read().expect("clients lock poisoned").len(),
			limits: BTreeMap::new(),
		}
	}

	pub fn close(&self) {
		self.clients.write().expect("clients lock poisoned").clear();
	}
}

impl Default for SyncFHIRConnectionManager {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
	pub client_kind: &'static str,
	pub pooling_enabled: bool,
	pub sources: Vec<String>,
	pub active_clients: usize,
	pub limits: BTreeMap<&'static str, u64>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn unknown_source_is_an_error() {
		let manager = FHIRConnectionManager::new();
		let err = manager.get_client(Some("missing")).await.unwrap_err();
		assert_eq!(err.kind, crate::error::ErrorKind::UnknownSource);
	}

	#[tokio::test]
	async fn default_source_is_first_configured() {
		let manager = FHIRConnectionManager::new();
		manager.add_source("a", "fhir://a.org/R4").await.unwrap();
		manager.add_source("b", "fhir://b.org/R4").await.unwrap();
		let client_a = manager.get_client(None).await.unwrap();
		let client_default_a = manager.get_client(Some("a")).await.unwrap();
		// Same underlying connection string -> same pooled client instance (verified via
		// pool uniqueness tests); here we only check resolution doesn't error.
		let _ = (client_a, client_default_a);
	}

	#[tokio::test]
	async fn re_adding_a_name_overwrites() {
		let manager = FHIRConnectionManager::new();
		manager.add_source("a", "fhir://a.org/R4").await.unwrap();
		manager.add_source("a", "fhir://other.org/R4").await.unwrap();
		assert_eq!(manager.get_sources().await, vec!["a".to_string()]);
	}

	#[test]
	fn sync_manager_reports_pooling_disabled() {
		let manager = SyncFHIRConnectionManager::new();
		manager.add_source("a", "fhir://a.org/R4").unwrap();
		let status = manager.get_pool_status();
		assert!(!status.pooling_enabled);
	}
}
