//! Name→client multiplexing with lazy instantiation and per-key creation locking.
//!
//! Grounded on `ClientPool[ClientInterface]` from the original connection-pooling module:
//! one client per distinct connection string, first-touch creation serialized per key so
//! concurrent callers for the *same* key never race to build two clients, while callers for
//! *different* keys proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::auth::AuthConfig;

/// Shared HTTP connection limits handed to the client factory on first instantiation.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
	pub max_connections: usize,
	pub max_keepalive_connections: usize,
	pub keepalive_expiry: std::time::Duration,
}

impl Default for ConnectionLimits {
	fn default() -> Self {
		Self {
			max_connections: 100,
			max_keepalive_connections: 20,
			keepalive_expiry: std::time::Duration::from_secs(5),
		}
	}
}

/// An async client pool keyed by connection string. `C` is typically
/// [`crate::client::AsyncFhirClient`]; the pool itself is client-type agnostic so it can also
/// back test doubles.
pub struct ClientPool<C: Clone + Send + Sync + 'static> {
	limits: ConnectionLimits,
	factory: Arc<dyn Fn(AuthConfig, ConnectionLimits) -> C + Send + Sync>,
	clients: Mutex<HashMap<String, C>>,
	creation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<C: Clone + Send + Sync + 'static> ClientPool<C> {
	pub fn new(
		limits: ConnectionLimits,
		factory: impl Fn(AuthConfig, ConnectionLimits) -> C + Send + Sync + 'static,
	) -> Self {
		Self {
			limits,
			factory: Arc::new(factory),
			clients: Mutex::new(HashMap::new()),
			creation_locks: Mutex::new(HashMap::new()),
		}
	}

	/// Return the existing client for `connection_string`, or build one via the factory.
	pub async fn get_client(&self, connection_string: &str, config: AuthConfig) -> C {
		if let Some(client) = self.clients.lock().await.get(connection_string) {
			return client.clone();
		}

		let key_lock = {
			let mut locks = self.creation_locks.lock().await;
			locks.entry(connection_string.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
		};
		let _guard = key_lock.lock().await;

		// Re-check under the per-key lock: another task may have created it while we waited.
		if let Some(client) = self.clients.lock().await.get(connection_string) {
			return client.clone();
		}

		let client = (self.factory)(config, self.limits);
		self.clients.lock().await.insert(connection_string.to_string(), client.clone());
		client
	}

	/// Idempotent: clears all cached clients. Subsequent `get_client` calls build fresh
	/// clients.
	pub async fn close_all(&self) {
		self.clients.lock().await.clear();
		self.creation_locks.lock().await.clear();
	}

	pub async fn active_count(&self) -> usize {
		self.clients.lock().await.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use url::Url;

	fn config() -> AuthConfig {
		AuthConfig::builder().base_url(Url::parse("https://ex.org/R4").unwrap()).build().unwrap()
	}

	#[tokio::test]
	async fn pool_uniqueness_same_key_returns_same_client() {
		let creations = Arc::new(AtomicUsize::new(0));
		let creations_clone = creations.clone();
		let pool = ClientPool::new(ConnectionLimits::default(), move |_, _| {
			creations_clone.fetch_add(1, Ordering::SeqCst);
			creations_clone.clone()
		});

		let a = pool.get_client("fhir://ex.org/R4", config()).await;
		let b = pool.get_client("fhir://ex.org/R4", config()).await;
		assert!(Arc::ptr_eq(&a, &b));
		assert_eq!(creations.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn distinct_keys_get_distinct_clients() {
		let pool = ClientPool::new(ConnectionLimits::default(), |_, _| Arc::new(()));
		let a = pool.get_client("fhir://a.org/R4", config()).await;
		let b = pool.get_client("fhir://b.org/R4", config()).await;
		assert!(!Arc::ptr_eq(&a, &b));
	}

	#[tokio::test]
	async fn concurrent_first_touch_creates_exactly_one_client() {
		let creations = Arc::new(AtomicUsize::new(0));
		let creations_clone = creations.clone();
		let pool = Arc::new(ClientPool::new(ConnectionLimits::default(), move |_, _| {
			creations_clone.fetch_add(1, Ordering::SeqCst);
			creations_clone.clone()
		}));

		let mut handles = Vec::new();
		for _ in 0..10 {
			let pool = pool.clone();
			handles.push(tokio::spawn(async move { pool.get_client("fhir://ex.org/R4", config()).await }));
		}
		for handle in handles {
			handle.await.unwrap();
		}
		assert_eq!(creations.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn close_all_is_idempotent_and_allows_fresh_creation() {
		let creations = Arc::new(AtomicUsize::new(0));
		let creations_clone = creations.clone();
		let pool = ClientPool::new(ConnectionLimits::default(), move |_, _| {
			creations_clone.fetch_add(1, Ordering::SeqCst);
			creations_clone.clone()
		});
		pool.get_client("fhir://ex.org/R4", config()).await;
		pool.close_all().await;
		pool.close_all().await;
		pool.get_client("fhir://ex.org/R4", config()).await;
		assert_eq!(creations.load(Ordering::SeqCst), 2);
	}
}
