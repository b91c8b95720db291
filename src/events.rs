//! Fire-and-forget event emission to an external dispatcher.
//!
//! Grounded on the audit-event emission pattern: an `Option`-wrapped sink where `None` makes
//! every emission a no-op, and a dedicated PHI-safe payload type instead of forwarding full
//! resources.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Emitted once per gateway operation when events are enabled. Never carries a full
/// resource: `search`/`transaction` only carry counts, `read`/`create`/`update` carry the
/// resource id and type.
#[derive(Debug, Clone, Serialize)]
pub struct OperationEvent {
	pub operation: String,
	pub resource_type: String,
	pub resource_id: Option<String>,
	pub source: String,
	pub timestamp: DateTime<Utc>,
	pub payload_summary: serde_json::Value,
}

impl OperationEvent {
	#[must_use]
	pub fn new(
		operation: impl Into<String>,
		resource_type: impl Into<String>,
		resource_id: Option<String>,
		source: impl Into<String>,
		payload_summary: serde_json::Value,
	) -> Self {
		Self {
			operation: operation.into(),
			resource_type: resource_type.into(),
			resource_id,
			source: source.into(),
			timestamp: Utc::now(),
			payload_summary,
		}
	}
}

/// External dispatcher contract. `emit` must not block the caller for long; implementations
/// typically hand off to a channel or async task.
#[async_trait]
pub trait EventSink: Send + Sync {
	async fn emit(&self, event: OperationEvent);
}

/// No-op sink used when events are disabled, so callers never need to branch on whether a
/// sink is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
	async fn emit(&self, _event: OperationEvent) {}
}

/// Blocking counterpart of [`EventSink`] for the sync gateway, which has no event loop to hand
/// emission off to.
pub trait SyncEventSink: Send + Sync {
	fn emit(&self, event: OperationEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSyncEventSink;

impl SyncEventSink for NoopSyncEventSink {
	fn emit(&self, _event: OperationEvent) {}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	struct CountingSink(Arc<AtomicUsize>);

	#[async_trait]
	impl EventSink for CountingSink {
		async fn emit(&self, _event: OperationEvent) {
			self.0.fetch_add(1, Ordering::SeqCst);
		}
	}

	#[tokio::test]
	async fn noop_sink_drops_events() {
		NoopEventSink.emit(OperationEvent::new("read", "Patient", Some("1".into()), "s", serde_json::json!({})))
			.await;
	}

	#[tokio::test]
	async fn counting_sink_observes_emission() {
		let count = Arc::new(AtomicUsize::new(0));
		let sink = CountingSink(count.clone());
		sink.emit(OperationEvent::new("search", "Patient", None, "s", serde_json::json!({"count": 2})))
			.await;
		assert_eq!(count.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn noop_sync_sink_drops_events() {
		NoopSyncEventSink.emit(OperationEvent::new("read", "Patient", Some("1".into()), "s", serde_json::json!({})));
	}
}
