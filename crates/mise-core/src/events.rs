//! Import status events, envelope schema, and event bus for real-time notifications.
//!
//! Every status update produced while a note is imported is a [`StatusEvent`].
//! The [`EventBus`] wraps each one in a versioned [`EventEnvelope`] and fans it
//! out over a broadcast channel; the WebSocket/SSE transports subscribe to it
//! independently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;
use crate::models::NoteStatus;
use crate::traits::StatusBroadcaster;

// ============================================================================
// Status Event (domain payload)
// ============================================================================

/// A status update for one import, optionally scoped to a single note.
///
/// `context` names the processing stage that produced the event (for example
/// `"instruction_processing"` or `"import_complete"`) so clients can group
/// progress lines; `indent_level` nests them visually.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub import_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note_id: Option<String>,
    pub status: NoteStatus,
    pub message: String,
    pub context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indent_level: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonValue>,
}

impl StatusEvent {
    pub fn new(
        import_id: impl Into<String>,
        status: NoteStatus,
        context: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            import_id: import_id.into(),
            note_id: None,
            status,
            message: message.into(),
            context: context.into(),
            indent_level: None,
            metadata: None,
        }
    }

    pub fn with_note(mut self, note_id: impl Into<String>) -> Self {
        self.note_id = Some(note_id.into());
        self
    }

    pub fn with_indent(mut self, level: u8) -> Self {
        self.indent_level = Some(level);
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Namespaced event type for the envelope (e.g., `"import.completed"`).
    pub fn namespaced_event_type(&self) -> &'static str {
        match self.status {
            NoteStatus::Pending => "import.pending",
            NoteStatus::Processing => "import.processing",
            NoteStatus::Completed => "import.completed",
            NoteStatus::Failed => "import.failed",
        }
    }
}

// ============================================================================
// Event Envelope
// ============================================================================

/// Versioned envelope around a [`StatusEvent`].
///
/// ## Wire Format (SSE)
///
/// ```text
/// event: import.completed
/// id: 019508a0-1234-7def-8000-abcdef123456
/// data: {"event_id":"...","event_type":"import.completed","occurred_at":"...","payload":{...}}
/// ```
///
/// `payload_version` increments on breaking payload changes; consumers should
/// ignore unknown fields.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Unique event identifier (UUIDv7 for temporal ordering).
    pub event_id: Uuid,
    /// Namespaced event type (e.g., `"import.processing"`).
    pub event_type: String,
    /// When the event occurred (UTC).
    pub occurred_at: DateTime<Utc>,
    /// Import the event belongs to; clients correlate on this.
    pub import_id: String,
    /// Payload schema version.
    pub payload_version: u32,
    pub payload: StatusEvent,
}

impl EventEnvelope {
    pub fn new(event: StatusEvent) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event.namespaced_event_type().to_string(),
            occurred_at: Utc::now(),
            import_id: event.import_id.clone(),
            payload_version: 1,
            payload: event,
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Broadcast-based event bus for distributing status events to multiple consumers.
///
/// Slow receivers that fall behind get a `Lagged` error and miss events; status
/// streams favour freshness over completeness.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    ///
    /// Recommended: 256 for production, 32 for tests.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers. Dropped silently when nobody listens.
    pub fn emit(&self, event: StatusEvent) {
        let envelope = EventEnvelope::new(event);
        let subscriber_count = self.tx.receiver_count();
        tracing::debug!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            import_id = %envelope.import_id,
            subscriber_count,
            "EventBus emit"
        );
        let _ = self.tx.send(envelope);
    }

    /// Subscribe to receive enveloped events. Each subscriber gets its own stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}

#[async_trait]
impl StatusBroadcaster for EventBus {
    async fn broadcast(&self, event: StatusEvent) -> Result<()> {
        self.emit(event);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn completed_event() -> StatusEvent {
        StatusEvent::new("i1", NoteStatus::Completed, "import_complete", "Import completed")
            .with_note("n1")
    }

    #[tokio::test]
    async fn test_event_bus_emit_subscribe() {
        let bus = EventBus::new(32);
        let mut rx = bus.subscribe();

        bus.emit(completed_event());

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event_type, "import.completed");
        assert_eq!(envelope.import_id, "i1");
        assert_eq!(envelope.payload_version, 1);
        assert_eq!(envelope.payload.note_id.as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn test_event_bus_multiple_subscribers() {
        let bus = EventBus::new(32);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(StatusEvent::new(
            "i1",
            NoteStatus::Processing,
            "note_processing",
            "Parsing note",
        ));

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.event_id, e2.event_id);
        assert_eq!(e1.event_type, "import.processing");
    }

    #[tokio::test]
    async fn test_event_bus_no_subscribers_ok() {
        let bus = EventBus::new(32);
        bus.emit(completed_event());
        assert!(bus.broadcast(completed_event()).await.is_ok());
    }

    #[tokio::test]
    async fn test_event_bus_subscriber_count() {
        let bus = EventBus::new(32);
        assert_eq!(bus.subscriber_count(), 0);

        let rx1 = bus.subscribe();
        let _rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(rx1);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_event_bus_lagged_receiver() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.emit(StatusEvent::new(
                "i1",
                NoteStatus::Processing,
                "image_upload",
                format!("image {i}"),
            ));
        }

        let result = rx.recv().await;
        assert!(matches!(
            result,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[test]
    fn test_status_event_json_skips_empty_fields() {
        let event = StatusEvent::new("i1", NoteStatus::Processing, "note_processing", "Parsing");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "PROCESSING");
        assert!(json.get("note_id").is_none());
        assert!(json.get("indent_level").is_none());
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn test_status_event_builders() {
        let event = completed_event()
            .with_indent(2)
            .with_metadata(json!({"noteTitle": "Pancakes"}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["indent_level"], 2);
        assert_eq!(json["metadata"]["noteTitle"], "Pancakes");
        assert_eq!(json["note_id"], "n1");
    }

    #[test]
    fn test_event_type_per_status() {
        let failed = StatusEvent::new("i1", NoteStatus::Failed, "import_failed", "boom");
        assert_eq!(failed.namespaced_event_type(), "import.failed");
        let envelope = EventEnvelope::new(failed);
        assert_eq!(envelope.event_type, "import.failed");
        assert_eq!(envelope.event_id.get_version_num(), 7);
    }
}
