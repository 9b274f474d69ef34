//! Pipeline event bus.
//!
//! One [`PipelineEvent::JobTransition`] is emitted per job status change and
//! one [`PipelineEvent::BatchCompleted`] when a batch's last job terminates.
//! A notification layer (WebSocket relay, CLI progress line) subscribes here;
//! delivery beyond the process is not this crate's concern.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{JobStatus, ProgressSnapshot};
use crate::stage::StageError;

/// Domain events published by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    JobTransition {
        batch_id: Uuid,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        attempt: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<StageError>,
    },
    BatchCompleted {
        snapshot: ProgressSnapshot,
    },
}

impl PipelineEvent {
    /// Namespaced event type, e.g. `"job.transition"`.
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::JobTransition { .. } => "job.transition",
            PipelineEvent::BatchCompleted { .. } => "batch.completed",
        }
    }

    pub fn batch_id(&self) -> Uuid {
        match self {
            PipelineEvent::JobTransition { batch_id, .. } => *batch_id,
            PipelineEvent::BatchCompleted { snapshot } => snapshot.batch_id,
        }
    }
}

/// Metadata wrapper around a [`PipelineEvent`].
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// UUIDv7, so envelopes sort by emission time.
    pub event_id: Uuid,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    /// Correlation id of the batch the event belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub payload_version: u32,
    pub payload: PipelineEvent,
}

impl EventEnvelope {
    pub fn new(event: PipelineEvent, correlation_id: Option<String>) -> Self {
        Self {
            event_id: crate::uuid_utils::new_v7(),
            event_type: event.event_type().to_string(),
            occurred_at: Utc::now(),
            correlation_id,
            payload_version: 1,
            payload: event,
        }
    }
}

/// Broadcast bus for pipeline events.
///
/// Slow receivers that fall behind get `Lagged` and miss events; progress
/// snapshots remain the source of truth.
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event. Returns `false` when nobody was subscribed and the
    /// event was dropped.
    pub fn emit(&self, event: PipelineEvent, correlation_id: Option<String>) -> bool {
        let envelope = EventEnvelope::new(event, correlation_id);
        tracing::trace!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            subscriber_count = self.tx.receiver_count(),
            "EventBus emit"
        );
        self.tx.send(envelope).is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}
