//! Event types for the mixd control plane
//!
//! Queue-engine and session lifecycle notifications are typed messages on a
//! broadcast EventBus. The service subscribes a logging task at startup;
//! tests subscribe their own receivers and wait on specific events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// mixd event types
///
/// Events are broadcast via EventBus. Every variant carries the content hash
/// identifying the unit of work where one applies, plus a UTC timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MixdEvent {
    /// An analysis job entered the queue
    JobQueued {
        content_hash: String,
        track_id: Uuid,
        priority: String,
        timestamp: DateTime<Utc>,
    },

    /// A job was dequeued and submitted to the extraction worker
    JobProcessing {
        content_hash: String,
        timestamp: DateTime<Utc>,
    },

    /// A single analysis stage was recorded on a job
    JobStageCompleted {
        content_hash: String,
        stage: String,
        progress: u8,
        timestamp: DateTime<Utc>,
    },

    /// All requested stages are recorded; the job is complete
    JobCompleted {
        content_hash: String,
        timestamp: DateTime<Utc>,
    },

    /// A submission or stage failure scheduled another attempt
    JobRetried {
        content_hash: String,
        retry_count: u32,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Retries exhausted or the job was swept as stale
    JobFailed {
        content_hash: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// The job was cancelled locally (worker cancel is best-effort)
    JobCancelled {
        content_hash: String,
        timestamp: DateTime<Utc>,
    },

    /// A complete stem set was inserted into the on-disk cache
    StemsCached {
        content_hash: String,
        total_bytes: u64,
        timestamp: DateTime<Utc>,
    },

    /// The playback-engine session came up (identify sent)
    EngineConnected { timestamp: DateTime<Utc> },

    /// The playback-engine session dropped; reconnect back-off is running
    EngineDisconnected { timestamp: DateTime<Utc> },

    /// The supervised extraction worker process started
    WorkerStarted {
        pid: u32,
        timestamp: DateTime<Utc>,
    },

    /// The supervised extraction worker process exited
    WorkerExited {
        exit_code: Option<i32>,
        will_restart: bool,
        timestamp: DateTime<Utc>,
    },
}

impl MixdEvent {
    /// Event name for logging
    pub fn name(&self) -> &'static str {
        match self {
            MixdEvent::JobQueued { .. } => "JobQueued",
            MixdEvent::JobProcessing { .. } => "JobProcessing",
            MixdEvent::JobStageCompleted { .. } => "JobStageCompleted",
            MixdEvent::JobCompleted { .. } => "JobCompleted",
            MixdEvent::JobRetried { .. } => "JobRetried",
            MixdEvent::JobFailed { .. } => "JobFailed",
            MixdEvent::JobCancelled { .. } => "JobCancelled",
            MixdEvent::StemsCached { .. } => "StemsCached",
            MixdEvent::EngineConnected { .. } => "EngineConnected",
            MixdEvent::EngineDisconnected { .. } => "EngineDisconnected",
            MixdEvent::WorkerStarted { .. } => "WorkerStarted",
            MixdEvent::WorkerExited { .. } => "WorkerExited",
        }
    }
}

/// Broadcast event bus
///
/// Thin wrapper around `tokio::sync::broadcast`: subscribers receive events
/// emitted after subscription; slow subscribers lag and drop, they never
/// block emitters.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MixdEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a new EventBus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<MixdEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, returning the subscriber count
    ///
    /// Errors when no subscriber is listening; use [`EventBus::emit_lossy`]
    /// where that is acceptable.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: MixdEvent,
    ) -> std::result::Result<usize, broadcast::error::SendError<MixdEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, silently dropping it when nobody is subscribed
    pub fn emit_lossy(&self, event: MixdEvent) {
        let _ = self.tx.send(event);
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(MixdEvent::EngineConnected {
            timestamp: chrono::Utc::now(),
        })
        .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "EngineConnected");
    }

    #[test]
    fn emit_without_subscribers_errors_but_lossy_does_not() {
        let bus = EventBus::new(16);
        let event = MixdEvent::EngineDisconnected {
            timestamp: chrono::Utc::now(),
        };
        assert!(bus.emit(event.clone()).is_err());
        bus.emit_lossy(event);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = MixdEvent::JobQueued {
            content_hash: "ab".repeat(32),
            track_id: Uuid::new_v4(),
            priority: "high".to_string(),
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "JobQueued");
        assert_eq!(json["priority"], "high");
    }
}
