//! Notification sink: best-effort, fire-and-forget publication of
//! telemetry, fleet snapshots, health metrics, and status transitions.
//!
//! Components hold a [`SharedNotifier`] and never learn whether anyone is
//! listening. The daemon wires a [`BroadcastNotifier`]; tests either use
//! the same and subscribe, or use [`NullNotifier`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Telemetry,
    FleetSnapshot,
    Health,
    JobStatus,
    TaskStatus,
    UnitStatus,
    /// Operator-facing warnings, e.g. overdue jobs.
    Alert,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Telemetry => "telemetry",
            Topic::FleetSnapshot => "fleet_snapshot",
            Topic::Health => "health",
            Topic::JobStatus => "job_status",
            Topic::TaskStatus => "task_status",
            Topic::UnitStatus => "unit_status",
            Topic::Alert => "alert",
        }
    }
}

/// A published message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub topic: Topic,
    pub payload: serde_json::Value,
    pub timestamp_ms: u64,
}

/// Sink for outbound notifications.
pub trait Notifier: Send + Sync {
    fn publish(&self, topic: Topic, payload: serde_json::Value);
}

pub type SharedNotifier = Arc<dyn Notifier>;

/// Serialize `value` and publish it. Serialization failures are logged
/// and dropped like any other delivery failure.
pub fn publish_json<T: Serialize>(notifier: &dyn Notifier, topic: Topic, value: &T) {
    match serde_json::to_value(value) {
        Ok(payload) => notifier.publish(topic, payload),
        Err(e) => warn!(topic = topic.as_str(), error = %e, "notification payload not serializable"),
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn publish(&self, topic: Topic, _payload: serde_json::Value) {
        trace!(topic = topic.as_str(), "notification dropped");
    }
}

/// Fans notifications out to any number of subscribers over a tokio
/// broadcast channel. Slow subscribers lag and lose messages.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, topic: Topic, payload: serde_json::Value) {
        let msg = Notification {
            topic,
            payload,
            timestamp_ms: crate::epoch_millis(),
        };
        // No receivers is not an error.
        let _ = self.tx.send(msg);
    }
}
