//! Side-effect notifications and the sink they are delivered to.

use std::io;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One or more events of an instance were quarantined during a projection
/// build. Lists only the ids newly discovered in that build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidEventsFound {
    pub aggregate_name: String,
    pub aggregate_id: String,
    pub event_ids: Vec<Uuid>,
}

/// A command committed an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventWritten {
    pub aggregate_name: String,
    pub aggregate_id: String,
    pub event_type: String,
}

/// Every notification the runtime can emit.
///
/// Serialized as `{ "name": "invalidEventsFound", "payload": { ... } }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload", rename_all = "camelCase")]
pub enum Notification {
    InvalidEventsFound(InvalidEventsFound),
    EventWritten(EventWritten),
}

impl Notification {
    /// The wire name of this notification.
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidEventsFound(_) => "invalidEventsFound",
            Self::EventWritten(_) => "eventWritten",
        }
    }

    /// Hand this notification to the matching sink method.
    ///
    /// # Errors
    ///
    /// Propagates the sink's `io::Error`.
    pub async fn deliver(&self, sink: &dyn NotificationSink) -> io::Result<()> {
        match self {
            Self::InvalidEventsFound(n) => sink.invalid_events_found(n).await,
            Self::EventWritten(n) => sink.event_written(n).await,
        }
    }
}

/// Receives runtime notifications.
///
/// Buffering, ordering and durability are up to the implementation.
///
/// Delivery errors are never returned to the caller. An `Err` from either
/// method is logged at `error` level and dropped; the read or command that
/// emitted the notification still succeeds.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn invalid_events_found(&self, notification: &InvalidEventsFound) -> io::Result<()>;

    async fn event_written(&self, notification: &EventWritten) -> io::Result<()>;
}

/// Deliver `notification`, logging a sink failure instead of returning it.
pub(crate) async fn emit(sink: &dyn NotificationSink, notification: Notification) {
    if let Err(e) = notification.deliver(sink).await {
        tracing::error!(
            notification = notification.name(),
            error = %e,
            "notification sink failed"
        );
    }
}
