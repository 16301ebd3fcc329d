//! In-process collaborators backed by `tokio::sync` maps.
//!
//! Useful for tests, demos and single-process tools. Each type is cheap to
//! clone and clones share state, so a test can keep one handle for
//! inspection while the connection owns another.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::event::{Event, RecordedEvent};
use crate::notification::{EventWritten, InvalidEventsFound, Notification, NotificationSink};
use crate::projection::Projection;
use crate::snapshot::SnapshotStore;
use crate::storage::EventStore;

/// `(aggregate_name, aggregate_id)`.
type StreamKey = (String, String);

fn key(aggregate_name: &str, aggregate_id: &str) -> StreamKey {
    (aggregate_name.to_owned(), aggregate_id.to_owned())
}

/// Event store holding every stream in memory.
///
/// `write_event` is atomic per stream: the check for an existing sequence
/// number and the append happen under one write lock.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventStore {
    streams: Arc<RwLock<HashMap<StreamKey, Vec<RecordedEvent>>>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `event` as-is, skipping every check.
    ///
    /// Lets tests and migrations seed history the runtime would never write
    /// itself, such as events with missing metadata.
    pub async fn force_write(&self, event: RecordedEvent) {
        let mut streams = self.streams.write().await;
        streams
            .entry(key(&event.aggregate_name, &event.aggregate_id))
            .or_default()
            .push(event);
    }

    /// Every stored event of one instance, in append order.
    pub async fn events(&self, aggregate_name: &str, aggregate_id: &str) -> Vec<RecordedEvent> {
        let streams = self.streams.read().await;
        streams
            .get(&key(aggregate_name, aggregate_id))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn get_events(
        &self,
        aggregate_name: &str,
        aggregate_id: &str,
        after_version: u64,
    ) -> io::Result<Vec<RecordedEvent>> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(&key(aggregate_name, aggregate_id))
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.sequence_number > after_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn write_event(&self, event: &Event) -> io::Result<bool> {
        let mut streams = self.streams.write().await;
        let stream = streams
            .entry(key(&event.aggregate_name, &event.aggregate_id))
            .or_default();

        let last = stream.last().map_or(0, |e| e.sequence_number);
        if event.sequence_number <= last {
            return Ok(false);
        }
        if event.sequence_number != last + 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "sequence number {} would leave a gap after {last}",
                    event.sequence_number
                ),
            ));
        }

        stream.push(RecordedEvent::from(event.clone()));
        Ok(true)
    }
}

/// Snapshot store keeping the latest projection per instance.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    snapshots: Arc<RwLock<HashMap<StreamKey, Projection>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self, aggregate_name: &str, aggregate_id: &str) -> Option<Projection> {
        self.snapshots
            .read()
            .await
            .get(&key(aggregate_name, aggregate_id))
            .cloned()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn get_snapshot(
        &self,
        aggregate_name: &str,
        aggregate_id: &str,
    ) -> io::Result<Option<Projection>> {
        Ok(self.snapshot(aggregate_name, aggregate_id).await)
    }

    async fn write_snapshot(
        &self,
        aggregate_name: &str,
        aggregate_id: &str,
        projection: &Projection,
    ) -> io::Result<()> {
        self.snapshots
            .write()
            .await
            .insert(key(aggregate_name, aggregate_id), projection.clone());
        Ok(())
    }
}

/// Sink that records every notification it receives.
#[derive(Debug, Clone, Default)]
pub struct MemoryNotificationSink {
    received: Arc<Mutex<Vec<Notification>>>,
}

impl MemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications received so far, oldest first.
    pub async fn notifications(&self) -> Vec<Notification> {
        self.received.lock().await.clone()
    }

    /// Drain and return the recorded notifications.
    pub async fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.received.lock().await)
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn invalid_events_found(&self, notification: &InvalidEventsFound) -> io::Result<()> {
        self.received
            .lock()
            .await
            .push(Notification::InvalidEventsFound(notification.clone()));
        Ok(())
    }

    async fn event_written(&self, notification: &EventWritten) -> io::Result<()> {
        self.received
            .lock()
            .await
            .push(Notification::EventWritten(notification.clone()));
        Ok(())
    }
}
