//! Event storage collaborator.
//!
//! The runtime never owns persistence. It reads and appends through an
//! [`EventStore`] supplied when a connection is opened; see
//! [`memory::MemoryEventStore`](crate::memory::MemoryEventStore) for the
//! in-process implementation.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;

use crate::event::{Event, RecordedEvent};

/// Append-only, per-instance event streams with conditional writes.
///
/// # Contract
///
/// - [`get_events`](EventStore::get_events) returns the events of one
///   instance with `sequence_number > after_version`, ascending.
/// - [`write_event`](EventStore::write_event) is a conditional append: it
///   stores the event and returns `Ok(true)` only if no event with the same
///   `(aggregate_name, aggregate_id, sequence_number)` exists. If one does,
///   it returns `Ok(false)` and writes nothing. This is the only
///   concurrency primitive the runtime relies on.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Events of `aggregate_name/aggregate_id` after `after_version`.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the backing store cannot be read.
    async fn get_events(
        &self,
        aggregate_name: &str,
        aggregate_id: &str,
        after_version: u64,
    ) -> io::Result<Vec<RecordedEvent>>;

    /// Append `event` unless its sequence number is already taken.
    ///
    /// # Returns
    ///
    /// `true` if the event was stored, `false` on a sequence conflict.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the backing store cannot be written.
    async fn write_event(&self, event: &Event) -> io::Result<bool>;
}

#[async_trait]
impl<T: EventStore + ?Sized> EventStore for Arc<T> {
    async fn get_events(
        &self,
        aggregate_name: &str,
        aggregate_id: &str,
        after_version: u64,
    ) -> io::Result<Vec<RecordedEvent>> {
        (**self).get_events(aggregate_name, aggregate_id, after_version).await
    }

    async fn write_event(&self, event: &Event) -> io::Result<bool> {
        (**self).write_event(event).await
    }
}
