//! Event-sourced aggregate runtime.
//!
//! Rebuilds per-instance projections from a snapshot plus the events written
//! after it, quarantining events that are malformed or break an aggregate's
//! invariants, and executes commands that append new events under
//! optimistic concurrency control. Storage, snapshots, notification delivery
//! and authorization are injected collaborators.

mod aggregate;
pub use aggregate::{Aggregate, AggregateDefinition};
mod auth;
pub use auth::{AllowAll, Authorizer, Operation, OperationKind, User};
mod command;
pub use command::{Command, CommandCatalog, param};
mod connection;
pub use connection::{AggregateClient, Connection, ConnectionBuilder};
mod error;
pub use error::{Error, EventError, EventErrorKind, ParamsError, Unauthorized};
mod event;
pub use event::{Event, EventMetadata, EventSpec, RecordedEvent};
mod executor;
pub mod memory;
mod notification;
pub use notification::{EventWritten, InvalidEventsFound, Notification, NotificationSink};
mod projection;
pub use projection::{IgnoredEvent, InvalidEvent, MissValue, Projection, ProjectionOptions};
mod snapshot;
pub use snapshot::SnapshotStore;
mod storage;
pub use storage::EventStore;
mod store;
pub use store::{AggregateRuntime, AggregateRuntimeBuilder, RuntimeConfig};
