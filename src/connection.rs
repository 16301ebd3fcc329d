//! A runtime bound to one caller's collaborators and identity.
//!
//! [`Connection`] is the public face of the runtime: projection reads,
//! snapshot publication and command execution all go through it, each
//! passing the authorization gate first.

use std::sync::Arc;

use serde_json::Value;

use crate::auth::{Authorizer, Operation, User, assert_authorized};
use crate::error::Error;
use crate::event::Event;
use crate::executor;
use crate::notification::{self, Notification, NotificationSink};
use crate::projection::{Projection, ProjectionOptions, build_projection};
use crate::snapshot::{SnapshotStore, publish_snapshot};
use crate::storage::EventStore;
use crate::store::AggregateRuntime;

/// Collaborators and caller identity bound to an [`AggregateRuntime`].
///
/// `Clone` is cheap -- collaborators are `Arc`-wrapped.
#[derive(Clone)]
pub struct Connection {
    pub(crate) runtime: AggregateRuntime,
    pub(crate) event_store: Arc<dyn EventStore>,
    pub(crate) snapshot_store: Arc<dyn SnapshotStore>,
    pub(crate) sink: Arc<dyn NotificationSink>,
    pub(crate) authorizer: Arc<dyn Authorizer>,
    pub(crate) user: Option<User>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("runtime", &self.runtime)
            .field("user", &self.user.as_ref().map(|u| u.id.as_str()))
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// The caller identity this connection acts as.
    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn runtime(&self) -> &AggregateRuntime {
        &self.runtime
    }

    /// Build the current projection of one instance.
    ///
    /// # Arguments
    ///
    /// * `aggregate_name` - Registered aggregate name.
    /// * `aggregate_id` - Instance to project.
    /// * `options` - What to return for an instance with no history.
    ///
    /// # Returns
    ///
    /// The projection, or `None` when the instance has neither snapshot nor
    /// events and `options.miss_value` is [`Absent`](crate::MissValue::Absent).
    ///
    /// # Errors
    ///
    /// * [`Error::UnknownAggregate`] -- no aggregate is registered under the name.
    /// * [`Error::Unauthorized`] -- the authorizer denied `getProjection`.
    /// * [`Error::Io`] -- a store failed.
    /// * The first event's classification error, only when the runtime is
    ///   configured with `throw_on_invalid_event`.
    pub async fn get_projection(
        &self,
        aggregate_name: &str,
        aggregate_id: &str,
        options: ProjectionOptions,
    ) -> Result<Option<Projection>, Error> {
        let definition = self.runtime.resolve(aggregate_name)?;
        assert_authorized(
            self.authorizer.as_ref(),
            self.user.as_ref(),
            &Operation::get_projection(aggregate_name, aggregate_id),
        )
        .await?;

        build_projection(self, aggregate_name, definition, aggregate_id, options.miss_value).await
    }

    /// Build the current projection and store it as the instance's snapshot.
    ///
    /// # Returns
    ///
    /// The published projection, or `None` if the instance has no history.
    ///
    /// # Errors
    ///
    /// Same as [`get_projection`](Self::get_projection), authorized as
    /// `updateSnapshot`.
    pub async fn update_snapshot(
        &self,
        aggregate_name: &str,
        aggregate_id: &str,
    ) -> Result<Option<Projection>, Error> {
        publish_snapshot(self, aggregate_name, aggregate_id).await
    }

    /// Execute a command and commit the event it derives.
    ///
    /// # Returns
    ///
    /// The committed event.
    ///
    /// # Errors
    ///
    /// See [`Error`]; write conflicts are retried and only surface as
    /// [`Error::MaxCommandAttempts`] once the budget is spent.
    pub async fn run_command(
        &self,
        aggregate_name: &str,
        aggregate_id: &str,
        command_name: &str,
        params: Vec<Value>,
    ) -> Result<Event, Error> {
        executor::run_command(self, aggregate_name, aggregate_id, command_name, &params).await
    }

    /// Scope the three operations to one aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownAggregate`] if `aggregate_name` is not registered.
    pub fn aggregate(&self, aggregate_name: &str) -> Result<AggregateClient, Error> {
        self.runtime.resolve(aggregate_name)?;
        Ok(AggregateClient {
            conn: self.clone(),
            aggregate_name: aggregate_name.to_owned(),
        })
    }

    pub(crate) async fn notify(&self, notification: Notification) {
        notification::emit(self.sink.as_ref(), notification).await;
    }
}

/// A [`Connection`] scoped to one aggregate.
#[derive(Debug, Clone)]
pub struct AggregateClient {
    conn: Connection,
    aggregate_name: String,
}

impl AggregateClient {
    pub fn aggregate_name(&self) -> &str {
        &self.aggregate_name
    }

    pub async fn get_projection(
        &self,
        aggregate_id: &str,
        options: ProjectionOptions,
    ) -> Result<Option<Projection>, Error> {
        self.conn
            .get_projection(&self.aggregate_name, aggregate_id, options)
            .await
    }

    pub async fn update_snapshot(&self, aggregate_id: &str) -> Result<Option<Projection>, Error> {
        self.conn.update_snapshot(&self.aggregate_name, aggregate_id).await
    }

    pub async fn run_command(
        &self,
        aggregate_id: &str,
        command_name: &str,
        params: Vec<Value>,
    ) -> Result<Event, Error> {
        self.conn
            .run_command(&self.aggregate_name, aggregate_id, command_name, params)
            .await
    }
}

/// Builder for [`Connection`]. Obtained from [`AggregateRuntime::connect`].
///
/// The event store, snapshot store, notification sink and authorizer are
/// required; the user is optional.
pub struct ConnectionBuilder {
    runtime: AggregateRuntime,
    event_store: Option<Arc<dyn EventStore>>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
    sink: Option<Arc<dyn NotificationSink>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    user: Option<User>,
}

impl ConnectionBuilder {
    pub(crate) fn new(runtime: AggregateRuntime) -> Self {
        Self {
            runtime,
            event_store: None,
            snapshot_store: None,
            sink: None,
            authorizer: None,
            user: None,
        }
    }

    pub fn event_store(mut self, store: impl EventStore + 'static) -> Self {
        self.event_store = Some(Arc::new(store));
        self
    }

    pub fn snapshot_store(mut self, store: impl SnapshotStore + 'static) -> Self {
        self.snapshot_store = Some(Arc::new(store));
        self
    }

    pub fn notification_sink(mut self, sink: impl NotificationSink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    pub fn authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Some(Arc::new(authorizer));
        self
    }

    /// Identity stamped into event metadata and handed to the authorizer.
    pub fn user(mut self, user: User) -> Self {
        self.user = Some(user);
        self
    }

    /// Bind the collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingCollaborator`] naming the first collaborator
    /// that was not supplied.
    pub fn open(self) -> Result<Connection, Error> {
        let conn = Connection {
            runtime: self.runtime,
            event_store: self
                .event_store
                .ok_or(Error::MissingCollaborator("event store"))?,
            snapshot_store: self
                .snapshot_store
                .ok_or(Error::MissingCollaborator("snapshot store"))?,
            sink: self
                .sink
                .ok_or(Error::MissingCollaborator("notification sink"))?,
            authorizer: self
                .authorizer
                .ok_or(Error::MissingCollaborator("authorizer"))?,
            user: self.user,
        };
        tracing::debug!(
            user = conn.user.as_ref().map(|u| u.id.as_str()).unwrap_or("<anonymous>"),
            "connection opened"
        );
        Ok(conn)
    }
}
