//! Command execution: derive one event from a command and commit it under
//! optimistic concurrency control.
//!
//! Each attempt rebuilds the projection from the stores, so a retry after a
//! write conflict always decides against the latest committed state. The
//! event store's conditional append is the only concurrency primitive; the
//! loop is bounded by the command's retry budget and never sleeps.

use serde_json::Value;
use tracing::Instrument;

use crate::auth::{Operation, assert_authorized};
use crate::connection::Connection;
use crate::error::Error;
use crate::event::{Event, assemble_event};
use crate::notification::{EventWritten, Notification};
use crate::projection::{MissValue, build_projection};

/// Run `command_name` against `aggregate_name/aggregate_id`.
///
/// # Arguments
///
/// * `conn` - Connection providing the stores, sink and caller identity.
/// * `aggregate_name` - Registered aggregate name.
/// * `aggregate_id` - Target instance.
/// * `command_name` - Name in the aggregate's command catalog.
/// * `params` - Positional command arguments.
///
/// # Returns
///
/// The committed event.
///
/// # Errors
///
/// * [`Error::UnknownAggregate`] / [`Error::UnknownCommand`] -- name lookup failed.
/// * [`Error::Unauthorized`] -- the authorizer denied `runCommand`.
/// * [`Error::InvalidCommandParams`] -- `validate_params` rejected `params`.
/// * [`Error::DuplicateAggregate`] / [`Error::AggregateNotFound`] -- the
///   create/non-create precondition failed.
/// * [`Error::InvalidEvent`] / [`Error::EventPayload`] /
///   [`Error::InvariantViolated`] -- the derived event was rejected.
/// * [`Error::MaxCommandAttempts`] -- every attempt hit a write conflict.
/// * [`Error::Io`] -- a store failed.
pub(crate) async fn run_command(
    conn: &Connection,
    aggregate_name: &str,
    aggregate_id: &str,
    command_name: &str,
    params: &[Value],
) -> Result<Event, Error> {
    let span = tracing::info_span!(
        "run_command",
        aggregate_name,
        aggregate_id,
        command = command_name
    );
    execute(conn, aggregate_name, aggregate_id, command_name, params)
        .instrument(span)
        .await
}

async fn execute(
    conn: &Connection,
    aggregate_name: &str,
    aggregate_id: &str,
    command_name: &str,
    params: &[Value],
) -> Result<Event, Error> {
    let definition = conn.runtime.resolve(aggregate_name)?;
    let command = definition
        .commands()
        .get(command_name)
        .ok_or_else(|| Error::UnknownCommand {
            aggregate: aggregate_name.to_owned(),
            command: command_name.to_owned(),
        })?;

    assert_authorized(
        conn.authorizer.as_ref(),
        conn.user.as_ref(),
        &Operation::run_command(aggregate_name, aggregate_id, command_name),
    )
    .await?;

    command.validate_params(aggregate_id, params)?;

    let retries = command
        .retries()
        .unwrap_or(conn.runtime.config().default_command_retries);
    let attempts = retries.saturating_add(1);

    for attempt in 1..=attempts {
        // 1. Rebuild the current projection from the stores.
        let projection =
            build_projection(conn, aggregate_name, definition, aggregate_id, MissValue::Absent)
                .await?;

        // 2. Create/non-create precondition. Not retried.
        let (state, next_version) = match (projection, command.is_create_command()) {
            (Some(_), true) => {
                return Err(Error::DuplicateAggregate {
                    aggregate: aggregate_name.to_owned(),
                    id: aggregate_id.to_owned(),
                });
            }
            (None, false) => {
                return Err(Error::AggregateNotFound {
                    aggregate: aggregate_name.to_owned(),
                    id: aggregate_id.to_owned(),
                });
            }
            (Some(p), false) => (p.state, p.version + 1),
            (None, true) => (definition.initial_state(aggregate_id)?, 1),
        };

        // 3. Derive and assemble the event; it must pass the same checks
        //    replay runs, but here any failure is fatal.
        let spec = command.create_event(aggregate_id, params);
        let event = assemble_event(
            spec,
            aggregate_name,
            aggregate_id,
            conn.user.as_ref(),
            next_version,
        )?;
        definition.apply_checked(&state, &event)?;

        // 4. Conditional append.
        if conn.event_store.write_event(&event).await? {
            tracing::info!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                sequence_number = event.sequence_number,
                attempt,
                "event committed"
            );
            conn.notify(Notification::EventWritten(EventWritten {
                aggregate_name: aggregate_name.to_owned(),
                aggregate_id: aggregate_id.to_owned(),
                event_type: event.event_type.clone(),
            }))
            .await;
            return Ok(event);
        }

        tracing::debug!(
            attempt,
            attempts,
            sequence_number = next_version,
            "write conflict, retrying"
        );
    }

    tracing::warn!(attempts, "giving up after repeated write conflicts");
    Err(Error::MaxCommandAttempts { attempts })
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use crate::Connection;
    use crate::aggregate::test_fixtures::Library;
    use crate::auth::{AllowAll, Operation, OperationKind, User};
    use crate::error::{Error, Unauthorized};
    use crate::event::{Event, RecordedEvent};
    use crate::memory::{MemoryEventStore, MemoryNotificationSink, MemorySnapshotStore};
    use crate::notification::Notification;
    use crate::projection::ProjectionOptions;
    use crate::storage::EventStore;
    use crate::store::AggregateRuntime;

    /// Reports a conflict for the first `conflicts` writes, then delegates.
    struct Contended {
        inner: MemoryEventStore,
        conflicts: u32,
        writes: AtomicU32,
    }

    impl Contended {
        fn new(inner: MemoryEventStore, conflicts: u32) -> Self {
            Self {
                inner,
                conflicts,
                writes: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl EventStore for Contended {
        async fn get_events(
            &self,
            aggregate_name: &str,
            aggregate_id: &str,
            after_version: u64,
        ) -> io::Result<Vec<RecordedEvent>> {
            self.inner.get_events(aggregate_name, aggregate_id, after_version).await
        }

        async fn write_event(&self, event: &Event) -> io::Result<bool> {
            let n = self.writes.fetch_add(1, Ordering::SeqCst);
            if n < self.conflicts {
                return Ok(false);
            }
            self.inner.write_event(event).await
        }
    }

    struct Harness {
        conn: Connection,
        events: MemoryEventStore,
        sink: MemoryNotificationSink,
    }

    fn runtime() -> AggregateRuntime {
        AggregateRuntime::builder()
            .aggregate("library", Library)
            .build()
            .expect("runtime should build")
    }

    fn harness_with(store: Arc<dyn EventStore>, events: MemoryEventStore) -> Harness {
        let sink = MemoryNotificationSink::new();
        let conn = runtime()
            .connect()
            .event_store(store)
            .snapshot_store(MemorySnapshotStore::new())
            .notification_sink(sink.clone())
            .authorizer(AllowAll)
            .user(User::new("sally"))
            .open()
            .expect("connection should open");
        Harness { conn, events, sink }
    }

    fn harness() -> Harness {
        let events = MemoryEventStore::new();
        harness_with(Arc::new(events.clone()), events)
    }

    async fn create(conn: &Connection) {
        conn.run_command("library", "lib-1", "create", Vec::new())
            .await
            .expect("create should succeed");
    }

    #[tokio::test]
    async fn create_commits_first_event() {
        let h = harness();

        let event = h
            .conn
            .run_command("library", "lib-1", "create", Vec::new())
            .await
            .expect("create should succeed");

        assert_eq!(event.sequence_number, 1);
        assert_eq!(event.event_type, "CREATED");
        assert_eq!(event.metadata.user.as_ref().map(|u| u.id.as_str()), Some("sally"));
        assert_eq!(h.events.events("library", "lib-1").await.len(), 1);

        let notes = h.sink.notifications().await;
        assert!(
            matches!(notes.as_slice(), [Notification::EventWritten(w)] if w.event_type == "CREATED"),
            "got: {notes:?}"
        );
    }

    #[tokio::test]
    async fn create_on_existing_instance_is_duplicate() {
        let h = harness();
        create(&h.conn).await;

        let err = h
            .conn
            .run_command("library", "lib-1", "create", Vec::new())
            .await
            .expect_err("second create must fail");
        assert!(matches!(err, Error::DuplicateAggregate { .. }), "got: {err:?}");
        assert_eq!(h.events.events("library", "lib-1").await.len(), 1);
    }

    #[tokio::test]
    async fn non_create_on_missing_instance_is_not_found() {
        let h = harness();
        let err = h
            .conn
            .run_command("library", "lib-1", "setName", vec![json!("North Branch")])
            .await
            .expect_err("setName on missing instance must fail");
        assert!(matches!(err, Error::AggregateNotFound { .. }), "got: {err:?}");
        assert!(h.events.events("library", "lib-1").await.is_empty());
    }

    #[tokio::test]
    async fn invalid_params_write_nothing() {
        let h = harness();
        create(&h.conn).await;

        let err = h
            .conn
            .run_command("library", "lib-1", "setName", vec![json!("a")])
            .await
            .expect_err("short name must fail");
        assert!(
            matches!(err, Error::InvalidCommandParams(ref p) if p.0 == "name must be at least 4 characters"),
            "got: {err:?}"
        );
        assert_eq!(h.events.events("library", "lib-1").await.len(), 1);
    }

    #[tokio::test]
    async fn invariant_violation_is_fatal() {
        let h = harness();
        create(&h.conn).await;

        let err = h
            .conn
            .run_command("library", "lib-1", "activate", Vec::new())
            .await
            .expect_err("activation without books must fail");
        assert!(
            matches!(err, Error::InvariantViolated(ref e) if e.message == "An active library must have at least 1 book"),
            "got: {err:?}"
        );
        assert_eq!(h.events.events("library", "lib-1").await.len(), 1);
    }

    #[tokio::test]
    async fn payload_error_is_fatal() {
        let h = harness();
        create(&h.conn).await;

        let err = h
            .conn
            .run_command("library", "lib-1", "setCityName", Vec::new())
            .await
            .expect_err("missing city name must fail");
        assert!(matches!(err, Error::EventPayload(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn unknown_names_are_rejected() {
        let h = harness();

        let err = h
            .conn
            .run_command("museum", "m-1", "create", Vec::new())
            .await
            .expect_err("unknown aggregate must fail");
        assert!(matches!(err, Error::UnknownAggregate(ref n) if n == "museum"), "got: {err:?}");

        let err = h
            .conn
            .run_command("library", "lib-1", "demolish", Vec::new())
            .await
            .expect_err("unknown command must fail");
        assert!(matches!(err, Error::UnknownCommand { .. }), "got: {err:?}");
    }

    #[tokio::test]
    async fn conflicts_below_budget_are_retried() {
        let events = MemoryEventStore::new();
        let contended = Arc::new(Contended::new(events.clone(), 2));
        let h = harness_with(contended.clone(), events);

        let event = h
            .conn
            .run_command("library", "lib-1", "create", Vec::new())
            .await
            .expect("create should succeed after retries");

        assert_eq!(event.sequence_number, 1);
        assert_eq!(contended.writes.load(Ordering::SeqCst), 3);
        assert_eq!(h.events.events("library", "lib-1").await.len(), 1);
        assert_eq!(h.sink.notifications().await.len(), 1, "one EventWritten only");
    }

    #[tokio::test]
    async fn exhausting_the_budget_fails_without_writing() {
        let events = MemoryEventStore::new();
        // Default budget is 3 retries, so 4 attempts.
        let contended = Arc::new(Contended::new(events.clone(), u32::MAX));
        let h = harness_with(contended.clone(), events);

        let err = h
            .conn
            .run_command("library", "lib-1", "create", Vec::new())
            .await
            .expect_err("create must give up");

        assert!(matches!(err, Error::MaxCommandAttempts { attempts: 4 }), "got: {err:?}");
        assert_eq!(contended.writes.load(Ordering::SeqCst), 4);
        assert!(h.events.events("library", "lib-1").await.is_empty());
        assert!(h.sink.notifications().await.is_empty());
    }

    #[tokio::test]
    async fn retry_sees_the_competing_write() {
        /// Lets a rival writer commit sequence 2 right before our first write.
        struct Raced {
            inner: MemoryEventStore,
            raced: AtomicU32,
        }

        #[async_trait]
        impl EventStore for Raced {
            async fn get_events(
                &self,
                aggregate_name: &str,
                aggregate_id: &str,
                after_version: u64,
            ) -> io::Result<Vec<RecordedEvent>> {
                self.inner.get_events(aggregate_name, aggregate_id, after_version).await
            }

            async fn write_event(&self, event: &Event) -> io::Result<bool> {
                if event.sequence_number == 2 && self.raced.fetch_add(1, Ordering::SeqCst) == 0 {
                    let rival = crate::event::assemble_event(
                        crate::event::EventSpec::new("BOOK_ADDED", json!({ "title": "Dune" })),
                        "library",
                        "lib-1",
                        None,
                        2,
                    )
                    .expect("rival event should assemble");
                    self.inner.write_event(&rival).await?;
                }
                self.inner.write_event(event).await
            }
        }

        let events = MemoryEventStore::new();
        let raced = Arc::new(Raced {
            inner: events.clone(),
            raced: AtomicU32::new(0),
        });
        let h = harness_with(raced, events);
        create(&h.conn).await;

        let event = h
            .conn
            .run_command("library", "lib-1", "setName", vec![json!("North Branch")])
            .await
            .expect("setName should succeed on retry");
        assert_eq!(event.sequence_number, 3, "retry must build on the rival event");

        let projection = h
            .conn
            .get_projection("library", "lib-1", ProjectionOptions::default())
            .await
            .expect("get_projection should succeed")
            .expect("instance should exist");
        assert_eq!(projection.state["books"], json!(["Dune"]));
        assert_eq!(projection.state["libraryName"], "North Branch");
    }

    #[tokio::test]
    async fn per_command_retries_override_default() {
        let seeded = harness();
        create(&seeded.conn).await;

        let runtime = AggregateRuntime::builder()
            .aggregate("library", Library)
            .default_command_retries(0)
            .build()
            .expect("runtime should build");
        let connect = |conflicts: u32| {
            runtime
                .connect()
                .event_store(Contended::new(seeded.events.clone(), conflicts))
                .snapshot_store(MemorySnapshotStore::new())
                .notification_sink(MemoryNotificationSink::new())
                .authorizer(AllowAll)
                .open()
                .expect("connection should open")
        };

        // setName carries its own budget of 3 retries.
        connect(3)
            .run_command("library", "lib-1", "setName", vec![json!("North Branch")])
            .await
            .expect("setName should succeed on its fourth attempt");

        // setCityName falls back to the runtime default of 0 retries.
        let err = connect(1)
            .run_command("library", "lib-1", "setCityName", vec![json!("Omaha")])
            .await
            .expect_err("a single conflict exhausts a zero budget");
        assert!(matches!(err, Error::MaxCommandAttempts { attempts: 1 }), "got: {err:?}");
    }

    #[tokio::test]
    async fn authorization_runs_before_any_store_access() {
        struct Unreachable;

        #[async_trait]
        impl EventStore for Unreachable {
            async fn get_events(&self, _: &str, _: &str, _: u64) -> io::Result<Vec<RecordedEvent>> {
                panic!("event store must not be read");
            }

            async fn write_event(&self, _: &Event) -> io::Result<bool> {
                panic!("event store must not be written");
            }
        }

        let conn = runtime()
            .connect()
            .event_store(Arc::new(Unreachable))
            .snapshot_store(MemorySnapshotStore::new())
            .notification_sink(MemoryNotificationSink::new())
            .authorizer(|_: Option<&User>, op: &Operation| {
                if op.kind == OperationKind::RunCommand {
                    Err(Unauthorized::new("read only"))
                } else {
                    Ok(())
                }
            })
            .open()
            .expect("connection should open");

        let err = conn
            .run_command("library", "lib-1", "create", Vec::new())
            .await
            .expect_err("command must be denied");
        assert!(matches!(err, Error::Unauthorized(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn projection_after_commands_reflects_them() {
        let h = harness();
        create(&h.conn).await;
        h.conn
            .run_command("library", "lib-1", "setName", vec![json!("North Branch")])
            .await
            .expect("setName should succeed");

        let projection = h
            .conn
            .get_projection("library", "lib-1", ProjectionOptions::default())
            .await
            .expect("get_projection should succeed")
            .expect("instance should exist");
        assert_eq!(projection.version, 2);
        assert_eq!(projection.state["libraryName"], Value::from("North Branch"));
    }
}
