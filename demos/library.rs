//! Self-contained walkthrough of the runtime with the in-memory
//! collaborators: commands, quarantine of bad history, resolution and
//! snapshotting.
//!
//! Run with: `RUST_LOG=eventfold_runtime=debug cargo run --example library`

use eventfold_runtime::memory::{MemoryEventStore, MemoryNotificationSink, MemorySnapshotStore};
use eventfold_runtime::{
    Aggregate, AggregateRuntime, Command, CommandCatalog, Event, EventError, EventMetadata,
    EventSpec, Operation, OperationKind, ParamsError, ProjectionOptions, RecordedEvent,
    Unauthorized, User, param,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Library aggregate
// ---------------------------------------------------------------------------

struct Library;

/// State of one library branch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LibraryState {
    library_id: String,
    library_name: Option<String>,
    city_name: Option<String>,
    active: bool,
    books: Vec<String>,
}

fn required(event: &Event, field: &str) -> Result<String, EventError> {
    event
        .payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| EventError::payload(format!("event payload missing \"{field}\"")))
}

impl Aggregate for Library {
    type State = LibraryState;

    fn initial_state(&self, aggregate_id: &str) -> LibraryState {
        LibraryState {
            library_id: aggregate_id.to_owned(),
            ..LibraryState::default()
        }
    }

    fn apply_event(&self, state: &LibraryState, event: &Event) -> Result<LibraryState, EventError> {
        let mut next = state.clone();
        match event.event_type.as_str() {
            "CREATED" => {}
            "NAME_SET" => next.library_name = Some(required(event, "name")?),
            "CITY_NAME_SET" => next.city_name = Some(required(event, "name")?),
            "BOOK_ADDED" => next.books.push(required(event, "title")?),
            "ACTIVATED" => next.active = true,
            "DEACTIVATED" => next.active = false,
            other => return Err(EventError::payload(format!("unknown event type {other}"))),
        }
        Ok(next)
    }

    fn validate_state(&self, state: &LibraryState) -> Result<(), EventError> {
        if state.active && state.books.is_empty() {
            return Err(EventError::invariant(
                "An active library must have at least 1 book",
            ));
        }
        Ok(())
    }

    fn commands(&self) -> CommandCatalog {
        CommandCatalog::new()
            .command("create", Create)
            .command("setName", SetName)
            .command("setCityName", SetCityName)
            .command("addBook", AddBook)
            .command("activate", Flag("ACTIVATED"))
            .command("deactivate", Flag("DEACTIVATED"))
    }
}

struct Create;

impl Command for Create {
    fn is_create_command(&self) -> bool {
        true
    }

    fn create_event(&self, aggregate_id: &str, _params: &[Value]) -> EventSpec {
        EventSpec::new("CREATED", json!({ "libraryId": aggregate_id }))
    }
}

struct SetName;

impl Command for SetName {
    fn retries(&self) -> Option<u32> {
        Some(3)
    }

    fn validate_params(&self, _aggregate_id: &str, params: &[Value]) -> Result<(), ParamsError> {
        let name: String = param(params, 0)?;
        if name.chars().count() < 4 {
            return Err(ParamsError::new("name must be at least 4 characters"));
        }
        Ok(())
    }

    fn create_event(&self, _aggregate_id: &str, params: &[Value]) -> EventSpec {
        EventSpec::new("NAME_SET", json!({ "name": params.first() }))
    }
}

/// `setCityName(name, [resolvedEventIds])`.
struct SetCityName;

impl Command for SetCityName {
    fn validate_params(&self, _aggregate_id: &str, params: &[Value]) -> Result<(), ParamsError> {
        param::<String>(params, 0)?;
        if params.len() > 1 {
            param::<Vec<Uuid>>(params, 1)?;
        }
        Ok(())
    }

    fn create_event(&self, _aggregate_id: &str, params: &[Value]) -> EventSpec {
        let spec = EventSpec::new("CITY_NAME_SET", json!({ "name": params.first() }));
        match param::<Vec<Uuid>>(params, 1) {
            Ok(ids) => spec.resolving(ids),
            Err(_) => spec,
        }
    }
}

struct AddBook;

impl Command for AddBook {
    fn validate_params(&self, _aggregate_id: &str, params: &[Value]) -> Result<(), ParamsError> {
        param::<String>(params, 0).map(drop)
    }

    fn create_event(&self, _aggregate_id: &str, params: &[Value]) -> EventSpec {
        EventSpec::new("BOOK_ADDED", json!({ "title": params.first() }))
    }
}

struct Flag(&'static str);

impl Command for Flag {
    fn create_event(&self, _aggregate_id: &str, _params: &[Value]) -> EventSpec {
        EventSpec::new(self.0, json!({}))
    }
}

/// Librarians may do anything; everyone else may only read.
fn librarians_only(user: Option<&User>, op: &Operation) -> Result<(), Unauthorized> {
    let is_librarian = user.is_some_and(|u| u.claims.get("role") == Some(&json!("librarian")));
    if is_librarian || op.kind == OperationKind::GetProjection {
        Ok(())
    } else {
        Err(Unauthorized::new(format!("{} requires the librarian role", op.kind)))
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let runtime = AggregateRuntime::builder()
        .aggregate("library", Library)
        .build()?;

    let events = MemoryEventStore::new();
    let snapshots = MemorySnapshotStore::new();
    let sink = MemoryNotificationSink::new();

    let open = |user: User| {
        runtime
            .connect()
            .event_store(events.clone())
            .snapshot_store(snapshots.clone())
            .notification_sink(sink.clone())
            .authorizer(librarians_only)
            .user(user)
            .open()
    };
    let sally = open(User::new("sally").with_claim("role", json!("librarian")))?;
    let mary = open(User::new("mary"))?;

    // Sally sets up a branch.
    let library = sally.aggregate("library")?;
    library.run_command("north", "create", vec![]).await?;
    library
        .run_command("north", "setName", vec![json!("North Branch")])
        .await?;
    library
        .run_command("north", "addBook", vec![json!("Dune")])
        .await?;
    library.run_command("north", "activate", vec![]).await?;

    // Mary can read but not write.
    let projection = mary
        .get_projection("library", "north", ProjectionOptions::default())
        .await?;
    println!("mary reads: {}", serde_json::to_string_pretty(&projection)?);
    if let Err(e) = mary
        .run_command("library", "north", "deactivate", vec![])
        .await
    {
        println!("mary writes: {e}");
    }

    // An importer wrote a city change without a name; it gets quarantined.
    let bad = RecordedEvent {
        event_id: Uuid::new_v4(),
        aggregate_name: "library".to_owned(),
        aggregate_id: "north".to_owned(),
        sequence_number: 5,
        event_type: Some("CITY_NAME_SET".to_owned()),
        payload: Some(json!({})),
        metadata: Some(EventMetadata::default()),
    };
    let bad_id = bad.event_id;
    events.force_write(bad).await;

    let projection = library
        .get_projection("north", ProjectionOptions::default())
        .await?
        .ok_or("north should exist")?;
    println!(
        "version {} with {} invalid event(s)",
        projection.version,
        projection.invalid_events.len()
    );

    // Resolve it with a corrected event, then snapshot.
    library
        .run_command("north", "setCityName", vec![json!("Duluth"), json!([bad_id])])
        .await?;
    let snapshot = library
        .update_snapshot("north")
        .await?
        .ok_or("north should exist")?;
    let typed = snapshot.decode::<LibraryState>()?;
    println!(
        "snapshot v{}: {:?}, ignored {:?}",
        typed.version, typed.state, typed.ignored_events
    );

    for notification in sink.take().await {
        println!("notification: {}", serde_json::to_string(&notification)?);
    }

    Ok(())
}
