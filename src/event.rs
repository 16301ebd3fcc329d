//! Event shapes: the well-formed [`Event`], the lenient [`RecordedEvent`]
//! returned by event stores, and the [`EventSpec`] produced by commands.
//!
//! Converting a `RecordedEvent` into an `Event` is the structural check the
//! projection builder runs on every replayed event, and the command executor
//! runs on every freshly generated one.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::auth::User;
use crate::error::EventError;

/// Metadata carried by every event.
///
/// `resolves_event_ids` marks earlier quarantined events as resolved by this
/// one. Any other keys a command adds are kept in `extra` and round-trip
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Identity of the caller whose command produced the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    /// Ids of previously invalid events this event resolves, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolves_event_ids: Vec<Uuid>,
    /// Additional command-supplied metadata.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A well-formed, immutable event belonging to one aggregate instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: Uuid,
    pub aggregate_name: String,
    pub aggregate_id: String,
    /// Event type tag (e.g. `"NAME_SET"`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Domain payload; always a JSON object.
    pub payload: Value,
    pub metadata: EventMetadata,
    /// Position within the instance's stream, starting at 1.
    pub sequence_number: u64,
}

impl Event {
    /// Deserialize the payload into a typed value.
    ///
    /// Aggregates use this inside `apply_event`; a mismatch is reported as an
    /// [`EventPayload`](crate::EventErrorKind::EventPayload) error.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] of kind `EventPayload` if the payload does not
    /// match `T`.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, EventError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| EventError::payload(format!("{} payload: {e}", self.event_type)))
    }
}

/// An event as returned by an [`EventStore`](crate::EventStore).
///
/// Stores are not trusted to hand back well-formed events: `type`,
/// `payload` and `metadata` may be missing. `TryFrom<RecordedEvent> for
/// Event` performs the structural check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedEvent {
    pub event_id: Uuid,
    pub aggregate_name: String,
    pub aggregate_id: String,
    pub sequence_number: u64,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
}

impl From<Event> for RecordedEvent {
    fn from(event: Event) -> Self {
        Self {
            event_id: event.event_id,
            aggregate_name: event.aggregate_name,
            aggregate_id: event.aggregate_id,
            sequence_number: event.sequence_number,
            event_type: Some(event.event_type),
            payload: Some(event.payload),
            metadata: Some(event.metadata),
        }
    }
}

impl TryFrom<RecordedEvent> for Event {
    type Error = EventError;

    fn try_from(recorded: RecordedEvent) -> Result<Self, Self::Error> {
        let event_type = recorded
            .event_type
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| EventError::invalid_event("\"type\" is required"))?;

        let payload = match recorded.payload {
            None | Some(Value::Null) => {
                return Err(EventError::invalid_event("\"payload\" is required"));
            }
            Some(p) if !(p.is_object() || p.is_array()) => {
                return Err(EventError::invalid_event(
                    "\"payload\" must be an object or array",
                ));
            }
            Some(p) => p,
        };

        let metadata = recorded
            .metadata
            .ok_or_else(|| EventError::invalid_event("\"metadata\" is required"))?;

        if recorded.sequence_number == 0 {
            return Err(EventError::invalid_event(
                "\"sequenceNumber\" must be a positive integer",
            ));
        }

        Ok(Self {
            event_id: recorded.event_id,
            aggregate_name: recorded.aggregate_name,
            aggregate_id: recorded.aggregate_id,
            event_type,
            payload,
            metadata,
            sequence_number: recorded.sequence_number,
        })
    }
}

/// The partial event a [`Command`](crate::Command) derives from its
/// arguments. The executor fills in id, aggregate identity, user and
/// sequence number.
///
/// # Examples
///
/// ```
/// use eventfold_runtime::EventSpec;
/// use serde_json::json;
///
/// let spec = EventSpec::new("NAME_SET", json!({ "name": "North Branch" }))
///     .with_metadata("source", json!("import"));
/// assert_eq!(spec.event_type, "NAME_SET");
/// assert_eq!(spec.metadata["source"], "import");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventSpec {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    /// Merged over `{ "user": <caller> }` when the event is assembled.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl EventSpec {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            metadata: Map::new(),
        }
    }

    /// Add one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Mark previously quarantined events as resolved by this one.
    pub fn resolving(mut self, event_ids: impl IntoIterator<Item = Uuid>) -> Self {
        let ids = event_ids
            .into_iter()
            .map(|id| Value::String(id.to_string()))
            .collect();
        self.metadata
            .insert("resolvesEventIds".to_owned(), Value::Array(ids));
        self
    }
}

/// Turn an [`EventSpec`] into a full event for `sequence_number`, running
/// the same structural check replay uses.
///
/// Metadata is `{ user, ...spec.metadata }`: keys from `spec` win.
///
/// # Errors
///
/// Returns an `InvalidEvent` [`EventError`] if the [`EventSpec`] lacks a type
/// or payload, or if its metadata does not have the expected shape.
pub(crate) fn assemble_event(
    spec: EventSpec,
    aggregate_name: &str,
    aggregate_id: &str,
    user: Option<&User>,
    sequence_number: u64,
) -> Result<Event, EventError> {
    let mut metadata: EventMetadata = serde_json::from_value(Value::Object(spec.metadata))
        .map_err(|e| EventError::invalid_event(format!("\"metadata\" is malformed: {e}")))?;
    if metadata.user.is_none() {
        metadata.user = user.cloned();
    }

    let recorded = RecordedEvent {
        event_id: Uuid::new_v4(),
        aggregate_name: aggregate_name.to_owned(),
        aggregate_id: aggregate_id.to_owned(),
        sequence_number,
        event_type: Some(spec.event_type),
        payload: Some(spec.payload),
        metadata: Some(metadata),
    };
    Event::try_from(recorded)
}
