//! Per-instance projections: the current state of one aggregate instance
//! plus the bookkeeping for quarantined and resolved events.
//!
//! A projection is rebuilt on every read by folding the events written after
//! the latest snapshot (or after version 0 when there is none). Events that
//! fail the structural check, `apply_event`, or `validate_state` are
//! quarantined: recorded in `invalid_events`, never applied, but still
//! counted towards `version`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::aggregate::{Aggregate, AggregateDefinition};
use crate::connection::Connection;
use crate::error::{Error, EventError, EventErrorKind};
use crate::event::{Event, RecordedEvent};
use crate::notification::{InvalidEventsFound, Notification};

/// The materialized state of one aggregate instance.
///
/// Serialized as `{ "state", "version", "invalidEvents", "ignoredEvents" }`,
/// which is also the shape snapshot stores persist.
///
/// # Invariants
///
/// - `version` is the sequence number of the last event folded in, whether
///   it was valid or not.
/// - An event id is in at most one of `invalid_events` and
///   `ignored_events`, and only ever moves from the former to the latter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Projection<S = Value> {
    pub state: S,
    pub version: u64,
    #[serde(default)]
    pub invalid_events: Vec<InvalidEvent>,
    #[serde(default)]
    pub ignored_events: Vec<IgnoredEvent>,
}

/// A quarantined event and the reason it was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidEvent {
    pub event_id: Uuid,
    pub error: EventError,
}

/// A formerly quarantined event that a later event resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IgnoredEvent {
    pub event_id: Uuid,
    pub resolving_event_id: Uuid,
}

impl<S> Projection<S> {
    /// The zero-state projection: version 0, nothing quarantined.
    pub fn new(state: S) -> Self {
        Self {
            state,
            version: 0,
            invalid_events: Vec::new(),
            ignored_events: Vec::new(),
        }
    }

    /// Whether `event_id` is currently quarantined.
    pub fn is_invalid(&self, event_id: Uuid) -> bool {
        self.invalid_events.iter().any(|e| e.event_id == event_id)
    }

    /// Move every id listed in `event.metadata.resolves_event_ids` that is
    /// currently quarantined over to `ignored_events`, in listed order.
    fn resolve(&mut self, event: &Event) {
        for id in &event.metadata.resolves_event_ids {
            if let Some(pos) = self.invalid_events.iter().position(|e| e.event_id == *id) {
                self.invalid_events.remove(pos);
                self.ignored_events.push(IgnoredEvent {
                    event_id: *id,
                    resolving_event_id: event.event_id,
                });
            }
        }
    }
}

impl Projection<Value> {
    /// Deserialize the JSON state into the aggregate's typed state.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the state does not match `S`.
    pub fn decode<S: DeserializeOwned>(self) -> serde_json::Result<Projection<S>> {
        Ok(Projection {
            state: serde_json::from_value(self.state)?,
            version: self.version,
            invalid_events: self.invalid_events,
            ignored_events: self.ignored_events,
        })
    }
}

impl<S: Serialize> Projection<S> {
    /// Serialize the typed state into JSON.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the state cannot be serialized.
    pub fn encode(self) -> serde_json::Result<Projection<Value>> {
        Ok(Projection {
            state: serde_json::to_value(self.state)?,
            version: self.version,
            invalid_events: self.invalid_events,
            ignored_events: self.ignored_events,
        })
    }
}

/// What [`get_projection`](crate::Connection::get_projection) returns for an
/// instance with no snapshot and no events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MissValue {
    /// Return `None`.
    #[default]
    Absent,
    /// Return the zero-state projection built from `initial_state`.
    NewProjection,
}

/// Options for [`get_projection`](crate::Connection::get_projection).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectionOptions {
    pub miss_value: MissValue,
}

impl ProjectionOptions {
    /// Return a zero-state projection instead of `None` on a miss.
    pub fn or_new() -> Self {
        Self {
            miss_value: MissValue::NewProjection,
        }
    }
}

/// Result of folding a batch of events into a projection.
#[derive(Debug)]
pub(crate) struct Fold<S> {
    pub projection: Projection<S>,
    /// Every id quarantined during this fold, in discovery order, including
    /// ones a later event in the same fold resolved.
    pub new_invalid: Vec<Uuid>,
}

/// Fold `events` into `projection`, quarantining the ones that fail.
///
/// # Errors
///
/// Only when `throw_on_invalid_event` is set: the first classification
/// failure is returned and the fold stops.
pub(crate) fn fold_events<A: Aggregate>(
    aggregate: &A,
    mut projection: Projection<A::State>,
    events: Vec<RecordedEvent>,
    throw_on_invalid_event: bool,
) -> Result<Fold<A::State>, EventError> {
    let mut new_invalid = Vec::new();

    for recorded in events {
        let event_id = recorded.event_id;
        let sequence_number = recorded.sequence_number;

        if sequence_number != projection.version + 1 {
            tracing::warn!(
                %event_id,
                sequence_number,
                expected = projection.version + 1,
                "event store returned a non-contiguous sequence number"
            );
        }

        match classify(aggregate, &projection.state, recorded) {
            Ok((event, next)) => {
                projection.state = next;
                projection.version = sequence_number;
                projection.resolve(&event);
            }
            Err(error) if throw_on_invalid_event => return Err(error),
            Err(error) => {
                tracing::warn!(
                    %event_id,
                    sequence_number,
                    kind = %error.kind,
                    message = %error.message,
                    "quarantining invalid event"
                );
                projection.invalid_events.push(InvalidEvent { event_id, error });
                projection.version = sequence_number;
                new_invalid.push(event_id);
            }
        }
    }

    Ok(Fold {
        projection,
        new_invalid,
    })
}

/// Run one event through the structural check, `apply_event` and
/// `validate_state`, in that order.
fn classify<A: Aggregate>(
    aggregate: &A,
    state: &A::State,
    recorded: RecordedEvent,
) -> Result<(Event, A::State), EventError> {
    let event = Event::try_from(recorded)?;
    let next = aggregate.apply_event(state, &event)?;
    aggregate
        .validate_state(&next)
        .map_err(|e| EventError {
            kind: EventErrorKind::InvariantViolated,
            ..e
        })?;
    Ok((event, next))
}

/// Build the current projection of one instance: snapshot (if any) plus the
/// events written after it.
///
/// Does not authorize; callers run the gate first.
///
/// # Errors
///
/// Returns [`Error::Io`] if a store fails, [`Error::State`] if a snapshot's
/// state does not match the aggregate, or the classification error of the
/// first bad event when `throw_on_invalid_event` is configured.
pub(crate) async fn build_projection(
    conn: &Connection,
    aggregate_name: &str,
    definition: &AggregateDefinition,
    aggregate_id: &str,
    miss_value: MissValue,
) -> Result<Option<Projection>, Error> {
    let snapshot = conn
        .snapshot_store
        .get_snapshot(aggregate_name, aggregate_id)
        .await?;
    let has_snapshot = snapshot.is_some();

    let base = match snapshot {
        Some(snapshot) => snapshot,
        None => Projection::new(definition.initial_state(aggregate_id)?),
    };

    let events = conn
        .event_store
        .get_events(aggregate_name, aggregate_id, base.version)
        .await?;

    tracing::debug!(
        aggregate_name,
        aggregate_id,
        has_snapshot,
        from_version = base.version,
        fetched = events.len(),
        "building projection"
    );

    if !has_snapshot && events.is_empty() {
        return Ok(match miss_value {
            MissValue::Absent => None,
            MissValue::NewProjection => Some(base),
        });
    }

    let throw = conn.runtime.config().throw_on_invalid_event;
    let Fold {
        projection,
        new_invalid,
    } = definition.fold(base, events, throw)?;

    if !new_invalid.is_empty() {
        conn.notify(Notification::InvalidEventsFound(InvalidEventsFound {
            aggregate_name: aggregate_name.to_owned(),
            aggregate_id: aggregate_id.to_owned(),
            event_ids: new_invalid,
        }))
        .await;
    }

    Ok(Some(projection))
}
