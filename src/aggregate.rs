//! Aggregate trait and the type-erased definition the runtime registers.

use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::command::CommandCatalog;
use crate::error::{Error, EventError, EventErrorKind};
use crate::event::{Event, RecordedEvent};
use crate::projection::{Fold, Projection, fold_events};

/// A domain aggregate whose state is derived from its event history.
///
/// # Associated Types
///
/// - `State`: the per-instance state folded from events. It is persisted in
///   snapshots as JSON, so it must round-trip through serde.
///
/// # Contract
///
/// - [`apply_event`](Aggregate::apply_event) and
///   [`validate_state`](Aggregate::validate_state) must be pure: no I/O, no
///   side effects. They are re-run on every projection build.
/// - `apply_event` signals a rejected event with an
///   [`EventError`]; `validate_state` signals a broken invariant. Whatever
///   kind `validate_state` reports, the runtime classifies it as
///   [`InvariantViolated`](EventErrorKind::InvariantViolated).
pub trait Aggregate: Send + Sync + 'static {
    type State: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// State of a brand-new instance with no events.
    fn initial_state(&self, aggregate_id: &str) -> Self::State;

    /// Apply a single event to produce the next state.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] (normally of kind `EventPayload`) when the event
    /// cannot be applied to `state`.
    fn apply_event(&self, state: &Self::State, event: &Event) -> Result<Self::State, EventError>;

    /// Check the invariants of a state produced by `apply_event`.
    fn validate_state(&self, _state: &Self::State) -> Result<(), EventError> {
        Ok(())
    }

    /// The commands this aggregate accepts.
    fn commands(&self) -> CommandCatalog;
}

/// Object-safe view of an [`Aggregate`] working on JSON state, so aggregates
/// with different `State` types can share one name-keyed registry.
pub(crate) trait DynAggregate: Send + Sync {
    fn initial_state(&self, aggregate_id: &str) -> serde_json::Result<Value>;

    fn fold(
        &self,
        base: Projection,
        events: Vec<RecordedEvent>,
        throw_on_invalid_event: bool,
    ) -> Result<Fold<Value>, Error>;

    fn apply_checked(&self, state: &Value, event: &Event) -> Result<Value, Error>;
}

struct Erased<A>(A);

impl<A: Aggregate> DynAggregate for Erased<A> {
    fn initial_state(&self, aggregate_id: &str) -> serde_json::Result<Value> {
        serde_json::to_value(self.0.initial_state(aggregate_id))
    }

    fn fold(
        &self,
        base: Projection,
        events: Vec<RecordedEvent>,
        throw_on_invalid_event: bool,
    ) -> Result<Fold<Value>, Error> {
        let base = base.decode::<A::State>()?;
        let Fold {
            projection,
            new_invalid,
        } = fold_events(&self.0, base, events, throw_on_invalid_event)?;
        Ok(Fold {
            projection: projection.encode()?,
            new_invalid,
        })
    }

    fn apply_checked(&self, state: &Value, event: &Event) -> Result<Value, Error> {
        let state: A::State = serde_json::from_value(state.clone())?;
        let next = self.0.apply_event(&state, event)?;
        self.0.validate_state(&next).map_err(|e| EventError {
            kind: EventErrorKind::InvariantViolated,
            ..e
        })?;
        Ok(serde_json::to_value(next)?)
    }
}

/// An aggregate as registered with the runtime: its rules plus the command
/// catalog it exposed at registration time.
#[derive(Clone)]
pub struct AggregateDefinition {
    rules: Arc<dyn DynAggregate>,
    commands: CommandCatalog,
}

impl AggregateDefinition {
    pub fn new<A: Aggregate>(aggregate: A) -> Self {
        let commands = aggregate.commands();
        Self {
            rules: Arc::new(Erased(aggregate)),
            commands,
        }
    }

    pub fn commands(&self) -> &CommandCatalog {
        &self.commands
    }

    pub(crate) fn initial_state(&self, aggregate_id: &str) -> serde_json::Result<Value> {
        self.rules.initial_state(aggregate_id)
    }

    pub(crate) fn fold(
        &self,
        base: Projection,
        events: Vec<RecordedEvent>,
        throw_on_invalid_event: bool,
    ) -> Result<Fold<Value>, Error> {
        self.rules.fold(base, events, throw_on_invalid_event)
    }

    /// Apply `event` to `state` and validate the result. Any failure is
    /// fatal to the caller; nothing is quarantined here.
    pub(crate) fn apply_checked(&self, state: &Value, event: &Event) -> Result<Value, Error> {
        self.rules.apply_checked(state, event)
    }
}

impl<A: Aggregate> From<A> for AggregateDefinition {
    fn from(aggregate: A) -> Self {
        Self::new(aggregate)
    }
}

impl std::fmt::Debug for AggregateDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateDefinition")
            .field("commands", &self.commands)
            .finish_non_exhaustive()
    }
}
