//! Crate-level error types for projection building and command execution.

use std::io;

use serde::{Deserialize, Serialize};

/// Classification of an event that could not be folded into a projection.
///
/// During replay these kinds are quarantinable: the event is recorded in
/// [`Projection::invalid_events`](crate::Projection::invalid_events) and the
/// fold continues. During command execution they are fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventErrorKind {
    /// The event is structurally malformed (missing type, payload or metadata).
    #[serde(rename = "InvalidEventError")]
    InvalidEvent,
    /// The aggregate's `apply_event` rejected the event.
    #[serde(rename = "EventPayloadError")]
    EventPayload,
    /// The state produced by the event failed `validate_state`.
    #[serde(rename = "InvariantViolatedError")]
    InvariantViolated,
}

impl std::fmt::Display for EventErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InvalidEvent => "InvalidEventError",
            Self::EventPayload => "EventPayloadError",
            Self::InvariantViolated => "InvariantViolatedError",
        };
        f.write_str(name)
    }
}

/// Why a single event was rejected, as stored alongside its id in a
/// projection's `invalid_events`.
///
/// Serialized as `{ "kind": "EventPayloadError", "message": "..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct EventError {
    /// Which check the event failed.
    pub kind: EventErrorKind,
    /// Human-readable description of the failure.
    pub message: String,
}

impl EventError {
    /// A structural failure: the event is missing a required field.
    pub fn invalid_event(message: impl Into<String>) -> Self {
        Self {
            kind: EventErrorKind::InvalidEvent,
            message: message.into(),
        }
    }

    /// A domain failure raised from [`Aggregate::apply_event`](crate::Aggregate::apply_event).
    pub fn payload(message: impl Into<String>) -> Self {
        Self {
            kind: EventErrorKind::EventPayload,
            message: message.into(),
        }
    }

    /// An invariant failure raised from
    /// [`Aggregate::validate_state`](crate::Aggregate::validate_state).
    pub fn invariant(message: impl Into<String>) -> Self {
        Self {
            kind: EventErrorKind::InvariantViolated,
            message: message.into(),
        }
    }
}

/// Returned by [`Command::validate_params`](crate::Command::validate_params)
/// when the caller-supplied arguments are unacceptable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ParamsError(pub String);

impl ParamsError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Returned by an [`Authorizer`](crate::Authorizer) to deny an operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct Unauthorized(pub String);

impl Unauthorized {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Error returned by every public runtime operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No aggregate is registered under this name.
    #[error("unknown aggregate: {0}")]
    UnknownAggregate(String),

    /// The aggregate has no command with this name.
    #[error("unknown command '{command}' on aggregate '{aggregate}'")]
    UnknownCommand { aggregate: String, command: String },

    /// An aggregate definition failed validation at construction time.
    #[error("invalid aggregate '{aggregate}': {reason}")]
    InvalidAggregate { aggregate: String, reason: String },

    /// A connection was opened without a required collaborator.
    #[error("{0} is required")]
    MissingCollaborator(&'static str),

    /// The command's `validate_params` rejected the arguments.
    #[error("invalid command params: {0}")]
    InvalidCommandParams(#[from] ParamsError),

    /// The authorizer denied the operation.
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] Unauthorized),

    /// A non-create command targeted an instance with no history.
    #[error("{aggregate} '{id}' does not exist")]
    AggregateNotFound { aggregate: String, id: String },

    /// A create command targeted an instance that already exists.
    #[error("{aggregate} '{id}' already exists")]
    DuplicateAggregate { aggregate: String, id: String },

    /// A structurally malformed event.
    #[error("invalid event: {}", .0.message)]
    InvalidEvent(EventError),

    /// The aggregate's `apply_event` rejected an event.
    #[error("event payload error: {}", .0.message)]
    EventPayload(EventError),

    /// The aggregate's `validate_state` rejected the resulting state.
    #[error("invariant violated: {}", .0.message)]
    InvariantViolated(EventError),

    /// Every write attempt hit a sequence-number conflict.
    #[error("optimistic concurrency conflict: gave up after {attempts} attempts")]
    MaxCommandAttempts { attempts: u32 },

    /// Aggregate state could not be converted to or from JSON.
    #[error("state serialization failed: {0}")]
    State(#[from] serde_json::Error),

    /// A storage collaborator failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<EventError> for Error {
    fn from(err: EventError) -> Self {
        match err.kind {
            EventErrorKind::InvalidEvent => Self::InvalidEvent(err),
            EventErrorKind::EventPayload => Self::EventPayload(err),
            EventErrorKind::InvariantViolated => Self::InvariantViolated(err),
        }
    }
}

impl Error {
    /// The event classification carried by this error, if it is one of the
    /// quarantinable kinds.
    pub fn event_error(&self) -> Option<&EventError> {
        match self {
            Self::InvalidEvent(e) | Self::EventPayload(e) | Self::InvariantViolated(e) => Some(e),
            _ => None,
        }
    }
}
