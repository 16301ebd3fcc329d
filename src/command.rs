//! Command definitions and the per-aggregate command catalog.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ParamsError;
use crate::event::EventSpec;

/// A named operation that derives one new event for an aggregate instance.
///
/// # Contract
///
/// - [`validate_params`](Command::validate_params) runs once per
///   `run_command` call, before any store access. Rejecting here writes
///   nothing.
/// - [`create_event`](Command::create_event) must be a pure function of its
///   arguments. It may be called again on every optimistic-concurrency retry.
pub trait Command: Send + Sync + 'static {
    /// Whether this command creates the instance. Create commands fail on an
    /// existing instance; all others fail on a missing one.
    fn is_create_command(&self) -> bool {
        false
    }

    /// Per-command override of the runtime's default retry budget.
    fn retries(&self) -> Option<u32> {
        None
    }

    /// Check the caller-supplied parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ParamsError`] describing the first unacceptable argument.
    fn validate_params(&self, _aggregate_id: &str, _params: &[Value]) -> Result<(), ParamsError> {
        Ok(())
    }

    /// Derive the event this command appends.
    fn create_event(&self, aggregate_id: &str, params: &[Value]) -> EventSpec;
}

/// Read positional parameter `index` as a `T`.
///
/// Convenience for `validate_params` / `create_event` implementations.
///
/// # Errors
///
/// Returns [`ParamsError`] if the parameter is absent or has the wrong shape.
///
/// # Examples
///
/// ```
/// use eventfold_runtime::param;
/// use serde_json::json;
///
/// let params = [json!("North Branch"), json!(3)];
/// let name: String = param(&params, 0).unwrap();
/// let copies: u32 = param(&params, 1).unwrap();
/// assert_eq!((name.as_str(), copies), ("North Branch", 3));
/// assert!(param::<String>(&params, 2).is_err());
/// ```
pub fn param<T: DeserializeOwned>(params: &[Value], index: usize) -> Result<T, ParamsError> {
    let value = params
        .get(index)
        .ok_or_else(|| ParamsError::new(format!("parameter {index} is required")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| ParamsError::new(format!("parameter {index} is invalid: {e}")))
}

/// Ordered set of named commands belonging to one aggregate.
///
/// Duplicate or blank names are accepted here and rejected when the
/// aggregate is registered, so the error can name the aggregate.
///
/// # Examples
///
/// ```
/// use eventfold_runtime::{Command, CommandCatalog, EventSpec};
/// use serde_json::{Value, json};
///
/// struct Ping;
/// impl Command for Ping {
///     fn create_event(&self, _id: &str, _params: &[Value]) -> EventSpec {
///         EventSpec::new("PINGED", json!({}))
///     }
/// }
///
/// let catalog = CommandCatalog::new().command("ping", Ping);
/// assert_eq!(catalog.len(), 1);
/// assert!(catalog.get("ping").is_some());
/// ```
#[derive(Clone, Default)]
pub struct CommandCatalog {
    entries: Vec<(String, Arc<dyn Command>)>,
}

impl CommandCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `command` under `name`.
    pub fn command(mut self, name: impl Into<String>, command: impl Command) -> Self {
        self.entries.push((name.into(), Arc::new(command)));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Command>> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, command)| command)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reason this catalog cannot be registered, if any.
    pub(crate) fn shape_error(&self) -> Option<String> {
        if self.entries.is_empty() {
            return Some("at least one command is required".to_owned());
        }
        let mut seen = std::collections::HashSet::new();
        for (name, _) in &self.entries {
            if name.trim().is_empty() {
                return Some("command names must not be blank".to_owned());
            }
            if !seen.insert(name.as_str()) {
                return Some(format!("command '{name}' is defined more than once"));
            }
        }
        None
    }
}

impl std::fmt::Debug for CommandCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
