//! The aggregate registry: an immutable name-keyed map of validated
//! aggregate definitions plus the runtime-wide configuration.
//!
//! Built once through [`AggregateRuntimeBuilder`]; each caller then binds
//! its own stores, sink, authorizer and identity with
//! [`AggregateRuntime::connect`].

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::aggregate::{Aggregate, AggregateDefinition};
use crate::connection::ConnectionBuilder;
use crate::error::Error;

/// Retry budget for commands that do not set their own.
const DEFAULT_COMMAND_RETRIES: u32 = 3;

/// Runtime-wide settings.
///
/// Deserializable so it can be embedded in an application's config file;
/// missing fields take their defaults.
///
/// # Examples
///
/// ```
/// use eventfold_runtime::RuntimeConfig;
///
/// let config: RuntimeConfig = serde_json::from_str(r#"{ "throwOnInvalidEvent": true }"#).unwrap();
/// assert_eq!(config.default_command_retries, 3);
/// assert!(config.throw_on_invalid_event);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    /// Write-conflict retries per command; `attempts = retries + 1`.
    pub default_command_retries: u32,
    /// Abort projection builds on the first invalid event instead of
    /// quarantining it.
    pub throw_on_invalid_event: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_command_retries: DEFAULT_COMMAND_RETRIES,
            throw_on_invalid_event: false,
        }
    }
}

struct RuntimeInner {
    aggregates: HashMap<String, AggregateDefinition>,
    config: RuntimeConfig,
}

/// Registry of aggregate definitions shared by every connection.
///
/// `Clone` is cheap -- the registry is `Arc`-wrapped and never mutated
/// after [`build`](AggregateRuntimeBuilder::build).
#[derive(Clone)]
pub struct AggregateRuntime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for AggregateRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.aggregate_names().collect();
        names.sort_unstable();
        f.debug_struct("AggregateRuntime")
            .field("aggregates", &names)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl AggregateRuntime {
    pub fn builder() -> AggregateRuntimeBuilder {
        AggregateRuntimeBuilder::new()
    }

    /// Start binding collaborators for one caller.
    pub fn connect(&self) -> ConnectionBuilder {
        ConnectionBuilder::new(self.clone())
    }

    /// Names of every registered aggregate, in no particular order.
    pub fn aggregate_names(&self) -> impl Iterator<Item = &str> {
        self.inner.aggregates.keys().map(String::as_str)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Look up a registered aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownAggregate`] if `aggregate_name` is not registered.
    pub(crate) fn resolve(&self, aggregate_name: &str) -> Result<&AggregateDefinition, Error> {
        self.inner
            .aggregates
            .get(aggregate_name)
            .ok_or_else(|| Error::UnknownAggregate(aggregate_name.to_owned()))
    }
}

/// Builder for [`AggregateRuntime`].
///
/// # Examples
///
/// ```no_run
/// # use eventfold_runtime::{Aggregate, AggregateRuntime};
/// # fn demo(library: impl Aggregate) -> Result<(), eventfold_runtime::Error> {
/// let runtime = AggregateRuntime::builder()
///     .aggregate("library", library)
///     .default_command_retries(5)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct AggregateRuntimeBuilder {
    aggregates: Vec<(String, AggregateDefinition)>,
    config: RuntimeConfig,
}

impl AggregateRuntimeBuilder {
    /// Create a builder with no aggregates and the default config.
    pub fn new() -> Self {
        Self {
            aggregates: Vec::new(),
            config: RuntimeConfig::default(),
        }
    }

    /// Register `aggregate` under `name`.
    ///
    /// The definition is validated in [`build`](Self::build), not here.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn aggregate<A: Aggregate>(mut self, name: impl Into<String>, aggregate: A) -> Self {
        self.aggregates
            .push((name.into(), AggregateDefinition::new(aggregate)));
        self
    }

    /// Register an already-erased definition under `name`.
    pub fn definition(mut self, name: impl Into<String>, definition: AggregateDefinition) -> Self {
        self.aggregates.push((name.into(), definition));
        self
    }

    /// Set the retry budget for commands that do not override it.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn default_command_retries(mut self, retries: u32) -> Self {
        self.config.default_command_retries = retries;
        self
    }

    /// Abort projection builds on the first invalid event.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn throw_on_invalid_event(mut self, throw: bool) -> Self {
        self.config.throw_on_invalid_event = throw;
        self
    }

    /// Replace the whole config, e.g. one loaded from a file.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate every definition and freeze the registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAggregate`] for a blank or repeated aggregate
    /// name, an empty command catalog, or blank or repeated command names.
    pub fn build(self) -> Result<AggregateRuntime, Error> {
        let mut aggregates = HashMap::with_capacity(self.aggregates.len());

        for (name, definition) in self.aggregates {
            let invalid = |reason: String| Error::InvalidAggregate {
                aggregate: name.clone(),
                reason,
            };

            if name.trim().is_empty() {
                return Err(invalid("aggregate name must not be blank".to_owned()));
            }
            if aggregates.contains_key(&name) {
                return Err(invalid("aggregate is registered more than once".to_owned()));
            }
            if let Some(reason) = definition.commands().shape_error() {
                return Err(invalid(reason));
            }

            tracing::debug!(
                aggregate_name = %name,
                commands = definition.commands().len(),
                "aggregate registered"
            );
            aggregates.insert(name, definition);
        }

        Ok(AggregateRuntime {
            inner: Arc::new(RuntimeInner {
                aggregates,
                config: self.config,
            }),
        })
    }
}

impl Default for AggregateRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
