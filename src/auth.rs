//! Caller identity, operation descriptors, and the authorization gate every
//! public operation passes through first.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Unauthorized};

/// Identity of the caller bound to a [`Connection`](crate::Connection).
///
/// The runtime treats it as opaque: it is handed to the [`Authorizer`] and
/// stamped into the metadata of every event the caller writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    /// Arbitrary claims (email, roles, tenant, ...).
    #[serde(flatten)]
    pub claims: Map<String, Value>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            claims: Map::new(),
        }
    }

    pub fn with_claim(mut self, key: impl Into<String>, value: Value) -> Self {
        self.claims.insert(key.into(), value);
        self
    }
}

/// The kind of public operation being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    GetProjection,
    UpdateSnapshot,
    RunCommand,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::GetProjection => "getProjection",
            Self::UpdateSnapshot => "updateSnapshot",
            Self::RunCommand => "runCommand",
        };
        f.write_str(name)
    }
}

/// Describes one operation for the [`Authorizer`] to allow or deny.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub aggregate_name: String,
    pub aggregate_id: String,
    /// Set only for [`OperationKind::RunCommand`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_name: Option<String>,
}

impl Operation {
    pub fn get_projection(aggregate_name: &str, aggregate_id: &str) -> Self {
        Self {
            kind: OperationKind::GetProjection,
            aggregate_name: aggregate_name.to_owned(),
            aggregate_id: aggregate_id.to_owned(),
            command_name: None,
        }
    }

    pub fn update_snapshot(aggregate_name: &str, aggregate_id: &str) -> Self {
        Self {
            kind: OperationKind::UpdateSnapshot,
            ..Self::get_projection(aggregate_name, aggregate_id)
        }
    }

    pub fn run_command(aggregate_name: &str, aggregate_id: &str, command_name: &str) -> Self {
        Self {
            kind: OperationKind::RunCommand,
            command_name: Some(command_name.to_owned()),
            ..Self::get_projection(aggregate_name, aggregate_id)
        }
    }
}

/// Decides whether a user may perform an operation.
///
/// Implemented for any `Fn(Option<&User>, &Operation) -> Result<(),
/// Unauthorized>` closure, which covers most synchronous policies.
///
/// # Examples
///
/// ```
/// use eventfold_runtime::{Authorizer, Operation, OperationKind, Unauthorized, User};
///
/// // Anyone may read; only "admin" may write.
/// let policy = |user: Option<&User>, op: &Operation| {
///     let is_admin = user.is_some_and(|u| u.id == "admin");
///     if op.kind == OperationKind::GetProjection || is_admin {
///         Ok(())
///     } else {
///         Err(Unauthorized::new(format!("{} denied", op.kind)))
///     }
/// };
/// # fn assert_authorizer<A: Authorizer>(_: &A) {}
/// # assert_authorizer(&policy);
/// ```
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Allow the operation by returning `Ok(())`, deny it with [`Unauthorized`].
    async fn assert(&self, user: Option<&User>, operation: &Operation) -> Result<(), Unauthorized>;
}

#[async_trait]
impl<F> Authorizer for F
where
    F: Fn(Option<&User>, &Operation) -> Result<(), Unauthorized> + Send + Sync,
{
    async fn assert(&self, user: Option<&User>, operation: &Operation) -> Result<(), Unauthorized> {
        self(user, operation)
    }
}

/// Authorizer that allows every operation, for trusted single-user tools
/// and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn assert(&self, _user: Option<&User>, _operation: &Operation) -> Result<(), Unauthorized> {
        Ok(())
    }
}

/// Run `operation` past the authorizer.
///
/// # Errors
///
/// Returns [`Error::Unauthorized`] when the authorizer denies the operation.
pub(crate) async fn assert_authorized(
    authorizer: &dyn Authorizer,
    user: Option<&User>,
    operation: &Operation,
) -> Result<(), Error> {
    authorizer.assert(user, operation).await.map_err(|denied| {
        tracing::warn!(
            operation = %operation.kind,
            aggregate_name = %operation.aggregate_name,
            aggregate_id = %operation.aggregate_id,
            command = operation.command_name.as_deref().unwrap_or(""),
            user = user.map(|u| u.id.as_str()).unwrap_or("<anonymous>"),
            reason = %denied,
            "operation denied"
        );
        Error::Unauthorized(denied)
    })
}
