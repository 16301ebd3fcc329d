//! Snapshot persistence collaborator and snapshot publication.
//!
//! A snapshot is a stored [`Projection`]. Projection builds start from the
//! latest snapshot and only fetch events written after its `version`, so
//! publishing snapshots bounds the replay cost of long-lived instances.

use std::io;

use async_trait::async_trait;

use crate::auth::{Operation, assert_authorized};
use crate::connection::Connection;
use crate::error::Error;
use crate::projection::{MissValue, Projection, build_projection};

/// Latest-snapshot storage, one per aggregate instance.
///
/// # Contract
///
/// - [`get_snapshot`](SnapshotStore::get_snapshot) returns the most recently
///   written snapshot, or `None`.
/// - [`write_snapshot`](SnapshotStore::write_snapshot) replaces it.
///   Implementations may ignore a write whose `version` is lower than the
///   stored one; the runtime does not depend on either behavior.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// The latest snapshot of `aggregate_name/aggregate_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the backing store cannot be read.
    async fn get_snapshot(
        &self,
        aggregate_name: &str,
        aggregate_id: &str,
    ) -> io::Result<Option<Projection>>;

    /// Persist `projection` as the latest snapshot.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the backing store cannot be written.
    async fn write_snapshot(
        &self,
        aggregate_name: &str,
        aggregate_id: &str,
        projection: &Projection,
    ) -> io::Result<()>;
}

/// Build the current projection and persist it as the new snapshot.
///
/// # Arguments
///
/// * `conn` - Connection providing the stores and the caller identity.
/// * `aggregate_name` - Registered aggregate name.
/// * `aggregate_id` - Instance to snapshot.
///
/// # Returns
///
/// The projection that was written, or `None` if the instance has no
/// history (nothing is written in that case).
///
/// # Errors
///
/// * [`Error::UnknownAggregate`] -- no aggregate is registered under the name.
/// * [`Error::Unauthorized`] -- the authorizer denied `updateSnapshot`.
/// * [`Error::Io`] -- a store failed.
pub(crate) async fn publish_snapshot(
    conn: &Connection,
    aggregate_name: &str,
    aggregate_id: &str,
) -> Result<Option<Projection>, Error> {
    let definition = conn.runtime.resolve(aggregate_name)?;
    assert_authorized(
        conn.authorizer.as_ref(),
        conn.user.as_ref(),
        &Operation::update_snapshot(aggregate_name, aggregate_id),
    )
    .await?;

    let Some(projection) =
        build_projection(conn, aggregate_name, definition, aggregate_id, MissValue::Absent).await?
    else {
        tracing::debug!(aggregate_name, aggregate_id, "no history, snapshot skipped");
        return Ok(None);
    };

    conn.snapshot_store
        .write_snapshot(aggregate_name, aggregate_id, &projection)
        .await?;

    tracing::debug!(
        aggregate_name,
        aggregate_id,
        version = projection.version,
        "snapshot written"
    );
    Ok(Some(projection))
}
