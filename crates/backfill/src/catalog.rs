use std::collections::BTreeMap;

use async_trait::async_trait;
use common::types::{
    IndexId,
    SchemaVersion,
    TableId,
    TabletId,
};

use crate::types::{
    BackfillCheckpoint,
    IndexPermission,
    TableDescriptor,
    TabletDescriptor,
};

/// The schema/catalog persistence collaborator. Writes are assumed
/// crash-consistent and at least monotonic. Permission stages and per-tablet
/// checkpoints are the only state this subsystem persists.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Current descriptor of a table, including its index descriptors.
    async fn table(&self, table_id: &TableId) -> anyhow::Result<TableDescriptor>;

    /// Tablets of a table, in key order.
    async fn tablets(&self, table_id: &TableId) -> anyhow::Result<Vec<TabletDescriptor>>;

    /// Apply a batch of permission-stage changes to the table's indexes iff
    /// the persisted schema version still equals `expected_version`, then
    /// bump and return the version. Fails with `VersionMismatch` when a
    /// concurrent alter has advanced the version first; callers treat that
    /// as "superseded" rather than an error.
    async fn compare_and_set_permissions(
        &self,
        table_id: &TableId,
        expected_version: SchemaVersion,
        changes: BTreeMap<IndexId, IndexPermission>,
    ) -> anyhow::Result<SchemaVersion>;

    /// The persisted checkpoint for one tablet of `table_id`.
    /// `BackfillCheckpoint::NotStarted` when none has been written.
    async fn checkpoint(
        &self,
        table_id: &TableId,
        tablet_id: &TabletId,
    ) -> anyhow::Result<BackfillCheckpoint>;

    /// Durably replace the checkpoint for one tablet.
    async fn write_checkpoint(
        &self,
        table_id: &TableId,
        tablet_id: &TabletId,
        checkpoint: BackfillCheckpoint,
    ) -> anyhow::Result<()>;

    /// Drop all checkpoints for `table_id`. Called once a run reaches a
    /// terminal outcome; checkpoints are meaningless outside a run.
    async fn clear_checkpoints(&self, table_id: &TableId) -> anyhow::Result<()>;
}
