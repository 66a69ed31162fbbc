use std::{
    collections::BTreeMap,
    sync::Arc,
};

use common::{
    runtime::Runtime,
    types::{
        SchemaVersion,
        TableId,
    },
};
use errors::ErrorMetadataAnyhowExt;
use tokio::sync::oneshot;

use crate::{
    catalog::Catalog,
    coordinator::{
        BackfillOutcome,
        BackfillTable,
    },
    service::{
        TabletDirectory,
        TabletService,
    },
    types::{
        IndexDescriptor,
        IndexPermission,
    },
};

/// The entry point invoked by schema-change logic. Advances indexes through
/// permission stages one stage per alter round, and launches a backfill run
/// when indexes reach the backfill-eligible stage.
pub struct MultiStageAlter<RT: Runtime> {
    runtime: RT,
    catalog: Arc<dyn Catalog>,
    directory: Arc<dyn TabletDirectory>,
    service: Arc<dyn TabletService>,
}

/// Handle on a backfill run launched by the controller: the run itself, its
/// spawn handle, and the one-shot completion channel surfaced to the
/// schema-change subsystem.
pub struct LaunchedBackfill<RT: Runtime> {
    pub backfill: Arc<BackfillTable<RT>>,
    pub handle: RT::Handle,
    pub completion: oneshot::Receiver<BackfillOutcome>,
}

impl<RT: Runtime> MultiStageAlter<RT> {
    pub fn new(
        runtime: RT,
        catalog: Arc<dyn Catalog>,
        directory: Arc<dyn TabletDirectory>,
        service: Arc<dyn TabletService>,
    ) -> Self {
        Self {
            runtime,
            catalog,
            directory,
            service,
        }
    }

    /// Advance every index of `table_id` below `Public` by exactly one
    /// permission stage, persisting the new stages before returning. If the
    /// persisted schema version has already moved past `current_version`, a
    /// concurrent alter has acted and this call is a no-op.
    ///
    /// Indexes that newly reach the backfill stage are handed to a
    /// [`BackfillTable`] launched asynchronously; this call does not wait
    /// for the run. The run itself commits `Public`/`Failed` stages when it
    /// finishes.
    pub async fn launch_next_version_if_necessary(
        &self,
        table_id: &TableId,
        current_version: SchemaVersion,
    ) -> anyhow::Result<Option<LaunchedBackfill<RT>>> {
        let table = self.catalog.table(table_id).await?;
        if table.schema_version != current_version {
            tracing::info!(
                "Not advancing {table_id}: schema version {} already past {current_version}",
                table.schema_version
            );
            return Ok(None);
        }

        let mut changes = BTreeMap::new();
        let mut newly_backfilling = Vec::new();
        for index in &table.indexes {
            let Some(next) = index.permission.next_stage() else {
                continue;
            };
            if next == IndexPermission::Backfill {
                let mut descriptor = index.clone();
                descriptor.permission = IndexPermission::Backfill;
                newly_backfilling.push(descriptor);
            }
            changes.insert(index.id.clone(), next);
        }
        if changes.is_empty() {
            return Ok(None);
        }

        let new_version = match self
            .catalog
            .compare_and_set_permissions(table_id, current_version, changes)
            .await
        {
            Ok(version) => version,
            Err(e) if e.is_version_mismatch() => {
                tracing::info!(
                    "Not advancing {table_id}: lost the permission write to a concurrent alter"
                );
                return Ok(None);
            },
            Err(e) => return Err(e),
        };
        tracing::info!("Advanced {table_id} to schema version {new_version}");

        if newly_backfilling.is_empty() {
            return Ok(None);
        }

        // Floor the safe-time answers at "now": the chosen read time then
        // covers every write ordered before the indexes became
        // backfill-eligible.
        let min_cutoff = self.runtime.generate_timestamp()?;
        let (backfill, completion) = BackfillTable::new(
            self.runtime.clone(),
            self.catalog.clone(),
            self.directory.clone(),
            self.service.clone(),
            table_id.clone(),
            new_version,
            newly_backfilling,
            min_cutoff,
        );
        let handle = backfill.launch();
        Ok(Some(LaunchedBackfill {
            backfill,
            handle,
            completion,
        }))
    }

    /// Relaunch a run for indexes already sitting in the backfill stage,
    /// e.g. after a coordinator restart killed their previous run. The new
    /// run picks a fresh read timestamp and resumes each tablet from its
    /// persisted checkpoint; tablets already marked complete are skipped
    /// outright.
    pub async fn relaunch_pending_backfills(
        &self,
        table_id: &TableId,
    ) -> anyhow::Result<Option<LaunchedBackfill<RT>>> {
        let table = self.catalog.table(table_id).await?;
        let pending: Vec<IndexDescriptor> = table
            .indexes
            .iter()
            .filter(|index| index.permission == IndexPermission::Backfill)
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(None);
        }
        tracing::info!(
            "Relaunching backfill of {table_id} for {} indexes still mid-build",
            pending.len()
        );
        let min_cutoff = self.runtime.generate_timestamp()?;
        let (backfill, completion) = BackfillTable::new(
            self.runtime.clone(),
            self.catalog.clone(),
            self.directory.clone(),
            self.service.clone(),
            table_id.clone(),
            table.schema_version,
            pending,
            min_cutoff,
        );
        let handle = backfill.launch();
        Ok(Some(LaunchedBackfill {
            backfill,
            handle,
            completion,
        }))
    }
}

/// Commit a finished run's outcome: fully-successful indexes become
/// `Public`, failed indexes become `Failed` with their first observed
/// diagnostic. Invoked by the run exactly once when it reaches a terminal
/// outcome. A `VersionMismatch` propagates to the caller, which swallows it:
/// a concurrent alter has superseded the run's intent.
pub async fn commit_backfill_outcome(
    catalog: &dyn Catalog,
    table_id: &TableId,
    expected_version: SchemaVersion,
    outcome: &BackfillOutcome,
) -> anyhow::Result<()> {
    let mut changes = BTreeMap::new();
    for index_id in &outcome.succeeded {
        changes.insert(index_id.clone(), IndexPermission::Public);
    }
    for (index_id, message) in &outcome.failed {
        changes.insert(
            index_id.clone(),
            IndexPermission::Failed {
                message: message.clone(),
            },
        );
    }
    if changes.is_empty() {
        return Ok(());
    }
    let new_version = catalog
        .compare_and_set_permissions(table_id, expected_version, changes)
        .await?;
    tracing::info!(
        "Committed backfill outcome for {table_id} at schema version {new_version}: {} public, \
         {} failed",
        outcome.succeeded.len(),
        outcome.failed.len()
    );
    Ok(())
}
