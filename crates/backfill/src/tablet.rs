use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    sync::Arc,
};

use common::{
    errors::report_error,
    runtime::Runtime,
    types::{
        IndexId,
        TabletId,
    },
};
use errors::ErrorMetadata;

use crate::{
    chunk,
    coordinator::RunContext,
    types::{
        BackfillCheckpoint,
        TabletDescriptor,
    },
};

/// Exactly-once completion report from one tablet's driver to its run.
/// Failure is index-scoped; a tablet that backfilled every requested index
/// reports an empty map.
#[derive(Clone, Debug)]
pub struct TabletDone {
    pub tablet_id: TabletId,
    /// Indexes that could not be built on this tablet, each with the first
    /// observed diagnostic.
    pub failed_indexes: BTreeMap<IndexId, String>,
}

/// Drives the chunk loop for one tablet: issue a chunk, persist the returned
/// checkpoint, issue the next, until the tablet's range is exhausted or it
/// fails unrecoverably. Chunks are strictly sequential - never more than one
/// outstanding per tablet - so the persisted checkpoint can only advance.
pub struct BackfillTablet<RT: Runtime> {
    ctx: Arc<RunContext<RT>>,
    tablet: TabletDescriptor,
}

impl<RT: Runtime> BackfillTablet<RT> {
    pub fn new(ctx: Arc<RunContext<RT>>, tablet: TabletDescriptor) -> Self {
        Self { ctx, tablet }
    }

    pub async fn run(self) -> TabletDone {
        let mut pending: BTreeSet<IndexId> = self.ctx.index_ids.clone();
        let mut failed = BTreeMap::new();
        if let Err(mut e) = self.run_chunks(&mut pending, &mut failed).await {
            // Whatever escapes the chunk loop - a dropped tablet, an
            // unservable read timestamp, exhausted retries, a checkpoint
            // write failure, an abort - takes down every index still pending
            // on this tablet.
            report_error(&mut e);
            let message = format!("{e:#}");
            for index_id in &pending {
                failed
                    .entry(index_id.clone())
                    .or_insert_with(|| message.clone());
            }
        }
        TabletDone {
            tablet_id: self.tablet.id.clone(),
            failed_indexes: failed,
        }
    }

    async fn run_chunks(
        &self,
        pending: &mut BTreeSet<IndexId>,
        failed: &mut BTreeMap<IndexId, String>,
    ) -> anyhow::Result<()> {
        let ctx = &self.ctx;
        let mut checkpoint = ctx.catalog.checkpoint(&ctx.table_id, &self.tablet.id).await?;
        loop {
            if ctx.abort.aborted() {
                anyhow::bail!(ErrorMetadata::aborted(
                    "RunAborted",
                    "backfill run aborted",
                ));
            }
            if pending.is_empty() {
                // Every requested index already failed; nothing left to
                // write on this tablet.
                return Ok(());
            }
            let start_key = match &checkpoint {
                BackfillCheckpoint::NotStarted => self.tablet.start_key.clone(),
                BackfillCheckpoint::Resume(key) => key.clone(),
                BackfillCheckpoint::Complete => {
                    // A prior run finished this tablet before the
                    // coordinator restarted.
                    tracing::info!("Tablet {} already backfilled, skipping", self.tablet.id);
                    return Ok(());
                },
            };
            let response = chunk::run_chunk(
                &ctx.runtime,
                ctx.directory.as_ref(),
                ctx.service.as_ref(),
                &ctx.abort,
                &self.tablet.id,
                pending,
                &start_key,
                ctx.read_time,
            )
            .await?;

            for (index_id, message) in response.failed_indexes {
                if pending.remove(&index_id) {
                    tracing::warn!(
                        "Index {index_id} failed on tablet {}: {message}",
                        self.tablet.id
                    );
                    failed.entry(index_id).or_insert(message);
                }
            }

            let next = match response.backfilled_until {
                Some(key) => BackfillCheckpoint::Resume(key),
                None => BackfillCheckpoint::Complete,
            };
            anyhow::ensure!(
                checkpoint.advances_to(&next),
                "tablet {} checkpoint must advance, got {checkpoint:?} -> {next:?}",
                self.tablet.id
            );
            ctx.catalog
                .write_checkpoint(&ctx.table_id, &self.tablet.id, next.clone())
                .await?;
            if next == BackfillCheckpoint::Complete {
                tracing::info!("Tablet {} backfill complete", self.tablet.id);
                return Ok(());
            }
            checkpoint = next;
        }
    }
}
