use std::collections::BTreeSet;

use common::{
    knobs::{
        BACKFILL_CHUNK_DEADLINE,
        BACKFILL_CHUNK_INITIAL_BACKOFF,
        BACKFILL_CHUNK_MAX_ATTEMPTS,
        BACKFILL_CHUNK_MAX_BACKOFF,
        BACKFILL_CHUNK_ROW_BUDGET,
    },
    runtime::{
        Runtime,
        RuntimeInstant,
    },
    types::{
        HybridTimestamp,
        IndexId,
        RowKey,
        TabletId,
    },
};

use crate::{
    coordinator::AbortFlag,
    metrics,
    retry::{
        with_retry,
        RetryPolicy,
    },
    service::{
        BackfillChunkRequest,
        BackfillChunkResponse,
        TabletDirectory,
        TabletService,
    },
};

/// Issue one bounded backfill chunk: scan `tablet_id` from `start_key` at the
/// run's read time, writing matching rows into `index_ids`. Attempts are
/// bounded and backed off, with one strict deadline over the whole task.
/// Tablet-gone and snapshot-too-old failures skip the retry loop entirely
/// and surface to the driver as unrecoverable.
pub async fn run_chunk<RT: Runtime>(
    rt: &RT,
    directory: &dyn TabletDirectory,
    service: &dyn TabletService,
    abort: &AbortFlag,
    tablet_id: &TabletId,
    index_ids: &BTreeSet<IndexId>,
    start_key: &RowKey,
    read_time: HybridTimestamp,
) -> anyhow::Result<BackfillChunkResponse> {
    let policy = RetryPolicy::bounded(
        *BACKFILL_CHUNK_INITIAL_BACKOFF,
        *BACKFILL_CHUNK_MAX_BACKOFF,
        *BACKFILL_CHUNK_MAX_ATTEMPTS,
        *BACKFILL_CHUNK_DEADLINE,
    );
    let started = rt.monotonic_now();
    let result = with_retry(rt, "backfill_chunk", policy, abort, || {
        let request = BackfillChunkRequest {
            tablet_id: tablet_id.clone(),
            index_ids: index_ids.clone(),
            start_key: start_key.clone(),
            read_time,
            row_budget: *BACKFILL_CHUNK_ROW_BUDGET,
        };
        async move {
            metrics::log_chunk_attempt();
            let leader = directory.resolve_leader(&request.tablet_id).await?;
            service.backfill_chunk(&leader, request).await
        }
    })
    .await;
    metrics::log_chunk_finished(started.elapsed());
    result
}
