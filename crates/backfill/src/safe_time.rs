use common::{
    knobs::{
        SAFE_TIME_INITIAL_BACKOFF,
        SAFE_TIME_MAX_BACKOFF,
    },
    runtime::Runtime,
    types::{
        HybridTimestamp,
        TabletId,
    },
};
use errors::ErrorMetadata;

use crate::{
    coordinator::AbortFlag,
    metrics,
    retry::{
        with_retry,
        RetryPolicy,
    },
    service::{
        GetSafeTimeRequest,
        TabletDirectory,
        TabletService,
    },
};

/// Ask one tablet for the latest timestamp it guarantees reflects all writes
/// ordered before it, with `min_cutoff` as the floor. Retried indefinitely:
/// the probe blocks the run's progress but never its correctness, and the
/// run cannot safely proceed without every tablet's answer. Only an abort or
/// a fatal error (e.g. the tablet was dropped) ends the probing early.
pub async fn fetch_safe_time<RT: Runtime>(
    rt: &RT,
    directory: &dyn TabletDirectory,
    service: &dyn TabletService,
    abort: &AbortFlag,
    tablet_id: &TabletId,
    min_cutoff: HybridTimestamp,
) -> anyhow::Result<HybridTimestamp> {
    let policy = RetryPolicy::indefinite(*SAFE_TIME_INITIAL_BACKOFF, *SAFE_TIME_MAX_BACKOFF);
    with_retry(rt, "get_safe_time", policy, abort, || {
        let request = GetSafeTimeRequest {
            tablet_id: tablet_id.clone(),
            min_cutoff,
        };
        async move {
            metrics::log_safe_time_probe();
            let leader = directory.resolve_leader(&request.tablet_id).await?;
            let tablet_id = request.tablet_id.clone();
            let safe_time = service.get_safe_time(&leader, request).await?;
            if safe_time < min_cutoff {
                // A worker answering below the requested floor has violated
                // the probe contract; keep probing rather than risk a read
                // time that misses earlier-ordered writes.
                anyhow::bail!(ErrorMetadata::internal(
                    "SafeTimeBelowCutoff",
                    format!(
                        "tablet {tablet_id} answered safe time {safe_time} below the requested \
                         cutoff {min_cutoff}"
                    ),
                ));
            }
            Ok(safe_time)
        }
    })
    .await
}
