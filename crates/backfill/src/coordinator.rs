use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
};

use common::{
    errors::report_error,
    knobs::{
        COMPACTION_RELEASE_MAX_ATTEMPTS,
        SAFE_TIME_INITIAL_BACKOFF,
        SAFE_TIME_MAX_BACKOFF,
    },
    runtime::Runtime,
    types::{
        HybridTimestamp,
        IndexId,
        SchemaVersion,
        TableId,
    },
};
use errors::ErrorMetadataAnyhowExt;
use futures::{
    stream::FuturesUnordered,
    StreamExt,
};
use parking_lot::Mutex;
use tokio::sync::{
    mpsc,
    oneshot,
};

use crate::{
    alter,
    catalog::Catalog,
    metrics,
    retry::{
        with_retry,
        RetryPolicy,
    },
    safe_time,
    service::{
        TabletDirectory,
        TabletService,
    },
    tablet::{
        BackfillTablet,
        TabletDone,
    },
    types::{
        IndexDescriptor,
        TabletDescriptor,
    },
};

/// Cooperative cancellation for one run. Setting the flag prevents new
/// probes and chunks from being issued; in-flight remote calls complete and
/// their results are discarded with the run.
#[derive(Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Index-scoped result of one finished run. Tablets never appear here: a
/// caller driving the permission state machine reasons about indexes only.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BackfillOutcome {
    pub succeeded: BTreeSet<IndexId>,
    /// Failed indexes with the first observed error message each.
    pub failed: BTreeMap<IndexId, String>,
}

/// Everything a tablet driver needs from its run. Drivers hold this behind
/// an `Arc` instead of a back-reference to the run itself; the read time is
/// fixed before any driver is constructed.
pub struct RunContext<RT: Runtime> {
    pub runtime: RT,
    pub catalog: Arc<dyn Catalog>,
    pub directory: Arc<dyn TabletDirectory>,
    pub service: Arc<dyn TabletService>,
    pub table_id: TableId,
    pub index_ids: BTreeSet<IndexId>,
    /// The run's frozen global read point.
    pub read_time: HybridTimestamp,
    pub abort: AbortFlag,
}

/// Live aggregate for one run, guarded by a single lock and mutated only by
/// the run's own aggregation loop.
struct RunState {
    read_time: Option<HybridTimestamp>,
    tablets_pending: usize,
    failed_indexes: BTreeMap<IndexId, String>,
    done: bool,
}

/// Owns one backfill run: one indexed table and the set of target indexes
/// that reached the backfill-eligible stage together.
///
/// The run proceeds in two fan-outs. First every tablet of the indexed table
/// is probed for its safe time and the minimum becomes the run's single read
/// timestamp. Then one driver per tablet chunks through the tablet's rows at
/// that timestamp, reporting exactly once into the run's aggregation loop.
/// When the pending-tablet count reaches zero - the only completion trigger -
/// the run commits each index to `Public` or `Failed` and tears down.
pub struct BackfillTable<RT: Runtime> {
    runtime: RT,
    catalog: Arc<dyn Catalog>,
    directory: Arc<dyn TabletDirectory>,
    service: Arc<dyn TabletService>,
    table_id: TableId,
    /// Schema version when the run was launched; the final permission commit
    /// compare-and-sets against it so a concurrent alter wins.
    schema_version: SchemaVersion,
    indexes: Vec<IndexDescriptor>,
    min_cutoff: HybridTimestamp,
    state: Mutex<RunState>,
    abort: AbortFlag,
    completion: Mutex<Option<oneshot::Sender<BackfillOutcome>>>,
}

impl<RT: Runtime> BackfillTable<RT> {
    pub fn new(
        runtime: RT,
        catalog: Arc<dyn Catalog>,
        directory: Arc<dyn TabletDirectory>,
        service: Arc<dyn TabletService>,
        table_id: TableId,
        schema_version: SchemaVersion,
        indexes: Vec<IndexDescriptor>,
        min_cutoff: HybridTimestamp,
    ) -> (Arc<Self>, oneshot::Receiver<BackfillOutcome>) {
        let (completion_tx, completion_rx) = oneshot::channel();
        let this = Arc::new(Self {
            runtime,
            catalog,
            directory,
            service,
            table_id,
            schema_version,
            indexes,
            min_cutoff,
            state: Mutex::new(RunState {
                read_time: None,
                tablets_pending: 0,
                failed_indexes: BTreeMap::new(),
                done: false,
            }),
            abort: AbortFlag::new(),
            completion: Mutex::new(Some(completion_tx)),
        });
        (this, completion_rx)
    }

    /// Begin the run on the runtime's executor and return immediately. The
    /// terminal outcome is delivered through the completion channel handed
    /// out by [`BackfillTable::new`].
    pub fn launch(self: &Arc<Self>) -> RT::Handle {
        let this = self.clone();
        self.runtime
            .spawn("backfill_table", async move { this.run().await })
    }

    pub fn abort(&self) {
        self.abort.abort();
    }

    /// The chosen global read timestamp. `None` until every safe-time probe
    /// has answered.
    pub fn read_time(&self) -> Option<HybridTimestamp> {
        self.state.lock().read_time
    }

    pub fn done(&self) -> bool {
        self.state.lock().done
    }

    pub fn index_ids(&self) -> BTreeSet<IndexId> {
        self.indexes.iter().map(|index| index.id.clone()).collect()
    }

    async fn run(self: Arc<Self>) {
        metrics::log_run_started();
        tracing::info!(
            "Launching backfill of {} for indexes {:?}",
            self.table_id,
            self.indexes
                .iter()
                .map(|index| index.name.as_str())
                .collect::<Vec<_>>()
        );
        let outcome = match self.run_inner().await {
            Ok(outcome) => outcome,
            Err(mut e) => {
                // Failures before or during the fan-out fail every requested
                // index; per-index isolation only exists below the tablet
                // drivers.
                report_error(&mut e);
                let message = format!("{e:#}");
                BackfillOutcome {
                    succeeded: BTreeSet::new(),
                    failed: self
                        .index_ids()
                        .into_iter()
                        .map(|id| (id, message.clone()))
                        .collect(),
                }
            },
        };
        self.finish(outcome).await;
    }

    async fn run_inner(&self) -> anyhow::Result<BackfillOutcome> {
        let tablets = self.catalog.tablets(&self.table_id).await?;
        let requested = self.index_ids();
        if tablets.is_empty() {
            return Ok(BackfillOutcome {
                succeeded: requested,
                failed: BTreeMap::new(),
            });
        }

        let read_time = self.choose_read_time(&tablets).await?;
        {
            let mut state = self.state.lock();
            state.read_time = Some(read_time);
            state.tablets_pending = tablets.len();
        }
        tracing::info!(
            "Chose read time {read_time} for backfill of {} across {} tablets",
            self.table_id,
            tablets.len()
        );

        let ctx = Arc::new(RunContext {
            runtime: self.runtime.clone(),
            catalog: self.catalog.clone(),
            directory: self.directory.clone(),
            service: self.service.clone(),
            table_id: self.table_id.clone(),
            index_ids: requested.clone(),
            read_time,
            abort: self.abort.clone(),
        });
        let (done_tx, mut done_rx) = mpsc::channel(tablets.len());
        let mut driver_handles = Vec::with_capacity(tablets.len());
        for tablet in tablets {
            let driver = BackfillTablet::new(ctx.clone(), tablet);
            let done_tx = done_tx.clone();
            driver_handles.push(self.runtime.spawn("backfill_tablet", async move {
                // Each driver reports exactly once; the channel is the only
                // path into the aggregate.
                let _ = done_tx.send(driver.run().await).await;
            }));
        }
        drop(done_tx);

        // Single aggregation point: every completion flows through this
        // loop, so the pending-count decrement and failed-set union are
        // atomic with respect to each other.
        while let Some(done) = done_rx.recv().await {
            if self.record_tablet_done(done) == 0 {
                break;
            }
        }

        let state = self.state.lock();
        anyhow::ensure!(
            state.tablets_pending == 0,
            "backfill of {} lost a tablet driver before completion",
            self.table_id
        );
        let failed = state.failed_indexes.clone();
        drop(state);
        let succeeded = requested
            .into_iter()
            .filter(|id| !failed.contains_key(id))
            .collect();
        Ok(BackfillOutcome { succeeded, failed })
    }

    /// Record one tablet's exactly-once completion report and return the
    /// number of tablets still pending.
    fn record_tablet_done(&self, done: TabletDone) -> usize {
        let mut state = self.state.lock();
        state.tablets_pending -= 1;
        for (index_id, message) in done.failed_indexes {
            // The first observed error per index is its diagnostic.
            state.failed_indexes.entry(index_id).or_insert(message);
        }
        let pending = state.tablets_pending;
        drop(state);
        tracing::info!(
            "Tablet {} finished backfill of {}, {pending} tablets pending",
            done.tablet_id,
            self.table_id
        );
        pending
    }

    /// Probe every tablet in parallel and take the minimum answer: the most
    /// conservative point at which every tablet can serve a complete, frozen
    /// view of pre-backfill data. Probing a single tablet at a time (or
    /// reading tablets at different snapshots) could let an index miss a
    /// write ordered before the backfill but committed after a naive read.
    async fn choose_read_time(
        &self,
        tablets: &[TabletDescriptor],
    ) -> anyhow::Result<HybridTimestamp> {
        let mut probes: FuturesUnordered<_> = tablets
            .iter()
            .map(|tablet| {
                safe_time::fetch_safe_time(
                    &self.runtime,
                    self.directory.as_ref(),
                    self.service.as_ref(),
                    &self.abort,
                    &tablet.id,
                    self.min_cutoff,
                )
            })
            .collect();
        let mut chosen = HybridTimestamp::MAX;
        while let Some(result) = probes.next().await {
            chosen = chosen.min(result?);
        }
        Ok(chosen)
    }

    async fn finish(&self, outcome: BackfillOutcome) {
        match alter::commit_backfill_outcome(
            self.catalog.as_ref(),
            &self.table_id,
            self.schema_version,
            &outcome,
        )
        .await
        {
            Ok(()) => {},
            Err(e) if e.is_version_mismatch() => {
                // A concurrent alter advanced the schema past this run's
                // version; its intent supersedes ours and the commit is
                // skipped without complaint.
                tracing::info!(
                    "Skipping permission commit for {}: schema version moved past {}",
                    self.table_id,
                    self.schema_version
                );
            },
            Err(mut e) => report_error(&mut e),
        }

        for descriptor in &self.indexes {
            if outcome.succeeded.contains(&descriptor.id) {
                self.release_compaction_holds(descriptor).await;
            }
        }

        if let Err(mut e) = self.catalog.clear_checkpoints(&self.table_id).await {
            report_error(&mut e);
        }

        self.state.lock().done = true;
        metrics::log_run_completed(outcome.succeeded.len(), outcome.failed.len());
        tracing::info!(
            "Backfill of {} finished: {} indexes succeeded, {} failed",
            self.table_id,
            outcome.succeeded.len(),
            outcome.failed.len()
        );
        if let Some(sender) = self.completion.lock().take() {
            let _ = sender.send(outcome);
        }
    }

    /// While an index is mid-build, compactions of its table must not
    /// garbage-collect delete markers: the backfill read still needs them as
    /// signs that certain rows must not be written. Lift that suppression on
    /// every tablet of the index's table now that the build is proven
    /// complete. Best-effort: a tablet that cannot be reached keeps its hold
    /// until a later release, which costs space, not correctness.
    async fn release_compaction_holds(&self, descriptor: &IndexDescriptor) {
        let tablets = match self.catalog.tablets(&descriptor.table_id).await {
            Ok(tablets) => tablets,
            Err(mut e) => {
                report_error(&mut e);
                return;
            },
        };
        let policy = RetryPolicy {
            initial_backoff: *SAFE_TIME_INITIAL_BACKOFF,
            max_backoff: *SAFE_TIME_MAX_BACKOFF,
            max_attempts: Some(*COMPACTION_RELEASE_MAX_ATTEMPTS),
            deadline: None,
        };
        for tablet in tablets {
            let result = with_retry(
                &self.runtime,
                "release_compaction_hold",
                policy,
                &self.abort,
                || {
                    let tablet_id = tablet.id.clone();
                    async move {
                        let leader = self.directory.resolve_leader(&tablet_id).await?;
                        self.service.release_compaction_hold(&leader, &tablet_id).await
                    }
                },
            )
            .await;
            match result {
                Ok(()) => metrics::log_compaction_hold_released(),
                Err(e) => tracing::warn!(
                    "Failed to release compaction hold on tablet {} of index {}: {e:#}",
                    tablet.id,
                    descriptor.id
                ),
            }
        }
    }
}
