//! In-memory fakes of the two collaborators: the catalog and the tablet
//! workers. Scenario tests drive the real coordinator, drivers and retry
//! layer against these.

use std::{
    cmp,
    collections::{
        BTreeMap,
        BTreeSet,
        VecDeque,
    },
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use common::types::{
    HybridTimestamp,
    IndexId,
    RowKey,
    SchemaVersion,
    TableId,
    TabletId,
};
use errors::ErrorMetadata;
use parking_lot::Mutex;

use crate::{
    catalog::Catalog,
    service::{
        BackfillChunkRequest,
        BackfillChunkResponse,
        GetSafeTimeRequest,
        TabletDirectory,
        TabletService,
        WorkerAddr,
    },
    types::{
        BackfillCheckpoint,
        IndexDescriptor,
        IndexPermission,
        TableDescriptor,
        TabletDescriptor,
    },
};

pub fn index_descriptor(id: &str, permission: IndexPermission) -> IndexDescriptor {
    IndexDescriptor {
        id: IndexId::new(id),
        table_id: TableId::new(format!("{id}-table")),
        name: id.to_owned(),
        permission,
    }
}

pub fn table_descriptor(
    id: &str,
    schema_version: SchemaVersion,
    indexes: Vec<IndexDescriptor>,
) -> TableDescriptor {
    TableDescriptor {
        id: TableId::new(id),
        schema_version,
        indexes,
    }
}

pub fn tablet_descriptor(id: &str, start_key: &str) -> TabletDescriptor {
    TabletDescriptor {
        id: TabletId::new(id),
        start_key: RowKey::from(start_key),
    }
}

/// In-memory `Catalog` with the same compare-and-set and version-bump
/// semantics as the real one, plus accessors for asserting on persisted
/// state.
pub struct StaticCatalog {
    state: Mutex<StaticCatalogState>,
}

#[derive(Default)]
struct StaticCatalogState {
    tables: BTreeMap<TableId, TableDescriptor>,
    tablets: BTreeMap<TableId, Vec<TabletDescriptor>>,
    checkpoints: BTreeMap<(TableId, TabletId), BackfillCheckpoint>,
}

impl StaticCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(StaticCatalogState::default()),
        })
    }

    pub fn insert_table(&self, table: TableDescriptor, tablets: Vec<TabletDescriptor>) {
        let mut state = self.state.lock();
        state.tablets.insert(table.id.clone(), tablets);
        state.tables.insert(table.id.clone(), table);
    }

    pub fn set_checkpoint(
        &self,
        table_id: &TableId,
        tablet_id: &TabletId,
        checkpoint: BackfillCheckpoint,
    ) {
        self.state
            .lock()
            .checkpoints
            .insert((table_id.clone(), tablet_id.clone()), checkpoint);
    }

    pub fn get_checkpoint(
        &self,
        table_id: &TableId,
        tablet_id: &TabletId,
    ) -> Option<BackfillCheckpoint> {
        self.state
            .lock()
            .checkpoints
            .get(&(table_id.clone(), tablet_id.clone()))
            .cloned()
    }

    pub fn permission(&self, table_id: &TableId, index_id: &IndexId) -> Option<IndexPermission> {
        let state = self.state.lock();
        let table = state.tables.get(table_id)?;
        Some(table.index(index_id)?.permission.clone())
    }

    pub fn schema_version(&self, table_id: &TableId) -> Option<SchemaVersion> {
        Some(self.state.lock().tables.get(table_id)?.schema_version)
    }

    /// Simulate a concurrent alter winning a race: bump the persisted
    /// version without changing any stage.
    pub fn bump_schema_version(&self, table_id: &TableId) {
        let mut state = self.state.lock();
        let table = state.tables.get_mut(table_id).expect("no such table");
        table.schema_version = table.schema_version.succ();
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn table(&self, table_id: &TableId) -> anyhow::Result<TableDescriptor> {
        self.state
            .lock()
            .tables
            .get(table_id)
            .cloned()
            .with_context(|| format!("no such table {table_id}"))
    }

    async fn tablets(&self, table_id: &TableId) -> anyhow::Result<Vec<TabletDescriptor>> {
        self.state
            .lock()
            .tablets
            .get(table_id)
            .cloned()
            .with_context(|| format!("no tablets registered for {table_id}"))
    }

    async fn compare_and_set_permissions(
        &self,
        table_id: &TableId,
        expected_version: SchemaVersion,
        changes: BTreeMap<IndexId, IndexPermission>,
    ) -> anyhow::Result<SchemaVersion> {
        let mut state = self.state.lock();
        let table = state
            .tables
            .get_mut(table_id)
            .with_context(|| format!("no such table {table_id}"))?;
        if table.schema_version != expected_version {
            anyhow::bail!(ErrorMetadata::version_mismatch(
                "SchemaVersionMismatch",
                format!(
                    "expected schema version {expected_version}, found {}",
                    table.schema_version
                ),
            ));
        }
        for (index_id, stage) in changes {
            let index = table
                .indexes
                .iter_mut()
                .find(|index| index.id == index_id)
                .with_context(|| format!("no such index {index_id}"))?;
            anyhow::ensure!(
                index.permission.can_transition_to(&stage),
                "invalid permission transition for {index_id}: {:?} -> {stage:?}",
                index.permission
            );
            index.permission = stage;
        }
        table.schema_version = table.schema_version.succ();
        Ok(table.schema_version)
    }

    async fn checkpoint(
        &self,
        table_id: &TableId,
        tablet_id: &TabletId,
    ) -> anyhow::Result<BackfillCheckpoint> {
        Ok(self
            .get_checkpoint(table_id, tablet_id)
            .unwrap_or(BackfillCheckpoint::NotStarted))
    }

    async fn write_checkpoint(
        &self,
        table_id: &TableId,
        tablet_id: &TabletId,
        checkpoint: BackfillCheckpoint,
    ) -> anyhow::Result<()> {
        self.set_checkpoint(table_id, tablet_id, checkpoint);
        Ok(())
    }

    async fn clear_checkpoints(&self, table_id: &TableId) -> anyhow::Result<()> {
        self.state
            .lock()
            .checkpoints
            .retain(|(table, _), _| table != table_id);
        Ok(())
    }
}

/// Scripted fault for one tablet, consumed by its next chunk.
#[derive(Clone, Debug)]
pub enum ChunkFault {
    /// Fail the call with a transient error.
    Unavailable,
    /// Fail the call: the tablet no longer exists.
    TabletNotFound,
    /// Fail the call: the read timestamp is no longer servable.
    SnapshotTooOld,
    /// Succeed, but report these indexes as failed in the response.
    FailIndexes(BTreeMap<IndexId, String>),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CallRecord {
    SafeTime(TabletId),
    Chunk {
        tablet_id: TabletId,
        start_key: RowKey,
        index_ids: BTreeSet<IndexId>,
    },
    ReleaseCompactionHold(TabletId),
}

/// In-memory stand-in for the tablet workers: sorted rows per tablet, an
/// idempotent per-index write store, scripted faults, and a call log. Panics
/// if two chunks for the same tablet are ever in flight at once.
pub struct FakeCluster {
    state: Mutex<FakeClusterState>,
}

#[derive(Default)]
struct FakeClusterState {
    safe_times: BTreeMap<TabletId, HybridTimestamp>,
    /// Probe failures to serve per tablet before answering.
    safe_time_failures: BTreeMap<TabletId, u32>,
    /// Sorted row keys per tablet.
    rows: BTreeMap<TabletId, Vec<RowKey>>,
    /// Worker-side rows-per-chunk limit, applied below the request's budget.
    chunk_rows: usize,
    chunk_faults: BTreeMap<TabletId, VecDeque<ChunkFault>>,
    /// Index rows written so far. Writes are idempotent, as the real write
    /// path is on identical input.
    written: BTreeMap<IndexId, BTreeSet<RowKey>>,
    calls: Vec<CallRecord>,
    chunks_in_flight: BTreeSet<TabletId>,
}

impl FakeCluster {
    pub fn new(chunk_rows: usize) -> Arc<Self> {
        assert!(chunk_rows > 0);
        Arc::new(Self {
            state: Mutex::new(FakeClusterState {
                chunk_rows,
                ..FakeClusterState::default()
            }),
        })
    }

    pub fn set_safe_time(&self, tablet_id: &TabletId, safe_time: HybridTimestamp) {
        self.state
            .lock()
            .safe_times
            .insert(tablet_id.clone(), safe_time);
    }

    /// Make the next `failures` safe-time probes against this tablet fail
    /// transiently before it starts answering.
    pub fn fail_safe_time_probes(&self, tablet_id: &TabletId, failures: u32) {
        self.state
            .lock()
            .safe_time_failures
            .insert(tablet_id.clone(), failures);
    }

    pub fn insert_rows(&self, tablet_id: &TabletId, mut keys: Vec<RowKey>) {
        keys.sort();
        self.state.lock().rows.insert(tablet_id.clone(), keys);
    }

    pub fn push_chunk_fault(&self, tablet_id: &TabletId, fault: ChunkFault) {
        self.state
            .lock()
            .chunk_faults
            .entry(tablet_id.clone())
            .or_default()
            .push_back(fault);
    }

    pub fn written(&self, index_id: &IndexId) -> BTreeSet<RowKey> {
        self.state
            .lock()
            .written
            .get(index_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.state.lock().calls.clone()
    }

    /// Start keys of every chunk issued against this tablet, in order.
    pub fn chunk_starts(&self, tablet_id: &TabletId) -> Vec<RowKey> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                CallRecord::Chunk {
                    tablet_id: t,
                    start_key,
                    ..
                } if t == tablet_id => Some(start_key.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn safe_time_probes(&self, tablet_id: &TabletId) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, CallRecord::SafeTime(t) if t == tablet_id))
            .count()
    }

    pub fn released_tablets(&self) -> BTreeSet<TabletId> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                CallRecord::ReleaseCompactionHold(tablet_id) => Some(tablet_id.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl TabletDirectory for FakeCluster {
    async fn resolve_leader(&self, tablet_id: &TabletId) -> anyhow::Result<WorkerAddr> {
        Ok(WorkerAddr::new(format!("worker-{tablet_id}")))
    }
}

#[async_trait]
impl TabletService for FakeCluster {
    async fn get_safe_time(
        &self,
        _leader: &WorkerAddr,
        request: GetSafeTimeRequest,
    ) -> anyhow::Result<HybridTimestamp> {
        let mut state = self.state.lock();
        state
            .calls
            .push(CallRecord::SafeTime(request.tablet_id.clone()));
        if let Some(failures) = state.safe_time_failures.get_mut(&request.tablet_id) {
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!(ErrorMetadata::unavailable(
                    "LeaderNotReady",
                    format!("tablet {} has no elected leader", request.tablet_id),
                ));
            }
        }
        state
            .safe_times
            .get(&request.tablet_id)
            .copied()
            .with_context(|| format!("no safe time configured for {}", request.tablet_id))
    }

    async fn backfill_chunk(
        &self,
        _leader: &WorkerAddr,
        request: BackfillChunkRequest,
    ) -> anyhow::Result<BackfillChunkResponse> {
        let fault = {
            let mut state = self.state.lock();
            state.calls.push(CallRecord::Chunk {
                tablet_id: request.tablet_id.clone(),
                start_key: request.start_key.clone(),
                index_ids: request.index_ids.clone(),
            });
            assert!(
                state.chunks_in_flight.insert(request.tablet_id.clone()),
                "concurrent chunks issued for tablet {}",
                request.tablet_id
            );
            state
                .chunk_faults
                .get_mut(&request.tablet_id)
                .and_then(VecDeque::pop_front)
        };

        // Yield while "in flight" so overlapping chunk issuance would
        // actually be observed by the guard above.
        tokio::task::yield_now().await;

        let mut state = self.state.lock();
        state.chunks_in_flight.remove(&request.tablet_id);

        let failed_indexes = match fault {
            Some(ChunkFault::Unavailable) => {
                anyhow::bail!(ErrorMetadata::unavailable(
                    "ChunkTimeout",
                    format!("tablet {} did not answer in time", request.tablet_id),
                ));
            },
            Some(ChunkFault::TabletNotFound) => {
                anyhow::bail!(ErrorMetadata::tablet_not_found(
                    "TabletDropped",
                    format!("tablet {} does not exist on this server", request.tablet_id),
                ));
            },
            Some(ChunkFault::SnapshotTooOld) => {
                anyhow::bail!(ErrorMetadata::snapshot_too_old(
                    "SnapshotTooOld",
                    format!("read time {} is below the retention horizon", request.read_time),
                ));
            },
            Some(ChunkFault::FailIndexes(failed)) => failed,
            None => BTreeMap::new(),
        };

        let rows = state
            .rows
            .get(&request.tablet_id)
            .cloned()
            .unwrap_or_default();
        let budget = cmp::max(1, cmp::min(state.chunk_rows, request.row_budget));
        let mut remaining = rows.iter().filter(|key| **key >= request.start_key);
        let processed: Vec<RowKey> = remaining.by_ref().take(budget).cloned().collect();
        let backfilled_until = remaining.next().cloned();

        for key in &processed {
            for index_id in &request.index_ids {
                if failed_indexes.contains_key(index_id) {
                    continue;
                }
                state
                    .written
                    .entry(index_id.clone())
                    .or_default()
                    .insert(key.clone());
            }
        }

        Ok(BackfillChunkResponse {
            backfilled_until,
            failed_indexes,
        })
    }

    async fn release_compaction_hold(
        &self,
        _leader: &WorkerAddr,
        tablet_id: &TabletId,
    ) -> anyhow::Result<()> {
        self.state
            .lock()
            .calls
            .push(CallRecord::ReleaseCompactionHold(tablet_id.clone()));
        Ok(())
    }
}
