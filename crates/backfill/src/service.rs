//! The remote surface of tablet-owning workers, as this subsystem consumes
//! it. Connection management, request encoding and leader failover live in
//! the transport layer behind these traits; implementations translate
//! transport failures into the `errors` taxonomy before returning.

use std::collections::{
    BTreeMap,
    BTreeSet,
};

use async_trait::async_trait;
use common::types::{
    HybridTimestamp,
    IndexId,
    RowKey,
    TabletId,
};
use derive_more::Display;

/// Network location of a tablet-owning worker.
#[derive(Clone, Debug, Display, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct WorkerAddr(String);

impl WorkerAddr {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Debug)]
pub struct GetSafeTimeRequest {
    pub tablet_id: TabletId,
    /// Floor below which an answer is uninteresting. The tablet may answer
    /// with any safe timestamp at or above it.
    pub min_cutoff: HybridTimestamp,
}

#[derive(Clone, Debug)]
pub struct BackfillChunkRequest {
    pub tablet_id: TabletId,
    /// Target indexes this chunk writes into.
    pub index_ids: BTreeSet<IndexId>,
    /// First key to process, inclusive.
    pub start_key: RowKey,
    /// The run's frozen global read point.
    pub read_time: HybridTimestamp,
    /// Upper bound on rows processed by this chunk. The worker may process
    /// fewer (e.g. to respect a byte budget) but never more.
    pub row_budget: usize,
}

#[derive(Clone, Debug)]
pub struct BackfillChunkResponse {
    /// First unprocessed key, the next chunk's start. `None` when the
    /// tablet's range is exhausted.
    pub backfilled_until: Option<RowKey>,
    /// Indexes this chunk could not write, each with the worker's
    /// diagnostic. Indexes absent from this map were written successfully.
    pub failed_indexes: BTreeMap<IndexId, String>,
}

/// Resolves the current leader replica of a tablet. Resolution may fail
/// transiently (e.g. an election in progress); the retry layer above absorbs
/// that, not implementations.
#[async_trait]
pub trait TabletDirectory: Send + Sync {
    async fn resolve_leader(&self, tablet_id: &TabletId) -> anyhow::Result<WorkerAddr>;
}

#[async_trait]
pub trait TabletService: Send + Sync {
    /// The latest timestamp at which the tablet guarantees that no unseen
    /// write ordered earlier can still arrive. Idempotent: repeated calls
    /// return the same or a later value. No side effects on the tablet.
    async fn get_safe_time(
        &self,
        leader: &WorkerAddr,
        request: GetSafeTimeRequest,
    ) -> anyhow::Result<HybridTimestamp>;

    /// Scan one bounded slice of the tablet at the request's read time,
    /// writing matching rows into the listed target indexes.
    async fn backfill_chunk(
        &self,
        leader: &WorkerAddr,
        request: BackfillChunkRequest,
    ) -> anyhow::Result<BackfillChunkResponse>;

    /// Allow compactions of this (index-table) tablet to garbage-collect
    /// delete markers again. One-shot and idempotent.
    async fn release_compaction_hold(
        &self,
        leader: &WorkerAddr,
        tablet_id: &TabletId,
    ) -> anyhow::Result<()>;
}
