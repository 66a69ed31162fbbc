use std::{
    collections::BTreeMap,
    sync::Arc,
};

use common::{
    runtime::testing::{
        TestDriver,
        TestRuntime,
    },
    types::{
        HybridTimestamp,
        RowKey,
        SchemaVersion,
        TableId,
        TabletId,
    },
};
use maplit::{
    btreemap,
    btreeset,
};
use proptest::prelude::*;
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
    test_helpers::{
        index_descriptor,
        table_descriptor,
        tablet_descriptor,
        ChunkFault,
        FakeCluster,
        StaticCatalog,
    },
    types::{
        BackfillCheckpoint,
        IndexDescriptor,
        IndexPermission,
        TableDescriptor,
    },
    MultiStageAlter,
};

const TABLE: &str = "events";

fn keys(keys: &[&str]) -> Vec<RowKey> {
    keys.iter().map(|key| RowKey::from(*key)).collect()
}

/// One indexed table with three tablets and per-tablet rows, plus a backing
/// table (with its own tablets) per index so compaction-hold releases have
/// somewhere to go.
fn setup(
    catalog: &StaticCatalog,
    cluster: &FakeCluster,
    indexes: Vec<IndexDescriptor>,
    version: SchemaVersion,
) -> TableDescriptor {
    let table = table_descriptor(TABLE, version, indexes.clone());
    catalog.insert_table(
        table.clone(),
        vec![
            tablet_descriptor("t1", ""),
            tablet_descriptor("t2", ""),
            tablet_descriptor("t3", ""),
        ],
    );
    for index in &indexes {
        let backing = TableDescriptor {
            id: index.table_id.clone(),
            schema_version: SchemaVersion::ZERO,
            indexes: vec![],
        };
        catalog.insert_table(
            backing,
            vec![
                tablet_descriptor(&format!("{}-tablet1", index.id), ""),
                tablet_descriptor(&format!("{}-tablet2", index.id), ""),
            ],
        );
    }
    cluster.set_safe_time(&TabletId::new("t1"), HybridTimestamp::from_micros(100));
    cluster.set_safe_time(&TabletId::new("t2"), HybridTimestamp::from_micros(90));
    cluster.set_safe_time(&TabletId::new("t3"), HybridTimestamp::from_micros(95));
    cluster.insert_rows(&TabletId::new("t1"), keys(&["a", "b", "c"]));
    cluster.insert_rows(&TabletId::new("t2"), keys(&["d", "e"]));
    cluster.insert_rows(&TabletId::new("t3"), keys(&["f"]));
    table
}

fn launch(
    rt: &TestRuntime,
    catalog: &Arc<StaticCatalog>,
    cluster: &Arc<FakeCluster>,
    version: SchemaVersion,
    indexes: Vec<IndexDescriptor>,
) -> (
    Arc<BackfillTable<TestRuntime>>,
    oneshot::Receiver<BackfillOutcome>,
) {
    let (backfill, completion) = BackfillTable::new(
        rt.clone(),
        catalog.clone() as Arc<dyn Catalog>,
        cluster.clone() as Arc<dyn TabletDirectory>,
        cluster.clone() as Arc<dyn TabletService>,
        TableId::new(TABLE),
        version,
        indexes,
        HybridTimestamp::from_micros(50),
    );
    backfill.launch();
    (backfill, completion)
}

async fn yield_many(n: usize) {
    for _ in 0..n {
        tokio::task::yield_now().await;
    }
}

#[test]
fn test_full_backfill_publishes_index() -> anyhow::Result<()> {
    let td = TestDriver::new();
    let rt = td.rt();
    td.run_until(async {
        let catalog = StaticCatalog::new();
        let cluster = FakeCluster::new(2);
        let index = index_descriptor("by_user", IndexPermission::Backfill);
        setup(&catalog, &cluster, vec![index.clone()], SchemaVersion::new(3));

        let (backfill, completion) = launch(
            &rt,
            &catalog,
            &cluster,
            SchemaVersion::new(3),
            vec![index.clone()],
        );
        let outcome = completion.await?;

        assert_eq!(outcome.succeeded, btreeset! { index.id.clone() });
        assert!(outcome.failed.is_empty());
        assert!(backfill.done());
        // The chosen read time is the minimum safe time across tablets.
        assert_eq!(backfill.read_time(), Some(HybridTimestamp::from_micros(90)));

        // Every row of every tablet landed in the index exactly once.
        let written = cluster.written(&index.id);
        assert_eq!(
            written,
            keys(&["a", "b", "c", "d", "e", "f"]).into_iter().collect()
        );

        // The index went public and the schema version advanced.
        assert_eq!(
            catalog.permission(&TableId::new(TABLE), &index.id),
            Some(IndexPermission::Public)
        );
        assert_eq!(
            catalog.schema_version(&TableId::new(TABLE)),
            Some(SchemaVersion::new(4))
        );

        // Compaction holds were lifted on every tablet of the index's own
        // table, and checkpoints were cleared.
        assert_eq!(
            cluster.released_tablets(),
            btreeset! {
                TabletId::new("by_user-tablet1"),
                TabletId::new("by_user-tablet2"),
            }
        );
        for tablet in ["t1", "t2", "t3"] {
            assert_eq!(
                catalog.get_checkpoint(&TableId::new(TABLE), &TabletId::new(tablet)),
                None
            );
        }
        Ok(())
    })
}

#[test]
fn test_read_time_hidden_until_all_probes_answer() -> anyhow::Result<()> {
    let td = TestDriver::new();
    let rt = td.rt();
    td.run_until(async {
        let catalog = StaticCatalog::new();
        let cluster = FakeCluster::new(2);
        let index = index_descriptor("by_user", IndexPermission::Backfill);
        setup(&catalog, &cluster, vec![index.clone()], SchemaVersion::new(3));
        // Two tablets answer immediately; one needs several probe attempts.
        cluster.fail_safe_time_probes(&TabletId::new("t2"), 3);

        let (backfill, completion) = launch(
            &rt,
            &catalog,
            &cluster,
            SchemaVersion::new(3),
            vec![index.clone()],
        );

        // Let the fast probes land without advancing time: the straggler is
        // parked in backoff, so the timestamp must not be chosen and no
        // chunk may be issued yet.
        yield_many(32).await;
        assert!(cluster.safe_time_probes(&TabletId::new("t1")) >= 1);
        assert_eq!(backfill.read_time(), None);
        assert!(cluster.chunk_starts(&TabletId::new("t1")).is_empty());

        let outcome = completion.await?;
        assert_eq!(outcome.succeeded, btreeset! { index.id.clone() });
        assert_eq!(backfill.read_time(), Some(HybridTimestamp::from_micros(90)));
        // The straggler was probed until it answered.
        assert_eq!(cluster.safe_time_probes(&TabletId::new("t2")), 4);
        Ok(())
    })
}

#[test]
fn test_index_scoped_failure_leaves_other_indexes_unharmed() -> anyhow::Result<()> {
    let td = TestDriver::new();
    let rt = td.rt();
    td.run_until(async {
        let catalog = StaticCatalog::new();
        let cluster = FakeCluster::new(2);
        let index_x = index_descriptor("idx_x", IndexPermission::Backfill);
        let index_y = index_descriptor("idx_y", IndexPermission::Backfill);
        setup(
            &catalog,
            &cluster,
            vec![index_x.clone(), index_y.clone()],
            SchemaVersion::new(3),
        );
        cluster.push_chunk_fault(
            &TabletId::new("t2"),
            ChunkFault::FailIndexes(btreemap! { index_x.id.clone() => "boom".to_owned() }),
        );

        let (_backfill, completion) = launch(
            &rt,
            &catalog,
            &cluster,
            SchemaVersion::new(3),
            vec![index_x.clone(), index_y.clone()],
        );
        let outcome = completion.await?;

        assert_eq!(outcome.succeeded, btreeset! { index_y.id.clone() });
        assert_eq!(
            outcome.failed,
            btreemap! { index_x.id.clone() => "boom".to_owned() }
        );

        // Y was built everywhere, including the tablet where X failed.
        assert_eq!(
            cluster.written(&index_y.id),
            keys(&["a", "b", "c", "d", "e", "f"]).into_iter().collect()
        );

        assert_eq!(
            catalog.permission(&TableId::new(TABLE), &index_x.id),
            Some(IndexPermission::Failed {
                message: "boom".to_owned()
            })
        );
        assert_eq!(
            catalog.permission(&TableId::new(TABLE), &index_y.id),
            Some(IndexPermission::Public)
        );

        // Only the surviving index's table had its compaction hold lifted.
        assert_eq!(
            cluster.released_tablets(),
            btreeset! {
                TabletId::new("idx_y-tablet1"),
                TabletId::new("idx_y-tablet2"),
            }
        );
        Ok(())
    })
}

#[test]
fn test_snapshot_too_old_fails_index_but_other_tablets_finish() -> anyhow::Result<()> {
    let td = TestDriver::new();
    let rt = td.rt();
    td.run_until(async {
        let catalog = StaticCatalog::new();
        let cluster = FakeCluster::new(2);
        let index = index_descriptor("by_user", IndexPermission::Backfill);
        setup(&catalog, &cluster, vec![index.clone()], SchemaVersion::new(3));
        cluster.push_chunk_fault(&TabletId::new("t2"), ChunkFault::SnapshotTooOld);

        let (_backfill, completion) = launch(
            &rt,
            &catalog,
            &cluster,
            SchemaVersion::new(3),
            vec![index.clone()],
        );
        let outcome = completion.await?;

        assert!(outcome.succeeded.is_empty());
        let message = &outcome.failed[&index.id];
        assert!(message.contains("retention horizon"), "got {message}");
        assert!(matches!(
            catalog.permission(&TableId::new(TABLE), &index.id),
            Some(IndexPermission::Failed { .. })
        ));
        assert!(cluster.released_tablets().is_empty());

        // The other tablets still chunked to completion; the result is moot
        // but their work was never interrupted.
        let written = cluster.written(&index.id);
        for key in keys(&["a", "b", "c", "f"]) {
            assert!(written.contains(&key));
        }
        Ok(())
    })
}

#[test]
fn test_tablet_dropped_fails_all_pending_indexes() -> anyhow::Result<()> {
    let td = TestDriver::new();
    let rt = td.rt();
    td.run_until(async {
        let catalog = StaticCatalog::new();
        let cluster = FakeCluster::new(1);
        let index_x = index_descriptor("idx_x", IndexPermission::Backfill);
        let index_y = index_descriptor("idx_y", IndexPermission::Backfill);
        setup(
            &catalog,
            &cluster,
            vec![index_x.clone(), index_y.clone()],
            SchemaVersion::new(3),
        );
        // First chunk fails X only; the next chunk finds the tablet gone,
        // which takes down every index still pending there - Y included,
        // even though X was the one already failing.
        cluster.push_chunk_fault(
            &TabletId::new("t2"),
            ChunkFault::FailIndexes(btreemap! { index_x.id.clone() => "boom".to_owned() }),
        );
        cluster.push_chunk_fault(&TabletId::new("t2"), ChunkFault::TabletNotFound);

        let (_backfill, completion) = launch(
            &rt,
            &catalog,
            &cluster,
            SchemaVersion::new(3),
            vec![index_x.clone(), index_y.clone()],
        );
        let outcome = completion.await?;

        assert!(outcome.succeeded.is_empty());
        assert_eq!(outcome.failed[&index_x.id], "boom");
        assert!(outcome.failed[&index_y.id].contains("does not exist"));
        Ok(())
    })
}

#[test]
fn test_transient_chunk_failures_are_retried_through() -> anyhow::Result<()> {
    let td = TestDriver::new();
    let rt = td.rt();
    td.run_until(async {
        let catalog = StaticCatalog::new();
        let cluster = FakeCluster::new(2);
        let index = index_descriptor("by_user", IndexPermission::Backfill);
        setup(&catalog, &cluster, vec![index.clone()], SchemaVersion::new(3));
        cluster.push_chunk_fault(&TabletId::new("t1"), ChunkFault::Unavailable);
        cluster.push_chunk_fault(&TabletId::new("t1"), ChunkFault::Unavailable);

        let (_backfill, completion) = launch(
            &rt,
            &catalog,
            &cluster,
            SchemaVersion::new(3),
            vec![index.clone()],
        );
        let outcome = completion.await?;

        assert_eq!(outcome.succeeded, btreeset! { index.id.clone() });
        assert_eq!(
            cluster.written(&index.id),
            keys(&["a", "b", "c", "d", "e", "f"]).into_iter().collect()
        );
        // The first two attempts failed and were retried at the same key.
        let starts = cluster.chunk_starts(&TabletId::new("t1"));
        assert!(starts.len() >= 3);
        assert_eq!(starts[0], starts[1]);
        assert_eq!(starts[1], starts[2]);
        Ok(())
    })
}

#[test]
fn test_resume_from_persisted_checkpoint() -> anyhow::Result<()> {
    let td = TestDriver::new();
    let rt = td.rt();
    td.run_until(async {
        let catalog = StaticCatalog::new();
        let cluster = FakeCluster::new(2);
        let index = index_descriptor("by_user", IndexPermission::Backfill);
        setup(&catalog, &cluster, vec![index.clone()], SchemaVersion::new(3));
        cluster.insert_rows(&TabletId::new("t1"), keys(&["a", "b", "m", "q", "z"]));
        // A previous coordinator persisted progress up to "m" before dying.
        catalog.set_checkpoint(
            &TableId::new(TABLE),
            &TabletId::new("t1"),
            BackfillCheckpoint::Resume(RowKey::from("m")),
        );

        let (_backfill, completion) = launch(
            &rt,
            &catalog,
            &cluster,
            SchemaVersion::new(3),
            vec![index.clone()],
        );
        let outcome = completion.await?;
        assert_eq!(outcome.succeeded, btreeset! { index.id.clone() });

        // The restarted driver picked up at "m", not the tablet's start key.
        let starts = cluster.chunk_starts(&TabletId::new("t1"));
        assert_eq!(starts[0], RowKey::from("m"));

        // Rows before the checkpoint were not re-read.
        let written = cluster.written(&index.id);
        assert!(!written.contains(&RowKey::from("a")));
        assert!(!written.contains(&RowKey::from("b")));
        for key in keys(&["m", "q", "z", "d", "e", "f"]) {
            assert!(written.contains(&key));
        }
        Ok(())
    })
}

#[test]
fn test_tablet_already_complete_is_skipped_on_restart() -> anyhow::Result<()> {
    let td = TestDriver::new();
    let rt = td.rt();
    td.run_until(async {
        let catalog = StaticCatalog::new();
        let cluster = FakeCluster::new(2);
        let index = index_descriptor("by_user", IndexPermission::Backfill);
        setup(&catalog, &cluster, vec![index.clone()], SchemaVersion::new(3));
        catalog.set_checkpoint(
            &TableId::new(TABLE),
            &TabletId::new("t1"),
            BackfillCheckpoint::Complete,
        );

        let (_backfill, completion) = launch(
            &rt,
            &catalog,
            &cluster,
            SchemaVersion::new(3),
            vec![index.clone()],
        );
        let outcome = completion.await?;
        assert_eq!(outcome.succeeded, btreeset! { index.id.clone() });
        assert!(cluster.chunk_starts(&TabletId::new("t1")).is_empty());
        Ok(())
    })
}

#[test]
fn test_chunks_are_sequential_with_advancing_checkpoints() -> anyhow::Result<()> {
    let td = TestDriver::new();
    let rt = td.rt();
    td.run_until(async {
        let catalog = StaticCatalog::new();
        // One row per chunk forces a long sequential chain; the fake panics
        // if two chunks for one tablet ever overlap.
        let cluster = FakeCluster::new(1);
        let index = index_descriptor("by_user", IndexPermission::Backfill);
        setup(&catalog, &cluster, vec![index.clone()], SchemaVersion::new(3));
        cluster.insert_rows(
            &TabletId::new("t1"),
            keys(&["a", "b", "c", "d", "e", "f", "g", "h"]),
        );

        let (_backfill, completion) = launch(
            &rt,
            &catalog,
            &cluster,
            SchemaVersion::new(3),
            vec![index.clone()],
        );
        let outcome = completion.await?;
        assert_eq!(outcome.succeeded, btreeset! { index.id.clone() });

        let starts = cluster.chunk_starts(&TabletId::new("t1"));
        assert_eq!(starts.len(), 8);
        for pair in starts.windows(2) {
            assert!(pair[0] < pair[1], "chunk start keys must advance");
        }
        Ok(())
    })
}

#[test]
fn test_version_conflict_on_commit_is_silent() -> anyhow::Result<()> {
    let td = TestDriver::new();
    let rt = td.rt();
    td.run_until(async {
        let catalog = StaticCatalog::new();
        let cluster = FakeCluster::new(2);
        let index = index_descriptor("by_user", IndexPermission::Backfill);
        setup(&catalog, &cluster, vec![index.clone()], SchemaVersion::new(3));
        // A concurrent alter advances the schema while the run is in flight.
        catalog.bump_schema_version(&TableId::new(TABLE));

        let (backfill, completion) = launch(
            &rt,
            &catalog,
            &cluster,
            SchemaVersion::new(3),
            vec![index.clone()],
        );
        let outcome = completion.await?;

        // The run itself completed, but its commit was superseded: the
        // stage is untouched and only the concurrent alter's version bump
        // is visible.
        assert_eq!(outcome.succeeded, btreeset! { index.id.clone() });
        assert!(backfill.done());
        assert_eq!(
            catalog.permission(&TableId::new(TABLE), &index.id),
            Some(IndexPermission::Backfill)
        );
        assert_eq!(
            catalog.schema_version(&TableId::new(TABLE)),
            Some(SchemaVersion::new(4))
        );
        Ok(())
    })
}

#[test]
fn test_abort_stops_new_chunks() -> anyhow::Result<()> {
    let td = TestDriver::new();
    let rt = td.rt();
    td.run_until(async {
        let catalog = StaticCatalog::new();
        let cluster = FakeCluster::new(1);
        let index = index_descriptor("by_user", IndexPermission::Backfill);
        setup(&catalog, &cluster, vec![index.clone()], SchemaVersion::new(3));
        let many: Vec<RowKey> = (0..64)
            .map(|i| RowKey::new(format!("row{i:03}").into_bytes()))
            .collect();
        cluster.insert_rows(&TabletId::new("t1"), many);

        let (backfill, completion) = launch(
            &rt,
            &catalog,
            &cluster,
            SchemaVersion::new(3),
            vec![index.clone()],
        );

        // Wait for chunking to begin, then pull the plug.
        for _ in 0..256 {
            tokio::task::yield_now().await;
            if !cluster.chunk_starts(&TabletId::new("t1")).is_empty() {
                break;
            }
        }
        backfill.abort();
        let outcome = completion.await?;

        assert!(outcome.succeeded.is_empty());
        assert!(outcome.failed[&index.id].contains("aborted"));
        assert!(matches!(
            catalog.permission(&TableId::new(TABLE), &index.id),
            Some(IndexPermission::Failed { .. })
        ));
        // The abort flag stopped chunk issuance long before the tablet was
        // exhausted.
        assert!(cluster.chunk_starts(&TabletId::new("t1")).len() < 64);
        Ok(())
    })
}

#[test]
fn test_table_with_no_tablets_succeeds_trivially() -> anyhow::Result<()> {
    let td = TestDriver::new();
    let rt = td.rt();
    td.run_until(async {
        let catalog = StaticCatalog::new();
        let cluster = FakeCluster::new(2);
        let index = index_descriptor("by_user", IndexPermission::Backfill);
        let table = table_descriptor(TABLE, SchemaVersion::new(3), vec![index.clone()]);
        catalog.insert_table(table, vec![]);
        catalog.insert_table(
            TableDescriptor {
                id: index.table_id.clone(),
                schema_version: SchemaVersion::ZERO,
                indexes: vec![],
            },
            vec![],
        );

        let (_backfill, completion) = launch(
            &rt,
            &catalog,
            &cluster,
            SchemaVersion::new(3),
            vec![index.clone()],
        );
        let outcome = completion.await?;
        assert_eq!(outcome.succeeded, btreeset! { index.id.clone() });
        assert_eq!(
            catalog.permission(&TableId::new(TABLE), &index.id),
            Some(IndexPermission::Public)
        );
        Ok(())
    })
}

#[test]
fn test_alter_walks_stages_and_launches_backfill() -> anyhow::Result<()> {
    let td = TestDriver::new();
    let rt = td.rt();
    td.run_until(async {
        let catalog = StaticCatalog::new();
        let cluster = FakeCluster::new(2);
        let index = index_descriptor("by_email", IndexPermission::DeleteOnly);
        setup(&catalog, &cluster, vec![index.clone()], SchemaVersion::ZERO);
        // The controller picks its cutoff from the runtime clock, so the
        // fakes must answer with safe times above it.
        let future_ts = HybridTimestamp::from_micros(2_000_000_000_000_000);
        for tablet in ["t1", "t2", "t3"] {
            cluster.set_safe_time(&TabletId::new(tablet), future_ts);
        }

        let alter = MultiStageAlter::new(
            rt.clone(),
            catalog.clone() as Arc<dyn Catalog>,
            cluster.clone() as Arc<dyn TabletDirectory>,
            cluster.clone() as Arc<dyn TabletService>,
        );
        let table_id = TableId::new(TABLE);

        // Round one: delete-only becomes write-and-delete. No backfill yet.
        let launched = alter
            .launch_next_version_if_necessary(&table_id, SchemaVersion::ZERO)
            .await?;
        assert!(launched.is_none());
        assert_eq!(
            catalog.permission(&table_id, &index.id),
            Some(IndexPermission::WriteAndDelete)
        );
        assert_eq!(catalog.schema_version(&table_id), Some(SchemaVersion::new(1)));

        // Round two: the index reaches the backfill stage and a run starts.
        let launched = alter
            .launch_next_version_if_necessary(&table_id, SchemaVersion::new(1))
            .await?
            .expect("backfill should have launched");
        assert_eq!(
            catalog.permission(&table_id, &index.id),
            Some(IndexPermission::Backfill)
        );

        let outcome = launched.completion.await?;
        assert_eq!(outcome.succeeded, btreeset! { index.id.clone() });
        assert_eq!(
            catalog.permission(&table_id, &index.id),
            Some(IndexPermission::Public)
        );
        assert_eq!(catalog.schema_version(&table_id), Some(SchemaVersion::new(3)));

        // Full ladder walked: delete-only, write-and-delete, backfill,
        // public, one persisted version bump per step.
        Ok(())
    })
}

#[test]
fn test_relaunch_resumes_mid_build_indexes_from_checkpoints() -> anyhow::Result<()> {
    let td = TestDriver::new();
    let rt = td.rt();
    td.run_until(async {
        let catalog = StaticCatalog::new();
        let cluster = FakeCluster::new(2);
        let index = index_descriptor("by_user", IndexPermission::Backfill);
        setup(&catalog, &cluster, vec![index.clone()], SchemaVersion::new(3));
        let future_ts = HybridTimestamp::from_micros(2_000_000_000_000_000);
        for tablet in ["t1", "t2", "t3"] {
            cluster.set_safe_time(&TabletId::new(tablet), future_ts);
        }
        cluster.insert_rows(&TabletId::new("t1"), keys(&["a", "b", "m", "q"]));
        // State left behind by a run that died mid-flight.
        catalog.set_checkpoint(
            &TableId::new(TABLE),
            &TabletId::new("t1"),
            BackfillCheckpoint::Resume(RowKey::from("m")),
        );
        catalog.set_checkpoint(
            &TableId::new(TABLE),
            &TabletId::new("t3"),
            BackfillCheckpoint::Complete,
        );

        let alter = MultiStageAlter::new(
            rt.clone(),
            catalog.clone() as Arc<dyn Catalog>,
            cluster.clone() as Arc<dyn TabletDirectory>,
            cluster.clone() as Arc<dyn TabletService>,
        );
        let table_id = TableId::new(TABLE);
        let launched = alter
            .relaunch_pending_backfills(&table_id)
            .await?
            .expect("a mid-build index should relaunch");
        let outcome = launched.completion.await?;

        assert_eq!(outcome.succeeded, btreeset! { index.id.clone() });
        assert_eq!(
            catalog.permission(&table_id, &index.id),
            Some(IndexPermission::Public)
        );
        // Tablet 1 resumed at its checkpoint, tablet 3 was already done.
        assert_eq!(
            cluster.chunk_starts(&TabletId::new("t1"))[0],
            RowKey::from("m")
        );
        assert!(cluster.chunk_starts(&TabletId::new("t3")).is_empty());
        Ok(())
    })
}

#[test]
fn test_relaunch_without_mid_build_indexes_is_a_noop() -> anyhow::Result<()> {
    let td = TestDriver::new();
    let rt = td.rt();
    td.run_until(async {
        let catalog = StaticCatalog::new();
        let cluster = FakeCluster::new(2);
        let index = index_descriptor("by_user", IndexPermission::Public);
        setup(&catalog, &cluster, vec![index.clone()], SchemaVersion::new(3));

        let alter = MultiStageAlter::new(
            rt.clone(),
            catalog.clone() as Arc<dyn Catalog>,
            cluster.clone() as Arc<dyn TabletDirectory>,
            cluster.clone() as Arc<dyn TabletService>,
        );
        let launched = alter
            .relaunch_pending_backfills(&TableId::new(TABLE))
            .await?;
        assert!(launched.is_none());
        Ok(())
    })
}

#[test]
fn test_alter_with_stale_version_is_a_noop() -> anyhow::Result<()> {
    let td = TestDriver::new();
    let rt = td.rt();
    td.run_until(async {
        let catalog = StaticCatalog::new();
        let cluster = FakeCluster::new(2);
        let index = index_descriptor("by_email", IndexPermission::DeleteOnly);
        setup(&catalog, &cluster, vec![index.clone()], SchemaVersion::new(5));

        let alter = MultiStageAlter::new(
            rt.clone(),
            catalog.clone() as Arc<dyn Catalog>,
            cluster.clone() as Arc<dyn TabletDirectory>,
            cluster.clone() as Arc<dyn TabletService>,
        );
        let table_id = TableId::new(TABLE);

        // A concurrent alter already advanced the version; this call acts on
        // stale information and must change nothing.
        let launched = alter
            .launch_next_version_if_necessary(&table_id, SchemaVersion::new(2))
            .await?;
        assert!(launched.is_none());
        assert_eq!(
            catalog.permission(&table_id, &index.id),
            Some(IndexPermission::DeleteOnly)
        );
        assert_eq!(catalog.schema_version(&table_id), Some(SchemaVersion::new(5)));
        Ok(())
    })
}

#[test]
fn test_alter_ignores_terminal_indexes() -> anyhow::Result<()> {
    let td = TestDriver::new();
    let rt = td.rt();
    td.run_until(async {
        let catalog = StaticCatalog::new();
        let cluster = FakeCluster::new(2);
        let public = index_descriptor("already_public", IndexPermission::Public);
        let failed = index_descriptor(
            "already_failed",
            IndexPermission::Failed {
                message: "boom".to_owned(),
            },
        );
        setup(
            &catalog,
            &cluster,
            vec![public.clone(), failed.clone()],
            SchemaVersion::new(7),
        );

        let alter = MultiStageAlter::new(
            rt.clone(),
            catalog.clone() as Arc<dyn Catalog>,
            cluster.clone() as Arc<dyn TabletDirectory>,
            cluster.clone() as Arc<dyn TabletService>,
        );
        let table_id = TableId::new(TABLE);

        let launched = alter
            .launch_next_version_if_necessary(&table_id, SchemaVersion::new(7))
            .await?;
        assert!(launched.is_none());
        // Nothing to advance: the version is untouched.
        assert_eq!(catalog.schema_version(&table_id), Some(SchemaVersion::new(7)));
        Ok(())
    })
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 16, failure_persistence: None, ..ProptestConfig::default() })]

    /// For any set of per-tablet safe times, the chosen read time is exactly
    /// their minimum.
    #[test]
    fn proptest_chosen_read_time_is_min(safe_micros in proptest::collection::vec(1u64..1_000_000, 1..6)) {
        let td = TestDriver::new();
        let rt = td.rt();
        td.run_until(async {
            let catalog = StaticCatalog::new();
            let cluster = FakeCluster::new(2);
            let index = index_descriptor("by_user", IndexPermission::Backfill);
            let table = table_descriptor(TABLE, SchemaVersion::new(3), vec![index.clone()]);
            let tablets: Vec<_> = (0..safe_micros.len())
                .map(|i| tablet_descriptor(&format!("t{i}"), ""))
                .collect();
            catalog.insert_table(table, tablets.clone());
            catalog.insert_table(
                TableDescriptor {
                    id: index.table_id.clone(),
                    schema_version: SchemaVersion::ZERO,
                    indexes: vec![],
                },
                vec![],
            );
            for (tablet, micros) in tablets.iter().zip(&safe_micros) {
                cluster.set_safe_time(&tablet.id, HybridTimestamp::from_micros(*micros));
            }

            let (backfill, completion) = BackfillTable::new(
                rt.clone(),
                catalog.clone() as Arc<dyn Catalog>,
                cluster.clone() as Arc<dyn TabletDirectory>,
                cluster.clone() as Arc<dyn TabletService>,
                TableId::new(TABLE),
                SchemaVersion::new(3),
                vec![index.clone()],
                HybridTimestamp::MIN,
            );
            backfill.launch();
            let outcome = completion.await.unwrap();
            prop_assert_eq!(outcome.failed, BTreeMap::new());

            let expected = HybridTimestamp::from_micros(*safe_micros.iter().min().unwrap());
            prop_assert_eq!(backfill.read_time(), Some(expected));
            Ok(())
        })?;
    }
}
