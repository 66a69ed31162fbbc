use std::{
    sync::LazyLock,
    time::Duration,
};

use prometheus::{
    register_histogram,
    register_int_counter,
    Histogram,
    IntCounter,
};

static BACKFILL_RUNS_STARTED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "backfill_runs_started_total",
        "Backfill runs launched by the coordinator"
    )
    .unwrap()
});

static BACKFILL_INDEXES_PUBLISHED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "backfill_indexes_published_total",
        "Indexes committed to the public stage by finished runs"
    )
    .unwrap()
});

static BACKFILL_INDEXES_FAILED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "backfill_indexes_failed_total",
        "Indexes committed to the failed stage by finished runs"
    )
    .unwrap()
});

static SAFE_TIME_PROBES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "backfill_safe_time_probes_total",
        "Safe-time probe attempts, including retries"
    )
    .unwrap()
});

static BACKFILL_CHUNK_ATTEMPTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "backfill_chunk_attempts_total",
        "Backfill chunk attempts, including retries"
    )
    .unwrap()
});

static BACKFILL_CHUNK_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "backfill_chunk_seconds",
        "Wall-clock duration of one backfill chunk across all of its attempts"
    )
    .unwrap()
});

static COMPACTION_HOLDS_RELEASED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "backfill_compaction_holds_released_total",
        "Index-table tablets whose delete-marker compaction hold was lifted"
    )
    .unwrap()
});

pub fn log_run_started() {
    BACKFILL_RUNS_STARTED_TOTAL.inc();
}

pub fn log_run_completed(published: usize, failed: usize) {
    BACKFILL_INDEXES_PUBLISHED_TOTAL.inc_by(published as u64);
    BACKFILL_INDEXES_FAILED_TOTAL.inc_by(failed as u64);
}

pub fn log_safe_time_probe() {
    SAFE_TIME_PROBES_TOTAL.inc();
}

pub fn log_chunk_attempt() {
    BACKFILL_CHUNK_ATTEMPTS_TOTAL.inc();
}

pub fn log_chunk_finished(elapsed: Duration) {
    BACKFILL_CHUNK_SECONDS.observe(elapsed.as_secs_f64());
}

pub fn log_compaction_hold_released() {
    COMPACTION_HOLDS_RELEASED_TOTAL.inc();
}
