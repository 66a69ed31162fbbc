//! Tunable limits and parameters for the backfill coordinator.
//!
//! Every knob here should have a comment explaining what it's for and the
//! upper/lower bounds if applicable so an oncall engineer can adjust these
//! safely if needed. All knobs can be overridden with an environment
//! variable of the same name.
#![deny(missing_docs)]

use std::{
    sync::LazyLock,
    time::Duration,
};

use crate::env::env_config;

/// Set a consistent thread stack size regardless of environment. This is
/// 2x Rust's default: https://doc.rust-lang.org/nightly/std/thread/index.html#stack-size
pub static RUNTIME_STACK_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("RUNTIME_STACK_SIZE", 4 * 1024 * 1024));

/// 0 -> default (number of cores)
pub static RUNTIME_WORKER_THREADS: LazyLock<usize> =
    LazyLock::new(|| env_config("RUNTIME_WORKER_THREADS", 0));

/// Row budget hint sent with each backfill chunk request. The worker may
/// process fewer rows (e.g. to respect a byte budget) but never more.
pub static BACKFILL_CHUNK_ROW_BUDGET: LazyLock<usize> =
    LazyLock::new(|| env_config("BACKFILL_CHUNK_ROW_BUDGET", 1024));

/// Maximum attempts for a single backfill chunk before the chunk is
/// surfaced as an unrecoverable failure for its indexes.
pub static BACKFILL_CHUNK_MAX_ATTEMPTS: LazyLock<u32> =
    LazyLock::new(|| env_config("BACKFILL_CHUNK_MAX_ATTEMPTS", 20));

/// First retry delay for a failed backfill chunk attempt.
pub static BACKFILL_CHUNK_INITIAL_BACKOFF: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_millis(env_config("BACKFILL_CHUNK_INITIAL_BACKOFF_MS", 100))
});

/// Cap on the retry delay between backfill chunk attempts.
pub static BACKFILL_CHUNK_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("BACKFILL_CHUNK_MAX_BACKOFF_SECS", 10)));

/// Deadline for one backfill chunk across all of its attempts. The chunk is
/// the only operation in the subsystem with a wall-clock bound; safe-time
/// probes are deliberately unbounded.
pub static BACKFILL_CHUNK_DEADLINE: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("BACKFILL_CHUNK_DEADLINE_SECS", 600)));

/// First retry delay for a failed safe-time probe.
pub static SAFE_TIME_INITIAL_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("SAFE_TIME_INITIAL_BACKOFF_MS", 100)));

/// Cap on the retry delay between safe-time probe attempts.
pub static SAFE_TIME_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("SAFE_TIME_MAX_BACKOFF_SECS", 30)));

/// Attempts for the post-success compaction-hold release before giving up.
/// The release is best-effort: delete-marker GC stays suppressed until a
/// later release succeeds, which costs space, not correctness.
pub static COMPACTION_RELEASE_MAX_ATTEMPTS: LazyLock<u32> =
    LazyLock::new(|| env_config("COMPACTION_RELEASE_MAX_ATTEMPTS", 3));
