use std::{
    future::Future,
    time::Duration,
};

use common::{
    backoff::Backoff,
    runtime::Runtime,
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};

use crate::coordinator::AbortFlag;

/// Retry behavior for one remote task, composed with a task closure by
/// [`with_retry`]. A policy is plain data; the differences between a chunk
/// (bounded, deadlined) and a safe-time probe (unbounded) are entirely in
/// the values.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Bounds the whole task across all attempts, not each attempt.
    pub deadline: Option<Duration>,
}

impl RetryPolicy {
    /// Retry forever. For calls the caller cannot make progress without.
    pub fn indefinite(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            max_attempts: None,
            deadline: None,
        }
    }

    pub fn bounded(
        initial_backoff: Duration,
        max_backoff: Duration,
        max_attempts: u32,
        deadline: Duration,
    ) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            max_attempts: Some(max_attempts),
            deadline: Some(deadline),
        }
    }
}

/// Drive `f` to success under `policy`, sleeping with jittered exponential
/// backoff between attempts. Errors whose taxonomy code is not retriable
/// (tablet gone, snapshot too old, version mismatch, aborted) surface
/// immediately; everything else is treated as transient until attempts or
/// the deadline run out. The abort flag is checked before every attempt, so
/// an aborted run issues no new calls.
pub async fn with_retry<RT: Runtime, T, F, Fut>(
    rt: &RT,
    op: &'static str,
    policy: RetryPolicy,
    abort: &AbortFlag,
    mut f: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut backoff = Backoff::new(policy.initial_backoff, policy.max_backoff);
    let deadline = policy.deadline.map(|d| rt.monotonic_now() + d);
    loop {
        if abort.aborted() {
            anyhow::bail!(ErrorMetadata::aborted(
                "RunAborted",
                format!("{op} cancelled: the backfill run was aborted"),
            ));
        }
        let e = match f().await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        if !e.is_retriable() {
            return Err(e);
        }
        let attempts = backoff.failures() + 1;
        if policy.max_attempts.is_some_and(|max| attempts >= max) {
            return Err(e.context(format!("{op} failed after {attempts} attempts")));
        }
        if deadline
            .as_ref()
            .is_some_and(|deadline| rt.monotonic_now() >= deadline.clone())
        {
            return Err(e.context(format!("{op} deadline exceeded after {attempts} attempts")));
        }
        let delay = rt.with_rng(|rng| backoff.fail(rng));
        tracing::warn!(
            "{op} failed (attempt {attempts}), retrying in {}ms: {e:#}",
            delay.as_millis()
        );
        rt.wait(delay).await;
    }
}
