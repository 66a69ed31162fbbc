//! Runtime trait for abstracting away OS-esque features and allowing
//! different implementations for test and prod.

use std::{
    future::Future,
    ops::{
        Add,
        Sub,
    },
    pin::Pin,
    time::{
        Duration,
        SystemTime,
    },
};

use futures::{
    future::FusedFuture,
    FutureExt,
    TryFutureExt,
};
use rand::Rng;
use thiserror::Error;

use crate::types::HybridTimestamp;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[derive(Error, Debug)]
pub enum JoinError {
    #[error("Future canceled")]
    Canceled,
    #[error("Future panicked: {0:?}")]
    Panicked(anyhow::Error),
}

impl From<tokio::task::JoinError> for JoinError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            JoinError::Canceled
        } else {
            JoinError::Panicked(anyhow::anyhow!("{e}"))
        }
    }
}

pub trait SpawnHandle: Send + Sync {
    type Future: Future<Output = Result<(), JoinError>> + Send;
    fn shutdown(&mut self);
    fn into_join_future(self) -> Self::Future;
}

/// Shutdown the associated future, preempting it at its next yield point, and
/// join on its result.
pub async fn shutdown_and_join(mut handle: impl SpawnHandle) -> anyhow::Result<()> {
    handle.shutdown();
    if let Err(e) = handle.into_join_future().await {
        if !matches!(e, JoinError::Canceled) {
            return Err(e.into());
        }
    }
    Ok(())
}

/// Spawn handle over a plain tokio task, shared by the production and test
/// runtimes.
pub struct TokioSpawnHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl From<tokio::task::JoinHandle<()>> for TokioSpawnHandle {
    fn from(handle: tokio::task::JoinHandle<()>) -> Self {
        Self { handle }
    }
}

impl SpawnHandle for TokioSpawnHandle {
    type Future = Pin<Box<dyn Future<Output = Result<(), JoinError>> + Send>>;

    fn shutdown(&mut self) {
        self.handle.abort();
    }

    fn into_join_future(self) -> Self::Future {
        self.handle.map_err(JoinError::from).boxed()
    }
}

/// A Runtime is an operating-system abstraction for the coordinator code:
/// time, randomness and task spawning operate differently between test and
/// prod (in test we don't want `wait` to sleep on the wall clock but to
/// advance virtual time), so everything that touches them goes through this
/// trait and application code is parameterized by an implementation.
pub trait Runtime: Clone + Sync + Send + 'static {
    /// Spawn handle type returned by `spawn`.
    type Handle: SpawnHandle;

    /// `std::time::Instant`-like type returned by `monotonic_now()`.
    type Instant: RuntimeInstant;

    /// Source of randomness associated with the runtime.
    type Rng: Rng;

    /// Sleep for the given duration.
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>>;

    /// Spawn a future on the runtime's executor.
    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Self::Handle;

    /// Return (a potentially-virtualized) system time. Compare with
    /// `std::time::UNIX_EPOCH` to obtain a Unix timestamp.
    fn system_time(&self) -> SystemTime;

    /// Return (a potentially-virtualized) reading from a monotonic clock.
    fn monotonic_now(&self) -> Self::Instant;

    /// Use the runtime's source of randomness.
    fn with_rng<R>(&self, f: impl FnOnce(&mut Self::Rng) -> R) -> R;

    /// A hybrid timestamp for the current system time, with an empty logical
    /// component.
    fn generate_timestamp(&self) -> anyhow::Result<HybridTimestamp> {
        HybridTimestamp::try_from(self.system_time())
    }
}

/// Abstraction over the `Instant` type associated with a `Runtime`, so that
/// deadline arithmetic works against the test runtime's virtual clock.
pub trait RuntimeInstant:
    Add<Duration, Output = Self>
    + Clone
    + Sub<Output = Duration>
    + Sync
    + Send
    + Ord
    + PartialOrd
    + Eq
    + PartialEq
{
    fn elapsed(&self) -> Duration;
}

impl RuntimeInstant for tokio::time::Instant {
    fn elapsed(&self) -> Duration {
        tokio::time::Instant::elapsed(self)
    }
}
