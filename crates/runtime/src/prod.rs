use std::{
    future::Future,
    pin::Pin,
    time::{
        Duration,
        SystemTime,
    },
};

use common::{
    knobs::{
        RUNTIME_STACK_SIZE,
        RUNTIME_WORKER_THREADS,
    },
    runtime::{
        Runtime,
        TokioSpawnHandle,
    },
};
use futures::{
    future::FusedFuture,
    FutureExt,
};
use rand::rngs::ThreadRng;
use tokio::runtime::{
    Builder,
    Handle as TokioRuntimeHandle,
    Runtime as TokioRuntime,
};

/// The production runtime: a multi-threaded tokio executor, the OS clock,
/// and thread-local randomness.
#[derive(Clone)]
pub struct ProdRuntime {
    handle: TokioRuntimeHandle,
}

impl ProdRuntime {
    /// Build the tokio runtime `ProdRuntime` runs on. Callers keep the
    /// returned runtime alive for the lifetime of the process; dropping it
    /// tears down all spawned work.
    pub fn init_tokio() -> anyhow::Result<TokioRuntime> {
        let mut builder = Builder::new_multi_thread();
        builder
            .enable_all()
            .thread_stack_size(*RUNTIME_STACK_SIZE)
            .thread_name("coordinator-runtime");
        if *RUNTIME_WORKER_THREADS > 0 {
            builder.worker_threads(*RUNTIME_WORKER_THREADS);
        }
        Ok(builder.build()?)
    }

    pub fn new(tokio_rt: &TokioRuntime) -> Self {
        Self {
            handle: tokio_rt.handle().clone(),
        }
    }

    pub fn block_on<F: Future>(&self, f: F) -> F::Output {
        self.handle.block_on(f)
    }
}

impl Runtime for ProdRuntime {
    type Handle = TokioSpawnHandle;
    type Instant = tokio::time::Instant;
    type Rng = ThreadRng;

    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        let _guard = self.handle.enter();
        Box::pin(tokio::time::sleep(duration).fuse())
    }

    fn spawn(
        &self,
        _name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Self::Handle {
        self.handle.spawn(f).into()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        let _guard = self.handle.enter();
        tokio::time::Instant::now()
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut Self::Rng) -> R) -> R {
        f(&mut rand::rng())
    }
}
