use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        LazyLock,
        Weak,
    },
    time::{
        Duration,
        SystemTime,
    },
};

use futures::{
    future::FusedFuture,
    FutureExt,
};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use tokio::runtime::Builder;

use super::{
    Runtime,
    TokioSpawnHandle,
};

pub static TEST_EPOCH: LazyLock<SystemTime> =
    LazyLock::new(|| SystemTime::UNIX_EPOCH + Duration::from_secs(1735689600)); // Jan 1st, 2025

/// Owns a paused current-thread tokio runtime whose clock only advances when
/// every task is idle, plus a seeded RNG, so scenario tests are
/// deterministic and sleeps are free.
pub struct TestDriver {
    tokio_runtime: Option<tokio::runtime::Runtime>,
    state: Arc<Mutex<TestRuntimeState>>,
}

impl TestDriver {
    pub fn new() -> Self {
        Self::new_with_seed(0)
    }

    pub fn new_with_seed(seed: u64) -> Self {
        let tokio_runtime = Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .expect("Failed to create Tokio runtime");
        let rng = ChaCha12Rng::seed_from_u64(seed);
        let creation_time = {
            let _handle = tokio_runtime.enter();
            tokio::time::Instant::now()
        };
        Self {
            tokio_runtime: Some(tokio_runtime),
            state: Arc::new(Mutex::new(TestRuntimeState { rng, creation_time })),
        }
    }

    pub fn rt(&self) -> TestRuntime {
        TestRuntime {
            tokio_handle: self
                .tokio_runtime
                .as_ref()
                .expect("tokio_runtime disappeared?")
                .handle()
                .clone(),
            state: Arc::downgrade(&self.state),
        }
    }

    pub fn run_until<F: Future>(&self, f: F) -> F::Output {
        self.tokio_runtime
            .as_ref()
            .expect("tokio_runtime disappeared?")
            .block_on(f)
    }
}

impl Drop for TestDriver {
    fn drop(&mut self) {
        self.tokio_runtime
            .take()
            .expect("tokio_runtime disappeared?")
            .shutdown_background();
    }
}

struct TestRuntimeState {
    creation_time: tokio::time::Instant,
    rng: ChaCha12Rng,
}

#[derive(Clone)]
pub struct TestRuntime {
    tokio_handle: tokio::runtime::Handle,
    state: Weak<Mutex<TestRuntimeState>>,
}

impl TestRuntime {
    fn state(&self) -> Arc<Mutex<TestRuntimeState>> {
        self.state
            .upgrade()
            .expect("TestRuntime outlived its TestDriver")
    }
}

impl Runtime for TestRuntime {
    type Handle = TokioSpawnHandle;
    type Instant = tokio::time::Instant;
    type Rng = ChaCha12Rng;

    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        let _guard = self.tokio_handle.enter();
        Box::pin(tokio::time::sleep(duration).fuse())
    }

    fn spawn(
        &self,
        _name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Self::Handle {
        self.tokio_handle.spawn(f).into()
    }

    fn system_time(&self) -> SystemTime {
        let creation_time = self.state().lock().creation_time;
        let elapsed = self.monotonic_now() - creation_time;
        *TEST_EPOCH + elapsed
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        let _guard = self.tokio_handle.enter();
        tokio::time::Instant::now()
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut Self::Rng) -> R) -> R {
        f(&mut self.state().lock().rng)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::Rng;

    use super::TestDriver;
    use crate::runtime::Runtime;

    #[test]
    fn test_virtual_time_advances_without_sleeping() {
        let td = TestDriver::new();
        let rt = td.rt();
        td.run_until(async {
            let before = rt.monotonic_now();
            rt.wait(Duration::from_secs(3600)).await;
            assert_eq!(before.elapsed(), Duration::from_secs(3600));
        });
    }

    #[test]
    fn test_seeded_rng_is_deterministic() {
        let a = TestDriver::new_with_seed(7);
        let b = TestDriver::new_with_seed(7);
        let x: u64 = a.rt().with_rng(|rng| rng.random());
        let y: u64 = b.rt().with_rng(|rng| rng.random());
        assert_eq!(x, y);
    }
}
