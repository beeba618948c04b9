//! Test implementation of the Runtime trait built on tokio's paused clock.
//!
//! Tests run under `#[tokio::test(start_paused = true)]`: timers resolve by
//! advancing virtual time instead of sleeping, so window math and scheduler
//! cadences are exact and tests finish instantly. Randomness is a seeded
//! ChaCha12 stream so generated ids are reproducible.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use futures::{
    future::FusedFuture,
    FutureExt,
};
use parking_lot::Mutex;
use rand::{
    RngCore,
    SeedableRng,
};
use rand_chacha::ChaCha12Rng;

use crate::runtime::{
    FutureHandle,
    Runtime,
    SpawnHandle,
};

const DEFAULT_SEED: u64 = 0;

/// Wall-clock origin for virtual time. All test timestamps are offsets from
/// this instant.
pub const TEST_EPOCH: Duration = Duration::from_millis(1_700_000_000_000);

#[derive(Clone)]
pub struct TestRuntime {
    origin: tokio::time::Instant,
    rng: Arc<Mutex<ChaCha12Rng>>,
}

impl TestRuntime {
    /// Must be constructed inside a paused tokio runtime
    /// (`#[tokio::test(start_paused = true)]`).
    pub fn new() -> Self {
        Self::new_with_seed(DEFAULT_SEED)
    }

    pub fn new_with_seed(seed: u64) -> Self {
        crate::env::config_test();
        Self {
            origin: tokio::time::Instant::now(),
            rng: Arc::new(Mutex::new(ChaCha12Rng::seed_from_u64(seed))),
        }
    }

    /// Advance virtual time, firing any timers that become due.
    pub async fn advance(&self, duration: Duration) {
        tokio::time::advance(duration).await;
    }
}

impl Default for TestRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime for TestRuntime {
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(tokio::time::sleep(duration).fuse())
    }

    fn spawn(
        &self,
        _name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        FutureHandle::new(tokio::spawn(f))
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + TEST_EPOCH + (tokio::time::Instant::now() - self.origin)
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    fn rng(&self) -> Box<dyn RngCore> {
        Box::new(SharedRng(self.rng.clone()))
    }
}

struct SharedRng(Arc<Mutex<ChaCha12Rng>>);

impl RngCore for SharedRng {
    fn next_u32(&mut self) -> u32 {
        self.0.lock().next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.0.lock().next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.lock().fill_bytes(dest)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::TestRuntime;
    use crate::runtime::Runtime;

    #[tokio::test(start_paused = true)]
    async fn test_deterministic_uuids() {
        let a = TestRuntime::new_with_seed(42);
        let b = TestRuntime::new_with_seed(42);
        assert_eq!(a.new_uuid_v4(), b.new_uuid_v4());
        assert_ne!(a.new_uuid_v4(), a.new_uuid_v4());
    }

    #[tokio::test(start_paused = true)]
    async fn test_advance_moves_system_time() {
        let rt = TestRuntime::new();
        let before = rt.unix_timestamp();
        rt.advance(Duration::from_secs(3600)).await;
        assert_eq!(rt.unix_timestamp() - before, Duration::from_secs(3600));
    }
}
