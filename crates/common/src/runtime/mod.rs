//! Runtime trait for abstracting away OS-esque features and allowing
//! different implementations for test and prod. Functionality like time,
//! randomness and task spawning operates quite differently between the two:
//! in tests we don't want `wait` to sleep for wall-clock time but to advance
//! a virtual clock instead. Application code is parameterized by a runtime
//! implementation so both get the same code paths.

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
        UNIX_EPOCH,
    },
};

use anyhow::Context as _;
use async_trait::async_trait;
use futures::{
    future::{
        BoxFuture,
        FusedFuture,
    },
    select_biased,
    FutureExt,
};
use rand::RngCore;
use serde::{
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
};
use thiserror::Error;
use uuid::Uuid;

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
        if !e.is_panic() {
            return JoinError::Canceled;
        }
        let payload = e.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "opaque panic payload".to_string());
        JoinError::Panicked(anyhow::anyhow!(message))
    }
}

pub trait SpawnHandle: Send + Sync {
    fn shutdown(&mut self);
    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>>;
}

/// Handle to a future spawned on a tokio executor. Dropping the handle
/// detaches the future rather than canceling it.
pub struct FutureHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl FutureHandle {
    pub fn new(handle: tokio::task::JoinHandle<()>) -> Box<dyn SpawnHandle> {
        Box::new(Self { handle })
    }
}

impl SpawnHandle for FutureHandle {
    fn shutdown(&mut self) {
        self.handle.abort();
    }

    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>> {
        async move {
            match (&mut self.handle).await {
                Ok(()) => Ok(()),
                Err(e) => Err(JoinError::from(e)),
            }
        }
        .boxed()
    }
}

/// Shutdown the associated future, preempting it at its next yield point, and
/// join on its result.
pub async fn shutdown_and_join(mut handle: Box<dyn SpawnHandle>) -> anyhow::Result<()> {
    handle.shutdown();
    if let Err(e) = handle.join().await {
        if !matches!(e, JoinError::Canceled) {
            return Err(e.into());
        }
    }
    Ok(())
}

pub trait Runtime: Clone + Sync + Send + 'static {
    /// Sleep for the given duration.
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>>;

    /// Spawn a future on the runtime's executor.
    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle>;

    /// Return (a potentially-virtualized) system time. Compare with
    /// `std::time::UNIX_EPOCH` to obtain a Unix timestamp.
    fn system_time(&self) -> SystemTime;

    fn unix_timestamp(&self) -> UnixTimestamp {
        UnixTimestamp(
            self.system_time()
                .duration_since(UNIX_EPOCH)
                .expect("Failed to compute unix timestamp"),
        )
    }

    /// Return (a potentially-virtualized) reading from a monotonic clock.
    fn monotonic_now(&self) -> tokio::time::Instant;

    /// Use the runtime's source of randomness.
    fn rng(&self) -> Box<dyn RngCore>;

    fn new_uuid_v4(&self) -> Uuid {
        let mut rng = self.rng();
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }
}

/// Abstraction over a unix timestamp. Internally it stores a Duration since
/// the unix epoch; it serializes as integer milliseconds, which is how the
/// document store collaborators persist wall times.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UnixTimestamp(Duration);

impl UnixTimestamp {
    pub fn from_secs(secs: u64) -> Self {
        UnixTimestamp(Duration::from_secs(secs))
    }

    pub fn from_millis(ms: u64) -> Self {
        UnixTimestamp(Duration::from_millis(ms))
    }

    pub fn as_secs(&self) -> u64 {
        self.0.as_secs()
    }

    pub fn as_ms(&self) -> u64 {
        u64::try_from(self.0.as_millis()).expect("Timestamp past the year 584556019")
    }

    pub fn as_system_time(&self) -> SystemTime {
        UNIX_EPOCH + self.0
    }

    pub fn checked_sub(&self, rhs: UnixTimestamp) -> Option<Duration> {
        self.0.checked_sub(rhs.0)
    }

    /// `self - rhs`, clamped to zero when `rhs` is in the future.
    pub fn saturating_sub(&self, rhs: UnixTimestamp) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

impl Sub<UnixTimestamp> for UnixTimestamp {
    type Output = Duration;

    fn sub(self, rhs: UnixTimestamp) -> Duration {
        self.0 - rhs.0
    }
}

impl Add<Duration> for UnixTimestamp {
    type Output = UnixTimestamp;

    fn add(self, rhs: Duration) -> UnixTimestamp {
        UnixTimestamp(self.0 + rhs)
    }
}

impl Sub<Duration> for UnixTimestamp {
    type Output = UnixTimestamp;

    fn sub(self, rhs: Duration) -> UnixTimestamp {
        UnixTimestamp(self.0 - rhs)
    }
}

impl Serialize for UnixTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.as_ms())
    }
}

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u64::deserialize(deserializer).map(UnixTimestamp::from_millis)
    }
}

impl TryFrom<SystemTime> for UnixTimestamp {
    type Error = anyhow::Error;

    fn try_from(ts: SystemTime) -> anyhow::Result<Self> {
        Ok(UnixTimestamp(
            ts.duration_since(UNIX_EPOCH)
                .context("System time predates the unix epoch")?,
        ))
    }
}

#[derive(thiserror::Error, Debug)]
#[error("'{description}' timeout after {duration:?}")]
pub struct TimeoutError {
    pub description: &'static str,
    pub duration: Duration,
}

#[async_trait]
pub trait WithTimeout {
    async fn with_timeout<T>(
        &self,
        description: &'static str,
        duration: Duration,
        fut: impl Future<Output = anyhow::Result<T>> + Send,
    ) -> anyhow::Result<T>;
}

#[async_trait]
impl<RT: Runtime> WithTimeout for RT {
    async fn with_timeout<T>(
        &self,
        description: &'static str,
        duration: Duration,
        fut: impl Future<Output = anyhow::Result<T>> + Send,
    ) -> anyhow::Result<T> {
        select_biased! {
            result = fut.fuse() => result,
            _ = self.wait(duration) => {
                anyhow::bail!(TimeoutError { description, duration });
            },
        }
    }
}
