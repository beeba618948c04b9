use std::{
    future::Future,
    pin::Pin,
    time::SystemTime,
};

use common::{
    knobs::{
        RUNTIME_STACK_SIZE,
        RUNTIME_WORKER_THREADS,
    },
    runtime::{
        FutureHandle,
        Runtime,
        SpawnHandle,
    },
};
use futures::{
    future::FusedFuture,
    FutureExt,
};
use rand::RngCore;
use tokio::{
    runtime::{
        Builder,
        Handle as TokioRuntimeHandle,
        Runtime as TokioRuntime,
    },
    time::{
        sleep,
        Duration,
    },
};

/// Runtime for running in production that sleeps for wallclock time and
/// doesn't mock out any functionality.
#[derive(Clone)]
pub struct ProdRuntime {
    rt: TokioRuntimeHandle,
}

impl ProdRuntime {
    pub fn init_tokio() -> anyhow::Result<TokioRuntime> {
        assert!(
            TokioRuntimeHandle::try_current().is_err(),
            "Tried to create a `ProdRuntime` from within a Tokio context. Are you using \
             `#[tokio::main]` or `#[tokio::test]`?"
        );
        let mut tokio_builder = Builder::new_multi_thread();
        tokio_builder.thread_stack_size(*RUNTIME_STACK_SIZE);
        if *RUNTIME_WORKER_THREADS > 0 {
            tokio_builder.worker_threads(*RUNTIME_WORKER_THREADS);
        }
        let tokio_rt = tokio_builder.enable_all().build()?;
        Ok(tokio_rt)
    }

    /// Create a new tokio-based runtime.
    /// Expected usage:
    /// ```ignore
    /// fn main() -> anyhow::Result<()> {
    ///     let tokio = ProdRuntime::init_tokio()?;
    ///     let rt = ProdRuntime::new(&tokio);
    ///     rt.block_on("main", async {});
    ///     Ok(())
    /// }
    /// ```
    /// The `tokio_rt` should live for the duration of `main`. At the end of
    /// `main` its `Drop` will run and join all spawned futures, which should
    /// include all references to the handle `ProdRuntime`. If `ProdRuntime`
    /// is used after the associated `TokioRuntime` has been dropped, it will
    /// panic.
    pub fn new(tokio_rt: &TokioRuntime) -> Self {
        Self {
            rt: tokio_rt.handle().clone(),
        }
    }

    pub fn block_on<F: Future>(&self, name: &'static str, f: F) -> F::Output {
        tracing::debug!("Entering runtime for {name}");
        self.rt.block_on(f)
    }
}

impl Runtime for ProdRuntime {
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(sleep(duration).fuse())
    }

    fn spawn(
        &self,
        _name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        FutureHandle::new(self.rt.spawn(f))
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    fn rng(&self) -> Box<dyn RngCore> {
        Box::new(rand::rng())
    }
}
