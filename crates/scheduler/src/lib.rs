//! Periodic job scheduler.
//!
//! A single supervisor owns the catalog of named recurring jobs (ingestion,
//! aggregation, snapshotting, reputation and graph builders, model accuracy
//! checks) and guarantees single-flight execution per job: ticks are
//! anchored at `start + k * interval` and a tick that fires while the
//! previous invocation is still running is dropped, never queued. The
//! scheduler itself performs no storage or network I/O; each handler owns
//! its side effects.

use std::{
    collections::BTreeMap,
    future::Future,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use common::{
    errors::report_error,
    runtime::{
        Runtime,
        SpawnHandle,
        UnixTimestamp,
    },
};
use futures::{
    future::BoxFuture,
    FutureExt,
};
use parking_lot::Mutex;
use serde::Serialize;

mod metrics;


/// One registered job body. The blanket impl lets plain async closures
/// register directly; larger jobs implement the trait on their own type so
/// they can carry state and be tested in isolation.
pub trait JobHandler: Send + Sync + 'static {
    fn run(&self) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> JobHandler for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn run(&self) -> BoxFuture<'static, anyhow::Result<()>> {
        self().boxed()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<UnixTimestamp>,
}

#[derive(Default)]
struct JobState {
    running: AtomicBool,
    last_run: Mutex<Option<UnixTimestamp>>,
}

struct RegisteredJob {
    interval: Duration,
    handler: Arc<dyn JobHandler>,
    state: Arc<JobState>,
    timer_loop: Option<Box<dyn SpawnHandle>>,
}

#[derive(Clone)]
pub struct Scheduler<RT: Runtime> {
    rt: RT,
    jobs: Arc<Mutex<BTreeMap<String, RegisteredJob>>>,
}

impl<RT: Runtime> Scheduler<RT> {
    pub fn new(rt: RT) -> Self {
        Self {
            rt,
            jobs: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Record a job. Names are unique; registering an existing name
    /// replaces the job, and the replacement starts immediately if the old
    /// job was started.
    pub fn register(&self, name: impl Into<String>, interval: Duration, handler: impl JobHandler) {
        let name = name.into();
        assert!(
            interval > Duration::ZERO,
            "job '{name}' must have a positive interval"
        );
        let handler: Arc<dyn JobHandler> = Arc::new(handler);
        let mut jobs = self.jobs.lock();
        let was_started = if let Some(mut previous) = jobs.remove(&name) {
            tracing::info!("Replacing scheduled job '{name}'");
            match previous.timer_loop.take() {
                Some(mut handle) => {
                    handle.shutdown();
                    true
                },
                None => false,
            }
        } else {
            false
        };
        let mut job = RegisteredJob {
            interval,
            handler,
            state: Arc::new(JobState::default()),
            timer_loop: None,
        };
        if was_started {
            job.timer_loop = Some(self.spawn_timer_loop(
                name.clone(),
                job.interval,
                job.handler.clone(),
                job.state.clone(),
            ));
        }
        jobs.insert(name, job);
    }

    /// Start every registered job. Jobs already started are untouched.
    pub fn start_all(&self) {
        let mut jobs = self.jobs.lock();
        let names: Vec<String> = jobs.keys().cloned().collect();
        for name in names {
            self.start_job_locked(&mut jobs, &name);
        }
    }

    /// Invoke the job immediately once, then on every interval boundary.
    /// Returns false for an unknown name.
    pub fn start_job(&self, name: &str) -> bool {
        let mut jobs = self.jobs.lock();
        self.start_job_locked(&mut jobs, name)
    }

    /// Cancel scheduled wake-ups for every job. In-flight handlers complete
    /// normally.
    pub fn stop_all(&self) {
        let mut jobs = self.jobs.lock();
        for (name, job) in jobs.iter_mut() {
            if let Some(mut handle) = job.timer_loop.take() {
                tracing::info!("Stopping scheduled job '{name}'");
                handle.shutdown();
            }
        }
    }

    /// Returns false for an unknown name.
    pub fn stop_job(&self, name: &str) -> bool {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(name) else {
            return false;
        };
        if let Some(mut handle) = job.timer_loop.take() {
            tracing::info!("Stopping scheduled job '{name}'");
            handle.shutdown();
        }
        true
    }

    pub fn status(&self) -> BTreeMap<String, JobStatus> {
        self.jobs
            .lock()
            .iter()
            .map(|(name, job)| {
                (
                    name.clone(),
                    JobStatus {
                        running: job.state.running.load(Ordering::SeqCst),
                        last_run: *job.state.last_run.lock(),
                    },
                )
            })
            .collect()
    }

    fn start_job_locked(&self, jobs: &mut BTreeMap<String, RegisteredJob>, name: &str) -> bool {
        let Some(job) = jobs.get_mut(name) else {
            return false;
        };
        if job.timer_loop.is_some() {
            return true;
        }
        tracing::info!("Starting scheduled job '{name}' every {:?}", job.interval);
        job.timer_loop = Some(self.spawn_timer_loop(
            name.to_string(),
            job.interval,
            job.handler.clone(),
            job.state.clone(),
        ));
        true
    }

    fn spawn_timer_loop(
        &self,
        name: String,
        interval: Duration,
        handler: Arc<dyn JobHandler>,
        state: Arc<JobState>,
    ) -> Box<dyn SpawnHandle> {
        let rt = self.rt.clone();
        self.rt.spawn("scheduled_job_timer", async move {
            let start = rt.monotonic_now();
            let mut tick = 0u32;
            loop {
                fire(&rt, &name, &handler, &state);
                tick += 1;
                let next = start + interval * tick;
                let wait = next.saturating_duration_since(rt.monotonic_now());
                rt.wait(wait).await;
            }
        })
    }
}

/// Fire one tick: invoke the handler unless the previous invocation still
/// holds the single-flight latch, in which case the tick is dropped.
fn fire<RT: Runtime>(rt: &RT, name: &str, handler: &Arc<dyn JobHandler>, state: &Arc<JobState>) {
    if state
        .running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        tracing::warn!("Job '{name}' is still running, dropping tick");
        metrics::log_tick_dropped(name);
        return;
    }
    let rt = rt.clone();
    let name = name.to_string();
    let handler = handler.clone();
    let state = state.clone();
    // The invocation is a detached task: stopping the timer loop never
    // preempts an in-flight handler.
    drop(rt.clone().spawn("scheduled_job", async move {
        let timer = metrics::job_timer();
        let result = std::panic::AssertUnwindSafe(handler.run())
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(())) => {
                *state.last_run.lock() = Some(rt.unix_timestamp());
                metrics::log_job_result(&name, true);
            },
            Ok(Err(e)) => {
                let mut e = e.context(format!("Job '{name}' failed"));
                report_error(&mut e);
                metrics::log_job_result(&name, false);
            },
            Err(panic) => {
                tracing::error!("Job '{name}' panicked: {}", panic_message(&panic));
                metrics::log_job_result(&name, false);
            },
        }
        state.running.store(false, Ordering::SeqCst);
        drop(timer);
    }));
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "opaque panic payload".to_string())
}
