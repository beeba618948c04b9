//! Background worker draining the durable task queue into the executor's
//! sync path.
//!
//! A single long-lived loop leases one task at a time via the store's CAS
//! dequeue, runs it, and either completes it or returns it to the queue with
//! an incremented attempt count. When the queue is empty the loop blocks on
//! the enqueue signal, with a bounded poll as fallback.

use std::{
    sync::Arc,
    time::Duration,
};

use common::{
    backoff::Backoff,
    errors::report_error,
    knobs::QUEUE_WORKER_POLL_INTERVAL,
    runtime::{
        Runtime,
        SpawnHandle,
    },
};
use event_listener::Event;
use futures::{
    pin_mut,
    select_biased,
    FutureExt,
};
use parking_lot::Mutex;
use serde::Serialize;
use store::{
    results::{
        ErrorCode,
        ExecutionResult,
    },
    tasks::{
        ParserTask,
        TaskStatus,
    },
};

use crate::{
    metrics,
    ExecutorInner,
};

const LEASE_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const LEASE_MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Stopped,
    Running,
    /// Accepts no new leases; the in-flight task finishes first.
    Draining,
}

pub(crate) struct WorkerHandle {
    state: Mutex<WorkerState>,
    wakeup: Arc<Event>,
    handle: Mutex<Option<Box<dyn SpawnHandle>>>,
}

impl WorkerHandle {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(WorkerState::Stopped),
            wakeup: Arc::new(Event::new()),
            handle: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub(crate) fn notify(&self) {
        self.wakeup.notify(usize::MAX);
    }
}

pub(crate) fn start<RT: Runtime>(inner: &Arc<ExecutorInner<RT>>) {
    {
        let mut state = inner.worker.state.lock();
        if *state != WorkerState::Stopped {
            return;
        }
        *state = WorkerState::Running;
    }
    let loop_inner = inner.clone();
    let handle = inner.rt.spawn("task_queue_worker", worker_loop(loop_inner));
    *inner.worker.handle.lock() = Some(handle);
}

pub(crate) async fn stop<RT: Runtime>(inner: &Arc<ExecutorInner<RT>>) {
    {
        let mut state = inner.worker.state.lock();
        if *state != WorkerState::Running {
            return;
        }
        *state = WorkerState::Draining;
    }
    inner.worker.notify();
    let handle = inner.worker.handle.lock().take();
    if let Some(mut handle) = handle {
        if let Err(e) = handle.join().await {
            let mut e = anyhow::Error::from(e).context("Task queue worker exited abnormally");
            report_error(&mut e);
        }
    }
    *inner.worker.state.lock() = WorkerState::Stopped;
}

async fn worker_loop<RT: Runtime>(inner: Arc<ExecutorInner<RT>>) {
    tracing::info!("Starting task queue worker");
    let mut backoff = Backoff::new(LEASE_INITIAL_BACKOFF, LEASE_MAX_BACKOFF);
    loop {
        if inner.worker.state() == WorkerState::Draining {
            break;
        }
        // Registered before the claim: an enqueue racing an empty claim
        // still finds a listener to wake.
        let listener = inner.worker.wakeup.listen();
        let now = inner.rt.unix_timestamp();
        let leased = match inner.tasks.claim_next_queued(now).await {
            Ok(leased) => leased,
            Err(e) => {
                let mut e = e.context("Task lease failed");
                report_error(&mut e);
                let delay = backoff.fail(&mut inner.rt.rng());
                inner.rt.wait(delay).await;
                continue;
            },
        };
        backoff.reset();
        match leased {
            Some(task) => execute_leased(&inner, task).await,
            None => {
                let listener = listener.fuse();
                pin_mut!(listener);
                select_biased! {
                    _ = listener => {},
                    _ = inner.rt.wait(*QUEUE_WORKER_POLL_INTERVAL) => {},
                }
            },
        }
    }
    tracing::info!("Task queue worker drained");
}

async fn execute_leased<RT: Runtime>(inner: &Arc<ExecutorInner<RT>>, mut task: ParserTask) {
    let timer = metrics::worker_task_timer();
    let payload = match task.typed_payload() {
        Ok(payload) => payload,
        Err(e) => {
            // A malformed payload can never succeed; fail it terminally
            // without burning dispatch attempts.
            let now = inner.rt.unix_timestamp();
            task.status = TaskStatus::Failed;
            task.error = Some(format!("{e:#}"));
            task.completed_at = Some(now);
            task.updated_at = now;
            persist_task(inner, &task).await;
            metrics::log_worker_outcome("failed");
            return;
        },
    };

    let execution = inner
        .run_sync_inner(
            task.id.clone(),
            Some(task.account_id.clone()),
            payload,
            true,
        )
        .await;
    let result = match execution {
        Ok(result) => result,
        Err(e) => {
            let mut e = e.context("Queue dispatch failed");
            report_error(&mut e);
            ExecutionResult::failure(ErrorCode::RemoteError, "internal dispatch failure")
        },
    };

    let now = inner.rt.unix_timestamp();
    match result {
        ExecutionResult::Success { data, .. } => {
            task.status = TaskStatus::Done;
            task.result = Some(data.clone());
            task.completed_at = Some(now);
            task.updated_at = now;
            task.error = None;
            task.error_code = None;
            persist_task(inner, &task).await;
            if let Err(e) = inner.results.persist(&task, &data).await {
                let mut e = e.context("Failed to persist task results");
                report_error(&mut e);
            }
            metrics::log_worker_outcome("done");
        },
        ExecutionResult::Failure { error, error_code } => {
            task.attempts += 1;
            task.error = Some(error);
            task.error_code = Some(error_code);
            task.updated_at = now;
            if task.attempts < task.max_attempts {
                task.status = TaskStatus::Queued;
                task.started_at = None;
                task.instance_id = None;
                metrics::log_worker_outcome("requeued");
            } else {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(now);
                tracing::warn!(
                    "Task {} failed terminally after {} attempts: {}",
                    task.id,
                    task.attempts,
                    error_code.as_str(),
                );
                metrics::log_worker_outcome("failed");
            }
            persist_task(inner, &task).await;
        },
    }
    drop(timer);
}

async fn persist_task<RT: Runtime>(inner: &Arc<ExecutorInner<RT>>, task: &ParserTask) {
    if let Err(e) = inner.tasks.update(task).await {
        let mut e = e.context("Failed to persist task transition");
        report_error(&mut e);
    }
}
