//! Rate-limited parser execution core.
//!
//! Accepts parser jobs (search / account-tweets / followers), picks an
//! execution slot from a pool of heterogeneous backends subject to hourly
//! quotas, health and failure cooldowns, dispatches the work and persists
//! the results. Work runs either synchronously ([`Executor::run_sync`]) or
//! through a durable queue drained by a background worker
//! ([`Executor::enqueue`]).

use std::{
    cmp,
    collections::{
        BTreeSet,
        HashMap,
    },
    sync::Arc,
    time::Duration,
};

use common::{
    errors::report_error,
    knobs::{
        DISPATCH_TIMEOUT,
        PROXY_COOLDOWN,
        RATE_LIMIT_COOLDOWN_FLOOR,
        REMOTE_ERROR_COOLDOWN,
        TASK_DEFAULT_MAX_ATTEMPTS,
        TIMEOUT_COOLDOWN_INITIAL,
        TIMEOUT_COOLDOWN_MAX,
        TIMEOUT_DEGRADED_THRESHOLD,
    },
    runtime::{
        shutdown_and_join,
        Runtime,
        SpawnHandle,
        UnixTimestamp,
        WithTimeout,
    },
    time_window::HOUR_WINDOW,
};
use parking_lot::Mutex;
use serde::{
    ser::SerializeMap,
    Serialize,
    Serializer,
};
use store::{
    accounts::AccountId,
    results::{
        ErrorCode,
        ExecutionMeta,
        ExecutionResult,
        NormalizedResult,
    },
    slots::{
        Slot,
        SlotHealth,
        SlotHealthState,
        SlotId,
    },
    tasks::{
        ParserTask,
        TaskId,
        TaskPayload,
        TaskPriority,
        TaskStatus,
    },
    traits::{
        AccountStore,
        ResultSink,
        SlotStore,
        TaskStore,
    },
};

pub mod dispatch;
mod metrics;
pub mod registry;
pub mod selector;
mod worker;

#[cfg(test)]
mod tests;

pub use dispatch::{
    Dispatch,
    DispatchError,
    DispatchRequest,
    HttpDispatcher,
    NoSession,
    SessionSource,
};
pub use registry::{
    SlotRegistry,
    SlotSnapshot,
};
pub use selector::{
    select_slot,
    NoSlotReason,
    SelectOutcome,
};
pub use worker::WorkerState;

/// The persistence collaborators the executor works against.
#[derive(Clone)]
pub struct Stores {
    pub slots: Arc<dyn SlotStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub results: Arc<dyn ResultSink>,
}

impl Stores {
    /// Convenience for stores that implement every trait, like the
    /// in-memory one.
    pub fn from_single<S>(store: Arc<S>) -> Self
    where
        S: SlotStore + AccountStore + TaskStore + ResultSink,
    {
        Self {
            slots: store.clone(),
            accounts: store.clone(),
            tasks: store.clone(),
            results: store,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EnqueueOptions {
    pub priority: TaskPriority,
    pub max_attempts: u32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: TaskPriority::Normal,
            max_attempts: *TASK_DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Serializes as `{ok: true, taskId}` or `{ok: false, error, errorCode?}`.
#[derive(Clone, Debug, PartialEq)]
pub enum EnqueueResult {
    Queued { task_id: TaskId },
    Rejected {
        error: String,
        error_code: Option<ErrorCode>,
    },
}

impl EnqueueResult {
    fn rejected(error_code: ErrorCode, error: impl Into<String>) -> Self {
        Self::Rejected {
            error: error.into(),
            error_code: Some(error_code),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }

    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::Queued { task_id } => Some(task_id),
            Self::Rejected { .. } => None,
        }
    }
}

impl Serialize for EnqueueResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Queued { task_id } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("ok", &true)?;
                map.serialize_entry("taskId", task_id)?;
                map.end()
            },
            Self::Rejected { error, error_code } => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("ok", &false)?;
                map.serialize_entry("error", error)?;
                if let Some(code) = error_code {
                    map.serialize_entry("errorCode", code)?;
                }
                map.end()
            },
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusResponse {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<ParserTask>,
    /// Present only when the task is done.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<NormalizedResult>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityInfo {
    pub total_capacity: u64,
    pub used_this_hour: u64,
    /// Headroom on currently eligible slots.
    pub available_this_hour: u64,
    pub active_instances: usize,
    pub in_cooldown: usize,
    pub rate_limited: usize,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorStatus {
    pub worker: WorkerState,
    pub capacity: CapacityInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_age_ms: Option<u64>,
    pub accounts_count: usize,
    pub instances_count: usize,
    pub runtime: &'static str,
}

#[derive(Clone)]
pub struct Executor<RT: Runtime> {
    inner: Arc<ExecutorInner<RT>>,
}

pub(crate) struct ExecutorInner<RT: Runtime> {
    pub(crate) rt: RT,
    pub(crate) registry: Arc<SlotRegistry<RT>>,
    pub(crate) dispatcher: Arc<dyn Dispatch>,
    pub(crate) tasks: Arc<dyn TaskStore>,
    pub(crate) results: Arc<dyn ResultSink>,
    slot_locks: Mutex<HashMap<SlotId, Arc<tokio::sync::Mutex<()>>>>,
    timeout_streaks: Mutex<HashMap<SlotId, u32>>,
    pub(crate) worker: worker::WorkerHandle,
    sync_loop: Mutex<Option<Box<dyn SpawnHandle>>>,
}

impl<RT: Runtime> Executor<RT> {
    pub fn new(rt: RT, stores: Stores, dispatcher: Arc<dyn Dispatch>) -> Self {
        let registry = Arc::new(SlotRegistry::new(
            rt.clone(),
            stores.slots,
            stores.accounts,
        ));
        Self {
            inner: Arc::new(ExecutorInner {
                rt,
                registry,
                dispatcher,
                tasks: stores.tasks,
                results: stores.results,
                slot_locks: Mutex::new(HashMap::new()),
                timeout_streaks: Mutex::new(HashMap::new()),
                worker: worker::WorkerHandle::new(),
                sync_loop: Mutex::new(None),
            }),
        }
    }

    /// Start the background registry sync loop. Idempotent.
    pub fn start(&self) {
        let mut sync_loop = self.inner.sync_loop.lock();
        if sync_loop.is_some() {
            return;
        }
        let dispatcher = self.inner.dispatcher.clone();
        let handle = self.inner.registry.start_sync_loop(move |snapshot| {
            let live: BTreeSet<SlotId> = snapshot.slots.keys().cloned().collect();
            dispatcher.on_registry_sync(&live);
        });
        *sync_loop = Some(handle);
    }

    /// Drain the worker, then stop the registry sync loop.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.stop_worker().await;
        let handle = self.inner.sync_loop.lock().take();
        if let Some(handle) = handle {
            shutdown_and_join(handle).await?;
        }
        Ok(())
    }

    pub async fn run_search_sync(
        &self,
        query: impl Into<String>,
        max_results: u32,
    ) -> anyhow::Result<ExecutionResult> {
        self.run_sync(TaskPayload::Search {
            query: query.into(),
            max_results,
        })
        .await
    }

    pub async fn run_account_tweets_sync(
        &self,
        username: impl Into<String>,
        max_results: u32,
    ) -> anyhow::Result<ExecutionResult> {
        self.run_sync(TaskPayload::AccountTweets {
            username: username.into(),
            max_results,
        })
        .await
    }

    pub async fn run_account_followers_sync(
        &self,
        username: impl Into<String>,
        max_results: u32,
    ) -> anyhow::Result<ExecutionResult> {
        self.run_sync(TaskPayload::AccountFollowers {
            username: username.into(),
            max_results,
        })
        .await
    }

    pub async fn run_sync(&self, payload: TaskPayload) -> anyhow::Result<ExecutionResult> {
        let task_id = TaskId::from(self.inner.rt.new_uuid_v4().to_string());
        self.inner.run_sync_inner(task_id, None, payload, false).await
    }

    /// Enqueue a task on the durable queue and make sure the worker is
    /// running. Queue-write failures surface as a rejected result, not an
    /// error.
    pub async fn enqueue(
        &self,
        payload: TaskPayload,
        options: EnqueueOptions,
    ) -> anyhow::Result<EnqueueResult> {
        let snapshot = self.inner.registry.ensure_fresh().await;
        let Some(account) = snapshot.accounts.first() else {
            return Ok(EnqueueResult::rejected(
                ErrorCode::NoActiveAccount,
                "no enabled account configured",
            ));
        };
        let now = self.inner.rt.unix_timestamp();
        let task_id = TaskId::from(self.inner.rt.new_uuid_v4().to_string());
        let task = ParserTask::new(
            task_id.clone(),
            &payload,
            account.id.clone(),
            options.priority,
            options.max_attempts,
            now,
        )?;
        if let Err(e) = self.inner.tasks.insert(task).await {
            return Ok(EnqueueResult::Rejected {
                error: format!("{e:#}"),
                error_code: None,
            });
        }
        metrics::log_enqueued();
        self.start_worker();
        self.inner.worker.notify();
        Ok(EnqueueResult::Queued { task_id })
    }

    pub async fn get_task_status(&self, task_id: &TaskId) -> anyhow::Result<TaskStatusResponse> {
        let Some(mut task) = self.inner.tasks.get(task_id).await? else {
            return Ok(TaskStatusResponse {
                found: false,
                task: None,
                result: None,
            });
        };
        let result = if task.status == TaskStatus::Done {
            task.result.clone()
        } else {
            task.result = None;
            None
        };
        Ok(TaskStatusResponse {
            found: true,
            task: Some(task),
            result,
        })
    }

    pub fn start_worker(&self) {
        worker::start(&self.inner);
    }

    /// Stop the worker: no new leases, the in-flight task finishes first.
    pub async fn stop_worker(&self) {
        worker::stop(&self.inner).await;
    }

    pub fn worker_state(&self) -> WorkerState {
        self.inner.worker.state()
    }

    /// Administrative: zero every slot's hourly window and clear cooldowns.
    pub async fn reset_counters(&self) -> anyhow::Result<()> {
        let snapshot = self.inner.registry.ensure_fresh().await;
        let now = self.inner.rt.unix_timestamp();
        for slot in snapshot.slots.values() {
            let mut slot = slot.clone();
            slot.usage.used_in_window = 0;
            slot.usage.window_start_at = now;
            slot.cooldown_until = None;
            self.inner.registry.write_back(&slot.to_write_back(now)).await?;
        }
        self.inner.timeout_streaks.lock().clear();
        tracing::info!("Reset usage counters for {} slots", snapshot.slots.len());
        Ok(())
    }

    pub async fn get_capacity_info(&self) -> CapacityInfo {
        let snapshot = self.inner.registry.ensure_fresh().await;
        let now = self.inner.rt.unix_timestamp();
        capacity_info(&snapshot, now)
    }

    pub async fn get_status(&self) -> ExecutorStatus {
        let snapshot = self.inner.registry.ensure_fresh().await;
        let now = self.inner.rt.unix_timestamp();
        ExecutorStatus {
            worker: self.inner.worker.state(),
            capacity: capacity_info(&snapshot, now),
            last_sync_age_ms: self
                .inner
                .registry
                .last_sync_age()
                .map(|age| age.as_millis() as u64),
            accounts_count: snapshot.accounts.len(),
            instances_count: snapshot.slots.len(),
            runtime: self.inner.dispatcher.runtime_name(),
        }
    }

    /// Probe one slot's runtime and record the outcome on its health state.
    pub async fn check_slot_health(&self, slot_id: &SlotId) -> anyhow::Result<Option<SlotHealth>> {
        let snapshot = self.inner.registry.ensure_fresh().await;
        let Some(slot) = snapshot.slots.get(slot_id) else {
            return Ok(None);
        };
        let mut slot = slot.clone();
        let now = self.inner.rt.unix_timestamp();
        match self.inner.dispatcher.health_check(&slot).await {
            Ok(()) => {
                slot.health = SlotHealthState {
                    status: SlotHealth::Ok,
                    last_check_at: Some(now),
                    last_error: None,
                };
            },
            Err(e) => {
                slot.health = SlotHealthState {
                    status: SlotHealth::Error,
                    last_check_at: Some(now),
                    last_error: Some(e.message),
                };
            },
        }
        let status = slot.health.status;
        self.inner.registry.write_back(&slot.to_write_back(now)).await?;
        Ok(Some(status))
    }
}

impl<RT: Runtime> ExecutorInner<RT> {
    /// The sync execution path. `account_id` is resolved to the first active
    /// account when absent; `stamp_task` records the selected slot on the
    /// task record (queue path only).
    pub(crate) async fn run_sync_inner(
        &self,
        task_id: TaskId,
        account_id: Option<AccountId>,
        payload: TaskPayload,
        stamp_task: bool,
    ) -> anyhow::Result<ExecutionResult> {
        let snapshot = self.registry.ensure_fresh().await;
        let Some(first_account) = snapshot.accounts.first() else {
            return Ok(ExecutionResult::failure(
                ErrorCode::NoActiveAccount,
                "no enabled account configured",
            ));
        };
        let account_id = account_id.unwrap_or_else(|| first_account.id.clone());

        let now = self.rt.unix_timestamp();
        let outcome = select_slot(&snapshot, now);
        for slot_id in &outcome.resets {
            self.registry.apply_reset(slot_id, now);
        }
        let slot_id = match outcome.choice {
            Ok(slot_id) => slot_id,
            Err(reason) => {
                let error_code = reason.error_code();
                metrics::log_no_slot(error_code);
                tracing::warn!("Dispatch rejected: {reason}");
                return Ok(ExecutionResult::failure(error_code, reason.to_string()));
            },
        };

        // Serialize dispatches per slot: the lock is taken after selection
        // and held through the write-back, so counter updates cannot race.
        let slot_lock = self.slot_lock(&slot_id);
        let _guard = slot_lock.lock().await;

        let Some(slot) = self.registry.snapshot().slots.get(&slot_id).cloned() else {
            // The slot left the registry while we waited on its lock.
            return Ok(ExecutionResult::failure(
                ErrorCode::NoAvailableSlot,
                format!("slot {slot_id} disappeared during dispatch"),
            ));
        };

        if stamp_task {
            self.stamp_instance(&task_id, &slot_id).await;
        }

        let request = DispatchRequest {
            task_id: task_id.clone(),
            payload,
        };
        let started = self.rt.monotonic_now();
        let timer = metrics::dispatch_timer();
        // The runtime bounds the whole dispatch, on top of the transport's
        // own request timeout.
        let dispatch_result = match self
            .rt
            .with_timeout("dispatch", *DISPATCH_TIMEOUT, async {
                Ok(self.dispatcher.dispatch(&slot, &request).await)
            })
            .await
        {
            Ok(result) => result,
            Err(_) => Err(DispatchError::new(
                ErrorCode::RemoteTimeout,
                "dispatch exceeded the request deadline",
            )),
        };
        drop(timer);
        let duration_ms = (self.rt.monotonic_now() - started).as_millis() as u64;

        let now = self.rt.unix_timestamp();
        let mut slot = slot;
        // Both branches persist post-reset usage.
        slot.usage = slot.effective_usage(now);
        let result = match dispatch_result {
            Ok(data) => {
                slot.usage.used_in_window += 1;
                slot.health = SlotHealthState {
                    status: SlotHealth::Ok,
                    last_check_at: Some(now),
                    last_error: None,
                };
                self.timeout_streaks.lock().remove(&slot_id);
                metrics::log_dispatch(None);
                ExecutionResult::Success {
                    data,
                    meta: ExecutionMeta {
                        account_id,
                        instance_id: slot_id.clone(),
                        task_id,
                        duration_ms,
                    },
                }
            },
            Err(e) => {
                tracing::warn!("Dispatch via {slot_id} failed with {}: {e}", e.code.as_str());
                self.apply_failure(&mut slot, &e, now);
                metrics::log_dispatch(Some(e.code));
                ExecutionResult::Failure {
                    error: e.message,
                    error_code: e.code,
                }
            },
        };
        self.registry.write_back(&slot.to_write_back(now)).await?;
        Ok(result)
    }

    /// Advance `cooldownUntil` according to the failure's error code.
    fn apply_failure(&self, slot: &mut Slot, error: &DispatchError, now: UnixTimestamp) {
        slot.health.last_check_at = Some(now);
        slot.health.last_error = Some(error.message.clone());
        let cooldown = match error.code {
            ErrorCode::SlotRateLimited => {
                let window_ends = slot.usage.window_start_at + HOUR_WINDOW;
                let remaining = window_ends.saturating_sub(now);
                Some(cmp::max(remaining, *RATE_LIMIT_COOLDOWN_FLOOR))
            },
            ErrorCode::RemoteTimeout => {
                let streak = {
                    let mut streaks = self.timeout_streaks.lock();
                    let streak = streaks.entry(slot.id.clone()).or_insert(0);
                    *streak += 1;
                    *streak
                };
                if streak >= *TIMEOUT_DEGRADED_THRESHOLD {
                    slot.health.status = SlotHealth::Degraded;
                }
                let doublings = 2u32.checked_pow(streak - 1).unwrap_or(u32::MAX);
                let cooldown = TIMEOUT_COOLDOWN_INITIAL
                    .checked_mul(doublings)
                    .unwrap_or(*TIMEOUT_COOLDOWN_MAX);
                Some(cmp::min(cooldown, *TIMEOUT_COOLDOWN_MAX))
            },
            ErrorCode::RemoteError => Some(*REMOTE_ERROR_COOLDOWN),
            ErrorCode::ProxyNotImplemented => {
                slot.health.status = SlotHealth::Degraded;
                Some(*PROXY_COOLDOWN)
            },
            _ => None,
        };
        if let Some(cooldown) = cooldown {
            slot.cooldown_until = Some(now + cooldown);
            metrics::log_cooldown(error.code);
        }
    }

    async fn stamp_instance(&self, task_id: &TaskId, slot_id: &SlotId) {
        let stamped: anyhow::Result<()> = async {
            if let Some(mut task) = self.tasks.get(task_id).await? {
                task.instance_id = Some(slot_id.clone());
                task.updated_at = self.rt.unix_timestamp();
                self.tasks.update(&task).await?;
            }
            Ok(())
        }
        .await;
        if let Err(e) = stamped {
            let mut e = e.context("Failed to stamp instance id on task");
            report_error(&mut e);
        }
    }

    fn slot_lock(&self, slot_id: &SlotId) -> Arc<tokio::sync::Mutex<()>> {
        self.slot_locks
            .lock()
            .entry(slot_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn capacity_info(snapshot: &SlotSnapshot, now: UnixTimestamp) -> CapacityInfo {
    let mut info = CapacityInfo {
        total_capacity: 0,
        used_this_hour: 0,
        available_this_hour: 0,
        active_instances: 0,
        in_cooldown: 0,
        rate_limited: 0,
    };
    for slot in snapshot.slots.values() {
        let usage = slot.effective_usage(now);
        info.total_capacity += slot.limit_per_hour as u64;
        info.used_this_hour += usage.used_in_window as u64;
        if slot.enabled {
            info.active_instances += 1;
        }
        if slot.in_cooldown(now) {
            info.in_cooldown += 1;
        }
        if usage.used_in_window >= slot.limit_per_hour {
            info.rate_limited += 1;
        }
        if slot.is_eligible(now) {
            info.available_this_hour +=
                (slot.limit_per_hour - usage.used_in_window) as u64;
        }
    }
    info
}
