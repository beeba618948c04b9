use std::{
    collections::VecDeque,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use common::{
    runtime::{
        testing::TestRuntime,
        Runtime,
        UnixTimestamp,
    },
    time_window::HOUR_WINDOW,
};
use parking_lot::Mutex;
use serde_json::json;
use store::{
    accounts::{
        Account,
        AccountId,
        AccountStatus,
    },
    memory::MemoryStore,
    results::{
        ErrorCode,
        ExecutionResult,
        NormalizedResult,
    },
    slots::{
        Slot,
        SlotHealth,
        SlotHealthState,
        SlotKind,
        SlotUsage,
        SlotWriteBack,
    },
    tasks::{
        TaskPayload,
        TaskStatus,
    },
    traits::{
        AccountStore,
        SlotStore,
        TaskStore,
    },
};

use crate::{
    dispatch::{
        Dispatch,
        DispatchError,
        DispatchRequest,
    },
    registry::SlotRegistry,
    EnqueueOptions,
    Executor,
    Stores,
    WorkerState,
};

struct ScriptedDispatch {
    script: Mutex<VecDeque<Result<NormalizedResult, DispatchError>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedDispatch {
    /// Succeeds forever.
    fn always_ok() -> Arc<Self> {
        Self::with_script(vec![])
    }

    /// Plays back `script`, then succeeds.
    fn with_script(script: Vec<Result<NormalizedResult, DispatchError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(vec![]),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Dispatch for ScriptedDispatch {
    async fn dispatch(
        &self,
        slot: &Slot,
        _request: &DispatchRequest,
    ) -> Result<NormalizedResult, DispatchError> {
        self.calls.lock().push(slot.id.to_string());
        match self.script.lock().pop_front() {
            Some(result) => result,
            None => Ok(ok_result()),
        }
    }
}

fn ok_result() -> NormalizedResult {
    NormalizedResult::from_engine_response(
        json!({
            "engineSummary": {
                "fetchedPosts": 3,
                "finalRisk": 0.1,
                "durationMs": 20,
                "aborted": false,
            },
        }),
        Duration::from_millis(20),
    )
}

fn timeout_error() -> DispatchError {
    DispatchError::new(ErrorCode::RemoteTimeout, "dispatch exceeded the request deadline")
}

fn remote_error() -> DispatchError {
    DispatchError::new(ErrorCode::RemoteError, "transport error: connection reset")
}

fn slot(id: &str, limit: u32, used: u32, window_start: UnixTimestamp) -> Slot {
    Slot {
        id: id.into(),
        label: id.to_string(),
        kind: SlotKind::RemoteWorker,
        base_url: Some(format!("http://{id}.internal:8080")),
        proxy_url: None,
        enabled: true,
        account_id: Some("acct-1".into()),
        limit_per_hour: limit,
        usage: SlotUsage {
            used_in_window: used,
            window_start_at: window_start,
        },
        cooldown_until: None,
        health: SlotHealthState {
            status: SlotHealth::Ok,
            last_check_at: None,
            last_error: None,
        },
        updated_at: window_start,
    }
}

fn fixture(
    rt: &TestRuntime,
    slots: Vec<Slot>,
    dispatcher: Arc<ScriptedDispatch>,
) -> (Executor<TestRuntime>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    store.put_account(Account {
        id: "acct-1".into(),
        label: "primary".to_string(),
        status: AccountStatus::Active,
    });
    for slot in slots {
        store.put_slot(slot);
    }
    let executor = Executor::new(rt.clone(), Stores::from_single(store.clone()), dispatcher);
    (executor, store)
}

/// Drive the worker until the task reaches a terminal status.
async fn wait_for_terminal(
    executor: &Executor<TestRuntime>,
    task_id: &store::tasks::TaskId,
) -> crate::TaskStatusResponse {
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = executor.get_task_status(task_id).await.unwrap();
        if let Some(task) = &status.task {
            if matches!(task.status, TaskStatus::Done | TaskStatus::Failed) {
                return status;
            }
        }
    }
    panic!("task {task_id} never reached a terminal status");
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_prefers_slot_with_most_remaining_quota() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let now = rt.unix_timestamp();
    let dispatcher = ScriptedDispatch::always_ok();
    let (executor, store) = fixture(
        &rt,
        vec![slot("a", 10, 10, now), slot("b", 10, 2, now)],
        dispatcher.clone(),
    );

    let result = executor.run_search_sync("foo", 25).await?;
    let ExecutionResult::Success { meta, data } = result else {
        panic!("expected success, got {result:?}");
    };
    assert_eq!(meta.instance_id.as_str(), "b");
    assert_eq!(meta.account_id.as_str(), "acct-1");
    assert_eq!(data.fetched, 3);
    assert_eq!(dispatcher.calls(), vec!["b"]);

    let persisted = store.slot(&"b".into()).unwrap();
    assert_eq!(persisted.usage.used_in_window, 3);
    assert_eq!(persisted.health.status, SlotHealth::Ok);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_bucket_rollover_resets_before_dispatch() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let now = rt.unix_timestamp();
    let stale_start = now - (HOUR_WINDOW + Duration::from_secs(60));
    let (executor, store) = fixture(
        &rt,
        vec![slot("a", 5, 5, stale_start)],
        ScriptedDispatch::always_ok(),
    );

    let result = executor.run_search_sync("foo", 10).await?;
    assert!(result.is_ok());

    let persisted = store.slot(&"a".into()).unwrap();
    assert_eq!(persisted.usage.used_in_window, 1);
    assert_eq!(persisted.usage.window_start_at, now);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_429_applies_rate_limit_cooldown() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let now = rt.unix_timestamp();
    let dispatcher = ScriptedDispatch::with_script(vec![Err(DispatchError::new(
        ErrorCode::SlotRateLimited,
        "upstream rejected with 429",
    ))]);
    let (executor, store) = fixture(&rt, vec![slot("a", 10, 0, now)], dispatcher);

    let result = executor.run_search_sync("foo", 10).await?;
    assert_eq!(result.error_code(), Some(ErrorCode::SlotRateLimited));

    let persisted = store.slot(&"a".into()).unwrap();
    let cooldown_until = persisted.cooldown_until.unwrap();
    assert!(cooldown_until >= now + Duration::from_secs(300));
    // Cooldown covers the rest of the hourly window.
    assert_eq!(cooldown_until, now + HOUR_WINDOW);
    // The failed dispatch did not consume quota.
    assert_eq!(persisted.usage.used_in_window, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_timeout_cooldown_escalates_and_resets_on_success() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let start = rt.unix_timestamp();
    let dispatcher = ScriptedDispatch::with_script(vec![
        Err(timeout_error()),
        Err(timeout_error()),
        Err(timeout_error()),
        Ok(ok_result()),
        Err(timeout_error()),
    ]);
    let (executor, store) = fixture(&rt, vec![slot("a", 100, 0, start)], dispatcher);

    for expected_secs in [60u64, 120, 240] {
        let before = rt.unix_timestamp();
        let result = executor.run_search_sync("foo", 10).await?;
        assert_eq!(result.error_code(), Some(ErrorCode::RemoteTimeout));
        let persisted = store.slot(&"a".into()).unwrap();
        assert_eq!(
            persisted.cooldown_until.unwrap(),
            before + Duration::from_secs(expected_secs)
        );
        // Step past the cooldown so the next attempt selects the slot.
        rt.advance(Duration::from_secs(expected_secs + 1)).await;
    }
    // Three consecutive timeouts degrade the slot.
    assert_eq!(
        store.slot(&"a".into()).unwrap().health.status,
        SlotHealth::Degraded
    );

    let result = executor.run_search_sync("foo", 10).await?;
    assert!(result.is_ok());
    assert_eq!(
        store.slot(&"a".into()).unwrap().health.status,
        SlotHealth::Ok
    );

    // The streak cleared: the next timeout is back to the initial cooldown.
    let before = rt.unix_timestamp();
    let result = executor.run_search_sync("foo", 10).await?;
    assert_eq!(result.error_code(), Some(ErrorCode::RemoteTimeout));
    assert_eq!(
        store.slot(&"a".into()).unwrap().cooldown_until.unwrap(),
        before + Duration::from_secs(60)
    );
    Ok(())
}

/// Never resolves; only the executor's deadline can end the dispatch.
struct HangingDispatch;

#[async_trait]
impl Dispatch for HangingDispatch {
    async fn dispatch(
        &self,
        _slot: &Slot,
        _request: &DispatchRequest,
    ) -> Result<NormalizedResult, DispatchError> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_hung_dispatch_hits_runtime_deadline() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let now = rt.unix_timestamp();
    let store = Arc::new(MemoryStore::new());
    store.put_account(Account {
        id: "acct-1".into(),
        label: "primary".to_string(),
        status: AccountStatus::Active,
    });
    store.put_slot(slot("a", 10, 0, now));
    let executor = Executor::new(
        rt.clone(),
        Stores::from_single(store.clone()),
        Arc::new(HangingDispatch),
    );

    let result = executor.run_search_sync("foo", 10).await?;
    assert_eq!(result.error_code(), Some(ErrorCode::RemoteTimeout));
    // The deadline fired on the virtual clock, 30 s after request start.
    assert_eq!(rt.unix_timestamp() - now, Duration::from_secs(30));

    let persisted = store.slot(&"a".into()).unwrap();
    assert_eq!(
        persisted.cooldown_until.unwrap(),
        rt.unix_timestamp() + Duration::from_secs(60)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_no_active_account_rejected() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let now = rt.unix_timestamp();
    let store = Arc::new(MemoryStore::new());
    store.put_slot(slot("a", 10, 0, now));
    let executor = Executor::new(
        rt.clone(),
        Stores::from_single(store),
        ScriptedDispatch::always_ok(),
    );

    let result = executor.run_search_sync("foo", 10).await?;
    assert_eq!(result.error_code(), Some(ErrorCode::NoActiveAccount));

    let enqueued = executor
        .enqueue(
            TaskPayload::Search {
                query: "foo".to_string(),
                max_results: 10,
            },
            EnqueueOptions::default(),
        )
        .await?;
    assert!(!enqueued.is_ok());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_quota_bound_then_rate_limited() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let now = rt.unix_timestamp();
    let (executor, store) = fixture(
        &rt,
        vec![slot("a", 2, 0, now)],
        ScriptedDispatch::always_ok(),
    );

    assert!(executor.run_search_sync("one", 10).await?.is_ok());
    assert!(executor.run_search_sync("two", 10).await?.is_ok());
    let third = executor.run_search_sync("three", 10).await?;
    assert_eq!(third.error_code(), Some(ErrorCode::SlotRateLimited));
    assert_eq!(store.slot(&"a".into()).unwrap().usage.used_in_window, 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_no_lost_increments_under_concurrency() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let now = rt.unix_timestamp();
    let (executor, store) = fixture(
        &rt,
        vec![slot("a", 100, 0, now)],
        ScriptedDispatch::always_ok(),
    );

    let runs = (0..10).map(|i| {
        let executor = executor.clone();
        async move { executor.run_search_sync(format!("q{i}"), 10).await }
    });
    let results = futures::future::join_all(runs).await;
    for result in results {
        assert!(result?.is_ok());
    }
    assert_eq!(store.slot(&"a".into()).unwrap().usage.used_in_window, 10);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_reset_counters_clears_usage_and_cooldowns() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let now = rt.unix_timestamp();
    let dispatcher = ScriptedDispatch::with_script(vec![Ok(ok_result()), Err(remote_error())]);
    let (executor, store) = fixture(
        &rt,
        vec![slot("a", 10, 0, now), slot("b", 10, 9, now)],
        dispatcher,
    );

    assert!(executor.run_search_sync("one", 10).await?.is_ok());
    let failed = executor.run_search_sync("two", 10).await?;
    assert_eq!(failed.error_code(), Some(ErrorCode::RemoteError));

    executor.reset_counters().await?;
    for id in ["a", "b"] {
        let persisted = store.slot(&id.into()).unwrap();
        assert_eq!(persisted.usage.used_in_window, 0);
        assert_eq!(persisted.usage.window_start_at, rt.unix_timestamp());
        assert_eq!(persisted.cooldown_until, None);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_capacity_info_aggregates_snapshot() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let now = rt.unix_timestamp();
    let mut cooling = slot("c", 20, 1, now);
    cooling.cooldown_until = Some(now + Duration::from_secs(600));
    let (executor, _store) = fixture(
        &rt,
        vec![slot("a", 10, 4, now), slot("b", 5, 5, now), cooling],
        ScriptedDispatch::always_ok(),
    );

    let capacity = executor.get_capacity_info().await;
    assert_eq!(capacity.total_capacity, 35);
    assert_eq!(capacity.used_this_hour, 10);
    // Only slot a is eligible: b is over quota, c is cooling down.
    assert_eq!(capacity.available_this_hour, 6);
    assert_eq!(capacity.active_instances, 3);
    assert_eq!(capacity.in_cooldown, 1);
    assert_eq!(capacity.rate_limited, 1);

    let status = executor.get_status().await;
    assert_eq!(status.worker, WorkerState::Stopped);
    assert_eq!(status.accounts_count, 1);
    assert_eq!(status.instances_count, 3);
    assert_eq!(status.runtime, "http");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_queue_success_path_persists_results() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let now = rt.unix_timestamp();
    let (executor, store) = fixture(
        &rt,
        vec![slot("a", 10, 0, now)],
        ScriptedDispatch::always_ok(),
    );

    let enqueued = executor
        .enqueue(
            TaskPayload::Search {
                query: "foo".to_string(),
                max_results: 10,
            },
            EnqueueOptions::default(),
        )
        .await?;
    let task_id = enqueued.task_id().unwrap().clone();

    let status = wait_for_terminal(&executor, &task_id).await;
    let task = status.task.unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.instance_id, Some("a".into()));
    assert!(task.completed_at.is_some());
    assert_eq!(status.result.unwrap().fetched, 3);
    // The collaborator sink received the artifacts.
    assert!(store.persisted_result(&task_id).is_some());

    executor.stop_worker().await;
    assert_eq!(executor.worker_state(), WorkerState::Stopped);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_retry_then_terminal_failure() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let now = rt.unix_timestamp();
    let dispatcher = ScriptedDispatch::with_script(vec![Err(remote_error()), Err(remote_error())]);
    // Two slots so the retry isn't blocked by the first slot's cooldown.
    let (executor, _store) = fixture(
        &rt,
        vec![slot("a", 10, 0, now), slot("b", 10, 0, now)],
        dispatcher,
    );

    let enqueued = executor
        .enqueue(
            TaskPayload::Search {
                query: "x".to_string(),
                max_results: 10,
            },
            EnqueueOptions {
                max_attempts: 2,
                ..Default::default()
            },
        )
        .await?;
    let task_id = enqueued.task_id().unwrap().clone();

    let status = wait_for_terminal(&executor, &task_id).await;
    let task = status.task.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 2);
    assert_eq!(task.error_code, Some(ErrorCode::RemoteError));
    // Results are only returned for done tasks.
    assert!(status.result.is_none());

    executor.stop_worker().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_task_status_lookup() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let (executor, store) = fixture(&rt, vec![], ScriptedDispatch::always_ok());

    let missing = executor.get_task_status(&"nope".into()).await?;
    assert!(!missing.found);

    // A running task does not expose its (stale) result field.
    let payload = TaskPayload::Search {
        query: "q".to_string(),
        max_results: 5,
    };
    let mut task = store::tasks::ParserTask::new(
        "running-task".into(),
        &payload,
        "acct-1".into(),
        Default::default(),
        3,
        rt.unix_timestamp(),
    )?;
    task.status = TaskStatus::Running;
    task.result = Some(ok_result());
    TaskStore::insert(store.as_ref(), task).await?;

    let status = executor.get_task_status(&"running-task".into()).await?;
    assert!(status.found);
    assert!(status.result.is_none());
    assert!(status.task.unwrap().result.is_none());
    Ok(())
}

/// Slot store wrapper that can be switched into a failing mode.
struct FlakySlotStore {
    inner: Arc<MemoryStore>,
    failing: AtomicBool,
}

#[async_trait]
impl SlotStore for FlakySlotStore {
    async fn load_enabled_slots(&self) -> anyhow::Result<Vec<Slot>> {
        anyhow::ensure!(!self.failing.load(Ordering::SeqCst), "store unavailable");
        self.inner.load_enabled_slots().await
    }

    async fn write_back(&self, update: &SlotWriteBack) -> anyhow::Result<()> {
        self.inner.write_back(update).await
    }
}

#[async_trait]
impl AccountStore for FlakySlotStore {
    async fn load_active_accounts(&self) -> anyhow::Result<Vec<Account>> {
        self.inner.load_active_accounts().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_registry_sync_failure_keeps_last_good_snapshot() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let now = rt.unix_timestamp();
    let memory = Arc::new(MemoryStore::new());
    memory.put_slot(slot("a", 10, 0, now));
    memory.put_account(Account {
        id: AccountId::from("acct-1"),
        label: "primary".to_string(),
        status: AccountStatus::Active,
    });
    let flaky = Arc::new(FlakySlotStore {
        inner: memory.clone(),
        failing: AtomicBool::new(false),
    });
    let registry = Arc::new(SlotRegistry::new(rt.clone(), flaky.clone(), flaky.clone()));

    registry.sync().await?;
    assert_eq!(registry.snapshot().slots.len(), 1);

    flaky.failing.store(true, Ordering::SeqCst);
    memory.put_slot(slot("b", 10, 0, now));
    assert!(registry.sync().await.is_err());
    // Operations continue against the last good snapshot.
    assert_eq!(registry.snapshot().slots.len(), 1);

    // A stale mirror forces a resync; when that fails too, the last good
    // snapshot still serves.
    rt.advance(Duration::from_secs(31)).await;
    let snapshot = registry.ensure_fresh().await;
    assert_eq!(snapshot.slots.len(), 1);

    flaky.failing.store(false, Ordering::SeqCst);
    let snapshot = registry.ensure_fresh().await;
    assert_eq!(snapshot.slots.len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_registry_write_back_updates_mirror() -> anyhow::Result<()> {
    let rt = TestRuntime::new();
    let now = rt.unix_timestamp();
    let memory = Arc::new(MemoryStore::new());
    memory.put_slot(slot("a", 10, 2, now));
    let registry = Arc::new(SlotRegistry::new(
        rt.clone(),
        memory.clone(),
        memory.clone(),
    ));
    registry.sync().await?;

    let mut updated = registry.snapshot().slots.get(&"a".into()).unwrap().clone();
    updated.usage.used_in_window = 3;
    registry.write_back(&updated.to_write_back(now)).await?;

    assert_eq!(
        registry
            .snapshot()
            .slots
            .get(&"a".into())
            .unwrap()
            .usage
            .used_in_window,
        3
    );
    assert_eq!(memory.slot(&"a".into()).unwrap().usage.used_in_window, 3);
    Ok(())
}
