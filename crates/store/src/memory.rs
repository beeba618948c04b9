//! In-memory store used by tests and local development. A single mutex
//! around the whole state makes every operation, including the queue claim,
//! atomic.

use std::{
    cmp::Reverse,
    collections::BTreeMap,
    sync::Arc,
};

use async_trait::async_trait;
use common::runtime::UnixTimestamp;
use parking_lot::Mutex;

use crate::{
    accounts::{
        Account,
        AccountId,
    },
    results::NormalizedResult,
    slots::{
        Slot,
        SlotId,
        SlotWriteBack,
    },
    tasks::{
        ParserTask,
        TaskId,
        TaskStatus,
    },
    traits::{
        AccountStore,
        ResultSink,
        SlotStore,
        TaskStore,
    },
};

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    slots: BTreeMap<SlotId, Slot>,
    accounts: BTreeMap<AccountId, Account>,
    tasks: BTreeMap<TaskId, ParserTask>,
    results: BTreeMap<TaskId, NormalizedResult>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_slot(&self, slot: Slot) {
        self.inner.lock().slots.insert(slot.id.clone(), slot);
    }

    pub fn put_account(&self, account: Account) {
        self.inner
            .lock()
            .accounts
            .insert(account.id.clone(), account);
    }

    pub fn slot(&self, id: &SlotId) -> Option<Slot> {
        self.inner.lock().slots.get(id).cloned()
    }

    pub fn task(&self, id: &TaskId) -> Option<ParserTask> {
        self.inner.lock().tasks.get(id).cloned()
    }

    pub fn persisted_result(&self, id: &TaskId) -> Option<NormalizedResult> {
        self.inner.lock().results.get(id).cloned()
    }
}

#[async_trait]
impl SlotStore for MemoryStore {
    async fn load_enabled_slots(&self) -> anyhow::Result<Vec<Slot>> {
        Ok(self
            .inner
            .lock()
            .slots
            .values()
            .filter(|slot| slot.enabled)
            .cloned()
            .collect())
    }

    async fn write_back(&self, update: &SlotWriteBack) -> anyhow::Result<()> {
        if let Some(slot) = self.inner.lock().slots.get_mut(&update.id) {
            slot.apply_write_back(update);
        }
        Ok(())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn load_active_accounts(&self) -> anyhow::Result<Vec<Account>> {
        Ok(self
            .inner
            .lock()
            .accounts
            .values()
            .filter(|account| account.is_active())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert(&self, task: ParserTask) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        anyhow::ensure!(
            !inner.tasks.contains_key(&task.id),
            "task {} already enqueued",
            task.id
        );
        inner.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> anyhow::Result<Option<ParserTask>> {
        Ok(self.inner.lock().tasks.get(id).cloned())
    }

    async fn claim_next_queued(&self, now: UnixTimestamp) -> anyhow::Result<Option<ParserTask>> {
        let mut inner = self.inner.lock();
        let candidate = inner
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Queued)
            .min_by_key(|task| (Reverse(task.priority), task.created_at, task.id.clone()))
            .map(|task| task.id.clone());
        let Some(id) = candidate else {
            return Ok(None);
        };
        let task = inner.tasks.get_mut(&id).expect("candidate disappeared");
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn update(&self, task: &ParserTask) -> anyhow::Result<()> {
        self.inner
            .lock()
            .tasks
            .insert(task.id.clone(), task.clone());
        Ok(())
    }
}

#[async_trait]
impl ResultSink for MemoryStore {
    async fn persist(&self, task: &ParserTask, result: &NormalizedResult) -> anyhow::Result<()> {
        self.inner
            .lock()
            .results
            .insert(task.id.clone(), result.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use common::runtime::UnixTimestamp;

    use super::MemoryStore;
    use crate::{
        tasks::{
            ParserTask,
            TaskPayload,
            TaskPriority,
            TaskStatus,
        },
        traits::TaskStore,
    };

    fn task(id: &str, priority: TaskPriority, created_at: UnixTimestamp) -> ParserTask {
        let payload = TaskPayload::Search {
            query: "q".to_string(),
            max_results: 10,
        };
        let mut task = ParserTask::new(
            id.into(),
            &payload,
            "acct-1".into(),
            priority,
            3,
            created_at,
        )
        .unwrap();
        task.created_at = created_at;
        task
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_age() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let t0 = UnixTimestamp::from_millis(1_700_000_000_000);
        let t1 = UnixTimestamp::from_millis(1_700_000_001_000);
        store.insert(task("old-normal", TaskPriority::Normal, t0)).await?;
        store.insert(task("new-normal", TaskPriority::Normal, t1)).await?;
        store.insert(task("new-high", TaskPriority::High, t1)).await?;

        let now = UnixTimestamp::from_millis(1_700_000_002_000);
        let first = store.claim_next_queued(now).await?.unwrap();
        assert_eq!(first.id.as_str(), "new-high");
        assert_eq!(first.status, TaskStatus::Running);
        assert_eq!(first.started_at, Some(now));

        let second = store.claim_next_queued(now).await?.unwrap();
        assert_eq!(second.id.as_str(), "old-normal");
        let third = store.claim_next_queued(now).await?.unwrap();
        assert_eq!(third.id.as_str(), "new-normal");
        assert!(store.claim_next_queued(now).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_claim_skips_running_tasks() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let t0 = UnixTimestamp::from_millis(1_700_000_000_000);
        store.insert(task("only", TaskPriority::Normal, t0)).await?;

        let claimed = store.claim_next_queued(t0).await?.unwrap();
        assert_eq!(claimed.id.as_str(), "only");
        // The same record cannot be leased twice.
        assert!(store.claim_next_queued(t0).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let t0 = UnixTimestamp::from_millis(1_700_000_000_000);
        store.insert(task("dup", TaskPriority::Normal, t0)).await?;
        assert!(store
            .insert(task("dup", TaskPriority::Normal, t0))
            .await
            .is_err());
        Ok(())
    }
}
