//! Persistence seams between the execution core and the document store.
//! Any store providing upserts, indexed queries and atomic state
//! transitions can implement these; the in-memory implementation lives in
//! [`crate::memory`].

use async_trait::async_trait;
use common::runtime::UnixTimestamp;

use crate::{
    accounts::Account,
    results::NormalizedResult,
    slots::{
        Slot,
        SlotWriteBack,
    },
    tasks::{
        ParserTask,
        TaskId,
    },
};

#[async_trait]
pub trait SlotStore: Send + Sync + 'static {
    /// All slots with `enabled = true`.
    async fn load_enabled_slots(&self) -> anyhow::Result<Vec<Slot>>;

    /// Persist the four mutable fields for one slot in a single update.
    async fn write_back(&self, update: &SlotWriteBack) -> anyhow::Result<()>;
}

#[async_trait]
pub trait AccountStore: Send + Sync + 'static {
    async fn load_active_accounts(&self) -> anyhow::Result<Vec<Account>>;
}

#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    async fn insert(&self, task: ParserTask) -> anyhow::Result<()>;

    async fn get(&self, id: &TaskId) -> anyhow::Result<Option<ParserTask>>;

    /// Atomically claim the best queued task: highest priority first, oldest
    /// `createdAt` first. The claimed record transitions `queued → running`
    /// with `startedAt` stamped. Returns None when nothing is queued. At
    /// most one caller can hold a given task in `running`.
    async fn claim_next_queued(&self, now: UnixTimestamp) -> anyhow::Result<Option<ParserTask>>;

    /// Replace the full task record by id.
    async fn update(&self, task: &ParserTask) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ResultSink: Send + Sync + 'static {
    /// Upsert fetched artifacts into the product collections by natural key.
    async fn persist(&self, task: &ParserTask, result: &NormalizedResult) -> anyhow::Result<()>;
}
