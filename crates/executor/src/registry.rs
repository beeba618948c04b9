//! In-memory mirror of the persisted slot and account collections.
//!
//! A background loop refreshes the mirror on a fixed cadence so changes made
//! by administrators through the route layer are picked up; between syncs
//! the in-memory copy is authoritative for counter accounting. Readers get
//! an immutable snapshot behind an `Arc` that is swapped wholesale, never
//! mutated in place.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};

use common::{
    backoff::Backoff,
    errors::report_error,
    knobs::{
        SLOT_REGISTRY_STALE_AFTER,
        SLOT_REGISTRY_SYNC_INTERVAL,
    },
    runtime::{
        Runtime,
        SpawnHandle,
        UnixTimestamp,
    },
};
use parking_lot::Mutex;
use store::{
    accounts::Account,
    slots::{
        Slot,
        SlotId,
        SlotWriteBack,
    },
    traits::{
        AccountStore,
        SlotStore,
    },
};

use crate::metrics;

const SYNC_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const SYNC_MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Default)]
pub struct SlotSnapshot {
    pub slots: BTreeMap<SlotId, Slot>,
    pub accounts: Vec<Account>,
}

pub struct SlotRegistry<RT: Runtime> {
    rt: RT,
    slots: Arc<dyn SlotStore>,
    accounts: Arc<dyn AccountStore>,
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    snapshot: Arc<SlotSnapshot>,
    last_sync: Option<tokio::time::Instant>,
}

impl<RT: Runtime> SlotRegistry<RT> {
    pub fn new(rt: RT, slots: Arc<dyn SlotStore>, accounts: Arc<dyn AccountStore>) -> Self {
        Self {
            rt,
            slots,
            accounts,
            inner: Mutex::new(RegistryInner {
                snapshot: Arc::new(SlotSnapshot::default()),
                last_sync: None,
            }),
        }
    }

    pub fn snapshot(&self) -> Arc<SlotSnapshot> {
        self.inner.lock().snapshot.clone()
    }

    pub fn last_sync_age(&self) -> Option<Duration> {
        let last_sync = self.inner.lock().last_sync?;
        Some(self.rt.monotonic_now() - last_sync)
    }

    /// Reload the mirror from the store and publish a new snapshot. On
    /// failure the current snapshot is left untouched.
    pub async fn sync(&self) -> anyhow::Result<Arc<SlotSnapshot>> {
        let loaded: anyhow::Result<_> = async {
            let slots = self.slots.load_enabled_slots().await?;
            let accounts = self.accounts.load_active_accounts().await?;
            Ok((slots, accounts))
        }
        .await;
        let (slots, accounts) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                metrics::log_registry_sync(false);
                return Err(e);
            },
        };
        let snapshot = Arc::new(SlotSnapshot {
            slots: slots.into_iter().map(|slot| (slot.id.clone(), slot)).collect(),
            accounts,
        });
        metrics::log_registry_sync(true);
        metrics::log_registry_size(snapshot.slots.len(), snapshot.accounts.len());
        let mut inner = self.inner.lock();
        inner.snapshot = snapshot.clone();
        inner.last_sync = Some(self.rt.monotonic_now());
        Ok(snapshot)
    }

    /// Snapshot for an operation that is about to dispatch: forces a resync
    /// when the mirror is older than the staleness bound (or was never
    /// synced). A failed resync falls back to the last good snapshot.
    pub async fn ensure_fresh(&self) -> Arc<SlotSnapshot> {
        let stale = match self.last_sync_age() {
            None => true,
            Some(age) => age >= *SLOT_REGISTRY_STALE_AFTER,
        };
        if stale {
            if let Err(e) = self.sync().await {
                let mut e = e.context("Slot registry resync failed");
                report_error(&mut e);
            }
        }
        self.snapshot()
    }

    /// Persist a dispatch's slot mutations and apply them to the mirror.
    pub async fn write_back(&self, update: &SlotWriteBack) -> anyhow::Result<()> {
        self.slots.write_back(update).await?;
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.snapshot.slots.get(&update.id) {
            let mut snapshot = (*inner.snapshot).clone();
            let mut slot = slot.clone();
            slot.apply_write_back(update);
            snapshot.slots.insert(update.id.clone(), slot);
            inner.snapshot = Arc::new(snapshot);
        }
        Ok(())
    }

    /// Apply an hourly reset returned by the selector to the mirror. The
    /// persisted copy catches up with the next write-back for the slot.
    pub fn apply_reset(&self, id: &SlotId, now: UnixTimestamp) {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.snapshot.slots.get(id) else {
            return;
        };
        let mut snapshot = (*inner.snapshot).clone();
        let mut slot = slot.clone();
        slot.usage.used_in_window = 0;
        slot.usage.window_start_at = now;
        snapshot.slots.insert(id.clone(), slot);
        inner.snapshot = Arc::new(snapshot);
    }

    /// Background loop refreshing the mirror on `SLOT_REGISTRY_SYNC_INTERVAL`.
    pub fn start_sync_loop(self: &Arc<Self>, on_sync: impl Fn(&SlotSnapshot) + Send + 'static) -> Box<dyn SpawnHandle> {
        let registry = self.clone();
        let rt = self.rt.clone();
        self.rt.spawn("slot_registry_sync", async move {
            tracing::info!("Starting slot registry sync loop");
            let mut backoff = Backoff::new(SYNC_INITIAL_BACKOFF, SYNC_MAX_BACKOFF);
            loop {
                match registry.sync().await {
                    Ok(snapshot) => {
                        backoff.reset();
                        on_sync(&snapshot);
                        rt.wait(*SLOT_REGISTRY_SYNC_INTERVAL).await;
                    },
                    Err(e) => {
                        let mut e = e.context("Slot registry sync failed");
                        report_error(&mut e);
                        let delay = backoff.fail(&mut rt.rng());
                        rt.wait(delay).await;
                    },
                }
            }
        })
    }
}
