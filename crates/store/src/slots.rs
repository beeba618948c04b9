use common::{
    runtime::UnixTimestamp,
    time_window::window_rolled,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    accounts::AccountId,
    id_type,
};

id_type!(SlotId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    RemoteWorker,
    Proxy,
    LocalParser,
    /// Kinds written by newer admin tooling that this build doesn't
    /// recognize. Such slots fail dispatch with `unknown_kind`.
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotHealth {
    Ok,
    Degraded,
    Error,
    Unknown,
}

/// Hourly quota bucket. `used_in_window` counts successful dispatches since
/// `window_start_at`; the bucket resets on demand once it is an hour old.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotUsage {
    pub used_in_window: u32,
    pub window_start_at: UnixTimestamp,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotHealthState {
    pub status: SlotHealth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_at: Option<UnixTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SlotHealthState {
    pub fn unknown() -> Self {
        Self {
            status: SlotHealth::Unknown,
            last_check_at: None,
            last_error: None,
        }
    }
}

/// One outbound execution lane with its own quota, credentials and health.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub id: SlotId,
    pub label: String,
    pub kind: SlotKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<AccountId>,
    pub limit_per_hour: u32,
    pub usage: SlotUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<UnixTimestamp>,
    pub health: SlotHealthState,
    pub updated_at: UnixTimestamp,
}

impl Slot {
    pub fn window_rolled(&self, now: UnixTimestamp) -> bool {
        window_rolled(now, self.usage.window_start_at)
    }

    /// Usage with the hourly reset applied if the bucket has rolled.
    pub fn effective_usage(&self, now: UnixTimestamp) -> SlotUsage {
        if self.window_rolled(now) {
            SlotUsage {
                used_in_window: 0,
                window_start_at: now,
            }
        } else {
            self.usage
        }
    }

    pub fn remaining_quota(&self, now: UnixTimestamp) -> u32 {
        self.limit_per_hour
            .saturating_sub(self.effective_usage(now).used_in_window)
    }

    pub fn in_cooldown(&self, now: UnixTimestamp) -> bool {
        matches!(self.cooldown_until, Some(until) if until > now)
    }

    pub fn over_quota(&self, now: UnixTimestamp) -> bool {
        self.effective_usage(now).used_in_window >= self.limit_per_hour
    }

    pub fn is_eligible(&self, now: UnixTimestamp) -> bool {
        self.enabled
            && !self.in_cooldown(now)
            && !self.over_quota(now)
            && self.health.status != SlotHealth::Error
    }

    pub fn to_write_back(&self, now: UnixTimestamp) -> SlotWriteBack {
        SlotWriteBack {
            id: self.id.clone(),
            usage: self.usage,
            health: self.health.clone(),
            cooldown_until: self.cooldown_until,
            updated_at: now,
        }
    }

    pub fn apply_write_back(&mut self, update: &SlotWriteBack) {
        self.usage = update.usage;
        self.health = update.health.clone();
        self.cooldown_until = update.cooldown_until;
        self.updated_at = update.updated_at;
    }
}

/// The four mutable fields a dispatch can change, batched into one update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotWriteBack {
    pub id: SlotId,
    pub usage: SlotUsage,
    pub health: SlotHealthState,
    pub cooldown_until: Option<UnixTimestamp>,
    pub updated_at: UnixTimestamp,
}
