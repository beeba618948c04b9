//! Slot selection policy. Pure with respect to the snapshot it receives:
//! hourly resets it discovers are returned to the caller for application,
//! never applied here.

use std::{
    cmp::Reverse,
    fmt,
};

use common::runtime::UnixTimestamp;
use store::{
    results::ErrorCode,
    slots::{
        SlotHealth,
        SlotId,
    },
};

use crate::registry::SlotSnapshot;

/// Why no slot was eligible. Each slot is counted in the first bucket that
/// disqualifies it, checked in the order cooldown, quota, health.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoSlotReason {
    pub total: usize,
    pub enabled: usize,
    pub rate_limited: usize,
    pub in_cooldown: usize,
    pub errored_health: usize,
}

impl NoSlotReason {
    /// When every enabled slot is blocked purely by quota, the condition is
    /// a rate limit rather than a configuration problem.
    pub fn error_code(&self) -> ErrorCode {
        if self.rate_limited > 0 && self.rate_limited == self.enabled {
            ErrorCode::SlotRateLimited
        } else {
            ErrorCode::NoAvailableSlot
        }
    }
}

impl fmt::Display for NoSlotReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no eligible slot (total={}, enabled={}, rateLimited={}, inCooldown={}, \
             erroredHealth={})",
            self.total, self.enabled, self.rate_limited, self.in_cooldown, self.errored_health
        )
    }
}

#[derive(Clone, Debug)]
pub struct SelectOutcome {
    /// Slots whose hourly window rolled; the caller applies these resets
    /// before acting on `choice`.
    pub resets: Vec<SlotId>,
    pub choice: Result<SlotId, NoSlotReason>,
}

/// Pick one eligible slot or explain why none qualifies.
///
/// Among eligible slots the one with the largest remaining quota wins; ties
/// fall to the lowest `usedInWindow`, then `ok` health over `degraded`, then
/// lexicographic id so the result is deterministic.
pub fn select_slot(snapshot: &SlotSnapshot, now: UnixTimestamp) -> SelectOutcome {
    let resets: Vec<SlotId> = snapshot
        .slots
        .values()
        .filter(|slot| slot.window_rolled(now))
        .map(|slot| slot.id.clone())
        .collect();

    let mut reason = NoSlotReason {
        total: snapshot.slots.len(),
        enabled: 0,
        rate_limited: 0,
        in_cooldown: 0,
        errored_health: 0,
    };
    let mut best: Option<(Reverse<u32>, u32, u8, &SlotId)> = None;
    for slot in snapshot.slots.values() {
        if !slot.enabled {
            continue;
        }
        reason.enabled += 1;
        if slot.in_cooldown(now) {
            reason.in_cooldown += 1;
            continue;
        }
        // Eligibility is judged against post-reset usage.
        let usage = slot.effective_usage(now);
        if usage.used_in_window >= slot.limit_per_hour {
            reason.rate_limited += 1;
            continue;
        }
        if slot.health.status == SlotHealth::Error {
            reason.errored_health += 1;
            continue;
        }
        let health_rank = match slot.health.status {
            SlotHealth::Degraded => 1u8,
            _ => 0,
        };
        let key = (
            Reverse(slot.limit_per_hour - usage.used_in_window),
            usage.used_in_window,
            health_rank,
            &slot.id,
        );
        if best.as_ref().map(|b| key < *b).unwrap_or(true) {
            best = Some(key);
        }
    }

    let choice = match best {
        Some((.., id)) => Ok(id.clone()),
        None => Err(reason),
    };
    SelectOutcome { resets, choice }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::{
        runtime::UnixTimestamp,
        time_window::HOUR_WINDOW,
    };
    use store::{
        results::ErrorCode,
        slots::{
            Slot,
            SlotHealth,
            SlotHealthState,
            SlotKind,
            SlotUsage,
        },
    };

    use super::select_slot;
    use crate::registry::SlotSnapshot;

    fn now() -> UnixTimestamp {
        UnixTimestamp::from_millis(1_700_000_000_000)
    }

    fn slot(id: &str, limit: u32, used: u32) -> Slot {
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
                window_start_at: now(),
            },
            cooldown_until: None,
            health: SlotHealthState {
                status: SlotHealth::Ok,
                last_check_at: None,
                last_error: None,
            },
            updated_at: now(),
        }
    }

    fn snapshot(slots: Vec<Slot>) -> SlotSnapshot {
        SlotSnapshot {
            slots: slots.into_iter().map(|s| (s.id.clone(), s)).collect(),
            accounts: vec![],
        }
    }

    #[test]
    fn test_prefers_largest_remaining_quota() {
        let snapshot = snapshot(vec![slot("a", 10, 10), slot("b", 10, 2)]);
        let outcome = select_slot(&snapshot, now());
        assert_eq!(outcome.choice.unwrap().as_str(), "b");
    }

    #[test]
    fn test_tie_broken_by_used_then_id() {
        // Same remaining quota; lower usedInWindow wins.
        let snapshot1 = snapshot(vec![slot("a", 12, 4), slot("b", 10, 2)]);
        let outcome = select_slot(&snapshot1, now());
        assert_eq!(outcome.choice.unwrap().as_str(), "b");

        // Fully identical stats; lexicographic id decides.
        let snapshot2 = snapshot(vec![slot("b", 10, 2), slot("a", 10, 2)]);
        let outcome = select_slot(&snapshot2, now());
        assert_eq!(outcome.choice.unwrap().as_str(), "a");
    }

    #[test]
    fn test_deterministic_for_same_snapshot() {
        let snapshot = snapshot(vec![slot("a", 10, 3), slot("b", 10, 3), slot("c", 10, 3)]);
        let first = select_slot(&snapshot, now()).choice.unwrap();
        let second = select_slot(&snapshot, now()).choice.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_hourly_reset_applies_before_filter() {
        let mut stale = slot("a", 5, 5);
        stale.usage.window_start_at = now() - (HOUR_WINDOW + Duration::from_secs(60));
        let snapshot = snapshot(vec![stale]);
        let outcome = select_slot(&snapshot, now());
        assert_eq!(outcome.resets, vec!["a".into()]);
        assert_eq!(outcome.choice.unwrap().as_str(), "a");
    }

    #[test]
    fn test_cooldown_honored() {
        let mut cooling = slot("a", 10, 0);
        cooling.cooldown_until = Some(now() + Duration::from_secs(1));
        let snapshot = snapshot(vec![cooling, slot("b", 10, 9)]);
        let outcome = select_slot(&snapshot, now());
        assert_eq!(outcome.choice.unwrap().as_str(), "b");
    }

    #[test]
    fn test_ok_health_preferred_over_degraded_at_equal_rank() {
        let mut degraded = slot("a", 10, 2);
        degraded.health.status = SlotHealth::Degraded;
        let snapshot = snapshot(vec![degraded, slot("b", 10, 2)]);
        let outcome = select_slot(&snapshot, now());
        assert_eq!(outcome.choice.unwrap().as_str(), "b");
    }

    #[test]
    fn test_no_slot_reason_counts() {
        let mut disabled = slot("a", 10, 0);
        disabled.enabled = false;
        let mut cooling = slot("b", 10, 0);
        cooling.cooldown_until = Some(now() + Duration::from_secs(60));
        let saturated = slot("c", 10, 10);
        let mut errored = slot("d", 10, 0);
        errored.health.status = SlotHealth::Error;

        let snapshot = snapshot(vec![disabled, cooling, saturated, errored]);
        let reason = select_slot(&snapshot, now()).choice.unwrap_err();
        assert_eq!(reason.total, 4);
        assert_eq!(reason.enabled, 3);
        assert_eq!(reason.in_cooldown, 1);
        assert_eq!(reason.rate_limited, 1);
        assert_eq!(reason.errored_health, 1);
        assert_eq!(reason.error_code(), ErrorCode::NoAvailableSlot);
    }

    #[test]
    fn test_all_over_quota_reads_as_rate_limited() {
        let snapshot = snapshot(vec![slot("a", 5, 5), slot("b", 2, 2)]);
        let reason = select_slot(&snapshot, now()).choice.unwrap_err();
        assert_eq!(reason.error_code(), ErrorCode::SlotRateLimited);
    }
}
