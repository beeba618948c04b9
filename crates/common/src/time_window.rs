//! Time-bucket math for quota accounting and aggregation windows.
//!
//! Slots meter their outbound capacity in hourly buckets anchored at a
//! per-slot `windowStartAt`; the bucket rolls on demand the first time it is
//! observed more than an hour old. Aggregation pipelines use fixed windows
//! truncated against the unix epoch.

use std::time::Duration;

use serde::{
    Deserialize,
    Serialize,
};

use crate::runtime::UnixTimestamp;

/// Length of one quota bucket.
pub const HOUR_WINDOW: Duration = Duration::from_secs(3600);

/// True when `window_start` is at least one full bucket behind `now`. A
/// `window_start` in the future never rolls.
pub fn window_rolled(now: UnixTimestamp, window_start: UnixTimestamp) -> bool {
    now.saturating_sub(window_start) >= HOUR_WINDOW
}

/// Fixed aggregation windows used by the snapshot and signal builders.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindow {
    Day,
    Week,
    Month,
}

impl TimeWindow {
    pub const ALL: [TimeWindow; 3] = [TimeWindow::Day, TimeWindow::Week, TimeWindow::Month];

    pub fn len(&self) -> Duration {
        match self {
            TimeWindow::Day => Duration::from_secs(24 * 3600),
            TimeWindow::Week => Duration::from_secs(7 * 24 * 3600),
            TimeWindow::Month => Duration::from_secs(30 * 24 * 3600),
        }
    }

    /// Stable key used in persisted aggregate documents.
    pub fn key(&self) -> &'static str {
        match self {
            TimeWindow::Day => "24h",
            TimeWindow::Week => "7d",
            TimeWindow::Month => "30d",
        }
    }

    /// The most recent window boundary at or before `now`: the unique
    /// instant `s` with `s <= now < s + len` and `s` a multiple of the
    /// window length since the epoch.
    pub fn start_for(&self, now: UnixTimestamp) -> UnixTimestamp {
        let len_ms = self.len().as_millis() as u64;
        let now_ms = now.as_ms();
        UnixTimestamp::from_millis(now_ms - now_ms % len_ms)
    }
}
