//! Tunable limits and parameters for the backend.
//!
//! Every knob here has a comment explaining what it is for so an oncall
//! engineer can adjust it safely. When running locally, each knob can be
//! overridden with the environment variable of the same name.

use std::{
    sync::LazyLock,
    time::Duration,
};

use crate::env::env_config;

/// Set a consistent thread stack size regardless of environment. This is
/// 2x Rust's default: https://doc.rust-lang.org/nightly/std/thread/index.html#stack-size
pub static RUNTIME_STACK_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("RUNTIME_STACK_SIZE", 4 * 1024 * 1024));

/// 0 -> default (number of cores)
pub static RUNTIME_WORKER_THREADS: LazyLock<usize> =
    LazyLock::new(|| env_config("RUNTIME_WORKER_THREADS", 0));

/// How often the slot registry refreshes its in-memory mirror from the
/// persistent store.
pub static SLOT_REGISTRY_SYNC_INTERVAL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("SLOT_REGISTRY_SYNC_INTERVAL_SECS", 10)));

/// If the last registry sync is older than this when a dispatch is about to
/// use it, a forced resync runs first.
pub static SLOT_REGISTRY_STALE_AFTER: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("SLOT_REGISTRY_STALE_AFTER_SECS", 30)));

/// Hard deadline for a single dispatch against a slot, covering the full
/// HTTP round trip.
pub static DISPATCH_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("DISPATCH_TIMEOUT_SECS", 30)));

/// Fallback poll interval for the queue worker when it is blocked on an
/// empty queue. The enqueue signal normally wakes it sooner.
pub static QUEUE_WORKER_POLL_INTERVAL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("QUEUE_WORKER_POLL_INTERVAL_MS", 2000)));

/// Default retry budget for tasks enqueued without an explicit maxAttempts.
pub static TASK_DEFAULT_MAX_ATTEMPTS: LazyLock<u32> =
    LazyLock::new(|| env_config("TASK_DEFAULT_MAX_ATTEMPTS", 3));

/// Minimum cooldown applied to a slot after the upstream rejects with 429,
/// even when less of its hourly window remains.
pub static RATE_LIMIT_COOLDOWN_FLOOR: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("RATE_LIMIT_COOLDOWN_FLOOR_SECS", 300)));

/// Cooldown after the first timeout on a slot. Doubles on each consecutive
/// timeout up to `TIMEOUT_COOLDOWN_MAX`.
pub static TIMEOUT_COOLDOWN_INITIAL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("TIMEOUT_COOLDOWN_INITIAL_SECS", 60)));

/// Upper bound for the escalating timeout cooldown.
pub static TIMEOUT_COOLDOWN_MAX: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("TIMEOUT_COOLDOWN_MAX_SECS", 900)));

/// Consecutive timeouts on one slot before its health is marked degraded.
pub static TIMEOUT_DEGRADED_THRESHOLD: LazyLock<u32> =
    LazyLock::new(|| env_config("TIMEOUT_DEGRADED_THRESHOLD", 3));

/// Cooldown after a transport or protocol error from a slot's runtime.
pub static REMOTE_ERROR_COOLDOWN: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("REMOTE_ERROR_COOLDOWN_SECS", 30)));

/// Cooldown after a proxy slot fails to reach its local parser target. The
/// slot is also marked degraded.
pub static PROXY_COOLDOWN: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("PROXY_COOLDOWN_SECS", 300)));

/// Base URL of the local parser runtime used by `local_parser` slots and as
/// the target behind `proxy` slots.
pub static LOCAL_PARSER_BASE_URL: LazyLock<String> = LazyLock::new(|| {
    env_config(
        "LOCAL_PARSER_BASE_URL",
        "http://localhost:5001".to_string(),
    )
});
