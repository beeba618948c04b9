use std::time::Duration;

use serde::{
    ser::SerializeMap,
    Deserialize,
    Serialize,
    Serializer,
};
use serde_json::Value as JsonValue;

use crate::{
    accounts::AccountId,
    slots::SlotId,
    tasks::TaskId,
};

/// Closed error taxonomy surfaced to callers in `errorCode`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCode {
    /// No enabled account configured.
    NoActiveAccount,
    /// Selector found zero eligible slots.
    NoAvailableSlot,
    /// Upstream rejected with 429, or every otherwise-available slot is over
    /// quota.
    SlotRateLimited,
    /// Dispatch exceeded the request deadline.
    RemoteTimeout,
    /// Transport or protocol error from the runtime.
    RemoteError,
    /// Proxy runtime couldn't reach a local parser.
    ProxyNotImplemented,
    /// Slot's kind is unrecognized.
    UnknownKind,
    /// Queue lookup for an id that was never enqueued.
    TaskNotFound,
    /// A task's retry budget is already spent.
    MaxAttemptsExceeded,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Partial,
    Aborted,
}

/// Product-facing shape engine-native summaries are translated into.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedResult {
    pub status: RunStatus,
    pub fetched: u64,
    pub duration_ms: u64,
    pub risk_score: f64,
    pub aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    /// Engine-native response body, kept verbatim.
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub raw: JsonValue,
}

impl NormalizedResult {
    /// Translate an engine response body. Field sourcing is first-non-nil:
    /// `fetched` from `engineSummary.fetchedPosts` else `tweets.length`;
    /// `riskScore` from `finalRisk` else `riskMax` else 0; `durationMs` from
    /// the summary else the measured wall time.
    pub fn from_engine_response(body: JsonValue, measured: Duration) -> Self {
        let summary = body.get("engineSummary");
        let field = |name: &str| summary.and_then(|s| s.get(name));

        let fetched = field("fetchedPosts")
            .and_then(JsonValue::as_u64)
            .or_else(|| {
                body.get("tweets")
                    .and_then(JsonValue::as_array)
                    .map(|tweets| tweets.len() as u64)
            })
            .unwrap_or(0);
        let risk_score = field("finalRisk")
            .and_then(JsonValue::as_f64)
            .or_else(|| field("riskMax").and_then(JsonValue::as_f64))
            .unwrap_or(0.0);
        let duration_ms = field("durationMs")
            .and_then(JsonValue::as_u64)
            .unwrap_or(measured.as_millis() as u64);
        let aborted = field("aborted").map(coerce_bool).unwrap_or(false);
        let abort_reason = field("abortReason")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        let status = if !aborted {
            RunStatus::Ok
        } else if fetched > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Aborted
        };
        Self {
            status,
            fetched,
            duration_ms,
            risk_score,
            aborted,
            abort_reason,
            raw: body,
        }
    }
}

/// Engines disagree on how they spell booleans.
fn coerce_bool(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        JsonValue::String(s) => s == "true" || s == "1",
        _ => false,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMeta {
    pub account_id: AccountId,
    pub instance_id: SlotId,
    pub task_id: TaskId,
    pub duration_ms: u64,
}

/// Value returned by the dispatcher and the executor. Serializes as
/// `{ok: true, data, meta}` or `{ok: false, error, errorCode}`.
#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionResult {
    Success {
        data: NormalizedResult,
        meta: ExecutionMeta,
    },
    Failure {
        error: String,
        error_code: ErrorCode,
    },
}

impl ExecutionResult {
    pub fn failure(error_code: ErrorCode, error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            error_code,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error_code, .. } => Some(*error_code),
        }
    }
}

impl Serialize for ExecutionResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Success { data, meta } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("ok", &true)?;
                map.serialize_entry("data", data)?;
                map.serialize_entry("meta", meta)?;
                map.end()
            },
            Self::Failure { error, error_code } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("ok", &false)?;
                map.serialize_entry("error", error)?;
                map.serialize_entry("errorCode", error_code)?;
                map.end()
            },
        }
    }
}
