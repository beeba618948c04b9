use anyhow::Context as _;
use common::runtime::UnixTimestamp;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

use crate::{
    accounts::AccountId,
    id_type,
    results::{
        ErrorCode,
        NormalizedResult,
    },
    slots::SlotId,
};

id_type!(TaskId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskType {
    Search,
    AccountTweets,
    AccountFollowers,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Queue ordering: higher priority first, then older `createdAt` first.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
    Failed,
}

/// Typed view of a task's payload. The persisted record keeps `type` and a
/// free-form `payload` document; everything past the queue boundary works
/// with this variant instead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    #[serde(rename_all = "camelCase")]
    Search { query: String, max_results: u32 },
    #[serde(rename_all = "camelCase")]
    AccountTweets { username: String, max_results: u32 },
    #[serde(rename_all = "camelCase")]
    AccountFollowers { username: String, max_results: u32 },
}

impl TaskPayload {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskPayload::Search { .. } => TaskType::Search,
            TaskPayload::AccountTweets { .. } => TaskType::AccountTweets,
            TaskPayload::AccountFollowers { .. } => TaskType::AccountFollowers,
        }
    }

    pub fn max_results(&self) -> u32 {
        match self {
            TaskPayload::Search { max_results, .. }
            | TaskPayload::AccountTweets { max_results, .. }
            | TaskPayload::AccountFollowers { max_results, .. } => *max_results,
        }
    }

    /// Split into the persisted `(type, payload)` columns.
    pub fn to_parts(&self) -> anyhow::Result<(TaskType, JsonValue)> {
        let mut doc = serde_json::to_value(self)?;
        doc.as_object_mut()
            .context("payload must serialize to an object")?
            .remove("type");
        Ok((self.task_type(), doc))
    }

    /// Rebuild the typed payload from the persisted columns.
    pub fn from_parts(task_type: TaskType, payload: &JsonValue) -> anyhow::Result<Self> {
        let mut doc = payload.clone();
        doc.as_object_mut()
            .with_context(|| format!("{} payload is not an object", task_type.as_str()))?
            .insert("type".to_string(), serde_json::to_value(task_type)?);
        serde_json::from_value(doc)
            .with_context(|| format!("malformed {} payload", task_type.as_str()))
    }
}

/// One unit of dispatchable work, owned by the durable queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParserTask {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub payload: JsonValue,
    pub priority: TaskPriority,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: TaskStatus,
    pub account_id: AccountId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<SlotId>,
    pub created_at: UnixTimestamp,
    pub updated_at: UnixTimestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<UnixTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<UnixTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<NormalizedResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl ParserTask {
    pub fn new(
        id: TaskId,
        payload: &TaskPayload,
        account_id: AccountId,
        priority: TaskPriority,
        max_attempts: u32,
        now: UnixTimestamp,
    ) -> anyhow::Result<Self> {
        let (task_type, payload_doc) = payload.to_parts()?;
        Ok(Self {
            id,
            task_type,
            payload: payload_doc,
            priority,
            attempts: 0,
            max_attempts,
            status: TaskStatus::Queued,
            account_id,
            instance_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            error_code: None,
        })
    }

    pub fn typed_payload(&self) -> anyhow::Result<TaskPayload> {
        TaskPayload::from_parts(self.task_type, &self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        TaskPayload,
        TaskPriority,
        TaskType,
    };

    #[test]
    fn test_payload_parts_round_trip() -> anyhow::Result<()> {
        let payload = TaskPayload::Search {
            query: "solana exploit".to_string(),
            max_results: 50,
        };
        let (task_type, doc) = payload.to_parts()?;
        assert_eq!(task_type, TaskType::Search);
        assert_eq!(doc["query"], "solana exploit");
        assert_eq!(doc["maxResults"], 50);
        assert!(doc.get("type").is_none());

        let rebuilt = TaskPayload::from_parts(task_type, &doc)?;
        assert_eq!(rebuilt, payload);
        Ok(())
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        let doc = serde_json::json!({ "query": "x" });
        // maxResults missing.
        assert!(TaskPayload::from_parts(TaskType::Search, &doc).is_err());
        // Wrong shape entirely.
        assert!(TaskPayload::from_parts(TaskType::Search, &serde_json::json!(42)).is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
        assert_eq!(TaskPriority::default(), TaskPriority::Normal);
    }
}
