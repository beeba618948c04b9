//! Dispatch of one task against one slot.
//!
//! The [`Dispatch`] trait is the transport seam: production uses
//! [`HttpDispatcher`], tests substitute scripted implementations. Transport
//! failures are translated into the closed error taxonomy before they leave
//! this module.

use std::collections::BTreeSet;

use async_trait::async_trait;
use store::{
    results::{
        ErrorCode,
        NormalizedResult,
    },
    slots::{
        Slot,
        SlotId,
    },
    tasks::{
        TaskId,
        TaskPayload,
    },
};
use thiserror::Error;

mod http;

pub use http::{
    HttpDispatcher,
    NoSession,
    SessionSource,
};

#[derive(Clone, Debug)]
pub struct DispatchRequest {
    pub task_id: TaskId,
    pub payload: TaskPayload,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DispatchError {
    pub code: ErrorCode,
    pub message: String,
}

impl DispatchError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    /// Execute one task against one slot, within the hard request deadline.
    async fn dispatch(
        &self,
        slot: &Slot,
        request: &DispatchRequest,
    ) -> Result<NormalizedResult, DispatchError>;

    /// Probe the slot's runtime.
    async fn health_check(&self, _slot: &Slot) -> Result<(), DispatchError> {
        Ok(())
    }

    /// Transport label reported in the executor's status surface.
    fn runtime_name(&self) -> &'static str {
        "http"
    }

    /// Called after every registry resync with the ids still present, so
    /// per-slot transport state can be invalidated.
    fn on_registry_sync(&self, _live: &BTreeSet<SlotId>) {}
}

/// Parser endpoints by task type. Path parameters are url-escaped; the
/// payload additionally travels verbatim as query parameters.
pub(crate) fn endpoint_path(payload: &TaskPayload) -> String {
    match payload {
        TaskPayload::Search { query, .. } => format!("/search/{}", urlencoding::encode(query)),
        TaskPayload::AccountTweets { username, .. } => {
            format!("/tweets/{}", urlencoding::encode(username))
        },
        TaskPayload::AccountFollowers { username, .. } => {
            format!("/account/{}/followers", urlencoding::encode(username))
        },
    }
}

pub(crate) fn query_params(payload: &TaskPayload) -> Vec<(&'static str, String)> {
    match payload {
        TaskPayload::Search { query, max_results } => vec![
            ("query", query.clone()),
            ("maxResults", max_results.to_string()),
        ],
        TaskPayload::AccountTweets {
            username,
            max_results,
        }
        | TaskPayload::AccountFollowers {
            username,
            max_results,
        } => vec![
            ("username", username.clone()),
            ("maxResults", max_results.to_string()),
        ],
    }
}

#[cfg(test)]
mod tests {
    use store::tasks::TaskPayload;

    use super::{
        endpoint_path,
        query_params,
    };

    #[test]
    fn test_endpoint_mapping() {
        let search = TaskPayload::Search {
            query: "bridge exploit $ARB".to_string(),
            max_results: 25,
        };
        assert_eq!(endpoint_path(&search), "/search/bridge%20exploit%20%24ARB");

        let tweets = TaskPayload::AccountTweets {
            username: "whale_alerts".to_string(),
            max_results: 100,
        };
        assert_eq!(endpoint_path(&tweets), "/tweets/whale_alerts");

        let followers = TaskPayload::AccountFollowers {
            username: "a/b".to_string(),
            max_results: 10,
        };
        assert_eq!(endpoint_path(&followers), "/account/a%2Fb/followers");
    }

    #[test]
    fn test_payload_forwarded_as_query_params() {
        let search = TaskPayload::Search {
            query: "q".to_string(),
            max_results: 25,
        };
        assert_eq!(
            query_params(&search),
            vec![("query", "q".to_string()), ("maxResults", "25".to_string())]
        );
    }
}
