use std::{
    collections::{
        BTreeSet,
        HashMap,
    },
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

use async_trait::async_trait;
use common::knobs::{
    DISPATCH_TIMEOUT,
    LOCAL_PARSER_BASE_URL,
};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use store::{
    results::{
        ErrorCode,
        NormalizedResult,
    },
    slots::{
        Slot,
        SlotId,
        SlotKind,
    },
};
use url::Url;

use super::{
    endpoint_path,
    query_params,
    Dispatch,
    DispatchError,
    DispatchRequest,
};

/// Source of the system-scoped session credential carried out of band on
/// local parser calls. Injected at construction; the core has no opinion on
/// where the session comes from.
pub trait SessionSource: Send + Sync + 'static {
    fn session_token(&self) -> Option<String>;
}

/// Session source for deployments without an upstream session provider.
pub struct NoSession;

impl SessionSource for NoSession {
    fn session_token(&self) -> Option<String> {
        None
    }
}

/// HTTP transport for all three slot kinds. Adapters (one reqwest client +
/// resolved base URL per slot) are cached by slot id; an entry whose slot
/// configuration changed is rebuilt on next use, and `retain` drops entries
/// for slots that left the registry.
pub struct HttpDispatcher {
    local_parser_base: Url,
    session: Arc<dyn SessionSource>,
    timeout: Duration,
    adapters: Mutex<HashMap<SlotId, CachedAdapter>>,
}

struct CachedAdapter {
    fingerprint: Fingerprint,
    adapter: Arc<SlotAdapter>,
}

type Fingerprint = (SlotKind, Option<String>, Option<String>);

fn fingerprint(slot: &Slot) -> Fingerprint {
    (slot.kind, slot.base_url.clone(), slot.proxy_url.clone())
}

impl HttpDispatcher {
    pub fn new(local_parser_base: Url, session: Arc<dyn SessionSource>) -> Self {
        Self {
            local_parser_base,
            session,
            timeout: *DISPATCH_TIMEOUT,
            adapters: Mutex::new(HashMap::new()),
        }
    }

    /// Dispatcher against the local parser base URL from the environment.
    pub fn from_env(session: Arc<dyn SessionSource>) -> anyhow::Result<Self> {
        let base = Url::parse(&LOCAL_PARSER_BASE_URL)?;
        Ok(Self::new(base, session))
    }

    /// Drop cached adapters for slots no longer present in the registry.
    pub fn retain(&self, live: &BTreeSet<SlotId>) {
        self.adapters.lock().retain(|id, _| live.contains(id));
    }

    fn adapter_for(&self, slot: &Slot) -> Result<Arc<SlotAdapter>, DispatchError> {
        let fingerprint = fingerprint(slot);
        {
            let adapters = self.adapters.lock();
            if let Some(cached) = adapters.get(&slot.id) {
                if cached.fingerprint == fingerprint {
                    return Ok(cached.adapter.clone());
                }
            }
        }
        let adapter = Arc::new(self.build_adapter(slot)?);
        self.adapters.lock().insert(
            slot.id.clone(),
            CachedAdapter {
                fingerprint,
                adapter: adapter.clone(),
            },
        );
        Ok(adapter)
    }

    fn build_adapter(&self, slot: &Slot) -> Result<SlotAdapter, DispatchError> {
        let transport_error =
            |e: reqwest::Error| DispatchError::new(ErrorCode::RemoteError, e.to_string());
        match slot.kind {
            SlotKind::RemoteWorker => {
                let base_url = slot.base_url.as_deref().ok_or_else(|| {
                    DispatchError::new(ErrorCode::RemoteError, "remote_worker slot has no baseUrl")
                })?;
                let base = Url::parse(base_url).map_err(|e| {
                    DispatchError::new(
                        ErrorCode::RemoteError,
                        format!("invalid baseUrl {base_url}: {e}"),
                    )
                })?;
                let client = reqwest::Client::builder()
                    .timeout(self.timeout)
                    .build()
                    .map_err(transport_error)?;
                Ok(SlotAdapter {
                    mode: AdapterMode::Remote,
                    client,
                    base,
                    timeout: self.timeout,
                })
            },
            SlotKind::LocalParser => {
                let client = reqwest::Client::builder()
                    .timeout(self.timeout)
                    .build()
                    .map_err(transport_error)?;
                Ok(SlotAdapter {
                    mode: AdapterMode::Local,
                    client,
                    base: self.local_parser_base.clone(),
                    timeout: self.timeout,
                })
            },
            SlotKind::Proxy => {
                let proxy_url = slot.proxy_url.as_deref().ok_or_else(|| {
                    DispatchError::new(ErrorCode::RemoteError, "proxy slot has no proxyUrl")
                })?;
                let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| {
                    DispatchError::new(
                        ErrorCode::RemoteError,
                        format!("invalid proxyUrl {proxy_url}: {e}"),
                    )
                })?;
                let client = reqwest::Client::builder()
                    .proxy(proxy)
                    .timeout(self.timeout)
                    .build()
                    .map_err(transport_error)?;
                Ok(SlotAdapter {
                    mode: AdapterMode::Proxy,
                    client,
                    base: self.local_parser_base.clone(),
                    timeout: self.timeout,
                })
            },
            SlotKind::Unknown => Err(DispatchError::new(
                ErrorCode::UnknownKind,
                format!("slot {} has an unrecognized kind", slot.id),
            )),
        }
    }
}

#[async_trait]
impl Dispatch for HttpDispatcher {
    async fn dispatch(
        &self,
        slot: &Slot,
        request: &DispatchRequest,
    ) -> Result<NormalizedResult, DispatchError> {
        let adapter = self.adapter_for(slot)?;
        adapter.dispatch(request, self.session.as_ref()).await
    }

    async fn health_check(&self, slot: &Slot) -> Result<(), DispatchError> {
        let adapter = self.adapter_for(slot)?;
        adapter.health_check().await
    }

    fn on_registry_sync(&self, live: &BTreeSet<SlotId>) {
        self.retain(live);
    }
}

enum AdapterMode {
    Remote,
    Local,
    Proxy,
}

struct SlotAdapter {
    mode: AdapterMode,
    client: reqwest::Client,
    base: Url,
    timeout: Duration,
}

impl SlotAdapter {
    async fn dispatch(
        &self,
        request: &DispatchRequest,
        session: &dyn SessionSource,
    ) -> Result<NormalizedResult, DispatchError> {
        let url = self.join(&endpoint_path(&request.payload))?;
        let started = Instant::now();
        let mut builder = self
            .client
            .get(url)
            .query(&query_params(&request.payload))
            .timeout(self.timeout);
        match self.mode {
            AdapterMode::Remote => {
                builder = builder.header("X-Task-ID", request.task_id.as_str());
            },
            AdapterMode::Local | AdapterMode::Proxy => {
                if let Some(token) = session.session_token() {
                    builder = builder.bearer_auth(token);
                }
            },
        }
        let response = builder.send().await.map_err(|e| self.map_transport(e))?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(DispatchError::new(
                ErrorCode::SlotRateLimited,
                "upstream rejected with 429",
            ));
        }
        if !status.is_success() {
            return Err(DispatchError::new(
                ErrorCode::RemoteError,
                format!("upstream returned {status}"),
            ));
        }
        let body: JsonValue = response.json().await.map_err(|e| self.map_transport(e))?;
        Ok(NormalizedResult::from_engine_response(
            body,
            started.elapsed(),
        ))
    }

    async fn health_check(&self) -> Result<(), DispatchError> {
        let url = self.join("/health")?;
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::new(
                ErrorCode::RemoteError,
                format!("health endpoint returned {status}"),
            ));
        }
        Ok(())
    }

    fn join(&self, path: &str) -> Result<Url, DispatchError> {
        self.base.join(path).map_err(|e| {
            DispatchError::new(ErrorCode::RemoteError, format!("invalid endpoint path: {e}"))
        })
    }

    fn map_transport(&self, e: reqwest::Error) -> DispatchError {
        if e.is_timeout() {
            return DispatchError::new(
                ErrorCode::RemoteTimeout,
                "dispatch exceeded the request deadline",
            );
        }
        if matches!(self.mode, AdapterMode::Proxy) && e.is_connect() {
            return DispatchError::new(
                ErrorCode::ProxyNotImplemented,
                "proxy could not reach the local parser",
            );
        }
        DispatchError::new(ErrorCode::RemoteError, format!("transport error: {e}"))
    }
}
