//! Controller-side reporter: pushes field changes to the session server and
//! re-synchronizes after a server-side reset.
//!
//! The reporter keeps every field it has been told about, so a fresh
//! handshake can always send the complete state in its `init`. A mismatch
//! between the cached session id and the id the server echoes back drops
//! the reporter to [`ReporterState::Disconnected`]; the next report starts
//! a new handshake.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use reqwest::Url;
use serde_json::Value;

use crate::protocol::{
    parse_endpoint, ConnectResponse, EndpointError, FieldMap, InitRequest, UpdateRequest,
};

#[derive(Debug, thiserror::Error)]
pub enum ReporterError {
    #[error(transparent)]
    InvalidEndpoint(#[from] EndpointError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server answered {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReporterState {
    Disconnected,
    Connecting,
    Connected,
}

/// What a single [`Reporter::report`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Sent as an `update` on the cached session.
    Sent,
    /// Started a handshake and sent the full state in an `init`.
    Connected,
    /// A handshake is already in flight; the value rides along with it.
    Coalesced,
    /// The server answered with a different session id. The cached id was
    /// cleared and the next report reconnects.
    Resync,
}

struct Inner {
    state: ReporterState,
    session_id: Option<String>,
    debug_logging: bool,
    fields: FieldMap,
}

#[derive(Clone)]
pub struct Reporter {
    client: reqwest::Client,
    endpoint: Url,
    inner: Arc<Mutex<Inner>>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Reporter {
    pub fn new(endpoint: &str) -> Result<Self, ReporterError> {
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: parse_endpoint(endpoint)?,
            inner: Arc::new(Mutex::new(Inner {
                state: ReporterState::Disconnected,
                session_id: None,
                debug_logging: false,
                fields: FieldMap::new(),
            })),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn state(&self) -> ReporterState {
        self.inner.lock().state
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.lock().session_id.clone()
    }

    pub fn debug_logging(&self) -> bool {
        self.inner.lock().debug_logging
    }

    /// Record a field change and push it to the server.
    pub async fn report(&self, field: &str, value: Value) -> Result<ReportOutcome, ReporterError> {
        let session_id = {
            let mut inner = self.inner.lock();
            inner.fields.insert(field.to_owned(), value.clone());
            match inner.state {
                ReporterState::Connected => inner.session_id.clone(),
                ReporterState::Connecting => return Ok(ReportOutcome::Coalesced),
                ReporterState::Disconnected => {
                    inner.state = ReporterState::Connecting;
                    None
                }
            }
        };

        match session_id {
            Some(session_id) => self.send_update(session_id, field, value).await,
            None => self.handshake().await,
        }
    }

    /// Send a log line. Unimportant lines are dropped unless the server
    /// asked for debug logging. Returns whether the line was sent.
    pub async fn log(&self, message: &str, important: bool) -> Result<bool, ReporterError> {
        if !important && !self.debug_logging() {
            return Ok(false);
        }
        let url = self.url("log")?;
        let resp = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain;charset=utf-8")
            .body(message.to_owned())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ReporterError::Status(resp.status()));
        }
        Ok(true)
    }

    fn url(&self, path: &str) -> Result<Url, ReporterError> {
        self.endpoint.join(path).map_err(|e| {
            ReporterError::InvalidEndpoint(EndpointError {
                endpoint: self.endpoint.to_string(),
                reason: e.to_string(),
            })
        })
    }

    async fn handshake(&self) -> Result<ReportOutcome, ReporterError> {
        let connect = match self.fetch_connect().await {
            Ok(connect) => connect,
            Err(e) => {
                tracing::warn!(error = %e, "connect failed");
                self.inner.lock().state = ReporterState::Disconnected;
                return Err(e);
            }
        };

        let state = {
            let mut inner = self.inner.lock();
            inner.session_id = Some(connect.session_id.clone());
            inner.debug_logging = connect.debug_logging;
            inner.state = ReporterState::Connected;
            inner.fields.clone()
        };
        tracing::info!(session_id = %connect.session_id, fields = state.len(), "connected, sending init");

        let body = InitRequest {
            session_id: connect.session_id.clone(),
            timestamp: Some(now_ms()),
            state,
        };
        match self.post_json("init", &body).await {
            Ok(echoed) if echoed == connect.session_id => Ok(ReportOutcome::Connected),
            Ok(echoed) => {
                self.invalidate(&connect.session_id, &echoed);
                Ok(ReportOutcome::Resync)
            }
            Err(e) => {
                self.invalidate(&connect.session_id, "");
                Err(e)
            }
        }
    }

    async fn fetch_connect(&self) -> Result<ConnectResponse, ReporterError> {
        let resp = self.client.get(self.url("connect")?).send().await?;
        if !resp.status().is_success() {
            return Err(ReporterError::Status(resp.status()));
        }
        Ok(resp.json().await?)
    }

    async fn send_update(
        &self,
        session_id: String,
        field: &str,
        value: Value,
    ) -> Result<ReportOutcome, ReporterError> {
        let body = UpdateRequest {
            session_id: session_id.clone(),
            state: value,
        };
        match self.post_json(&format!("update/{field}"), &body).await {
            Ok(echoed) if echoed == session_id => Ok(ReportOutcome::Sent),
            Ok(echoed) => {
                self.invalidate(&session_id, &echoed);
                Ok(ReportOutcome::Resync)
            }
            // Treated like a mismatch: resync on the next report.
            Err(e) => {
                self.invalidate(&session_id, "");
                Err(e)
            }
        }
    }

    /// POST a JSON body and return the session id the server echoes.
    async fn post_json<T: serde::Serialize>(&self, path: &str, body: &T) -> Result<String, ReporterError> {
        let resp = self.client.post(self.url(path)?).json(body).send().await?;
        if !resp.status().is_success() {
            return Err(ReporterError::Status(resp.status()));
        }
        Ok(resp.text().await?.trim().to_owned())
    }

    /// Forget `session_id` if it is still the cached one. A newer handshake
    /// that already replaced it is left alone.
    fn invalidate(&self, session_id: &str, echoed: &str) {
        let mut inner = self.inner.lock();
        if inner.session_id.as_deref() != Some(session_id) {
            return;
        }
        tracing::info!(session_id, echoed, "session no longer valid, disconnecting");
        inner.session_id = None;
        inner.debug_logging = false;
        inner.state = ReporterState::Disconnected;
    }
}
