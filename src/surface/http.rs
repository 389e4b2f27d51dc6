//! HTTP client for the browser-automation sidecar that drives the inbox.
//!
//! Endpoints:
//! - `GET  /session`                  → 200 when logged in
//! - `GET  /unread`                   → `[{name, preview_text, preview_is_ours}]`
//! - `POST /open {name}`              → `{ok}`
//! - `GET  /transcript?contact=NAME`  → `[{sender: "ours"|"theirs", text}]`
//! - `POST /send {text}`              → `{ok}`
//!
//! 401/403 mean the account is logged out, 423 that it is restricted.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::config::SurfaceConfig;
use crate::conversation::model::RawMessage;
use crate::error::{SessionProblem, SurfaceError};
use crate::surface::{MessageSurface, UnreadPreview};

/// Sidecar-backed message surface.
pub struct HttpSurface {
    config: SurfaceConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct OkResponse {
    ok: bool,
}

impl HttpSurface {
    pub fn new(config: SurfaceConfig) -> Result<Self, SurfaceError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SurfaceError::Transport(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url)
    }

    /// Send a request and map transport and status failures.
    async fn execute(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, SurfaceError> {
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                SurfaceError::Timeout(self.config.request_timeout)
            } else if e.is_connect() {
                SurfaceError::Session {
                    kind: SessionProblem::Unreachable,
                    message: e.to_string(),
                }
            } else {
                SurfaceError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        Err(status_error(status, body))
    }
}

/// Map a non-success sidecar status to a surface error.
fn status_error(status: StatusCode, body: String) -> SurfaceError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SurfaceError::Session {
            kind: SessionProblem::LoggedOut,
            message: body,
        },
        StatusCode::LOCKED => SurfaceError::Session {
            kind: SessionProblem::Banned,
            message: body,
        },
        StatusCode::NOT_FOUND => SurfaceError::Extraction {
            contact: String::new(),
            reason: format!("sidecar returned {status}"),
        },
        _ => SurfaceError::Transport(format!("sidecar returned {status}: {body}")),
    }
}

#[async_trait]
impl MessageSurface for HttpSurface {
    fn name(&self) -> &str {
        "http"
    }

    async fn check_session(&self) -> Result<(), SurfaceError> {
        self.execute(self.client.get(self.url("session"))).await?;
        Ok(())
    }

    async fn list_unread(&self) -> Result<Vec<UnreadPreview>, SurfaceError> {
        let resp = self.execute(self.client.get(self.url("unread"))).await?;
        resp.json()
            .await
            .map_err(|e| SurfaceError::Transport(format!("unread: bad JSON: {e}")))
    }

    async fn open_contact(&self, name: &str) -> Result<bool, SurfaceError> {
        let req = self
            .client
            .post(self.url("open"))
            .json(&serde_json::json!({ "name": name }));
        let resp = self.execute(req).await?;
        let body: OkResponse = resp
            .json()
            .await
            .map_err(|e| SurfaceError::Transport(format!("open: bad JSON: {e}")))?;
        Ok(body.ok)
    }

    async fn read_transcript(&self, name: &str) -> Result<Vec<RawMessage>, SurfaceError> {
        let req = self
            .client
            .get(self.url("transcript"))
            .query(&[("contact", name)]);
        let resp = self.execute(req).await.map_err(|e| match e {
            SurfaceError::Extraction { reason, .. } => SurfaceError::Extraction {
                contact: name.to_string(),
                reason,
            },
            other => other,
        })?;
        let messages: Vec<RawMessage> = resp.json().await.map_err(|e| SurfaceError::Extraction {
            contact: name.to_string(),
            reason: format!("bad JSON: {e}"),
        })?;
        debug!(contact = %name, count = messages.len(), "Transcript read");
        Ok(messages)
    }

    async fn send_message(&self, text: &str) -> Result<bool, SurfaceError> {
        let req = self
            .client
            .post(self.url("send"))
            .json(&serde_json::json!({ "text": text }));
        let resp = self.execute(req).await?;
        let body: OkResponse = resp.json().await.map_err(|e| SurfaceError::SendFailed {
            reason: format!("bad JSON: {e}"),
        })?;
        Ok(body.ok)
    }
}
