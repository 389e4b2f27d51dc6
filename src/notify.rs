//! Escalation for session problems (logged out, banned, unreachable).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info};

use crate::config::NotifyConfig;
use crate::error::{NotifyError, SessionProblem};

/// Receives session problems that stop the loop.
#[async_trait]
pub trait SessionNotifier: Send + Sync {
    async fn notify_session_problem(
        &self,
        account_id: &str,
        kind: SessionProblem,
        message: &str,
    ) -> Result<(), NotifyError>;
}

/// Writes the problem to the log and nothing else.
pub struct LogNotifier;

#[async_trait]
impl SessionNotifier for LogNotifier {
    async fn notify_session_problem(
        &self,
        account_id: &str,
        kind: SessionProblem,
        message: &str,
    ) -> Result<(), NotifyError> {
        error!(account = account_id, %kind, message, "Session problem, operator action needed");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct Alert<'a> {
    account_id: &'a str,
    kind: SessionProblem,
    message: &'a str,
    at: String,
}

/// POSTs a JSON alert to a webhook.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| NotifyError::Delivery(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl SessionNotifier for WebhookNotifier {
    async fn notify_session_problem(
        &self,
        account_id: &str,
        kind: SessionProblem,
        message: &str,
    ) -> Result<(), NotifyError> {
        let alert = Alert {
            account_id,
            kind,
            message,
            at: chrono::Utc::now().to_rfc3339(),
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&alert)
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(NotifyError::Delivery(format!(
                "webhook returned {}",
                resp.status()
            )));
        }
        info!(account = account_id, %kind, "Session problem escalated");
        Ok(())
    }
}

/// Pick the notifier for a config: webhook when configured, log otherwise.
pub fn from_config(config: &NotifyConfig) -> Result<Arc<dyn SessionNotifier>, NotifyError> {
    match config.webhook_url {
        Some(ref url) => Ok(Arc::new(WebhookNotifier::new(url.clone())?)),
        None => Ok(Arc::new(LogNotifier)),
    }
}
