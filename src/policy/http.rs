//! HTTP client for the reply policy service.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Serialize;
use tracing::debug;

use crate::config::PolicyConfig;
use crate::conversation::model::{Sender, Transcript};
use crate::error::PolicyError;
use crate::policy::{PolicyContext, PolicyDecision, PolicyInvoker, parse_decision};

/// Max transcript lines sent to the policy (oldest are dropped first).
const MAX_TRANSCRIPT_LINES: usize = 60;

/// Policy service reached over HTTP.
pub struct HttpPolicy {
    config: PolicyConfig,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct WireLine<'a> {
    sender: Sender,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct PolicyRequest<'a> {
    transcript: Vec<WireLine<'a>>,
    context: &'a PolicyContext,
}

impl HttpPolicy {
    pub fn new(config: PolicyConfig) -> Result<Self, PolicyError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PolicyError::Unavailable(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }
}

/// Build the request body, keeping only the most recent lines.
fn build_request<'a>(transcript: &'a Transcript, context: &'a PolicyContext) -> PolicyRequest<'a> {
    let skip = transcript.len().saturating_sub(MAX_TRANSCRIPT_LINES);
    PolicyRequest {
        transcript: transcript
            .messages
            .iter()
            .skip(skip)
            .map(|m| WireLine {
                sender: m.sender,
                text: &m.text,
            })
            .collect(),
        context,
    }
}

#[async_trait]
impl PolicyInvoker for HttpPolicy {
    fn name(&self) -> &str {
        "http"
    }

    async fn invoke(
        &self,
        transcript: &Transcript,
        context: &PolicyContext,
    ) -> Result<PolicyDecision, PolicyError> {
        let body = build_request(transcript, context);
        let mut req = self.client.post(&self.config.endpoint).json(&body);
        if let Some(ref key) = self.config.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| PolicyError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PolicyError::Unavailable(format!("policy returned {status}")));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| PolicyError::Unavailable(format!("failed reading body: {e}")))?;
        debug!(contact = %context.contact_name, bytes = text.len(), "Policy responded");
        parse_decision(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::filter::FilterSet;
    use crate::conversation::model::{ConversationState, RawMessage};

    fn context() -> PolicyContext {
        PolicyContext {
            account_id: "acct".into(),
            contact_name: "Sami".into(),
            state: ConversationState::NeedsReply,
            lead_stage: None,
            lead: None,
            new_inbound: vec!["price?".into()],
        }
    }

    #[test]
    fn request_keeps_recent_lines() {
        let raw: Vec<RawMessage> = (0..100).map(|i| RawMessage::theirs(format!("m{i}"))).collect();
        let transcript = Transcript::from_raw(raw, &FilterSet::empty());
        let ctx = context();
        let req = build_request(&transcript, &ctx);
        assert_eq!(req.transcript.len(), MAX_TRANSCRIPT_LINES);
        assert_eq!(req.transcript.last().unwrap().text, "m99");
    }

    #[test]
    fn request_serializes_context() {
        let transcript = Transcript::from_raw(vec![RawMessage::theirs("price?")], &FilterSet::empty());
        let ctx = context();
        let json = serde_json::to_value(build_request(&transcript, &ctx)).unwrap();
        assert_eq!(json["transcript"][0]["sender"], "theirs");
        assert_eq!(json["context"]["contact_name"], "Sami");
        assert_eq!(json["context"]["state"], "needs_reply");
    }
}
