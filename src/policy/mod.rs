//! Policy boundary: turns a transcript into a reply and structured intents.
//!
//! The policy is a black box (an LLM-backed service in production). What
//! comes back is untrusted: empty replies, JSON fragments and unknown
//! stages all occur and must not cost us the detected change.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::conversation::model::{ConversationState, Lead, LeadStage, Transcript};
use crate::error::PolicyError;

pub use http::HttpPolicy;

/// Side context handed to the policy with the transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyContext {
    pub account_id: String,
    pub contact_name: String,
    pub state: ConversationState,
    pub lead_stage: Option<LeadStage>,
    /// Originating post and matched offering, when the contact came from a lead.
    pub lead: Option<Lead>,
    /// Texts of the inbound batch being answered.
    pub new_inbound: Vec<String>,
}

/// Move the lead to another stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageIntent {
    pub stage: LeadStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Close the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndIntent {
    pub reason: String,
}

/// Structured intents attached to a reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intents {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advance_stage: Option<StageIntent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<EndIntent>,
}

impl Intents {
    pub fn is_empty(&self) -> bool {
        self.advance_stage.is_none() && self.end.is_none()
    }
}

/// What the policy decided for one inbound batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    #[serde(default)]
    pub reply_text: String,
    #[serde(default)]
    pub intents: Intents,
}

impl PolicyDecision {
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            reply_text: text.into(),
            intents: Intents::default(),
        }
    }

    pub fn with_stage(mut self, stage: LeadStage, extracted_info: Option<&str>) -> Self {
        self.intents.advance_stage = Some(StageIntent {
            stage,
            extracted_info: extracted_info.map(str::to_string),
            reason: None,
        });
        self
    }

    pub fn with_end(mut self, reason: impl Into<String>) -> Self {
        self.intents.end = Some(EndIntent {
            reason: reason.into(),
        });
        self
    }

    /// The reply to send, if any.
    pub fn reply_to_send(&self) -> Option<&str> {
        let text = self.reply_text.trim();
        if text.is_empty() { None } else { Some(text) }
    }

    /// Replace unusable reply text with the neutral fallback.
    ///
    /// - garbled text (JSON, markup, template leftovers) → fallback
    /// - empty text with no intents → fallback
    /// - empty text alongside an intent stays empty (intent-only decision)
    pub fn sanitized(mut self, fallback: &str) -> Self {
        if is_garbled(&self.reply_text) {
            warn!(reply = %self.reply_text.chars().take(80).collect::<String>(), "Garbled policy reply, using fallback");
            self.reply_text = fallback.to_string();
        } else if self.reply_text.trim().is_empty() && self.intents.is_empty() {
            warn!("Empty policy reply with no intents, using fallback");
            self.reply_text = fallback.to_string();
        }
        self
    }

    /// Decision used when the policy answered with nothing parseable.
    pub fn fallback(fallback: &str) -> Self {
        Self::reply(fallback)
    }
}

/// Trait for reply policies.
#[async_trait]
pub trait PolicyInvoker: Send + Sync {
    /// Policy name for logging.
    fn name(&self) -> &str;

    /// Decide how to answer `transcript`.
    async fn invoke(
        &self,
        transcript: &Transcript,
        context: &PolicyContext,
    ) -> Result<PolicyDecision, PolicyError>;
}

// ── Response parsing ────────────────────────────────────────────────

/// Loose wire shape: field names vary between policy versions.
#[derive(Debug, Deserialize)]
struct WireDecision {
    #[serde(default, alias = "replyText", alias = "reply")]
    reply_text: Option<String>,
    #[serde(default)]
    intents: WireIntents,
}

#[derive(Debug, Default, Deserialize)]
struct WireIntents {
    #[serde(default, alias = "advanceStage")]
    advance_stage: Option<WireStage>,
    #[serde(default)]
    end: Option<WireEnd>,
}

#[derive(Debug, Deserialize)]
struct WireStage {
    stage: String,
    #[serde(default, alias = "extractedInfo")]
    extracted_info: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireEnd {
    #[serde(default)]
    reason: Option<String>,
}

/// Parse a policy response body into a decision.
///
/// Unknown stages drop the stage intent rather than the whole decision.
pub fn parse_decision(raw: &str) -> Result<PolicyDecision, PolicyError> {
    let json_str = extract_json_object(raw);
    let wire: WireDecision = serde_json::from_str(&json_str)
        .map_err(|e| PolicyError::Malformed(format!("JSON parse error: {e}")))?;

    let advance_stage = wire.intents.advance_stage.and_then(|s| match s.stage.parse::<LeadStage>() {
        Ok(stage) => Some(StageIntent {
            stage,
            extracted_info: s.extracted_info.filter(|v| !v.trim().is_empty()),
            reason: s.reason,
        }),
        Err(e) => {
            warn!(error = %e, "Dropping stage intent with unknown stage");
            None
        }
    });

    let end = wire.intents.end.map(|e| EndIntent {
        reason: e
            .reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "policy ended conversation".to_string()),
    });

    Ok(PolicyDecision {
        reply_text: wire.reply_text.unwrap_or_default(),
        intents: Intents { advance_stage, end },
    })
}

/// Whether reply text is structurally unusable as a chat message.
fn is_garbled(text: &str) -> bool {
    let t = text.trim();
    if t.is_empty() {
        return false;
    }
    t.starts_with('{')
        || t.starts_with('[')
        || t.contains("```")
        || t.contains("{{")
        || matches!(t.to_ascii_lowercase().as_str(), "null" | "undefined" | "none")
}

/// Extract a JSON object from model output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
