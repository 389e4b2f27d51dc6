//! Conversation data model: contacts, messages, transcripts, lead stages.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::filter::FilterSet;
use crate::conversation::fingerprint::Fingerprint;

// ── Messages ────────────────────────────────────────────────────────

/// Who wrote a message, from the account's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    Ours,
    Theirs,
}

/// A message as the surface hands it over, before filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub sender: Sender,
    pub text: String,
}

impl RawMessage {
    pub fn ours(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::Ours,
            text: text.into(),
        }
    }

    pub fn theirs(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::Theirs,
            text: text.into(),
        }
    }
}

/// A recorded message. Immutable once observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: Sender,
    pub text: String,
    /// Position within the transcript, after filtering.
    pub index: usize,
    pub observed_at: DateTime<Utc>,
}

impl Message {
    pub fn is_inbound(&self) -> bool {
        self.sender == Sender::Theirs
    }
}

/// Ordered, filtered, de-duplicated view of one conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub messages: Vec<Message>,
}

impl Transcript {
    /// Build a transcript from one surface read.
    ///
    /// Noise (timestamps, receipts, system notices) is dropped and a message
    /// rendered twice in a row (same sender + text) is kept once. A repeat
    /// further down the thread is a new message.
    pub fn from_raw(raw: Vec<RawMessage>, filters: &FilterSet) -> Self {
        let observed_at = Utc::now();
        let mut messages: Vec<Message> = Vec::with_capacity(raw.len());

        for msg in raw {
            let text = msg.text.trim().to_string();
            if filters.is_noise(msg.sender, &text) {
                continue;
            }
            if messages
                .last()
                .is_some_and(|prev| prev.sender == msg.sender && prev.text == text)
            {
                continue;
            }
            messages.push(Message {
                sender: msg.sender,
                text,
                index: messages.len(),
                observed_at,
            });
        }

        Self { messages }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Sender of the most recent message.
    pub fn last_sender(&self) -> Option<Sender> {
        self.messages.last().map(|m| m.sender)
    }

    pub fn inbound(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.is_inbound())
    }

    pub fn inbound_count(&self) -> usize {
        self.inbound().count()
    }

    pub fn outbound_count(&self) -> usize {
        self.messages.len() - self.inbound_count()
    }

    /// Inbound messages after our most recent message.
    pub fn unanswered_tail(&self) -> Vec<Message> {
        let start = self
            .messages
            .iter()
            .rposition(|m| m.sender == Sender::Ours)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.messages[start..].to_vec()
    }

    /// The last `n` inbound messages, oldest first.
    pub fn last_inbound(&self, n: usize) -> Vec<Message> {
        let inbound: Vec<&Message> = self.inbound().collect();
        let skip = inbound.len().saturating_sub(n);
        inbound.into_iter().skip(skip).cloned().collect()
    }

    /// Copy of this transcript with one of our messages appended.
    ///
    /// Used to compute the fingerprint the surface should show after a send.
    pub fn with_outbound(&self, text: &str) -> Self {
        let mut next = self.clone();
        next.messages.push(Message {
            sender: Sender::Ours,
            text: text.trim().to_string(),
            index: self.messages.len(),
            observed_at: Utc::now(),
        });
        next
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self)
    }
}

// ── Conversation state ──────────────────────────────────────────────

/// Where a conversation stands. Exactly one per contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    /// First seen, nothing handled yet.
    New,
    /// We sent the last message.
    Waiting,
    /// Inbound detected and not answered yet.
    NeedsReply,
    /// The policy closed the conversation.
    Ended,
    /// Swept after a long stretch of inactivity.
    Archived,
}

impl ConversationState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: ConversationState) -> bool {
        use ConversationState::*;

        matches!(
            (self, target),
            // Any live or closed conversation reopens on new inbound
            (New, NeedsReply) | (Waiting, NeedsReply) | (NeedsReply, NeedsReply) |
            (Ended, NeedsReply) | (Archived, NeedsReply) |
            // Our message confirmed (send, or outbound engagement)
            (New, Waiting) | (NeedsReply, Waiting) | (Waiting, Waiting) |
            (NeedsReply, Ended) | (Ended, Ended) |
            // Maintenance sweep
            (Waiting, Archived) | (Ended, Archived)
        )
    }

    /// Whether the conversation is closed until new inbound arrives.
    pub fn is_dormant(&self) -> bool {
        matches!(self, Self::Ended | Self::Archived)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Waiting => "waiting",
            Self::NeedsReply => "needs_reply",
            Self::Ended => "ended",
            Self::Archived => "archived",
        }
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConversationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "waiting" => Ok(Self::Waiting),
            "needs_reply" => Ok(Self::NeedsReply),
            "ended" => Ok(Self::Ended),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown conversation state: '{other}'")),
        }
    }
}

// ── Lead stages ─────────────────────────────────────────────────────

/// Qualification stage of the lead behind a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeadStage {
    Contacted,
    Interested,
    /// Asked for a phone number.
    CtaPhone,
    ContactInfoCaptured,
    NotInterested,
    Ended,
}

impl LeadStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contacted => "CONTACTED",
            Self::Interested => "INTERESTED",
            Self::CtaPhone => "CTA_PHONE",
            Self::ContactInfoCaptured => "CONTACT_INFO_CAPTURED",
            Self::NotInterested => "NOT_INTERESTED",
            Self::Ended => "ENDED",
        }
    }
}

impl std::fmt::Display for LeadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LeadStage {
    type Err = String;

    /// Accepts `CTA_PHONE`, `cta-phone`, `Cta Phone` and friends.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm: String = s
            .trim()
            .chars()
            .map(|c| if c == '-' || c == ' ' { '_' } else { c.to_ascii_uppercase() })
            .collect();
        match norm.as_str() {
            "CONTACTED" => Ok(Self::Contacted),
            "INTERESTED" => Ok(Self::Interested),
            "CTA_PHONE" => Ok(Self::CtaPhone),
            "CONTACT_INFO_CAPTURED" => Ok(Self::ContactInfoCaptured),
            "NOT_INTERESTED" => Ok(Self::NotInterested),
            "ENDED" => Ok(Self::Ended),
            _ => Err(format!("unknown lead stage: '{s}'")),
        }
    }
}

/// A recorded lead-stage change, produced by a policy intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTransition {
    pub contact_id: Uuid,
    pub stage: LeadStage,
    pub reason: String,
    /// Phone number or other contact string the policy pulled out.
    pub extracted_info: Option<String>,
    /// Hash of the transcript that triggered this; one transition per change.
    pub change_key: String,
    pub created_at: DateTime<Utc>,
}

// ── Contacts and leads ──────────────────────────────────────────────

/// One correspondent of one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub account_id: String,
    /// Display name, also the key the surface opens conversations by.
    pub name: String,
    pub state: ConversationState,
    /// Last acknowledged fingerprint. `None` until the first handled read.
    pub fingerprint: Option<Fingerprint>,
    pub last_activity: DateTime<Utc>,
    pub lead_id: Option<Uuid>,
    pub lead_stage: Option<LeadStage>,
    /// Decision computed but not yet delivered, with the hash it answers.
    pub pending: Option<PendingDecision>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    /// A freshly observed contact.
    pub fn new(account_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.into(),
            name: name.into(),
            state: ConversationState::New,
            fingerprint: None,
            last_activity: now,
            lead_id: None,
            lead_stage: None,
            pending: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_lead(mut self, lead_id: Uuid) -> Self {
        self.lead_id = Some(lead_id);
        self
    }
}

/// A policy decision waiting to be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDecision {
    /// Fingerprint hash of the transcript the decision answers.
    pub change_hash: String,
    pub decision: crate::policy::PolicyDecision,
}

/// Where a lead came from: the post that surfaced it and what we sell them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub post_text: String,
    pub post_url: Option<String>,
    pub offering: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(post_text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            post_text: post_text.into(),
            post_url: None,
            offering: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript(raw: Vec<RawMessage>) -> Transcript {
        Transcript::from_raw(raw, &FilterSet::empty())
    }

    #[test]
    fn transcript_counts_and_tail() {
        let t = transcript(vec![
            RawMessage::ours("Hi, saw your post"),
            RawMessage::theirs("hello"),
            RawMessage::ours("Interested in a quote?"),
            RawMessage::theirs("yes"),
            RawMessage::theirs("what's the price?"),
        ]);
        assert_eq!(t.inbound_count(), 3);
        assert_eq!(t.outbound_count(), 2);
        assert_eq!(t.last_sender(), Some(Sender::Theirs));
        let tail: Vec<_> = t.unanswered_tail().into_iter().map(|m| m.text).collect();
        assert_eq!(tail, vec!["yes", "what's the price?"]);
    }

    #[test]
    fn duplicate_render_suppressed_within_read() {
        let t = transcript(vec![
            RawMessage::theirs("ok"),
            RawMessage::theirs("ok"),
            RawMessage::ours("ok"),
        ]);
        assert_eq!(t.len(), 2);
        assert_eq!(t.messages[1].index, 1);
    }

    #[test]
    fn later_repeat_is_a_new_message() {
        let t = transcript(vec![
            RawMessage::theirs("ok"),
            RawMessage::ours("Shall I reserve it for you?"),
            RawMessage::theirs("ok"),
        ]);
        assert_eq!(t.len(), 3);
        assert_eq!(t.inbound_count(), 2);
        assert_eq!(t.last_sender(), Some(Sender::Theirs));
    }

    #[test]
    fn last_inbound_takes_newest() {
        let t = transcript(vec![
            RawMessage::theirs("a"),
            RawMessage::ours("b"),
            RawMessage::theirs("c"),
            RawMessage::theirs("d"),
        ]);
        let last: Vec<_> = t.last_inbound(2).into_iter().map(|m| m.text).collect();
        assert_eq!(last, vec!["c", "d"]);
        assert_eq!(t.last_inbound(10).len(), 3);
    }

    #[test]
    fn with_outbound_appends_ours() {
        let t = transcript(vec![RawMessage::theirs("price?")]);
        let next = t.with_outbound("  It's 40 TND  ");
        assert_eq!(next.len(), 2);
        assert_eq!(next.last_sender(), Some(Sender::Ours));
        assert_eq!(next.messages[1].text, "It's 40 TND");
    }

    #[test]
    fn state_transitions_valid() {
        use ConversationState::*;
        assert!(New.can_transition_to(NeedsReply));
        assert!(Waiting.can_transition_to(NeedsReply));
        assert!(NeedsReply.can_transition_to(Waiting));
        assert!(NeedsReply.can_transition_to(Ended));
        assert!(Ended.can_transition_to(NeedsReply));
        assert!(Archived.can_transition_to(NeedsReply));
        assert!(Waiting.can_transition_to(Archived));
    }

    #[test]
    fn state_transitions_invalid() {
        use ConversationState::*;
        assert!(!Ended.can_transition_to(Waiting));
        assert!(!Archived.can_transition_to(Waiting));
        assert!(!NeedsReply.can_transition_to(Archived));
        assert!(!Waiting.can_transition_to(New));
    }

    #[test]
    fn state_string_roundtrip() {
        for s in [
            ConversationState::New,
            ConversationState::Waiting,
            ConversationState::NeedsReply,
            ConversationState::Ended,
            ConversationState::Archived,
        ] {
            assert_eq!(s.as_str().parse::<ConversationState>().unwrap(), s);
        }
        assert!("closed".parse::<ConversationState>().is_err());
    }

    #[test]
    fn lead_stage_parse_is_lenient() {
        assert_eq!("CTA_PHONE".parse::<LeadStage>().unwrap(), LeadStage::CtaPhone);
        assert_eq!("cta-phone".parse::<LeadStage>().unwrap(), LeadStage::CtaPhone);
        assert_eq!(
            "contact info captured".parse::<LeadStage>().unwrap(),
            LeadStage::ContactInfoCaptured
        );
        assert!("maybe".parse::<LeadStage>().is_err());
    }

    #[test]
    fn lead_stage_serializes_screaming() {
        let json = serde_json::to_string(&LeadStage::CtaPhone).unwrap();
        assert_eq!(json, "\"CTA_PHONE\"");
    }
}
