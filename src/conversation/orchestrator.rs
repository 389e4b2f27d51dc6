//! Reply orchestrator: drives one contact through the conversation state
//! machine per cycle.
//!
//! Ordering per handled change:
//! 1. stage transition persisted (idempotent on the batch hash)
//! 2. decision stored as pending
//! 3. pre-send re-check, then send
//! 4. fingerprint persisted, which also clears the pending decision
//!
//! A crash anywhere in that sequence leaves the store at or behind the
//! surface, never ahead of it.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::conversation::burst::{BurstCollector, BurstSettings};
use crate::conversation::detector::{ChangeStatus, detect};
use crate::conversation::filter::FilterSet;
use crate::conversation::model::{
    Contact, ConversationState, Lead, LeadStage, Message, PendingDecision, Sender,
    StageTransition, Transcript,
};
use crate::error::{Error, PolicyError, SurfaceError};
use crate::policy::{PolicyContext, PolicyDecision, PolicyInvoker};
use crate::store::ContactStore;
use crate::surface::MessageSurface;

/// What happened to a contact in one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing new.
    Unchanged,
    /// Our own message showed up; fingerprint refreshed.
    Confirmed,
    /// Reply sent, contact now WAITING.
    Replied,
    /// Policy advanced the stage without a reply; stays NEEDS_REPLY.
    IntentOnly,
    /// Policy ended the conversation.
    Ended { closing_sent: bool },
    /// New inbound landed between the policy call and the send.
    Aborted,
    /// Send not confirmed; decision kept for the next cycle.
    SendFailed,
    /// Policy could not be reached; change left unacknowledged.
    PolicyUnavailable,
    /// Transcript could not be read (or contact not found).
    Skipped,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Confirmed => "confirmed",
            Self::Replied => "replied",
            Self::IntentOnly => "intent_only",
            Self::Ended { .. } => "ended",
            Self::Aborted => "aborted",
            Self::SendFailed => "send_failed",
            Self::PolicyUnavailable => "policy_unavailable",
            Self::Skipped => "skipped",
        }
    }

    /// Whether a message went out during this pass.
    pub fn sent(&self) -> bool {
        matches!(self, Self::Replied | Self::Ended { closing_sent: true })
    }
}

/// Result of handling one contact.
#[derive(Debug, Clone)]
pub struct Handled {
    pub contact: String,
    pub outcome: Outcome,
    /// Hash of the inbound change that was detected, if any.
    pub change: Option<String>,
    pub policy_called: bool,
}

impl Handled {
    fn new(contact: &str, outcome: Outcome) -> Self {
        Self {
            contact: contact.to_string(),
            outcome,
            change: None,
            policy_called: false,
        }
    }
}

/// Per-contact state machine driver.
pub struct ReplyOrchestrator {
    config: EngineConfig,
    surface: Arc<dyn MessageSurface>,
    policy: Arc<dyn PolicyInvoker>,
    store: Arc<dyn ContactStore>,
    filters: FilterSet,
}

impl ReplyOrchestrator {
    pub fn new(
        config: EngineConfig,
        surface: Arc<dyn MessageSurface>,
        policy: Arc<dyn PolicyInvoker>,
        store: Arc<dyn ContactStore>,
        filters: FilterSet,
    ) -> Self {
        Self {
            config,
            surface,
            policy,
            store,
            filters,
        }
    }

    /// Record a contact we reached out to first (outbound engagement),
    /// optionally linked to the lead that surfaced it.
    pub async fn register_contact(&self, name: &str, lead: Option<&Lead>) -> Result<Contact, Error> {
        let mut contact = Contact::new(&self.config.account_id, name);
        if let Some(lead) = lead {
            self.store.upsert_lead(lead).await?;
            contact = contact.with_lead(lead.id);
        }
        let stored = self.store.upsert_contact(&contact).await?;
        if let Some(lead) = lead
            && stored.lead_id != Some(lead.id)
        {
            self.store.link_lead(stored.id, lead.id).await?;
        }
        info!(contact = name, lead = ?lead.map(|l| l.id), "Contact registered");
        Ok(stored)
    }

    /// Run one pass of the state machine for `name`.
    ///
    /// Only session failures and store failures are returned as errors;
    /// everything else ends in an [`Outcome`].
    pub async fn process_contact(&self, name: &str) -> Result<Handled, Error> {
        match self.surface.open_contact(name).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(contact = name, "Contact not found on surface, skipping");
                return Ok(Handled::new(name, Outcome::Skipped));
            }
            Err(e) if e.is_session() => return Err(e.into()),
            Err(e) => {
                warn!(contact = name, error = %e, "Failed to open contact, skipping");
                return Ok(Handled::new(name, Outcome::Skipped));
            }
        }

        let Some(transcript) = self.read_with_retries(name).await? else {
            warn!(
                contact = name,
                attempts = self.config.extraction_retries + 1,
                "Transcript extraction failed, skipping contact this cycle"
            );
            return Ok(Handled::new(name, Outcome::Skipped));
        };

        let contact = match self.store.get_contact(&self.config.account_id, name).await? {
            Some(c) => c,
            None => {
                self.store
                    .upsert_contact(&Contact::new(&self.config.account_id, name))
                    .await?
            }
        };

        let detection = detect(contact.fingerprint.as_ref(), &transcript);
        debug!(
            contact = name,
            status = detection.status.label(),
            state = %contact.state,
            fingerprint = %detection.current,
            "Change detection"
        );

        match detection.status {
            ChangeStatus::Unchanged => {
                debug!(contact = name, state = %contact.state, "Waiting");
                Ok(Handled::new(name, Outcome::Unchanged))
            }
            ChangeStatus::OwnMessageConfirmed => {
                // Dormant conversations only reopen on inbound.
                let target = if contact.state.is_dormant() {
                    contact.state
                } else {
                    checked_transition(name, contact.state, ConversationState::Waiting)
                };
                self.store
                    .persist_fingerprint(contact.id, &detection.current, target)
                    .await?;
                Ok(Handled::new(name, Outcome::Confirmed))
            }
            ChangeStatus::NewInbound => {
                let change = detection.current.hash.clone();
                let mut handled = self
                    .handle_new_inbound(contact, transcript, detection.new_inbound)
                    .await?;
                handled.change = Some(change);
                Ok(handled)
            }
        }
    }

    async fn handle_new_inbound(
        &self,
        mut contact: Contact,
        transcript: Transcript,
        trigger: Vec<Message>,
    ) -> Result<Handled, Error> {
        let name = contact.name.clone();
        let current_hash = transcript.fingerprint().hash;
        info!(
            contact = %name,
            state = %contact.state,
            new = trigger.len(),
            "New inbound detected"
        );

        if contact.state != ConversationState::NeedsReply {
            let next = checked_transition(&name, contact.state, ConversationState::NeedsReply);
            self.store.update_state(contact.id, next).await?;
            contact.state = next;
        }

        // A decision already made for exactly this transcript is re-applied
        // instead of asking the policy again.
        if let Some(pending) = contact.pending.take() {
            if pending.change_hash == current_hash {
                info!(contact = %name, "Re-applying pending decision");
                let outcome = self
                    .apply_decision(&contact, &transcript, pending.decision)
                    .await?;
                return Ok(Handled::new(&name, outcome));
            }
            if pending_reply_landed(&transcript, &pending) {
                let ended = pending.decision.intents.end.is_some();
                let target = if ended {
                    ConversationState::Ended
                } else {
                    ConversationState::Waiting
                };
                let next = checked_transition(&name, contact.state, target);
                self.store
                    .persist_fingerprint(contact.id, &transcript.fingerprint(), next)
                    .await?;
                info!(contact = %name, state = %next, "Unconfirmed send reached the thread");
                let outcome = if ended {
                    Outcome::Ended { closing_sent: true }
                } else {
                    Outcome::Replied
                };
                return Ok(Handled::new(&name, outcome));
            }
            debug!(contact = %name, "Transcript moved on, dropping pending decision");
            self.store.clear_pending_decision(contact.id).await?;
        }

        let burst = BurstCollector::new(
            self.surface.as_ref(),
            &self.filters,
            BurstSettings::from(&self.config),
        )
        .collect(&name, transcript, trigger)
        .await?;

        let lead = match contact.lead_id {
            Some(id) => self.store.get_lead(id).await?,
            None => None,
        };
        let context = PolicyContext {
            account_id: contact.account_id.clone(),
            contact_name: name.clone(),
            state: contact.state,
            lead_stage: contact.lead_stage,
            lead,
            new_inbound: burst.texts(),
        };

        info!(
            contact = %name,
            policy = self.policy.name(),
            batch = burst.messages.len(),
            "Invoking policy"
        );
        let decision = match self.policy.invoke(&burst.transcript, &context).await {
            Ok(d) => d.sanitized(&self.config.fallback_reply),
            Err(PolicyError::Malformed(reason)) => {
                warn!(contact = %name, %reason, "Malformed policy response, using fallback reply");
                PolicyDecision::fallback(&self.config.fallback_reply)
            }
            Err(e @ PolicyError::Unavailable(_)) => {
                error!(contact = %name, error = %e, "Policy unavailable, will retry next cycle");
                let mut handled = Handled::new(&name, Outcome::PolicyUnavailable);
                handled.policy_called = true;
                return Ok(handled);
            }
        };

        let outcome = self
            .apply_decision(&contact, &burst.transcript, decision)
            .await?;
        let mut handled = Handled::new(&name, outcome);
        handled.policy_called = true;
        Ok(handled)
    }

    /// Apply a policy decision for `batch`: stage first, then end or reply.
    async fn apply_decision(
        &self,
        contact: &Contact,
        batch: &Transcript,
        decision: PolicyDecision,
    ) -> Result<Outcome, Error> {
        let name = contact.name.as_str();
        let batch_fp = batch.fingerprint();

        if let Some(ref stage) = decision.intents.advance_stage {
            let transition = StageTransition {
                contact_id: contact.id,
                stage: stage.stage,
                reason: stage
                    .reason
                    .clone()
                    .unwrap_or_else(|| "policy intent".to_string()),
                extracted_info: stage.extracted_info.clone(),
                change_key: batch_fp.hash.clone(),
                created_at: Utc::now(),
            };
            self.store.persist_stage_transition(&transition).await?;
        }
        if let Some(ref end) = decision.intents.end {
            let transition = StageTransition {
                contact_id: contact.id,
                stage: LeadStage::Ended,
                reason: end.reason.clone(),
                extracted_info: None,
                change_key: format!("{}:end", batch_fp.hash),
                created_at: Utc::now(),
            };
            self.store.persist_stage_transition(&transition).await?;
        }

        let reply = decision.reply_to_send().map(str::to_string);
        if reply.is_some() {
            self.store
                .save_pending_decision(
                    contact.id,
                    &PendingDecision {
                        change_hash: batch_fp.hash.clone(),
                        decision: decision.clone(),
                    },
                )
                .await?;
        }

        // End: closing text (if any), then ENDED.
        if let Some(ref end) = decision.intents.end {
            let ended = checked_transition(name, contact.state, ConversationState::Ended);
            let Some(text) = reply else {
                self.store
                    .persist_fingerprint(contact.id, &batch_fp, ended)
                    .await?;
                info!(contact = name, reason = %end.reason, "Conversation ended");
                return Ok(Outcome::Ended {
                    closing_sent: false,
                });
            };
            if !self.send(name, &text).await? {
                return Ok(Outcome::SendFailed);
            }
            self.store
                .persist_fingerprint(contact.id, &batch.with_outbound(&text).fingerprint(), ended)
                .await?;
            info!(contact = name, reason = %end.reason, "Conversation ended with closing message");
            return Ok(Outcome::Ended { closing_sent: true });
        }

        // Intent-only: acknowledge the batch, keep NEEDS_REPLY.
        let Some(text) = reply else {
            self.store
                .persist_fingerprint(contact.id, &batch_fp, ConversationState::NeedsReply)
                .await?;
            info!(contact = name, "Decision carried no reply");
            return Ok(Outcome::IntentOnly);
        };

        if !self.recheck_before_send(name, batch).await? {
            self.store.clear_pending_decision(contact.id).await?;
            return Ok(Outcome::Aborted);
        }

        if !self.send(name, &text).await? {
            return Ok(Outcome::SendFailed);
        }

        let waiting = checked_transition(name, contact.state, ConversationState::Waiting);
        self.store
            .persist_fingerprint(contact.id, &batch.with_outbound(&text).fingerprint(), waiting)
            .await?;
        info!(contact = name, chars = text.len(), "Reply sent");
        Ok(Outcome::Replied)
    }

    /// Re-read the transcript right before sending.
    ///
    /// Returns `false` if inbound text not in `batch` has appeared, or if the
    /// transcript cannot be read to confirm otherwise.
    async fn recheck_before_send(&self, name: &str, batch: &Transcript) -> Result<bool, Error> {
        let raw = match self.surface.read_transcript(name).await {
            Ok(raw) => raw,
            Err(e) if e.is_session() => return Err(e.into()),
            Err(e) => {
                warn!(contact = name, error = %e, "Pre-send re-check failed, holding reply");
                return Ok(false);
            }
        };
        if raw.is_empty() {
            warn!(contact = name, "Pre-send re-check read nothing, holding reply");
            return Ok(false);
        }

        let fresh = Transcript::from_raw(raw, &self.filters);
        let known: std::collections::HashSet<&str> =
            batch.inbound().map(|m| m.text.as_str()).collect();
        let unseen: Vec<&str> = fresh
            .inbound()
            .map(|m| m.text.as_str())
            .filter(|t| !known.contains(t))
            .collect();

        if unseen.is_empty() {
            return Ok(true);
        }
        info!(
            contact = name,
            unseen = unseen.len(),
            "New inbound arrived before send, aborting reply"
        );
        Ok(false)
    }

    async fn send(&self, name: &str, text: &str) -> Result<bool, Error> {
        match self.surface.send_message(text).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                warn!(contact = name, "Send not confirmed, will retry next cycle");
                Ok(false)
            }
            Err(e) if e.is_session() => Err(e.into()),
            Err(e) => {
                warn!(contact = name, error = %e, "Send failed, will retry next cycle");
                Ok(false)
            }
        }
    }

    /// Read a non-empty transcript, retrying empty or failed reads.
    ///
    /// `Ok(None)` once retries are exhausted.
    async fn read_with_retries(&self, name: &str) -> Result<Option<Transcript>, SurfaceError> {
        let attempts = self.config.extraction_retries + 1;
        for attempt in 1..=attempts {
            match self.surface.read_transcript(name).await {
                Ok(raw) if !raw.is_empty() => {
                    return Ok(Some(Transcript::from_raw(raw, &self.filters)));
                }
                Ok(_) => debug!(contact = name, attempt, "Empty transcript read"),
                Err(e) if e.is_session() => return Err(e),
                Err(e) => debug!(contact = name, attempt, error = %e, "Transcript read failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.extraction_retry_delay).await;
            }
        }
        Ok(None)
    }
}

/// Whether `transcript` is the pending batch followed by exactly the
/// pending reply: a send the surface did not confirm but delivered.
fn pending_reply_landed(transcript: &Transcript, pending: &PendingDecision) -> bool {
    let Some(reply) = pending.decision.reply_to_send() else {
        return false;
    };
    let Some((last, earlier)) = transcript.messages.split_last() else {
        return false;
    };
    if last.sender != Sender::Ours {
        return false;
    }
    let batch = Transcript {
        messages: earlier.to_vec(),
    };
    batch.fingerprint().hash == pending.change_hash
        && batch.with_outbound(reply).fingerprint().hash == transcript.fingerprint().hash
}

/// Move to `to` if the state table allows it; otherwise stay put.
fn checked_transition(
    contact: &str,
    from: ConversationState,
    to: ConversationState,
) -> ConversationState {
    if from == to || from.can_transition_to(to) {
        to
    } else {
        warn!(contact, %from, %to, "Refusing invalid state transition");
        from
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::conversation::model::RawMessage;
    use crate::error::SessionProblem;
    use crate::store::LibSqlBackend;
    use crate::surface::MemorySurface;
    use crate::testing::ScriptedPolicy;

    const ACCOUNT: &str = "acct";

    fn config() -> EngineConfig {
        EngineConfig {
            account_id: ACCOUNT.into(),
            burst_poll_interval: Duration::from_secs(1),
            burst_settle_polls: 2,
            burst_max_polls: 6,
            extraction_retries: 2,
            extraction_retry_delay: Duration::from_millis(500),
            ..Default::default()
        }
    }

    struct Harness {
        surface: Arc<MemorySurface>,
        policy: Arc<ScriptedPolicy>,
        store: Arc<LibSqlBackend>,
        orchestrator: ReplyOrchestrator,
    }

    async fn harness(decisions: Vec<Result<PolicyDecision, PolicyError>>) -> Harness {
        let surface = Arc::new(MemorySurface::new());
        let policy = Arc::new(ScriptedPolicy::new(decisions));
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let orchestrator = ReplyOrchestrator::new(
            config(),
            surface.clone(),
            policy.clone(),
            store.clone(),
            FilterSet::default_filters(),
        );
        Harness {
            surface,
            policy,
            store,
            orchestrator,
        }
    }

    impl Harness {
        async fn contact(&self, name: &str) -> Contact {
            self.store.get_contact(ACCOUNT, name).await.unwrap().unwrap()
        }

        /// Store a contact as if the given thread had already been handled.
        async fn acknowledge(&self, name: &str, raw: Vec<RawMessage>, state: ConversationState) {
            self.surface.seed(name, raw.clone());
            let c = self
                .store
                .upsert_contact(&Contact::new(ACCOUNT, name))
                .await
                .unwrap();
            let fp = Transcript::from_raw(raw, &FilterSet::default_filters()).fingerprint();
            self.store.persist_fingerprint(c.id, &fp, state).await.unwrap();
        }
    }

    /// Two inbound, two outbound, our message last.
    fn thread() -> Vec<RawMessage> {
        vec![
            RawMessage::theirs("hello"),
            RawMessage::ours("Hi! Saw your post about the sofa"),
            RawMessage::theirs("nice"),
            RawMessage::ours("We have it in grey and blue"),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn new_inbound_gets_one_reply_and_waits() {
        let h = harness(vec![Ok(PolicyDecision::reply("It's 900 TND"))]).await;
        h.acknowledge("Sami", thread(), ConversationState::Waiting).await;
        h.surface.deliver("Sami", "what's the price?");

        let handled = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(handled.outcome, Outcome::Replied);
        assert!(handled.policy_called);
        assert_eq!(h.surface.sent(), vec![("Sami".into(), "It's 900 TND".into())]);

        let c = h.contact("Sami").await;
        assert_eq!(c.state, ConversationState::Waiting);
        let fp = c.fingerprint.unwrap();
        assert_eq!((fp.inbound, fp.outbound), (3, 3));
        assert!(c.pending.is_none());

        // The surface now shows our reply: nothing more to do.
        let again = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(again.outcome, Outcome::Unchanged);
        assert_eq!(h.policy.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_answered_once() {
        let h = harness(vec![Ok(PolicyDecision::reply("Yes, 900 TND with delivery"))]).await;
        h.acknowledge("Sami", thread(), ConversationState::Waiting).await;
        h.surface.deliver("Sami", "still available?");
        // Land during burst collection.
        h.surface.schedule_inbound("Sami", 2, "how much?");
        h.surface.schedule_inbound("Sami", 3, "delivery to Sfax?");

        let handled = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(handled.outcome, Outcome::Replied);
        assert_eq!(h.policy.calls(), 1);
        assert_eq!(h.surface.sent().len(), 1);
        let ctx = h.policy.contexts();
        assert_eq!(
            ctx[0].new_inbound,
            vec!["still available?", "how much?", "delivery to Sfax?"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn message_during_policy_call_aborts_send() {
        let h = harness(vec![
            Ok(PolicyDecision::reply("It's 900 TND")),
            Ok(PolicyDecision::reply("900 TND, and yes we deliver")),
        ])
        .await;
        h.acknowledge("Sami", thread(), ConversationState::Waiting).await;
        h.surface.deliver("Sami", "price?");
        // 1 detection read + 2 quiet burst polls, then the re-check read.
        h.surface.schedule_inbound("Sami", 4, "do you deliver?");

        let handled = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(handled.outcome, Outcome::Aborted);
        assert!(h.surface.sent().is_empty());
        let c = h.contact("Sami").await;
        assert_eq!(c.state, ConversationState::NeedsReply);
        assert!(c.pending.is_none());

        // Next cycle treats it as new inbound and answers the full batch.
        let handled = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(handled.outcome, Outcome::Replied);
        assert_eq!(h.policy.calls(), 2);
        assert_eq!(h.surface.sent()[0].1, "900 TND, and yes we deliver");
    }

    #[tokio::test(start_paused = true)]
    async fn stage_persists_even_when_send_fails_and_retry_skips_policy() {
        let decision = PolicyDecision::reply("Great, we'll call you")
            .with_stage(LeadStage::ContactInfoCaptured, Some("+21612345678"));
        let h = harness(vec![Ok(decision)]).await;
        h.acknowledge("Sami", thread(), ConversationState::Waiting).await;
        h.surface.deliver("Sami", "my number is +21612345678");
        h.surface.fail_sends(1);

        let handled = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(handled.outcome, Outcome::SendFailed);
        let c = h.contact("Sami").await;
        assert_eq!(c.state, ConversationState::NeedsReply);
        assert_eq!(c.lead_stage, Some(LeadStage::ContactInfoCaptured));
        assert!(c.pending.is_some());
        let transitions = h.store.list_stage_transitions(c.id).await.unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].extracted_info.as_deref(), Some("+21612345678"));

        // Retry re-applies the stored decision: no second policy call and no
        // duplicate transition.
        let handled = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(handled.outcome, Outcome::Replied);
        assert!(!handled.policy_called);
        assert_eq!(h.policy.calls(), 1);
        assert_eq!(h.store.list_stage_transitions(c.id).await.unwrap().len(), 1);
        assert_eq!(h.contact("Sami").await.state, ConversationState::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_send_that_landed_is_not_repeated() {
        let h = harness(vec![
            Ok(PolicyDecision::reply("It's 900 TND")),
            Ok(PolicyDecision::reply("It's 900 TND (again)")),
        ])
        .await;
        h.acknowledge("Sami", thread(), ConversationState::Waiting).await;
        h.surface.deliver("Sami", "price?");
        h.surface.fail_sends(1);

        let first = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(first.outcome, Outcome::SendFailed);

        // The reply shows up in the thread after all.
        let mut landed = thread();
        landed.push(RawMessage::theirs("price?"));
        landed.push(RawMessage::ours("It's 900 TND"));
        h.surface.seed("Sami", landed.clone());

        let second = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(second.outcome, Outcome::Replied);
        assert!(!second.policy_called);
        assert_eq!(h.policy.calls(), 1);
        assert!(h.surface.sent().is_empty());

        let c = h.contact("Sami").await;
        assert_eq!(c.state, ConversationState::Waiting);
        assert!(c.pending.is_none());
        let expected = Transcript::from_raw(landed, &FilterSet::default_filters()).fingerprint();
        assert_eq!(c.fingerprint, Some(expected));

        let third = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(third.outcome, Outcome::Unchanged);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_after_landed_reply_asks_policy_again() {
        let h = harness(vec![
            Ok(PolicyDecision::reply("It's 900 TND")),
            Ok(PolicyDecision::reply("Yes, delivery is free")),
        ])
        .await;
        h.acknowledge("Sami", thread(), ConversationState::Waiting).await;
        h.surface.deliver("Sami", "price?");
        h.surface.fail_sends(1);
        h.orchestrator.process_contact("Sami").await.unwrap();

        let mut moved_on = thread();
        moved_on.push(RawMessage::theirs("price?"));
        moved_on.push(RawMessage::ours("It's 900 TND"));
        moved_on.push(RawMessage::theirs("delivery included?"));
        h.surface.seed("Sami", moved_on);

        let handled = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(handled.outcome, Outcome::Replied);
        assert!(handled.policy_called);
        assert_eq!(h.surface.sent()[0].1, "Yes, delivery is free");
        assert_eq!(h.policy.contexts()[1].new_inbound, vec!["delivery included?"]);
    }

    #[tokio::test(start_paused = true)]
    async fn archived_contact_reopens_on_inbound() {
        let h = harness(vec![Ok(PolicyDecision::reply("Welcome back!"))]).await;
        h.acknowledge("Sami", thread(), ConversationState::Archived).await;
        h.surface.deliver("Sami", "hi again, still selling?");

        let handled = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(handled.outcome, Outcome::Replied);
        assert_eq!(h.contact("Sami").await.state, ConversationState::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn archived_contact_waits_in_needs_reply_when_send_fails() {
        let h = harness(vec![Ok(PolicyDecision::reply("Welcome back!"))]).await;
        h.acknowledge("Sami", thread(), ConversationState::Archived).await;
        h.surface.deliver("Sami", "hi again");
        h.surface.fail_sends(1);

        let handled = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(handled.outcome, Outcome::SendFailed);
        assert_eq!(h.contact("Sami").await.state, ConversationState::NeedsReply);
    }

    #[tokio::test(start_paused = true)]
    async fn intent_only_decision_sends_nothing() {
        let decision = PolicyDecision::reply("").with_stage(LeadStage::CtaPhone, Some("+21612345678"));
        let h = harness(vec![Ok(decision)]).await;
        h.acknowledge("Sami", thread(), ConversationState::Waiting).await;
        h.surface.deliver("Sami", "call me on +21612345678");

        let handled = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(handled.outcome, Outcome::IntentOnly);
        assert!(h.surface.sent().is_empty());
        let c = h.contact("Sami").await;
        assert_eq!(c.state, ConversationState::NeedsReply);
        assert_eq!(c.lead_stage, Some(LeadStage::CtaPhone));

        // The change is acknowledged; the policy is not asked again.
        let again = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(again.outcome, Outcome::Unchanged);
        assert_eq!(h.policy.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn end_intent_sends_closing_and_reopens_on_inbound() {
        let h = harness(vec![
            Ok(PolicyDecision::reply("No problem, have a nice day!").with_end("not interested")),
            Ok(PolicyDecision::reply("Sure, it's still available")),
        ])
        .await;
        h.acknowledge("Sami", thread(), ConversationState::Waiting).await;
        h.surface.deliver("Sami", "not interested, thanks");

        let handled = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(handled.outcome, Outcome::Ended { closing_sent: true });
        let c = h.contact("Sami").await;
        assert_eq!(c.state, ConversationState::Ended);
        assert_eq!(c.lead_stage, Some(LeadStage::Ended));

        let quiet = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(quiet.outcome, Outcome::Unchanged);

        h.surface.deliver("Sami", "actually, is it still available?");
        let reopened = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(reopened.outcome, Outcome::Replied);
        assert_eq!(h.contact("Sami").await.state, ConversationState::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_policy_falls_back_and_unavailable_retries() {
        let h = harness(vec![
            Err(PolicyError::Unavailable("connection refused".into())),
            Err(PolicyError::Malformed("not json".into())),
        ])
        .await;
        h.acknowledge("Sami", thread(), ConversationState::Waiting).await;
        h.surface.deliver("Sami", "hello?");

        let first = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(first.outcome, Outcome::PolicyUnavailable);
        assert!(h.surface.sent().is_empty());
        assert_eq!(h.contact("Sami").await.state, ConversationState::NeedsReply);

        let second = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(second.outcome, Outcome::Replied);
        assert_eq!(h.surface.sent()[0].1, config().fallback_reply);
    }

    #[tokio::test(start_paused = true)]
    async fn own_message_refreshes_fingerprint_only() {
        let h = harness(vec![]).await;
        let mut raw = thread();
        raw.push(RawMessage::ours("Want a quote?"));
        h.surface.seed("Sami", raw);

        let handled = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(handled.outcome, Outcome::Confirmed);
        assert_eq!(h.contact("Sami").await.state, ConversationState::Waiting);
        assert_eq!(h.policy.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_extraction_skips_without_state_change() {
        let h = harness(vec![]).await;
        h.acknowledge("Sami", thread(), ConversationState::Waiting).await;
        h.surface.fail_reads("Sami", 3);

        let handled = h.orchestrator.process_contact("Sami").await.unwrap();
        assert_eq!(handled.outcome, Outcome::Skipped);
        assert_eq!(h.surface.reads("Sami"), 3);
        assert_eq!(h.contact("Sami").await.state, ConversationState::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_extraction_failure_is_retried() {
        let h = harness(vec![Ok(PolicyDecision::reply("Hi!"))]).await;
        h.surface.deliver("Nour", "hi");
        h.surface.fail_reads("Nour", 2);

        let handled = h.orchestrator.process_contact("Nour").await.unwrap();
        assert_eq!(handled.outcome, Outcome::Replied);
    }

    #[tokio::test(start_paused = true)]
    async fn session_loss_is_an_error() {
        let h = harness(vec![]).await;
        h.surface.deliver("Sami", "hi");
        h.surface
            .set_session_problem(Some((SessionProblem::LoggedOut, "checkpoint")));

        let err = h.orchestrator.process_contact("Sami").await.unwrap_err();
        assert!(matches!(err, Error::Surface(ref e) if e.is_session()));
    }

    #[tokio::test(start_paused = true)]
    async fn lead_context_reaches_policy() {
        let h = harness(vec![Ok(PolicyDecision::reply("Hello!"))]).await;
        let mut lead = Lead::new("Need a photographer for my wedding in June");
        lead.offering = Some("wedding package".into());
        h.orchestrator.register_contact("Ines", Some(&lead)).await.unwrap();
        h.surface.deliver("Ines", "hi, saw your message");

        h.orchestrator.process_contact("Ines").await.unwrap();
        let ctx = h.policy.contexts();
        let sent_lead = ctx[0].lead.as_ref().unwrap();
        assert_eq!(sent_lead.offering.as_deref(), Some("wedding package"));
    }

    #[test]
    fn invalid_transition_is_refused() {
        assert_eq!(
            checked_transition("x", ConversationState::Archived, ConversationState::Waiting),
            ConversationState::Archived
        );
        assert_eq!(
            checked_transition("x", ConversationState::New, ConversationState::NeedsReply),
            ConversationState::NeedsReply
        );
    }
}
