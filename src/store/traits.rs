//! `ContactStore` trait: the persistence boundary for the engine.
//!
//! Every write is an idempotent upsert keyed by contact identity, so a
//! cycle that is replayed after a crash lands on the same rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::conversation::fingerprint::Fingerprint;
use crate::conversation::model::{
    Contact, ConversationState, Lead, PendingDecision, StageTransition,
};
use crate::error::DatabaseError;

/// Backend-agnostic store for contacts, stage transitions and leads.
#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Contacts ────────────────────────────────────────────────────

    /// Look up a contact by account and display name.
    async fn get_contact(
        &self,
        account_id: &str,
        name: &str,
    ) -> Result<Option<Contact>, DatabaseError>;

    /// Insert a contact on first observation. Existing rows are left alone
    /// and returned as stored.
    async fn upsert_contact(&self, contact: &Contact) -> Result<Contact, DatabaseError>;

    /// Record the acknowledged fingerprint and state, refresh
    /// `last_activity`, and clear any pending decision.
    async fn persist_fingerprint(
        &self,
        contact_id: Uuid,
        fingerprint: &Fingerprint,
        state: ConversationState,
    ) -> Result<(), DatabaseError>;

    /// Change state only (fingerprint untouched).
    async fn update_state(
        &self,
        contact_id: Uuid,
        state: ConversationState,
    ) -> Result<(), DatabaseError>;

    /// Remember a decision that still has to be delivered.
    async fn save_pending_decision(
        &self,
        contact_id: Uuid,
        pending: &PendingDecision,
    ) -> Result<(), DatabaseError>;

    /// Drop any pending decision.
    async fn clear_pending_decision(&self, contact_id: Uuid) -> Result<(), DatabaseError>;

    /// Contacts polled every cycle: live states with activity since `since`,
    /// plus every NEEDS_REPLY contact however old.
    async fn list_active_contacts(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Contact>, DatabaseError>;

    /// Move WAITING/ENDED contacts idle since before `before` to ARCHIVED.
    /// Returns how many were archived.
    async fn archive_inactive(
        &self,
        account_id: &str,
        before: DateTime<Utc>,
    ) -> Result<usize, DatabaseError>;

    /// Operator reset: delete the contact and its history.
    async fn reset_contact(&self, account_id: &str, name: &str) -> Result<bool, DatabaseError>;

    // ── Stage transitions ───────────────────────────────────────────

    /// Record a stage transition and update the contact's lead stage.
    ///
    /// Idempotent on `(contact_id, change_key)`. Returns `false` when this
    /// change was already recorded.
    async fn persist_stage_transition(
        &self,
        transition: &StageTransition,
    ) -> Result<bool, DatabaseError>;

    async fn list_stage_transitions(
        &self,
        contact_id: Uuid,
    ) -> Result<Vec<StageTransition>, DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    async fn upsert_lead(&self, lead: &Lead) -> Result<(), DatabaseError>;

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError>;

    /// Attach a lead to a contact.
    async fn link_lead(&self, contact_id: Uuid, lead_id: Uuid) -> Result<(), DatabaseError>;
}
