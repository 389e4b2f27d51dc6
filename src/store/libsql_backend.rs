//! libSQL backend: async `ContactStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::conversation::fingerprint::Fingerprint;
use crate::conversation::model::{
    Contact, ConversationState, Lead, LeadStage, PendingDecision, StageTransition,
};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::ContactStore;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed precision keeps string comparison in
/// `WHERE last_activity >= ?` consistent with time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

const CONTACT_COLUMNS: &str = "id, account_id, name, state, fp_hash, fp_inbound, fp_outbound, \
     last_activity, lead_id, lead_stage, pending_hash, pending_decision, created_at, updated_at";

/// Map a libsql Row to a Contact.
///
/// Column order matches CONTACT_COLUMNS.
fn row_to_contact(row: &libsql::Row) -> Result<Contact, libsql::Error> {
    let id_str: String = row.get(0)?;
    let state_str: String = row.get(3)?;
    let fp_hash: Option<String> = row.get(4).ok();
    let fp_inbound: Option<i64> = row.get(5).ok();
    let fp_outbound: Option<i64> = row.get(6).ok();
    let last_activity: String = row.get(7)?;
    let lead_id: Option<String> = row.get(8).ok();
    let lead_stage: Option<String> = row.get(9).ok();
    let pending_hash: Option<String> = row.get(10).ok();
    let pending_json: Option<String> = row.get(11).ok();
    let created_str: String = row.get(12)?;
    let updated_str: String = row.get(13)?;

    let fingerprint = fp_hash.map(|hash| Fingerprint {
        hash,
        inbound: fp_inbound.unwrap_or(0).max(0) as usize,
        outbound: fp_outbound.unwrap_or(0).max(0) as usize,
    });

    // A pending decision that no longer deserializes is dropped; the change
    // stays unacknowledged and the policy is asked again.
    let pending = match (pending_hash, pending_json) {
        (Some(change_hash), Some(json)) => match serde_json::from_str(&json) {
            Ok(decision) => Some(PendingDecision {
                change_hash,
                decision,
            }),
            Err(e) => {
                tracing::warn!(contact = %id_str, "Dropping unreadable pending decision: {e}");
                None
            }
        },
        _ => None,
    };

    Ok(Contact {
        id: parse_uuid(&id_str),
        account_id: row.get(1)?,
        name: row.get(2)?,
        state: state_str.parse().unwrap_or(ConversationState::New),
        fingerprint,
        last_activity: parse_datetime(&last_activity),
        lead_id: lead_id.as_deref().map(parse_uuid),
        lead_stage: lead_stage.and_then(|s| s.parse::<LeadStage>().ok()),
        pending,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const TRANSITION_COLUMNS: &str = "contact_id, stage, reason, extracted_info, change_key, created_at";

fn row_to_transition(row: &libsql::Row) -> Result<StageTransition, libsql::Error> {
    let contact_id: String = row.get(0)?;
    let stage: String = row.get(1)?;
    let created_str: String = row.get(5)?;
    Ok(StageTransition {
        contact_id: parse_uuid(&contact_id),
        stage: stage.parse().unwrap_or(LeadStage::Contacted),
        reason: row.get(2)?,
        extracted_info: row.get(3).ok(),
        change_key: row.get(4)?,
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_lead(row: &libsql::Row) -> Result<Lead, libsql::Error> {
    let id_str: String = row.get(0)?;
    let created_str: String = row.get(4)?;
    Ok(Lead {
        id: parse_uuid(&id_str),
        post_text: row.get(1)?,
        post_url: row.get(2).ok(),
        offering: row.get(3).ok(),
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl ContactStore for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Contacts ────────────────────────────────────────────────────

    async fn get_contact(
        &self,
        account_id: &str,
        name: &str,
    ) -> Result<Option<Contact>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE account_id = ?1 AND name = ?2"),
                params![account_id, name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_contact: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let contact = row_to_contact(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_contact row parse: {e}")))?;
                Ok(Some(contact))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_contact: {e}"))),
        }
    }

    async fn upsert_contact(&self, contact: &Contact) -> Result<Contact, DatabaseError> {
        let lead_id = contact.lead_id.map(|id| id.to_string());
        self.conn()
            .execute(
                "INSERT INTO contacts (id, account_id, name, state, last_activity, lead_id, lead_stage, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(account_id, name) DO NOTHING",
                params![
                    contact.id.to_string(),
                    contact.account_id.as_str(),
                    contact.name.as_str(),
                    contact.state.as_str(),
                    ts(contact.last_activity),
                    opt_text(lead_id.as_deref()),
                    opt_text(contact.lead_stage.map(|s| s.as_str())),
                    ts(contact.created_at),
                    ts(contact.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_contact: {e}")))?;

        self.get_contact(&contact.account_id, &contact.name)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "contact".into(),
                id: contact.name.clone(),
            })
    }

    async fn persist_fingerprint(
        &self,
        contact_id: Uuid,
        fingerprint: &Fingerprint,
        state: ConversationState,
    ) -> Result<(), DatabaseError> {
        let now = ts(Utc::now());
        let updated = self
            .conn()
            .execute(
                "UPDATE contacts SET fp_hash = ?1, fp_inbound = ?2, fp_outbound = ?3, state = ?4,
                     last_activity = ?5, pending_hash = NULL, pending_decision = NULL, updated_at = ?5
                 WHERE id = ?6",
                params![
                    fingerprint.hash.as_str(),
                    fingerprint.inbound as i64,
                    fingerprint.outbound as i64,
                    state.as_str(),
                    now,
                    contact_id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("persist_fingerprint: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "contact".into(),
                id: contact_id.to_string(),
            });
        }
        debug!(contact_id = %contact_id, fingerprint = %fingerprint, state = %state, "Fingerprint persisted");
        Ok(())
    }

    async fn update_state(
        &self,
        contact_id: Uuid,
        state: ConversationState,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE contacts SET state = ?1, updated_at = ?2 WHERE id = ?3",
                params![state.as_str(), ts(Utc::now()), contact_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_state: {e}")))?;
        Ok(())
    }

    async fn save_pending_decision(
        &self,
        contact_id: Uuid,
        pending: &PendingDecision,
    ) -> Result<(), DatabaseError> {
        let json = serde_json::to_string(&pending.decision)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "UPDATE contacts SET pending_hash = ?1, pending_decision = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    pending.change_hash.as_str(),
                    json,
                    ts(Utc::now()),
                    contact_id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_pending_decision: {e}")))?;
        Ok(())
    }

    async fn clear_pending_decision(&self, contact_id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE contacts SET pending_hash = NULL, pending_decision = NULL WHERE id = ?1",
                params![contact_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_pending_decision: {e}")))?;
        Ok(())
    }

    async fn list_active_contacts(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Contact>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONTACT_COLUMNS} FROM contacts
                     WHERE account_id = ?1
                       AND (state = 'needs_reply'
                            OR (state NOT IN ('ended', 'archived') AND last_activity >= ?2))
                     ORDER BY last_activity DESC"
                ),
                params![account_id, ts(since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_contacts: {e}")))?;

        let mut contacts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_contact(&row) {
                Ok(c) => contacts.push(c),
                Err(e) => tracing::warn!("Skipping contact row: {e}"),
            }
        }
        Ok(contacts)
    }

    async fn archive_inactive(
        &self,
        account_id: &str,
        before: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let archived = self
            .conn()
            .execute(
                "UPDATE contacts SET state = 'archived', updated_at = ?1
                 WHERE account_id = ?2 AND state IN ('waiting', 'ended') AND last_activity < ?3",
                params![ts(Utc::now()), account_id, ts(before)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("archive_inactive: {e}")))?;
        Ok(archived as usize)
    }

    async fn reset_contact(&self, account_id: &str, name: &str) -> Result<bool, DatabaseError> {
        let Some(contact) = self.get_contact(account_id, name).await? else {
            return Ok(false);
        };
        let id = contact.id.to_string();
        self.conn()
            .execute(
                "DELETE FROM stage_transitions WHERE contact_id = ?1",
                params![id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_contact transitions: {e}")))?;
        self.conn()
            .execute("DELETE FROM contacts WHERE id = ?1", params![id.as_str()])
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_contact: {e}")))?;
        info!(account = account_id, contact = name, "Contact reset");
        Ok(true)
    }

    // ── Stage transitions ───────────────────────────────────────────

    async fn persist_stage_transition(
        &self,
        transition: &StageTransition,
    ) -> Result<bool, DatabaseError> {
        let contact_id = transition.contact_id.to_string();
        // Transition row and contact stage commit together or not at all.
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("persist_stage_transition begin: {e}")))?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO stage_transitions (contact_id, stage, reason, extracted_info, change_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    contact_id.as_str(),
                    transition.stage.as_str(),
                    transition.reason.as_str(),
                    opt_text(transition.extracted_info.as_deref()),
                    transition.change_key.as_str(),
                    ts(transition.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("persist_stage_transition: {e}")))?;

        if inserted == 0 {
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::Query(format!("persist_stage_transition rollback: {e}")))?;
            debug!(contact_id = %contact_id, stage = %transition.stage, "Stage transition already recorded");
            return Ok(false);
        }

        let updated = tx
            .execute(
                "UPDATE contacts SET lead_stage = ?1, updated_at = ?2 WHERE id = ?3",
                params![transition.stage.as_str(), ts(Utc::now()), contact_id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("persist_stage_transition lead_stage: {e}")))?;

        if updated == 0 {
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::Query(format!("persist_stage_transition rollback: {e}")))?;
            return Err(DatabaseError::NotFound {
                entity: "contact".into(),
                id: contact_id,
            });
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("persist_stage_transition commit: {e}")))?;

        info!(contact_id = %contact_id, stage = %transition.stage, "Lead stage advanced");
        Ok(true)
    }

    async fn list_stage_transitions(
        &self,
        contact_id: Uuid,
    ) -> Result<Vec<StageTransition>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TRANSITION_COLUMNS} FROM stage_transitions WHERE contact_id = ?1 ORDER BY id ASC"
                ),
                params![contact_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_stage_transitions: {e}")))?;

        let mut transitions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_transition(&row) {
                Ok(t) => transitions.push(t),
                Err(e) => tracing::warn!("Skipping stage transition row: {e}"),
            }
        }
        Ok(transitions)
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn upsert_lead(&self, lead: &Lead) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO leads (id, post_text, post_url, offering, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET post_text = excluded.post_text,
                     post_url = excluded.post_url, offering = excluded.offering",
                params![
                    lead.id.to_string(),
                    lead.post_text.as_str(),
                    opt_text(lead.post_url.as_deref()),
                    opt_text(lead.offering.as_deref()),
                    ts(lead.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_lead: {e}")))?;
        Ok(())
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, post_text, post_url, offering, created_at FROM leads WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_lead: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_lead(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_lead row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_lead: {e}"))),
        }
    }

    async fn link_lead(&self, contact_id: Uuid, lead_id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE contacts SET lead_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![lead_id.to_string(), ts(Utc::now()), contact_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("link_lead: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::filter::FilterSet;
    use crate::conversation::model::{RawMessage, Transcript};
    use crate::policy::PolicyDecision;

    async fn backend() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn fingerprint(texts: &[&str]) -> Fingerprint {
        let raw = texts.iter().map(|t| RawMessage::theirs(*t)).collect();
        Transcript::from_raw(raw, &FilterSet::empty()).fingerprint()
    }

    fn transition(contact_id: Uuid, stage: LeadStage, key: &str) -> StageTransition {
        StageTransition {
            contact_id,
            stage,
            reason: "policy intent".into(),
            extracted_info: Some("+21612345678".into()),
            change_key: key.into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_contact_is_idempotent() {
        let db = backend().await;
        let first = db.upsert_contact(&Contact::new("acct", "Amira")).await.unwrap();
        let second = db.upsert_contact(&Contact::new("acct", "Amira")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.state, ConversationState::New);
        assert!(first.fingerprint.is_none());

        let other_account = db.upsert_contact(&Contact::new("other", "Amira")).await.unwrap();
        assert_ne!(other_account.id, first.id);
    }

    #[tokio::test]
    async fn persist_fingerprint_roundtrip_clears_pending() {
        let db = backend().await;
        let c = db.upsert_contact(&Contact::new("acct", "Yassine")).await.unwrap();
        let fp = fingerprint(&["hi", "price?"]);

        db.save_pending_decision(
            c.id,
            &PendingDecision {
                change_hash: fp.hash.clone(),
                decision: PolicyDecision::reply("It's 40 TND"),
            },
        )
        .await
        .unwrap();
        let loaded = db.get_contact("acct", "Yassine").await.unwrap().unwrap();
        let pending = loaded.pending.unwrap();
        assert_eq!(pending.change_hash, fp.hash);
        assert_eq!(pending.decision.reply_text, "It's 40 TND");

        db.persist_fingerprint(c.id, &fp, ConversationState::Waiting)
            .await
            .unwrap();
        let loaded = db.get_contact("acct", "Yassine").await.unwrap().unwrap();
        assert_eq!(loaded.fingerprint, Some(fp));
        assert_eq!(loaded.state, ConversationState::Waiting);
        assert!(loaded.pending.is_none());
    }

    #[tokio::test]
    async fn persist_fingerprint_unknown_contact_is_not_found() {
        let db = backend().await;
        let err = db
            .persist_fingerprint(Uuid::new_v4(), &fingerprint(&["x"]), ConversationState::Waiting)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn stage_transition_recorded_once_per_change() {
        let db = backend().await;
        let c = db.upsert_contact(&Contact::new("acct", "Sonia")).await.unwrap();

        assert!(db
            .persist_stage_transition(&transition(c.id, LeadStage::CtaPhone, "hash-a"))
            .await
            .unwrap());
        assert!(!db
            .persist_stage_transition(&transition(c.id, LeadStage::CtaPhone, "hash-a"))
            .await
            .unwrap());
        assert!(db
            .persist_stage_transition(&transition(c.id, LeadStage::ContactInfoCaptured, "hash-b"))
            .await
            .unwrap());

        let all = db.list_stage_transitions(c.id).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].stage, LeadStage::CtaPhone);
        assert_eq!(all[0].extracted_info.as_deref(), Some("+21612345678"));

        let loaded = db.get_contact("acct", "Sonia").await.unwrap().unwrap();
        assert_eq!(loaded.lead_stage, Some(LeadStage::ContactInfoCaptured));
    }

    #[tokio::test]
    async fn stage_transition_for_unknown_contact_leaves_nothing_behind() {
        let db = backend().await;
        let ghost = Uuid::new_v4();
        let err = db
            .persist_stage_transition(&transition(ghost, LeadStage::Interested, "h1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
        assert!(db.list_stage_transitions(ghost).await.unwrap().is_empty());

        // The connection is usable again after the rollback.
        let c = db.upsert_contact(&Contact::new("acct", "Lina")).await.unwrap();
        assert!(db
            .persist_stage_transition(&transition(c.id, LeadStage::Interested, "h1"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn active_contacts_exclude_dormant_and_stale() {
        let db = backend().await;
        let live = db.upsert_contact(&Contact::new("acct", "live")).await.unwrap();
        let ended = db.upsert_contact(&Contact::new("acct", "ended")).await.unwrap();
        let mut stale = Contact::new("acct", "stale");
        stale.last_activity = Utc::now() - chrono::Duration::hours(5);
        db.upsert_contact(&stale).await.unwrap();

        db.persist_fingerprint(live.id, &fingerprint(&["a"]), ConversationState::NeedsReply)
            .await
            .unwrap();
        db.persist_fingerprint(ended.id, &fingerprint(&["b"]), ConversationState::Ended)
            .await
            .unwrap();

        let since = Utc::now() - chrono::Duration::hours(2);
        let active = db.list_active_contacts("acct", since).await.unwrap();
        let names: Vec<_> = active.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["live"]);
    }

    #[tokio::test]
    async fn needs_reply_stays_active_outside_window() {
        let db = backend().await;
        let mut owed = Contact::new("acct", "owed");
        owed.state = ConversationState::NeedsReply;
        owed.last_activity = Utc::now() - chrono::Duration::hours(3);
        db.upsert_contact(&owed).await.unwrap();
        let mut quiet = Contact::new("acct", "quiet");
        quiet.state = ConversationState::Waiting;
        quiet.last_activity = Utc::now() - chrono::Duration::hours(3);
        db.upsert_contact(&quiet).await.unwrap();

        let since = Utc::now() - chrono::Duration::hours(2);
        let active = db.list_active_contacts("acct", since).await.unwrap();
        let names: Vec<_> = active.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["owed"]);
    }

    #[tokio::test]
    async fn archive_sweeps_only_idle_waiting_or_ended() {
        let db = backend().await;
        let waiting = db.upsert_contact(&Contact::new("acct", "w")).await.unwrap();
        let needs = db.upsert_contact(&Contact::new("acct", "n")).await.unwrap();
        db.persist_fingerprint(waiting.id, &fingerprint(&["a"]), ConversationState::Waiting)
            .await
            .unwrap();
        db.persist_fingerprint(needs.id, &fingerprint(&["b"]), ConversationState::NeedsReply)
            .await
            .unwrap();

        let future = Utc::now() + chrono::Duration::minutes(1);
        assert_eq!(db.archive_inactive("acct", future).await.unwrap(), 1);

        let w = db.get_contact("acct", "w").await.unwrap().unwrap();
        let n = db.get_contact("acct", "n").await.unwrap().unwrap();
        assert_eq!(w.state, ConversationState::Archived);
        assert_eq!(n.state, ConversationState::NeedsReply);
    }

    #[tokio::test]
    async fn reset_removes_contact_and_history() {
        let db = backend().await;
        let c = db.upsert_contact(&Contact::new("acct", "Karim")).await.unwrap();
        db.persist_stage_transition(&transition(c.id, LeadStage::Interested, "k"))
            .await
            .unwrap();

        assert!(db.reset_contact("acct", "Karim").await.unwrap());
        assert!(db.get_contact("acct", "Karim").await.unwrap().is_none());
        assert!(db.list_stage_transitions(c.id).await.unwrap().is_empty());
        assert!(!db.reset_contact("acct", "Karim").await.unwrap());
    }

    #[tokio::test]
    async fn lead_link_and_fetch() {
        let db = backend().await;
        let mut lead = Lead::new("Looking for a wedding photographer in Sousse");
        lead.offering = Some("photo package".into());
        db.upsert_lead(&lead).await.unwrap();

        let c = db.upsert_contact(&Contact::new("acct", "Nour")).await.unwrap();
        db.link_lead(c.id, lead.id).await.unwrap();

        let loaded = db.get_contact("acct", "Nour").await.unwrap().unwrap();
        assert_eq!(loaded.lead_id, Some(lead.id));
        let fetched = db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(fetched.offering.as_deref(), Some("photo package"));
        assert!(fetched.post_url.is_none());
        assert!(db.get_lead(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_backed_database_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("autopilot.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.upsert_contact(&Contact::new("acct", "Lina")).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_contact("acct", "Lina").await.unwrap().is_some());
    }
}
