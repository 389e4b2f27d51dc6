//! Schema history of the contact store.
//!
//! V1 contacts and leads, V2 stage transitions keyed by change, V3 the
//! pending-decision columns used for send retries.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                name TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'new',
                fp_hash TEXT,
                fp_inbound INTEGER,
                fp_outbound INTEGER,
                last_activity TEXT NOT NULL,
                lead_id TEXT,
                lead_stage TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (account_id, name)
            );
            CREATE INDEX IF NOT EXISTS idx_contacts_account_state ON contacts(account_id, state);
            CREATE INDEX IF NOT EXISTS idx_contacts_last_activity ON contacts(last_activity);

            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                post_text TEXT NOT NULL,
                post_url TEXT,
                offering TEXT,
                created_at TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        name: "stage_transitions",
        sql: r#"
            CREATE TABLE IF NOT EXISTS stage_transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                contact_id TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
                stage TEXT NOT NULL,
                reason TEXT NOT NULL,
                extracted_info TEXT,
                change_key TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (contact_id, change_key)
            );
            CREATE INDEX IF NOT EXISTS idx_stage_transitions_contact ON stage_transitions(contact_id);
        "#,
    },
    Migration {
        version: 3,
        name: "pending_decisions",
        sql: r#"
            ALTER TABLE contacts ADD COLUMN pending_hash TEXT;
            ALTER TABLE contacts ADD COLUMN pending_decision TEXT;
        "#,
    },
];

/// Bring the contact store schema up to the latest version.
///
/// Applied versions are recorded in `_migrations`. Each pending migration
/// runs in its own transaction together with its version record, so a
/// failed step (V3's two `ALTER TABLE`s, say) can simply be retried.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("create _migrations: {e}")))?;

    let from = current_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > from).collect();
    if pending.is_empty() {
        tracing::debug!(version = from, "Contact store schema up to date");
        return Ok(());
    }

    for migration in pending {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        apply(conn, migration).await?;
    }

    let to = current_version(conn).await?;
    tracing::info!(from, to, "Contact store schema migrated");
    Ok(())
}

/// Run one migration and record it, atomically.
async fn apply(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    let failed = |step: &str, e: libsql::Error| {
        DatabaseError::Migration(format!(
            "V{} ({}) {step}: {e}",
            migration.version, migration.name
        ))
    };

    let tx = conn.transaction().await.map_err(|e| failed("begin", e))?;
    tx.execute_batch(migration.sql)
        .await
        .map_err(|e| failed("failed", e))?;
    tx.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![migration.version, migration.name],
    )
    .await
    .map_err(|e| failed("record", e))?;
    tx.commit().await.map_err(|e| failed("commit", e))?;
    Ok(())
}

/// Highest applied version; 0 on a fresh database.
async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("read schema version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("parse schema version: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Migration(format!("read schema version: {e}"))),
    }
}
