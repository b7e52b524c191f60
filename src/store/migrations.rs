//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

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
            CREATE TABLE IF NOT EXISTS email_accounts (
                id TEXT PRIMARY KEY,
                address TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL DEFAULT '',
                smtp_host TEXT NOT NULL,
                smtp_port INTEGER NOT NULL DEFAULT 587,
                imap_host TEXT NOT NULL,
                imap_port INTEGER NOT NULL DEFAULT 993,
                username TEXT NOT NULL,
                password TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                error_message TEXT,
                daily_limit INTEGER NOT NULL DEFAULT 50,
                sent_today INTEGER NOT NULL DEFAULT 0,
                warmup_enabled INTEGER NOT NULL DEFAULT 0,
                warmup_current_day INTEGER NOT NULL DEFAULT 1,
                warmup_daily_increase INTEGER NOT NULL DEFAULT 3,
                warmup_max_per_day INTEGER NOT NULL DEFAULT 30,
                warmup_sent_today INTEGER NOT NULL DEFAULT 0,
                last_reset_date TEXT,
                last_synced_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_accounts_status ON email_accounts(status);
            CREATE INDEX IF NOT EXISTS idx_accounts_sync ON email_accounts(last_synced_at);

            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft',
                settings TEXT NOT NULL DEFAULT '{}',
                last_account_index INTEGER NOT NULL DEFAULT 0,
                sent_count INTEGER NOT NULL DEFAULT 0,
                reply_count INTEGER NOT NULL DEFAULT 0,
                bounce_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_campaigns_status ON campaigns(status);

            CREATE TABLE IF NOT EXISTS campaign_accounts (
                campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
                account_id TEXT NOT NULL REFERENCES email_accounts(id) ON DELETE CASCADE,
                assigned_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (campaign_id, account_id)
            );

            CREATE TABLE IF NOT EXISTS sequence_steps (
                id TEXT PRIMARY KEY,
                campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                day_gap INTEGER NOT NULL DEFAULT 0,
                subject TEXT NOT NULL DEFAULT '',
                body TEXT NOT NULL DEFAULT '',
                UNIQUE (campaign_id, position)
            );

            CREATE TABLE IF NOT EXISTS variants (
                id TEXT PRIMARY KEY,
                step_id TEXT NOT NULL REFERENCES sequence_steps(id) ON DELETE CASCADE,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                weight INTEGER NOT NULL DEFAULT 100,
                enabled INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_variants_step ON variants(step_id);

            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
                email TEXT NOT NULL,
                first_name TEXT NOT NULL DEFAULT '',
                last_name TEXT NOT NULL DEFAULT '',
                company TEXT NOT NULL DEFAULT '',
                custom_fields TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'new',
                current_step INTEGER NOT NULL DEFAULT 0,
                last_contacted_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_leads_campaign_status ON leads(campaign_id, status);
            CREATE INDEX IF NOT EXISTS idx_leads_email ON leads(email);
            CREATE INDEX IF NOT EXISTS idx_leads_created ON leads(created_at);
        "#,
    },
    Migration {
        version: 2,
        name: "sending_events_and_claims",
        sql: r#"
            CREATE TABLE IF NOT EXISTS sending_events (
                id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                lead_id TEXT,
                campaign_id TEXT,
                account_id TEXT,
                sequence_step_id TEXT,
                transport_message_id TEXT,
                external_message_id TEXT,
                metadata TEXT NOT NULL DEFAULT 'null',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_campaign_type
                ON sending_events(campaign_id, event_type);
            CREATE INDEX IF NOT EXISTS idx_events_lead ON sending_events(lead_id);
            CREATE INDEX IF NOT EXISTS idx_events_transport_mid
                ON sending_events(transport_message_id);

            -- The two claim constraints the concurrency model relies on:
            -- at most one 'sent' row per (lead, step), at most one inbound
            -- row per inbound message identity.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_events_sent_claim
                ON sending_events(lead_id, sequence_step_id)
                WHERE event_type = 'sent';
            CREATE UNIQUE INDEX IF NOT EXISTS idx_events_inbound_claim
                ON sending_events(external_message_id)
                WHERE external_message_id IS NOT NULL;
        "#,
    },
    Migration {
        version: 3,
        name: "engine_state_reminders_blocklist",
        sql: r#"
            CREATE TABLE IF NOT EXISTS engine_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                phase_cursor INTEGER NOT NULL DEFAULT -1
            );
            INSERT OR IGNORE INTO engine_state (id, phase_cursor) VALUES (1, -1);

            CREATE TABLE IF NOT EXISTS reminders (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                lead_id TEXT,
                message TEXT NOT NULL,
                remind_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reminders_due ON reminders(status, remind_at);

            CREATE TABLE IF NOT EXISTS blocklist (
                email TEXT PRIMARY KEY,
                reason TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
        "#,
    },
];

/// Apply all migrations newer than the stored schema version.
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
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current = current_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration {} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;

        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| {
            DatabaseError::Migration(format!(
                "Failed to record migration {}: {e}",
                migration.version
            ))
        })?;

        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applied migration"
        );
    }

    Ok(())
}

async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read schema version: {e}")))?;

    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(e.to_string())),
        None => Ok(0),
    }
}
