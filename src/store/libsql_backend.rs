//! libSQL backend — async `Store` trait implementation.
//!
//! Single connection reused for all operations; `libsql::Connection` is
//! `Send + Sync` and safe for concurrent async use. Claims are expressed
//! as `INSERT OR IGNORE` against the partial unique indexes created in
//! the migrations, with the affected-row count deciding who won.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;
use uuid::Uuid;

use crate::capacity::CapacityMode;
use crate::error::DatabaseError;
use crate::model::{
    AccountStatus, Campaign, CampaignSettings, CampaignStatus, EmailAccount, EventType, Lead,
    LeadStatus, Reminder, ReminderStatus, SendingEvent, SequenceStep, Variant,
};
use crate::store::migrations;
use crate::store::traits::{CampaignCounter, Store};

/// libSQL store backend.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn query_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
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

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("Bad UUID '{s}': {e}")))
}

fn parse_optional_uuid(s: Option<String>) -> Result<Option<Uuid>, DatabaseError> {
    s.map(|s| parse_uuid(&s)).transpose()
}

fn rfc3339(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

const ACCOUNT_COLUMNS: &str = "id, address, display_name, smtp_host, smtp_port, imap_host, \
     imap_port, username, password, status, error_message, daily_limit, sent_today, \
     warmup_enabled, warmup_current_day, warmup_daily_increase, warmup_max_per_day, \
     warmup_sent_today, last_reset_date, last_synced_at, created_at, updated_at";

fn row_to_account(row: &libsql::Row) -> Result<EmailAccount, DatabaseError> {
    let id: String = row.get(0).map_err(query_err)?;
    let status_str: String = row.get(9).map_err(query_err)?;
    let last_reset: Option<String> = row.get::<String>(18).ok();
    let last_synced: Option<String> = row.get::<String>(19).ok();
    let created: String = row.get(20).map_err(query_err)?;
    let updated: String = row.get(21).map_err(query_err)?;

    Ok(EmailAccount {
        id: parse_uuid(&id)?,
        address: row.get(1).map_err(query_err)?,
        display_name: row.get(2).map_err(query_err)?,
        smtp_host: row.get(3).map_err(query_err)?,
        smtp_port: row.get::<i64>(4).map_err(query_err)? as u16,
        imap_host: row.get(5).map_err(query_err)?,
        imap_port: row.get::<i64>(6).map_err(query_err)? as u16,
        username: row.get(7).map_err(query_err)?,
        password: SecretString::from(row.get::<String>(8).map_err(query_err)?),
        status: status_str.parse().unwrap_or(AccountStatus::Error),
        error_message: row.get::<String>(10).ok(),
        daily_limit: row.get::<i64>(11).map_err(query_err)? as u32,
        sent_today: row.get::<i64>(12).map_err(query_err)? as u32,
        warmup_enabled: row.get::<i64>(13).map_err(query_err)? != 0,
        warmup_current_day: row.get::<i64>(14).map_err(query_err)? as u32,
        warmup_daily_increase: row.get::<i64>(15).map_err(query_err)? as u32,
        warmup_max_per_day: row.get::<i64>(16).map_err(query_err)? as u32,
        warmup_sent_today: row.get::<i64>(17).map_err(query_err)? as u32,
        last_reset_date: last_reset.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
        last_synced_at: parse_optional_datetime(last_synced),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

const CAMPAIGN_COLUMNS: &str = "id, name, status, settings, last_account_index, sent_count, \
     reply_count, bounce_count, created_at, updated_at";

fn row_to_campaign(row: &libsql::Row) -> Result<Campaign, DatabaseError> {
    let id: String = row.get(0).map_err(query_err)?;
    let status_str: String = row.get(2).map_err(query_err)?;
    let settings_str: String = row.get(3).map_err(query_err)?;
    let created: String = row.get(8).map_err(query_err)?;
    let updated: String = row.get(9).map_err(query_err)?;

    let settings: CampaignSettings =
        serde_json::from_str(&settings_str).unwrap_or_default();

    Ok(Campaign {
        id: parse_uuid(&id)?,
        name: row.get(1).map_err(query_err)?,
        status: status_str.parse().unwrap_or(CampaignStatus::Draft),
        settings,
        last_account_index: row.get::<i64>(4).map_err(query_err)? as u32,
        sent_count: row.get::<i64>(5).map_err(query_err)? as u64,
        reply_count: row.get::<i64>(6).map_err(query_err)? as u64,
        bounce_count: row.get::<i64>(7).map_err(query_err)? as u64,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

const LEAD_COLUMNS: &str = "id, campaign_id, email, first_name, last_name, company, \
     custom_fields, status, current_step, last_contacted_at, created_at";

fn row_to_lead(row: &libsql::Row) -> Result<Lead, DatabaseError> {
    let id: String = row.get(0).map_err(query_err)?;
    let campaign_id: String = row.get(1).map_err(query_err)?;
    let custom_str: String = row.get(6).map_err(query_err)?;
    let status_str: String = row.get(7).map_err(query_err)?;
    let contacted: Option<String> = row.get::<String>(9).ok();
    let created: String = row.get(10).map_err(query_err)?;

    Ok(Lead {
        id: parse_uuid(&id)?,
        campaign_id: parse_uuid(&campaign_id)?,
        email: row.get(2).map_err(query_err)?,
        first_name: row.get(3).map_err(query_err)?,
        last_name: row.get(4).map_err(query_err)?,
        company: row.get(5).map_err(query_err)?,
        custom_fields: serde_json::from_str(&custom_str).unwrap_or_default(),
        status: status_str.parse().unwrap_or(LeadStatus::New),
        current_step: row.get::<i64>(8).map_err(query_err)? as u32,
        last_contacted_at: parse_optional_datetime(contacted),
        created_at: parse_datetime(&created),
    })
}

const EVENT_COLUMNS: &str = "id, event_type, lead_id, campaign_id, account_id, \
     sequence_step_id, transport_message_id, external_message_id, metadata, created_at";

fn row_to_event(row: &libsql::Row) -> Result<SendingEvent, DatabaseError> {
    let id: String = row.get(0).map_err(query_err)?;
    let type_str: String = row.get(1).map_err(query_err)?;
    let metadata_str: String = row.get(8).map_err(query_err)?;
    let created: String = row.get(9).map_err(query_err)?;

    Ok(SendingEvent {
        id: parse_uuid(&id)?,
        event_type: type_str
            .parse()
            .map_err(DatabaseError::Serialization)?,
        lead_id: parse_optional_uuid(row.get::<String>(2).ok())?,
        campaign_id: parse_optional_uuid(row.get::<String>(3).ok())?,
        account_id: parse_optional_uuid(row.get::<String>(4).ok())?,
        sequence_step_id: parse_optional_uuid(row.get::<String>(5).ok())?,
        transport_message_id: row.get::<String>(6).ok(),
        external_message_id: row.get::<String>(7).ok(),
        metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::Value::Null),
        created_at: parse_datetime(&created),
    })
}

fn row_to_reminder(row: &libsql::Row) -> Result<Reminder, DatabaseError> {
    let id: String = row.get(0).map_err(query_err)?;
    let status_str: String = row.get(5).map_err(query_err)?;
    let remind_at: String = row.get(4).map_err(query_err)?;
    let created: String = row.get(6).map_err(query_err)?;

    Ok(Reminder {
        id: parse_uuid(&id)?,
        user_id: row.get(1).map_err(query_err)?,
        lead_id: parse_optional_uuid(row.get::<String>(2).ok())?,
        message: row.get(3).map_err(query_err)?,
        remind_at: parse_datetime(&remind_at),
        status: status_str.parse().unwrap_or(ReminderStatus::Pending),
        created_at: parse_datetime(&created),
    })
}

impl LibSqlStore {
    /// Insert an event row, optionally letting the claim indexes reject
    /// duplicates. Returns the number of rows written (0 = claim lost).
    async fn insert_event_row(
        &self,
        or_ignore: bool,
        event: &SendingEvent,
    ) -> Result<u64, DatabaseError> {
        let verb = if or_ignore {
            "INSERT OR IGNORE"
        } else {
            "INSERT"
        };
        self.conn()
            .execute(
                &format!(
                    "{verb} INTO sending_events ({EVENT_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    event.id.to_string(),
                    event.event_type.to_string(),
                    event.lead_id.map(|u| u.to_string()),
                    event.campaign_id.map(|u| u.to_string()),
                    event.account_id.map(|u| u.to_string()),
                    event.sequence_step_id.map(|u| u.to_string()),
                    event.transport_message_id.clone(),
                    event.external_message_id.clone(),
                    event.metadata.to_string(),
                    rfc3339(&event.created_at),
                ],
            )
            .await
            .map_err(query_err)
    }
}

// ── Store implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Accounts ────────────────────────────────────────────────────

    async fn insert_account(&self, account: &EmailAccount) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO email_accounts ({ACCOUNT_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                      ?16, ?17, ?18, ?19, ?20, ?21, ?22)"
                ),
                params![
                    account.id.to_string(),
                    account.address.clone(),
                    account.display_name.clone(),
                    account.smtp_host.clone(),
                    i64::from(account.smtp_port),
                    account.imap_host.clone(),
                    i64::from(account.imap_port),
                    account.username.clone(),
                    account.password.expose_secret(),
                    account.status.to_string(),
                    account.error_message.clone(),
                    i64::from(account.daily_limit),
                    i64::from(account.sent_today),
                    i64::from(account.warmup_enabled),
                    i64::from(account.warmup_current_day),
                    i64::from(account.warmup_daily_increase),
                    i64::from(account.warmup_max_per_day),
                    i64::from(account.warmup_sent_today),
                    account.last_reset_date.map(|d| d.to_string()),
                    account.last_synced_at.as_ref().map(rfc3339),
                    rfc3339(&account.created_at),
                    rfc3339(&account.updated_at),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<EmailAccount>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM email_accounts WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_account(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_accounts(&self) -> Result<Vec<EmailAccount>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM email_accounts ORDER BY created_at, id"),
                (),
            )
            .await
            .map_err(query_err)?;

        let mut accounts = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            accounts.push(row_to_account(&row)?);
        }
        Ok(accounts)
    }

    async fn list_warmup_accounts(&self) -> Result<Vec<EmailAccount>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM email_accounts \
                     WHERE status = 'active' AND warmup_enabled = 1 \
                     ORDER BY created_at, id"
                ),
                (),
            )
            .await
            .map_err(query_err)?;

        let mut accounts = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            accounts.push(row_to_account(&row)?);
        }
        Ok(accounts)
    }

    async fn list_errored_accounts(
        &self,
        limit: usize,
    ) -> Result<Vec<EmailAccount>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM email_accounts \
                     WHERE status = 'error' ORDER BY updated_at ASC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(query_err)?;

        let mut accounts = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            accounts.push(row_to_account(&row)?);
        }
        Ok(accounts)
    }

    async fn update_account_status(
        &self,
        id: Uuid,
        status: AccountStatus,
        error_message: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let message = match status {
            AccountStatus::Active => None,
            AccountStatus::Error => error_message,
        };
        self.conn()
            .execute(
                "UPDATE email_accounts SET status = ?1, error_message = ?2, \
                 updated_at = ?3 WHERE id = ?4",
                params![
                    status.to_string(),
                    message,
                    rfc3339(&Utc::now()),
                    id.to_string()
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn increment_send_counter(
        &self,
        id: Uuid,
        mode: CapacityMode,
    ) -> Result<(), DatabaseError> {
        let sql = match mode {
            CapacityMode::Regular => {
                "UPDATE email_accounts SET sent_today = sent_today + 1, updated_at = ?1 \
                 WHERE id = ?2"
            }
            CapacityMode::Warmup => {
                "UPDATE email_accounts SET warmup_sent_today = warmup_sent_today + 1, \
                 updated_at = ?1 WHERE id = ?2"
            }
        };
        self.conn()
            .execute(sql, params![rfc3339(&Utc::now()), id.to_string()])
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn reset_daily_counters(&self, today: NaiveDate) -> Result<u64, DatabaseError> {
        // Single statement so the reset stays idempotent under overlapping
        // invocations: accounts already stamped with today's date are
        // untouched. Ramp day only advances while below the cap.
        let affected = self
            .conn()
            .execute(
                "UPDATE email_accounts SET \
                     sent_today = 0, \
                     warmup_sent_today = 0, \
                     warmup_current_day = warmup_current_day + \
                         (CASE WHEN warmup_enabled = 1 \
                               AND warmup_current_day * warmup_daily_increase < warmup_max_per_day \
                          THEN 1 ELSE 0 END), \
                     last_reset_date = ?1, \
                     updated_at = ?2 \
                 WHERE last_reset_date IS NULL OR last_reset_date <> ?1",
                params![today.to_string(), rfc3339(&Utc::now())],
            )
            .await
            .map_err(query_err)?;
        Ok(affected)
    }

    async fn accounts_due_inbound_check(
        &self,
        limit: usize,
    ) -> Result<Vec<EmailAccount>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM email_accounts \
                     WHERE status = 'active' \
                     ORDER BY last_synced_at ASC NULLS FIRST \
                     LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(query_err)?;

        let mut accounts = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            accounts.push(row_to_account(&row)?);
        }
        Ok(accounts)
    }

    async fn set_mailbox_checkpoint(
        &self,
        id: Uuid,
        checkpoint: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE email_accounts SET last_synced_at = ?1, updated_at = ?2 WHERE id = ?3",
                params![rfc3339(&checkpoint), rfc3339(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── Campaigns ───────────────────────────────────────────────────

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), DatabaseError> {
        let settings = serde_json::to_string(&campaign.settings)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO campaigns ({CAMPAIGN_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    campaign.id.to_string(),
                    campaign.name.clone(),
                    campaign.status.to_string(),
                    settings,
                    i64::from(campaign.last_account_index),
                    campaign.sent_count as i64,
                    campaign.reply_count as i64,
                    campaign.bounce_count as i64,
                    rfc3339(&campaign.created_at),
                    rfc3339(&campaign.updated_at),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_campaign(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_active_campaigns(&self) -> Result<Vec<Campaign>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CAMPAIGN_COLUMNS} FROM campaigns \
                     WHERE status = 'active' ORDER BY created_at, id"
                ),
                (),
            )
            .await
            .map_err(query_err)?;

        let mut campaigns = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            campaigns.push(row_to_campaign(&row)?);
        }
        Ok(campaigns)
    }

    async fn update_campaign_status(
        &self,
        id: Uuid,
        status: CampaignStatus,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE campaigns SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.to_string(), rfc3339(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn set_rotation_index(&self, id: Uuid, index: u32) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE campaigns SET last_account_index = ?1, updated_at = ?2 WHERE id = ?3",
                params![i64::from(index), rfc3339(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn bump_campaign_counter(
        &self,
        id: Uuid,
        counter: CampaignCounter,
    ) -> Result<(), DatabaseError> {
        let sql = match counter {
            CampaignCounter::Sent => {
                "UPDATE campaigns SET sent_count = sent_count + 1, updated_at = ?1 WHERE id = ?2"
            }
            CampaignCounter::Replies => {
                "UPDATE campaigns SET reply_count = reply_count + 1, updated_at = ?1 WHERE id = ?2"
            }
            CampaignCounter::Bounces => {
                "UPDATE campaigns SET bounce_count = bounce_count + 1, updated_at = ?1 \
                 WHERE id = ?2"
            }
        };
        self.conn()
            .execute(sql, params![rfc3339(&Utc::now()), id.to_string()])
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn assign_account(
        &self,
        campaign_id: Uuid,
        account_id: Uuid,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO campaign_accounts (campaign_id, account_id) \
                 VALUES (?1, ?2)",
                params![campaign_id.to_string(), account_id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn campaign_account_ids(&self, campaign_id: Uuid) -> Result<Vec<Uuid>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT account_id FROM campaign_accounts \
                 WHERE campaign_id = ?1 ORDER BY assigned_at, account_id",
                params![campaign_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let id: String = row.get(0).map_err(query_err)?;
            ids.push(parse_uuid(&id)?);
        }
        Ok(ids)
    }

    async fn insert_sequence_step(&self, step: &SequenceStep) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO sequence_steps (id, campaign_id, position, day_gap, subject, body) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    step.id.to_string(),
                    step.campaign_id.to_string(),
                    i64::from(step.position),
                    i64::from(step.day_gap),
                    step.subject.clone(),
                    step.body.clone(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn insert_variant(&self, variant: &Variant) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO variants (id, step_id, subject, body, weight, enabled) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    variant.id.to_string(),
                    variant.step_id.to_string(),
                    variant.subject.clone(),
                    variant.body.clone(),
                    i64::from(variant.weight),
                    i64::from(variant.enabled),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn sequence_steps(&self, campaign_id: Uuid) -> Result<Vec<SequenceStep>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, campaign_id, position, day_gap, subject, body \
                 FROM sequence_steps WHERE campaign_id = ?1 ORDER BY position",
                params![campaign_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let mut steps = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let id: String = row.get(0).map_err(query_err)?;
            let cid: String = row.get(1).map_err(query_err)?;
            steps.push(SequenceStep {
                id: parse_uuid(&id)?,
                campaign_id: parse_uuid(&cid)?,
                position: row.get::<i64>(2).map_err(query_err)? as u32,
                day_gap: row.get::<i64>(3).map_err(query_err)? as u32,
                subject: row.get(4).map_err(query_err)?,
                body: row.get(5).map_err(query_err)?,
                variants: Vec::new(),
            });
        }

        for step in &mut steps {
            let mut rows = self
                .conn()
                .query(
                    "SELECT id, step_id, subject, body, weight, enabled \
                     FROM variants WHERE step_id = ?1 ORDER BY rowid",
                    params![step.id.to_string()],
                )
                .await
                .map_err(query_err)?;

            while let Some(row) = rows.next().await.map_err(query_err)? {
                let id: String = row.get(0).map_err(query_err)?;
                let sid: String = row.get(1).map_err(query_err)?;
                step.variants.push(Variant {
                    id: parse_uuid(&id)?,
                    step_id: parse_uuid(&sid)?,
                    subject: row.get(2).map_err(query_err)?,
                    body: row.get(3).map_err(query_err)?,
                    weight: row.get::<i64>(4).map_err(query_err)? as u32,
                    enabled: row.get::<i64>(5).map_err(query_err)? != 0,
                });
            }
        }

        Ok(steps)
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError> {
        let custom = serde_json::to_string(&lead.custom_fields)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO leads ({LEAD_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    lead.id.to_string(),
                    lead.campaign_id.to_string(),
                    lead.email.clone(),
                    lead.first_name.clone(),
                    lead.last_name.clone(),
                    lead.company.clone(),
                    custom,
                    lead.status.to_string(),
                    i64::from(lead.current_step),
                    lead.last_contacted_at.as_ref().map(rfc3339),
                    rfc3339(&lead.created_at),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_lead(&row)?)),
            None => Ok(None),
        }
    }

    async fn selectable_leads(
        &self,
        campaign_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LEAD_COLUMNS} FROM leads \
                     WHERE campaign_id = ?1 AND status IN ('new', 'contacted') \
                     ORDER BY created_at, id LIMIT ?2"
                ),
                params![campaign_id.to_string(), limit as i64],
            )
            .await
            .map_err(query_err)?;

        let mut leads = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            leads.push(row_to_lead(&row)?);
        }
        Ok(leads)
    }

    async fn advance_lead(
        &self,
        id: Uuid,
        current_step: u32,
        status: LeadStatus,
        contacted_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE leads SET current_step = ?1, status = ?2, last_contacted_at = ?3 \
                 WHERE id = ?4",
                params![
                    i64::from(current_step),
                    status.to_string(),
                    rfc3339(&contacted_at),
                    id.to_string(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn update_lead_status(&self, id: Uuid, status: LeadStatus) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE leads SET status = ?1 WHERE id = ?2",
                params![status.to_string(), id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn find_lead_by_email(&self, email: &str) -> Result<Option<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LEAD_COLUMNS} FROM leads WHERE email = ?1 COLLATE NOCASE \
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![email],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_lead(&row)?)),
            None => Ok(None),
        }
    }

    async fn count_leads(&self, campaign_id: Uuid) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM leads WHERE campaign_id = ?1",
                params![campaign_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(query_err)? as u64),
            None => Ok(0),
        }
    }

    async fn delete_lead(&self, id: Uuid, reason: &str) -> Result<(), DatabaseError> {
        let lead = self
            .get_lead(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "lead".to_string(),
                id: id.to_string(),
            })?;

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        tx.execute(
            "INSERT OR IGNORE INTO blocklist (email, reason) VALUES (?1, ?2)",
            params![lead.email.clone(), reason],
        )
        .await
        .map_err(query_err)?;

        tx.execute("DELETE FROM leads WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn is_blocklisted(&self, email: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM blocklist WHERE email = ?1 COLLATE NOCASE LIMIT 1",
                params![email],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.is_some())
    }

    // ── Sending events ──────────────────────────────────────────────

    async fn claim_sent_event(&self, event: &SendingEvent) -> Result<bool, DatabaseError> {
        Ok(self.insert_event_row(true, event).await? == 1)
    }

    async fn release_sent_claim(
        &self,
        lead_id: Uuid,
        sequence_step_id: Uuid,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM sending_events \
                 WHERE event_type = 'sent' AND lead_id = ?1 AND sequence_step_id = ?2",
                params![lead_id.to_string(), sequence_step_id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn claim_inbound_event(&self, event: &SendingEvent) -> Result<bool, DatabaseError> {
        if event.external_message_id.is_none() {
            return Err(DatabaseError::Constraint(
                "Inbound claim requires an external_message_id".to_string(),
            ));
        }
        Ok(self.insert_event_row(true, event).await? == 1)
    }

    async fn record_event(&self, event: &SendingEvent) -> Result<(), DatabaseError> {
        self.insert_event_row(false, event).await?;
        Ok(())
    }

    async fn set_event_transport_message_id(
        &self,
        event_id: Uuid,
        transport_message_id: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE sending_events SET transport_message_id = ?1 WHERE id = ?2",
                params![transport_message_id, event_id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn has_sent_event(
        &self,
        lead_id: Uuid,
        sequence_step_id: Uuid,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM sending_events \
                 WHERE event_type = 'sent' AND lead_id = ?1 AND sequence_step_id = ?2 LIMIT 1",
                params![lead_id.to_string(), sequence_step_id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.is_some())
    }

    async fn find_sent_event_by_transport_message_id(
        &self,
        transport_message_id: &str,
    ) -> Result<Option<SendingEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM sending_events \
                     WHERE event_type = 'sent' AND transport_message_id = ?1 \
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![transport_message_id],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_event(&row)?)),
            None => Ok(None),
        }
    }

    async fn count_events(
        &self,
        campaign_id: Uuid,
        event_type: EventType,
    ) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM sending_events \
                 WHERE campaign_id = ?1 AND event_type = ?2",
                params![campaign_id.to_string(), event_type.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(query_err)? as u64),
            None => Ok(0),
        }
    }

    // ── Engine state ────────────────────────────────────────────────

    async fn advance_phase_cursor(&self, num_phases: u32) -> Result<u32, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "UPDATE engine_state SET phase_cursor = (phase_cursor + 1) % ?1 \
                 WHERE id = 1 RETURNING phase_cursor",
                params![i64::from(num_phases)],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(query_err)? as u32),
            None => Err(DatabaseError::NotFound {
                entity: "engine_state".to_string(),
                id: "1".to_string(),
            }),
        }
    }

    // ── Reminders ───────────────────────────────────────────────────

    async fn insert_reminder(&self, reminder: &Reminder) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO reminders (id, user_id, lead_id, message, remind_at, status, \
                 created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    reminder.id.to_string(),
                    reminder.user_id.clone(),
                    reminder.lead_id.map(|u| u.to_string()),
                    reminder.message.clone(),
                    rfc3339(&reminder.remind_at),
                    reminder.status.to_string(),
                    rfc3339(&reminder.created_at),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn due_reminders(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reminder>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, user_id, lead_id, message, remind_at, status, created_at \
                 FROM reminders WHERE status = 'pending' AND remind_at <= ?1 \
                 ORDER BY remind_at, id LIMIT ?2",
                params![rfc3339(&now), limit as i64],
            )
            .await
            .map_err(query_err)?;

        let mut reminders = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            reminders.push(row_to_reminder(&row)?);
        }
        Ok(reminders)
    }

    async fn update_reminder_status(
        &self,
        id: Uuid,
        status: ReminderStatus,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE reminders SET status = ?1 WHERE id = ?2",
                params![status.to_string(), id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_datetime_accepts_rfc3339_and_sqlite_formats() {
        let rfc = parse_datetime("2026-08-06T10:30:00+00:00");
        assert_eq!(rfc.to_rfc3339(), "2026-08-06T10:30:00+00:00");

        let sqlite = parse_datetime("2026-08-06 10:30:00");
        assert_eq!(sqlite, rfc);
    }

    #[test]
    fn parse_datetime_garbage_falls_back_to_min() {
        assert_eq!(parse_datetime("not a date"), DateTime::<Utc>::MIN_UTC);
    }

    #[tokio::test]
    async fn account_round_trip() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let mut account = EmailAccount::new("sender@example.com", SecretString::from("secret"));
        account.smtp_host = "smtp.example.com".to_string();
        account.imap_host = "imap.example.com".to_string();
        account.daily_limit = 25;
        store.insert_account(&account).await.unwrap();

        let loaded = store.get_account(account.id).await.unwrap().unwrap();
        assert_eq!(loaded.address, "sender@example.com");
        assert_eq!(loaded.daily_limit, 25);
        assert_eq!(loaded.status, AccountStatus::Active);
        assert_eq!(loaded.password.expose_secret(), "secret");
    }

    #[tokio::test]
    async fn sent_claim_is_unique_per_lead_and_step() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let account = EmailAccount::new("a@x.com", SecretString::from("pw"));
        let campaign = Campaign::new("c");
        let step = SequenceStep::new(campaign.id, 1, "s", "b");
        let lead = Lead::new(campaign.id, "l@x.com");

        let first = SendingEvent::sent_claim(&lead, &step, &account);
        let second = SendingEvent::sent_claim(&lead, &step, &account);

        assert!(store.claim_sent_event(&first).await.unwrap());
        assert!(!store.claim_sent_event(&second).await.unwrap());
        assert!(store.has_sent_event(lead.id, step.id).await.unwrap());
    }

    #[tokio::test]
    async fn released_claim_can_be_retaken() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let account = EmailAccount::new("a@x.com", SecretString::from("pw"));
        let campaign = Campaign::new("c");
        let step = SequenceStep::new(campaign.id, 1, "s", "b");
        let lead = Lead::new(campaign.id, "l@x.com");

        let claim = SendingEvent::sent_claim(&lead, &step, &account);
        assert!(store.claim_sent_event(&claim).await.unwrap());
        store.release_sent_claim(lead.id, step.id).await.unwrap();

        let retry = SendingEvent::sent_claim(&lead, &step, &account);
        assert!(store.claim_sent_event(&retry).await.unwrap());
    }

    #[tokio::test]
    async fn inbound_claim_deduplicates_by_message_identity() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let mut event = SendingEvent::new(EventType::Reply);
        event.external_message_id = Some("<abc@mail>".to_string());

        let mut dup = SendingEvent::new(EventType::Reply);
        dup.external_message_id = Some("<abc@mail>".to_string());

        assert!(store.claim_inbound_event(&event).await.unwrap());
        assert!(!store.claim_inbound_event(&dup).await.unwrap());
    }

    #[tokio::test]
    async fn phase_cursor_wraps_modulo_phase_count() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(store.advance_phase_cursor(5).await.unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 0, 1]);
    }

    #[tokio::test]
    async fn daily_reset_is_idempotent_within_a_day() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let mut account = EmailAccount::new("a@x.com", SecretString::from("pw"));
        account.sent_today = 9;
        account.warmup_enabled = true;
        account.warmup_sent_today = 4;
        account.warmup_current_day = 2;
        account.warmup_daily_increase = 3;
        account.warmup_max_per_day = 30;
        store.insert_account(&account).await.unwrap();

        let today = Utc::now().date_naive();
        assert_eq!(store.reset_daily_counters(today).await.unwrap(), 1);
        assert_eq!(store.reset_daily_counters(today).await.unwrap(), 0);

        let loaded = store.get_account(account.id).await.unwrap().unwrap();
        assert_eq!(loaded.sent_today, 0);
        assert_eq!(loaded.warmup_sent_today, 0);
        assert_eq!(loaded.warmup_current_day, 3);
        assert_eq!(loaded.last_reset_date, Some(today));
    }

    #[tokio::test]
    async fn deleting_a_lead_records_a_blocklist_entry() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let campaign = Campaign::new("c");
        store.insert_campaign(&campaign).await.unwrap();
        let lead = Lead::new(campaign.id, "gone@example.com");
        store.insert_lead(&lead).await.unwrap();

        store.delete_lead(lead.id, "unsubscribed").await.unwrap();

        assert!(store.get_lead(lead.id).await.unwrap().is_none());
        assert!(store.is_blocklisted("gone@example.com").await.unwrap());
    }
}
