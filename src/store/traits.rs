//! Unified `Store` trait — single async interface for all persistence.
//!
//! Beyond entity CRUD, the trait guarantees the two capabilities the
//! engine's concurrency model leans on: uniqueness-constrained claim
//! inserts (`claim_sent_event`, `claim_inbound_event`) and atomic cursor
//! advancement (`advance_phase_cursor`). Overlapping engine invocations
//! are safe because every "has this been done" decision goes through a
//! claim rather than a read-then-write.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::capacity::CapacityMode;
use crate::error::DatabaseError;
use crate::model::{
    AccountStatus, Campaign, CampaignStatus, EmailAccount, EventType, Lead, LeadStatus, Reminder,
    ReminderStatus, SendingEvent, SequenceStep, Variant,
};

/// Campaign aggregate counter bumped by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignCounter {
    Sent,
    Replies,
    Bounces,
}

/// Backend-agnostic persistence trait for the outreach engine.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Accounts ────────────────────────────────────────────────────

    async fn insert_account(&self, account: &EmailAccount) -> Result<(), DatabaseError>;

    async fn get_account(&self, id: Uuid) -> Result<Option<EmailAccount>, DatabaseError>;

    async fn list_accounts(&self) -> Result<Vec<EmailAccount>, DatabaseError>;

    /// Accounts eligible for warmup traffic: active with warmup enabled.
    async fn list_warmup_accounts(&self) -> Result<Vec<EmailAccount>, DatabaseError>;

    /// Errored accounts, least recently touched first, up to `limit`.
    /// Candidates for a verification retry.
    async fn list_errored_accounts(&self, limit: usize)
    -> Result<Vec<EmailAccount>, DatabaseError>;

    /// Flip account status; `error_message` is recorded on `Error` and
    /// cleared on `Active`.
    async fn update_account_status(
        &self,
        id: Uuid,
        status: AccountStatus,
        error_message: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Atomically increment the account's daily counter for `mode`.
    /// Applied only after a successful dispatch.
    async fn increment_send_counter(
        &self,
        id: Uuid,
        mode: CapacityMode,
    ) -> Result<(), DatabaseError>;

    /// Zero daily counters and advance the warmup ramp for accounts whose
    /// stored reset date is not `today`. Idempotent within a calendar day.
    /// Returns the number of accounts reset.
    async fn reset_daily_counters(&self, today: NaiveDate) -> Result<u64, DatabaseError>;

    /// Next accounts due an inbound mailbox check, oldest checkpoint first.
    async fn accounts_due_inbound_check(
        &self,
        limit: usize,
    ) -> Result<Vec<EmailAccount>, DatabaseError>;

    /// Advance the account's mailbox checkpoint. Called only after an
    /// inbound batch completes cleanly.
    async fn set_mailbox_checkpoint(
        &self,
        id: Uuid,
        checkpoint: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Campaigns ───────────────────────────────────────────────────

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), DatabaseError>;

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, DatabaseError>;

    async fn list_active_campaigns(&self) -> Result<Vec<Campaign>, DatabaseError>;

    async fn update_campaign_status(
        &self,
        id: Uuid,
        status: CampaignStatus,
    ) -> Result<(), DatabaseError>;

    /// Persist the campaign's account round-robin cursor.
    async fn set_rotation_index(&self, id: Uuid, index: u32) -> Result<(), DatabaseError>;

    /// Atomically bump a campaign aggregate counter.
    async fn bump_campaign_counter(
        &self,
        id: Uuid,
        counter: CampaignCounter,
    ) -> Result<(), DatabaseError>;

    /// Assign a sending account to a campaign.
    async fn assign_account(
        &self,
        campaign_id: Uuid,
        account_id: Uuid,
    ) -> Result<(), DatabaseError>;

    /// IDs of accounts assigned to a campaign, in assignment order.
    async fn campaign_account_ids(&self, campaign_id: Uuid) -> Result<Vec<Uuid>, DatabaseError>;

    async fn insert_sequence_step(&self, step: &SequenceStep) -> Result<(), DatabaseError>;

    async fn insert_variant(&self, variant: &Variant) -> Result<(), DatabaseError>;

    /// Ordered sequence steps with their variants populated.
    async fn sequence_steps(&self, campaign_id: Uuid) -> Result<Vec<SequenceStep>, DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError>;

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError>;

    /// Leads still advanceable by the scheduler (`new`/`contacted`), in
    /// creation order, up to `limit`.
    async fn selectable_leads(
        &self,
        campaign_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Lead>, DatabaseError>;

    /// Record a completed send: step position, status, contact time.
    async fn advance_lead(
        &self,
        id: Uuid,
        current_step: u32,
        status: LeadStatus,
        contacted_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn update_lead_status(&self, id: Uuid, status: LeadStatus) -> Result<(), DatabaseError>;

    /// Most recently created lead with this email, across campaigns.
    async fn find_lead_by_email(&self, email: &str) -> Result<Option<Lead>, DatabaseError>;

    async fn count_leads(&self, campaign_id: Uuid) -> Result<u64, DatabaseError>;

    /// Hard-delete a lead, recording a blocklist entry for its address in
    /// the same transaction.
    async fn delete_lead(&self, id: Uuid, reason: &str) -> Result<(), DatabaseError>;

    async fn is_blocklisted(&self, email: &str) -> Result<bool, DatabaseError>;

    // ── Sending events ──────────────────────────────────────────────

    /// Attempt the `sent` claim for the event's (lead, step). Returns
    /// `false` if another cycle already holds the claim.
    async fn claim_sent_event(&self, event: &SendingEvent) -> Result<bool, DatabaseError>;

    /// Release a `sent` claim after a failed dispatch so the lead retries
    /// on the next cycle.
    async fn release_sent_claim(
        &self,
        lead_id: Uuid,
        sequence_step_id: Uuid,
    ) -> Result<(), DatabaseError>;

    /// Attempt the inbound claim keyed on `external_message_id`. Returns
    /// `false` if this inbound message was already processed.
    async fn claim_inbound_event(&self, event: &SendingEvent) -> Result<bool, DatabaseError>;

    /// Append an event with no claim semantics (warmup, opens, clicks).
    async fn record_event(&self, event: &SendingEvent) -> Result<(), DatabaseError>;

    /// Attach the transport's message id to a claimed `sent` event after
    /// dispatch succeeds.
    async fn set_event_transport_message_id(
        &self,
        event_id: Uuid,
        transport_message_id: &str,
    ) -> Result<(), DatabaseError>;

    async fn has_sent_event(
        &self,
        lead_id: Uuid,
        sequence_step_id: Uuid,
    ) -> Result<bool, DatabaseError>;

    /// Look up a `sent` event by the transport message id an inbound reply
    /// references.
    async fn find_sent_event_by_transport_message_id(
        &self,
        transport_message_id: &str,
    ) -> Result<Option<SendingEvent>, DatabaseError>;

    async fn count_events(
        &self,
        campaign_id: Uuid,
        event_type: EventType,
    ) -> Result<u64, DatabaseError>;

    // ── Engine state ────────────────────────────────────────────────

    /// Atomically advance the phase rotation cursor modulo `num_phases`
    /// and return the phase index to run this invocation.
    async fn advance_phase_cursor(&self, num_phases: u32) -> Result<u32, DatabaseError>;

    // ── Reminders ───────────────────────────────────────────────────

    async fn insert_reminder(&self, reminder: &Reminder) -> Result<(), DatabaseError>;

    /// Pending reminders due at or before `now`, oldest first.
    async fn due_reminders(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reminder>, DatabaseError>;

    async fn update_reminder_status(
        &self,
        id: Uuid,
        status: ReminderStatus,
    ) -> Result<(), DatabaseError>;
}
