//! Core data model — accounts, campaigns, leads, sending events, reminders.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Accounts ────────────────────────────────────────────────────────

/// Status of a sending account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    /// Connected and usable for sending.
    Active,
    /// Transport failure; out of rotation until a verify succeeds.
    Error,
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for AccountStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown account status: {s}")),
        }
    }
}

/// A connected email account with its transport credentials, daily
/// capacity counters and warmup ramp state.
#[derive(Debug, Clone)]
pub struct EmailAccount {
    pub id: Uuid,
    pub address: String,
    pub display_name: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: SecretString,
    pub status: AccountStatus,
    pub error_message: Option<String>,
    /// Hard cap on campaign sends per day.
    pub daily_limit: u32,
    /// Campaign sends performed today.
    pub sent_today: u32,
    pub warmup_enabled: bool,
    /// Day number on the warmup ramp, starting at 1.
    pub warmup_current_day: u32,
    pub warmup_daily_increase: u32,
    pub warmup_max_per_day: u32,
    /// Warmup sends performed today.
    pub warmup_sent_today: u32,
    /// Date the daily counters were last zeroed.
    pub last_reset_date: Option<NaiveDate>,
    /// Mailbox checkpoint: inbound mail before this instant has been
    /// reconciled.
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailAccount {
    /// New active account with warmup off and zeroed counters.
    pub fn new(address: &str, password: SecretString) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            address: address.to_string(),
            display_name: String::new(),
            smtp_host: String::new(),
            smtp_port: 587,
            imap_host: String::new(),
            imap_port: 993,
            username: address.to_string(),
            password,
            status: AccountStatus::Active,
            error_message: None,
            daily_limit: 50,
            sent_today: 0,
            warmup_enabled: false,
            warmup_current_day: 1,
            warmup_daily_increase: 3,
            warmup_max_per_day: 30,
            warmup_sent_today: 0,
            last_reset_date: None,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Campaigns ───────────────────────────────────────────────────────

/// Lifecycle status of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Unknown campaign status: {s}")),
        }
    }
}

/// Typed campaign settings. These are the options the engine actually
/// reads; no free-form settings blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSettings {
    /// Stop the sequence once a lead replies.
    pub stop_on_reply: bool,
    /// Treat auto-replies (OOO) like replies for stopping purposes.
    pub stop_on_auto_reply: bool,
    /// Campaign-wide cap on sends per day, on top of account capacity.
    pub daily_limit: u32,
    /// Floor on the gap between sequence steps, in days.
    pub min_step_gap_days: u32,
    /// Cap on first-step (new lead) sends per cycle.
    pub max_new_leads_per_cycle: u32,
    /// Whether open tracking events are expected for this campaign.
    pub track_opens: bool,
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            stop_on_reply: true,
            stop_on_auto_reply: false,
            daily_limit: 200,
            min_step_gap_days: 0,
            max_new_leads_per_cycle: 20,
            track_opens: false,
        }
    }
}

/// An outreach campaign: an ordered message sequence sent to its leads
/// from its assigned accounts.
#[derive(Debug, Clone)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub status: CampaignStatus,
    pub settings: CampaignSettings,
    /// Round-robin cursor into the campaign's account rotation, persisted
    /// so consecutive cycles keep spreading load across accounts.
    pub last_account_index: u32,
    pub sent_count: u64,
    pub reply_count: u64,
    pub bounce_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: CampaignStatus::Draft,
            settings: CampaignSettings::default(),
            last_account_index: 0,
            sent_count: 0,
            reply_count: 0,
            bounce_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One step in a campaign's message sequence.
#[derive(Debug, Clone)]
pub struct SequenceStep {
    pub id: Uuid,
    pub campaign_id: Uuid,
    /// 1-based order within the sequence.
    pub position: u32,
    /// Days after the previous send before this step is due. Ignored for
    /// the first step, which is due immediately.
    pub day_gap: u32,
    /// Legacy single subject/body, used when no variant is enabled.
    pub subject: String,
    pub body: String,
    pub variants: Vec<Variant>,
}

impl SequenceStep {
    pub fn new(campaign_id: Uuid, position: u32, subject: &str, body: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            position,
            day_gap: if position <= 1 { 0 } else { 3 },
            subject: subject.to_string(),
            body: body.to_string(),
            variants: Vec::new(),
        }
    }
}

/// A/B variant of a sequence step's message.
#[derive(Debug, Clone)]
pub struct Variant {
    pub id: Uuid,
    pub step_id: Uuid,
    pub subject: String,
    pub body: String,
    /// Relative draw weight; weights across a step nominally sum to 100.
    pub weight: u32,
    pub enabled: bool,
}

impl Variant {
    pub fn new(step_id: Uuid, subject: &str, body: &str, weight: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            step_id,
            subject: subject.to_string(),
            body: body.to_string(),
            weight,
            enabled: true,
        }
    }
}

// ── Leads ───────────────────────────────────────────────────────────

/// Status of a lead within its campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadStatus {
    /// Imported, no step sent yet.
    New,
    /// At least one step sent.
    Contacted,
    Replied,
    Bounced,
    Unsubscribed,
    /// Sequence exhausted without a reply.
    Completed,
}

impl LeadStatus {
    /// Whether the scheduler may still advance this lead.
    pub fn is_selectable(&self) -> bool {
        matches!(self, Self::New | Self::Contacted)
    }
}

impl std::fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Contacted => write!(f, "contacted"),
            Self::Replied => write!(f, "replied"),
            Self::Bounced => write!(f, "bounced"),
            Self::Unsubscribed => write!(f, "unsubscribed"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for LeadStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "contacted" => Ok(Self::Contacted),
            "replied" => Ok(Self::Replied),
            "bounced" => Ok(Self::Bounced),
            "unsubscribed" => Ok(Self::Unsubscribed),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Unknown lead status: {s}")),
        }
    }
}

/// A prospect inside exactly one campaign.
#[derive(Debug, Clone)]
pub struct Lead {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub company: String,
    /// Extra personalization fields from import.
    pub custom_fields: HashMap<String, String>,
    pub status: LeadStatus,
    /// Position of the last step sent; 0 when nothing sent yet.
    pub current_step: u32,
    pub last_contacted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(campaign_id: Uuid, email: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            email: email.to_string(),
            first_name: String::new(),
            last_name: String::new(),
            company: String::new(),
            custom_fields: HashMap::new(),
            status: LeadStatus::New,
            current_step: 0,
            last_contacted_at: None,
            created_at: Utc::now(),
        }
    }
}

// ── Sending events ──────────────────────────────────────────────────

/// Type of an append-only sending event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Campaign message dispatched. Doubles as the idempotency claim for
    /// (lead, step).
    Sent,
    Open,
    Click,
    Reply,
    Bounce,
    /// Warmup message dispatched.
    ForwardSent,
    /// Manual or automated reply sent from our side.
    ReplySent,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Open => write!(f, "open"),
            Self::Click => write!(f, "click"),
            Self::Reply => write!(f, "reply"),
            Self::Bounce => write!(f, "bounce"),
            Self::ForwardSent => write!(f, "forward_sent"),
            Self::ReplySent => write!(f, "reply_sent"),
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "open" => Ok(Self::Open),
            "click" => Ok(Self::Click),
            "reply" => Ok(Self::Reply),
            "bounce" => Ok(Self::Bounce),
            "forward_sent" => Ok(Self::ForwardSent),
            "reply_sent" => Ok(Self::ReplySent),
            _ => Err(format!("Unknown event type: {s}")),
        }
    }
}

/// Append-only log entry; the single source of truth for what has
/// already happened to a lead.
#[derive(Debug, Clone)]
pub struct SendingEvent {
    pub id: Uuid,
    pub event_type: EventType,
    pub lead_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    pub account_id: Option<Uuid>,
    pub sequence_step_id: Option<Uuid>,
    /// Message-ID assigned by the transport on dispatch. Inbound replies
    /// are attributed by matching their In-Reply-To against this.
    pub transport_message_id: Option<String>,
    /// Identity of an inbound message (reply/bounce); unique, so inbound
    /// processing is deduplicated across overlapping cycles.
    pub external_message_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl SendingEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            lead_id: None,
            campaign_id: None,
            account_id: None,
            sequence_step_id: None,
            transport_message_id: None,
            external_message_id: None,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    /// The `sent` claim row for a (lead, step) pair.
    pub fn sent_claim(lead: &Lead, step: &SequenceStep, account: &EmailAccount) -> Self {
        Self {
            lead_id: Some(lead.id),
            campaign_id: Some(lead.campaign_id),
            account_id: Some(account.id),
            sequence_step_id: Some(step.id),
            ..Self::new(EventType::Sent)
        }
    }
}

// ── Reminders ───────────────────────────────────────────────────────

/// Status of a scheduled reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderStatus {
    Pending,
    Sent,
    Failed,
    Error,
}

impl std::fmt::Display for ReminderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for ReminderStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown reminder status: {s}")),
        }
    }
}

/// A scheduled side-channel notification to a user, optionally tied to
/// a lead.
#[derive(Debug, Clone)]
pub struct Reminder {
    pub id: Uuid,
    /// Address the reminder is delivered to.
    pub user_id: String,
    pub lead_id: Option<Uuid>,
    pub message: String,
    pub remind_at: DateTime<Utc>,
    pub status: ReminderStatus,
    pub created_at: DateTime<Utc>,
}

impl Reminder {
    pub fn new(user_id: &str, message: &str, remind_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            lead_id: None,
            message: message.to_string(),
            remind_at,
            status: ReminderStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

/// A suppressed address. Every hard lead deletion records one of these.
#[derive(Debug, Clone)]
pub struct BlocklistEntry {
    pub email: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lead_status_selectability() {
        assert!(LeadStatus::New.is_selectable());
        assert!(LeadStatus::Contacted.is_selectable());
        assert!(!LeadStatus::Replied.is_selectable());
        assert!(!LeadStatus::Bounced.is_selectable());
        assert!(!LeadStatus::Unsubscribed.is_selectable());
        assert!(!LeadStatus::Completed.is_selectable());
    }

    #[test]
    fn status_round_trips() {
        for s in ["active", "error"] {
            assert_eq!(s.parse::<AccountStatus>().unwrap().to_string(), s);
        }
        for s in ["draft", "active", "paused", "completed"] {
            assert_eq!(s.parse::<CampaignStatus>().unwrap().to_string(), s);
        }
        for s in [
            "new",
            "contacted",
            "replied",
            "bounced",
            "unsubscribed",
            "completed",
        ] {
            assert_eq!(s.parse::<LeadStatus>().unwrap().to_string(), s);
        }
        for s in [
            "sent",
            "open",
            "click",
            "reply",
            "bounce",
            "forward_sent",
            "reply_sent",
        ] {
            assert_eq!(s.parse::<EventType>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn sent_claim_carries_references() {
        let account = EmailAccount::new("a@x.com", SecretString::from("pw"));
        let campaign = Campaign::new("test");
        let step = SequenceStep::new(campaign.id, 1, "Hi", "Hello");
        let lead = Lead::new(campaign.id, "lead@x.com");

        let event = SendingEvent::sent_claim(&lead, &step, &account);
        assert_eq!(event.event_type, EventType::Sent);
        assert_eq!(event.lead_id, Some(lead.id));
        assert_eq!(event.campaign_id, Some(campaign.id));
        assert_eq!(event.account_id, Some(account.id));
        assert_eq!(event.sequence_step_id, Some(step.id));
    }
}
