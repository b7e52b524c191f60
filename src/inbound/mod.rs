//! Reply/bounce reconciliation — turns inbound mailbox state into lead
//! and campaign state changes.
//!
//! A small oldest-checked-first batch of accounts is processed per cycle,
//! staggered to avoid provider rate limits. Each account's checkpoint
//! advances only after its batch completes cleanly, so a crash mid-batch
//! re-reads the same window; the inbound-identity claim deduplicates the
//! replay.

pub mod classifier;

use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::guard::Deadline;
use crate::model::{EmailAccount, EventType, LeadStatus, SendingEvent};
use crate::store::{CampaignCounter, Store};
use crate::transport::{InboundEmail, MailboxReader};
use self::classifier::{Classification, ReplyClassifier};

/// Counts summarizing one inbound cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundOutcome {
    pub replies: usize,
    pub bounces: usize,
    /// Unattributable or already-processed messages.
    pub skipped: usize,
    pub errors: usize,
}

impl InboundOutcome {
    fn merge(&mut self, other: InboundOutcome) {
        self.replies += other.replies;
        self.bounces += other.bounces;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

/// The reply/bounce reconciler.
pub struct ReplyBounceReconciler {
    store: Arc<dyn Store>,
    mailbox: Arc<dyn MailboxReader>,
    classifier: Arc<dyn ReplyClassifier>,
    config: EngineConfig,
}

impl ReplyBounceReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        mailbox: Arc<dyn MailboxReader>,
        classifier: Arc<dyn ReplyClassifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            mailbox,
            classifier,
            config,
        }
    }

    /// Check a batch of account mailboxes for new inbound mail.
    pub async fn run_cycle(&self, deadline: &Deadline) -> Result<InboundOutcome> {
        let accounts = self
            .store
            .accounts_due_inbound_check(self.config.inbound_batch_accounts)
            .await?;

        let mut outcome = InboundOutcome::default();
        let mut first = true;
        for account in &accounts {
            if deadline.expired() {
                break;
            }
            if !first {
                tokio::time::sleep(self.config.inbound_stagger).await;
                if deadline.expired() {
                    break;
                }
            }
            first = false;

            // The checkpoint candidate is taken before the fetch so mail
            // arriving mid-batch lands in the next window.
            let window_start = Utc::now();
            match self.check_account(account).await {
                Ok(account_outcome) => {
                    outcome.merge(account_outcome);
                    self.store
                        .set_mailbox_checkpoint(account.id, window_start)
                        .await?;
                }
                Err(e) => {
                    // No checkpoint advance: this window is retried next
                    // cycle without blocking the other accounts.
                    warn!(account = %account.address, "Inbound check failed: {e}");
                    outcome.errors += 1;
                }
            }
        }

        info!(
            replies = outcome.replies,
            bounces = outcome.bounces,
            skipped = outcome.skipped,
            errors = outcome.errors,
            "Inbound cycle complete"
        );
        Ok(outcome)
    }

    async fn check_account(&self, account: &EmailAccount) -> Result<InboundOutcome> {
        let messages = self
            .mailbox
            .fetch_since(account, account.last_synced_at)
            .await
            .map_err(crate::error::Error::from)?;

        debug!(
            account = %account.address,
            count = messages.len(),
            "Fetched inbound messages"
        );

        let mut outcome = InboundOutcome::default();
        for mail in &messages {
            match self.process_message(account, mail).await {
                Ok(processed) => outcome.merge(processed),
                Err(e) => {
                    warn!(
                        account = %account.address,
                        message_id = %mail.message_id,
                        "Failed to process inbound message: {e}"
                    );
                    outcome.errors += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn process_message(
        &self,
        account: &EmailAccount,
        mail: &InboundEmail,
    ) -> Result<InboundOutcome> {
        let mut outcome = InboundOutcome::default();

        let classification =
            self.classifier
                .classify(&mail.from_address, &mail.subject, &mail.body);

        let Some((lead_id, campaign_id)) = self.attribute(account, mail, classification).await?
        else {
            debug!(message_id = %mail.message_id, "Unattributable inbound message, skipping");
            outcome.skipped += 1;
            return Ok(outcome);
        };

        let event_type = match classification {
            Classification::Bounce => EventType::Bounce,
            _ => EventType::Reply,
        };

        let mut event = SendingEvent::new(event_type);
        event.lead_id = Some(lead_id);
        event.campaign_id = Some(campaign_id);
        event.account_id = Some(account.id);
        event.external_message_id = Some(mail.message_id.clone());
        event.metadata = serde_json::json!({
            "classification": classification.to_string(),
            "from": mail.from_address.clone(),
            "subject": mail.subject.clone(),
        });

        // Losing this claim means an overlapping cycle (or the previous
        // run of a replayed window) already recorded the message.
        if !self.store.claim_inbound_event(&event).await? {
            outcome.skipped += 1;
            return Ok(outcome);
        }

        let campaign = self.store.get_campaign(campaign_id).await?;
        let settings = campaign.map(|c| c.settings).unwrap_or_default();

        match classification {
            Classification::Bounce => {
                self.store
                    .update_lead_status(lead_id, LeadStatus::Bounced)
                    .await?;
                self.store
                    .bump_campaign_counter(campaign_id, CampaignCounter::Bounces)
                    .await?;
                outcome.bounces += 1;
            }
            Classification::Reply => {
                if settings.stop_on_reply {
                    self.store
                        .update_lead_status(lead_id, LeadStatus::Replied)
                        .await?;
                }
                self.store
                    .bump_campaign_counter(campaign_id, CampaignCounter::Replies)
                    .await?;
                outcome.replies += 1;
            }
            Classification::AutoReply => {
                if settings.stop_on_auto_reply {
                    self.store
                        .update_lead_status(lead_id, LeadStatus::Replied)
                        .await?;
                }
                self.store
                    .bump_campaign_counter(campaign_id, CampaignCounter::Replies)
                    .await?;
                outcome.replies += 1;
            }
            // Conservatively not a reply: the sequence continues, but the
            // event row above keeps the message around for inspection.
            Classification::Other => {
                outcome.skipped += 1;
            }
        }

        Ok(outcome)
    }

    /// Tie an inbound message back to the lead and campaign it concerns.
    ///
    /// Replies reference our wire Message-ID in In-Reply-To; bounces come
    /// from the provider, so the failed recipient is dug out of the
    /// report body instead.
    async fn attribute(
        &self,
        account: &EmailAccount,
        mail: &InboundEmail,
        classification: Classification,
    ) -> Result<Option<(Uuid, Uuid)>> {
        if let Some(ref reference) = mail.in_reply_to
            && let Some(event) = self
                .store
                .find_sent_event_by_transport_message_id(reference)
                .await?
            && let (Some(lead_id), Some(campaign_id)) = (event.lead_id, event.campaign_id)
        {
            return Ok(Some((lead_id, campaign_id)));
        }

        let candidates: Vec<String> = match classification {
            Classification::Bounce => extract_addresses(&mail.body)
                .into_iter()
                .filter(|addr| !addr.eq_ignore_ascii_case(&account.address))
                .collect(),
            _ => vec![mail.from_address.clone()],
        };

        for address in candidates {
            if let Some(lead) = self.store.find_lead_by_email(&address).await? {
                return Ok(Some((lead.id, lead.campaign_id)));
            }
        }
        Ok(None)
    }
}

static ADDRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").unwrap());

/// All email addresses mentioned in a text blob, in order of appearance.
fn extract_addresses(text: &str) -> Vec<String> {
    ADDRESS_RE
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_failed_recipient_from_bounce_body() {
        let body = "Delivery to the following recipient failed permanently:\n\
                    \n    jane.prospect@acme.com\n\
                    \nTechnical details: 550 user unknown";
        let addresses = extract_addresses(body);
        assert_eq!(addresses, vec!["jane.prospect@acme.com".to_string()]);
    }

    #[test]
    fn extracts_multiple_addresses_in_order() {
        let body = "first@a.com then second@b.org";
        assert_eq!(
            extract_addresses(body),
            vec!["first@a.com".to_string(), "second@b.org".to_string()]
        );
    }

    #[test]
    fn no_addresses_yields_empty() {
        assert!(extract_addresses("nothing to see here").is_empty());
    }
}
