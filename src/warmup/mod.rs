//! Account warmup — synthetic traffic and mailbox placement repair.
//!
//! Three phases, each independently invocable under the shared deadline:
//! generate (pooled accounts send marked synthetic mail), pool cycle
//! (reciprocal pass so every member receives traffic), and maintenance
//! (find warmup mail in each mailbox, mark it read, rescue it from
//! spam). The read/rescue actions are the signal that teaches providers
//! the traffic is wanted.

pub mod pool;

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::capacity::{CapacityMode, remaining_capacity};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::guard::Deadline;
use crate::model::{AccountStatus, EmailAccount, EventType, SendingEvent};
use crate::store::Store;
use crate::transport::{MailTransport, MailboxReader, OutboundMessage};
use self::pool::WarmupPool;

/// Counts summarizing one warmup phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmupOutcome {
    pub sent: usize,
    pub repaired: usize,
    pub errors: usize,
}

/// The warmup engine.
pub struct WarmupEngine {
    store: Arc<dyn Store>,
    transport: Arc<dyn MailTransport>,
    mailbox: Arc<dyn MailboxReader>,
    config: EngineConfig,
}

impl WarmupEngine {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn MailTransport>,
        mailbox: Arc<dyn MailboxReader>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            transport,
            mailbox,
            config,
        }
    }

    async fn build_pool(&self) -> Result<Option<WarmupPool>> {
        let accounts = self.store.list_warmup_accounts().await?;
        let seed = rand::thread_rng().gen_range(0..usize::MAX);
        Ok(WarmupPool::new(accounts, seed))
    }

    /// Phase A: initiators with remaining warmup capacity send one marked
    /// message to their partner.
    pub async fn generate(&self, deadline: &Deadline) -> Result<WarmupOutcome> {
        let Some(pool) = self.build_pool().await? else {
            debug!("Warmup pool too small, nothing to generate");
            return Ok(WarmupOutcome::default());
        };

        let mut outcome = WarmupOutcome::default();
        for i in 0..pool.len() {
            if deadline.expired() {
                break;
            }

            // Re-read for fresh counters; earlier iterations spent capacity.
            let Some(account) = self.store.get_account(pool.members()[i].id).await? else {
                continue;
            };
            if account.status != AccountStatus::Active
                || remaining_capacity(&account, CapacityMode::Warmup) == 0
            {
                continue;
            }

            let partner = pool.partner_of(i);
            match self.send_warmup(&account, partner).await {
                Ok(()) => outcome.sent += 1,
                Err(()) => outcome.errors += 1,
            }
        }

        info!(sent = outcome.sent, errors = outcome.errors, "Warmup generate complete");
        Ok(outcome)
    }

    /// Phase B: reciprocal successor pass across the whole pool, keeping
    /// mailbox activity roughly symmetric even for accounts that never
    /// initiated in phase A.
    pub async fn pool_cycle(&self, deadline: &Deadline) -> Result<WarmupOutcome> {
        let Some(pool) = self.build_pool().await? else {
            debug!("Warmup pool too small, skipping pool cycle");
            return Ok(WarmupOutcome::default());
        };

        let mut outcome = WarmupOutcome::default();
        for i in 0..pool.len() {
            if deadline.expired() {
                break;
            }

            let Some(account) = self.store.get_account(pool.members()[i].id).await? else {
                continue;
            };
            if account.status != AccountStatus::Active
                || remaining_capacity(&account, CapacityMode::Warmup) == 0
            {
                continue;
            }

            let receiver = pool.successor_of(i);
            match self.send_warmup(&account, receiver).await {
                Ok(()) => outcome.sent += 1,
                Err(()) => outcome.errors += 1,
            }
        }

        info!(sent = outcome.sent, errors = outcome.errors, "Warmup pool cycle complete");
        Ok(outcome)
    }

    /// Phase C: locate warmup mail by its subject marker in each pooled
    /// account's mailbox, mark it read, and move it out of spam.
    pub async fn maintenance(&self, deadline: &Deadline) -> Result<WarmupOutcome> {
        let accounts = self.store.list_warmup_accounts().await?;
        let marker = self.config.warmup.subject_marker.clone();

        let mut outcome = WarmupOutcome::default();
        for account in &accounts {
            if deadline.expired() {
                break;
            }
            match self.repair_mailbox(account, &marker).await {
                Ok(repaired) => outcome.repaired += repaired,
                Err(e) => {
                    warn!(account = %account.address, "Warmup maintenance failed: {e}");
                    outcome.errors += 1;
                }
            }
        }

        info!(
            repaired = outcome.repaired,
            errors = outcome.errors,
            "Warmup maintenance complete"
        );
        Ok(outcome)
    }

    /// Send one synthetic message and account for it. Errors are already
    /// logged and folded to `Err(())` so phase loops just count them.
    async fn send_warmup(
        &self,
        from: &EmailAccount,
        to: &EmailAccount,
    ) -> std::result::Result<(), ()> {
        let message = compose_warmup(&self.config.warmup.subject_marker, from, to);

        match self.transport.send(from, &message).await {
            Ok(receipt) => {
                let record = async {
                    self.store
                        .increment_send_counter(from.id, CapacityMode::Warmup)
                        .await?;

                    let mut event = SendingEvent::new(EventType::ForwardSent);
                    event.account_id = Some(from.id);
                    event.transport_message_id = Some(receipt.message_id.clone());
                    event.metadata = serde_json::json!({
                        "warmup": true,
                        "to": to.address.clone(),
                    });
                    self.store.record_event(&event).await
                };
                if let Err(e) = record.await {
                    warn!(account = %from.address, "Failed to record warmup send: {e}");
                    return Err(());
                }
                debug!(from = %from.address, to = %to.address, "Warmup message sent");
                Ok(())
            }
            Err(e) => {
                warn!(from = %from.address, to = %to.address, "Warmup send failed: {e}");
                if e.is_account_level()
                    && let Err(db) = self
                        .store
                        .update_account_status(from.id, AccountStatus::Error, Some(&e.to_string()))
                        .await
                {
                    warn!(account = %from.address, "Failed to flag account: {db}");
                }
                Err(())
            }
        }
    }

    /// Mark unread warmup mail read in the inbox, and rescue warmup mail
    /// found in spam folders. Returns the number of corrective actions.
    async fn repair_mailbox(
        &self,
        account: &EmailAccount,
        marker: &str,
    ) -> std::result::Result<usize, crate::error::MailboxError> {
        let mut repaired = 0;

        let inbox = self
            .mailbox
            .find_by_subject_marker(account, "INBOX", marker)
            .await?;
        for summary in inbox.iter().filter(|s| !s.seen) {
            self.mailbox
                .mark_read(account, "INBOX", &summary.uid)
                .await?;
            repaired += 1;
        }

        for folder in &self.config.warmup.spam_folders {
            let misplaced = match self
                .mailbox
                .find_by_subject_marker(account, folder, marker)
                .await
            {
                Ok(found) => found,
                // Folder may simply not exist on this provider.
                Err(e) => {
                    debug!(account = %account.address, folder = %folder, "Skipping folder: {e}");
                    continue;
                }
            };

            // Highest sequence number first: moving expunges, which
            // renumbers everything above the moved message.
            let mut uids: Vec<u64> = misplaced
                .iter()
                .filter_map(|s| s.uid.parse().ok())
                .collect();
            uids.sort_unstable_by(|a, b| b.cmp(a));

            for uid in uids {
                let uid = uid.to_string();
                self.mailbox.move_to_inbox(account, folder, &uid).await?;
                self.mailbox.mark_read(account, "INBOX", &uid).await.ok();
                repaired += 1;
            }
        }

        Ok(repaired)
    }
}

/// Compose a synthetic warmup message carrying the subject marker.
fn compose_warmup(marker: &str, from: &EmailAccount, to: &EmailAccount) -> OutboundMessage {
    let mut rng = rand::thread_rng();
    let topics = [
        "Quick sync notes",
        "Following up on the thread",
        "Draft for review",
        "Notes from this week",
        "Checking in",
    ];
    let topic = topics[rng.gen_range(0..topics.len())];
    let token: u32 = rng.gen_range(10_000..100_000);

    OutboundMessage {
        to: to.address.clone(),
        subject: format!("{topic} [{marker}-{token}]"),
        body: format!(
            "Hi,\n\nSharing this over from {}. No action needed.\n\nBest,\n{}\n",
            from.address, from.display_name
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    #[test]
    fn warmup_subject_carries_marker() {
        let from = EmailAccount::new("a@x.com", SecretString::from("pw"));
        let to = EmailAccount::new("b@x.com", SecretString::from("pw"));
        let message = compose_warmup("OFW", &from, &to);
        assert_eq!(message.to, "b@x.com");
        assert!(message.subject.contains("[OFW-"));
    }
}
