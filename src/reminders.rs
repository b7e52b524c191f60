//! Due-reminder dispatch.
//!
//! Reminders are a side channel: scheduled notes delivered to the user's
//! own address over the first active sending account. One reminder's
//! failure never aborts the batch.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::guard::Deadline;
use crate::model::{AccountStatus, ReminderStatus};
use crate::store::Store;
use crate::transport::{MailTransport, OutboundMessage};

/// Counts summarizing one reminder pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReminderOutcome {
    pub sent: usize,
    pub errors: usize,
}

/// The reminder dispatch service.
pub struct ReminderService {
    store: Arc<dyn Store>,
    transport: Arc<dyn MailTransport>,
    config: EngineConfig,
}

impl ReminderService {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn MailTransport>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    /// Deliver due reminders, bounded by the batch cap and the deadline.
    pub async fn dispatch_due(&self, deadline: &Deadline) -> Result<ReminderOutcome> {
        let due = self
            .store
            .due_reminders(Utc::now(), self.config.reminder_batch)
            .await?;
        if due.is_empty() {
            return Ok(ReminderOutcome::default());
        }

        let Some(sender) = self
            .store
            .list_accounts()
            .await?
            .into_iter()
            .find(|a| a.status == AccountStatus::Active)
        else {
            warn!("No active account available for reminder dispatch");
            return Ok(ReminderOutcome::default());
        };

        let mut outcome = ReminderOutcome::default();
        for reminder in due {
            if deadline.expired() {
                break;
            }

            let message = OutboundMessage {
                to: reminder.user_id.clone(),
                subject: "Reminder".to_string(),
                body: reminder.message.clone(),
            };

            match self.transport.send(&sender, &message).await {
                Ok(_) => {
                    self.store
                        .update_reminder_status(reminder.id, ReminderStatus::Sent)
                        .await?;
                    outcome.sent += 1;
                }
                Err(e) => {
                    warn!(reminder = %reminder.id, "Reminder send failed: {e}");
                    self.store
                        .update_reminder_status(reminder.id, ReminderStatus::Failed)
                        .await?;
                    outcome.errors += 1;
                }
            }
        }

        if outcome.sent > 0 || outcome.errors > 0 {
            info!(sent = outcome.sent, errors = outcome.errors, "Reminders dispatched");
        }
        Ok(outcome)
    }
}
