//! The send cycle — advances every due lead exactly once per due step.
//!
//! Correctness does not rely on the absence of races: the `sent` claim on
//! (lead, step) is taken before dispatch, so an overlapping cycle that
//! selects the same lead finds its claim rejected and skips. Capacity is
//! re-read from the store on every iteration because each prior send in
//! the same cycle mutates it.

pub mod variants;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capacity::{CapacityMode, remaining_capacity};
use crate::config::EngineConfig;
use crate::error::{CampaignError, Error, Result};
use crate::guard::Deadline;
use crate::model::{
    AccountStatus, Campaign, CampaignStatus, EmailAccount, Lead, LeadStatus, SendingEvent,
    SequenceStep,
};
use crate::store::{CampaignCounter, Store};
use crate::transport::{MailTransport, OutboundMessage};

/// Counts summarizing one send cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub sent: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl CycleOutcome {
    fn merge(&mut self, other: CycleOutcome) {
        self.sent += other.sent;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

/// Optional restriction of a cycle to a subset of campaigns/accounts.
#[derive(Debug, Clone, Default)]
pub struct CycleFilter {
    pub campaign_ids: Option<Vec<Uuid>>,
    pub account_ids: Option<Vec<Uuid>>,
}

impl CycleFilter {
    fn allows_campaign(&self, id: Uuid) -> bool {
        self.campaign_ids.as_ref().is_none_or(|ids| ids.contains(&id))
    }

    fn allows_account(&self, id: Uuid) -> bool {
        self.account_ids.as_ref().is_none_or(|ids| ids.contains(&id))
    }
}

/// The send scheduler.
pub struct SendScheduler {
    store: Arc<dyn Store>,
    transport: Arc<dyn MailTransport>,
    config: EngineConfig,
}

impl SendScheduler {
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

    /// Run one send cycle across all active campaigns.
    ///
    /// Only a failure to start at all (store unavailable) propagates;
    /// per-campaign and per-lead failures are summarized in the outcome.
    pub async fn run_cycle(
        &self,
        deadline: &Deadline,
        filter: Option<&CycleFilter>,
    ) -> Result<CycleOutcome> {
        let campaigns = self.store.list_active_campaigns().await?;
        let default_filter = CycleFilter::default();
        let filter = filter.unwrap_or(&default_filter);

        let mut outcome = CycleOutcome::default();
        for campaign in campaigns {
            if deadline.expired() {
                debug!("Deadline reached, stopping send cycle");
                break;
            }
            if !filter.allows_campaign(campaign.id) {
                continue;
            }

            match self.run_campaign(&campaign, deadline, filter).await {
                Ok(campaign_outcome) => outcome.merge(campaign_outcome),
                Err(Error::Campaign(e)) => {
                    warn!(campaign = %campaign.name, "Campaign skipped: {e}");
                    outcome.skipped += 1;
                }
                Err(e) => {
                    warn!(campaign = %campaign.name, "Campaign cycle failed: {e}");
                    outcome.errors += 1;
                }
            }
        }

        info!(
            sent = outcome.sent,
            skipped = outcome.skipped,
            errors = outcome.errors,
            "Send cycle complete"
        );
        Ok(outcome)
    }

    async fn run_campaign(
        &self,
        campaign: &Campaign,
        deadline: &Deadline,
        filter: &CycleFilter,
    ) -> Result<CycleOutcome> {
        let steps = self.store.sequence_steps(campaign.id).await?;
        if steps.is_empty() {
            return Err(CampaignError::NoSequenceSteps { id: campaign.id }.into());
        }

        let rotation: Vec<Uuid> = self
            .store
            .campaign_account_ids(campaign.id)
            .await?
            .into_iter()
            .filter(|id| filter.allows_account(*id))
            .collect();
        if rotation.is_empty() {
            return Err(CampaignError::NoAccounts { id: campaign.id }.into());
        }

        let leads = self
            .store
            .selectable_leads(campaign.id, self.config.max_leads_per_campaign_cycle)
            .await?;
        if leads.is_empty() {
            if self.store.count_leads(campaign.id).await? == 0 {
                return Err(CampaignError::NoLeads { id: campaign.id }.into());
            }
            // Every lead is replied/bounced/unsubscribed/completed.
            self.store
                .update_campaign_status(campaign.id, CampaignStatus::Completed)
                .await?;
            info!(campaign = %campaign.name, "No advanceable leads left, campaign completed");
            return Ok(CycleOutcome::default());
        }

        let now = Utc::now();
        let mut outcome = CycleOutcome::default();
        let mut index = campaign.last_account_index as usize % rotation.len();
        let mut new_leads_sent: u32 = 0;
        // StdRng rather than thread_rng: the rng lives across awaits, so
        // it has to be Send.
        let mut rng = rand::rngs::StdRng::from_entropy();

        for lead in &leads {
            if deadline.expired() {
                break;
            }

            let Some(step) = due_step(lead, &steps) else {
                // Sequence exhausted; settle the lead out of selection.
                self.store
                    .update_lead_status(lead.id, LeadStatus::Completed)
                    .await?;
                continue;
            };
            if !is_due(lead, step, campaign.settings.min_step_gap_days, now) {
                continue;
            }
            if lead.current_step == 0
                && new_leads_sent >= campaign.settings.max_new_leads_per_cycle
            {
                outcome.skipped += 1;
                continue;
            }
            if self.store.is_blocklisted(&lead.email).await? {
                debug!(lead = %lead.email, "Blocklisted, skipping");
                outcome.skipped += 1;
                continue;
            }

            // Capacity is re-read here on purpose; prior iterations of
            // this very loop have consumed it.
            let Some((picked_index, account)) = self.pick_account(&rotation, index).await? else {
                debug!(campaign = %campaign.name, "No account capacity left");
                break;
            };
            index = picked_index;

            // Claim before dispatch. A rejected claim means another cycle
            // (concurrent or prior) already handled this (lead, step).
            let event = SendingEvent::sent_claim(lead, step, &account);
            if !self.store.claim_sent_event(&event).await? {
                debug!(lead = %lead.email, step = step.position, "Claim rejected, already sent");
                outcome.skipped += 1;
                continue;
            }

            let rendered = variants::render_message(step, lead, &mut rng);
            let message = OutboundMessage {
                to: lead.email.clone(),
                subject: rendered.subject,
                body: rendered.body,
            };

            match self.transport.send(&account, &message).await {
                Ok(receipt) => {
                    self.store
                        .set_event_transport_message_id(event.id, &receipt.message_id)
                        .await?;
                    self.store
                        .increment_send_counter(account.id, CapacityMode::Regular)
                        .await?;

                    let is_last = step.position as usize >= steps.len();
                    let status = if is_last {
                        LeadStatus::Completed
                    } else {
                        LeadStatus::Contacted
                    };
                    self.store
                        .advance_lead(lead.id, step.position, status, now)
                        .await?;
                    self.store
                        .bump_campaign_counter(campaign.id, CampaignCounter::Sent)
                        .await?;

                    if lead.current_step == 0 {
                        new_leads_sent += 1;
                    }
                    outcome.sent += 1;
                    index = (index + 1) % rotation.len();
                }
                Err(e) => {
                    // Release the claim so the lead is retried next cycle.
                    self.store.release_sent_claim(lead.id, step.id).await?;
                    warn!(
                        lead = %lead.email,
                        account = %account.address,
                        "Send failed: {e}"
                    );
                    outcome.errors += 1;

                    if e.is_account_level() {
                        self.store
                            .update_account_status(
                                account.id,
                                AccountStatus::Error,
                                Some(&e.to_string()),
                            )
                            .await?;
                        warn!(account = %account.address, "Account flagged as errored");
                    }
                }
            }
        }

        self.store
            .set_rotation_index(campaign.id, index as u32)
            .await?;
        Ok(outcome)
    }

    /// Find the next assigned account, from `start`, that is active and
    /// has regular capacity left. Reads fresh account state from the
    /// store so mid-cycle increments and status flips are honored.
    async fn pick_account(
        &self,
        rotation: &[Uuid],
        start: usize,
    ) -> Result<Option<(usize, EmailAccount)>> {
        for offset in 0..rotation.len() {
            let idx = (start + offset) % rotation.len();
            if let Some(account) = self.store.get_account(rotation[idx]).await?
                && account.status == AccountStatus::Active
                && remaining_capacity(&account, CapacityMode::Regular) > 0
            {
                return Ok(Some((idx, account)));
            }
        }
        Ok(None)
    }
}

/// Validate a campaign for activation and estimate its runway.
///
/// The structural requirements (≥1 step, ≥1 account) are hard errors; the
/// capacity estimate is a warning surface only, since aggregate capacity
/// grows daily as warmup ramps.
pub async fn validate_launch(
    store: &dyn Store,
    campaign_id: Uuid,
) -> Result<crate::capacity::LaunchEstimate> {
    let campaign = store
        .get_campaign(campaign_id)
        .await?
        .ok_or_else(|| CampaignError::InvalidTransition {
            id: campaign_id,
            target: CampaignStatus::Active.to_string(),
            reason: "campaign not found".to_string(),
        })?;

    if store.sequence_steps(campaign_id).await?.is_empty() {
        return Err(CampaignError::NoSequenceSteps { id: campaign_id }.into());
    }

    let account_ids = store.campaign_account_ids(campaign_id).await?;
    if account_ids.is_empty() {
        return Err(CampaignError::NoAccounts { id: campaign_id }.into());
    }

    let mut accounts = Vec::new();
    for id in account_ids {
        if let Some(account) = store.get_account(id).await? {
            accounts.push(account);
        }
    }

    let aggregate = crate::capacity::aggregate_capacity(&accounts, CapacityMode::Regular);
    let total_leads = store.count_leads(campaign_id).await?;
    Ok(crate::capacity::estimate_days_to_complete(
        total_leads,
        aggregate,
        campaign.settings.daily_limit,
    ))
}

/// The step a lead is currently due for, if any remain.
fn due_step<'a>(lead: &Lead, steps: &'a [SequenceStep]) -> Option<&'a SequenceStep> {
    steps.get(lead.current_step as usize)
}

/// Whether the step's schedule has arrived for this lead. The first step
/// is due immediately; later steps wait `day_gap` days (floored by the
/// campaign's minimum gap) after the previous send.
fn is_due(lead: &Lead, step: &SequenceStep, min_gap_days: u32, now: DateTime<Utc>) -> bool {
    if lead.current_step == 0 {
        return true;
    }
    match lead.last_contacted_at {
        None => true,
        Some(last) => {
            let gap_days = i64::from(step.day_gap.max(min_gap_days));
            now >= last + chrono::Duration::days(gap_days)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Lead, Vec<SequenceStep>) {
        let campaign_id = Uuid::new_v4();
        let step1 = SequenceStep::new(campaign_id, 1, "Intro", "Hello");
        let mut step2 = SequenceStep::new(campaign_id, 2, "Follow-up", "Bump");
        step2.day_gap = 3;
        let lead = Lead::new(campaign_id, "lead@x.com");
        (lead, vec![step1, step2])
    }

    #[test]
    fn first_step_is_due_immediately() {
        let (lead, steps) = fixture();
        let step = due_step(&lead, &steps).unwrap();
        assert_eq!(step.position, 1);
        assert!(is_due(&lead, step, 0, Utc::now()));
    }

    #[test]
    fn followup_waits_for_day_gap() {
        let (mut lead, steps) = fixture();
        lead.current_step = 1;
        lead.status = LeadStatus::Contacted;
        lead.last_contacted_at = Some(Utc::now() - chrono::Duration::days(1));

        let step = due_step(&lead, &steps).unwrap();
        assert_eq!(step.position, 2);
        assert!(!is_due(&lead, step, 0, Utc::now()));

        lead.last_contacted_at = Some(Utc::now() - chrono::Duration::days(4));
        assert!(is_due(&lead, step, 0, Utc::now()));
    }

    #[test]
    fn campaign_min_gap_floors_the_step_gap() {
        let (mut lead, mut steps) = fixture();
        steps[1].day_gap = 1;
        lead.current_step = 1;
        lead.last_contacted_at = Some(Utc::now() - chrono::Duration::days(2));

        let step = due_step(&lead, &steps).unwrap();
        assert!(is_due(&lead, step, 0, Utc::now()));
        // A 5-day campaign floor overrides the 1-day step gap.
        assert!(!is_due(&lead, step, 5, Utc::now()));
    }

    #[test]
    fn exhausted_sequence_has_no_due_step() {
        let (mut lead, steps) = fixture();
        lead.current_step = 2;
        assert!(due_step(&lead, &steps).is_none());
    }
}
