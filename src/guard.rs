//! Phase rotation under a hard time budget.
//!
//! One external trigger = one tick. A tick runs the cheap always-on jobs
//! (daily reset, due reminders), then atomically advances the persisted
//! rotation cursor and runs exactly one long phase. The whole engine does
//! not fit in one invocation's budget; the cursor makes successive
//! invocations cycle through the phases instead of one starving the rest.
//!
//! The cursor lives in the store and is advanced with a single atomic
//! UPDATE, so concurrent instances each get a distinct phase instead of
//! racing a process-local counter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::inbound::{InboundOutcome, ReplyBounceReconciler};
use crate::model::AccountStatus;
use crate::reminders::ReminderService;
use crate::reset::DailyResetJob;
use crate::scheduler::{CycleOutcome, SendScheduler};
use crate::store::Store;
use crate::transport::MailTransport;
use crate::warmup::{WarmupEngine, WarmupOutcome};

/// Errored accounts re-verified per tick.
const RECOVERY_BATCH: usize = 3;

/// Remaining-time check shared by every phase loop.
///
/// Constructed once per tick from `budget − safety_margin`; every inner
/// loop checks it before starting a new unit of work and returns cleanly
/// when it has passed. A unit already started is allowed to finish.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn start(budget: Duration, safety_margin: Duration) -> Self {
        Self {
            at: Instant::now() + budget.saturating_sub(safety_margin),
        }
    }

    /// A deadline that has already passed (for tests and dry runs).
    pub fn already_expired() -> Self {
        Self {
            at: Instant::now(),
        }
    }

    /// A deadline far enough away to never interrupt (for tests).
    pub fn unbounded() -> Self {
        Self {
            at: Instant::now() + Duration::from_secs(24 * 3600),
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

/// The long-running phases the rotation cursor cycles through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Send,
    WarmupGenerate,
    WarmupPool,
    WarmupMaintenance,
    ReplyCheck,
}

impl Phase {
    pub const COUNT: u32 = 5;

    fn from_cursor(cursor: u32) -> Self {
        match cursor % Self::COUNT {
            0 => Self::Send,
            1 => Self::WarmupGenerate,
            2 => Self::WarmupPool,
            3 => Self::WarmupMaintenance,
            _ => Self::ReplyCheck,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::WarmupGenerate => "warmup_generate",
            Self::WarmupPool => "warmup_pool",
            Self::WarmupMaintenance => "warmup_maintenance",
            Self::ReplyCheck => "reply_check",
        }
    }
}

/// What one tick did, for the asynchronous completion log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickReport {
    /// The budget was exhausted before any phase could start.
    Starved,
    Send(CycleOutcome),
    Warmup(Phase, WarmupOutcome),
    ReplyCheck(InboundOutcome),
}

/// Top-level orchestrator for one time-boxed invocation.
pub struct PhaseRotationGuard {
    store: Arc<dyn Store>,
    transport: Arc<dyn MailTransport>,
    scheduler: SendScheduler,
    warmup: WarmupEngine,
    reconciler: ReplyBounceReconciler,
    reminders: ReminderService,
    reset: DailyResetJob,
    config: EngineConfig,
}

impl PhaseRotationGuard {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn MailTransport>,
        scheduler: SendScheduler,
        warmup: WarmupEngine,
        reconciler: ReplyBounceReconciler,
        reminders: ReminderService,
        config: EngineConfig,
    ) -> Self {
        let reset = DailyResetJob::new(store.clone());
        Self {
            store,
            transport,
            scheduler,
            warmup,
            reconciler,
            reminders,
            reset,
            config,
        }
    }

    /// Retry verification for a few errored accounts; a success puts the
    /// account back into rotation.
    async fn recover_errored_accounts(&self, deadline: &Deadline) -> Result<()> {
        let errored = self.store.list_errored_accounts(RECOVERY_BATCH).await?;
        for account in errored {
            if deadline.expired() {
                break;
            }
            match self.transport.verify(&account).await {
                Ok(()) => {
                    self.store
                        .update_account_status(account.id, AccountStatus::Active, None)
                        .await?;
                    info!(account = %account.address, "Account verified, back in rotation");
                }
                Err(e) => {
                    debug!(account = %account.address, "Verification still failing: {e}");
                }
            }
        }
        Ok(())
    }

    /// Run one tick under the configured budget.
    pub async fn tick(&self) -> Result<TickReport> {
        let deadline = Deadline::start(self.config.time_budget, self.config.safety_margin);
        self.tick_with_deadline(&deadline).await
    }

    /// Run one tick against an externally supplied deadline.
    ///
    /// A phase interrupted by the deadline leaves all completed units
    /// durably claimed; the next tick resumes by re-querying what is
    /// still due, never by replaying an in-memory list.
    pub async fn tick_with_deadline(&self, deadline: &Deadline) -> Result<TickReport> {
        let started = Instant::now();

        if deadline.expired() {
            debug!("Budget exhausted before tick start");
            return Ok(TickReport::Starved);
        }

        // Cheap always-on jobs run every tick, ahead of the rotation.
        self.reset.run().await?;
        self.recover_errored_accounts(deadline).await?;
        self.reminders.dispatch_due(deadline).await?;

        if deadline.expired() {
            return Ok(TickReport::Starved);
        }

        let cursor = self.store.advance_phase_cursor(Phase::COUNT).await?;
        let phase = Phase::from_cursor(cursor);
        info!(phase = phase.name(), remaining = ?deadline.remaining(), "Tick phase starting");

        let report = match phase {
            Phase::Send => TickReport::Send(self.scheduler.run_cycle(deadline, None).await?),
            Phase::WarmupGenerate => {
                TickReport::Warmup(phase, self.warmup.generate(deadline).await?)
            }
            Phase::WarmupPool => {
                TickReport::Warmup(phase, self.warmup.pool_cycle(deadline).await?)
            }
            Phase::WarmupMaintenance => {
                TickReport::Warmup(phase, self.warmup.maintenance(deadline).await?)
            }
            Phase::ReplyCheck => TickReport::ReplyCheck(self.reconciler.run_cycle(deadline).await?),
        };

        info!(
            phase = phase.name(),
            elapsed = ?started.elapsed(),
            report = ?report,
            "Tick complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_maps_to_phases_in_rotation_order() {
        assert_eq!(Phase::from_cursor(0), Phase::Send);
        assert_eq!(Phase::from_cursor(1), Phase::WarmupGenerate);
        assert_eq!(Phase::from_cursor(2), Phase::WarmupPool);
        assert_eq!(Phase::from_cursor(3), Phase::WarmupMaintenance);
        assert_eq!(Phase::from_cursor(4), Phase::ReplyCheck);
        assert_eq!(Phase::from_cursor(5), Phase::Send);
    }

    #[test]
    fn expired_deadline_reports_expired() {
        let deadline = Deadline::already_expired();
        assert!(deadline.expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[test]
    fn margin_shrinks_the_budget() {
        let deadline = Deadline::start(Duration::from_secs(60), Duration::from_secs(5));
        assert!(!deadline.expired());
        assert!(deadline.remaining() <= Duration::from_secs(55));
    }

    #[test]
    fn margin_larger_than_budget_expires_immediately() {
        let deadline = Deadline::start(Duration::from_secs(3), Duration::from_secs(10));
        assert!(deadline.expired());
    }
}
