//! Capacity planning — pure functions over account counters.
//!
//! Everything that spends account capacity (scheduler, warmup) consults
//! these before dispatching; they are also used to pre-validate a campaign
//! launch with a days-to-complete estimate.

use crate::model::{AccountStatus, EmailAccount};

/// Which capacity pool a send draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityMode {
    /// Campaign sends, bounded by `daily_limit`.
    Regular,
    /// Warmup sends, bounded by the ramp curve.
    Warmup,
}

/// Today's warmup allowance: `day × daily_increase`, capped at
/// `warmup_max_per_day`.
pub fn warmup_ramp(account: &EmailAccount) -> u32 {
    account
        .warmup_current_day
        .saturating_mul(account.warmup_daily_increase)
        .min(account.warmup_max_per_day)
}

/// Remaining sends for an account today in the given mode.
pub fn remaining_capacity(account: &EmailAccount, mode: CapacityMode) -> u32 {
    match mode {
        CapacityMode::Regular => account.daily_limit.saturating_sub(account.sent_today),
        CapacityMode::Warmup => warmup_ramp(account).saturating_sub(account.warmup_sent_today),
    }
}

/// Sum of remaining capacity across active accounts.
pub fn aggregate_capacity(accounts: &[EmailAccount], mode: CapacityMode) -> u32 {
    accounts
        .iter()
        .filter(|a| a.status == AccountStatus::Active)
        .map(|a| remaining_capacity(a, mode))
        .sum()
}

/// Launch pre-validation estimate. Surfaced as a warning, never a hard
/// block — aggregate capacity grows daily as warmup ramps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchEstimate {
    pub total_leads: u64,
    pub daily_throughput: u32,
    pub estimated_days: u64,
}

/// Estimate days to first-touch every lead given aggregate account
/// capacity and the campaign's own daily limit.
pub fn estimate_days_to_complete(
    total_leads: u64,
    aggregate: u32,
    campaign_daily_limit: u32,
) -> LaunchEstimate {
    let daily_throughput = aggregate.min(campaign_daily_limit);
    let estimated_days = if daily_throughput == 0 {
        u64::MAX
    } else {
        total_leads.div_ceil(u64::from(daily_throughput))
    };
    LaunchEstimate {
        total_leads,
        daily_throughput,
        estimated_days,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn account() -> EmailAccount {
        EmailAccount::new("a@example.com", SecretString::from("pw"))
    }

    #[test]
    fn regular_capacity_is_limit_minus_sent() {
        let mut a = account();
        a.daily_limit = 10;
        a.sent_today = 9;
        assert_eq!(remaining_capacity(&a, CapacityMode::Regular), 1);
    }

    #[test]
    fn regular_capacity_never_negative() {
        let mut a = account();
        a.daily_limit = 10;
        a.sent_today = 12;
        assert_eq!(remaining_capacity(&a, CapacityMode::Regular), 0);
    }

    #[test]
    fn warmup_ramp_caps_at_max_per_day() {
        // day 3 × 5/day = 15, capped at 12
        let mut a = account();
        a.warmup_current_day = 3;
        a.warmup_daily_increase = 5;
        a.warmup_max_per_day = 12;
        assert_eq!(warmup_ramp(&a), 12);

        a.warmup_sent_today = 4;
        assert_eq!(remaining_capacity(&a, CapacityMode::Warmup), 8);
    }

    #[test]
    fn warmup_ramp_below_cap() {
        let mut a = account();
        a.warmup_current_day = 2;
        a.warmup_daily_increase = 5;
        a.warmup_max_per_day = 40;
        assert_eq!(warmup_ramp(&a), 10);
    }

    #[test]
    fn aggregate_skips_errored_accounts() {
        let mut healthy = account();
        healthy.daily_limit = 10;
        healthy.sent_today = 3;

        let mut broken = account();
        broken.daily_limit = 50;
        broken.status = AccountStatus::Error;

        let accounts = vec![healthy, broken];
        assert_eq!(aggregate_capacity(&accounts, CapacityMode::Regular), 7);
    }

    #[test]
    fn estimate_rounds_up_and_honors_campaign_limit() {
        let est = estimate_days_to_complete(101, 500, 50);
        assert_eq!(est.daily_throughput, 50);
        assert_eq!(est.estimated_days, 3);
    }

    #[test]
    fn estimate_with_zero_throughput_is_unbounded() {
        let est = estimate_days_to_complete(10, 0, 50);
        assert_eq!(est.estimated_days, u64::MAX);
    }
}
