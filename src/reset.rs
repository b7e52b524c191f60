//! Daily counter reset.
//!
//! Zeroes per-account daily counters at day rollover and advances the
//! warmup ramp for accounts still below their cap. The whole sweep is a
//! single conditional UPDATE keyed on the stored last-reset date, so it
//! is idempotent within a calendar day and safe under overlapping
//! invocations.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::error::Result;
use crate::store::Store;

/// The daily reset job.
pub struct DailyResetJob {
    store: Arc<dyn Store>,
}

impl DailyResetJob {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Reset counters for accounts not yet stamped with today's date.
    /// Returns the number of accounts reset (0 on repeat invocations).
    pub async fn run(&self) -> Result<u64> {
        let today = Utc::now().date_naive();
        let reset = self.store.reset_daily_counters(today).await?;
        if reset > 0 {
            info!(accounts = reset, %today, "Daily counters reset");
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EmailAccount;
    use crate::store::LibSqlStore;
    use secrecy::SecretString;

    #[tokio::test]
    async fn second_run_same_day_is_a_noop() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let mut account = EmailAccount::new("a@x.com", SecretString::from("pw"));
        account.sent_today = 5;
        store.insert_account(&account).await.unwrap();

        let job = DailyResetJob::new(store.clone());
        assert_eq!(job.run().await.unwrap(), 1);
        assert_eq!(job.run().await.unwrap(), 0);

        let loaded = store.get_account(account.id).await.unwrap().unwrap();
        assert_eq!(loaded.sent_today, 0);
    }

    #[tokio::test]
    async fn ramp_stops_advancing_at_cap() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let mut account = EmailAccount::new("a@x.com", SecretString::from("pw"));
        account.warmup_enabled = true;
        // 4 × 5 = 20 ≥ 18: already at cap, day must not advance.
        account.warmup_current_day = 4;
        account.warmup_daily_increase = 5;
        account.warmup_max_per_day = 18;
        store.insert_account(&account).await.unwrap();

        DailyResetJob::new(store.clone()).run().await.unwrap();

        let loaded = store.get_account(account.id).await.unwrap().unwrap();
        assert_eq!(loaded.warmup_current_day, 4);
    }
}
