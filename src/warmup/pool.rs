//! Warmup pool membership and pairing.
//!
//! The pool is ephemeral: recomputed each run from the accounts that are
//! active with warmup enabled. Pairing walks the ring with a per-run
//! offset so consecutive runs rotate partners and no account is paired
//! with itself.

use crate::model::EmailAccount;

/// One run's warmup rotation group.
pub struct WarmupPool {
    accounts: Vec<EmailAccount>,
    /// Ring offset for this run, in `1..len`.
    offset: usize,
}

impl WarmupPool {
    /// Build the pool for this run. Returns `None` when fewer than two
    /// accounts are eligible — warmup traffic needs a counterparty.
    pub fn new(accounts: Vec<EmailAccount>, offset_seed: usize) -> Option<Self> {
        if accounts.len() < 2 {
            return None;
        }
        let offset = 1 + offset_seed % (accounts.len() - 1);
        Some(Self { accounts, offset })
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn members(&self) -> &[EmailAccount] {
        &self.accounts
    }

    /// The partner the `i`-th member sends to this run.
    pub fn partner_of(&self, i: usize) -> &EmailAccount {
        &self.accounts[(i + self.offset) % self.accounts.len()]
    }

    /// Successor pairing used by the reciprocal pool cycle: every member
    /// receives from exactly one other member.
    pub fn successor_of(&self, i: usize) -> &EmailAccount {
        &self.accounts[(i + 1) % self.accounts.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn accounts(n: usize) -> Vec<EmailAccount> {
        (0..n)
            .map(|i| EmailAccount::new(&format!("warm{i}@x.com"), SecretString::from("pw")))
            .collect()
    }

    #[test]
    fn pool_requires_two_members() {
        assert!(WarmupPool::new(accounts(0), 0).is_none());
        assert!(WarmupPool::new(accounts(1), 0).is_none());
        assert!(WarmupPool::new(accounts(2), 0).is_some());
    }

    #[test]
    fn nobody_is_paired_with_themselves() {
        for seed in 0..10 {
            let pool = WarmupPool::new(accounts(5), seed).unwrap();
            for i in 0..pool.len() {
                assert_ne!(pool.members()[i].id, pool.partner_of(i).id);
                assert_ne!(pool.members()[i].id, pool.successor_of(i).id);
            }
        }
    }

    #[test]
    fn different_seeds_rotate_partners() {
        let pool_a = WarmupPool::new(accounts(4), 0).unwrap();
        let pool_b = {
            // Same membership, next run's seed.
            let members = pool_a.members().to_vec();
            WarmupPool::new(members, 1).unwrap()
        };
        assert_ne!(pool_a.partner_of(0).id, pool_b.partner_of(0).id);
    }

    #[test]
    fn successor_pairing_covers_everyone() {
        let pool = WarmupPool::new(accounts(4), 2).unwrap();
        let mut receivers: Vec<_> = (0..pool.len()).map(|i| pool.successor_of(i).id).collect();
        receivers.sort();
        receivers.dedup();
        assert_eq!(receivers.len(), pool.len());
    }
}
