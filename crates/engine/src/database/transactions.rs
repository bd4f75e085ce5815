//! Transaction entry points and retry logic
//!
//! The `Database` methods that open transactions, and the backoff policy
//! for retrying a transaction that lost a write conflict.

use std::time::Duration;
use tempo_core::{BranchName, TempoError, TempoResult};
use tracing::debug;

use super::Database;
use crate::transaction::Transaction;

// ============================================================================
// Conflict retries
// ============================================================================

/// Backoff policy for [`Database::transaction_with_retry`]
///
/// Only `CommitConflict` is retried. Each retry opens a fresh transaction
/// at the branch's current `now`, so the closure re-reads the write it lost
/// to. The wait before retry `n` (zero-based) is `initial_backoff * 2^n`,
/// never longer than `max_backoff`.
///
/// # Example
/// ```ignore
/// let retry = RetryConfig::new()
///     .with_max_retries(5)
///     .with_backoff(Duration::from_millis(1), Duration::from_millis(20));
/// db.transaction_with_retry(&master, retry, |tx| { ... })?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Wait before the first retry
    pub initial_backoff: Duration,
    /// Ceiling on a single wait
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
        }
    }
}

impl RetryConfig {
    /// Three retries, 10ms doubling up to 100ms
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up on the first conflict
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set how many retries follow the first attempt
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the first wait and the ceiling
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Wait before retry number `retry`
    pub(crate) fn backoff(&self, retry: usize) -> Duration {
        let factor = 1u32 << retry.min(31);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

// ============================================================================
// Opening transactions
// ============================================================================

impl Database {
    /// Open a transaction reading at the branch's current `now`
    pub fn begin(&self, branch: &BranchName) -> TempoResult<Transaction<'_>> {
        let now = {
            let _shared = self.locks().database_shared();
            self.store().info(branch)?.now
        };
        Ok(Transaction::new(self, branch.clone(), now))
    }

    /// Open a transaction reading at `timestamp`
    ///
    /// Fails with `InvalidTemporalRange` if `timestamp` is after the
    /// branch's `now`.
    pub fn begin_at(&self, branch: &BranchName, timestamp: u64) -> TempoResult<Transaction<'_>> {
        let now = {
            let _shared = self.locks().database_shared();
            self.store().info(branch)?.now
        };
        if timestamp > now {
            return Err(TempoError::invalid_range(format!(
                "transaction timestamp {} is after now {} of branch '{}'",
                timestamp, now, branch
            )));
        }
        Ok(Transaction::new(self, branch.clone(), timestamp))
    }

    /// Run `f` in a transaction and commit it when `f` succeeds
    ///
    /// Returns the closure's value and the commit timestamp. The
    /// transaction is rolled back when `f` fails.
    pub fn transaction<F, T>(&self, branch: &BranchName, f: F) -> TempoResult<(T, u64)>
    where
        F: FnOnce(&mut Transaction<'_>) -> TempoResult<T>,
    {
        let mut tx = self.begin(branch)?;
        match f(&mut tx) {
            Ok(value) => {
                let timestamp = tx.commit(None)?;
                Ok((value, timestamp))
            }
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }

    /// Like [`transaction`](Self::transaction), retrying on commit conflicts
    pub fn transaction_with_retry<F, T>(&self, branch: &BranchName, config: RetryConfig, f: F) -> TempoResult<(T, u64)>
    where
        F: Fn(&mut Transaction<'_>) -> TempoResult<T>,
    {
        let mut retry = 0;
        loop {
            match self.transaction(branch, &f) {
                Err(e) if e.is_conflict() && retry < config.max_retries => {
                    let wait = config.backoff(retry);
                    debug!(target: "tempo::commit", branch = %branch, retry, ?wait, "Retrying after conflict");
                    std::thread::sleep(wait);
                    retry += 1;
                }
                outcome => return outcome,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let config = RetryConfig::new().with_backoff(Duration::from_millis(10), Duration::from_millis(50));
        assert_eq!(config.backoff(0), Duration::from_millis(10));
        assert_eq!(config.backoff(2), Duration::from_millis(40));
        assert_eq!(config.backoff(3), Duration::from_millis(50));
        assert_eq!(config.backoff(200), Duration::from_millis(50));
    }

    #[test]
    fn test_no_retry() {
        assert_eq!(RetryConfig::no_retry().max_retries, 0);
        assert_eq!(RetryConfig::new().with_max_retries(7).max_retries, 7);
        assert_eq!(RetryConfig::no_retry().initial_backoff, RetryConfig::default().initial_backoff);
    }
}
