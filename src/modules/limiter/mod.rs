// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::sync::Arc;

use crate::modules::account::{Account, LimitPolicy};
use crate::modules::error::RelayMailResult;
use crate::modules::store::MailStore;

const WINDOWS: [(i64, fn(&Account) -> Option<u32>); 3] = [
    (60, |a| a.limit_per_minute),
    (3_600, |a| a.limit_per_hour),
    (86_400, |a| a.limit_per_day),
];

/// Admission decision for one send attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Admission {
    Admit,
    /// Earliest instant at which the most binding window regains capacity
    Defer { next_try_ts: i64 },
    Reject,
}

/// Sliding-window admission control over the persisted send-log. The
/// limiter only reads; the send-log row is written by the dispatch loop
/// after the SMTP server has acknowledged the message.
pub struct RateLimiter {
    store: Arc<MailStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<MailStore>) -> Self {
        Self { store }
    }

    /// For each configured window `w` with limit `L`, the count of sends in
    /// `(now - w, now]` must be strictly below `L`. The first window over
    /// its limit decides the outcome according to the account policy.
    pub async fn check(&self, account: &Account, now: i64) -> RelayMailResult<Admission> {
        for (window, limit_of) in WINDOWS {
            let Some(limit) = limit_of(account) else {
                continue;
            };
            let count = self
                .store
                .count_send_log_since(&account.id, now - window)
                .await?;
            if count < limit as usize {
                continue;
            }
            if account.limit_policy == LimitPolicy::Reject {
                return Ok(Admission::Reject);
            }
            let next_try_ts = self
                .store
                .oldest_send_since(&account.id, now - window)
                .await?
                .map(|oldest| oldest + window)
                .unwrap_or(now + window);
            return Ok(Admission::Defer { next_try_ts });
        }
        Ok(Admission::Admit)
    }

    /// Remaining capacity across all configured windows, used by the
    /// dispatch loop to bound how many messages one cycle may claim for the
    /// account. Unlimited accounts admit unconditionally.
    pub async fn remaining_quota(&self, account: &Account, now: i64) -> RelayMailResult<u32> {
        let mut quota = u32::MAX;
        for (window, limit_of) in WINDOWS {
            let Some(limit) = limit_of(account) else {
                continue;
            };
            let count = self
                .store
                .count_send_log_since(&account.id, now - window)
                .await? as u32;
            quota = quota.min(limit.saturating_sub(count));
        }
        Ok(quota)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::database::manager::open_in_memory;

    fn limited_account(per_minute: Option<u32>, policy: LimitPolicy) -> Account {
        Account {
            id: "A".into(),
            host: "smtp.example.test".into(),
            port: 587,
            limit_per_minute: per_minute,
            limit_policy: policy,
            ..Default::default()
        }
    }

    fn fixture() -> (Arc<MailStore>, RateLimiter) {
        let store = Arc::new(MailStore::new(open_in_memory().unwrap()));
        let limiter = RateLimiter::new(store.clone());
        (store, limiter)
    }

    #[tokio::test]
    async fn test_unlimited_account_admits_unconditionally() {
        let (store, limiter) = fixture();
        let account = limited_account(None, LimitPolicy::Defer);
        for ts in 0..5 {
            store.append_send_log("A", ts).await.unwrap();
        }
        assert_eq!(limiter.check(&account, 10).await.unwrap(), Admission::Admit);
        assert_eq!(
            limiter.remaining_quota(&account, 10).await.unwrap(),
            u32::MAX
        );
    }

    #[tokio::test]
    async fn test_defer_points_at_earliest_capacity_instant() {
        let (store, limiter) = fixture();
        let account = limited_account(Some(2), LimitPolicy::Defer);

        store.append_send_log("A", 1000).await.unwrap();
        assert_eq!(
            limiter.check(&account, 1005).await.unwrap(),
            Admission::Admit
        );
        store.append_send_log("A", 1005).await.unwrap();

        // Third send inside the minute: full. The oldest entry leaves the
        // window at 1060.
        assert_eq!(
            limiter.check(&account, 1010).await.unwrap(),
            Admission::Defer { next_try_ts: 1060 }
        );

        // Once the oldest entry ages out, capacity returns.
        assert_eq!(
            limiter.check(&account, 1060).await.unwrap(),
            Admission::Admit
        );
    }

    #[tokio::test]
    async fn test_reject_policy() {
        let (store, limiter) = fixture();
        let account = limited_account(Some(1), LimitPolicy::Reject);
        store.append_send_log("A", 1000).await.unwrap();
        assert_eq!(
            limiter.check(&account, 1010).await.unwrap(),
            Admission::Reject
        );
    }

    #[tokio::test]
    async fn test_remaining_quota_takes_most_binding_window() {
        let (store, limiter) = fixture();
        let mut account = limited_account(Some(10), LimitPolicy::Defer);
        account.limit_per_hour = Some(3);
        store.append_send_log("A", 1000).await.unwrap();
        store.append_send_log("A", 1001).await.unwrap();
        assert_eq!(limiter.remaining_quota(&account, 1010).await.unwrap(), 1);
    }
}
