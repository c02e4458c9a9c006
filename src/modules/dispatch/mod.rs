// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use futures::{stream, StreamExt};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

use crate::modules::account::{default_account, Account};
use crate::modules::attachment::AttachmentResolver;
use crate::modules::error::RelayMailResult;
use crate::modules::limiter::{Admission, RateLimiter};
use crate::modules::message::QueuedMessage;
use crate::modules::settings::cli::SETTINGS;
use crate::modules::smtp::classify::{classify, RetrySchedule, SendVerdict};
use crate::modules::smtp::composer::compose;
use crate::modules::smtp::pool::DeliveryTransport;
use crate::modules::store::MailStore;
use crate::modules::tenant::Tenant;
use crate::utc_now;

pub const RATE_LIMITED_ERROR: &str = "rate_limited";

/// The delivery engine's main loop body: claim ready messages, group them
/// by account, drive sends through the transport, and record every outcome.
pub struct DispatchLoop {
    store: Arc<MailStore>,
    limiter: Arc<RateLimiter>,
    resolver: Arc<AttachmentResolver>,
    transport: Arc<dyn DeliveryTransport>,
    schedule: RetrySchedule,
    active: Arc<AtomicBool>,
    report_wake: Arc<Notify>,
    /// Global bound on concurrent SMTP transactions
    send_permits: Arc<Semaphore>,
    workers_per_account: usize,
    batch_size: usize,
    default_account_batch: u32,
}

impl DispatchLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<MailStore>,
        limiter: Arc<RateLimiter>,
        resolver: Arc<AttachmentResolver>,
        transport: Arc<dyn DeliveryTransport>,
        schedule: RetrySchedule,
        active: Arc<AtomicBool>,
        report_wake: Arc<Notify>,
        max_concurrent_sends: usize,
        workers_per_account: usize,
        batch_size: usize,
        default_account_batch: u32,
    ) -> Self {
        Self {
            store,
            limiter,
            resolver,
            transport,
            schedule,
            active,
            report_wake,
            send_permits: Arc::new(Semaphore::new(max_concurrent_sends.max(1))),
            workers_per_account: workers_per_account.max(1),
            batch_size: batch_size.max(1),
            default_account_batch,
        }
    }

    /// One iteration. Storage errors abort the iteration and surface to the
    /// periodic runner, which logs and retries next tick; per-message
    /// failures never escape their worker.
    pub async fn run_cycle(&self) -> RelayMailResult<()> {
        if !self.active.load(Ordering::Relaxed) {
            return Ok(());
        }
        let processed = self.process_cycle().await?;
        if processed > 0 {
            // Fresh terminal states are worth reporting without waiting for
            // the report loop's fallback tick.
            self.report_wake.notify_one();
        }
        Ok(())
    }

    async fn process_cycle(&self) -> RelayMailResult<usize> {
        let now = utc_now!();
        let mut accounts: AHashMap<String, Account> = self
            .store
            .list_accounts()
            .await?
            .into_iter()
            .map(|account| (account.id.clone(), account))
            .collect();
        // A stored account under the default id shadows the settings-level
        // fallback endpoint.
        if let Some(default) = default_account(&SETTINGS) {
            accounts.entry(default.id.clone()).or_insert(default);
        }
        if accounts.is_empty() {
            return Ok(0);
        }
        let tenants: AHashMap<String, Tenant> = self
            .store
            .list_tenants()
            .await?
            .into_iter()
            .map(|tenant| (tenant.id.clone(), tenant))
            .collect();

        // Per-account claim budget: the batch-size hint. Window capacity is
        // enforced per message below, so over-quota claims still get their
        // not-before stamp pushed out instead of spinning every tick.
        let quotas: AHashMap<String, u32> = accounts
            .values()
            .map(|account| {
                let hint = account.batch_size.unwrap_or(self.default_account_batch).max(1);
                (account.id.clone(), hint)
            })
            .collect();

        let claimed = self
            .store
            .claim_ready(now, quotas, self.batch_size)
            .await?;
        if claimed.is_empty() {
            return Ok(0);
        }
        debug!("Claimed {} message(s) for dispatch", claimed.len());

        let mut order: Vec<String> = Vec::new();
        let mut groups: AHashMap<String, Vec<QueuedMessage>> = AHashMap::new();
        for message in claimed {
            if !groups.contains_key(&message.account_id) {
                order.push(message.account_id.clone());
            }
            groups.entry(message.account_id.clone()).or_default().push(message);
        }

        let processed = AtomicUsize::new(0);
        stream::iter(order)
            .for_each_concurrent(None, |account_id| {
                let group = groups.remove(&account_id).unwrap_or_default();
                let accounts = &accounts;
                let tenants = &tenants;
                let processed = &processed;
                async move {
                    let Some(account) = accounts.get(&account_id) else {
                        return;
                    };
                    let count = self.process_account(account, tenants, group).await;
                    processed.fetch_add(count, Ordering::Relaxed);
                }
            })
            .await;
        Ok(processed.load(Ordering::Relaxed))
    }

    /// Drive one account's claimed messages. The first `allowance` messages
    /// (this cycle's window capacity, measured before any of them hit the
    /// wire) go to the send path in claim order; the rest get their
    /// not-before instants recomputed by the limiter.
    async fn process_account(
        &self,
        account: &Account,
        tenants: &AHashMap<String, Tenant>,
        messages: Vec<QueuedMessage>,
    ) -> usize {
        let now = utc_now!();
        let allowance = match self.limiter.remaining_quota(account, now).await {
            Ok(quota) => quota as usize,
            Err(e) => {
                warn!("Quota check failed for account '{}': {:?}", account.id, e);
                return 0;
            }
        };

        let mut send_now = messages;
        let over_limit = if send_now.len() > allowance {
            send_now.split_off(allowance)
        } else {
            Vec::new()
        };

        let processed = AtomicUsize::new(0);
        stream::iter(send_now)
            .for_each_concurrent(self.workers_per_account, |message| {
                let processed = &processed;
                async move {
                    let tenant = message
                        .tenant_id
                        .as_ref()
                        .and_then(|tenant_id| tenants.get(tenant_id));
                    if self.deliver_one(account, tenant, message).await {
                        processed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
            .await;

        for message in over_limit {
            if self.handle_rate_limited(account, &message).await {
                processed.fetch_add(1, Ordering::Relaxed);
            }
        }
        processed.load(Ordering::Relaxed)
    }

    /// Attempt one delivery end to end. Returns true when an outcome was
    /// recorded, so the cycle knows work happened.
    async fn deliver_one(
        &self,
        account: &Account,
        tenant: Option<&Tenant>,
        message: QueuedMessage,
    ) -> bool {
        let Ok(_permit) = self.send_permits.acquire().await else {
            return false;
        };
        let now = utc_now!();

        match self.limiter.check(account, now).await {
            Ok(Admission::Admit) => {}
            Ok(Admission::Defer { next_try_ts }) => {
                if let Err(e) = self.store.mark_deferred(message.key, now, next_try_ts).await {
                    warn!("Failed to defer message '{}': {:?}", message.id, e);
                }
                return true;
            }
            Ok(Admission::Reject) => {
                if let Err(e) = self
                    .store
                    .mark_error(
                        message.key,
                        now,
                        RATE_LIMITED_ERROR.into(),
                        None,
                        message.retry_count,
                    )
                    .await
                {
                    warn!("Failed to reject message '{}': {:?}", message.id, e);
                }
                return true;
            }
            Err(e) => {
                warn!("Rate check failed for account '{}': {:?}", account.id, e);
                return false;
            }
        }

        let attachments = match self
            .resolver
            .resolve_all(&message.payload.attachments, tenant)
            .await
        {
            Ok(attachments) => attachments,
            Err(e) => {
                // Attachment trouble is retryable; the source may recover.
                self.record_failure(&message, SendVerdict::Transient(e.message().to_string()))
                    .await;
                return true;
            }
        };

        let body = match compose(message.key, &message.payload, &attachments) {
            Ok(body) => body,
            Err(e) => {
                self.record_failure(&message, SendVerdict::Permanent(e.message().to_string()))
                    .await;
                return true;
            }
        };

        let recipients = message.payload.recipients();
        match self
            .transport
            .deliver(account, message.payload.envelope_from(), &recipients, &body)
            .await
        {
            Ok(()) => {
                let sent_ts = utc_now!();
                if let Err(e) = self.store.append_send_log(&account.id, sent_ts).await {
                    warn!("Send-log append failed for account '{}': {:?}", account.id, e);
                }
                if let Err(e) = self.store.mark_sent(message.key, sent_ts).await {
                    warn!("Failed to mark message '{}' sent: {:?}", message.id, e);
                }
                debug!(
                    "Delivered message '{}' via account '{}'",
                    message.id, account.id
                );
            }
            Err(e) => {
                self.record_failure(&message, classify(&e)).await;
            }
        }
        true
    }

    /// A message claimed beyond this cycle's window capacity: ask the
    /// limiter (which now sees the cycle's send-log rows) when to try
    /// again. `Admit` means capacity survived after all, e.g. because sends
    /// failed; the message simply stays pending.
    async fn handle_rate_limited(&self, account: &Account, message: &QueuedMessage) -> bool {
        let now = utc_now!();
        match self.limiter.check(account, now).await {
            Ok(Admission::Admit) => false,
            Ok(Admission::Defer { next_try_ts }) => {
                if let Err(e) = self.store.mark_deferred(message.key, now, next_try_ts).await {
                    warn!("Failed to defer message '{}': {:?}", message.id, e);
                }
                true
            }
            Ok(Admission::Reject) => {
                if let Err(e) = self
                    .store
                    .mark_error(
                        message.key,
                        now,
                        RATE_LIMITED_ERROR.into(),
                        None,
                        message.retry_count,
                    )
                    .await
                {
                    warn!("Failed to reject message '{}': {:?}", message.id, e);
                }
                true
            }
            Err(e) => {
                warn!("Rate check failed for account '{}': {:?}", account.id, e);
                false
            }
        }
    }

    async fn record_failure(&self, message: &QueuedMessage, verdict: SendVerdict) {
        let now = utc_now!();
        let result = match verdict {
            SendVerdict::Transient(reason) => {
                let next =
                    self.schedule
                        .next_deferred_ts(message.retry_count, now, &mut rand::rng());
                match next {
                    Some(next_deferred_ts) => {
                        warn!(
                            "Transient failure for message '{}' (attempt {}): {}",
                            message.id,
                            message.retry_count + 1,
                            reason
                        );
                        self.store
                            .mark_error(
                                message.key,
                                now,
                                reason,
                                Some(next_deferred_ts),
                                message.retry_count + 1,
                            )
                            .await
                    }
                    None => {
                        warn!(
                            "Message '{}' failed permanently after {} attempts",
                            message.id, message.retry_count
                        );
                        self.store
                            .mark_error(
                                message.key,
                                now,
                                format!("max retries exceeded: {}", reason),
                                None,
                                message.retry_count,
                            )
                            .await
                    }
                }
            }
            SendVerdict::Permanent(reason) => {
                warn!(
                    "Permanent failure for message '{}': {}",
                    message.id, reason
                );
                self.store
                    .mark_error(message.key, now, reason, None, message.retry_count)
                    .await
            }
        };
        if let Err(e) = result {
            warn!(
                "Failed to record outcome for message '{}': {:?}",
                message.id, e
            );
        }
    }
}

#[cfg(test)]
mod tests;
