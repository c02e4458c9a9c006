// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use crate::modules::account::{default_account, Account, DEFAULT_ACCOUNT_ID};
use crate::modules::attachment::AttachmentResolver;
use crate::modules::cache::ContentCache;
use crate::modules::cleanup::CleanupLoop;
use crate::modules::common::auth::OutboundAuth;
use crate::modules::common::periodic::{PeriodicTask, TaskHandle};
use crate::modules::dispatch::DispatchLoop;
use crate::modules::error::{code::ErrorCode, RelayMailResult};
use crate::modules::limiter::RateLimiter;
use crate::modules::message::payload::SubmitMessage;
use crate::modules::message::{normalise_priority, QueuedMessage, PRIORITY_MEDIUM};
use crate::modules::report::ReportLoop;
use crate::modules::settings::cli::SETTINGS;
use crate::modules::smtp::classify::RetrySchedule;
use crate::modules::smtp::pool::DeliveryTransport;
use crate::modules::store::{MailStore, NewMessage, RejectedMessage};
use crate::modules::tenant::Tenant;
use crate::modules::utils::{validate_email, validate_id};
use crate::{raise_error, utc_now};


#[derive(Clone, Debug, Default)]
pub struct SubmitOutcome {
    pub queued: usize,
    pub rejected: Vec<RejectedMessage>,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub struct SuspensionSnapshot {
    pub tenant_id: String,
    pub suspend_all: bool,
    pub batches: Vec<String>,
}

impl SuspensionSnapshot {
    fn from_tenant(tenant: &Tenant) -> Self {
        Self {
            tenant_id: tenant.id.clone(),
            suspend_all: tenant.is_fully_suspended(),
            batches: tenant
                .suspended_batches
                .iter()
                .filter(|batch| batch.as_str() != Tenant::SUSPEND_ALL)
                .cloned()
                .collect(),
        }
    }
}

/// Owns the loop lifecycles, the wake signalling, and the control
/// operations an outer control plane consumes.
pub struct MailRelay {
    store: Arc<MailStore>,
    dispatch: Arc<DispatchLoop>,
    report: Arc<ReportLoop>,
    cleanup: Arc<CleanupLoop>,
    active: Arc<AtomicBool>,
    dispatch_wake: Arc<Notify>,
    report_wake: Arc<Notify>,
    handles: Mutex<Vec<TaskHandle>>,
}

impl MailRelay {
    pub fn new(
        store: Arc<MailStore>,
        transport: Arc<dyn DeliveryTransport>,
        cache: Arc<ContentCache>,
    ) -> Self {
        let active = Arc::new(AtomicBool::new(SETTINGS.relaymail_start_active));
        let dispatch_wake = Arc::new(Notify::new());
        let report_wake = Arc::new(Notify::new());

        let limiter = Arc::new(RateLimiter::new(store.clone()));
        let resolver = Arc::new(AttachmentResolver::new(
            cache.clone(),
            SETTINGS.relaymail_attachment_base_dir.clone(),
            Duration::from_secs(SETTINGS.relaymail_attachment_timeout),
            SETTINGS.relaymail_attachment_concurrency,
        ));
        let dispatch = Arc::new(DispatchLoop::new(
            store.clone(),
            limiter,
            resolver,
            transport,
            RetrySchedule::with_max_retries(SETTINGS.relaymail_max_retries),
            active.clone(),
            report_wake.clone(),
            SETTINGS.relaymail_max_concurrent_sends,
            SETTINGS.relaymail_max_concurrent_per_account,
            SETTINGS.relaymail_dispatch_batch_size,
            SETTINGS.relaymail_account_batch_size,
        ));
        let fallback_auth = match &SETTINGS.relaymail_report_sink_token {
            Some(token) => OutboundAuth::Bearer {
                token: token.clone(),
            },
            None => OutboundAuth::None,
        };
        let report = Arc::new(ReportLoop::new(
            store.clone(),
            SETTINGS.relaymail_report_batch_size,
            Duration::from_secs(SETTINGS.relaymail_report_timeout),
            SETTINGS.relaymail_report_sink_url.clone(),
            fallback_auth,
        ));
        let cleanup = Arc::new(CleanupLoop::new(
            store.clone(),
            cache,
            SETTINGS.relaymail_retention_days,
        ));

        Self {
            store,
            dispatch,
            report,
            cleanup,
            active,
            dispatch_wake,
            report_wake,
            handles: Mutex::new(Vec::new()),
        }
    }

    // ------------------------------------------------------------ lifecycle

    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return;
        }

        let dispatch = self.dispatch.clone();
        handles.push(PeriodicTask::new("smtp-dispatch").start(
            move || {
                let dispatch = dispatch.clone();
                async move { dispatch.run_cycle().await }
            },
            Some(self.dispatch_wake.clone()),
            Duration::from_secs(SETTINGS.relaymail_dispatch_interval),
            true,
        ));

        let report = self.report.clone();
        handles.push(PeriodicTask::new("delivery-report").start(
            move || {
                let report = report.clone();
                async move { report.run_cycle().await }
            },
            Some(self.report_wake.clone()),
            Duration::from_secs(SETTINGS.relaymail_report_interval),
            false,
        ));

        let cleanup = self.cleanup.clone();
        handles.push(PeriodicTask::new("queue-cleanup").start(
            move || {
                let cleanup = cleanup.clone();
                async move { cleanup.run_cycle().await }
            },
            None,
            Duration::from_secs(SETTINGS.relaymail_cleanup_interval),
            false,
        ));

        info!("MailRelay engine started");
    }

    /// Stop all loops, giving in-flight work a bounded grace period.
    pub async fn stop(&self) {
        let grace = Duration::from_secs(SETTINGS.relaymail_shutdown_grace);
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if tokio::time::timeout(grace, handle.cancel()).await.is_err() {
                warn!("Loop did not stop within the grace period, detaching");
            }
        }
        info!("MailRelay engine stopped");
    }

    /// Engine-level pause switch; per-tenant suspension is separate.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
        if active {
            self.dispatch_wake.notify_one();
        }
    }

    // ----------------------------------------------------------- operations

    pub async fn submit(
        &self,
        tenant_id: Option<&str>,
        default_priority: Option<u8>,
        messages: Vec<SubmitMessage>,
    ) -> RelayMailResult<SubmitOutcome> {
        if messages.len() > SETTINGS.relaymail_max_submit_batch {
            return Err(raise_error!(
                format!(
                    "Cannot enqueue more than {} messages at once",
                    SETTINGS.relaymail_max_submit_batch
                ),
                ErrorCode::ExceedsLimitation
            ));
        }
        if let Some(tenant_id) = tenant_id {
            if self.store.get_tenant(tenant_id).await?.is_none() {
                return Err(raise_error!(
                    format!("tenant '{}' not found", tenant_id),
                    ErrorCode::ResourceNotFound
                ));
            }
        }
        let default_priority = normalise_priority(default_priority, PRIORITY_MEDIUM);

        let mut entries = Vec::new();
        let mut rejected = Vec::new();
        for message in messages {
            match self.validate_submission(tenant_id, default_priority, message).await {
                Ok(entry) => entries.push(entry),
                Err(rejection) => rejected.push(rejection),
            }
        }

        let mut outcome = self.store.insert_messages(entries, utc_now!()).await?;
        outcome.rejected.extend(rejected);
        if !outcome.accepted.is_empty() {
            self.dispatch_wake.notify_one();
        }
        Ok(SubmitOutcome {
            queued: outcome.accepted.len(),
            rejected: outcome.rejected,
        })
    }

    async fn validate_submission(
        &self,
        tenant_id: Option<&str>,
        default_priority: u8,
        message: SubmitMessage,
    ) -> Result<NewMessage, RejectedMessage> {
        let reject = |id: &str, reason: &str| RejectedMessage {
            id: if id.is_empty() { None } else { Some(id.to_string()) },
            reason: reason.to_string(),
        };

        if validate_id(&message.id, "id").is_err() {
            return Err(reject(&message.id, "missing id"));
        }
        if message.from.is_empty() {
            return Err(reject(&message.id, "missing from"));
        }
        if validate_email(&message.from).is_err() {
            return Err(reject(&message.id, "invalid from address"));
        }
        if message.subject.is_empty() {
            return Err(reject(&message.id, "missing subject"));
        }
        if message.body.is_empty() {
            return Err(reject(&message.id, "missing body"));
        }
        if let Some(deferred_ts) = message.deferred_ts {
            if deferred_ts < 0 {
                return Err(reject(&message.id, "invalid deferred_ts"));
            }
        }

        // Without an explicit account the settings-level default endpoint
        // takes over, when one is configured.
        let account_id = match message.account_id.clone() {
            Some(account_id) => account_id,
            None => match default_account(&SETTINGS) {
                Some(account) => account.id,
                None => return Err(reject(&message.id, "missing account configuration")),
            },
        };
        match self.store.get_account(&account_id).await {
            Ok(Some(account)) => {
                // An account bound to another tenant is invisible here.
                if account.tenant_id.is_some() && account.tenant_id.as_deref() != tenant_id {
                    return Err(reject(&message.id, "account not found"));
                }
            }
            // The default endpoint exists only in settings, not in storage.
            Ok(None) if account_id == DEFAULT_ACCOUNT_ID && default_account(&SETTINGS).is_some() => {
            }
            Ok(None) => return Err(reject(&message.id, "account not found")),
            Err(_) => return Err(reject(&message.id, "account not found")),
        }

        let priority = normalise_priority(message.priority, default_priority);
        let deferred_ts = message.deferred_ts;
        let batch_code = message.batch_code.clone();
        let id = message.id.clone();
        let payload = message.into_payload();

        if payload.to.is_empty() {
            return Err(reject(&id, "missing to"));
        }
        for recipient in payload.recipients() {
            if validate_email(&recipient).is_err() {
                return Err(reject(&id, "invalid recipient address"));
            }
        }

        Ok(NewMessage {
            id,
            tenant_id: tenant_id.map(str::to_string),
            account_id,
            priority,
            batch_code,
            deferred_ts,
            payload,
        })
    }

    pub async fn list_messages(
        &self,
        tenant_id: Option<&str>,
        active_only: bool,
    ) -> RelayMailResult<Vec<QueuedMessage>> {
        self.store
            .list_messages(tenant_id.map(str::to_string), active_only)
            .await
    }

    pub async fn delete_messages(
        &self,
        tenant_id: Option<&str>,
        ids: Vec<String>,
    ) -> RelayMailResult<(usize, Vec<String>)> {
        self.store
            .delete_messages(tenant_id.map(str::to_string), ids)
            .await
    }

    /// Suspend a tenant's dispatching: wholesale without a batch tag, or a
    /// single batch. Suspending a batch while everything is already
    /// suspended leaves the sentinel in place.
    pub async fn suspend(
        &self,
        tenant_id: &str,
        batch_code: Option<&str>,
    ) -> RelayMailResult<SuspensionSnapshot> {
        let batch_code = batch_code.map(str::to_string);
        let tenant = self
            .store
            .update_suspension(tenant_id, utc_now!(), move |current| {
                let mut updated = current.clone();
                match &batch_code {
                    None => {
                        updated.clear();
                        updated.insert(Tenant::SUSPEND_ALL.to_string());
                    }
                    Some(batch) => {
                        if !updated.contains(Tenant::SUSPEND_ALL) {
                            updated.insert(batch.clone());
                        }
                    }
                }
                Ok(updated)
            })
            .await?;
        Ok(SuspensionSnapshot::from_tenant(&tenant))
    }

    /// Mirror of [`suspend`]: without a batch the whole set clears; with a
    /// batch only that tag is lifted. Lifting a single batch while the
    /// suspend-all sentinel is present is refused.
    pub async fn activate(
        &self,
        tenant_id: &str,
        batch_code: Option<&str>,
    ) -> RelayMailResult<SuspensionSnapshot> {
        let batch_code = batch_code.map(str::to_string);
        let tenant = self
            .store
            .update_suspension(tenant_id, utc_now!(), move |current| {
                let mut updated: BTreeSet<String> = current.clone();
                match &batch_code {
                    None => updated.clear(),
                    Some(batch) => {
                        if updated.contains(Tenant::SUSPEND_ALL) {
                            return Err(raise_error!(
                                "cannot activate a single batch while all sending is suspended"
                                    .into(),
                                ErrorCode::Conflict
                            ));
                        }
                        updated.remove(batch);
                    }
                }
                Ok(updated)
            })
            .await?;
        self.dispatch_wake.notify_one();
        Ok(SuspensionSnapshot::from_tenant(&tenant))
    }

    /// Signal-only: wake the dispatch and report loops; the report loop's
    /// next cycle narrows to the given tenant.
    pub async fn run_now(&self, tenant_id: Option<&str>) {
        self.report
            .set_target_tenant(tenant_id.map(str::to_string))
            .await;
        self.dispatch_wake.notify_one();
        self.report_wake.notify_one();
    }

    // -------------------------------------------- account & tenant registry

    pub async fn upsert_account(&self, account: Account) -> RelayMailResult<()> {
        self.store.upsert_account(account).await
    }

    pub async fn list_accounts(&self) -> RelayMailResult<Vec<Account>> {
        self.store.list_accounts().await
    }

    pub async fn delete_account(&self, id: &str) -> RelayMailResult<bool> {
        self.store.delete_account(id).await
    }

    pub async fn upsert_tenant(&self, tenant: Tenant) -> RelayMailResult<()> {
        self.store.upsert_tenant(tenant).await
    }

    pub async fn list_tenants(&self) -> RelayMailResult<Vec<Tenant>> {
        self.store.list_tenants().await
    }

    pub async fn delete_tenant(&self, id: &str) -> RelayMailResult<()> {
        self.store.delete_tenant(id).await
    }
}
