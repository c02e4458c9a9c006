// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use ahash::AHashMap;
use itertools::Itertools;
use native_db::Database;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::modules::account::Account;
use crate::modules::database::{
    async_find_impl, batch_delete_impl, insert_impl, list_all_impl, update_impl, upsert_impl,
};
use crate::modules::error::{code::ErrorCode, RelayMailResult};
use crate::modules::message::{MessagePayload, QueuedMessage, QueuedMessageKey};
use crate::modules::sendlog::SendLogEntry;
use crate::modules::tenant::Tenant;
use crate::{id, raise_error};

#[cfg(test)]
mod tests;

/// Transactional access to queued messages, accounts, tenants and the
/// send-log, backed by the embedded single-writer database. Multi-step
/// operations (`insert_messages`, `claim_ready`, cascading deletes) run
/// inside one write transaction so concurrent loops observe consistent
/// state.
pub struct MailStore {
    db: Arc<Database<'static>>,
}

/// A validated submission ready to become a queue row.
#[derive(Clone, Debug, Default)]
pub struct NewMessage {
    pub id: String,
    pub tenant_id: Option<String>,
    pub account_id: String,
    pub priority: u8,
    pub batch_code: Option<String>,
    pub deferred_ts: Option<i64>,
    pub payload: MessagePayload,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub struct RejectedMessage {
    pub id: Option<String>,
    pub reason: String,
}

#[derive(Clone, Debug, Default)]
pub struct InsertOutcome {
    pub accepted: Vec<String>,
    pub rejected: Vec<RejectedMessage>,
}

impl MailStore {
    pub fn new(db: Arc<Database<'static>>) -> Self {
        Self { db }
    }

    // ------------------------------------------------------------- messages

    /// Insert a batch of already-validated messages. An id that already
    /// exists within the tenant scope is rejected as `duplicate`, whatever
    /// state the stored row is in; resubmission has no side effects.
    pub async fn insert_messages(
        &self,
        batch: Vec<NewMessage>,
        now: i64,
    ) -> RelayMailResult<InsertOutcome> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let rw = db
                .rw_transaction()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageUnavailable))?;

            let mut outcome = InsertOutcome::default();
            let mut seen: BTreeSet<String> = BTreeSet::new();
            for entry in batch {
                let pk = QueuedMessage::pk_for(entry.tenant_id.as_deref(), &entry.id);
                let existing: Option<QueuedMessage> = rw
                    .get()
                    .primary(pk.clone())
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
                if existing.is_some() || !seen.insert(pk) {
                    outcome.rejected.push(RejectedMessage {
                        id: Some(entry.id),
                        reason: "duplicate".into(),
                    });
                    continue;
                }
                let row = QueuedMessage {
                    key: id!(),
                    id: entry.id.clone(),
                    tenant_id: entry.tenant_id,
                    account_id: entry.account_id,
                    priority: entry.priority,
                    batch_code: entry.batch_code,
                    deferred_ts: entry.deferred_ts.unwrap_or(now),
                    retry_count: 0,
                    last_error: None,
                    payload: entry.payload,
                    created_ts: now,
                    updated_ts: now,
                    sent_ts: None,
                    error_ts: None,
                    bounce_ts: None,
                    bounce_type: None,
                    bounce_code: None,
                    bounce_reason: None,
                    reported_ts: None,
                };
                rw.insert(row)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
                outcome.accepted.push(entry.id);
            }

            rw.commit()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            Ok(outcome)
        })
        .await
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
    }

    /// Select up to `limit` dispatchable messages: not terminal, past their
    /// not-before instant, charged against a positive per-account quota, and
    /// not held back by tenant suspension. Ordered by
    /// `(priority, deferred_ts, created_ts)`. The selection runs inside a
    /// single write transaction so it is serialized with every mutation.
    pub async fn claim_ready(
        &self,
        now: i64,
        account_quotas: AHashMap<String, u32>,
        limit: usize,
    ) -> RelayMailResult<Vec<QueuedMessage>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let rw = db
                .rw_transaction()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageUnavailable))?;

            let tenants: Vec<Tenant> = rw
                .scan()
                .primary()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .all()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .try_collect()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            let tenants: AHashMap<String, Tenant> =
                tenants.into_iter().map(|t| (t.id.clone(), t)).collect();

            let mut candidates: Vec<QueuedMessage> = rw
                .scan()
                .primary()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .all()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .filter_map(Result::ok)
                .filter(|m: &QueuedMessage| m.is_ready(now))
                .filter(|m| account_quotas.get(&m.account_id).copied().unwrap_or(0) > 0)
                .filter(|m| match &m.tenant_id {
                    Some(tenant_id) => tenants
                        .get(tenant_id)
                        .map(|t| !t.is_batch_suspended(m.batch_code.as_deref()))
                        .unwrap_or(true),
                    None => true,
                })
                .collect();

            candidates.sort_by(|a, b| {
                (a.priority, a.deferred_ts, a.created_ts, &a.id).cmp(&(
                    b.priority,
                    b.deferred_ts,
                    b.created_ts,
                    &b.id,
                ))
            });

            let mut taken_per_account: AHashMap<String, u32> = AHashMap::new();
            let mut claimed = Vec::new();
            for message in candidates {
                if claimed.len() >= limit {
                    break;
                }
                let quota = account_quotas
                    .get(&message.account_id)
                    .copied()
                    .unwrap_or(0);
                let taken = taken_per_account
                    .entry(message.account_id.clone())
                    .or_insert(0);
                if *taken >= quota {
                    continue;
                }
                *taken += 1;
                claimed.push(message);
            }

            rw.commit()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            Ok(claimed)
        })
        .await
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
    }

    /// Idempotent terminal write: a message that already reached a terminal
    /// state keeps its original timestamps.
    pub async fn mark_sent(&self, key: u64, ts: i64) -> RelayMailResult<()> {
        self.update_message(key, move |current| {
            if current.is_terminal() {
                return None;
            }
            let mut updated = current.clone();
            updated.sent_ts = Some(ts);
            updated.last_error = None;
            updated.updated_ts = ts;
            Some(updated)
        })
        .await
    }

    /// Deferred or terminal failure write. With `next_deferred_ts` the
    /// message returns to pending at that instant (never earlier than its
    /// current not-before time); without it the message becomes terminal.
    pub async fn mark_error(
        &self,
        key: u64,
        ts: i64,
        error_text: String,
        next_deferred_ts: Option<i64>,
        new_retry_count: u32,
    ) -> RelayMailResult<()> {
        self.update_message(key, move |current| {
            if current.is_terminal() {
                return None;
            }
            let mut updated = current.clone();
            updated.last_error = Some(error_text.clone());
            updated.retry_count = new_retry_count;
            updated.updated_ts = ts;
            match next_deferred_ts {
                Some(next) => updated.deferred_ts = next.max(current.deferred_ts),
                None => updated.error_ts = Some(ts),
            }
            Some(updated)
        })
        .await
    }

    /// Push a pending message's not-before instant forward (rate-limit
    /// flow control, not a failure: the retry counter is untouched).
    pub async fn mark_deferred(
        &self,
        key: u64,
        ts: i64,
        next_deferred_ts: i64,
    ) -> RelayMailResult<()> {
        self.update_message(key, move |current| {
            if current.is_terminal() {
                return None;
            }
            let mut updated = current.clone();
            updated.deferred_ts = next_deferred_ts.max(current.deferred_ts);
            updated.updated_ts = ts;
            Some(updated)
        })
        .await
    }

    async fn update_message(
        &self,
        key: u64,
        mutate: impl Fn(&QueuedMessage) -> Option<QueuedMessage> + Send + Sync + 'static,
    ) -> RelayMailResult<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let rw = db
                .rw_transaction()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageUnavailable))?;
            let current: Option<QueuedMessage> = rw
                .get()
                .secondary(QueuedMessageKey::key, key)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            // A row deleted out from under an in-flight worker is not an
            // error; the update simply has nothing to apply to.
            let Some(current) = current else {
                return Ok(());
            };
            if let Some(updated) = mutate(&current) {
                rw.update(current, updated)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
                rw.commit()
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
    }

    /// Terminal messages whose state has not yet been acknowledged by a
    /// report sink, oldest update first.
    pub async fn list_terminal_unreported(
        &self,
        limit: usize,
        tenant_id: Option<String>,
    ) -> RelayMailResult<Vec<QueuedMessage>> {
        let mut messages: Vec<QueuedMessage> = list_all_impl(&self.db)
            .await?
            .into_iter()
            .filter(|m: &QueuedMessage| {
                m.reported_ts.is_none() && (m.is_terminal() || m.bounce_ts.is_some())
            })
            .filter(|m| match &tenant_id {
                Some(wanted) => m.tenant_id.as_deref() == Some(wanted.as_str()),
                None => true,
            })
            .collect();
        messages.sort_by(|a, b| (a.updated_ts, &a.id).cmp(&(b.updated_ts, &b.id)));
        messages.truncate(limit);
        Ok(messages)
    }

    /// Acknowledgement write; replaying an ack for an already-reported
    /// message is a no-op.
    pub async fn mark_reported(&self, keys: Vec<u64>, ts: i64) -> RelayMailResult<()> {
        for key in keys {
            self.update_message(key, move |current| {
                if current.reported_ts.is_some() {
                    return None;
                }
                let mut updated = current.clone();
                updated.reported_ts = Some(ts);
                updated.updated_ts = ts;
                Some(updated)
            })
            .await?;
        }
        Ok(())
    }

    /// Purge reported messages past their retention window. Each tenant may
    /// override the global window.
    pub async fn delete_reported_before(
        &self,
        now: i64,
        global_retention_secs: i64,
    ) -> RelayMailResult<usize> {
        let tenants: Vec<Tenant> = list_all_impl(&self.db).await?;
        let overrides: AHashMap<String, i64> = tenants
            .into_iter()
            .filter_map(|t| {
                t.retention_days
                    .map(|days| (t.id, i64::from(days) * 86_400))
            })
            .collect();
        batch_delete_impl(&self.db, move |rw| {
            let expired: Vec<QueuedMessage> = rw
                .scan()
                .primary()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .all()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .filter_map(Result::ok)
                .filter(|m: &QueuedMessage| {
                    let retention = m
                        .tenant_id
                        .as_ref()
                        .and_then(|t| overrides.get(t).copied())
                        .unwrap_or(global_retention_secs);
                    m.reported_ts
                        .map(|reported| reported < now - retention)
                        .unwrap_or(false)
                })
                .collect();
            Ok(expired)
        })
        .await
    }

    pub async fn list_messages(
        &self,
        tenant_id: Option<String>,
        active_only: bool,
    ) -> RelayMailResult<Vec<QueuedMessage>> {
        let mut messages: Vec<QueuedMessage> = list_all_impl(&self.db)
            .await?
            .into_iter()
            .filter(|m: &QueuedMessage| !active_only || !m.is_terminal())
            .filter(|m| match &tenant_id {
                Some(wanted) => m.tenant_id.as_deref() == Some(wanted.as_str()),
                None => true,
            })
            .collect();
        messages.sort_by(|a, b| {
            (a.priority, a.created_ts, &a.id).cmp(&(b.priority, b.created_ts, &b.id))
        });
        Ok(messages)
    }

    /// Remove messages by client id within the tenant scope. Returns the
    /// removed count and the ids that were not present.
    pub async fn delete_messages(
        &self,
        tenant_id: Option<String>,
        ids: Vec<String>,
    ) -> RelayMailResult<(usize, Vec<String>)> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let rw = db
                .rw_transaction()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageUnavailable))?;
            let mut removed = 0usize;
            let mut not_found = Vec::new();
            for id in ids.into_iter().unique() {
                let pk = QueuedMessage::pk_for(tenant_id.as_deref(), &id);
                let existing: Option<QueuedMessage> = rw
                    .get()
                    .primary(pk)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
                match existing {
                    Some(message) => {
                        rw.remove(message).map_err(|e| {
                            raise_error!(format!("{:#?}", e), ErrorCode::InternalError)
                        })?;
                        removed += 1;
                    }
                    None => not_found.push(id),
                }
            }
            rw.commit()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            Ok((removed, not_found))
        })
        .await
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
    }

    pub async fn get_message(
        &self,
        tenant_id: Option<&str>,
        id: &str,
    ) -> RelayMailResult<Option<QueuedMessage>> {
        async_find_impl(&self.db, QueuedMessage::pk_for(tenant_id, id)).await
    }

    // ------------------------------------------------------------- send log

    /// Append one delivery to the send-log. The write happens only after a
    /// successful SMTP transaction; the limiter counts nothing else.
    pub async fn append_send_log(&self, account_id: &str, ts: i64) -> RelayMailResult<()> {
        insert_impl(
            &self.db,
            SendLogEntry {
                account_id: account_id.to_string(),
                ts,
                seq: id!(),
            },
        )
        .await
    }

    /// Number of send-log rows for `account_id` with `ts` in
    /// `(since_ts, now]`.
    pub async fn count_send_log_since(
        &self,
        account_id: &str,
        since_ts: i64,
    ) -> RelayMailResult<usize> {
        Ok(self
            .send_log_window(account_id, since_ts)
            .await?
            .len())
    }

    /// Earliest send-log timestamp inside the window, used to compute the
    /// next instant at which the window regains capacity.
    pub async fn oldest_send_since(
        &self,
        account_id: &str,
        since_ts: i64,
    ) -> RelayMailResult<Option<i64>> {
        Ok(self
            .send_log_window(account_id, since_ts)
            .await?
            .first()
            .map(|entry| entry.ts))
    }

    async fn send_log_window(
        &self,
        account_id: &str,
        since_ts: i64,
    ) -> RelayMailResult<Vec<SendLogEntry>> {
        let db = self.db.clone();
        let prefix = SendLogEntry::scan_prefix(account_id);
        tokio::task::spawn_blocking(move || {
            let r = db
                .r_transaction()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageUnavailable))?;
            let entries: Vec<SendLogEntry> = r
                .scan()
                .primary()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .start_with(prefix)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .filter_map(Result::ok)
                .filter(|entry: &SendLogEntry| entry.ts > since_ts)
                .collect();
            Ok(entries)
        })
        .await
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
    }

    pub async fn delete_send_log_before(&self, threshold_ts: i64) -> RelayMailResult<usize> {
        batch_delete_impl(&self.db, move |rw| {
            let expired: Vec<SendLogEntry> = rw
                .scan()
                .primary()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .all()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .filter_map(Result::ok)
                .filter(|entry: &SendLogEntry| entry.ts < threshold_ts)
                .collect();
            Ok(expired)
        })
        .await
    }

    // ------------------------------------------------------------- accounts

    pub async fn upsert_account(&self, account: Account) -> RelayMailResult<()> {
        upsert_impl(&self.db, account).await
    }

    pub async fn get_account(&self, id: &str) -> RelayMailResult<Option<Account>> {
        async_find_impl(&self.db, id.to_string()).await
    }

    pub async fn list_accounts(&self) -> RelayMailResult<Vec<Account>> {
        list_all_impl(&self.db).await
    }

    /// Remove an account together with its queued messages and send-log.
    pub async fn delete_account(&self, id: &str) -> RelayMailResult<bool> {
        let db = self.db.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let rw = db
                .rw_transaction()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::StorageUnavailable))?;
            let account: Option<Account> = rw
                .get()
                .primary(id.clone())
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            let Some(account) = account else {
                return Ok(false);
            };
            rw.remove(account)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;

            let messages: Vec<QueuedMessage> = rw
                .scan()
                .primary()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .all()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .filter_map(Result::ok)
                .filter(|m: &QueuedMessage| m.account_id == id)
                .collect();
            for message in messages {
                rw.remove(message)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            }

            let log_entries: Vec<SendLogEntry> = rw
                .scan()
                .primary()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .start_with(SendLogEntry::scan_prefix(&id))
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .filter_map(Result::ok)
                .collect();
            for entry in log_entries {
                rw.remove(entry)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            }

            rw.commit()
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
            Ok(true)
        })
        .await
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
    }

    // -------------------------------------------------------------- tenants

    pub async fn upsert_tenant(&self, tenant: Tenant) -> RelayMailResult<()> {
        upsert_impl(&self.db, tenant).await
    }

    pub async fn get_tenant(&self, id: &str) -> RelayMailResult<Option<Tenant>> {
        async_find_impl(&self.db, id.to_string()).await
    }

    pub async fn list_tenants(&self) -> RelayMailResult<Vec<Tenant>> {
        list_all_impl(&self.db).await
    }

    pub async fn delete_tenant(&self, id: &str) -> RelayMailResult<()> {
        let key = id.to_string();
        crate::modules::database::delete_impl(&self.db, move |rw| {
            rw.get()
                .primary::<Tenant>(key.clone())
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .ok_or_else(|| {
                    raise_error!(
                        format!("tenant '{}' not found", key),
                        ErrorCode::ResourceNotFound
                    )
                })
        })
        .await
    }

    /// Atomic read-modify-write of a tenant's suspension set. The transform
    /// may refuse the change (e.g. activating a single batch while the
    /// suspend-all sentinel is present).
    pub async fn update_suspension(
        &self,
        tenant_id: &str,
        ts: i64,
        transform: impl Fn(&BTreeSet<String>) -> RelayMailResult<BTreeSet<String>>
            + Send
            + Sync
            + 'static,
    ) -> RelayMailResult<Tenant> {
        let key = tenant_id.to_string();
        update_impl(
            &self.db,
            move |rw| {
                rw.get()
                    .primary::<Tenant>(key.clone())
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                    .ok_or_else(|| {
                        raise_error!(
                            format!("tenant '{}' not found", key),
                            ErrorCode::ResourceNotFound
                        )
                    })
            },
            move |current| {
                let mut updated = current.clone();
                updated.suspended_batches = transform(&current.suspended_batches)?;
                updated.updated_ts = ts;
                Ok(updated)
            },
        )
        .await
    }
}
