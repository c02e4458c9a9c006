// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::account::Account;
use crate::modules::error::RelayMailResult;
use crate::modules::settings::cli::SETTINGS;
use crate::modules::smtp::client::Sender;
use crate::modules::smtp::manager::SmtpClientManager;
use async_trait::async_trait;
use bb8::Pool;
use dashmap::DashMap;
use mail_send::smtp::message::Message;
use std::time::Duration;

/// Seam between the dispatch loop and the wire. The production
/// implementation drives pooled `mail_send` sessions; tests substitute a
/// scripted transport.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn deliver(
        &self,
        account: &Account,
        envelope_from: &str,
        recipients: &[String],
        body: &[u8],
    ) -> RelayMailResult<()>;
}

pub async fn build_smtp_pool(account: &Account) -> RelayMailResult<Pool<SmtpClientManager>> {
    let idle_ttl = account
        .connection_ttl
        .unwrap_or(SETTINGS.relaymail_smtp_idle_ttl);
    let max_size = account
        .max_connections
        .unwrap_or(SETTINGS.relaymail_max_concurrent_per_account as u32)
        .max(1);
    let manager = SmtpClientManager::new(account.clone());
    let pool = Pool::builder()
        .connection_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(idle_ttl))
        .retry_connection(true)
        .max_size(max_size)
        .test_on_check_out(true)
        .build(manager)
        .await?;
    Ok(pool)
}

/// One bb8 pool per account. A lease is exclusive for the duration of one
/// send; the checkout probe (NOOP + RSET) discards sessions that died while
/// idle, and bb8's reaper closes sessions idle past the TTL. A pool is
/// rebuilt when the account configuration changes.
pub struct PooledSmtpTransport {
    pools: DashMap<String, (i64, Pool<SmtpClientManager>)>,
}

impl PooledSmtpTransport {
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
        }
    }

    async fn pool_for(&self, account: &Account) -> RelayMailResult<Pool<SmtpClientManager>> {
        if let Some(entry) = self.pools.get(&account.id) {
            let (generation, pool) = entry.value();
            if *generation == account.updated_ts {
                return Ok(pool.clone());
            }
        }
        let pool = build_smtp_pool(account).await?;
        self.pools
            .insert(account.id.clone(), (account.updated_ts, pool.clone()));
        Ok(pool)
    }
}

#[async_trait]
impl DeliveryTransport for PooledSmtpTransport {
    async fn deliver(
        &self,
        account: &Account,
        envelope_from: &str,
        recipients: &[String],
        body: &[u8],
    ) -> RelayMailResult<()> {
        let pool = self.pool_for(account).await?;
        let mut session = pool.get().await.map_err(crate::modules::error::RelayMailError::from)?;

        let mut message = Message::empty().body(body);
        message = message.from(envelope_from.to_string());
        for recipient in recipients {
            message = message.to(recipient.clone());
        }

        session.send_email(message).await
    }
}
