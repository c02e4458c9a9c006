// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::sync::Arc;

use tracing::{debug, info};

use crate::modules::cache::ContentCache;
use crate::modules::error::RelayMailResult;
use crate::modules::store::MailStore;
use crate::utc_now;

/// Widest rate-limit window plus an hour of margin; send-log rows older
/// than this can no longer influence any admission decision.
const SEND_LOG_HORIZON_SECS: i64 = 86_400 + 3_600;

/// Housekeeping: purge acknowledged messages past retention, truncate the
/// send-log beyond the widest rate-limit window, expire cache entries.
pub struct CleanupLoop {
    store: Arc<MailStore>,
    cache: Arc<ContentCache>,
    retention_secs: i64,
}

impl CleanupLoop {
    pub fn new(store: Arc<MailStore>, cache: Arc<ContentCache>, retention_days: u32) -> Self {
        Self {
            store,
            cache,
            retention_secs: i64::from(retention_days) * 86_400,
        }
    }

    pub async fn run_cycle(&self) -> RelayMailResult<()> {
        let now = utc_now!();

        let purged = self
            .store
            .delete_reported_before(now, self.retention_secs)
            .await?;
        if purged > 0 {
            info!("Purged {} reported message(s) past retention", purged);
        }

        let truncated = self
            .store
            .delete_send_log_before(now - SEND_LOG_HORIZON_SECS)
            .await?;
        if truncated > 0 {
            debug!("Truncated {} send-log row(s)", truncated);
        }

        let (memory_evicted, disk_evicted) = self.cache.sweep_expired().await;
        if memory_evicted + disk_evicted > 0 {
            debug!(
                "Evicted expired cache entries (memory={}, disk={})",
                memory_evicted, disk_evicted
            );
        }
        Ok(())
    }
}
