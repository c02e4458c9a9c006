// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::modules::common::auth::OutboundAuth;
use crate::modules::error::{code::ErrorCode, RelayMailResult};
use crate::modules::message::QueuedMessage;
use crate::modules::store::MailStore;
use crate::modules::tenant::Tenant;
use crate::{raise_error, utc_now};

/// Pushes delivery reports for terminal messages to each tenant's sink.
/// A batch is acknowledged (and its messages marked reported) only on an
/// HTTP 2xx; anything else leaves the batch for the next tick.
pub struct ReportLoop {
    store: Arc<MailStore>,
    http: reqwest::Client,
    batch_size: usize,
    /// Sink for messages without a tenant, and fallback for tenants
    /// without their own sink URL
    fallback_url: Option<String>,
    fallback_auth: OutboundAuth,
    /// Tenant filter injected by run-now; consumed by the next cycle
    target_tenant: Mutex<Option<String>>,
}

impl ReportLoop {
    pub fn new(
        store: Arc<MailStore>,
        batch_size: usize,
        post_timeout: Duration,
        fallback_url: Option<String>,
        fallback_auth: OutboundAuth,
    ) -> Self {
        Self {
            store,
            http: reqwest::Client::builder()
                .timeout(post_timeout)
                .build()
                .unwrap_or_default(),
            batch_size: batch_size.max(1),
            fallback_url,
            fallback_auth,
            target_tenant: Mutex::new(None),
        }
    }

    pub async fn set_target_tenant(&self, tenant_id: Option<String>) {
        *self.target_tenant.lock().await = tenant_id;
    }

    pub async fn run_cycle(&self) -> RelayMailResult<()> {
        let target = self.target_tenant.lock().await.take();
        let pending = self
            .store
            .list_terminal_unreported(self.batch_size * 16, target)
            .await?;
        if pending.is_empty() {
            return Ok(());
        }

        let tenants: AHashMap<String, Tenant> = self
            .store
            .list_tenants()
            .await?
            .into_iter()
            .map(|tenant| (tenant.id.clone(), tenant))
            .collect();

        // Group by tenant, preserving selection order; cap each group so no
        // tenant starves the others.
        let mut order: Vec<Option<String>> = Vec::new();
        let mut groups: AHashMap<Option<String>, Vec<QueuedMessage>> = AHashMap::new();
        for message in pending {
            let tenant_id = message.tenant_id.clone();
            let group = groups.entry(tenant_id.clone()).or_default();
            if group.is_empty() {
                order.push(tenant_id);
            }
            if group.len() < self.batch_size {
                group.push(message);
            }
        }

        for tenant_id in order {
            let Some(group) = groups.remove(&tenant_id) else {
                continue;
            };
            let tenant = tenant_id.as_ref().and_then(|id| tenants.get(id));
            if let Err(e) = self.push_batch(tenant, &group).await {
                let target = tenant_id.as_deref().unwrap_or("global");
                warn!("Report delivery failed for sink '{}': {:?}", target, e);
                // Unacknowledged; retried next tick.
            }
        }
        Ok(())
    }

    async fn push_batch(
        &self,
        tenant: Option<&Tenant>,
        messages: &[QueuedMessage],
    ) -> RelayMailResult<()> {
        if let Some(tenant) = tenant {
            if !tenant.active {
                return Ok(());
            }
        }
        let (url, auth) = match self.resolve_sink(tenant) {
            Some(sink) => sink,
            None => {
                warn!(
                    "No report sink configured for {} message(s), skipping",
                    messages.len()
                );
                return Ok(());
            }
        };

        let entries: Vec<serde_json::Value> = messages.iter().map(report_entry).collect();
        let body = json!({ "delivery_report": entries });

        let response = auth
            .apply(self.http.post(url))
            .json(&body)
            .send()
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::HttpResponseError))?;
        if !response.status().is_success() {
            return Err(raise_error!(
                format!("Report sink returned {}", response.status()),
                ErrorCode::HttpResponseError
            ));
        }

        // Advisory summary only; acknowledgement is the 2xx status itself.
        if let Ok(summary) = response.json::<serde_json::Value>().await {
            if let Some(queued) = summary.get("queued").and_then(|v| v.as_u64()) {
                debug!("Report sink acknowledged batch, client queued {}", queued);
            }
        }

        let keys: Vec<u64> = messages.iter().map(|m| m.key).collect();
        self.store.mark_reported(keys, utc_now!()).await?;
        Ok(())
    }

    fn resolve_sink<'a>(&'a self, tenant: Option<&'a Tenant>) -> Option<(String, &'a OutboundAuth)> {
        if let Some(tenant) = tenant {
            if let Some(url) = tenant.report_url() {
                return Some((url, &tenant.auth));
            }
        }
        self.fallback_url
            .as_ref()
            .map(|url| (url.clone(), &self.fallback_auth))
    }
}

/// One report entry: identity plus exactly one terminal event. A bounce
/// stamped by an external detector wins over the original send.
fn report_entry(message: &QueuedMessage) -> serde_json::Value {
    let mut entry = json!({
        "tenant_id": message.tenant_id,
        "id": message.id,
        "pk": message.key,
    });
    let fields = entry.as_object_mut().expect("entry is an object");
    if let Some(bounce_ts) = message.bounce_ts {
        fields.insert("bounce_ts".into(), json!(bounce_ts));
        fields.insert("bounce_type".into(), json!(message.bounce_type));
        fields.insert("bounce_code".into(), json!(message.bounce_code));
        fields.insert("bounce_reason".into(), json!(message.bounce_reason));
    } else if let Some(sent_ts) = message.sent_ts {
        fields.insert("sent_ts".into(), json!(sent_ts));
    } else if let Some(error_ts) = message.error_ts {
        fields.insert("error_ts".into(), json!(error_ts));
        fields.insert("error".into(), json!(message.last_error));
    }
    entry
}
