// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::collections::BTreeMap;

use crate::modules::common::auth::OutboundAuth;
use native_db::*;
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};

pub mod payload;

pub const PRIORITY_IMMEDIATE: u8 = 0;
pub const PRIORITY_HIGH: u8 = 1;
pub const PRIORITY_MEDIUM: u8 = 2;
pub const PRIORITY_LOW: u8 = 3;

/// Clamp a caller-supplied priority into the supported range, falling back
/// to `default` when absent.
pub fn normalise_priority(value: Option<u8>, default: u8) -> u8 {
    value.unwrap_or(default).min(PRIORITY_LOW)
}

/// A queued outbound email.
///
/// The row is unique per `(tenant_id, id)`; `key` is the internal surrogate
/// identifier injected into the composed message as `X-Mail-ID`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[native_model(id = 1, version = 1)]
#[native_db(primary_key(pk -> String))]
pub struct QueuedMessage {
    #[secondary_key(unique)]
    pub key: u64,
    /// Client-supplied identifier, unique within the tenant scope
    pub id: String,
    pub tenant_id: Option<String>,
    #[secondary_key]
    pub account_id: String,
    /// 0 immediate, 1 high, 2 medium, 3 low
    pub priority: u8,
    /// Caller-defined tag grouping sibling messages for collective suspension
    pub batch_code: Option<String>,
    /// Scheduled not-before instant; monotonic non-decreasing across retries
    pub deferred_ts: i64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub payload: MessagePayload,
    pub created_ts: i64,
    pub updated_ts: i64,
    pub sent_ts: Option<i64>,
    pub error_ts: Option<i64>,
    /// Bounce fields are stamped by an external bounce detector, never by
    /// this engine; they ride along so reports can carry them.
    pub bounce_ts: Option<i64>,
    pub bounce_type: Option<String>,
    pub bounce_code: Option<String>,
    pub bounce_reason: Option<String>,
    pub reported_ts: Option<i64>,
}

impl QueuedMessage {
    fn pk(&self) -> String {
        Self::pk_for(self.tenant_id.as_deref(), &self.id)
    }

    pub fn pk_for(tenant_id: Option<&str>, id: &str) -> String {
        format!("{}\u{1f}{}", tenant_id.unwrap_or(""), id)
    }

    pub fn is_terminal(&self) -> bool {
        self.sent_ts.is_some() || self.error_ts.is_some()
    }

    /// Eligible for dispatch at `now`: not terminal and past its
    /// not-before instant.
    pub fn is_ready(&self, now: i64) -> bool {
        !self.is_terminal() && self.deferred_ts <= now
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    /// Optional HTML alternative; when present alongside a plain body the
    /// composer emits multipart/alternative.
    pub body_html: Option<String>,
    pub content_type: ContentType,
    pub headers: BTreeMap<String, String>,
    pub reply_to: Option<String>,
    pub return_path: Option<String>,
    pub attachments: Vec<AttachmentSpec>,
}

impl MessagePayload {
    /// SMTP envelope sender: explicit return-path, else the From address.
    pub fn envelope_from(&self) -> &str {
        self.return_path.as_deref().unwrap_or(&self.from)
    }

    /// The full RCPT set in to, cc, bcc order.
    pub fn recipients(&self) -> Vec<String> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .cloned()
            .collect()
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Plain,
    Html,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct AttachmentSpec {
    pub filename: String,
    /// Mode-specific location string, see [`FetchMode`]
    pub storage_path: String,
    pub fetch_mode: Option<FetchMode>,
    pub mime_type: Option<String>,
    pub auth: Option<OutboundAuth>,
}

impl AttachmentSpec {
    /// Explicit fetch mode, else inferred from the storage path prefix.
    pub fn effective_mode(&self) -> FetchMode {
        if let Some(mode) = self.fetch_mode {
            return mode;
        }
        if self.storage_path.starts_with("base64:") {
            FetchMode::Base64
        } else if self.storage_path.starts_with("http://")
            || self.storage_path.starts_with("https://")
        {
            FetchMode::HttpUrl
        } else if self.storage_path.starts_with('/') {
            FetchMode::Filesystem
        } else {
            FetchMode::Endpoint
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    Base64,
    Filesystem,
    HttpUrl,
    Endpoint,
}
