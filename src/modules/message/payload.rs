// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::modules::common::auth::OutboundAuth;
use crate::modules::message::{AttachmentSpec, ContentType, FetchMode, MessagePayload};

/// Wire-level submission payload for a single message.
///
/// `to` accepts either a JSON list or a comma-separated string; `cc` and
/// `bcc` accept the same shapes.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SubmitMessage {
    pub id: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Option<AddressList>,
    #[serde(default)]
    pub cc: Option<AddressList>,
    #[serde(default)]
    pub bcc: Option<AddressList>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub body_html: Option<String>,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub return_path: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub deferred_ts: Option<i64>,
    #[serde(default)]
    pub batch_code: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<SubmitAttachment>,
}

impl SubmitMessage {
    pub fn into_payload(self) -> MessagePayload {
        MessagePayload {
            from: self.from,
            to: self.to.map(AddressList::into_vec).unwrap_or_default(),
            cc: self.cc.map(AddressList::into_vec).unwrap_or_default(),
            bcc: self.bcc.map(AddressList::into_vec).unwrap_or_default(),
            subject: self.subject,
            body: self.body,
            body_html: self.body_html,
            content_type: self.content_type,
            headers: self.headers,
            reply_to: self.reply_to,
            return_path: self.return_path,
            attachments: self
                .attachments
                .into_iter()
                .map(SubmitAttachment::into_spec)
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SubmitAttachment {
    pub filename: String,
    pub storage_path: String,
    #[serde(default)]
    pub fetch_mode: Option<FetchMode>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub auth: Option<OutboundAuth>,
}

impl SubmitAttachment {
    fn into_spec(self) -> AttachmentSpec {
        AttachmentSpec {
            filename: self.filename,
            storage_path: self.storage_path,
            fetch_mode: self.fetch_mode,
            mime_type: self.mime_type,
            auth: self.auth,
        }
    }
}

/// Recipient addresses, given either as a list or a comma-joined string.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AddressList {
    Many(Vec<String>),
    One(String),
}

impl AddressList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            AddressList::Many(items) => items
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            AddressList::One(joined) => joined
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}
