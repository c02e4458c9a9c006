// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use mail_send::mail_builder::headers::address::Address;
use mail_send::mail_builder::headers::text::Text;
use mail_send::mail_builder::MessageBuilder;

use crate::modules::attachment::ResolvedAttachment;
use crate::modules::error::{code::ErrorCode, RelayMailResult};
use crate::modules::message::{ContentType, MessagePayload};
use crate::raise_error;

/// Header correlating wire traffic back to the queue row; carries the
/// message's surrogate key.
pub const MAIL_ID_HEADER: &str = "X-Mail-ID";

/// Render the payload into RFC 5322 bytes. Header encoding (RFC 2047
/// encoded-words, `filename*=` dispositions) and multipart assembly are
/// the builder's responsibility; this function only shapes the message.
pub fn compose(
    key: u64,
    payload: &MessagePayload,
    attachments: &[ResolvedAttachment],
) -> RelayMailResult<Vec<u8>> {
    let mut builder = MessageBuilder::new()
        .from(Address::new_address(None::<&str>, payload.from.clone()))
        .to(address_list(&payload.to))
        .subject(payload.subject.clone())
        .message_id(format!("{}@relaymail", key))
        .header(MAIL_ID_HEADER, Text::new(key.to_string()));

    if !payload.cc.is_empty() {
        builder = builder.cc(address_list(&payload.cc));
    }
    if !payload.bcc.is_empty() {
        builder = builder.bcc(address_list(&payload.bcc));
    }
    if let Some(reply_to) = &payload.reply_to {
        builder = builder.reply_to(Address::new_address(None::<&str>, reply_to.clone()));
    }
    for (name, value) in &payload.headers {
        builder = builder.header(name.clone(), Text::new(value.clone()));
    }

    builder = match payload.content_type {
        ContentType::Html => builder.html_body(payload.body.clone()),
        ContentType::Plain => {
            let mut builder = builder.text_body(payload.body.clone());
            if let Some(html) = &payload.body_html {
                builder = builder.html_body(html.clone());
            }
            builder
        }
    };

    for attachment in attachments {
        builder = builder.attachment(
            attachment.mime_type.clone(),
            attachment.filename.clone(),
            (*attachment.content).clone(),
        );
    }

    let mut body = Vec::new();
    builder
        .write_to(&mut body)
        .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?;
    Ok(body)
}

fn address_list(addresses: &[String]) -> Address<'static> {
    Address::new_list(
        addresses
            .iter()
            .map(|address| Address::new_address(None::<&str>, address.clone()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn payload() -> MessagePayload {
        MessagePayload {
            from: "sender@example.test".into(),
            to: vec!["one@example.test".into(), "two@example.test".into()],
            subject: "status report".into(),
            body: "all good".into(),
            ..Default::default()
        }
    }

    fn compose_string(key: u64, payload: &MessagePayload, atts: &[ResolvedAttachment]) -> String {
        String::from_utf8(compose(key, payload, atts).unwrap()).unwrap()
    }

    #[test]
    fn test_plain_message_carries_mail_id() {
        let rendered = compose_string(42, &payload(), &[]);
        assert!(rendered.contains("X-Mail-ID: 42"));
        assert!(rendered.contains("sender@example.test"));
        assert!(rendered.contains("one@example.test"));
        assert!(rendered.contains("two@example.test"));
        assert!(rendered.contains("Content-Type: text/plain"));
        assert!(!rendered.contains("multipart/mixed"));
    }

    #[test]
    fn test_html_body_yields_html_part() {
        let mut p = payload();
        p.content_type = ContentType::Html;
        p.body = "<p>hello</p>".into();
        let rendered = compose_string(1, &p, &[]);
        assert!(rendered.contains("Content-Type: text/html"));
    }

    #[test]
    fn test_plain_plus_html_yields_alternative() {
        let mut p = payload();
        p.body_html = Some("<p>all good</p>".into());
        let rendered = compose_string(1, &p, &[]);
        assert!(rendered.contains("multipart/alternative"));
        assert!(rendered.contains("text/plain"));
        assert!(rendered.contains("text/html"));
    }

    #[test]
    fn test_attachments_yield_multipart_mixed() {
        let attachment = ResolvedAttachment {
            filename: "report.pdf".into(),
            mime_type: "application/pdf".into(),
            content: Arc::new(b"%PDF-1.4".to_vec()),
        };
        let rendered = compose_string(1, &payload(), &[attachment]);
        assert!(rendered.contains("multipart/mixed"));
        assert!(rendered.contains("Content-Disposition: attachment"));
        assert!(rendered.contains("report.pdf"));
    }

    #[test]
    fn test_non_ascii_subject_is_header_encoded() {
        let mut p = payload();
        p.subject = "Prüfbericht für Q3".into();
        let rendered = compose_string(1, &p, &[]);
        assert!(!rendered.contains("Prüfbericht"));
        assert!(rendered.to_lowercase().contains("=?utf-8?"));
    }

    #[test]
    fn test_custom_headers_and_reply_to() {
        let mut p = payload();
        p.reply_to = Some("replies@example.test".into());
        p.headers
            .insert("X-Campaign".into(), "welcome-1".into());
        let rendered = compose_string(1, &p, &[]);
        assert!(rendered.contains("Reply-To:"));
        assert!(rendered.contains("replies@example.test"));
        assert!(rendered.contains("X-Campaign: welcome-1"));
    }
}
