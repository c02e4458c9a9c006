// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::sync::LazyLock;

use rand::Rng;
use regex::Regex;

use crate::modules::error::{code::ErrorCode, RelayMailError};

static SMTP_REPLY_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([2-5]\d{2})\b").unwrap());

/// Outcome of one delivery attempt as seen by the retry machinery.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SendVerdict {
    Transient(String),
    Permanent(String),
}

/// Map a delivery failure to transient or permanent.
///
/// Connect, I/O and timeout failures are transient; SMTP 4xx replies are
/// transient; 5xx replies, authentication and TLS negotiation failures are
/// permanent. 535 additionally flags the account as needing attention in
/// the error text. Unknown failures default to transient so they stay
/// retryable.
pub fn classify(error: &RelayMailError) -> SendVerdict {
    let message = error.message().to_string();
    match error.code() {
        ErrorCode::SmtpAuthenticationFailed => SendVerdict::Permanent(flag_auth(message)),
        ErrorCode::TlsNegotiationFailed => SendVerdict::Permanent(message),
        ErrorCode::NetworkError
        | ErrorCode::ConnectionTimeout
        | ErrorCode::ConnectionPoolTimeout
        | ErrorCode::SmtpConnectionFailed
        | ErrorCode::AttachmentFetchFailed => SendVerdict::Transient(message),
        _ => match extract_reply_code(&message) {
            Some(code) if (400..500).contains(&code) => SendVerdict::Transient(message),
            Some(535) => SendVerdict::Permanent(flag_auth(message)),
            Some(code) if (500..600).contains(&code) => SendVerdict::Permanent(message),
            _ => classify_by_text(message),
        },
    }
}

pub fn extract_reply_code(message: &str) -> Option<u16> {
    SMTP_REPLY_CODE
        .captures(message)
        .and_then(|captures| captures[1].parse().ok())
}

fn classify_by_text(message: String) -> SendVerdict {
    let lowered = message.to_lowercase();
    const PERMANENT_PATTERNS: [&str; 6] = [
        "authentication failed",
        "certificate verify failed",
        "ssl handshake",
        "wrong_version_number",
        "certificate has expired",
        "unknown_ca",
    ];
    if PERMANENT_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return SendVerdict::Permanent(message);
    }
    SendVerdict::Transient(message)
}

fn flag_auth(message: String) -> String {
    format!("{} (account needs attention)", message)
}

/// Backoff schedule for transient failures. Beyond the configured steps the
/// last delay repeats; once `max_retries` attempts are spent the failure is
/// promoted to permanent.
#[derive(Clone, Debug)]
pub struct RetrySchedule {
    pub delays: Vec<i64>,
    pub max_retries: u32,
    pub jitter: f64,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            delays: vec![60, 300, 900, 3_600, 7_200],
            max_retries: 5,
            jitter: 0.2,
        }
    }
}

impl RetrySchedule {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// The instant of the next attempt after `retry_count` prior tries, or
    /// `None` once retries are exhausted. Jitter spreads retries ±20%
    /// around the schedule.
    pub fn next_deferred_ts(
        &self,
        retry_count: u32,
        now: i64,
        rng: &mut impl Rng,
    ) -> Option<i64> {
        if retry_count >= self.max_retries || self.delays.is_empty() {
            return None;
        }
        let index = (retry_count as usize).min(self.delays.len() - 1);
        let base = self.delays[index];
        let span = base as f64 * self.jitter;
        let offset = if span > 0.0 {
            rng.random_range(-span..=span) as i64
        } else {
            0
        };
        Some(now + base + offset)
    }
}
