// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use native_db::*;
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};

/// One row per successful SMTP delivery; the rate limiter's sole source of
/// truth. Append-only except for retention truncation.
///
/// The primary key embeds the account and a zero-padded timestamp so a
/// prefix scan over one account iterates entries in time order.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[native_model(id = 4, version = 1)]
#[native_db(primary_key(pk -> String))]
pub struct SendLogEntry {
    pub account_id: String,
    pub ts: i64,
    /// Disambiguates multiple sends within the same second
    pub seq: u64,
}

impl SendLogEntry {
    fn pk(&self) -> String {
        format!("{}\u{1f}{:011}\u{1f}{}", self.account_id, self.ts, self.seq)
    }

    pub fn scan_prefix(account_id: &str) -> String {
        format!("{}\u{1f}", account_id)
    }
}
