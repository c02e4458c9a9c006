// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use native_db::*;
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};

use crate::modules::settings::cli::Settings;

/// Account id under which the settings-level fallback endpoint is
/// addressed when a submission names no account.
pub const DEFAULT_ACCOUNT_ID: &str = "default";

/// An SMTP submission endpoint.
///
/// Managed by the outer control plane; the engine reads and caches it. The
/// stored password is an opaque secret blob; decrypting it at rest is the
/// control plane's concern.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[native_model(id = 2, version = 1)]
#[native_db]
pub struct Account {
    #[primary_key]
    pub id: String,
    pub tenant_id: Option<String>,
    pub host: String,
    pub port: u16,
    pub encryption: Encryption,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Sliding-window send limits; `None` means unbounded for that window
    pub limit_per_minute: Option<u32>,
    pub limit_per_hour: Option<u32>,
    pub limit_per_day: Option<u32>,
    pub limit_policy: LimitPolicy,
    /// Per-cycle cap on claimed messages for this account
    pub batch_size: Option<u32>,
    /// Idle TTL hint in seconds for pooled sessions
    pub connection_ttl: Option<u64>,
    /// Cap on concurrent pooled sessions
    pub max_connections: Option<u32>,
    pub created_ts: i64,
    pub updated_ts: i64,
}

impl Account {
    pub fn has_limits(&self) -> bool {
        self.limit_per_minute.is_some()
            || self.limit_per_hour.is_some()
            || self.limit_per_day.is_some()
    }
}

/// Fallback SMTP endpoint assembled from process settings; `None` unless
/// both a default host and port are configured. Not persisted: a stored
/// account with the same id takes precedence. Port 465 implies implicit
/// TLS, any other port is plaintext submission.
pub fn default_account(settings: &Settings) -> Option<Account> {
    let host = settings.relaymail_default_smtp_host.clone()?;
    let port = settings.relaymail_default_smtp_port?;
    Some(Account {
        id: DEFAULT_ACCOUNT_ID.into(),
        host,
        port,
        encryption: if port == 465 {
            Encryption::Implicit
        } else {
            Encryption::None
        },
        username: settings.relaymail_default_smtp_username.clone(),
        password: settings.relaymail_default_smtp_password.clone(),
        ..Default::default()
    })
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encryption {
    #[default]
    None,
    StartTls,
    Implicit,
}

/// What to do with a message once the account is over one of its windows.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitPolicy {
    #[default]
    Defer,
    Reject,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_account_requires_host_and_port() {
        let mut settings = Settings::new_for_test();
        assert!(default_account(&settings).is_none());

        settings.relaymail_default_smtp_host = Some("smtp.example.test".into());
        assert!(default_account(&settings).is_none());

        settings.relaymail_default_smtp_port = Some(587);
        let account = default_account(&settings).unwrap();
        assert_eq!(account.id, DEFAULT_ACCOUNT_ID);
        assert_eq!(account.host, "smtp.example.test");
        assert_eq!(account.encryption, Encryption::None);
        assert!(account.username.is_none());
        assert!(!account.has_limits());
    }

    #[test]
    fn test_default_account_infers_implicit_tls_on_465() {
        let mut settings = Settings::new_for_test();
        settings.relaymail_default_smtp_host = Some("smtp.example.test".into());
        settings.relaymail_default_smtp_port = Some(465);
        settings.relaymail_default_smtp_username = Some("relay".into());
        settings.relaymail_default_smtp_password = Some("secret".into());

        let account = default_account(&settings).unwrap();
        assert_eq!(account.encryption, Encryption::Implicit);
        assert_eq!(account.username.as_deref(), Some("relay"));
        assert_eq!(account.password.as_deref(), Some("secret"));
    }
}
