// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::collections::BTreeSet;

use native_db::*;
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};

use crate::modules::common::auth::OutboundAuth;

/// Isolation boundary and report routing target.
///
/// Suspension state: the set either holds the [`Tenant::SUSPEND_ALL`]
/// sentinel (everything suspended), a collection of batch tags, or nothing.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[native_model(id = 3, version = 1)]
#[native_db]
pub struct Tenant {
    #[primary_key]
    pub id: String,
    pub name: Option<String>,
    pub report_base_url: Option<String>,
    pub report_sync_path: Option<String>,
    pub attachment_base_url: Option<String>,
    pub attachment_path: Option<String>,
    pub auth: OutboundAuth,
    pub active: bool,
    pub suspended_batches: BTreeSet<String>,
    /// Overrides the global report retention window
    pub retention_days: Option<u32>,
    pub created_ts: i64,
    pub updated_ts: i64,
}

impl Tenant {
    pub const SUSPEND_ALL: &'static str = "*";

    pub fn is_fully_suspended(&self) -> bool {
        self.suspended_batches.contains(Self::SUSPEND_ALL)
    }

    /// Whether a message carrying `batch_code` may not be dispatched.
    /// Messages without a batch code are only held back by the sentinel.
    pub fn is_batch_suspended(&self, batch_code: Option<&str>) -> bool {
        if self.is_fully_suspended() {
            return true;
        }
        match batch_code {
            Some(code) => self.suspended_batches.contains(code),
            None => false,
        }
    }

    pub fn report_url(&self) -> Option<String> {
        join_url(self.report_base_url.as_deref(), self.report_sync_path.as_deref())
    }

    pub fn attachment_url(&self) -> Option<String> {
        join_url(
            self.attachment_base_url.as_deref(),
            self.attachment_path.as_deref(),
        )
    }
}

fn join_url(base: Option<&str>, path: Option<&str>) -> Option<String> {
    let base = base?;
    match path {
        Some(path) => Some(format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )),
        None => Some(base.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suspension_semantics() {
        let mut tenant = Tenant {
            id: "acme".into(),
            active: true,
            ..Default::default()
        };
        assert!(!tenant.is_batch_suspended(None));
        assert!(!tenant.is_batch_suspended(Some("NL-01")));

        tenant.suspended_batches.insert("NL-01".into());
        assert!(tenant.is_batch_suspended(Some("NL-01")));
        assert!(!tenant.is_batch_suspended(Some("NL-02")));
        assert!(!tenant.is_batch_suspended(None));

        tenant.suspended_batches.clear();
        tenant
            .suspended_batches
            .insert(Tenant::SUSPEND_ALL.to_string());
        assert!(tenant.is_batch_suspended(Some("NL-02")));
        assert!(tenant.is_batch_suspended(None));
    }

    #[test]
    fn test_url_joining() {
        let tenant = Tenant {
            id: "acme".into(),
            report_base_url: Some("https://app.acme.test/".into()),
            report_sync_path: Some("/mail/sync".into()),
            attachment_base_url: Some("https://app.acme.test".into()),
            attachment_path: None,
            ..Default::default()
        };
        assert_eq!(
            tenant.report_url().as_deref(),
            Some("https://app.acme.test/mail/sync")
        );
        assert_eq!(
            tenant.attachment_url().as_deref(),
            Some("https://app.acme.test")
        );
        assert_eq!(Tenant::default().report_url(), None);
    }
}
