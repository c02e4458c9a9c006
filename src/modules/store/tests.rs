use std::collections::BTreeSet;

use ahash::AHashMap;

use crate::modules::account::Account;
use crate::modules::database::manager::open_in_memory;
use crate::modules::message::{MessagePayload, PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_MEDIUM};
use crate::modules::store::{MailStore, NewMessage};
use crate::modules::tenant::Tenant;

fn store() -> MailStore {
    MailStore::new(open_in_memory().unwrap())
}

fn payload(from: &str, to: &str) -> MessagePayload {
    MessagePayload {
        from: from.into(),
        to: vec![to.into()],
        subject: "subject".into(),
        body: "body".into(),
        ..Default::default()
    }
}

fn new_message(id: &str, account: &str, priority: u8) -> NewMessage {
    NewMessage {
        id: id.into(),
        account_id: account.into(),
        priority,
        payload: payload("a@x", "b@y"),
        ..Default::default()
    }
}

fn unlimited_quota(account: &str) -> AHashMap<String, u32> {
    let mut quotas = AHashMap::new();
    quotas.insert(account.to_string(), u32::MAX);
    quotas
}

#[tokio::test]
async fn test_insert_rejects_duplicate_ids() {
    let store = store();
    let outcome = store
        .insert_messages(
            vec![new_message("M1", "A", PRIORITY_MEDIUM), new_message("M1", "A", PRIORITY_HIGH)],
            1000,
        )
        .await
        .unwrap();
    assert_eq!(outcome.accepted, vec!["M1".to_string()]);
    assert_eq!(outcome.rejected.len(), 1);
    assert_eq!(outcome.rejected[0].reason, "duplicate");

    // A later submission with the same id is rejected without side effects.
    let outcome = store
        .insert_messages(vec![new_message("M1", "A", PRIORITY_LOW)], 1001)
        .await
        .unwrap();
    assert!(outcome.accepted.is_empty());
    assert_eq!(outcome.rejected[0].reason, "duplicate");
    let stored = store.get_message(None, "M1").await.unwrap().unwrap();
    assert_eq!(stored.priority, PRIORITY_MEDIUM);
    assert_eq!(stored.created_ts, 1000);
}

#[tokio::test]
async fn test_same_id_is_allowed_across_tenants() {
    let store = store();
    let mut tenant_message = new_message("M1", "A", PRIORITY_MEDIUM);
    tenant_message.tenant_id = Some("acme".into());
    let outcome = store
        .insert_messages(
            vec![new_message("M1", "A", PRIORITY_MEDIUM), tenant_message],
            1000,
        )
        .await
        .unwrap();
    assert_eq!(outcome.accepted.len(), 2);
    assert!(outcome.rejected.is_empty());
}

#[tokio::test]
async fn test_claim_ready_orders_by_priority_then_age() {
    let store = store();
    let mut deferred = new_message("M-low-early", "A", PRIORITY_LOW);
    deferred.deferred_ts = Some(500);
    store
        .insert_messages(
            vec![
                new_message("M-medium", "A", PRIORITY_MEDIUM),
                deferred,
                new_message("M-high", "A", PRIORITY_HIGH),
            ],
            1000,
        )
        .await
        .unwrap();

    let claimed = store
        .claim_ready(1000, unlimited_quota("A"), 10)
        .await
        .unwrap();
    let ids: Vec<&str> = claimed.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["M-high", "M-medium", "M-low-early"]);
}

#[tokio::test]
async fn test_claim_ready_skips_deferred_and_quotaless() {
    let store = store();
    let mut future = new_message("M-future", "A", PRIORITY_MEDIUM);
    future.deferred_ts = Some(2000);
    store
        .insert_messages(
            vec![
                future,
                new_message("M-now", "A", PRIORITY_MEDIUM),
                new_message("M-other", "B", PRIORITY_MEDIUM),
            ],
            1000,
        )
        .await
        .unwrap();

    let claimed = store
        .claim_ready(1000, unlimited_quota("A"), 10)
        .await
        .unwrap();
    let ids: Vec<&str> = claimed.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["M-now"]);
}

#[tokio::test]
async fn test_claim_ready_respects_per_account_quota() {
    let store = store();
    store
        .insert_messages(
            (0..5)
                .map(|i| new_message(&format!("M{}", i), "A", PRIORITY_MEDIUM))
                .collect(),
            1000,
        )
        .await
        .unwrap();

    let mut quotas = AHashMap::new();
    quotas.insert("A".to_string(), 2);
    let claimed = store.claim_ready(1000, quotas, 10).await.unwrap();
    assert_eq!(claimed.len(), 2);
}

#[tokio::test]
async fn test_claim_ready_honors_batch_suspension() {
    let store = store();
    let mut tenant = Tenant {
        id: "acme".into(),
        active: true,
        ..Default::default()
    };
    tenant.suspended_batches.insert("NL-01".into());
    store.upsert_tenant(tenant).await.unwrap();

    let mut suspended = new_message("M-batch", "A", PRIORITY_MEDIUM);
    suspended.tenant_id = Some("acme".into());
    suspended.batch_code = Some("NL-01".into());
    let mut plain = new_message("M-plain", "A", PRIORITY_MEDIUM);
    plain.tenant_id = Some("acme".into());
    store
        .insert_messages(vec![suspended, plain], 1000)
        .await
        .unwrap();

    let claimed = store
        .claim_ready(1000, unlimited_quota("A"), 10)
        .await
        .unwrap();
    let ids: Vec<&str> = claimed.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["M-plain"]);

    // Suspend-all holds everything back, including messages without a batch.
    store
        .update_suspension("acme", 1001, |_| {
            let mut set = BTreeSet::new();
            set.insert(Tenant::SUSPEND_ALL.to_string());
            Ok(set)
        })
        .await
        .unwrap();
    let claimed = store
        .claim_ready(1002, unlimited_quota("A"), 10)
        .await
        .unwrap();
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn test_mark_sent_is_idempotent() {
    let store = store();
    store
        .insert_messages(vec![new_message("M1", "A", PRIORITY_MEDIUM)], 1000)
        .await
        .unwrap();
    let key = store.get_message(None, "M1").await.unwrap().unwrap().key;

    store.mark_sent(key, 1001).await.unwrap();
    store.mark_sent(key, 1500).await.unwrap();
    let stored = store.get_message(None, "M1").await.unwrap().unwrap();
    assert_eq!(stored.sent_ts, Some(1001));
    assert_eq!(stored.error_ts, None);
}

#[tokio::test]
async fn test_mark_error_deferred_then_terminal() {
    let store = store();
    store
        .insert_messages(vec![new_message("M1", "A", PRIORITY_MEDIUM)], 1000)
        .await
        .unwrap();
    let key = store.get_message(None, "M1").await.unwrap().unwrap().key;

    store
        .mark_error(key, 1001, "451 try later".into(), Some(1061), 1)
        .await
        .unwrap();
    let stored = store.get_message(None, "M1").await.unwrap().unwrap();
    assert!(!stored.is_terminal());
    assert_eq!(stored.deferred_ts, 1061);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.last_error.as_deref(), Some("451 try later"));

    // A deferred retry may never move the not-before instant backwards.
    store
        .mark_error(key, 1002, "451 again".into(), Some(900), 2)
        .await
        .unwrap();
    let stored = store.get_message(None, "M1").await.unwrap().unwrap();
    assert_eq!(stored.deferred_ts, 1061);

    store
        .mark_error(key, 1100, "550 rejected".into(), None, 2)
        .await
        .unwrap();
    let stored = store.get_message(None, "M1").await.unwrap().unwrap();
    assert_eq!(stored.error_ts, Some(1100));
    assert_eq!(stored.sent_ts, None);

    // Terminal state sticks.
    store.mark_sent(key, 1200).await.unwrap();
    let stored = store.get_message(None, "M1").await.unwrap().unwrap();
    assert_eq!(stored.error_ts, Some(1100));
    assert_eq!(stored.sent_ts, None);
}

#[tokio::test]
async fn test_report_flow_and_retention() {
    let store = store();
    store
        .insert_messages(
            vec![new_message("M1", "A", PRIORITY_MEDIUM), new_message("M2", "A", PRIORITY_MEDIUM)],
            1000,
        )
        .await
        .unwrap();
    let key1 = store.get_message(None, "M1").await.unwrap().unwrap().key;
    store.mark_sent(key1, 1001).await.unwrap();

    let unreported = store.list_terminal_unreported(10, None).await.unwrap();
    assert_eq!(unreported.len(), 1);
    assert_eq!(unreported[0].id, "M1");

    store.mark_reported(vec![key1], 1002).await.unwrap();
    assert!(store
        .list_terminal_unreported(10, None)
        .await
        .unwrap()
        .is_empty());

    // Replaying the ack is a no-op.
    store.mark_reported(vec![key1], 9999).await.unwrap();
    let stored = store.get_message(None, "M1").await.unwrap().unwrap();
    assert_eq!(stored.reported_ts, Some(1002));

    // Retention removes only reported messages past the window.
    let removed = store
        .delete_reported_before(1002 + 604_800 + 1, 604_800)
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(store.get_message(None, "M1").await.unwrap().is_none());
    assert!(store.get_message(None, "M2").await.unwrap().is_some());
}

#[tokio::test]
async fn test_send_log_counting_and_truncation() {
    let store = store();
    store.append_send_log("A", 1000).await.unwrap();
    store.append_send_log("A", 1030).await.unwrap();
    store.append_send_log("B", 1030).await.unwrap();

    assert_eq!(store.count_send_log_since("A", 940).await.unwrap(), 2);
    assert_eq!(store.count_send_log_since("A", 1000).await.unwrap(), 1);
    assert_eq!(store.oldest_send_since("A", 940).await.unwrap(), Some(1000));
    assert_eq!(store.oldest_send_since("A", 1000).await.unwrap(), Some(1030));

    let removed = store.delete_send_log_before(1030).await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(store.count_send_log_since("A", 0).await.unwrap(), 1);
    assert_eq!(store.count_send_log_since("B", 0).await.unwrap(), 1);
}

#[tokio::test]
async fn test_delete_account_cascades() {
    let store = store();
    store
        .upsert_account(Account {
            id: "A".into(),
            host: "smtp.example.test".into(),
            port: 587,
            ..Default::default()
        })
        .await
        .unwrap();
    store
        .insert_messages(vec![new_message("M1", "A", PRIORITY_MEDIUM)], 1000)
        .await
        .unwrap();
    store.append_send_log("A", 1000).await.unwrap();

    assert!(store.delete_account("A").await.unwrap());
    assert!(store.get_account("A").await.unwrap().is_none());
    assert!(store.get_message(None, "M1").await.unwrap().is_none());
    assert_eq!(store.count_send_log_since("A", 0).await.unwrap(), 0);
    assert!(!store.delete_account("A").await.unwrap());
}

#[tokio::test]
async fn test_delete_messages_reports_missing_ids() {
    let store = store();
    store
        .insert_messages(vec![new_message("M1", "A", PRIORITY_MEDIUM)], 1000)
        .await
        .unwrap();
    let (removed, not_found) = store
        .delete_messages(None, vec!["M1".into(), "M2".into()])
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(not_found, vec!["M2".to_string()]);
}
