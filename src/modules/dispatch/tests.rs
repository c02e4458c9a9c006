use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::modules::account::{Account, Encryption, LimitPolicy};
use crate::modules::attachment::AttachmentResolver;
use crate::modules::cache::{CacheConfig, ContentCache};
use crate::modules::database::manager::open_in_memory;
use crate::modules::dispatch::{DispatchLoop, RATE_LIMITED_ERROR};
use crate::modules::error::{code::ErrorCode, RelayMailResult};
use crate::modules::limiter::RateLimiter;
use crate::modules::message::{MessagePayload, PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_MEDIUM};
use crate::modules::smtp::classify::RetrySchedule;
use crate::modules::smtp::pool::DeliveryTransport;
use crate::modules::store::{MailStore, NewMessage};
use crate::modules::tenant::Tenant;
use crate::raise_error;
use crate::utc_now;

#[derive(Clone, Debug)]
struct DeliveryRecord {
    account_id: String,
    envelope_from: String,
    recipients: Vec<String>,
    body: String,
}

/// Pops scripted outcomes in order; afterwards every delivery succeeds.
struct ScriptedTransport {
    script: Mutex<VecDeque<RelayMailResult<()>>>,
    deliveries: Mutex<Vec<DeliveryRecord>>,
}

impl ScriptedTransport {
    fn new(script: Vec<RelayMailResult<()>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            deliveries: Mutex::new(Vec::new()),
        })
    }

    async fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.deliveries.lock().await.clone()
    }
}

#[async_trait]
impl DeliveryTransport for ScriptedTransport {
    async fn deliver(
        &self,
        account: &Account,
        envelope_from: &str,
        recipients: &[String],
        body: &[u8],
    ) -> RelayMailResult<()> {
        let outcome = self.script.lock().await.pop_front().unwrap_or(Ok(()));
        if outcome.is_ok() {
            self.deliveries.lock().await.push(DeliveryRecord {
                account_id: account.id.clone(),
                envelope_from: envelope_from.to_string(),
                recipients: recipients.to_vec(),
                body: String::from_utf8_lossy(body).into_owned(),
            });
        }
        outcome
    }
}

struct Fixture {
    store: Arc<MailStore>,
    transport: Arc<ScriptedTransport>,
    dispatch: DispatchLoop,
}

async fn fixture(script: Vec<RelayMailResult<()>>, schedule: RetrySchedule) -> Fixture {
    let store = Arc::new(MailStore::new(open_in_memory().unwrap()));
    let limiter = Arc::new(RateLimiter::new(store.clone()));
    let cache = Arc::new(
        ContentCache::new(CacheConfig {
            memory_max_bytes: 1 << 20,
            memory_ttl: Duration::from_secs(60),
            disk_dir: None,
            disk_max_bytes: 0,
            disk_ttl: Duration::from_secs(60),
            threshold_bytes: 1 << 10,
        })
        .await
        .unwrap(),
    );
    let resolver = Arc::new(AttachmentResolver::new(
        cache,
        None,
        Duration::from_secs(5),
        4,
    ));
    let transport = ScriptedTransport::new(script);
    let dispatch = DispatchLoop::new(
        store.clone(),
        limiter,
        resolver,
        transport.clone(),
        schedule,
        Arc::new(AtomicBool::new(true)),
        Arc::new(Notify::new()),
        8,
        2,
        100,
        50,
    );
    Fixture {
        store,
        transport,
        dispatch,
    }
}

fn account(id: &str) -> Account {
    Account {
        id: id.into(),
        host: "smtp.example.test".into(),
        port: 587,
        encryption: Encryption::StartTls,
        ..Default::default()
    }
}

fn queued(id: &str, account: &str, priority: u8) -> NewMessage {
    NewMessage {
        id: id.into(),
        account_id: account.into(),
        priority,
        payload: MessagePayload {
            from: "a@x.test".into(),
            to: vec!["b@y.test".into()],
            subject: "hi".into(),
            body: "ok".into(),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn smtp_error(text: &str) -> RelayMailResult<()> {
    Err(raise_error!(text.into(), ErrorCode::SmtpCommandFailed))
}

#[tokio::test]
async fn test_happy_path_marks_sent_and_logs() {
    let f = fixture(vec![], RetrySchedule::default()).await;
    f.store.upsert_account(account("A")).await.unwrap();
    f.store
        .insert_messages(vec![queued("M1", "A", PRIORITY_MEDIUM)], utc_now!())
        .await
        .unwrap();

    f.dispatch.run_cycle().await.unwrap();

    let stored = f.store.get_message(None, "M1").await.unwrap().unwrap();
    assert!(stored.sent_ts.is_some());
    assert_eq!(stored.error_ts, None);
    assert_eq!(stored.retry_count, 0);
    assert_eq!(f.store.count_send_log_since("A", 0).await.unwrap(), 1);

    let deliveries = f.transport.deliveries().await;
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].account_id, "A");
    assert_eq!(deliveries[0].envelope_from, "a@x.test");
    assert_eq!(deliveries[0].recipients, vec!["b@y.test".to_string()]);
    assert!(deliveries[0]
        .body
        .contains(&format!("X-Mail-ID: {}", stored.key)));
}

#[tokio::test]
async fn test_transient_failure_then_success() {
    // Zero-delay schedule so the retry is immediately eligible.
    let schedule = RetrySchedule {
        delays: vec![0],
        max_retries: 5,
        jitter: 0.0,
    };
    let f = fixture(vec![smtp_error("UnexpectedReply 451 local error")], schedule).await;
    f.store.upsert_account(account("A")).await.unwrap();
    f.store
        .insert_messages(vec![queued("M1", "A", PRIORITY_MEDIUM)], utc_now!())
        .await
        .unwrap();

    f.dispatch.run_cycle().await.unwrap();
    let stored = f.store.get_message(None, "M1").await.unwrap().unwrap();
    assert!(!stored.is_terminal());
    assert_eq!(stored.retry_count, 1);
    assert!(stored.last_error.as_deref().unwrap().contains("451"));
    assert_eq!(f.store.count_send_log_since("A", 0).await.unwrap(), 0);

    f.dispatch.run_cycle().await.unwrap();
    let stored = f.store.get_message(None, "M1").await.unwrap().unwrap();
    assert!(stored.sent_ts.is_some());
    assert_eq!(stored.retry_count, 1);
    assert_eq!(f.store.count_send_log_since("A", 0).await.unwrap(), 1);
}

#[tokio::test]
async fn test_permanent_failure_is_terminal_without_send_log() {
    let f = fixture(
        vec![smtp_error("UnexpectedReply 550 no such user")],
        RetrySchedule::default(),
    )
    .await;
    f.store.upsert_account(account("A")).await.unwrap();
    f.store
        .insert_messages(vec![queued("M1", "A", PRIORITY_MEDIUM)], utc_now!())
        .await
        .unwrap();

    f.dispatch.run_cycle().await.unwrap();

    let stored = f.store.get_message(None, "M1").await.unwrap().unwrap();
    assert!(stored.error_ts.is_some());
    assert_eq!(stored.sent_ts, None);
    assert!(stored.last_error.as_deref().unwrap().contains("550"));
    assert_eq!(f.store.count_send_log_since("A", 0).await.unwrap(), 0);
}

#[tokio::test]
async fn test_retries_exhaust_into_permanent_failure() {
    let schedule = RetrySchedule {
        delays: vec![0],
        max_retries: 2,
        jitter: 0.0,
    };
    let f = fixture(
        vec![
            smtp_error("UnexpectedReply 451 busy"),
            smtp_error("UnexpectedReply 451 busy"),
            smtp_error("UnexpectedReply 451 busy"),
        ],
        schedule,
    )
    .await;
    f.store.upsert_account(account("A")).await.unwrap();
    f.store
        .insert_messages(vec![queued("M1", "A", PRIORITY_MEDIUM)], utc_now!())
        .await
        .unwrap();

    for _ in 0..3 {
        f.dispatch.run_cycle().await.unwrap();
    }

    let stored = f.store.get_message(None, "M1").await.unwrap().unwrap();
    assert!(stored.error_ts.is_some());
    assert!(stored
        .last_error
        .as_deref()
        .unwrap()
        .contains("max retries exceeded"));
    assert_eq!(stored.retry_count, 2);
}

#[tokio::test]
async fn test_rate_limit_defers_excess_message() {
    let f = fixture(vec![], RetrySchedule::default()).await;
    let mut limited = account("A");
    limited.limit_per_minute = Some(2);
    f.store.upsert_account(limited).await.unwrap();
    let submitted_at = utc_now!();
    f.store
        .insert_messages(
            vec![
                queued("M1", "A", PRIORITY_MEDIUM),
                queued("M2", "A", PRIORITY_MEDIUM),
                queued("M3", "A", PRIORITY_MEDIUM),
            ],
            submitted_at,
        )
        .await
        .unwrap();

    f.dispatch.run_cycle().await.unwrap();

    assert_eq!(f.store.count_send_log_since("A", 0).await.unwrap(), 2);
    let sent: Vec<_> = f
        .store
        .list_messages(None, false)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.sent_ts.is_some())
        .collect();
    assert_eq!(sent.len(), 2);

    let third = f.store.get_message(None, "M3").await.unwrap().unwrap();
    assert!(!third.is_terminal());
    // Earliest capacity moment: one window past the oldest send-log entry.
    assert!(third.deferred_ts >= submitted_at + 59);
    assert!(third.deferred_ts <= submitted_at + 62);
    assert_eq!(third.retry_count, 0);
}

#[tokio::test]
async fn test_rate_limit_reject_policy_is_terminal() {
    let f = fixture(vec![], RetrySchedule::default()).await;
    let mut limited = account("A");
    limited.limit_per_minute = Some(1);
    limited.limit_policy = LimitPolicy::Reject;
    f.store.upsert_account(limited).await.unwrap();
    f.store
        .insert_messages(
            vec![queued("M1", "A", PRIORITY_MEDIUM), queued("M2", "A", PRIORITY_MEDIUM)],
            utc_now!(),
        )
        .await
        .unwrap();

    f.dispatch.run_cycle().await.unwrap();

    assert_eq!(f.store.count_send_log_since("A", 0).await.unwrap(), 1);
    let messages = f.store.list_messages(None, false).await.unwrap();
    let rejected: Vec<_> = messages
        .iter()
        .filter(|m| m.error_ts.is_some())
        .collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(
        rejected[0].last_error.as_deref(),
        Some(RATE_LIMITED_ERROR)
    );
}

#[tokio::test]
async fn test_priority_order_within_account() {
    let f = fixture(vec![], RetrySchedule::default()).await;
    f.store.upsert_account(account("A")).await.unwrap();
    f.store
        .insert_messages(
            vec![
                queued("M-low", "A", PRIORITY_LOW),
                queued("M-high", "A", PRIORITY_HIGH),
                queued("M-medium", "A", PRIORITY_MEDIUM),
            ],
            utc_now!(),
        )
        .await
        .unwrap();

    // Single worker so delivery order mirrors start order.
    let store = f.store.clone();
    let limiter = Arc::new(RateLimiter::new(store.clone()));
    let cache = Arc::new(
        ContentCache::new(CacheConfig {
            memory_max_bytes: 1 << 20,
            memory_ttl: Duration::from_secs(60),
            disk_dir: None,
            disk_max_bytes: 0,
            disk_ttl: Duration::from_secs(60),
            threshold_bytes: 1 << 10,
        })
        .await
        .unwrap(),
    );
    let resolver = Arc::new(AttachmentResolver::new(
        cache,
        None,
        Duration::from_secs(5),
        4,
    ));
    let transport = ScriptedTransport::new(vec![]);
    let dispatch = DispatchLoop::new(
        store,
        limiter,
        resolver,
        transport.clone(),
        RetrySchedule::default(),
        Arc::new(AtomicBool::new(true)),
        Arc::new(Notify::new()),
        8,
        1,
        100,
        50,
    );
    dispatch.run_cycle().await.unwrap();

    let key_of = |id: &str| {
        let store = f.store.clone();
        let id = id.to_string();
        async move {
            store
                .get_message(None, &id)
                .await
                .unwrap()
                .unwrap()
                .key
                .to_string()
        }
    };
    let expected = vec![
        key_of("M-high").await,
        key_of("M-medium").await,
        key_of("M-low").await,
    ];
    let delivered_keys: Vec<String> = transport
        .deliveries()
        .await
        .iter()
        .map(|record| {
            record
                .body
                .lines()
                .find_map(|line| line.strip_prefix("X-Mail-ID: "))
                .unwrap()
                .trim()
                .to_string()
        })
        .collect();
    assert_eq!(delivered_keys, expected);
}

#[tokio::test]
async fn test_suspended_batch_is_not_dispatched() {
    let f = fixture(vec![], RetrySchedule::default()).await;
    f.store.upsert_account(account("A")).await.unwrap();
    let mut tenant = Tenant {
        id: "T".into(),
        active: true,
        ..Default::default()
    };
    tenant.suspended_batches.insert("NL-01".into());
    f.store.upsert_tenant(tenant).await.unwrap();

    let mut batched = queued("M10", "A", PRIORITY_MEDIUM);
    batched.tenant_id = Some("T".into());
    batched.batch_code = Some("NL-01".into());
    let mut plain = queued("M20", "A", PRIORITY_MEDIUM);
    plain.tenant_id = Some("T".into());
    f.store
        .insert_messages(vec![batched, plain], utc_now!())
        .await
        .unwrap();

    f.dispatch.run_cycle().await.unwrap();

    let batched = f.store.get_message(Some("T"), "M10").await.unwrap().unwrap();
    assert!(!batched.is_terminal());
    assert_eq!(batched.sent_ts, None);
    let plain = f.store.get_message(Some("T"), "M20").await.unwrap().unwrap();
    assert!(plain.sent_ts.is_some());
}

#[tokio::test]
async fn test_attachment_failure_counts_as_transient() {
    let f = fixture(vec![], RetrySchedule::default()).await;
    f.store.upsert_account(account("A")).await.unwrap();
    let mut message = queued("M1", "A", PRIORITY_MEDIUM);
    message.payload.attachments.push(crate::modules::message::AttachmentSpec {
        filename: "broken.bin".into(),
        storage_path: "base64:%%%invalid%%%".into(),
        ..Default::default()
    });
    f.store
        .insert_messages(vec![message], utc_now!())
        .await
        .unwrap();

    f.dispatch.run_cycle().await.unwrap();

    let stored = f.store.get_message(None, "M1").await.unwrap().unwrap();
    assert!(!stored.is_terminal());
    assert_eq!(stored.retry_count, 1);
    assert!(stored.deferred_ts > utc_now!());
    assert!(f.transport.deliveries().await.is_empty());
}

#[tokio::test]
async fn test_inactive_engine_processes_nothing() {
    let f = fixture(vec![], RetrySchedule::default()).await;
    f.store.upsert_account(account("A")).await.unwrap();
    f.store
        .insert_messages(vec![queued("M1", "A", PRIORITY_MEDIUM)], utc_now!())
        .await
        .unwrap();

    let store = f.store.clone();
    let limiter = Arc::new(RateLimiter::new(store.clone()));
    let cache = Arc::new(
        ContentCache::new(CacheConfig {
            memory_max_bytes: 1 << 20,
            memory_ttl: Duration::from_secs(60),
            disk_dir: None,
            disk_max_bytes: 0,
            disk_ttl: Duration::from_secs(60),
            threshold_bytes: 1 << 10,
        })
        .await
        .unwrap(),
    );
    let resolver = Arc::new(AttachmentResolver::new(
        cache,
        None,
        Duration::from_secs(5),
        4,
    ));
    let transport = ScriptedTransport::new(vec![]);
    let dispatch = DispatchLoop::new(
        store.clone(),
        limiter,
        resolver,
        transport.clone(),
        RetrySchedule::default(),
        Arc::new(AtomicBool::new(false)),
        Arc::new(Notify::new()),
        8,
        2,
        100,
        50,
    );
    dispatch.run_cycle().await.unwrap();

    assert!(transport.deliveries().await.is_empty());
    let stored = store.get_message(None, "M1").await.unwrap().unwrap();
    assert!(!stored.is_terminal());
}
