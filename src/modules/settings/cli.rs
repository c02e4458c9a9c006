// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use clap::Parser;
use std::{path::PathBuf, sync::LazyLock};

#[cfg(not(test))]
pub static SETTINGS: LazyLock<Settings> = LazyLock::new(Settings::parse);

#[cfg(test)]
pub static SETTINGS: LazyLock<Settings> = LazyLock::new(Settings::new_for_test);

#[derive(Debug, Parser)]
#[clap(
    name = "relaymail",
    about = "An asynchronous SMTP relay with a persistent, priority-ordered delivery queue,
    pushing delivery reports back to each submitting application.",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Settings {
    /// relaymail log level (default: "info")
    #[clap(long, default_value = "info", env, help = "Set the log level for relaymail")]
    pub relaymail_log_level: String,

    #[clap(long, default_value = "false", env, help = "Write logs to rolling files instead of stdout")]
    pub relaymail_log_to_file: bool,

    #[clap(long, default_value = "true", env, help = "Enable ANSI colors in stdout logs")]
    pub relaymail_ansi_logs: bool,

    /// Root directory holding the queue database, disk cache and log files
    #[clap(long, default_value = "./relaymail-data", env, help = "Set the data directory for relaymail")]
    pub relaymail_data_dir: PathBuf,

    #[clap(long, env, help = "Keep the queue database in memory (state is lost on restart)")]
    pub relaymail_metadata_memory_mode_enabled: bool,

    #[clap(long, env, help = "Set the metadata database cache size in bytes")]
    pub relaymail_metadata_cache_size: Option<usize>,

    /// Whether the dispatcher starts processing immediately
    #[clap(long, default_value = "true", env, help = "Start dispatching as soon as the process boots")]
    pub relaymail_start_active: bool,

    /// Fallback SMTP host for submissions that name no account
    #[clap(long, env, help = "Set the default SMTP host used when a message carries no account_id")]
    pub relaymail_default_smtp_host: Option<String>,

    #[clap(long, env, help = "Set the default SMTP port used when a message carries no account_id")]
    pub relaymail_default_smtp_port: Option<u16>,

    #[clap(long, env, help = "Set the username for the default SMTP endpoint")]
    pub relaymail_default_smtp_username: Option<String>,

    #[clap(long, env, help = "Set the password for the default SMTP endpoint")]
    pub relaymail_default_smtp_password: Option<String>,

    #[clap(long, default_value = "2", env, help = "Seconds between dispatch loop iterations")]
    pub relaymail_dispatch_interval: u64,

    #[clap(long, default_value = "300", env, help = "Fallback seconds between report loop iterations")]
    pub relaymail_report_interval: u64,

    #[clap(long, default_value = "600", env, help = "Seconds between cleanup loop iterations")]
    pub relaymail_cleanup_interval: u64,

    #[clap(long, default_value = "500", env, help = "Maximum messages claimed per dispatch cycle")]
    pub relaymail_dispatch_batch_size: usize,

    #[clap(long, default_value = "50", env, help = "Default per-account cap on messages per cycle")]
    pub relaymail_account_batch_size: u32,

    #[clap(long, default_value = "32", env, help = "Global cap on concurrent SMTP sends")]
    pub relaymail_max_concurrent_sends: usize,

    #[clap(long, default_value = "4", env, help = "Cap on concurrent sends per account")]
    pub relaymail_max_concurrent_per_account: usize,

    #[clap(long, default_value = "1000", env, help = "Maximum messages accepted in one submit call")]
    pub relaymail_max_submit_batch: usize,

    #[clap(long, default_value = "5", env, help = "Maximum delivery attempts for transient failures")]
    pub relaymail_max_retries: u32,

    #[clap(long, default_value = "30", env, help = "Seconds allowed for a single SMTP transaction")]
    pub relaymail_smtp_timeout: u64,

    #[clap(long, default_value = "120", env, help = "Default idle TTL in seconds for pooled SMTP sessions")]
    pub relaymail_smtp_idle_ttl: u64,

    #[clap(long, default_value = "10", env, help = "Grace period in seconds for in-flight sends on shutdown")]
    pub relaymail_shutdown_grace: u64,

    #[clap(long, default_value = "30", env, help = "Seconds allowed for fetching a single attachment")]
    pub relaymail_attachment_timeout: u64,

    #[clap(long, default_value = "4", env, help = "Concurrent attachment fetches per message")]
    pub relaymail_attachment_concurrency: usize,

    #[clap(long, env, help = "Base directory for relative filesystem attachment paths")]
    pub relaymail_attachment_base_dir: Option<PathBuf>,

    #[clap(long, default_value = "200", env, help = "Maximum report entries per sink POST")]
    pub relaymail_report_batch_size: usize,

    #[clap(long, default_value = "30", env, help = "Seconds allowed for a report sink POST")]
    pub relaymail_report_timeout: u64,

    #[clap(long, env, help = "Fallback report sink URL for messages without a tenant")]
    pub relaymail_report_sink_url: Option<String>,

    #[clap(long, env, help = "Bearer token for the fallback report sink")]
    pub relaymail_report_sink_token: Option<String>,

    #[clap(long, default_value = "7", env, help = "Days to retain reported messages")]
    pub relaymail_retention_days: u32,

    #[clap(long, default_value = "50", env, help = "Attachment memory cache budget in megabytes")]
    pub relaymail_cache_memory_max_mb: u64,

    #[clap(long, default_value = "300", env, help = "Attachment memory cache TTL in seconds")]
    pub relaymail_cache_memory_ttl: u64,

    #[clap(long, default_value = "500", env, help = "Attachment disk cache budget in megabytes")]
    pub relaymail_cache_disk_max_mb: u64,

    #[clap(long, default_value = "3600", env, help = "Attachment disk cache TTL in seconds")]
    pub relaymail_cache_disk_ttl: u64,

    #[clap(long, default_value = "100", env, help = "Entries above this size in KiB go to the disk tier")]
    pub relaymail_cache_disk_threshold_kb: u64,
}

impl Settings {
    #[cfg(test)]
    pub fn new_for_test() -> Self {
        Settings {
            relaymail_log_level: "info".into(),
            relaymail_log_to_file: false,
            relaymail_ansi_logs: false,
            relaymail_data_dir: std::env::temp_dir().join("relaymail-test-data"),
            relaymail_metadata_memory_mode_enabled: true,
            relaymail_metadata_cache_size: None,
            relaymail_start_active: true,
            relaymail_default_smtp_host: None,
            relaymail_default_smtp_port: None,
            relaymail_default_smtp_username: None,
            relaymail_default_smtp_password: None,
            relaymail_dispatch_interval: 2,
            relaymail_report_interval: 300,
            relaymail_cleanup_interval: 600,
            relaymail_dispatch_batch_size: 500,
            relaymail_account_batch_size: 50,
            relaymail_max_concurrent_sends: 32,
            relaymail_max_concurrent_per_account: 4,
            relaymail_max_submit_batch: 1000,
            relaymail_max_retries: 5,
            relaymail_smtp_timeout: 30,
            relaymail_smtp_idle_ttl: 120,
            relaymail_shutdown_grace: 10,
            relaymail_attachment_timeout: 30,
            relaymail_attachment_concurrency: 4,
            relaymail_attachment_base_dir: None,
            relaymail_report_batch_size: 200,
            relaymail_report_timeout: 30,
            relaymail_report_sink_url: None,
            relaymail_report_sink_token: None,
            relaymail_retention_days: 7,
            relaymail_cache_memory_max_mb: 50,
            relaymail_cache_memory_ttl: 300,
            relaymail_cache_disk_max_mb: 500,
            relaymail_cache_disk_ttl: 3600,
            relaymail_cache_disk_threshold_kb: 100,
        }
    }
}
