use std::sync::Arc;
use std::time::Duration;

use modules::{
    cache::{CacheConfig, ContentCache},
    common::signal::SIGNAL_MANAGER,
    coordinator::MailRelay,
    database::manager::open_database,
    error::RelayMailResult,
    logger,
    settings::cli::SETTINGS,
    smtp::pool::PooledSmtpTransport,
    store::MailStore,
};
use tracing::info;

mod modules;

static LOGO: &str = r#"
  ____      _             __  __       _ _
 |  _ \ ___| | __ _ _   _|  \/  | __ _(_) |
 | |_) / _ \ |/ _` | | | | |\/| |/ _` | | |
 |  _ <  __/ | (_| | |_| | |  | | (_| | | |
 |_| \_\___|_|\__,_|\__, |_|  |_|\__,_|_|_|
                    |___/
"#;

#[tokio::main]
async fn main() -> RelayMailResult<()> {
    logger::initialize_logging();
    info!("{}", LOGO);
    info!("Starting relaymail-server");
    info!("Version:  {}", relaymail_version!());
    info!("Git:      [{}]", env!("GIT_HASH"));

    SIGNAL_MANAGER.listen_for_os_signals();

    let store = Arc::new(MailStore::new(open_database()?));
    let cache = Arc::new(
        ContentCache::new(CacheConfig {
            memory_max_bytes: SETTINGS.relaymail_cache_memory_max_mb * 1024 * 1024,
            memory_ttl: Duration::from_secs(SETTINGS.relaymail_cache_memory_ttl),
            disk_dir: Some(SETTINGS.relaymail_data_dir.join("attachment-cache")),
            disk_max_bytes: SETTINGS.relaymail_cache_disk_max_mb * 1024 * 1024,
            disk_ttl: Duration::from_secs(SETTINGS.relaymail_cache_disk_ttl),
            threshold_bytes: SETTINGS.relaymail_cache_disk_threshold_kb * 1024,
        })
        .await?,
    );
    let transport = Arc::new(PooledSmtpTransport::new());

    let relay = MailRelay::new(store, transport, cache);
    relay.start().await;

    let mut shutdown = SIGNAL_MANAGER.subscribe();
    let _ = shutdown.recv().await;
    relay.stop().await;
    Ok(())
}
