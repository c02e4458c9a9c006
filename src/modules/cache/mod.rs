// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OnceCell};

use crate::modules::error::RelayMailResult;

mod disk;
mod memory;

use disk::DiskTier;
use memory::MemoryTier;

/// Content-addressed attachment cache with a memory tier for small entries
/// and a disk tier for everything else. Keys are content hashes (sha256 of
/// the bytes, or the caller-supplied legacy md5 marker).
///
/// Concurrent misses for the same key coalesce into a single
/// materialization: late callers await the first caller's in-flight fetch.
pub struct ContentCache {
    memory: Mutex<MemoryTier>,
    disk: Option<DiskTier>,
    threshold_bytes: u64,
    inflight: DashMap<String, Arc<OnceCell<Arc<Vec<u8>>>>>,
}

pub struct CacheConfig {
    pub memory_max_bytes: u64,
    pub memory_ttl: Duration,
    pub disk_dir: Option<PathBuf>,
    pub disk_max_bytes: u64,
    pub disk_ttl: Duration,
    pub threshold_bytes: u64,
}

impl ContentCache {
    pub async fn new(config: CacheConfig) -> RelayMailResult<Self> {
        let disk = match config.disk_dir {
            Some(dir) => {
                let tier = DiskTier::new(dir, config.disk_max_bytes, config.disk_ttl);
                tier.init().await.map_err(|e| {
                    crate::raise_error!(
                        format!("{:#?}", e),
                        crate::modules::error::code::ErrorCode::InternalError
                    )
                })?;
                Some(tier)
            }
            None => None,
        };
        Ok(Self {
            memory: Mutex::new(MemoryTier::new(config.memory_max_bytes, config.memory_ttl)),
            disk,
            threshold_bytes: config.threshold_bytes,
            inflight: DashMap::new(),
        })
    }

    /// Memory first, then disk. A disk hit small enough for the memory tier
    /// is promoted so the next lookup stays off the filesystem.
    pub async fn lookup(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        if let Some(hit) = self.memory.lock().await.get(key) {
            return Some(hit);
        }
        let disk = self.disk.as_ref()?;
        let content = Arc::new(disk.get(key).await?);
        if content.len() as u64 <= self.threshold_bytes {
            self.memory
                .lock()
                .await
                .put(key.to_string(), content.clone());
        }
        Some(content)
    }

    /// Entries within the threshold land in memory; larger ones go to disk
    /// only.
    pub async fn store(&self, key: &str, content: Arc<Vec<u8>>) {
        if content.len() as u64 <= self.threshold_bytes {
            self.memory.lock().await.put(key.to_string(), content);
        } else if let Some(disk) = &self.disk {
            disk.put(key, &content).await;
        }
    }

    /// Single-flight lookup: on a miss, run `fetch` at most once per key no
    /// matter how many tasks arrive concurrently. A failed fetch releases
    /// the key so a later caller can retry.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> RelayMailResult<Arc<Vec<u8>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RelayMailResult<Vec<u8>>>,
    {
        if let Some(hit) = self.lookup(key).await {
            return Ok(hit);
        }
        let cell = {
            let entry = self
                .inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()));
            entry.value().clone()
        };
        let result = cell
            .get_or_try_init(|| async {
                if let Some(hit) = self.lookup(key).await {
                    return Ok(hit);
                }
                let content = Arc::new(fetch().await?);
                self.store(key, content.clone()).await;
                Ok(content)
            })
            .await
            .cloned();
        self.inflight.remove(key);
        result
    }

    /// Drop expired entries from both tiers. Returns per-tier removal
    /// counts.
    pub async fn sweep_expired(&self) -> (usize, usize) {
        let memory_removed = self.memory.lock().await.sweep_expired();
        let disk_removed = match &self.disk {
            Some(disk) => disk.sweep_expired().await,
            None => 0,
        };
        (memory_removed, disk_removed)
    }
}
