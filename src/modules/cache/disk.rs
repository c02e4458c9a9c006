// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tracing::warn;

/// On-disk cache tier. Files are named by their content hash under a
/// two-level fan-out directory; the file mtime doubles as the entry's
/// stored-at instant for TTL checks. Eviction removes oldest files first
/// until the byte budget holds.
pub struct DiskTier {
    dir: PathBuf,
    max_bytes: u64,
    ttl: Duration,
}

impl DiskTier {
    pub fn new(dir: PathBuf, max_bytes: u64, ttl: Duration) -> Self {
        Self {
            dir,
            max_bytes,
            ttl,
        }
    }

    pub async fn init(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let fanout = key.get(0..2).unwrap_or("00");
        self.dir.join(fanout).join(key)
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.path_for(key);
        let metadata = tokio::fs::metadata(&path).await.ok()?;
        if Self::age_of(&metadata) > self.ttl {
            let _ = tokio::fs::remove_file(&path).await;
            return None;
        }
        tokio::fs::read(&path).await.ok()
    }

    pub async fn put(&self, key: &str, data: &[u8]) {
        if data.len() as u64 > self.max_bytes {
            return;
        }
        if let Err(e) = self.ensure_space(data.len() as u64).await {
            warn!("Disk cache eviction failed: {:?}", e);
            return;
        }
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("Disk cache mkdir failed for {:?}: {:?}", parent, e);
                return;
            }
        }
        if let Err(e) = tokio::fs::write(&path, data).await {
            warn!("Disk cache write failed for {:?}: {:?}", path, e);
        }
    }

    async fn ensure_space(&self, needed: u64) -> std::io::Result<()> {
        let mut files = self.list_files().await?;
        let mut total: u64 = files.iter().map(|(_, size, _)| size).sum();
        if total + needed <= self.max_bytes {
            return Ok(());
        }
        files.sort_by_key(|(_, _, mtime)| *mtime);
        for (path, size, _) in files {
            if total + needed <= self.max_bytes {
                break;
            }
            if tokio::fs::remove_file(&path).await.is_ok() {
                total -= size;
            }
        }
        Ok(())
    }

    pub async fn sweep_expired(&self) -> usize {
        let Ok(files) = self.list_files().await else {
            return 0;
        };
        let now = SystemTime::now();
        let mut removed = 0;
        for (path, _, mtime) in files {
            let age = now.duration_since(mtime).unwrap_or_default();
            if age > self.ttl && tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }

    async fn list_files(&self) -> std::io::Result<Vec<(PathBuf, u64, SystemTime)>> {
        let mut files = Vec::new();
        let mut subdirs = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e),
        };
        while let Some(subdir) = subdirs.next_entry().await? {
            if !subdir.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(subdir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let metadata = entry.metadata().await?;
                if metadata.is_file() {
                    let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    files.push((entry.path(), metadata.len(), mtime));
                }
            }
        }
        Ok(files)
    }

    fn age_of(metadata: &std::fs::Metadata) -> Duration {
        metadata
            .modified()
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
            .unwrap_or_default()
    }
}
