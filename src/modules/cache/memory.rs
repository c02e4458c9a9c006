// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use lru::LruCache;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct MemoryEntry {
    data: Arc<Vec<u8>>,
    stored_at: Instant,
}

/// In-memory cache tier: least-recently-used within a byte budget, entries
/// expire after the tier TTL.
pub struct MemoryTier {
    entries: LruCache<String, MemoryEntry>,
    max_bytes: u64,
    ttl: Duration,
    current_bytes: u64,
}

impl MemoryTier {
    pub fn new(max_bytes: u64, ttl: Duration) -> Self {
        Self {
            entries: LruCache::unbounded(),
            max_bytes,
            ttl,
            current_bytes: 0,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<Arc<Vec<u8>>> {
        let expired = self
            .entries
            .peek(key)
            .map(|entry| entry.stored_at.elapsed() > self.ttl)?;
        if expired {
            self.remove(key);
            return None;
        }
        self.entries.get(key).map(|entry| entry.data.clone())
    }

    pub fn put(&mut self, key: String, data: Arc<Vec<u8>>) {
        let size = data.len() as u64;
        if size > self.max_bytes {
            return;
        }
        self.remove(&key);
        while self.current_bytes + size > self.max_bytes {
            let Some((_, evicted)) = self.entries.pop_lru() else {
                break;
            };
            self.current_bytes -= evicted.data.len() as u64;
        }
        self.current_bytes += size;
        self.entries.put(
            key,
            MemoryEntry {
                data,
                stored_at: Instant::now(),
            },
        );
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.pop(key) {
            self.current_bytes -= entry.data.len() as u64;
        }
    }

    pub fn sweep_expired(&mut self) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.stored_at.elapsed() > self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        let count = expired.len();
        for key in expired {
            self.remove(&key);
        }
        count
    }

    pub fn size_bytes(&self) -> u64 {
        self.current_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_budget_evicts_least_recently_used() {
        let mut tier = MemoryTier::new(10, Duration::from_secs(60));
        tier.put("a".into(), Arc::new(vec![0u8; 4]));
        tier.put("b".into(), Arc::new(vec![0u8; 4]));
        assert!(tier.get("a").is_some()); // refresh "a"

        tier.put("c".into(), Arc::new(vec![0u8; 4]));
        assert!(tier.get("b").is_none());
        assert!(tier.get("a").is_some());
        assert!(tier.get("c").is_some());
        assert_eq!(tier.size_bytes(), 8);
    }

    #[test]
    fn test_oversized_entry_is_not_admitted() {
        let mut tier = MemoryTier::new(10, Duration::from_secs(60));
        tier.put("big".into(), Arc::new(vec![0u8; 11]));
        assert!(tier.get("big").is_none());
        assert_eq!(tier.size_bytes(), 0);
    }

    #[test]
    fn test_replacing_entry_updates_budget() {
        let mut tier = MemoryTier::new(10, Duration::from_secs(60));
        tier.put("a".into(), Arc::new(vec![0u8; 8]));
        tier.put("a".into(), Arc::new(vec![0u8; 2]));
        assert_eq!(tier.size_bytes(), 2);
    }
}
