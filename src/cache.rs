//! Tiered TTL cache for query responses.
//!
//! Keys are `hex(sha256(command)) + ":" + tier`, so the same text cached
//! under different tiers never collides. Reads always clone the stored
//! response. Expired entries are evicted lazily on lookup; a bulk sweep
//! runs on write once the cleanup deadline has passed.

use crate::config::CacheConfig;
use crate::response::Response;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Cache tier selecting one of the configured TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    Short,
    Mid,
    Long,
}

impl CacheTier {
    fn suffix(self) -> &'static str {
        match self {
            CacheTier::Short => "short",
            CacheTier::Mid => "mid",
            CacheTier::Long => "long",
        }
    }
}

/// Hit/miss counters for monitoring.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

struct CacheEntry {
    expires_at: Instant,
    response: Response,
}

pub(crate) struct ResultCache {
    entries: DashMap<String, CacheEntry>,
    config: CacheConfig,
    next_sweep: Mutex<Instant>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub(crate) fn new(config: CacheConfig) -> Self {
        let next_sweep = Instant::now() + config.cleanup_interval;
        Self {
            entries: DashMap::new(),
            config,
            next_sweep: Mutex::new(next_sweep),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub(crate) fn key(command: &str, tier: CacheTier) -> String {
        format!(
            "{}:{}",
            hex::encode(Sha256::digest(command.as_bytes())),
            tier.suffix()
        )
    }

    /// Cloned response on hit; expired entries are evicted on the spot.
    pub(crate) fn get(&self, key: &str) -> Option<Response> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > Instant::now() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.response.clone());
            }
            drop(entry);
            self.entries.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Upsert a clone under the tier's TTL, sweeping first when due.
    pub(crate) fn put(&self, key: &str, response: &Response, tier: CacheTier) {
        let now = Instant::now();
        {
            let mut deadline = match self.next_sweep.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if now >= *deadline {
                self.entries.retain(|_, entry| entry.expires_at > now);
                *deadline = now + self.config.cleanup_interval;
            }
        }
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                expires_at: now + self.ttl(tier),
                response: response.clone(),
            },
        );
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn ttl(&self, tier: CacheTier) -> Duration {
        match tier {
            CacheTier::Short => self.config.short_ttl,
            CacheTier::Mid => self.config.mid_ttl,
            CacheTier::Long => self.config.long_ttl,
        }
    }
}
