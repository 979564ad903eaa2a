// Flood Control - per-sender and per-content token buckets
//
// A packet is admitted only when both its sender's bucket and its content
// bucket hold a token. Neither bucket is charged when either one is empty.

use crate::dedup::content_key::ContentKey;
use crate::dedup::lru::LruCache;
use crate::identity::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FloodError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

// ============================================================================
// TOKEN BUCKET
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill_ms: u64,
}

impl TokenBucket {
    /// Starts full
    pub fn new(capacity: f64, refill_per_sec: f64, now_ms: u64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            tokens: capacity,
            last_refill_ms: now_ms,
        }
    }

    fn refill(&mut self, now_ms: u64) {
        let elapsed_ms = now_ms.saturating_sub(self.last_refill_ms);
        if elapsed_ms > 0 {
            let added = elapsed_ms as f64 / 1000.0 * self.refill_per_sec;
            self.tokens = (self.tokens + added).min(self.capacity);
            self.last_refill_ms = now_ms;
        }
    }

    pub fn available_at(&mut self, now_ms: u64) -> f64 {
        self.refill(now_ms);
        self.tokens
    }

    pub fn has_token_at(&mut self, now_ms: u64) -> bool {
        self.available_at(now_ms) >= 1.0
    }

    pub fn try_take_at(&mut self, now_ms: u64) -> bool {
        if self.has_token_at(now_ms) {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// A full bucket carries no information and can be forgotten
    pub fn is_full_at(&mut self, now_ms: u64) -> bool {
        self.available_at(now_ms) >= self.capacity
    }
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FloodConfig {
    pub sender_capacity: f64,
    pub sender_refill_per_sec: f64,
    pub content_capacity: f64,
    pub content_refill_per_sec: f64,
    /// Normalized-content keys remembered for duplicate suppression
    pub content_cache_capacity: usize,
    /// Buckets tracked per dimension before the oldest is dropped
    pub max_tracked_keys: usize,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            sender_capacity: 30.0,
            sender_refill_per_sec: 0.5,
            content_capacity: 5.0,
            content_refill_per_sec: 0.25,
            content_cache_capacity: 2048,
            max_tracked_keys: 4096,
        }
    }
}

impl FloodConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sender_bucket(mut self, capacity: f64, refill_per_sec: f64) -> Self {
        self.sender_capacity = capacity;
        self.sender_refill_per_sec = refill_per_sec;
        self
    }

    pub fn with_content_bucket(mut self, capacity: f64, refill_per_sec: f64) -> Self {
        self.content_capacity = capacity;
        self.content_refill_per_sec = refill_per_sec;
        self
    }

    pub fn with_content_cache_capacity(mut self, capacity: usize) -> Self {
        self.content_cache_capacity = capacity;
        self
    }

    pub fn with_max_tracked_keys(mut self, max: usize) -> Self {
        self.max_tracked_keys = max;
        self
    }

    pub fn validate(&self) -> Result<(), FloodError> {
        if self.sender_capacity < 1.0 || self.content_capacity < 1.0 {
            return Err(FloodError::InvalidConfig("bucket capacity must be at least 1".to_string()));
        }
        if self.sender_refill_per_sec < 0.0 || self.content_refill_per_sec < 0.0 {
            return Err(FloodError::InvalidConfig("refill rate cannot be negative".to_string()));
        }
        if self.content_cache_capacity == 0 || self.max_tracked_keys == 0 {
            return Err(FloodError::InvalidConfig("cache sizes cannot be 0".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// FLOOD CONTROLLER
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    SenderLimited,
    ContentLimited,
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        self == Self::Admitted
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FloodStats {
    pub admitted: u64,
    pub sender_limited: u64,
    pub content_limited: u64,
    pub duplicate_content: u64,
    pub idle_buckets_pruned: u64,
}

pub struct FloodController {
    config: FloodConfig,
    senders: LruCache<PeerId, TokenBucket>,
    contents: LruCache<ContentKey, TokenBucket>,
    seen_content: LruCache<ContentKey, u64>,
    stats: FloodStats,
}

impl FloodController {
    pub fn new(config: FloodConfig) -> Self {
        Self {
            senders: LruCache::new(config.max_tracked_keys),
            contents: LruCache::new(config.max_tracked_keys),
            seen_content: LruCache::new(config.content_cache_capacity),
            config,
            stats: FloodStats::default(),
        }
    }

    pub fn config(&self) -> &FloodConfig {
        &self.config
    }

    pub fn stats(&self) -> &FloodStats {
        &self.stats
    }

    pub fn tracked_senders(&self) -> usize {
        self.senders.len()
    }

    pub fn tracked_contents(&self) -> usize {
        self.contents.len()
    }

    /// Charge one token from each bucket if both have one
    pub fn admit_at(&mut self, sender: PeerId, content: ContentKey, now_ms: u64) -> Admission {
        let config = &self.config;
        if !self.senders.contains(&sender) {
            self.senders.insert(
                sender,
                TokenBucket::new(config.sender_capacity, config.sender_refill_per_sec, now_ms),
            );
        }
        if !self.contents.contains(&content) {
            self.contents.insert(
                content,
                TokenBucket::new(config.content_capacity, config.content_refill_per_sec, now_ms),
            );
        }

        let sender_ok = self.senders.get_mut(&sender).is_some_and(|b| b.has_token_at(now_ms));
        if !sender_ok {
            self.stats.sender_limited += 1;
            debug!(sender = %sender, "Sender rate limited");
            return Admission::SenderLimited;
        }
        let content_ok = self.contents.get_mut(&content).is_some_and(|b| b.has_token_at(now_ms));
        if !content_ok {
            self.stats.content_limited += 1;
            debug!(sender = %sender, content = %content, "Content rate limited");
            return Admission::ContentLimited;
        }

        if let Some(bucket) = self.senders.get_mut(&sender) {
            bucket.try_take_at(now_ms);
        }
        if let Some(bucket) = self.contents.get_mut(&content) {
            bucket.try_take_at(now_ms);
        }
        self.stats.admitted += 1;
        Admission::Admitted
    }

    /// Record `content` as seen; true if it was already present
    pub fn check_duplicate_content_at(&mut self, content: ContentKey, now_ms: u64) -> bool {
        if self.seen_content.contains(&content) {
            self.stats.duplicate_content += 1;
            return true;
        }
        self.seen_content.insert(content, now_ms);
        false
    }

    /// Forget buckets that have refilled completely
    pub fn prune_idle_at(&mut self, now_ms: u64) -> usize {
        let before = self.senders.len() + self.contents.len();
        let idle_senders: Vec<PeerId> = self
            .senders
            .keys()
            .copied()
            .collect::<Vec<_>>()
            .into_iter()
            .filter(|k| self.senders.get_mut(k).is_some_and(|b| b.is_full_at(now_ms)))
            .collect();
        for k in idle_senders {
            self.senders.remove(&k);
        }
        let idle_contents: Vec<ContentKey> = self
            .contents
            .keys()
            .copied()
            .collect::<Vec<_>>()
            .into_iter()
            .filter(|k| self.contents.get_mut(k).is_some_and(|b| b.is_full_at(now_ms)))
            .collect();
        for k in idle_contents {
            self.contents.remove(&k);
        }
        let pruned = before - (self.senders.len() + self.contents.len());
        self.stats.idle_buckets_pruned += pruned as u64;
        pruned
    }
}
