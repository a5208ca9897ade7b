//! Short-lived response memo for the router.

use fleet_core::config::RouterConfig;
use fleet_core::BackendId;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A memoized answer.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoHit {
    pub text: String,
    pub model_used: String,
    pub backend: BackendId,
}

struct MemoEntry {
    hit: MemoHit,
    stored_at: Instant,
}

/// Hit/miss counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// TTL cache keyed by normalized request content.
///
/// Only short, text-only prompts are eligible, and only answers below the
/// size ceiling are stored. A capacity of zero disables the memo.
pub struct ResponseMemo {
    ttl: Duration,
    capacity: usize,
    max_prompt_chars: usize,
    max_response_chars: usize,
    entries: Mutex<HashMap<String, MemoEntry>>,
    stats: Mutex<MemoStats>,
}

impl ResponseMemo {
    /// Empty memo sized from the router settings.
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            ttl: config.memo_ttl(),
            capacity: config.memo_capacity,
            max_prompt_chars: config.memo_max_prompt_chars,
            max_response_chars: config.memo_max_response_chars,
            entries: Mutex::new(HashMap::new()),
            stats: Mutex::new(MemoStats::default()),
        }
    }

    /// Whether a request may be served from or stored into the memo.
    pub fn is_eligible(&self, prompt: &str, has_images: bool) -> bool {
        self.capacity > 0 && !has_images && prompt.chars().count() <= self.max_prompt_chars
    }

    /// SHA-256 over the whitespace- and case-normalized request.
    pub fn key(prompt: &str, category: &str, model: &str) -> String {
        let normalized = prompt
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(category.trim().to_lowercase().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(model.trim().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Unexpired entry for `key`, counting hits and misses.
    pub fn get(&self, key: &str) -> Option<MemoHit> {
        self.get_at(key, Instant::now())
    }

    /// Like [`Self::get`], at an injected instant.
    pub fn get_at(&self, key: &str, now: Instant) -> Option<MemoHit> {
        let found = {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(entry) if now.saturating_duration_since(entry.stored_at) < self.ttl => {
                    Some(entry.hit.clone())
                }
                Some(_) => {
                    entries.remove(key);
                    None
                }
                None => None,
            }
        };
        let mut stats = self.stats.lock();
        if found.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        found
    }

    /// Stores an answer. Returns `false` when it exceeds the size ceiling.
    pub fn put(&self, key: String, hit: MemoHit) -> bool {
        self.put_at(key, hit, Instant::now())
    }

    /// Stores a response, evicting expired and then oldest entries at
    /// capacity. Oversized responses are not kept; returns whether it was.
    pub fn put_at(&self, key: String, hit: MemoHit, now: Instant) -> bool {
        if self.capacity == 0 || hit.text.chars().count() > self.max_response_chars {
            return false;
        }
        let mut evicted = 0;
        {
            let mut entries = self.entries.lock();
            if entries.len() >= self.capacity && !entries.contains_key(&key) {
                let ttl = self.ttl;
                let before = entries.len();
                entries.retain(|_, e| now.saturating_duration_since(e.stored_at) < ttl);
                evicted += before - entries.len();
                while entries.len() >= self.capacity {
                    let oldest = entries
                        .iter()
                        .min_by_key(|(_, e)| e.stored_at)
                        .map(|(k, _)| k.clone());
                    match oldest {
                        Some(k) => {
                            entries.remove(&k);
                            evicted += 1;
                        }
                        None => break,
                    }
                }
            }
            entries.insert(
                key,
                MemoEntry {
                    hit,
                    stored_at: now,
                },
            );
        }
        self.stats.lock().evictions += evicted as u64;
        true
    }

    /// Hit, miss and size counters.
    pub fn stats(&self) -> MemoStats {
        let mut stats = self.stats.lock().clone();
        stats.entries = self.entries.lock().len();
        stats
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn memo(capacity: usize) -> ResponseMemo {
        ResponseMemo::new(&RouterConfig {
            memo_ttl_secs: 60,
            memo_max_prompt_chars: 10,
            memo_max_response_chars: 8,
            memo_capacity: capacity,
        })
    }

    fn hit(text: &str) -> MemoHit {
        MemoHit {
            text: text.into(),
            model_used: "qwen2.5:3b".into(),
            backend: BackendId::Fast,
        }
    }

    #[test]
    fn test_eligibility_boundaries() {
        let m = memo(10);
        assert!(m.is_eligible("0123456789", false));
        assert!(!m.is_eligible("0123456789a", false));
        assert!(!m.is_eligible("short", true));
        assert!(!memo(0).is_eligible("short", false));
    }

    #[test]
    fn test_response_ceiling() {
        let m = memo(10);
        assert!(m.put("k1".into(), hit("12345678")));
        assert!(!m.put("k2".into(), hit("123456789")));
        assert!(m.get("k1").is_some());
        assert!(m.get("k2").is_none());
    }

    #[test]
    fn test_key_normalization() {
        let a = ResponseMemo::key("  Hello   World ", "general", "m");
        let b = ResponseMemo::key("hello world", "General", "m");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, ResponseMemo::key("hello world", "coding", "m"));
        assert_ne!(a, ResponseMemo::key("hello world", "general", "other"));
    }

    #[test]
    fn test_ttl_expiry() {
        let m = memo(10);
        let t0 = Instant::now();
        m.put_at("k".into(), hit("a"), t0);
        assert!(m.get_at("k", t0 + Duration::from_secs(59)).is_some());
        assert!(m.get_at("k", t0 + Duration::from_secs(60)).is_none());
        assert_eq!(m.stats().entries, 0);
    }

    #[test]
    fn test_evicts_oldest_at_capacity() {
        let m = memo(2);
        let t0 = Instant::now();
        m.put_at("a".into(), hit("a"), t0);
        m.put_at("b".into(), hit("b"), t0 + Duration::from_secs(1));
        m.put_at("c".into(), hit("c"), t0 + Duration::from_secs(2));
        let now = t0 + Duration::from_secs(3);
        assert!(m.get_at("a", now).is_none());
        assert!(m.get_at("b", now).is_some());
        assert!(m.get_at("c", now).is_some());
        let stats = m.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }
}
