//! TTL-bounded response cache for idempotent queries
//!
//! Keyed by method plus canonicalized parameters. Mutations invalidate
//! every cached entry for the same resource class (the method prefix
//! before the first dot), so readers never see state older than the last
//! mutation they raced with, and never older than the TTL either way.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Default entry lifetime
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    stored_at: Instant,
}

/// Read-through cache for query responses.
///
/// Explicitly owned by the API client and passed by reference; multiple
/// independent clients each get their own cache.
pub struct ResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Cache key: method plus canonical JSON of the parameters.
    fn key(method: &str, params: &Value) -> String {
        format!("{}\u{1f}{}", method, params)
    }

    /// Resource class of a method ("zfs.dataset.query" -> "zfs").
    fn class_of(method: &str) -> &str {
        method.split('.').next().unwrap_or(method)
    }

    /// Look up a fresh entry. Expired entries count as misses and are
    /// left for the next insert to overwrite.
    pub fn get(&self, method: &str, params: &Value) -> Option<Value> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(&Self::key(method, params))?;
        if entry.stored_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn put(&self, method: &str, params: &Value, value: Value) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                Self::key(method, params),
                CacheEntry {
                    value,
                    stored_at: Instant::now(),
                },
            );
        }
    }

    /// Drop every entry whose method shares the mutated resource class.
    pub fn invalidate_class(&self, method: &str) {
        let class = Self::class_of(method);
        if let Ok(mut entries) = self.entries.write() {
            let before = entries.len();
            entries.retain(|key, _| {
                let cached_method = key.split('\u{1f}').next().unwrap_or("");
                Self::class_of(cached_method) != class
            });
            let dropped = before - entries.len();
            if dropped > 0 {
                log::debug!("invalidated {} cached response(s) for class {}", dropped, class);
            }
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
