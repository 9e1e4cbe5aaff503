//! Bounded LRU cache of validation results keyed by the serialized
//! message sequence.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use crate::chat::{Message, ValidationResult};

/// Default number of distinct message sequences kept.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Hit/miss counters and current size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
}

pub struct ValidationCache {
    capacity: usize,
    entries: HashMap<String, ValidationResult>,
    /// Keys from least to most recently used.
    recency: VecDeque<String>,
    hits: u64,
    misses: u64,
}

impl ValidationCache {
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            recency: VecDeque::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Cache key for a message sequence.
    pub fn key(messages: &[Message]) -> String {
        serde_json::to_string(messages).unwrap_or_else(|_| format!("{messages:?}"))
    }

    pub fn get(&mut self, key: &str) -> Option<ValidationResult> {
        match self.entries.get(key) {
            Some(result) => {
                let result = result.clone();
                self.hits += 1;
                self.touch(key);
                Some(result)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, key: String, result: ValidationResult) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.insert(key.clone(), result).is_some() {
            self.touch(&key);
            return;
        }
        self.recency.push_back(key);
        while self.entries.len() > self.capacity {
            match self.recency.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            len: self.entries.len(),
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            if let Some(k) = self.recency.remove(pos) {
                self.recency.push_back(k);
            }
        }
    }
}
