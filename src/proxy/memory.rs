use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::tasks::TimerQueue;

pub const DEFAULT_MEMORY_BUDGET: u64 = 10 * 1024 * 1024;

#[derive(Clone)]
struct MemoryEntry {
    headers: HeaderMap,
    body: Bytes,
    expires_at: Instant,
    generation: u64,
    size: u64,
}

struct MemoryState {
    lru: LruCache<String, MemoryEntry>,
    bytes_in_use: u64,
    next_generation: u64,
}

impl MemoryState {
    fn remove(&mut self, hash: &str) -> Option<MemoryEntry> {
        let removed = self.lru.pop(hash)?;
        self.bytes_in_use = self.bytes_in_use.saturating_sub(removed.size);
        Some(removed)
    }
}

/// Byte-budgeted LRU for volatile responses. Entries carry a scheduled
/// expiration on the shared timer queue; the callback re-checks the entry's
/// generation so a stale timer firing after replacement or LRU eviction is a
/// no-op.
#[derive(Clone)]
pub struct MemoryCache {
    state: Arc<Mutex<MemoryState>>,
    budget: u64,
    timers: TimerQueue,
}

impl MemoryCache {
    pub fn new(budget: u64, timers: TimerQueue) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                lru: LruCache::unbounded(),
                bytes_in_use: 0,
                next_generation: 0,
            })),
            budget,
            timers,
        }
    }

    /// Looks up an entry, refreshing its recency. An entry past its deadline
    /// that the timer has not swept yet counts as a miss and is dropped.
    pub fn load(&self, hash: &str) -> Option<(HeaderMap, Bytes)> {
        let mut state = self.state.lock();
        let expired = match state.lru.get(hash) {
            Some(entry) => entry.expires_at <= Instant::now(),
            None => return None,
        };
        if expired {
            state.remove(hash);
            return None;
        }
        let entry = state.lru.get(hash).expect("entry checked above");
        Some((entry.headers.clone(), entry.body.clone()))
    }

    /// Inserts an entry expiring after `max_age`. An entry bigger than the
    /// whole budget is silently dropped; otherwise least-recently-used
    /// entries are evicted until the budget holds.
    pub fn store(&self, hash: &str, max_age: Duration, headers: HeaderMap, body: Bytes) {
        let size = entry_size(&headers, &body);
        if size > self.budget {
            trace!(hash, size, "volatile entry exceeds memory budget; skipped");
            return;
        }
        let expires_at = Instant::now() + max_age;
        let generation = {
            let mut state = self.state.lock();
            state.remove(hash);
            let generation = state.next_generation;
            state.next_generation += 1;
            state.lru.push(
                hash.to_string(),
                MemoryEntry {
                    headers,
                    body,
                    expires_at,
                    generation,
                    size,
                },
            );
            state.bytes_in_use += size;
            while state.bytes_in_use > self.budget {
                let Some((_, removed)) = state.lru.pop_lru() else {
                    break;
                };
                state.bytes_in_use = state.bytes_in_use.saturating_sub(removed.size);
            }
            generation
        };

        // The expiration callback holds only a weak pointer, so it neither
        // pins the cache nor an entry the LRU already discarded.
        let weak = Arc::downgrade(&self.state);
        let hash = hash.to_string();
        self.timers.schedule(expires_at, move || {
            expire_entry(&weak, &hash, generation);
        });
    }

    #[cfg(test)]
    fn bytes_in_use(&self) -> u64 {
        self.state.lock().bytes_in_use
    }
}

fn expire_entry(state: &Weak<Mutex<MemoryState>>, hash: &str, generation: u64) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let mut state = state.lock();
    let current = state
        .lru
        .peek(hash)
        .map(|entry| entry.generation == generation)
        .unwrap_or(false);
    if current {
        state.remove(hash);
    }
}

/// LRU accounting charges the body plus every header name and value byte.
fn entry_size(headers: &HeaderMap, body: &Bytes) -> u64 {
    let header_bytes: usize = headers
        .iter()
        .map(|(name, value)| name.as_str().len() + value.as_bytes().len())
        .sum();
    (body.len() + header_bytes) as u64
}
