//! Time-bounded memo of successful tool results, shared across turns.
//!
//! Expiry checks and eviction happen inside the same critical section as the
//! lookup or insert, so concurrent turns never observe a stale entry.

use crate::models::{ToolCallSignature, ToolResult};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

struct CacheEntry {
    result: ToolResult,
    expires_at: Instant,
    /// Matches the queue slot that owns this entry.
    generation: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<ToolCallSignature, CacheEntry>,
    /// Insertion order; stale slots (older generation) are skipped lazily.
    order: VecDeque<(ToolCallSignature, u64)>,
    next_generation: u64,
}

pub struct ResultCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    capacity: usize,
}

impl ResultCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
    pub const DEFAULT_CAPACITY: usize = 200;

    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Fetch a live entry. Expired entries are removed and reported as a miss.
    pub fn get(&self, signature: &ToolCallSignature) -> Option<ToolResult> {
        let mut inner = self.lock()?;
        let now = Instant::now();

        let expired = match inner.entries.get(signature) {
            None => return None,
            Some(entry) => entry.expires_at <= now,
        };

        if expired {
            inner.entries.remove(signature);
            debug!(sig = %signature.fingerprint(), "cache entry expired");
            return None;
        }

        inner.entries.get(signature).map(|e| e.result.clone())
    }

    /// Store a successful result. Failures are ignored so a corrected retry
    /// is never masked by a stale error.
    pub fn put(&self, signature: ToolCallSignature, result: ToolResult) {
        if !result.is_success() {
            return;
        }

        let Some(mut inner) = self.lock() else {
            return;
        };
        let now = Instant::now();

        inner.next_generation += 1;
        let generation = inner.next_generation;

        inner.entries.insert(
            signature.clone(),
            CacheEntry {
                result,
                expires_at: now + self.ttl,
                generation,
            },
        );
        inner.order.push_back((signature, generation));

        while inner.entries.len() > self.capacity {
            if !Self::evict_oldest(&mut inner, now) {
                break;
            }
        }

        // Keep the order queue from growing without bound on overwrites.
        if inner.order.len() > self.capacity * 2 {
            Self::compact_order(&mut inner);
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let Some(mut inner) = self.lock() else {
            return 0;
        };
        let now = Instant::now();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.expires_at > now);
        Self::compact_order(&mut inner);
        before - inner.entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A poisoned lock is a cache fault: log it and behave as a miss.
    fn lock(&self) -> Option<MutexGuard<'_, CacheInner>> {
        match self.inner.lock() {
            Ok(guard) => Some(guard),
            Err(poisoned) => {
                warn!(
                    error = %crate::error::EngineError::Cache("lock poisoned".into()),
                    "result cache degraded to miss"
                );
                drop(poisoned);
                None
            }
        }
    }

    /// Prefer evicting an expired entry; otherwise the oldest insertion.
    fn evict_oldest(inner: &mut CacheInner, now: Instant) -> bool {
        let expired = inner
            .entries
            .iter()
            .find(|(_, e)| e.expires_at <= now)
            .map(|(sig, _)| sig.clone());
        if let Some(sig) = expired {
            inner.entries.remove(&sig);
            return true;
        }

        while let Some((sig, generation)) = inner.order.pop_front() {
            let live = inner
                .entries
                .get(&sig)
                .map(|e| e.generation == generation)
                .unwrap_or(false);
            if live {
                inner.entries.remove(&sig);
                debug!(sig = %sig.fingerprint(), "cache evicted oldest entry");
                return true;
            }
        }
        false
    }

    fn compact_order(inner: &mut CacheInner) {
        let CacheInner { entries, order, .. } = inner;
        order.retain(|(sig, generation)| {
            entries
                .get(sig)
                .map(|e| e.generation == *generation)
                .unwrap_or(false)
        });
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TTL, Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use serde_json::{json, Map, Value};
    use std::sync::Arc;

    fn sig(symbol: &str) -> ToolCallSignature {
        let mut args = Map::new();
        args.insert("symbol".into(), Value::String(symbol.into()));
        ToolCallSignature::new("get_stock_price", &args)
    }

    fn ok(symbol: &str) -> ToolResult {
        ToolResult::success(sig(symbol), json!({"symbol": symbol, "price": 150.5}))
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_then_expiry() {
        let cache = ResultCache::new(Duration::from_secs(60), 10);
        cache.put(sig("AAPL"), ok("AAPL"));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get(&sig("AAPL")).is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(&sig("AAPL")).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_failures_not_cached() {
        let cache = ResultCache::default();
        cache.put(
            sig("ZZZZ"),
            ToolResult::failure(sig("ZZZZ"), ToolError::Execution("unknown symbol".into())),
        );
        assert!(cache.get(&sig("ZZZZ")).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let cache = ResultCache::new(Duration::from_secs(60), 2);
        cache.put(sig("AAPL"), ok("AAPL"));
        cache.put(sig("MSFT"), ok("MSFT"));
        cache.put(sig("NVDA"), ok("NVDA"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&sig("AAPL")).is_none());
        assert!(cache.get(&sig("MSFT")).is_some());
        assert!(cache.get(&sig("NVDA")).is_some());
    }

    #[tokio::test]
    async fn test_overwrite_refreshes_position() {
        let cache = ResultCache::new(Duration::from_secs(60), 2);
        cache.put(sig("AAPL"), ok("AAPL"));
        cache.put(sig("MSFT"), ok("MSFT"));
        cache.put(sig("AAPL"), ok("AAPL"));
        cache.put(sig("NVDA"), ok("NVDA"));

        // MSFT is now the oldest live insertion
        assert!(cache.get(&sig("MSFT")).is_none());
        assert!(cache.get(&sig("AAPL")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = ResultCache::new(Duration::from_secs(10), 10);
        cache.put(sig("AAPL"), ok("AAPL"));
        tokio::time::advance(Duration::from_secs(5)).await;
        cache.put(sig("MSFT"), ok("MSFT"));
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_access() {
        let cache = Arc::new(ResultCache::new(Duration::from_secs(60), 50));
        let mut handles = Vec::new();

        for t in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..100 {
                    let symbol = format!("S{}", (t * 100 + i) % 70);
                    cache.put(sig(&symbol), ok(&symbol));
                    let _ = cache.get(&sig(&symbol));
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(cache.len() <= 50);
    }
}
