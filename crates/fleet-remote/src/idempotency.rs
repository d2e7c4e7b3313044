//! Request de-duplication cache: bounded FIFO of completed responses plus
//! an in-flight map to coalesce concurrent retries of the same
//! `request_id`. Guarded by a single mutex — the critical sections here
//! are small map operations, never I/O.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Notify};

const CACHE_MAX: usize = 2000;

/// Stable hash of a request payload: keys sorted, no insignificant
/// whitespace, matching the remote's own canonicalization so retries with
/// identical content always hash identically.
pub fn payload_hash(value: &Value) -> String {
    let canonical = fleet_proto::canonical_payload_json(value);
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

struct CachedEntry {
    hash: String,
    response: Value,
}

enum Slot {
    InFlight(Arc<Notify>),
    Done(Arc<CachedEntry>),
}

/// What the caller should do with a request carrying a `request_id`.
pub enum Lookup {
    /// No prior record; caller must execute and then call [`IdempotencyCache::complete`].
    Fresh,
    /// A completed response with a matching payload hash already exists.
    Cached(Value),
    /// The same `request_id` was used with a different payload.
    Conflict,
    /// Another task is currently executing this request; wait on the
    /// returned notifier and look up again.
    InFlight(Arc<Notify>),
}

#[derive(Default)]
pub struct IdempotencyCache {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    order: VecDeque<String>,
}

impl IdempotencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up `request_id` against `payload_hash`, registering an
    /// in-flight marker when nothing exists yet (the caller is now
    /// responsible for calling [`Self::complete`]).
    pub async fn begin(&self, request_id: &str, hash: &str) -> Lookup {
        let mut inner = self.inner.lock().await;
        match inner.slots.get(request_id) {
            Some(Slot::Done(entry)) => {
                if entry.hash == hash {
                    Lookup::Cached(entry.response.clone())
                } else {
                    Lookup::Conflict
                }
            }
            Some(Slot::InFlight(notify)) => Lookup::InFlight(notify.clone()),
            None => {
                inner
                    .slots
                    .insert(request_id.to_string(), Slot::InFlight(Arc::new(Notify::new())));
                Lookup::Fresh
            }
        }
    }

    /// Records the outcome of executing `request_id` (success or error —
    /// both are cached so replays return the same answer) and wakes any
    /// tasks waiting on the in-flight notifier.
    pub async fn complete(&self, request_id: &str, hash: String, response: Value) {
        let mut inner = self.inner.lock().await;
        let notify = match inner.slots.remove(request_id) {
            Some(Slot::InFlight(notify)) => Some(notify),
            _ => None,
        };
        inner.slots.insert(
            request_id.to_string(),
            Slot::Done(Arc::new(CachedEntry { hash, response })),
        );
        inner.order.push_back(request_id.to_string());
        while inner.order.len() > CACHE_MAX {
            if let Some(oldest) = inner.order.pop_front() {
                inner.slots.remove(&oldest);
            }
        }
        drop(inner);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }

    /// The cached response for `request_id`, if a completed entry exists.
    pub async fn get_completed(&self, request_id: &str) -> Option<Value> {
        let inner = self.inner.lock().await;
        match inner.slots.get(request_id) {
            Some(Slot::Done(entry)) => Some(entry.response.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fresh_request_id_executes_once() {
        let cache = IdempotencyCache::new();
        let hash = payload_hash(&json!({"type": "exec", "command": "echo A"}));

        match cache.begin("r1", &hash).await {
            Lookup::Fresh => {}
            _ => panic!("expected Fresh"),
        }
        cache
            .complete("r1", hash.clone(), json!({"type": "result", "success": true}))
            .await;

        match cache.begin("r1", &hash).await {
            Lookup::Cached(resp) => assert_eq!(resp["success"], json!(true)),
            _ => panic!("expected Cached on replay"),
        }
    }

    #[tokio::test]
    async fn same_id_different_payload_is_conflict() {
        let cache = IdempotencyCache::new();
        let hash_a = payload_hash(&json!({"command": "echo A"}));
        let hash_b = payload_hash(&json!({"command": "echo B"}));

        assert!(matches!(cache.begin("rid-2", &hash_a).await, Lookup::Fresh));
        cache
            .complete("rid-2", hash_a, json!({"output": "A"}))
            .await;

        match cache.begin("rid-2", &hash_b).await {
            Lookup::Conflict => {}
            _ => panic!("expected Conflict for differing payload"),
        }
    }

    #[tokio::test]
    async fn concurrent_request_is_in_flight_until_complete() {
        let cache = Arc::new(IdempotencyCache::new());
        let hash = payload_hash(&json!({"command": "sleep"}));

        assert!(matches!(cache.begin("r3", &hash).await, Lookup::Fresh));
        let notify = match cache.begin("r3", &hash).await {
            Lookup::InFlight(n) => n,
            _ => panic!("expected InFlight for concurrent retry"),
        };

        let cache2 = cache.clone();
        let hash2 = hash.clone();
        let waiter = tokio::spawn(async move {
            notify.notified().await;
            cache2.get_completed("r3").await
        });

        cache.complete("r3", hash, json!({"output": "done"})).await;
        let result = waiter.await.unwrap();
        assert_eq!(result.unwrap()["output"], json!("done"));
    }

    #[tokio::test]
    async fn eviction_is_fifo_bounded() {
        let cache = IdempotencyCache::new();
        for i in 0..(CACHE_MAX + 10) {
            let id = format!("r{i}");
            let hash = payload_hash(&json!({"i": i}));
            assert!(matches!(cache.begin(&id, &hash).await, Lookup::Fresh));
            cache.complete(&id, hash, json!({"i": i})).await;
        }
        assert!(cache.get_completed("r0").await.is_none());
        assert!(cache
            .get_completed(&format!("r{}", CACHE_MAX + 9))
            .await
            .is_some());
    }
}
