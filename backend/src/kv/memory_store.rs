// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! An in-process [`KvStore`] backed by a locked hash map, standing in for
//! Redis in tests so the allocator's state machine (§4.5) can be exercised
//! without a live cluster.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::KvError;

use super::store::{KvStore, SeqMallocOutcome};

struct Entry<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Entry<T> {
    fn fresh(value: T, ttl_ms: i64) -> Self {
        Self {
            value,
            expires_at: (ttl_ms > 0).then(|| Instant::now() + Duration::from_millis(ttl_ms as u64)),
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at.map(|at| Instant::now() < at).unwrap_or(true)
    }
}

#[derive(Default)]
struct SeqHash {
    lock: Option<i64>,
    curr: i64,
    last: i64,
}

#[derive(Default)]
struct State {
    plain: HashMap<String, Entry<Vec<u8>>>,
    locks: HashMap<String, Entry<i64>>,
    seq_hashes: HashMap<String, Entry<SeqHash>>,
}

/// In-memory stand-in for the Redis-cluster KV store. Single-process only;
/// publish is a no-op since there are no peer caches to notify.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    state: Mutex<State>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut state = self.state.lock().expect("poisoned");
        Ok(state.plain.get(key).filter(|e| e.is_live()).map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl_ms: i64) -> Result<(), KvError> {
        let mut state = self.state.lock().expect("poisoned");
        state.plain.insert(key.to_string(), Entry::fresh(value, ttl_ms));
        Ok(())
    }

    async fn del_many(&self, keys: &[String]) -> Result<u64, KvError> {
        let mut state = self.state.lock().expect("poisoned");
        let mut removed = 0;
        for key in keys {
            if state.plain.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn publish(&self, _channel: &str, _payload: &[u8]) -> Result<(), KvError> {
        Ok(())
    }

    async fn try_lock(&self, key: &str, ttl_ms: i64) -> Result<Option<i64>, KvError> {
        let mut state = self.state.lock().expect("poisoned");
        if state.locks.get(key).map(Entry::is_live).unwrap_or(false) {
            return Ok(None);
        }
        let nonce = rand::random::<u32>() as i64 + 1;
        state.locks.insert(key.to_string(), Entry::fresh(nonce, ttl_ms));
        Ok(Some(nonce))
    }

    async fn unlock(&self, key: &str, lock_value: i64) -> Result<(), KvError> {
        let mut state = self.state.lock().expect("poisoned");
        if let Some(entry) = state.locks.get(key) {
            if entry.value == lock_value {
                state.locks.remove(key);
            }
        }
        Ok(())
    }

    async fn seq_malloc(
        &self,
        key: &str,
        size: i64,
        lock_ttl_ms: i64,
        data_ttl_ms: i64,
    ) -> Result<SeqMallocOutcome, KvError> {
        let mut state = self.state.lock().expect("poisoned");
        let now_ms = chrono::Utc::now().timestamp_millis();

        let absent = !state.seq_hashes.get(key).map(Entry::is_live).unwrap_or(false);
        if absent {
            let lock_value = rand::random::<u32>() as i64 + 1;
            state.seq_hashes.insert(
                key.to_string(),
                Entry::fresh(
                    SeqHash {
                        lock: Some(lock_value),
                        curr: 0,
                        last: 0,
                    },
                    lock_ttl_ms,
                ),
            );
            return Ok(SeqMallocOutcome::NeedsRefill { lock_value, time_ms: now_ms });
        }

        let entry = state.seq_hashes.get_mut(key).expect("checked live above");
        if entry.value.lock.is_some() {
            return Ok(SeqMallocOutcome::Busy);
        }

        let curr = entry.value.curr;
        let last = entry.value.last;

        if size == 0 {
            return Ok(SeqMallocOutcome::Success { curr, last, time_ms: now_ms });
        }

        if curr + size <= last {
            entry.value.curr = curr + size;
            entry.expires_at = (data_ttl_ms > 0)
                .then(|| Instant::now() + Duration::from_millis(data_ttl_ms as u64));
            return Ok(SeqMallocOutcome::Success { curr, last, time_ms: now_ms });
        }

        let lock_value = rand::random::<u32>() as i64 + 1;
        entry.value.lock = Some(lock_value);
        entry.value.curr = last;
        entry.expires_at =
            (lock_ttl_ms > 0).then(|| Instant::now() + Duration::from_millis(lock_ttl_ms as u64));
        Ok(SeqMallocOutcome::NeedsRefillExceeded {
            curr,
            last,
            lock_value,
            time_ms: now_ms,
        })
    }

    async fn seq_commit(
        &self,
        key: &str,
        lock_value: i64,
        curr: i64,
        last: i64,
        data_ttl_ms: i64,
    ) -> Result<bool, KvError> {
        let mut state = self.state.lock().expect("poisoned");
        let Some(entry) = state.seq_hashes.get_mut(key) else {
            return Ok(false);
        };
        if entry.value.lock != Some(lock_value) {
            return Ok(false);
        }
        entry.value.curr = curr;
        entry.value.last = last;
        entry.value.lock = None;
        entry.expires_at =
            (data_ttl_ms > 0).then(|| Instant::now() + Duration::from_millis(data_ttl_ms as u64));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_malloc_on_absent_key_requests_refill() {
        let store = InMemoryKvStore::new();
        let outcome = store.seq_malloc("conv:1", 50, 3_000, 1_000).await.unwrap();
        assert!(matches!(outcome, SeqMallocOutcome::NeedsRefill { .. }));
    }

    #[tokio::test]
    async fn malloc_after_commit_serves_from_window() {
        let store = InMemoryKvStore::new();
        let SeqMallocOutcome::NeedsRefill { lock_value, .. } =
            store.seq_malloc("conv:1", 50, 3_000, 1_000).await.unwrap()
        else {
            panic!("expected NeedsRefill");
        };
        let committed = store
            .seq_commit("conv:1", lock_value, 0, 50, 1_000)
            .await
            .unwrap();
        assert!(committed);

        let outcome = store.seq_malloc("conv:1", 10, 3_000, 1_000).await.unwrap();
        assert_eq!(
            outcome,
            SeqMallocOutcome::Success { curr: 0, last: 50, time_ms: outcome_time(outcome) }
        );
    }

    #[tokio::test]
    async fn malloc_while_locked_reports_busy() {
        let store = InMemoryKvStore::new();
        store.seq_malloc("conv:1", 50, 3_000, 1_000).await.unwrap();
        let outcome = store.seq_malloc("conv:1", 10, 3_000, 1_000).await.unwrap();
        assert_eq!(outcome, SeqMallocOutcome::Busy);
    }

    #[tokio::test]
    async fn exhausted_window_requests_refill_with_old_curr() {
        let store = InMemoryKvStore::new();
        let SeqMallocOutcome::NeedsRefill { lock_value, .. } =
            store.seq_malloc("conv:1", 50, 3_000, 1_000).await.unwrap()
        else {
            panic!("expected NeedsRefill");
        };
        store.seq_commit("conv:1", lock_value, 45, 50, 1_000).await.unwrap();

        let outcome = store.seq_malloc("conv:1", 10, 3_000, 1_000).await.unwrap();
        match outcome {
            SeqMallocOutcome::NeedsRefillExceeded { curr, last, .. } => {
                assert_eq!(curr, 45);
                assert_eq!(last, 50);
            }
            other => panic!("expected NeedsRefillExceeded, got {other:?}"),
        }
    }

    fn outcome_time(outcome: SeqMallocOutcome) -> i64 {
        match outcome {
            SeqMallocOutcome::Success { time_ms, .. } => time_ms,
            _ => 0,
        }
    }
}
