// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The [`KvStore`] trait abstracts the handful of Redis primitives the core
//! needs: plain GET/SET/DEL, pub/sub publish, a best-effort lock, and the
//! atomic hash script the sequence allocator (§4.5) runs against a single
//! conversation's reservation hash. A Redis-backed and an in-memory
//! implementation are provided; tests run against the latter so the
//! allocator's invariants can be checked without a live cluster.

use async_trait::async_trait;
use std::fmt::Debug;

use crate::error::KvError;

/// Outcome of the atomic `Malloc` hash script (§4.5), one variant per state
/// 0-3 in the spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqMallocOutcome {
    /// state=0: served directly from the reservation window.
    Success { curr: i64, last: i64, time_ms: i64 },
    /// state=1: key was absent; caller must refill from the backing store.
    NeedsRefill { lock_value: i64, time_ms: i64 },
    /// state=2: another process is refilling; caller should retry.
    Busy,
    /// state=3: the reservation window is exhausted; caller must refill.
    NeedsRefillExceeded {
        curr: i64,
        last: i64,
        lock_value: i64,
        time_ms: i64,
    },
}

#[async_trait]
pub trait KvStore: Send + Sync + Debug + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl_ms: i64) -> Result<(), KvError>;

    /// Deletes all of `keys`, returning how many existed.
    async fn del_many(&self, keys: &[String]) -> Result<u64, KvError>;

    /// Publishes a JSON payload on `channel` for peer in-process caches to
    /// consume (§4.1).
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), KvError>;

    /// Best-effort lock: sets `key` to a random nonce with `NX EX ttl_ms`,
    /// returning the nonce on success.
    async fn try_lock(&self, key: &str, ttl_ms: i64) -> Result<Option<i64>, KvError>;

    /// Releases a lock previously taken with [`KvStore::try_lock`], only if
    /// it is still held under `lock_value`.
    async fn unlock(&self, key: &str, lock_value: i64) -> Result<(), KvError>;

    /// Runs the atomic reservation-hash script described in §4.5 against the
    /// per-conversation hash at `key`. `size == 0` is the `GetMaxSeq` variant:
    /// it never mutates the hash.
    async fn seq_malloc(
        &self,
        key: &str,
        size: i64,
        lock_ttl_ms: i64,
        data_ttl_ms: i64,
    ) -> Result<SeqMallocOutcome, KvError>;

    /// Publishes the result of a successful refill back into the hash and
    /// releases the lock, but only if `lock_value` still matches (compare-
    /// and-set under the held nonce).
    async fn seq_commit(
        &self,
        key: &str,
        lock_value: i64,
        curr: i64,
        last: i64,
        data_ttl_ms: i64,
    ) -> Result<bool, KvError>;
}

pub mod redis_store;
pub mod memory_store;

pub use memory_store::InMemoryKvStore;
pub use redis_store::RedisKvStore;
