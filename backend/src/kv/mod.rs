// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! C1: the slot-aware KV gateway. Groups keys by Redis Cluster hash slot so a
//! single logical invalidation (e.g. "drop these 40 cache entries") becomes
//! one pipelined call per slot instead of one round trip per key, and caps
//! how many slot-groups run concurrently.

pub mod store;

pub use store::{InMemoryKvStore, KvStore, RedisKvStore, SeqMallocOutcome};

use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::GatewaySettings;
use crate::error::KvError;

const TOTAL_SLOTS: u16 = 16_384;

/// Redis Cluster's CRC16/XMODEM hash-slot algorithm, honoring `{tag}` hash
/// tags so multi-key operations on tagged keys land on the same slot.
pub fn hash_slot(key: &str) -> u16 {
    let hash_input = match (key.find('{'), key.find('}')) {
        (Some(open), Some(close)) if close > open + 1 => &key[open + 1..close],
        _ => key,
    };
    crc16_xmodem(hash_input.as_bytes()) % TOTAL_SLOTS
}

fn crc16_xmodem(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Wraps a [`KvStore`] with slot-grouped batch invalidation and bounded
/// fan-out, per §4.1.
#[derive(Debug, Clone)]
pub struct KvGateway {
    store: Arc<dyn KvStore>,
    settings: GatewaySettings,
}

impl KvGateway {
    pub fn new(store: Arc<dyn KvStore>, settings: GatewaySettings) -> Self {
        Self { store, settings }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Deletes `keys`, grouped by hash slot and chunked to `batch_size`,
    /// running at most `worker_cap` slot-groups concurrently. When
    /// `continue_on_error` is false, the first failing group's error is
    /// returned and the rest of the in-flight groups are still awaited (their
    /// results are discarded) so the gateway never leaks outstanding work.
    pub async fn invalidate_many(&self, keys: Vec<String>) -> Result<u64, KvError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut by_slot: HashMap<u16, Vec<String>> = HashMap::new();
        for key in keys {
            by_slot.entry(hash_slot(&key)).or_default().push(key);
        }

        let mut chunks = Vec::new();
        for group in by_slot.into_values() {
            for chunk in group.chunks(self.settings.batch_size) {
                chunks.push(chunk.to_vec());
            }
        }

        let mut deleted = 0u64;
        let mut first_error = None;

        let mut chunks = chunks.into_iter();
        let mut pending = FuturesUnordered::new();
        let del_chunk = |chunk: Vec<String>| {
            let store = Arc::clone(&self.store);
            async move { store.del_many(&chunk).await }
        };
        for chunk in chunks.by_ref().take(self.settings.worker_cap) {
            pending.push(del_chunk(chunk));
        }
        let mut queue: std::collections::VecDeque<Vec<String>> = chunks.collect();

        while let Some(result) = pending.next().await {
            match result {
                Ok(n) => deleted += n,
                Err(e) => {
                    if !self.settings.continue_on_error && first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
            if let Some(chunk) = queue.pop_front() {
                pending.push(del_chunk(chunk));
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(deleted),
        }
    }

    /// Publishes the same invalidation payload once per distinct topic,
    /// fire-and-forget (publish failures are logged, not propagated: a
    /// missed cache-invalidation notification degrades to a slightly stale
    /// peer cache, not a correctness failure for the publisher).
    pub async fn broadcast_invalidation(&self, channel: &str, payload: &[u8]) {
        if let Err(error) = self.store.publish(channel, payload).await {
            tracing::warn!(%channel, %error, "cache invalidation broadcast failed");
        }
    }
}
