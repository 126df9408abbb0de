// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Typed ports (C10) towards collaborators that are out of scope for this
//! crate: per-field profile CRUD, outbound webhooks, push delivery and the
//! message queue producers. Callers inject concrete adapters; the core only
//! depends on these traits.

use async_trait::async_trait;
use imcommon::ids::UserId;
use std::fmt::Debug;

/// Minimal profile facts the core needs to validate preconditions (existence
/// checks for `ApplyToAddFriend`, `CreateGroup`, ...).
#[derive(Debug, Clone)]
pub struct ProfileSummary {
    pub user_id: UserId,
    pub nickname: String,
    pub face_url: String,
}

#[async_trait]
pub trait ProfilePort: Send + Sync + 'static {
    async fn exists(&self, user_id: UserId) -> bool;
    async fn get(&self, user_id: UserId) -> Option<ProfileSummary>;
    async fn get_many(&self, user_ids: &[UserId]) -> Vec<ProfileSummary>;
}

/// Outcome of a "before" webhook invocation (§7 `CallbackAbort`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookVerdict {
    Continue,
    Abort,
}

#[async_trait]
pub trait WebhookPort: Send + Sync + 'static {
    /// Dispatches a named event with a JSON payload and returns whether the
    /// caller should continue. Errors are treated as `Continue` by callers
    /// (a webhook outage must not block the business operation).
    async fn dispatch(&self, event: &str, payload: serde_json::Value) -> WebhookVerdict;
}

/// The durable, partitioned message-queue topics the transfer pipeline (C6)
/// and the notification emitter (C9) produce to (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Partitioned by conversation id; consumed by `BatchInsertChat2DB`.
    ToPersistence,
    /// Partitioned by a configurable key; fans out to online recipients.
    ToPush,
    /// Partitioned by a configurable key; fans out to offline push delivery.
    ToOfflinePush,
}

#[async_trait]
pub trait MessageProducer: Send + Sync + 'static {
    /// Produces a JSON-serializable envelope to `topic`, partitioned by
    /// `partition_key`. At-least-once delivery; ordering is only guaranteed
    /// within a partition key.
    async fn produce(
        &self,
        topic: Topic,
        partition_key: &str,
        envelope: &(dyn erased_envelope::ErasedEnvelope + Sync),
    ) -> Result<(), ProduceError>;
}

#[derive(Debug, thiserror::Error)]
#[error("failed to produce message: {0}")]
pub struct ProduceError(#[from] pub Box<dyn std::error::Error + Send + Sync>);

/// Object-safety helper so `MessageProducer::produce` can take any
/// `Serialize` envelope without making the trait generic.
pub mod erased_envelope {
    use serde::Serialize;

    pub trait ErasedEnvelope {
        fn to_json(&self) -> serde_json::Result<serde_json::Value>;
    }

    impl<T: Serialize> ErasedEnvelope for T {
        fn to_json(&self) -> serde_json::Result<serde_json::Value> {
            serde_json::to_value(self)
        }
    }
}

/// A producer that drops everything and never fails; used in tests and to
/// document the port surface.
#[derive(Debug, Default)]
pub struct NullProducer;

#[async_trait]
impl MessageProducer for NullProducer {
    async fn produce(
        &self,
        _topic: Topic,
        _partition_key: &str,
        _envelope: &(dyn erased_envelope::ErasedEnvelope + Sync),
    ) -> Result<(), ProduceError> {
        Ok(())
    }
}

/// A producer that records every envelope in memory, for assertions in
/// tests.
#[derive(Debug, Default)]
pub struct RecordingProducer {
    pub sent: std::sync::Mutex<Vec<(Topic, String, serde_json::Value)>>,
}

#[async_trait]
impl MessageProducer for RecordingProducer {
    async fn produce(
        &self,
        topic: Topic,
        partition_key: &str,
        envelope: &(dyn erased_envelope::ErasedEnvelope + Sync),
    ) -> Result<(), ProduceError> {
        let json = envelope
            .to_json()
            .map_err(|e| ProduceError(Box::new(e)))?;
        self.sent
            .lock()
            .expect("poisoned")
            .push((topic, partition_key.to_string(), json));
        Ok(())
    }
}
