// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! C9: the notification emitter. Builds typed event envelopes, attaches the
//! version the triggering write produced (pulled from the request-scoped
//! [`PendingVersions`] bag), and hands them to a [`MessageProducer`] (§4.6,
//! §4.7, §4.8 "Emit ..." clauses).

use imcommon::ids::{ConversationId, GroupId, UserId};
use serde::Serialize;

use crate::error::CoreResult;
use crate::ports::{MessageProducer, Topic};
use crate::version_log::PendingVersions;

/// The event kinds emitted by the friend and group FSMs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    FriendApplicationAdd { from: UserId, to: UserId, version: u64 },
    FriendApplicationRefused { from: UserId, to: UserId, version: u64 },
    FriendApplicationApproved { from: UserId, to: UserId, version: u64 },
    FriendDeleted { owner: UserId, peer: UserId, version: u64 },
    GroupCreated { group_id: GroupId, owner: UserId, version: u64 },
    GroupDismissed { group_id: GroupId, version: u64 },
    GroupMemberChanged { group_id: GroupId, user_id: UserId, version: u64 },
    GroupJoinRequestHandled { group_id: GroupId, user_id: UserId, accepted: bool },
    NewMessage { conversation_id: ConversationId, last_seq: i64 },
}

/// Emits `event` on the persistence-adjacent push topic, partitioned by
/// `partition_key` (the spec leaves the exact partitioning scheme to the
/// caller's configuration; the owning user id is the natural default).
pub async fn emit(
    producer: &dyn MessageProducer,
    partition_key: &str,
    event: &Event,
) -> CoreResult<()> {
    producer
        .produce(Topic::ToPush, partition_key, event)
        .await
        .map_err(|e| crate::error::CoreError::Internal(Box::new(e)))
}

/// Convenience for handlers that just appended a version-log entry: reads
/// the version back out of the pending bag so the emitted event reports the
/// version the client should expect to see once it resyncs (§4.3, §4.9).
pub fn version_of(pending: &PendingVersions, table: &str, did: &str) -> u64 {
    pending.get(table, did).unwrap_or(0)
}
