// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The data model entities of §3, independent of how they are persisted.

use imcommon::ids::{ConversationId, ConversationType, GroupId, UserId};
use imcommon::time::TimeStamp;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: UserId,
    pub nickname: String,
    pub face_url: String,
    pub manager_level: i32,
    pub recv_msg_opt: i32,
    pub create_time: TimeStamp,
    pub ex: String,
}

/// A directional friendship edge: `owner -> friend`. The reciprocal relation
/// is a distinct row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Friend {
    pub owner_user_id: UserId,
    pub friend_user_id: UserId,
    pub remark: String,
    pub is_pinned: bool,
    pub add_source: AddSource,
    pub operator_user_id: UserId,
    pub create_time: TimeStamp,
    pub ex: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddSource {
    /// Created through `ApplyToAddFriend` / `RespondFriendApply`.
    BecomeFriendByApply,
    /// Created through `ImportFriends`.
    Import,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i8)]
pub enum HandleResult {
    Pending = 0,
    Accepted = 1,
    Refused = -1,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRequest {
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub req_msg: String,
    pub handle_result: HandleResult,
    pub handle_msg: String,
    pub handler_user_id: Option<UserId>,
    pub create_time: TimeStamp,
    pub handle_time: Option<TimeStamp>,
    pub ex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Black {
    pub owner_user_id: UserId,
    pub block_user_id: UserId,
    pub create_time: TimeStamp,
    pub add_source: AddSource,
    pub operator_user_id: UserId,
    pub ex: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Ok,
    Muted,
    Dismissed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub group_id: GroupId,
    pub status: GroupStatus,
    pub name: String,
    pub face_url: String,
    pub owner_user_id: UserId,
    pub create_time: TimeStamp,
    pub ex: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i32)]
pub enum RoleLevel {
    Ordinary = 20,
    Admin = 60,
    Owner = 100,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub role_level: RoleLevel,
    pub nickname: String,
    pub face_url: String,
    pub join_source: String,
    pub operator_user_id: UserId,
    pub mute_end_time: Option<TimeStamp>,
    pub ex: String,
    pub create_time: TimeStamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRequest {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub req_msg: String,
    pub handle_result: HandleResult,
    pub handle_msg: String,
    pub handle_user_id: Option<UserId>,
    pub req_time: TimeStamp,
    pub handle_time: Option<TimeStamp>,
    pub ex: String,
    pub join_source: String,
    pub inviter_user_id: Option<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: ConversationId,
    pub conversation_type: ConversationType,
    pub owner_user_id: UserId,
    /// The peer user id (single chat) or group id (group chat), as a string
    /// so both cases share a column.
    pub peer_or_group: String,
    pub recv_msg_opt: i32,
    pub is_pinned: bool,
    pub is_private_chat: bool,
    pub min_seq: i64,
    pub max_seq: i64,
    pub ex: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SeqConversation {
    pub conversation_id: ConversationId,
    pub min_seq: i64,
    pub max_seq: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgStatus {
    Sending,
    Success,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgInfo {
    pub client_msg_id: String,
    pub server_msg_id: String,
    pub seq: i64,
    pub send_id: UserId,
    pub recv_id: Option<UserId>,
    pub group_id: Option<GroupId>,
    pub content_type: i32,
    pub content: Vec<u8>,
    pub send_time: TimeStamp,
    pub create_time: TimeStamp,
    pub status: MsgStatus,
    pub options: serde_json::Value,
    pub offline_push: bool,
    pub at_user_id_list: Vec<UserId>,
    pub attached_info: String,
    pub ex: String,
}

impl MsgInfo {
    /// An empty slot, used to pre-fill a freshly-created [`MsgDoc`].
    pub fn empty_slot() -> Self {
        Self {
            client_msg_id: String::new(),
            server_msg_id: String::new(),
            seq: 0,
            send_id: UserId(uuid::Uuid::nil()),
            recv_id: None,
            group_id: None,
            content_type: 0,
            content: Vec::new(),
            send_time: TimeStamp::now(),
            create_time: TimeStamp::now(),
            status: MsgStatus::Sending,
            options: serde_json::Value::Null,
            offline_push: false,
            at_user_id_list: Vec::new(),
            attached_info: String::new(),
            ex: String::new(),
        }
    }

    pub fn is_empty_slot(&self) -> bool {
        self.seq == 0
    }
}

/// Groups a contiguous `seq` range of fixed length `N` into one document.
/// `docID = fn(conversationID, seq)`, `index = seq mod N`: a total, injective
/// mapping for a given conversation (invariant, §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgDoc {
    pub doc_id: String,
    pub conversation_id: ConversationId,
    pub shard_index: i64,
    pub msgs: Vec<MsgInfo>,
}

impl MsgDoc {
    /// `docID` for the document holding `seq` in `conversation_id`, using a
    /// shard of size `shard_size` (N, typically 100).
    pub fn doc_id(conversation_id: ConversationId, seq: i64, shard_size: i64) -> String {
        let shard_index = (seq - 1).div_euclid(shard_size);
        format!("{conversation_id}:{shard_index}")
    }

    /// The index within a doc's `msgs` Vec that `seq` maps to, 0-based.
    pub fn slot_index(seq: i64, shard_size: i64) -> usize {
        ((seq - 1).rem_euclid(shard_size)) as usize
    }

    pub fn shard_index_of(seq: i64, shard_size: i64) -> i64 {
        (seq - 1).div_euclid(shard_size)
    }

    pub fn empty(conversation_id: ConversationId, shard_index: i64, shard_size: i64) -> Self {
        Self {
            doc_id: format!("{conversation_id}:{shard_index}"),
            conversation_id,
            shard_index,
            msgs: (0..shard_size).map(|_| MsgInfo::empty_slot()).collect(),
        }
    }
}

/// State of an element within a [`VersionLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionState {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionLogElem {
    pub eid: String,
    pub state: VersionState,
    pub version: u64,
    pub last_update: TimeStamp,
}

/// An append-only, per-domain change log (§3, §4.3). `did` is the owner user
/// id for friend logs, the group id for member logs, or the user id for
/// join-group logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionLog {
    pub did: String,
    pub version: u64,
    pub deleted: u64,
    pub last_update: TimeStamp,
    pub logs: Vec<VersionLogElem>,
}

impl VersionLog {
    pub fn new(did: impl Into<String>) -> Self {
        Self {
            did: did.into(),
            version: 0,
            deleted: 0,
            last_update: TimeStamp::now(),
            logs: Vec::new(),
        }
    }
}
