// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! C4: a chainable cache-invalidation builder. Handlers that touch several
//! entity kinds in one request (e.g. `DeleteGroupMember` invalidates the
//! member's profile cache, the group's member-list cache, and the group's
//! version-log cache) accumulate keys across the handler body and delete
//! them all in one gateway call at the end, instead of invalidating
//! piecemeal as each sub-step runs (§4.4).

use crate::cache::Cache;
use crate::error::KvError;
use imcommon::ids::{ConversationId, GroupId, UserId};

/// Accumulates cache keys to invalidate, grouped loosely by entity kind for
/// readability at call sites; the gateway re-groups them by hash slot
/// regardless (C1).
#[derive(Debug, Default, Clone)]
pub struct CacheChain {
    keys: Vec<String>,
}

impl CacheChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, key: String) -> Self {
        self.keys.push(key);
        self
    }

    pub fn del_user(self, user_id: UserId) -> Self {
        self.push(format!("user:{{{user_id}}}"))
    }

    pub fn del_friend(self, owner: UserId, friend: UserId) -> Self {
        self.push(format!("friend:{{{owner}}}:{friend}"))
    }

    pub fn del_friend_ids(self, owner: UserId) -> Self {
        self.push(format!("friend_ids:{{{owner}}}"))
    }

    pub fn del_black_ids(self, owner: UserId) -> Self {
        self.push(format!("black_ids:{{{owner}}}"))
    }

    pub fn del_group(self, group_id: GroupId) -> Self {
        self.push(format!("group:{{{group_id}}}"))
    }

    pub fn del_group_member(self, group_id: GroupId, user_id: UserId) -> Self {
        self.push(format!("group_member:{{{group_id}}}:{user_id}"))
    }

    pub fn del_group_member_ids(self, group_id: GroupId) -> Self {
        self.push(format!("group_member_ids:{{{group_id}}}"))
    }

    pub fn del_joined_group_ids(self, user_id: UserId) -> Self {
        self.push(format!("joined_group_ids:{{{user_id}}}"))
    }

    pub fn del_conversation(self, conversation_id: ConversationId) -> Self {
        self.push(format!("conversation:{{{conversation_id}}}"))
    }

    pub fn del_seq_conversation(self, conversation_id: ConversationId) -> Self {
        self.push(format!("seq_conversation:{{{conversation_id}}}"))
    }

    pub fn del_raw(self, key: impl Into<String>) -> Self {
        self.push(key.into())
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Executes the accumulated deletions and reports how many keys were
    /// actually present, consuming the chain.
    pub async fn chain_exec_del(self, cache: &Cache) -> Result<u64, KvError> {
        cache.tag_as_deleted_batch(self.keys).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_accumulates_keys_across_calls() {
        let chain = CacheChain::new()
            .del_user(UserId(uuid::Uuid::nil()))
            .del_group(GroupId(uuid::Uuid::nil()))
            .del_raw("custom:key");
        assert_eq!(chain.len(), 3);
        assert!(!chain.is_empty());
    }
}
