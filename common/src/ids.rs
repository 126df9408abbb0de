// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Identifiers for the entities of the data model (§3).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl sqlx::Type<sqlx::Postgres> for $name {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <Uuid as sqlx::Type<sqlx::Postgres>>::type_info()
            }
        }

        impl sqlx::Encode<'_, sqlx::Postgres> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <Uuid as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&self.0, buf)
            }
        }

        impl sqlx::Decode<'_, sqlx::Postgres> for $name {
            fn decode(
                value: sqlx::postgres::PgValueRef<'_>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                Ok(Self(<Uuid as sqlx::Decode<sqlx::Postgres>>::decode(value)?))
            }
        }
    };
}

uuid_id!(UserId);
uuid_id!(GroupId);
uuid_id!(ConversationId);

/// Which kind of peer a conversation fans out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    /// One-to-one chat between two users.
    Single,
    /// Chat scoped to a group's membership.
    Group,
    /// Server-originated notifications to a single user.
    Notification,
}

impl ConversationType {
    fn tag(self) -> u8 {
        match self {
            ConversationType::Single => 1,
            ConversationType::Group => 2,
            ConversationType::Notification => 3,
        }
    }
}

/// Deterministically derives a conversation id so that both participants of a
/// single chat (and every member of a group) converge on the same id.
///
/// For [`ConversationType::Single`], `key` must be built from
/// [`single_chat_key`] so that the two possible orderings of the pair of user
/// ids hash to the same value. For [`ConversationType::Group`] and
/// [`ConversationType::Notification`], `key` is the group id or user id
/// respectively.
pub fn derive_conversation_id(conversation_type: ConversationType, key: &str) -> ConversationId {
    let mut hasher = Sha256::new();
    hasher.update([conversation_type.tag()]);
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    ConversationId(Uuid::from_bytes(bytes))
}

/// Builds the symmetric key used to derive a single-chat conversation id: the
/// two user ids in lexicographic order, so that `single_chat_key(a, b) ==
/// single_chat_key(b, a)`.
pub fn single_chat_key(a: &UserId, b: &UserId) -> String {
    let (lo, hi) = if a.0 <= b.0 { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chat_id_is_symmetric() {
        let a = UserId::new();
        let b = UserId::new();
        let id_ab = derive_conversation_id(ConversationType::Single, &single_chat_key(&a, &b));
        let id_ba = derive_conversation_id(ConversationType::Single, &single_chat_key(&b, &a));
        assert_eq!(id_ab, id_ba);
    }

    #[test]
    fn group_chat_id_is_deterministic() {
        let group = GroupId::new();
        let id1 = derive_conversation_id(ConversationType::Group, &group.to_string());
        let id2 = derive_conversation_id(ConversationType::Group, &group.to_string());
        assert_eq!(id1, id2);
    }

    #[test]
    fn distinct_conversations_get_distinct_ids() {
        let a = UserId::new();
        let b = UserId::new();
        let c = UserId::new();
        let id_ab = derive_conversation_id(ConversationType::Single, &single_chat_key(&a, &b));
        let id_ac = derive_conversation_id(ConversationType::Single, &single_chat_key(&a, &c));
        assert_ne!(id_ab, id_ac);
    }
}
