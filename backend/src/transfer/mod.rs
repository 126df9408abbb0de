// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! C6: the message transfer pipeline. Allocates a seq range via C5, writes
//! each message into the strong-consistency cache, and returns the envelope
//! the caller fans out to the persistence and push topics (§4.6). The
//! downstream persistence consumer's chunked insert (`BatchInsertChat2DB`)
//! also lives here since it shares the doc sharding arithmetic with the rest
//! of this module.

use async_trait::async_trait;
use imcommon::codec;
use imcommon::ids::{ConversationId, UserId};
use sqlx::PgPool;
use std::collections::HashMap;

use crate::cache::Cache;
use crate::error::{CoreError, CoreResult, KvError};
use crate::model::{MsgDoc, MsgInfo, MsgStatus};
use crate::seq::{SeqConversationStore, SequenceAllocator};

/// Outcome of [`transfer_batch`]: what the caller publishes onward to the
/// persistence and push topics (§4.6 step 5).
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub conversation_id: ConversationId,
    pub last_seq: i64,
    pub is_new: bool,
    pub read_by_sender: HashMap<UserId, i64>,
    pub messages: Vec<MsgInfo>,
}

/// Allocates a seq for each of `messages` and writes them into the cache
/// (§4.6 steps 1-4). `messages` must be non-empty and no longer than
/// `shard_size` (one document's worth).
pub async fn transfer_batch<S: SeqConversationStore>(
    allocator: &SequenceAllocator<S>,
    cache: &Cache,
    conversation_id: ConversationId,
    is_group: bool,
    message_ttl_s: i64,
    shard_size: i64,
    mut messages: Vec<MsgInfo>,
) -> CoreResult<TransferResult> {
    if messages.is_empty() {
        return Err(CoreError::invalid_argument("message batch must be non-empty"));
    }
    if messages.len() as i64 > shard_size {
        return Err(CoreError::invalid_argument(format!(
            "message batch of {} exceeds the document size of {shard_size}",
            messages.len()
        )));
    }

    let allocation = allocator
        .malloc(conversation_id, messages.len() as i64, is_group)
        .await
        .map_err(CoreError::from)?;

    let mut read_by_sender = HashMap::new();
    for (i, msg) in messages.iter_mut().enumerate() {
        msg.seq = allocation.first_seq + 1 + i as i64;
        read_by_sender.insert(msg.send_id, msg.seq);
    }

    for msg in &messages {
        let cache_key = message_cache_key(conversation_id, msg.seq);
        let bytes = codec::to_vec(msg).map_err(KvError::Codec)?;
        cache
            .store()
            .set_ex(&cache_key, bytes, message_ttl_s * 1_000)
            .await
            .map_err(CoreError::from)?;
    }

    let last_seq = messages.last().map(|m| m.seq).unwrap_or(allocation.first_seq);

    Ok(TransferResult {
        conversation_id,
        last_seq,
        is_new: allocation.is_new,
        read_by_sender,
        messages,
    })
}

fn message_cache_key(conversation_id: ConversationId, seq: i64) -> String {
    format!("msg:{{{conversation_id}}}:{seq}")
}

#[derive(Debug, thiserror::Error)]
#[error("lost the doc-insert race on the first shard of this batch")]
struct ShardRaceError;

#[async_trait]
pub trait MsgDocStore: Send + Sync {
    async fn try_update_doc(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        doc_id: &str,
        patches: &[(usize, MsgInfo)],
    ) -> sqlx::Result<bool>;

    /// Inserts a brand-new doc, returning `false` instead of erroring on a
    /// duplicate-key conflict (a concurrent writer created it first).
    async fn insert_doc(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        doc: &MsgDoc,
    ) -> sqlx::Result<bool>;
}

/// The Postgres-backed [`MsgDocStore`]: each shard is one `msg_docs` row
/// whose `msgs` column holds the full `MsgInfo` array as JSON. A partial
/// update patches individual array elements with `jsonb_set`.
pub struct PgMsgDocStore;

#[async_trait]
impl MsgDocStore for PgMsgDocStore {
    async fn try_update_doc(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        doc_id: &str,
        patches: &[(usize, MsgInfo)],
    ) -> sqlx::Result<bool> {
        let exists = sqlx::query_scalar!("SELECT 1 AS one FROM msg_docs WHERE doc_id = $1", doc_id)
            .fetch_optional(&mut **tx)
            .await?
            .is_some();
        if !exists {
            return Ok(false);
        }
        for (slot, msg) in patches {
            let path = format!("{{{slot}}}");
            let value = serde_json::to_value(msg).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
            sqlx::query!(
                "UPDATE msg_docs SET msgs = jsonb_set(msgs, $2, $3) WHERE doc_id = $1",
                doc_id,
                path,
                value,
            )
            .execute(&mut **tx)
            .await?;
        }
        Ok(true)
    }

    async fn insert_doc(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        doc: &MsgDoc,
    ) -> sqlx::Result<bool> {
        let msgs = serde_json::to_value(&doc.msgs).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let result = sqlx::query!(
            r#"INSERT INTO msg_docs (doc_id, conversation_id, shard_index, msgs)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (doc_id) DO NOTHING"#,
            doc.doc_id,
            doc.conversation_id.0,
            doc.shard_index,
            msgs,
        )
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// The chunked, shard-aware insert a persistence-topic consumer runs for a
/// batch of already-sequenced messages (§4.6 `BatchInsertChat2DB`).
///
/// Walks the messages grouped by `docID`, attempting a partial update first
/// (Phase A) and falling back to a full-document insert (Phase B) the first
/// time a doc is found absent; a duplicate-key race on insert steps the
/// cursor back one doc and retries Phase A against it.
pub async fn batch_insert_chat_to_db<D: MsgDocStore>(
    pool: &PgPool,
    store: &D,
    conversation_id: ConversationId,
    mut messages: Vec<MsgInfo>,
    shard_size: i64,
) -> CoreResult<()> {
    for msg in &mut messages {
        if msg.status == MsgStatus::Sending {
            msg.status = MsgStatus::Success;
        }
    }
    messages.sort_by_key(|m| m.seq);

    let mut tx = pool.begin().await?;

    let mut groups: Vec<(i64, Vec<(usize, MsgInfo)>)> = Vec::new();
    for msg in messages {
        let shard_index = MsgDoc::shard_index_of(msg.seq, shard_size);
        let slot = MsgDoc::slot_index(msg.seq, shard_size);
        match groups.last_mut() {
            Some((last_shard, msgs)) if *last_shard == shard_index => msgs.push((slot, msg)),
            _ => groups.push((shard_index, vec![(slot, msg)])),
        }
    }

    let mut i = 0;
    while i < groups.len() {
        let (shard_index, patches) = &groups[i];
        let doc_id = format!("{conversation_id}:{shard_index}");
        let updated = store.try_update_doc(&mut tx, &doc_id, patches).await?;
        if updated {
            i += 1;
            continue;
        }

        let mut doc = MsgDoc::empty(conversation_id, *shard_index, shard_size);
        for (slot, msg) in patches {
            doc.msgs[*slot] = msg.clone();
        }
        if store.insert_doc(&mut tx, &doc).await? {
            i += 1;
        } else {
            // Lost a race with a concurrent writer that inserted this doc
            // first; retry this group through Phase A.
            if i == 0 {
                return Err(CoreError::Internal(Box::new(ShardRaceError)));
            }
            i -= 1;
        }
    }

    tx.commit().await?;
    Ok(())
}

/// `DeleteMessagesFromCache`: evicts `seqs` for `conversation_id` via the
/// gateway's slot-aware batch delete.
pub async fn delete_messages_from_cache(
    cache: &Cache,
    conversation_id: ConversationId,
    seqs: &[i64],
) -> CoreResult<u64> {
    let keys = seqs
        .iter()
        .map(|seq| message_cache_key(conversation_id, *seq))
        .collect();
    cache.tag_as_deleted_batch(keys).await.map_err(CoreError::from)
}

fn read_seq_cache_key(conversation_id: ConversationId, user_id: UserId) -> String {
    format!("read_seq:{{{conversation_id}}}:{user_id}")
}

/// `SetHasReadSeqs`: writes each user's latest-read seq into the cache,
/// keyed per (conversation, user).
pub async fn set_has_read_seqs(
    cache: &Cache,
    conversation_id: ConversationId,
    user_seqs: &HashMap<UserId, i64>,
) -> CoreResult<()> {
    for (user_id, seq) in user_seqs {
        let key = read_seq_cache_key(conversation_id, *user_id);
        cache
            .store()
            .set_ex(&key, seq.to_string().into_bytes(), 7 * 24 * 3_600 * 1_000)
            .await
            .map_err(CoreError::from)?;
    }
    Ok(())
}

/// `SetHasReadSeqToDB`: mirrors read-seq state into the backing store.
pub async fn set_has_read_seq_to_db(
    pool: &PgPool,
    conversation_id: ConversationId,
    user_id: UserId,
    seq: i64,
) -> CoreResult<()> {
    sqlx::query!(
        r#"INSERT INTO conversation_read_seqs (conversation_id, user_id, seq)
           VALUES ($1, $2, $3)
           ON CONFLICT (conversation_id, user_id) DO UPDATE
               SET seq = GREATEST(conversation_read_seqs.seq, EXCLUDED.seq)"#,
        conversation_id.0,
        user_id.0,
        seq,
    )
    .execute(pool)
    .await?;
    Ok(())
}
