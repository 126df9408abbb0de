// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! C7: the friend-request state machine (§4.7). Owns the pending/accepted/
//! refused lifecycle of a friend application, bidirectional friendship
//! creation, directional deletion, and the remark/pin update path, wired
//! into the version log (C3) and cache chain (C4).

use imcommon::ids::UserId;
use imcommon::time::TimeStamp;
use sqlx::PgPool;

use crate::cache::Cache;
use crate::cache_chain::CacheChain;
use crate::error::{CoreError, CoreResult};
use crate::model::{AddSource, Friend, HandleResult};
use crate::notification::{emit, Event};
use crate::ports::{MessageProducer, ProfilePort};
use crate::version_log::{incr_version, PendingVersions};
use imcommon::SORT_MARKER_EID;

const TABLE_FRIEND: &str = "friends";

/// `ApplyToAddFriend(from, to, msg, ex)`.
pub async fn apply_to_add_friend(
    pool: &PgPool,
    profiles: &dyn ProfilePort,
    producer: &dyn MessageProducer,
    from: UserId,
    to: UserId,
    req_msg: String,
    ex: String,
) -> CoreResult<()> {
    if from == to {
        return Err(CoreError::invalid_argument("cannot friend yourself"));
    }
    if !profiles.exists(from).await || !profiles.exists(to).await {
        return Err(CoreError::not_found("user does not exist"));
    }
    if are_mutual_friends(pool, from, to).await? {
        return Err(CoreError::already_exists("already friends"));
    }

    let now = TimeStamp::now();
    sqlx::query!(
        r#"INSERT INTO friend_requests (from_user_id, to_user_id, req_msg, handle_result, handle_msg, handler_user_id, create_time, handle_time, ex)
           VALUES ($1, $2, $3, 0, '', NULL, $4, NULL, $5)
           ON CONFLICT (from_user_id, to_user_id) DO UPDATE
               SET req_msg = EXCLUDED.req_msg,
                   ex = EXCLUDED.ex,
                   handle_result = 0,
                   handle_msg = '',
                   handler_user_id = NULL,
                   handle_time = NULL,
                   create_time = EXCLUDED.create_time"#,
        from.0,
        to.0,
        req_msg,
        now.as_datetime(),
        ex,
    )
    .execute(pool)
    .await?;

    emit(producer, &to.to_string(), &Event::FriendApplicationAdd { from, to, version: 0 }).await?;
    Ok(())
}

async fn are_mutual_friends(pool: &PgPool, a: UserId, b: UserId) -> CoreResult<bool> {
    let row = sqlx::query!(
        r#"SELECT EXISTS(SELECT 1 FROM friends WHERE owner_user_id = $1 AND friend_user_id = $2) AS "a_to_b!"#,
        a.0,
        b.0,
    )
    .fetch_one(pool)
    .await?;
    Ok(row.a_to_b)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespondOutcome {
    Accept,
    Refuse,
}

/// `RespondFriendApply(from, to, op, msg, result)`. `op` must equal `to`
/// (enforced by the caller's permission layer; admin override is a
/// capability the caller attaches, not modeled here).
pub async fn respond_friend_apply(
    pool: &PgPool,
    cache: &Cache,
    producer: &dyn MessageProducer,
    pending: &PendingVersions,
    from: UserId,
    to: UserId,
    outcome: RespondOutcome,
    handle_msg: String,
) -> CoreResult<()> {
    let handle_result = sqlx::query_scalar!(
        "SELECT handle_result FROM friend_requests WHERE from_user_id = $1 AND to_user_id = $2",
        from.0,
        to.0,
    )
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| CoreError::not_found("no such friend request"))?;

    if handle_result != HandleResult::Pending as i32 {
        return Err(CoreError::invalid_argument("friend request is not pending"));
    }

    let now = TimeStamp::now();

    match outcome {
        RespondOutcome::Refuse => {
            sqlx::query!(
                "UPDATE friend_requests SET handle_result = -1, handle_msg = $3, handler_user_id = $4, handle_time = $5
                 WHERE from_user_id = $1 AND to_user_id = $2",
                from.0,
                to.0,
                handle_msg,
                to.0,
                now.as_datetime(),
            )
            .execute(pool)
            .await?;
            emit(producer, &from.to_string(), &Event::FriendApplicationRefused { from, to, version: 0 }).await?;
        }
        RespondOutcome::Accept => {
            let mut tx = pool.begin().await?;

            sqlx::query!(
                "UPDATE friend_requests SET handle_result = 1, handler_user_id = $3, handle_time = $4
                 WHERE from_user_id = $1 AND to_user_id = $2",
                from.0,
                to.0,
                to.0,
                now.as_datetime(),
            )
            .execute(&mut *tx)
            .await?;

            sqlx::query!(
                "UPDATE friend_requests SET handle_result = 1, handler_user_id = $3, handle_time = $4
                 WHERE from_user_id = $2 AND to_user_id = $1 AND handle_result = 0",
                from.0,
                to.0,
                to.0,
                now.as_datetime(),
            )
            .execute(&mut *tx)
            .await?;

            let mut changed_owners = Vec::new();
            for (owner, friend) in [(from, to), (to, from)] {
                let exists = sqlx::query!(
                    "SELECT 1 AS one FROM friends WHERE owner_user_id = $1 AND friend_user_id = $2",
                    owner.0,
                    friend.0,
                )
                .fetch_optional(&mut *tx)
                .await?
                .is_some();

                if !exists {
                    sqlx::query!(
                        r#"INSERT INTO friends (owner_user_id, friend_user_id, remark, is_pinned, add_source, operator_user_id, create_time, ex)
                           VALUES ($1, $2, '', false, 'become_friend_by_apply', $3, $4, '')"#,
                        owner.0,
                        friend.0,
                        from.0,
                        now.as_datetime(),
                    )
                    .execute(&mut *tx)
                    .await?;
                    changed_owners.push(owner);
                }
            }

            for owner in &changed_owners {
                let version = incr_version(&mut tx, TABLE_FRIEND, &owner.to_string(), &friend_for(*owner, from, to).to_string(), crate::model::VersionState::Insert).await?;
                pending.record(TABLE_FRIEND, owner.to_string(), version);
            }

            tx.commit().await?;

            for owner in &changed_owners {
                let chain = CacheChain::new()
                    .del_friend_ids(*owner)
                    .del_friend(*owner, friend_for(*owner, from, to));
                if let Err(error) = chain.chain_exec_del(cache).await {
                    tracing::warn!(%error, owner = %owner, "friend cache invalidation failed after accept");
                }
            }

            emit(producer, &from.to_string(), &Event::FriendApplicationApproved { from, to, version: 0 }).await?;
        }
    }

    Ok(())
}

fn friend_for(owner: UserId, from: UserId, to: UserId) -> UserId {
    if owner == from {
        to
    } else {
        from
    }
}

/// `ImportFriends(owner, peers, source)`: admin-only bulk friend creation
/// that bypasses the request FSM entirely.
pub async fn import_friends(
    pool: &PgPool,
    cache: &Cache,
    producer: &dyn MessageProducer,
    pending: &PendingVersions,
    owner: UserId,
    peers: &[UserId],
) -> CoreResult<()> {
    let now = TimeStamp::now();
    let mut tx = pool.begin().await?;

    for peer in peers {
        for (a, b) in [(owner, *peer), (*peer, owner)] {
            sqlx::query!(
                r#"INSERT INTO friends (owner_user_id, friend_user_id, remark, is_pinned, add_source, operator_user_id, create_time, ex)
                   VALUES ($1, $2, '', false, 'import', $3, $4, '')
                   ON CONFLICT (owner_user_id, friend_user_id) DO NOTHING"#,
                a.0,
                b.0,
                owner.0,
                now.as_datetime(),
            )
            .execute(&mut *tx)
            .await?;
        }
        let version = incr_version(&mut tx, TABLE_FRIEND, &owner.to_string(), &peer.to_string(), crate::model::VersionState::Insert).await?;
        pending.record(TABLE_FRIEND, owner.to_string(), version);
        let peer_version = incr_version(&mut tx, TABLE_FRIEND, &peer.to_string(), &owner.to_string(), crate::model::VersionState::Insert).await?;
        pending.record(TABLE_FRIEND, peer.to_string(), peer_version);
    }

    tx.commit().await?;

    let mut chain = CacheChain::new().del_friend_ids(owner);
    for peer in peers {
        chain = chain.del_friend_ids(*peer).del_friend(owner, *peer);
    }
    chain.chain_exec_del(cache).await.map_err(CoreError::from)?;

    for peer in peers {
        emit(producer, &owner.to_string(), &Event::FriendApplicationApproved { from: owner, to: *peer, version: 0 }).await?;
    }
    Ok(())
}

/// `DeleteFriend(owner, peer)`: directional deletion.
pub async fn delete_friend(
    pool: &PgPool,
    cache: &Cache,
    producer: &dyn MessageProducer,
    pending: &PendingVersions,
    owner: UserId,
    peer: UserId,
) -> CoreResult<()> {
    let mut tx = pool.begin().await?;
    sqlx::query!(
        "DELETE FROM friends WHERE owner_user_id = $1 AND friend_user_id = $2",
        owner.0,
        peer.0,
    )
    .execute(&mut *tx)
    .await?;
    let version = incr_version(&mut tx, TABLE_FRIEND, &owner.to_string(), &peer.to_string(), crate::model::VersionState::Delete).await?;
    pending.record(TABLE_FRIEND, owner.to_string(), version);
    tx.commit().await?;

    CacheChain::new()
        .del_friend_ids(owner)
        .del_friend_ids(peer)
        .chain_exec_del(cache)
        .await
        .map_err(CoreError::from)?;

    emit(producer, &owner.to_string(), &Event::FriendDeleted { owner, peer, version: 0 }).await
}

/// Fields editable via `SetFriendRemark` / `UpdateFriends`.
#[derive(Debug, Default, Clone)]
pub struct FriendUpdate {
    pub remark: Option<String>,
    pub is_pinned: Option<bool>,
    pub ex: Option<String>,
}

/// `SetFriendRemark` / `UpdateFriends(val)`.
pub async fn update_friend(
    pool: &PgPool,
    cache: &Cache,
    pending: &PendingVersions,
    owner: UserId,
    peer: UserId,
    update: FriendUpdate,
) -> CoreResult<()> {
    let mut tx = pool.begin().await?;
    if let Some(remark) = &update.remark {
        sqlx::query!(
            "UPDATE friends SET remark = $3 WHERE owner_user_id = $1 AND friend_user_id = $2",
            owner.0,
            peer.0,
            remark,
        )
        .execute(&mut *tx)
        .await?;
    }
    if let Some(is_pinned) = update.is_pinned {
        sqlx::query!(
            "UPDATE friends SET is_pinned = $3 WHERE owner_user_id = $1 AND friend_user_id = $2",
            owner.0,
            peer.0,
            is_pinned,
        )
        .execute(&mut *tx)
        .await?;
    }
    if let Some(ex) = &update.ex {
        sqlx::query!(
            "UPDATE friends SET ex = $3 WHERE owner_user_id = $1 AND friend_user_id = $2",
            owner.0,
            peer.0,
            ex,
        )
        .execute(&mut *tx)
        .await?;
    }

    let eid = if update.is_pinned.is_some() {
        format!("{SORT_MARKER_EID},{peer}")
    } else {
        peer.to_string()
    };
    let version = incr_version(&mut tx, TABLE_FRIEND, &owner.to_string(), &eid, crate::model::VersionState::Update).await?;
    pending.record(TABLE_FRIEND, owner.to_string(), version);
    tx.commit().await?;

    CacheChain::new()
        .del_friend(owner, peer)
        .chain_exec_del(cache)
        .await
        .map_err(CoreError::from)?;
    Ok(())
}

/// `CheckIn(user1, user2)`: mutual-friendship probe used by send-path
/// permission checks.
pub async fn check_in(pool: &PgPool, user1: UserId, user2: UserId) -> CoreResult<(bool, bool)> {
    let one_has_two = sqlx::query!(
        "SELECT 1 AS one FROM friends WHERE owner_user_id = $1 AND friend_user_id = $2",
        user1.0,
        user2.0,
    )
    .fetch_optional(pool)
    .await?
    .is_some();
    let two_has_one = sqlx::query!(
        "SELECT 1 AS one FROM friends WHERE owner_user_id = $1 AND friend_user_id = $2",
        user2.0,
        user1.0,
    )
    .fetch_optional(pool)
    .await?
    .is_some();
    Ok((one_has_two, two_has_one))
}

/// Paged friend list, ordered `(isPinned desc, created asc)` per §4.7.
pub async fn list_friends(pool: &PgPool, owner: UserId, offset: i64, limit: i64) -> CoreResult<Vec<Friend>> {
    let rows = sqlx::query!(
        r#"SELECT owner_user_id, friend_user_id, remark, is_pinned, add_source as "add_source: String",
                  operator_user_id, create_time as "create_time: TimeStamp", ex
           FROM friends WHERE owner_user_id = $1
           ORDER BY is_pinned DESC, create_time ASC
           OFFSET $2 LIMIT $3"#,
        owner.0,
        offset,
        limit,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| Friend {
            owner_user_id: UserId(r.owner_user_id),
            friend_user_id: UserId(r.friend_user_id),
            remark: r.remark,
            is_pinned: r.is_pinned,
            add_source: match r.add_source.as_str() {
                "import" => AddSource::Import,
                _ => AddSource::BecomeFriendByApply,
            },
            operator_user_id: UserId(r.operator_user_id),
            create_time: r.create_time,
            ex: r.ex,
        })
        .collect())
}
