// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! C8: the group/member state machine (§4.8). Group lifecycle, membership
//! mutation, join-request handling and owner transfer, each paired with the
//! version-log entries and cache invalidations the spec requires to keep
//! clients' member lists in sync.

use imcommon::ids::{GroupId, UserId};
use imcommon::time::TimeStamp;
use imcommon::SORT_MARKER_EID;
use sqlx::PgPool;

use crate::cache::{Cache, Loader};
use crate::cache_chain::CacheChain;
use crate::error::{CoreError, CoreResult};
use crate::model::{Group, GroupMember, GroupStatus, RoleLevel, VersionState};
use crate::version_log::{incr_version, PendingVersions};

const TABLE_GROUP_MEMBER: &str = "group_members";
const TABLE_JOIN_GROUP: &str = "joined_groups";

/// `CreateGroup(group, initialMembers)`.
pub async fn create_group(
    pool: &PgPool,
    cache: &Cache,
    pending: &PendingVersions,
    group: Group,
    mut initial_members: Vec<GroupMember>,
) -> CoreResult<()> {
    if !initial_members.iter().any(|m| m.user_id == group.owner_user_id) {
        initial_members.push(GroupMember {
            group_id: group.group_id,
            user_id: group.owner_user_id,
            role_level: RoleLevel::Owner,
            nickname: String::new(),
            face_url: String::new(),
            join_source: "create".to_string(),
            operator_user_id: group.owner_user_id,
            mute_end_time: None,
            ex: String::new(),
            create_time: TimeStamp::now(),
        });
    }

    let mut tx = pool.begin().await?;

    sqlx::query!(
        r#"INSERT INTO groups (group_id, status, name, face_url, owner_user_id, create_time, ex)
           VALUES ($1, 'ok', $2, $3, $4, $5, $6)"#,
        group.group_id.0,
        group.name,
        group.face_url,
        group.owner_user_id.0,
        group.create_time.as_datetime(),
        group.ex,
    )
    .execute(&mut *tx)
    .await?;

    for member in &initial_members {
        insert_member_row(&mut tx, member).await?;
        let join_version = incr_version(
            &mut tx,
            TABLE_JOIN_GROUP,
            &member.user_id.to_string(),
            &group.group_id.to_string(),
            VersionState::Insert,
        )
        .await?;
        pending.record(TABLE_JOIN_GROUP, member.user_id.to_string(), join_version);
    }

    let member_version = incr_version(
        &mut tx,
        TABLE_GROUP_MEMBER,
        &group.group_id.to_string(),
        SORT_MARKER_EID,
        VersionState::Insert,
    )
    .await?;
    pending.record(TABLE_GROUP_MEMBER, group.group_id.to_string(), member_version);

    tx.commit().await?;

    let mut chain = CacheChain::new()
        .del_group(group.group_id)
        .del_group_member_ids(group.group_id);
    for member in &initial_members {
        chain = chain
            .del_group_member(group.group_id, member.user_id)
            .del_joined_group_ids(member.user_id);
    }
    chain.chain_exec_del(cache).await.map_err(CoreError::from)?;

    Ok(())
}

async fn insert_member_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    member: &GroupMember,
) -> sqlx::Result<()> {
    sqlx::query!(
        r#"INSERT INTO group_members (group_id, user_id, role_level, nickname, face_url, join_source, operator_user_id, mute_end_time, ex, create_time)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        member.group_id.0,
        member.user_id.0,
        member.role_level as i32,
        member.nickname,
        member.face_url,
        member.join_source,
        member.operator_user_id.0,
        member.mute_end_time.map(|t| t.as_datetime()),
        member.ex,
        member.create_time.as_datetime(),
    )
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// `DismissGroup(groupID, deleteMembers)`.
pub async fn dismiss_group(
    pool: &PgPool,
    cache: &Cache,
    pending: &PendingVersions,
    group_id: GroupId,
    delete_members: bool,
) -> CoreResult<()> {
    let mut tx = pool.begin().await?;

    sqlx::query!(
        "UPDATE groups SET status = 'dismissed' WHERE group_id = $1",
        group_id.0,
    )
    .execute(&mut *tx)
    .await?;

    let mut chain = CacheChain::new().del_group(group_id);

    if delete_members {
        let members = sqlx::query_scalar!(
            "SELECT user_id FROM group_members WHERE group_id = $1",
            group_id.0,
        )
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query!("DELETE FROM group_members WHERE group_id = $1", group_id.0)
            .execute(&mut *tx)
            .await?;

        for user_id in members {
            let user_id = UserId(user_id);
            let join_version = incr_version(
                &mut tx,
                TABLE_JOIN_GROUP,
                &user_id.to_string(),
                &group_id.to_string(),
                VersionState::Delete,
            )
            .await?;
            pending.record(TABLE_JOIN_GROUP, user_id.to_string(), join_version);
            chain = chain.del_joined_group_ids(user_id).del_group_member(group_id, user_id);
        }
    } else {
        let member_version = incr_version(
            &mut tx,
            TABLE_GROUP_MEMBER,
            &group_id.to_string(),
            SORT_MARKER_EID,
            VersionState::Update,
        )
        .await?;
        pending.record(TABLE_GROUP_MEMBER, group_id.to_string(), member_version);
    }

    tx.commit().await?;
    chain.chain_exec_del(cache).await.map_err(CoreError::from)?;
    Ok(())
}

/// A pending join request, reapplied freely (§4.8 `CreateGroupRequest`).
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub req_msg: String,
    pub join_source: String,
    pub inviter_user_id: Option<UserId>,
}

/// `CreateGroupRequest(requests)`.
pub async fn create_group_requests(pool: &PgPool, requests: &[JoinRequest]) -> CoreResult<()> {
    let mut tx = pool.begin().await?;
    let now = TimeStamp::now();
    for request in requests {
        sqlx::query!(
            "DELETE FROM group_requests WHERE group_id = $1 AND user_id = $2",
            request.group_id.0,
            request.user_id.0,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query!(
            r#"INSERT INTO group_requests (group_id, user_id, req_msg, handle_result, handle_msg, handle_user_id, req_time, handle_time, ex, join_source, inviter_user_id)
               VALUES ($1, $2, $3, 0, '', NULL, $4, NULL, '', $5, $6)"#,
            request.group_id.0,
            request.user_id.0,
            request.req_msg,
            now.as_datetime(),
            request.join_source,
            request.inviter_user_id.map(|u| u.0),
        )
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Accept,
    Refuse,
}

/// `HandlerGroupRequest(groupID, userID, msg, result, memberIfAccept)`.
pub async fn handle_group_request(
    pool: &PgPool,
    cache: &Cache,
    pending: &PendingVersions,
    group_id: GroupId,
    user_id: UserId,
    handle_msg: String,
    outcome: RequestOutcome,
    member_if_accept: Option<GroupMember>,
) -> CoreResult<()> {
    let mut tx = pool.begin().await?;
    let now = TimeStamp::now();
    let handle_result = if outcome == RequestOutcome::Accept { 1 } else { -1 };

    sqlx::query!(
        "UPDATE group_requests SET handle_result = $3, handle_msg = $4, handle_time = $5
         WHERE group_id = $1 AND user_id = $2",
        group_id.0,
        user_id.0,
        handle_result,
        handle_msg,
        now.as_datetime(),
    )
    .execute(&mut *tx)
    .await?;

    if outcome == RequestOutcome::Accept {
        let member = member_if_accept
            .ok_or_else(|| CoreError::invalid_argument("member data required to accept a join request"))?;
        insert_member_row(&mut tx, &member).await?;

        let join_version = incr_version(
            &mut tx,
            TABLE_JOIN_GROUP,
            &user_id.to_string(),
            &group_id.to_string(),
            VersionState::Insert,
        )
        .await?;
        pending.record(TABLE_JOIN_GROUP, user_id.to_string(), join_version);

        let member_version = incr_version(
            &mut tx,
            TABLE_GROUP_MEMBER,
            &group_id.to_string(),
            SORT_MARKER_EID,
            VersionState::Insert,
        )
        .await?;
        pending.record(TABLE_GROUP_MEMBER, group_id.to_string(), member_version);

        tx.commit().await?;

        CacheChain::new()
            .del_group_member(group_id, user_id)
            .del_group_member_ids(group_id)
            .del_joined_group_ids(user_id)
            .chain_exec_del(cache)
            .await
            .map_err(CoreError::from)?;
    } else {
        tx.commit().await?;
    }

    Ok(())
}

/// `DeleteGroupMember(groupID, userIDs)`.
pub async fn delete_group_members(
    pool: &PgPool,
    cache: &Cache,
    pending: &PendingVersions,
    group_id: GroupId,
    user_ids: &[UserId],
) -> CoreResult<()> {
    if user_ids.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    let raw_ids: Vec<uuid::Uuid> = user_ids.iter().map(|u| u.0).collect();

    sqlx::query!(
        "DELETE FROM group_members WHERE group_id = $1 AND user_id = ANY($2)",
        group_id.0,
        &raw_ids,
    )
    .execute(&mut *tx)
    .await?;

    let member_version = incr_version(
        &mut tx,
        TABLE_GROUP_MEMBER,
        &group_id.to_string(),
        SORT_MARKER_EID,
        VersionState::Delete,
    )
    .await?;
    pending.record(TABLE_GROUP_MEMBER, group_id.to_string(), member_version);

    for user_id in user_ids {
        let join_version = incr_version(
            &mut tx,
            TABLE_JOIN_GROUP,
            &user_id.to_string(),
            &group_id.to_string(),
            VersionState::Delete,
        )
        .await?;
        pending.record(TABLE_JOIN_GROUP, user_id.to_string(), join_version);
    }

    tx.commit().await?;

    let mut chain = CacheChain::new().del_group_member_ids(group_id);
    for user_id in user_ids {
        chain = chain.del_group_member(group_id, *user_id).del_joined_group_ids(*user_id);
    }
    chain.chain_exec_del(cache).await.map_err(CoreError::from)?;

    Ok(())
}

/// `TransferGroupOwner(groupID, oldOwner, newOwner, oldOwnerNewRole)`.
pub async fn transfer_group_owner(
    pool: &PgPool,
    cache: &Cache,
    pending: &PendingVersions,
    group_id: GroupId,
    old_owner: UserId,
    new_owner: UserId,
    old_owner_new_role: RoleLevel,
) -> CoreResult<()> {
    let mut tx = pool.begin().await?;

    for (user_id, role) in [(old_owner, old_owner_new_role), (new_owner, RoleLevel::Owner)] {
        let updated = sqlx::query!(
            "UPDATE group_members SET role_level = $3 WHERE group_id = $1 AND user_id = $2",
            group_id.0,
            user_id.0,
            role as i32,
        )
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(CoreError::not_found("owner-transfer participant is not a current member"));
        }
    }

    let member_version = incr_version(
        &mut tx,
        TABLE_GROUP_MEMBER,
        &group_id.to_string(),
        &format!("{SORT_MARKER_EID},{old_owner},{new_owner}"),
        VersionState::Update,
    )
    .await?;
    pending.record(TABLE_GROUP_MEMBER, group_id.to_string(), member_version);

    tx.commit().await?;

    CacheChain::new()
        .del_group_member(group_id, old_owner)
        .del_group_member(group_id, new_owner)
        .del_group_member_ids(group_id)
        .chain_exec_del(cache)
        .await
        .map_err(CoreError::from)?;

    Ok(())
}

/// Fields editable via `UpdateGroupMember`.
#[derive(Debug, Default, Clone)]
pub struct GroupMemberUpdate {
    pub nickname: Option<String>,
    pub face_url: Option<String>,
    pub role_level: Option<RoleLevel>,
    pub mute_end_time: Option<Option<TimeStamp>>,
    pub ex: Option<String>,
}

/// `UpdateGroupMember(groupID, userID, data)`.
pub async fn update_group_member(
    pool: &PgPool,
    cache: &Cache,
    pending: &PendingVersions,
    group_id: GroupId,
    user_id: UserId,
    update: GroupMemberUpdate,
) -> CoreResult<()> {
    let role_changed = update.role_level.is_some();
    let mut tx = pool.begin().await?;

    if let Some(nickname) = &update.nickname {
        sqlx::query!(
            "UPDATE group_members SET nickname = $3 WHERE group_id = $1 AND user_id = $2",
            group_id.0,
            user_id.0,
            nickname,
        )
        .execute(&mut *tx)
        .await?;
    }
    if let Some(face_url) = &update.face_url {
        sqlx::query!(
            "UPDATE group_members SET face_url = $3 WHERE group_id = $1 AND user_id = $2",
            group_id.0,
            user_id.0,
            face_url,
        )
        .execute(&mut *tx)
        .await?;
    }
    if let Some(role_level) = update.role_level {
        sqlx::query!(
            "UPDATE group_members SET role_level = $3 WHERE group_id = $1 AND user_id = $2",
            group_id.0,
            user_id.0,
            role_level as i32,
        )
        .execute(&mut *tx)
        .await?;
    }
    if let Some(mute_end_time) = update.mute_end_time {
        sqlx::query!(
            "UPDATE group_members SET mute_end_time = $3 WHERE group_id = $1 AND user_id = $2",
            group_id.0,
            user_id.0,
            mute_end_time.map(|t| t.as_datetime()),
        )
        .execute(&mut *tx)
        .await?;
    }
    if let Some(ex) = &update.ex {
        sqlx::query!(
            "UPDATE group_members SET ex = $3 WHERE group_id = $1 AND user_id = $2",
            group_id.0,
            user_id.0,
            ex,
        )
        .execute(&mut *tx)
        .await?;
    }

    let eid = if role_changed {
        format!("{SORT_MARKER_EID},{user_id}")
    } else {
        user_id.to_string()
    };
    let member_version = incr_version(&mut tx, TABLE_GROUP_MEMBER, &group_id.to_string(), &eid, VersionState::Update).await?;
    pending.record(TABLE_GROUP_MEMBER, group_id.to_string(), member_version);

    tx.commit().await?;

    let mut chain = CacheChain::new().del_group_member(group_id, user_id);
    if role_changed {
        chain = chain.del_group_member_ids(group_id);
    }
    chain.chain_exec_del(cache).await.map_err(CoreError::from)?;

    Ok(())
}

async fn fetch_member(pool: &PgPool, group_id: GroupId, user_id: UserId) -> CoreResult<Option<GroupMember>> {
    let row = sqlx::query!(
        r#"SELECT group_id, user_id, role_level, nickname, face_url, join_source, operator_user_id,
                  mute_end_time as "mute_end_time: TimeStamp", ex, create_time as "create_time: TimeStamp"
           FROM group_members WHERE group_id = $1 AND user_id = $2"#,
        group_id.0,
        user_id.0,
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| GroupMember {
        group_id: GroupId(r.group_id),
        user_id: UserId(r.user_id),
        role_level: role_level_from_i32(r.role_level),
        nickname: r.nickname,
        face_url: r.face_url,
        join_source: r.join_source,
        operator_user_id: UserId(r.operator_user_id),
        mute_end_time: r.mute_end_time,
        ex: r.ex,
        create_time: r.create_time,
    }))
}

fn role_level_from_i32(v: i32) -> RoleLevel {
    match v {
        100 => RoleLevel::Owner,
        60 => RoleLevel::Admin,
        _ => RoleLevel::Ordinary,
    }
}

struct GroupMemberLoader<'a> {
    pool: &'a PgPool,
}

#[async_trait::async_trait]
impl<'a> Loader<(GroupId, UserId), GroupMember> for GroupMemberLoader<'a> {
    async fn load(&self, key: &(GroupId, UserId)) -> Result<Option<GroupMember>, CoreError> {
        fetch_member(self.pool, key.0, key.1).await
    }
}

fn member_cache_key(group_id: GroupId, user_id: UserId) -> String {
    format!("group_member:{{{group_id}}}:{user_id}")
}

/// `GetGroupMembersInfo`: batched lookup via the generic read-through cache.
pub async fn get_group_members_info(
    pool: &PgPool,
    cache: &Cache,
    group_id: GroupId,
    user_ids: &[UserId],
) -> CoreResult<Vec<Option<GroupMember>>> {
    let loader = GroupMemberLoader { pool };
    let entries: Vec<(String, (GroupId, UserId))> = user_ids
        .iter()
        .map(|u| (member_cache_key(group_id, *u), (group_id, *u)))
        .collect();
    cache.fetch_batch(&entries, &loader).await
}

/// `GetAllGroupMembersInfo` = `GetGroupMemberIDs` then `GetGroupMembersInfo`.
pub async fn get_all_group_members_info(
    pool: &PgPool,
    cache: &Cache,
    group_id: GroupId,
) -> CoreResult<Vec<Option<GroupMember>>> {
    let user_ids = sqlx::query_scalar!(
        "SELECT user_id FROM group_members WHERE group_id = $1",
        group_id.0,
    )
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(UserId)
    .collect::<Vec<_>>();
    get_group_members_info(pool, cache, group_id, &user_ids).await
}

/// `GetGroupOwner`: the role=owner member list, which must contain exactly
/// one row.
pub async fn get_group_owner(pool: &PgPool, group_id: GroupId) -> CoreResult<GroupMember> {
    let owners = sqlx::query_scalar!(
        "SELECT user_id FROM group_members WHERE group_id = $1 AND role_level = $2",
        group_id.0,
        RoleLevel::Owner as i32,
    )
    .fetch_all(pool)
    .await?;

    match owners.len() {
        1 => fetch_member(pool, group_id, UserId(owners[0]))
            .await?
            .ok_or_else(|| CoreError::not_found("owner row vanished between queries")),
        0 => Err(CoreError::not_found("group has no owner")),
        n => Err(CoreError::invalid_argument(format!("group has {n} owners, expected exactly one"))),
    }
}

/// Computes the member-hash clients poll to decide whether to re-pull the
/// member list: a digest of the sorted member id list (§4.8).
pub fn member_hash(mut user_ids: Vec<UserId>) -> String {
    use sha2::{Digest, Sha256};
    user_ids.sort();
    let mut hasher = Sha256::new();
    for id in &user_ids {
        hasher.update(id.0.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Surfaces `GroupStatus` for read paths that check an explicit dismissed
/// state before acting on a group.
pub async fn group_status(pool: &PgPool, group_id: GroupId) -> CoreResult<GroupStatus> {
    let status = sqlx::query_scalar!("SELECT status FROM groups WHERE group_id = $1", group_id.0)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| CoreError::not_found("group does not exist"))?;
    Ok(match status.as_str() {
        "muted" => GroupStatus::Muted,
        "dismissed" => GroupStatus::Dismissed,
        _ => GroupStatus::Ok,
    })
}
