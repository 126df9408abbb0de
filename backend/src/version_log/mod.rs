// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! C3: the version-log sync engine. Every domain (a user's friend list, a
//! group's member list, ...) keeps an append-only [`VersionLog`] so a client
//! that already has version `V` can ask for just the entries newer than `V`
//! instead of re-fetching the whole list (§4.3).

use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::model::{VersionLog, VersionLogElem, VersionState};
use imcommon::codec;
use imcommon::time::TimeStamp;
use imcommon::SORT_MARKER_EID;

/// A window of change-log entries relative to a client's last-known version,
/// or a signal that the client must do a full resync.
#[derive(Debug, Clone)]
pub enum ChangeWindow {
    /// `logs` covers every change after the client's version, up to the
    /// current `version`.
    Incremental {
        version: u64,
        deleted: u64,
        logs: Vec<VersionLogElem>,
    },
    /// The client's version predates `deleted`'s retention window (or the
    /// log doesn't exist yet): it must fetch the full entity list out of
    /// band and resync from the returned `version`.
    FullSync { version: u64 },
}

struct Row {
    did: String,
    version: i64,
    deleted: i64,
    last_update: TimeStamp,
    logs: Vec<u8>,
}

async fn load_log(pool: &PgPool, table: &str, did: &str) -> CoreResult<Option<VersionLog>> {
    let row = sqlx::query_as!(
        Row,
        r#"SELECT did, version, deleted, last_update as "last_update: TimeStamp", logs
           FROM version_logs WHERE table_name = $1 AND did = $2"#,
        table,
        did,
    )
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else { return Ok(None) };
    let logs: Vec<VersionLogElem> = codec::from_slice(&row.logs)?;
    Ok(Some(VersionLog {
        did: row.did,
        version: row.version as u64,
        deleted: row.deleted as u64,
        last_update: row.last_update,
        logs,
    }))
}

/// Appends one change to `did`'s log within `table`, bumping `version` and
/// inserting/replacing the entry for `eid` (§4.3). Runs inside the caller's
/// transaction so it commits atomically with the row mutation it describes.
pub async fn incr_version(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    table: &str,
    did: &str,
    eid: &str,
    state: VersionState,
) -> CoreResult<u64> {
    let existing = sqlx::query_as!(
        Row,
        r#"SELECT did, version, deleted, last_update as "last_update: TimeStamp", logs
           FROM version_logs WHERE table_name = $1 AND did = $2 FOR UPDATE"#,
        table,
        did,
    )
    .fetch_optional(&mut **tx)
    .await?;

    let mut log = match existing {
        Some(row) => VersionLog {
            did: row.did,
            version: row.version as u64,
            deleted: row.deleted as u64,
            last_update: row.last_update,
            logs: codec::from_slice(&row.logs)?,
        },
        None => VersionLog::new(did),
    };

    log.version += 1;
    log.last_update = TimeStamp::now();
    if state == VersionState::Delete {
        log.deleted += 1;
    }
    log.logs.retain(|e| e.eid != eid);
    log.logs.push(VersionLogElem {
        eid: eid.to_string(),
        state,
        version: log.version,
        last_update: log.last_update,
    });

    let logs_blob = codec::to_vec(&log.logs)?;
    sqlx::query!(
        r#"INSERT INTO version_logs (table_name, did, version, deleted, last_update, logs)
           VALUES ($1, $2, $3, $4, $5, $6)
           ON CONFLICT (table_name, did) DO UPDATE
               SET version = EXCLUDED.version,
                   deleted = EXCLUDED.deleted,
                   last_update = EXCLUDED.last_update,
                   logs = EXCLUDED.logs"#,
        table,
        did,
        log.version as i64,
        log.deleted as i64,
        log.last_update.as_datetime(),
        logs_blob,
    )
    .execute(&mut **tx)
    .await?;

    Ok(log.version)
}

/// Computes the change window a client at `client_version` needs for `did`'s
/// log in `table` (§4.3). A `did` with no log yet is treated as version 0,
/// i.e. nothing to report.
pub async fn find_change_window(
    pool: &PgPool,
    table: &str,
    did: &str,
    client_version: u64,
) -> CoreResult<ChangeWindow> {
    let Some(log) = load_log(pool, table, did).await? else {
        return Ok(ChangeWindow::Incremental {
            version: 0,
            deleted: 0,
            logs: Vec::new(),
        });
    };

    if client_version > log.version {
        return Err(CoreError::invalid_argument(
            "client version is ahead of the server's log",
        ));
    }

    // The sort marker, if present, records the version at which the oldest
    // retained log entry still reflects the complete truth; a client behind
    // that marker cannot be served incrementally.
    let full_sync_floor = log
        .logs
        .iter()
        .find(|e| e.eid == SORT_MARKER_EID)
        .map(|e| e.version);
    if let Some(floor) = full_sync_floor {
        if client_version < floor {
            return Ok(ChangeWindow::FullSync { version: log.version });
        }
    }

    let logs = log
        .logs
        .into_iter()
        .filter(|e| e.version > client_version && e.eid != SORT_MARKER_EID)
        .collect();

    Ok(ChangeWindow::Incremental {
        version: log.version,
        deleted: log.deleted,
        logs,
    })
}

/// Batched form of [`find_change_window`] for a set of `did`s sharing one
/// client version request (e.g. a group member sync for every group the
/// caller belongs to).
pub async fn batch_find_change_window(
    pool: &PgPool,
    table: &str,
    requests: &[(String, u64)],
) -> CoreResult<HashMap<String, ChangeWindow>> {
    let mut out = HashMap::with_capacity(requests.len());
    for (did, client_version) in requests {
        out.insert(did.clone(), find_change_window(pool, table, did, *client_version).await?);
    }
    Ok(out)
}

/// Drops `did`'s log in `table` entirely when the log has accumulated no new
/// entries since `since`, reclaiming storage for entities that stopped
/// changing (§4.3 retention).
pub async fn delete_after_unchanged_log(
    pool: &PgPool,
    table: &str,
    did: &str,
    since: TimeStamp,
) -> CoreResult<bool> {
    let result = sqlx::query!(
        "DELETE FROM version_logs WHERE table_name = $1 AND did = $2 AND last_update < $3",
        table,
        did,
        since.as_datetime(),
    )
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Request-scoped bag of versions produced by operations run within a single
/// request, so a final response (or outgoing notification, C9) can report
/// the versions it caused without a second round trip to reload them.
#[derive(Debug, Default)]
pub struct PendingVersions {
    inner: Mutex<HashMap<(String, String), u64>>,
}

impl PendingVersions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, table: impl Into<String>, did: impl Into<String>, version: u64) {
        self.inner
            .lock()
            .expect("poisoned")
            .insert((table.into(), did.into()), version);
    }

    pub fn get(&self, table: &str, did: &str) -> Option<u64> {
        self.inner
            .lock()
            .expect("poisoned")
            .get(&(table.to_string(), did.to_string()))
            .copied()
    }

    pub fn drain(&self) -> Vec<(String, String, u64)> {
        self.inner
            .lock()
            .expect("poisoned")
            .drain()
            .map(|((table, did), version)| (table, did, version))
            .collect()
    }
}
